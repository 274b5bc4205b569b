//! Peak-shape model implementations.
//!
//! Shapes are implemented as small, pure functions so that fitting code can
//! stay generic over the variant and over the AD scalar type.

pub mod shape;

pub use shape::*;
