//! Wall-clock and resident-memory budgets for a single optimizer run.
//!
//! A [`ResourceBudget`] is plain configuration passed into each fit. The
//! process-wide default is set once (typically by the binary before any fit
//! starts) and read once per fit; running fits never observe a change.
//!
//! [`BudgetGuard`] is polled from the optimizer's per-iteration callback. When
//! either limit trips it reports a [`Termination`], and the optimizer stops
//! the local search with a non-converged result instead of an error.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::domain::Termination;

/// Time and memory limits for one optimizer run. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceBudget {
    pub max_time: Option<Duration>,
    /// Allowed growth of resident memory over the start sample, in bytes.
    pub max_memory_growth_bytes: Option<u64>,
}

impl ResourceBudget {
    pub const UNLIMITED: ResourceBudget = ResourceBudget {
        max_time: None,
        max_memory_growth_bytes: None,
    };

    pub fn with_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }

    pub fn with_memory_growth(mut self, bytes: u64) -> Self {
        self.max_memory_growth_bytes = Some(bytes);
        self
    }
}

static DEFAULT_BUDGET: RwLock<ResourceBudget> = RwLock::new(ResourceBudget::UNLIMITED);

/// Replace the process-wide default budget used when a fit passes none.
pub fn set_default_budget(budget: ResourceBudget) {
    let mut guard = DEFAULT_BUDGET.write().unwrap_or_else(|e| e.into_inner());
    *guard = budget;
}

/// Current process-wide default budget.
pub fn default_budget() -> ResourceBudget {
    *DEFAULT_BUDGET.read().unwrap_or_else(|e| e.into_inner())
}

/// Resident memory of this process in bytes, if the platform reports it.
pub fn resident_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sample_memory(&mut sys, pid)
}

fn sample_memory(sys: &mut System, pid: Pid) -> Option<u64> {
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid).map(|p| p.memory())
}

/// Per-run budget tracker.
pub struct BudgetGuard {
    budget: ResourceBudget,
    started: Instant,
    memory: Option<MemoryProbe>,
}

struct MemoryProbe {
    sys: System,
    pid: Pid,
    start: u64,
}

impl BudgetGuard {
    /// Start tracking now.
    ///
    /// `memory_start` is the caller-specified baseline for memory growth; when
    /// `None`, the current resident size is sampled. Memory is only probed when
    /// a memory limit is set.
    pub fn start(budget: ResourceBudget, memory_start: Option<u64>) -> Self {
        let memory = budget.max_memory_growth_bytes.and_then(|_| {
            let pid = sysinfo::get_current_pid().ok()?;
            let mut sys = System::new();
            let start = match memory_start {
                Some(bytes) => bytes,
                None => sample_memory(&mut sys, pid)?,
            };
            Some(MemoryProbe { sys, pid, start })
        });
        Self {
            budget,
            started: Instant::now(),
            memory,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `Some(reason)` once a limit is exceeded.
    pub fn check(&mut self) -> Option<Termination> {
        if let Some(limit) = self.budget.max_time {
            if self.started.elapsed() > limit {
                return Some(Termination::TimeBudgetExceeded);
            }
        }
        if let (Some(limit), Some(probe)) = (self.budget.max_memory_growth_bytes, self.memory.as_mut()) {
            let now = sample_memory(&mut probe.sys, probe.pid)?;
            if now.saturating_sub(probe.start) > limit {
                return Some(Termination::MemoryBudgetExceeded);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_budget_never_trips() {
        let mut guard = BudgetGuard::start(ResourceBudget::UNLIMITED, None);
        assert_eq!(guard.check(), None);
    }

    #[test]
    fn zero_time_budget_trips() {
        let mut guard = BudgetGuard::start(ResourceBudget::default().with_time(Duration::ZERO), None);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(guard.check(), Some(Termination::TimeBudgetExceeded));
    }

    #[test]
    fn default_budget_is_settable() {
        // Generous enough not to disturb fits running in parallel tests.
        let generous = ResourceBudget::default().with_time(Duration::from_secs(3600));
        set_default_budget(generous);
        assert_eq!(default_budget(), generous);
        set_default_budget(ResourceBudget::UNLIMITED);
    }

    #[test]
    fn memory_growth_is_measured_from_caller_start() {
        let Some(now) = resident_memory() else {
            return;
        };
        // A baseline far below the current size means the growth limit is already exceeded.
        let budget = ResourceBudget::default().with_memory_growth(1);
        let mut guard = BudgetGuard::start(budget, Some(now / 4));
        assert_eq!(guard.check(), Some(Termination::MemoryBudgetExceeded));
    }
}
