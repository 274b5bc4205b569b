//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use std::collections::BTreeMap;

use crate::app::pipeline::RunOutput;
use crate::domain::{Estimate, Param, ResolutionCurve};
use crate::fit::CurveReport;
use crate::io::LineResult;
use crate::report::LineQuality;

/// Format the full run summary (ingest counts, per-line table, curve).
pub fn format_run_summary(run: &RunOutput) -> String {
    let mut out = String::new();

    out.push_str("=== ecal - HPGe energy calibration fit ===\n");
    let converged = run.lines.values().filter(|r| r.fit.converged()).count();
    out.push_str(&format!(
        "Lines: read={} | fitted={} | converged={} | rejected={}\n",
        run.lines_read,
        run.lines.len(),
        converged,
        run.line_errors.len()
    ));
    for e in &run.line_errors {
        out.push_str(&format!("  (rejected #{} {}) {}\n", e.index, e.line, e.message));
    }

    out.push('\n');
    out.push_str(&format_peak_table(&run.lines));

    match &run.curve {
        Some((curve, report)) => {
            out.push('\n');
            out.push_str(&format_curve(curve, report));
        }
        None => out.push_str("\nResolution curve: not fitted\n"),
    }
    for (line, reason) in &run.curve_skipped {
        out.push_str(&format!("  (not in curve {line}) {reason}\n"));
    }

    out
}

/// One row per line: position, width and fit quality.
pub fn format_peak_table(lines: &BTreeMap<String, LineResult>) -> String {
    let mut out = String::new();
    push_row(
        &mut out,
        format!(
            "{:<14} {:>10} {:<20} {:>22} {:>18} {:>18} {:>8} {:<5}",
            "line", "energy", "status", "mu", "sigma", "fwhm", "p", "retry"
        ),
    );
    push_row(
        &mut out,
        format!(
            "{:-<14} {:-<10} {:-<20} {:-<22} {:-<18} {:-<18} {:-<8} {:-<5}",
            "", "", "", "", "", "", "", ""
        ),
    );

    for (line, r) in lines {
        let fit = &r.fit;
        let retry = match (fit.retried, fit.retry_exhausted) {
            (false, _) => "",
            (true, false) => "yes",
            (true, true) => "exh",
        };
        push_row(
            &mut out,
            format!(
                "{:<14} {:>10} {:<20} {:>22} {:>18} {:>18} {:>8} {:<5}",
                truncate(line, 14),
                format!("{:.3}", r.energy.value),
                format!("{:?}", fit.status),
                fmt_estimate(fit.params.get(&Param::Mu), 3),
                fmt_estimate(fit.params.get(&Param::Sigma), 4),
                fmt_estimate(fit.fwhm.as_ref(), 4),
                fit.gof.as_ref().map(|g| format!("{:.3}", g.p_value)).unwrap_or_else(|| "-".into()),
                retry,
            ),
        );
    }
    out
}

/// Coefficients, reference-energy FWHM and per-line residuals.
pub fn format_curve(curve: &ResolutionCurve, report: &CurveReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Resolution curve: FWHM(E) = sqrt(sum p_i E^i), order {}\n", curve.order()));
    for (i, c) in curve.coefficients.iter().enumerate() {
        out.push_str(&format!("- p{i} = {:.6} {}\n", ErrFmt(c), curve.coefficient_unit(i)));
    }
    out.push_str(&format!(
        "- FWHM({:.3} {unit}) = {:.4} {unit}\n",
        curve.reference_energy,
        curve.fwhm_at_reference,
        unit = curve.unit
    ));
    let per_dof = if curve.dof > 0 {
        format!("{:.3}", curve.chi2 / curve.dof as f64)
    } else {
        "-".to_string()
    };
    out.push_str(&format!("- chi2 = {:.3} (dof {}, chi2/dof {per_dof})\n", curve.chi2, curve.dof));

    push_row(&mut out, format!("{:>12} {:>12} {:>12} {:>10}", "energy", "fwhm", "residual", "pull"));
    for (j, e) in curve.energies.iter().enumerate() {
        push_row(
            &mut out,
            format!(
                "{:>12.3} {:>12.4} {:>12.4} {:>10.2}",
                e,
                curve.fwhms[j].value,
                report.residuals()[j],
                report.normalized_residuals()[j]
            ),
        );
    }
    out
}

/// Worst-fitting lines.
pub fn format_quality_ranking(ranked: &[LineQuality]) -> String {
    let mut out = String::from("Worst fits (lowest p-value):\n");
    for q in ranked {
        let p = q.p_value.map(|p| format!("{p:.4}")).unwrap_or_else(|| "-".into());
        let per_dof = q.chi2_per_dof.map(|c| format!("{c:.3}")).unwrap_or_else(|| "-".into());
        let retried = if q.retried { " (tail dropped)" } else { "" };
        out.push_str(&format!("  {:<14} p={p:<8} chi2/dof={per_dof}{retried}\n", truncate(&q.line, 14)));
    }
    out
}

fn push_row(out: &mut String, row: String) {
    out.push_str(row.trim_end());
    out.push('\n');
}

fn fmt_estimate(e: Option<&Estimate>, precision: usize) -> String {
    match e {
        Some(e) => format!("{:.*}", precision, e),
        None => "-".to_string(),
    }
}

/// Scientific rendering of an estimate.
struct ErrFmt<'a>(&'a Estimate);

impl std::fmt::Display for ErrFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let p = f.precision().unwrap_or(6);
        match self.0.error {
            Some(err) => write!(f, "{:.*e} ± {:.2e}", p, self.0.value, err),
            None => write!(f, "{:.*e} ± undefined", p, self.0.value),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::fixtures::line;
    use crate::report::rank_by_fit_quality;

    #[test]
    fn peak_table_lists_every_line() {
        let mut lines = BTreeMap::new();
        lines.insert("583.191".to_string(), line(583.191, Some(0.42)));
        lines.insert("a_very_long_line_name".to_string(), line(860.564, None));
        let table = format_peak_table(&lines);
        let rows: Vec<&str> = table.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].starts_with("line"));
        assert!(table.contains("583.191"));
        assert!(table.contains("0.420"));
        assert!(table.contains("a_very_long_l."));
        assert!(table.contains("NotConverged"));
        assert!(rows.iter().all(|r| !r.ends_with(' ')));
    }

    #[test]
    fn ranking_marks_missing_values() {
        let mut lines = BTreeMap::new();
        lines.insert("x".to_string(), line(583.0, None));
        let text = format_quality_ranking(&rank_by_fit_quality(&lines, 5));
        assert!(text.contains("p=-"));
    }

    #[test]
    fn coefficients_render_in_scientific_notation() {
        let with_err = format!("{:.3}", ErrFmt(&Estimate::new(2.5e-3, Some(1.0e-4))));
        assert_eq!(with_err, "2.500e-3 ± 1.00e-4");
        let bare = format!("{:.2}", ErrFmt(&Estimate::new(1.0, None)));
        assert_eq!(bare, "1.00e0 ± undefined");
    }

    #[test]
    fn truncate_keeps_short_ids() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 4), "abc.");
    }
}
