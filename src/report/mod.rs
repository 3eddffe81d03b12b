//! Plain-text summaries of fit results.
//!
//! Formatting lives here so the fitting code stays free of presentation
//! concerns. Every function returns a `String`; printing is up to the caller.

use crate::domain::{GoodnessOfFit, Warning};
use crate::fit::{MultiModelFit, ParametricFit, RegularizedFit};
use crate::uncertainty::{distance_std, mean_distance};

/// Summary of a regularized fit: α choice, statistics, distribution moments
/// and warnings.
pub fn format_fit_summary(fit: &RegularizedFit, r: &[f64]) -> String {
    let mut out = String::new();

    out.push_str("=== Regularized distance-distribution fit ===\n");
    match &fit.selection {
        Some(sel) => out.push_str(&format!(
            "Alpha: {:.4e} ({}, {} candidates)\n",
            fit.alpha,
            sel.method.display_name(),
            sel.alphas.len()
        )),
        None => out.push_str(&format!("Alpha: {:.4e} (fixed)\n", fit.alpha)),
    }
    out.push_str(&format!(
        "Distance: <r>={:.3}nm sd={:.3}nm | range=[{:.2}, {:.2}]nm\n",
        mean_distance(r, &fit.p),
        distance_std(r, &fit.p),
        r.first().copied().unwrap_or(f64::NAN),
        r.last().copied().unwrap_or(f64::NAN),
    ));
    out.push_str(&format!("Scale: {:.6} | noise sd={:.3e}\n", fit.scale, fit.noise_std));
    out.push_str(&format_stats(&fit.stats));
    out.push_str(&format!(
        "Solver: {} iteration(s), converged={}\n",
        fit.convergence.iterations, fit.convergence.converged
    ));
    out.push_str(&format_warnings(&fit.warnings));
    out
}

/// Summary of a parametric fit with parameter standard errors.
pub fn format_parametric_summary(fit: &ParametricFit, names: &[String]) -> String {
    let mut out = String::new();

    out.push_str("=== Parametric distance-distribution fit ===\n");
    out.push_str(&format!(
        "Residual norm: {:.4e} | iterations={} converged={}\n",
        fit.residual_norm, fit.convergence.iterations, fit.convergence.converged
    ));
    out.push_str("\nParameters:\n");
    for (i, (value, sd)) in fit.params.iter().zip(fit.param_std()).enumerate() {
        let fallback = format!("p{i}");
        let name = names.get(i).unwrap_or(&fallback);
        out.push_str(&format!("- {name:<12} {value:>12.6} +/- {sd:.3e}\n"));
    }
    out.push_str(&format_warnings(&fit.warnings));
    out
}

/// Candidate table of a multi-model fit, selected mixture marked with `*`,
/// followed by the statistics of every dataset.
pub fn format_multimodel_summary(fit: &MultiModelFit) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== Multi-model fit ({:?}) ===\n", fit.criterion));
    for (i, c) in fit.candidates.iter().enumerate() {
        let chosen = if i == fit.best { "*" } else { " " };
        out.push_str(&format!(
            "{chosen} n={:<3} score={:.3} residual={:.4e}\n",
            c.components, c.score, c.residual_norm
        ));
    }
    out.push_str(&format!("\nSelected params: {}\n", fmt_vec(&fit.selected().params)));
    if !fit.kernel_params().is_empty() {
        out.push_str(&format!("Kernel params: {}\n", fmt_vec(fit.kernel_params())));
    }
    out.push_str(&format!("Scale: {:.6}\n", fit.scale));
    for (i, stats) in fit.stats.iter().enumerate() {
        out.push_str(&format!("[dataset {i}] {}", format_stats(stats)));
    }
    out
}

fn format_stats(stats: &GoodnessOfFit) -> String {
    format!(
        "Fit: chi2red={:.3} R2={:.5} RMSD={:.3e} | AIC={:.2} AICc={:.2} BIC={:.2} dof={:.1}\n",
        stats.chi2red, stats.r2, stats.rmsd, stats.aic, stats.aicc, stats.bic, stats.dof
    )
}

fn format_warnings(warnings: &[Warning]) -> String {
    let mut out = String::new();
    if warnings.is_empty() {
        return out;
    }
    out.push_str("\nWarnings:\n");
    for w in warnings {
        let line = match w {
            Warning::NoBracketedMinimum { method, fallback } => format!(
                "{} has no interior minimum; using alpha={fallback:.4e}",
                method.display_name()
            ),
            Warning::NotConverged { stage, iterations } => {
                format!("{stage} stopped after {iterations} iterations")
            }
            Warning::ParametersClipped { indices } => {
                format!("start parameters {indices:?} clipped into bounds")
            }
        };
        out.push_str(&format!("- {line}\n"));
    }
    out
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
    format!("[{}]", parts.join(", "))
}
