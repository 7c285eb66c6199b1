//! Ψ-EMA indicator analyzer
//!
//! A three-dimensional oscillator computed from close prices:
//!
//! - phase θ, the angle `atan2(flow, stock)` in degrees, where flow is the
//!   short/long EMA spread and stock is the deviation from the slow EMA;
//! - anomaly z, a MAD-based robust z-score of the latest close;
//! - convergence R, the ratio of recent to prior swing amplitude.
//!
//! Readings come from a φ-threshold decision tree (φ = 1.618, φ² = 2.618,
//! 1/φ = 0.618) and carry a fidelity grade A–D by history depth.

use serde::{Deserialize, Serialize};

pub const PHI: f64 = 1.618033988749895;
pub const PHI_SQ: f64 = 2.618033988749895;
pub const INV_PHI: f64 = 0.6180339887498949;

/// Bars required for a daily analysis.
pub const MIN_DAILY_BARS: usize = 55;
/// Bars required for a weekly analysis.
pub const MIN_WEEKLY_BARS: usize = 13;

const FAST_SPAN: usize = 8;
const SLOW_SPAN: usize = 21;
const BASE_SPAN: usize = 55;
const AMPLITUDE_WINDOW: usize = 13;

/// Categorical reading from the φ decision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    /// |z| beyond φ² with expanding amplitude.
    Pathogenic,
    /// Amplitude expanding past φ.
    Expansion,
    /// Amplitude compressed below 1/φ.
    Compression,
    /// Positive flow over positive stock.
    Accumulation,
    /// Negative flow over positive stock.
    Distribution,
    /// Positive flow under negative stock.
    Recovery,
    /// Negative flow under negative stock.
    Capitulation,
}

/// History-depth grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Fidelity {
    A,
    B,
    C,
    D,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsiEmaAnalysis {
    pub theta_deg: f64,
    pub z_score: f64,
    pub convergence: f64,
    pub reading: Reading,
    pub fidelity: Fidelity,
    pub pathogen: bool,
    pub bar_count: usize,
    pub last_close: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum IndicatorError {
    #[error("insufficient bars: {given} given, {required} required")]
    InsufficientBars { given: usize, required: usize },

    #[error("non-finite close in series at index {0}")]
    NonFiniteClose(usize),
}

/// Analyze a daily close series (≥55 bars required).
pub fn analyze(closes: &[f64]) -> Result<PsiEmaAnalysis, IndicatorError> {
    analyze_with_minimum(closes, MIN_DAILY_BARS)
}

/// Analyze a weekly close series (≥13 bars required).
pub fn analyze_weekly(closes: &[f64]) -> Result<PsiEmaAnalysis, IndicatorError> {
    analyze_with_minimum(closes, MIN_WEEKLY_BARS)
}

fn analyze_with_minimum(closes: &[f64], minimum: usize) -> Result<PsiEmaAnalysis, IndicatorError> {
    if closes.len() < minimum {
        return Err(IndicatorError::InsufficientBars {
            given: closes.len(),
            required: minimum,
        });
    }
    if let Some(i) = closes.iter().position(|c| !c.is_finite()) {
        return Err(IndicatorError::NonFiniteClose(i));
    }

    let last = closes[closes.len() - 1];
    let base_span = BASE_SPAN.min(closes.len());

    let flow = ema(closes, FAST_SPAN.min(closes.len())) - ema(closes, SLOW_SPAN.min(closes.len()));
    let stock = last - ema(closes, base_span);
    let theta_deg = flow.atan2(stock).to_degrees();

    let z_score = robust_z(closes, SLOW_SPAN.min(closes.len()).max(5));
    let convergence = amplitude_ratio(closes);

    let pathogen = z_score.abs() > PHI_SQ && convergence > PHI;
    let reading = classify(theta_deg, z_score, convergence, flow, stock);

    Ok(PsiEmaAnalysis {
        theta_deg,
        z_score,
        convergence,
        reading,
        fidelity: fidelity(closes.len()),
        pathogen,
        bar_count: closes.len(),
        last_close: last,
    })
}

/// Exponential moving average over the full series with span `n`.
fn ema(closes: &[f64], n: usize) -> f64 {
    let alpha = 2.0 / (n as f64 + 1.0);
    let mut value = closes[0];
    for close in &closes[1..] {
        value = alpha * close + (1.0 - alpha) * value;
    }
    value
}

/// MAD-based robust z-score of the latest close against the trailing window.
fn robust_z(closes: &[f64], window: usize) -> f64 {
    let tail = &closes[closes.len().saturating_sub(window)..];
    let med = median(tail);
    let deviations: Vec<f64> = tail.iter().map(|c| (c - med).abs()).collect();
    let mad = median(&deviations);
    if mad < f64::EPSILON {
        return 0.0;
    }
    // 0.6745 rescales MAD to the normal σ
    0.6745 * (closes[closes.len() - 1] - med) / mad
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Ratio of recent swing amplitude to the equally sized prior window.
fn amplitude_ratio(closes: &[f64]) -> f64 {
    let len = closes.len();
    let recent = &closes[len.saturating_sub(AMPLITUDE_WINDOW)..];
    let prior_end = len.saturating_sub(AMPLITUDE_WINDOW);
    let prior = &closes[prior_end.saturating_sub(AMPLITUDE_WINDOW)..prior_end];
    let range = |xs: &[f64]| {
        let max = xs.iter().cloned().fold(f64::MIN, f64::max);
        let min = xs.iter().cloned().fold(f64::MAX, f64::min);
        max - min
    };
    let prior_range = range(prior);
    if prior.is_empty() || prior_range < f64::EPSILON {
        return 1.0;
    }
    range(recent) / prior_range
}

fn classify(_theta: f64, z: f64, r: f64, flow: f64, stock: f64) -> Reading {
    if z.abs() > PHI_SQ && r > PHI {
        return Reading::Pathogenic;
    }
    if r > PHI {
        return Reading::Expansion;
    }
    if r < INV_PHI {
        return Reading::Compression;
    }
    match (flow >= 0.0, stock >= 0.0) {
        (true, true) => Reading::Accumulation,
        (false, true) => Reading::Distribution,
        (true, false) => Reading::Recovery,
        (false, false) => Reading::Capitulation,
    }
}

/// Grade by Fibonacci history depth.
fn fidelity(bars: usize) -> Fidelity {
    if bars >= 233 {
        Fidelity::A
    } else if bars >= 144 {
        Fidelity::B
    } else if bars >= 89 {
        Fidelity::C
    } else {
        Fidelity::D
    }
}

impl Reading {
    pub fn label(&self) -> &'static str {
        match self {
            Reading::Pathogenic => "PATHOGENIC ANOMALY",
            Reading::Expansion => "EXPANSION",
            Reading::Compression => "COMPRESSION",
            Reading::Accumulation => "ACCUMULATION",
            Reading::Distribution => "DISTRIBUTION",
            Reading::Recovery => "RECOVERY",
            Reading::Capitulation => "CAPITULATION",
        }
    }
}

/// Render the clinical report used as the direct S2 output for verified
/// ticker analyses.
pub fn render_report(
    ticker: &str,
    name: Option<&str>,
    currency: Option<&str>,
    daily: &PsiEmaAnalysis,
    weekly: Option<&PsiEmaAnalysis>,
    period_label: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "## Ψ-EMA Clinical Report — {}{}\n\n",
        ticker,
        name.map(|n| format!(" ({n})")).unwrap_or_default()
    ));
    if let Some(period) = period_label {
        out.push_str(&format!("Period: {period}\n"));
    }
    out.push_str(&format!(
        "Last close: {}{:.2}\n\n",
        currency.map(|c| format!("{c} ")).unwrap_or_default(),
        daily.last_close
    ));
    out.push_str("### Daily\n");
    render_dimensions(&mut out, daily);
    if let Some(weekly) = weekly {
        out.push_str("\n### Weekly\n");
        render_dimensions(&mut out, weekly);
    }
    if daily.pathogen {
        out.push_str("\n⚠ Pathogen detected: anomaly beyond φ² with expanding amplitude.\n");
    }
    out
}

fn render_dimensions(out: &mut String, analysis: &PsiEmaAnalysis) {
    out.push_str(&format!("θ (phase): {:.1}°\n", analysis.theta_deg));
    out.push_str(&format!("z (anomaly): {:.2}\n", analysis.z_score));
    out.push_str(&format!("R (convergence): {:.3}\n", analysis.convergence));
    out.push_str(&format!(
        "Reading: {} — fidelity {:?} ({} bars)\n",
        analysis.reading.label(),
        analysis.fidelity,
        analysis.bar_count
    ));
}

/// Canonical documentation attached verbatim for identity queries
/// ("what is Ψ-EMA").
pub const CANONICAL_DOC: &str = "\
Ψ-EMA is a three-dimensional price oscillator computed from close prices.\n\
It reads a series along three axes:\n\
\n\
- θ (phase): the angle atan2(flow, stock) in degrees, where flow is the\n\
  spread between the fast and slow exponential moving averages and stock is\n\
  the deviation of the last close from the base EMA. θ places the series in\n\
  one of four regimes: accumulation, distribution, recovery, capitulation.\n\
- z (anomaly): a robust z-score of the latest close against the trailing\n\
  window, using the median absolute deviation instead of the standard\n\
  deviation so single outliers cannot mask themselves.\n\
- R (convergence): the ratio of recent swing amplitude to prior swing\n\
  amplitude, read against the golden thresholds 1/φ, φ, and φ².\n\
\n\
A reading beyond φ² on the anomaly axis with amplitude expansion past φ is\n\
flagged as a pathogenic anomaly. Fidelity grades A–D report how much price\n\
history backed the analysis (233/144/89 bars). Ψ-EMA requires at least 55\n\
daily bars, and adds a weekly dimension when 13 weekly bars are available.";

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_series(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * 0.8).collect()
    }

    fn flat_series(n: usize) -> Vec<f64> {
        vec![100.0; n]
    }

    #[test]
    fn rejects_short_series() {
        let err = analyze(&trending_series(54)).unwrap_err();
        assert!(matches!(
            err,
            IndicatorError::InsufficientBars {
                given: 54,
                required: 55
            }
        ));
        assert!(analyze(&trending_series(55)).is_ok());
    }

    #[test]
    fn weekly_minimum_is_thirteen() {
        assert!(analyze_weekly(&trending_series(12)).is_err());
        assert!(analyze_weekly(&trending_series(13)).is_ok());
    }

    #[test]
    fn rejects_non_finite_closes() {
        let mut closes = trending_series(60);
        closes[30] = f64::NAN;
        assert!(matches!(
            analyze(&closes).unwrap_err(),
            IndicatorError::NonFiniteClose(30)
        ));
    }

    #[test]
    fn uptrend_reads_as_accumulation() {
        let analysis = analyze(&trending_series(100)).unwrap();
        assert!(analysis.theta_deg > 0.0);
        assert_eq!(analysis.reading, Reading::Accumulation);
        assert!(!analysis.pathogen);
    }

    #[test]
    fn flat_series_has_zero_anomaly() {
        let analysis = analyze(&flat_series(80)).unwrap();
        assert_eq!(analysis.z_score, 0.0);
        assert_eq!(analysis.convergence, 1.0);
    }

    #[test]
    fn spike_drives_anomaly_up() {
        let mut closes = flat_series(80);
        // gentle noise so MAD is non-zero, then a hard spike
        for (i, close) in closes.iter_mut().enumerate() {
            *close += (i % 3) as f64 * 0.1;
        }
        let last = closes.len() - 1;
        closes[last] = 160.0;
        let analysis = analyze(&closes).unwrap();
        assert!(analysis.z_score > PHI_SQ, "z = {}", analysis.z_score);
    }

    #[test]
    fn fidelity_grades_by_depth() {
        assert_eq!(analyze(&trending_series(55)).unwrap().fidelity, Fidelity::D);
        assert_eq!(analyze(&trending_series(90)).unwrap().fidelity, Fidelity::C);
        assert_eq!(
            analyze(&trending_series(150)).unwrap().fidelity,
            Fidelity::B
        );
        assert_eq!(
            analyze(&trending_series(250)).unwrap().fidelity,
            Fidelity::A
        );
    }

    #[test]
    fn report_carries_the_three_dimensions() {
        let daily = analyze(&trending_series(100)).unwrap();
        let weekly = analyze_weekly(&trending_series(20)).unwrap();
        let report = render_report("NVDA", Some("NVIDIA"), Some("USD"), &daily, Some(&weekly), None);
        assert!(report.contains("θ"));
        assert!(report.contains("z (anomaly)"));
        assert!(report.contains("R (convergence)"));
        assert!(report.contains("### Weekly"));
        assert!(report.contains("NVDA"));
    }

    #[test]
    fn phi_constants_relate() {
        assert!((PHI * PHI - PHI_SQ).abs() < 1e-9);
        assert!((1.0 / PHI - INV_PHI).abs() < 1e-9);
    }
}
