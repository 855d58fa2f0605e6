//! Confidence intervals for binomial proportions (ASR measurement).
//!
//! Two methods are provided:
//!
//! - **Wilson score** - approximate, good coverage for n >= 20, narrower.
//! - **Clopper-Pearson** - exact via the beta distribution, conservative,
//!   guaranteed coverage at or above the nominal level.
//!
//! Automatic selection uses Clopper-Pearson for small samples (n < 20) and
//! degenerate proportions (zero or all successes), Wilson otherwise.
//!
//! The numeric kernels (inverse normal CDF, regularized incomplete beta and
//! its inverse) are implemented here; they are small, closed-form, and
//! covered by property tests.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Interval calculation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CiMethod {
    /// Select automatically based on sample size and proportion
    Auto,
    /// Wilson score interval
    Wilson,
    /// Clopper-Pearson exact interval
    ClopperPearson,
}

impl FromStr for CiMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "wilson" => Ok(Self::Wilson),
            "clopper-pearson" => Ok(Self::ClopperPearson),
            other => Err(Error::InvalidInput(format!(
                "unknown CI method '{other}'; use 'auto', 'wilson', or 'clopper-pearson'"
            ))),
        }
    }
}

/// Result of a confidence interval calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound (0..1)
    pub lower: f64,
    /// Upper bound (0..1)
    pub upper: f64,
    /// Observed proportion (successes / trials)
    pub point_estimate: f64,
    /// Method actually used ("wilson" or "clopper-pearson")
    pub method_used: String,
    /// Optional warning (small sample, degenerate proportion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Confidence level used
    pub confidence_level: f64,
}

/// Wilson score interval for a binomial proportion.
pub fn wilson_interval(successes: u64, trials: u64, confidence: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 0.0);
    }
    let n = trials as f64;
    let p = successes as f64 / n;
    let z = normal_quantile(1.0 - (1.0 - confidence) / 2.0);

    let denominator = 1.0 + z * z / n;
    let center = (p + z * z / (2.0 * n)) / denominator;
    let margin = (z / denominator) * (p * (1.0 - p) / n + z * z / (4.0 * n * n)).sqrt();

    ((center - margin).max(0.0), (center + margin).min(1.0))
}

/// Clopper-Pearson exact interval for a binomial proportion.
///
/// Lower bound is the alpha/2 quantile of Beta(x, n-x+1); upper bound the
/// 1-alpha/2 quantile of Beta(x+1, n-x). Degenerate cases: x=0 pins the
/// lower bound to 0, x=n pins the upper bound to 1.
pub fn clopper_pearson_interval(successes: u64, trials: u64, confidence: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 0.0);
    }
    let alpha = 1.0 - confidence;
    let x = successes as f64;
    let n = trials as f64;

    let lower = if successes == 0 {
        0.0
    } else {
        beta_quantile(alpha / 2.0, x, n - x + 1.0)
    };
    let upper = if successes == trials {
        1.0
    } else {
        beta_quantile(1.0 - alpha / 2.0, x + 1.0, n - x)
    };

    (lower, upper)
}

/// Calculate a confidence interval for an attack success rate.
///
/// With `CiMethod::Auto`, Clopper-Pearson is selected when `trials < 20`,
/// `successes == 0`, or `successes == trials`; Wilson otherwise. A warning
/// is attached for samples below 30 trials.
pub fn asr_confidence_interval(
    successes: u64,
    trials: u64,
    method: CiMethod,
    confidence: f64,
) -> Result<ConfidenceInterval> {
    if successes > trials {
        return Err(Error::InvalidInput(format!(
            "successes ({successes}) exceeds trials ({trials})"
        )));
    }
    if !(0.0..1.0).contains(&confidence) || confidence <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "confidence must be in (0, 1), got {confidence}"
        )));
    }

    let point_estimate = if trials > 0 {
        successes as f64 / trials as f64
    } else {
        0.0
    };

    let mut warning = None;
    let selected = match method {
        CiMethod::Auto => {
            if trials < 20 {
                warning = Some(format!(
                    "Small sample size (n={trials}): using exact Clopper-Pearson \
                     method. Consider n>=30 for reliable estimates."
                ));
                CiMethod::ClopperPearson
            } else if successes == 0 {
                warning =
                    Some("Zero successes: using exact Clopper-Pearson method.".to_string());
                CiMethod::ClopperPearson
            } else if successes == trials {
                warning =
                    Some("All successes: using exact Clopper-Pearson method.".to_string());
                CiMethod::ClopperPearson
            } else {
                CiMethod::Wilson
            }
        }
        forced => {
            if trials < 20 && forced == CiMethod::Wilson {
                warning = Some(format!(
                    "Small sample size (n={trials}): Wilson score may under-cover. \
                     Consider Clopper-Pearson or n>=30."
                ));
            } else if trials < 30 {
                warning = Some(format!(
                    "Small sample size (n={trials}): confidence interval will be \
                     wide. Consider n>=30 for reliable estimates."
                ));
            }
            forced
        }
    };

    let (lower, upper, method_used) = match selected {
        CiMethod::Wilson => {
            let (lo, hi) = wilson_interval(successes, trials, confidence);
            (lo, hi, "wilson")
        }
        _ => {
            let (lo, hi) = clopper_pearson_interval(successes, trials, confidence);
            (lo, hi, "clopper-pearson")
        }
    };

    Ok(ConfidenceInterval {
        lower,
        upper,
        point_estimate,
        method_used: method_used.to_string(),
        warning,
        confidence_level: confidence,
    })
}

/// Format an interval for display, e.g. `6.7% [95% CI: 0.2%-32.0%] (Clopper-Pearson exact)`.
pub fn format_interval(ci: &ConfidenceInterval) -> String {
    let pct = (ci.confidence_level * 100.0).round() as u32;
    let suffix = match ci.method_used.as_str() {
        "clopper-pearson" => " (Clopper-Pearson exact)",
        "wilson" => " (Wilson score)",
        _ => "",
    };
    format!(
        "{:.1}% [{pct}% CI: {:.1}%-{:.1}%]{suffix}",
        ci.point_estimate * 100.0,
        ci.lower * 100.0,
        ci.upper * 100.0,
    )
}

// ---------------------------------------------------------------------------
// Numeric kernels
// ---------------------------------------------------------------------------

/// Standard normal quantile (inverse CDF) via Acklam's rational
/// approximation, accurate to ~1e-9 over (0, 1).
fn normal_quantile(p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Log of the gamma function (Lanczos approximation).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

/// Continued fraction for the incomplete beta function (modified Lentz).
fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3.0e-14;
    const FPMIN: f64 = 1.0e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b).
fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    // The continued fraction converges fastest for x < (a+1)/(a+b+2); use
    // the symmetry relation otherwise.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

/// Quantile of the Beta(a, b) distribution via bisection on the
/// regularized incomplete beta. Monotone and bounded, so bisection is
/// robust for every (a, b) this module produces.
fn beta_quantile(p: f64, a: f64, b: f64) -> f64 {
    if p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if regularized_incomplete_beta(mid, a, b) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1.0e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_normal_quantile_reference_values() {
        assert!(close(normal_quantile(0.975), 1.959964, 1e-5));
        assert!(close(normal_quantile(0.995), 2.575829, 1e-5));
        assert!(close(normal_quantile(0.5), 0.0, 1e-9));
    }

    #[test]
    fn test_incomplete_beta_reference_values() {
        // I_x(1, b) = 1 - (1-x)^b
        let x: f64 = 0.3;
        let b = 5.0;
        let expected = 1.0 - (1.0 - x).powf(b);
        assert!(close(regularized_incomplete_beta(x, 1.0, b), expected, 1e-10));
        // Symmetry: I_x(a,b) = 1 - I_{1-x}(b,a)
        let v = regularized_incomplete_beta(0.4, 3.0, 7.0);
        let w = 1.0 - regularized_incomplete_beta(0.6, 7.0, 3.0);
        assert!(close(v, w, 1e-10));
    }

    #[test]
    fn test_auto_selects_clopper_pearson_for_small_sample() {
        let ci = asr_confidence_interval(1, 15, CiMethod::Auto, 0.95).unwrap();
        assert_eq!(ci.method_used, "clopper-pearson");
        assert!(ci.warning.is_some());
        // Reference bounds for n=15, x=1 at 95%.
        assert!(close(ci.lower, 0.0017, 2e-3), "lower = {}", ci.lower);
        assert!(close(ci.upper, 0.3195, 2e-3), "upper = {}", ci.upper);
    }

    #[test]
    fn test_auto_selects_wilson_for_large_sample() {
        let ci = asr_confidence_interval(10, 100, CiMethod::Auto, 0.95).unwrap();
        assert_eq!(ci.method_used, "wilson");
        assert!(ci.warning.is_none());
        // Reference bounds for n=100, x=10 at 95%.
        assert!(close(ci.lower, 0.055, 2e-3), "lower = {}", ci.lower);
        assert!(close(ci.upper, 0.175, 2e-3), "upper = {}", ci.upper);
    }

    #[test]
    fn test_auto_selects_exact_for_degenerate_proportions() {
        let ci = asr_confidence_interval(0, 50, CiMethod::Auto, 0.95).unwrap();
        assert_eq!(ci.method_used, "clopper-pearson");
        assert_eq!(ci.lower, 0.0);

        let ci = asr_confidence_interval(50, 50, CiMethod::Auto, 0.95).unwrap();
        assert_eq!(ci.method_used, "clopper-pearson");
        assert_eq!(ci.upper, 1.0);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(asr_confidence_interval(5, 3, CiMethod::Auto, 0.95).is_err());
        assert!(asr_confidence_interval(1, 10, CiMethod::Auto, 1.5).is_err());
        assert!("bogus".parse::<CiMethod>().is_err());
        assert_eq!("wilson".parse::<CiMethod>().unwrap(), CiMethod::Wilson);
        assert_eq!(
            "clopper-pearson".parse::<CiMethod>().unwrap(),
            CiMethod::ClopperPearson
        );
    }

    #[test]
    fn test_zero_trials() {
        let ci = asr_confidence_interval(0, 0, CiMethod::Auto, 0.95).unwrap();
        assert_eq!(ci.point_estimate, 0.0);
        assert_eq!(ci.lower, 0.0);
        assert_eq!(ci.upper, 0.0);
    }

    #[test]
    fn test_format_interval() {
        let ci = asr_confidence_interval(1, 15, CiMethod::Auto, 0.95).unwrap();
        let text = format_interval(&ci);
        assert!(text.contains("95% CI"));
        assert!(text.contains("Clopper-Pearson"));
    }

    proptest! {
        #[test]
        fn prop_interval_ordering(successes in 0u64..200, extra in 1u64..200) {
            let trials = successes + extra;
            for method in [CiMethod::Wilson, CiMethod::ClopperPearson, CiMethod::Auto] {
                let ci = asr_confidence_interval(successes, trials, method, 0.95).unwrap();
                prop_assert!(ci.lower >= 0.0);
                prop_assert!(ci.lower <= ci.point_estimate + 1e-9);
                prop_assert!(ci.point_estimate <= ci.upper + 1e-9);
                prop_assert!(ci.upper <= 1.0);
                prop_assert!(close(
                    ci.point_estimate,
                    successes as f64 / trials as f64,
                    1e-12
                ));
            }
        }

        #[test]
        fn prop_clopper_pearson_contains_wilson(successes in 0u64..100, extra in 1u64..100) {
            let trials = successes + extra;
            let (w_lo, w_hi) = wilson_interval(successes, trials, 0.95);
            let (cp_lo, cp_hi) = clopper_pearson_interval(successes, trials, 0.95);
            // The exact interval is conservative: it contains the Wilson one.
            prop_assert!(cp_lo <= w_lo + 1e-9);
            prop_assert!(cp_hi >= w_hi - 1e-9);
        }
    }
}
