//! Gaussian helpers shared by the skill model and the synthetic history.
//!
//! Everything here is a pure function of its arguments.  The standard normal
//! itself comes from `statrs`; its CDF is built on `erfc`, which keeps a small
//! *relative* error far into the tails.  The rating update divides by tail
//! probabilities, so an absolute-error approximation is not good enough.

use std::f64::consts::SQRT_2;

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Below this the win correction switches to its asymptote `v(x) ≈ -x`.
const TAIL_CDF: f64 = 2.222_758_749e-162;

/// Keeps `ln Φ` finite inside the quadrature.
const MIN_LOG_CDF: f64 = 1e-300;

/// Variance-shrink corrections are kept strictly inside (0, 1).
const W_EPS: f64 = 1e-12;

// ── Distribution functions ───────────────────────────────────────────────────

/// Standard normal density.
pub fn pdf(x: f64) -> f64 {
    Normal::standard().pdf(x)
}

/// Standard normal CDF: Φ(x) = P(Z ≤ x) for Z ~ N(0,1).
pub fn cdf(x: f64) -> f64 {
    Normal::standard().cdf(x)
}

/// Inverse of [`cdf`], saturating to ±∞ outside (0, 1).
pub fn ppf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    Normal::standard().inverse_cdf(p)
}

// ── Truncated-Gaussian corrections ───────────────────────────────────────────
//
// `t` is the normalised mean difference (winner − loser) / c and `eps` the
// normalised draw margin.  `v` shifts the means, `w` shrinks the variances.

/// Mean correction for a decisive result.
pub fn v_win(t: f64, eps: f64) -> f64 {
    let x = t - eps;
    let denom = cdf(x);
    if denom > TAIL_CDF {
        pdf(x) / denom
    } else {
        -x
    }
}

/// Variance correction for a decisive result, in (0, 1).
pub fn w_win(t: f64, eps: f64) -> f64 {
    let x = t - eps;
    let v = v_win(t, eps);
    (v * (v + x)).clamp(W_EPS, 1.0 - W_EPS)
}

/// Mean correction for a draw.  Returns `None` when the draw has (numerically)
/// zero likelihood, e.g. a dead heat with `draw_probability == 0`.
pub fn v_draw(t: f64, eps: f64) -> Option<f64> {
    let abs_t = t.abs();
    let a = eps - abs_t;
    let b = -eps - abs_t;
    let denom = cdf(a) - cdf(b);
    if denom <= TAIL_CDF {
        return None;
    }
    let v = (pdf(b) - pdf(a)) / denom;
    Some(if t < 0.0 { -v } else { v })
}

/// Variance correction for a draw, in (0, 1).
pub fn w_draw(t: f64, eps: f64) -> Option<f64> {
    let abs_t = t.abs();
    let a = eps - abs_t;
    let b = -eps - abs_t;
    let denom = cdf(a) - cdf(b);
    if denom <= TAIL_CDF {
        return None;
    }
    let v = v_draw(abs_t, eps)?;
    Some((v * v + (a * pdf(a) - b * pdf(b)) / denom).clamp(W_EPS, 1.0 - W_EPS))
}

/// Performance-difference margin inside which two competitors are considered
/// to have drawn, for a head-to-head comparison.
pub fn draw_margin(draw_probability: f64, beta: f64) -> f64 {
    if draw_probability <= 0.0 {
        return 0.0;
    }
    ppf((draw_probability + 1.0) / 2.0) * SQRT_2 * beta
}

// ── Field win probabilities ──────────────────────────────────────────────────

/// Probability that each competitor records the highest performance, where
/// competitor `i` performs ~ N(means[i], spreads[i]²) independently.
///
/// Evaluated with the trapezoidal rule on `points` nodes spanning ±8 spreads
/// of the whole field.  The product of rival CDFs is accumulated in log space
/// once per node, so the cost is O(n · points) rather than O(n² · points).
/// The results are clamped to [0, 1] but not renormalised.
pub fn field_win_probabilities(means: &[f64], spreads: &[f64], points: usize) -> Vec<f64> {
    let n = means.len().min(spreads.len());
    match n {
        0 => return Vec::new(),
        1 => return vec![1.0],
        _ => {}
    }
    let points = points.max(3);

    let lo = (0..n)
        .map(|i| means[i] - 8.0 * spreads[i])
        .fold(f64::INFINITY, f64::min);
    let hi = (0..n)
        .map(|i| means[i] + 8.0 * spreads[i])
        .fold(f64::NEG_INFINITY, f64::max);
    let step = (hi - lo) / (points - 1) as f64;

    let mut probs = vec![0.0; n];
    let mut log_cdf = vec![0.0; n];
    for k in 0..points {
        let x = lo + step * k as f64;
        let weight = if k == 0 || k == points - 1 { 0.5 } else { 1.0 };

        let mut total = 0.0;
        for i in 0..n {
            log_cdf[i] = cdf((x - means[i]) / spreads[i]).max(MIN_LOG_CDF).ln();
            total += log_cdf[i];
        }
        for i in 0..n {
            let density = pdf((x - means[i]) / spreads[i]) / spreads[i];
            if density == 0.0 {
                continue;
            }
            probs[i] += weight * density * (total - log_cdf[i]).exp();
        }
    }

    probs
        .into_iter()
        .map(|p| (p * step).clamp(0.0, 1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cdf_reference_values() {
        assert_relative_eq!(cdf(0.0), 0.5, epsilon = 1e-7);
        assert_relative_eq!(cdf(1.0), 0.841_344_746, epsilon = 1e-6);
        assert_relative_eq!(cdf(-1.959_964), 0.025, epsilon = 1e-6);
        assert!(cdf(-30.0) > 0.0, "tail should not underflow this early");
    }

    #[test]
    fn lower_tail_keeps_relative_accuracy() {
        // Φ(-10) ≈ 7.6199e-24
        assert_relative_eq!(cdf(-10.0), 7.619_853_024_160_527e-24, max_relative = 1e-6);
        assert!(v_win(-12.0, 0.0).is_finite());
    }

    #[test]
    fn ppf_saturates_outside_unit_interval() {
        assert_eq!(ppf(0.0), f64::NEG_INFINITY);
        assert_eq!(ppf(1.0), f64::INFINITY);
        assert_relative_eq!(ppf(0.975), 1.959_964, epsilon = 1e-5);
    }

    #[test]
    fn ppf_inverts_cdf() {
        for p in [0.01, 0.2, 0.5, 0.8, 0.99] {
            assert_relative_eq!(cdf(ppf(p)), p, epsilon = 1e-7);
        }
    }

    #[test]
    fn win_corrections_are_well_behaved() {
        for t in [-10.0, -2.0, 0.0, 1.5, 6.0] {
            let v = v_win(t, 0.1);
            let w = w_win(t, 0.1);
            assert!(v > 0.0, "v_win({}) = {}", t, v);
            assert!(w > 0.0 && w < 1.0, "w_win({}) = {}", t, w);
        }
        // An upset (large negative t) moves the means more than an expected win.
        assert!(v_win(-2.0, 0.0) > v_win(2.0, 0.0));
    }

    #[test]
    fn draw_corrections_pull_towards_each_other() {
        let v = v_draw(1.0, 0.3).expect("draw is possible");
        assert!(v < 0.0, "stronger side should lose mean on a draw");
        let w = w_draw(1.0, 0.3).expect("draw is possible");
        assert!(w > 0.0 && w < 1.0);
        assert!(v_draw(0.5, 0.0).is_none());
    }

    #[test]
    fn draw_margin_zero_without_draws() {
        assert_eq!(draw_margin(0.0, 4.0), 0.0);
        assert!(draw_margin(0.1, 4.0) > 0.0);
    }

    #[test]
    fn two_way_field_matches_closed_form() {
        // P(A beats B) = Φ((μa − μb) / √(sa² + sb²))
        let probs = field_win_probabilities(&[1.0, 0.0], &[1.0, 1.0], 2000);
        let expected = cdf(1.0 / 2.0_f64.sqrt());
        assert_relative_eq!(probs[0], expected, epsilon = 1e-4);
        assert_relative_eq!(probs[1], 1.0 - expected, epsilon = 1e-4);
    }

    #[test]
    fn symmetric_field_is_uniform() {
        let probs = field_win_probabilities(&[0.0; 5], &[1.0; 5], 1000);
        for p in probs {
            assert_relative_eq!(p, 0.2, epsilon = 1e-3);
        }
    }

    #[test]
    fn field_handles_degenerate_sizes() {
        assert!(field_win_probabilities(&[], &[], 100).is_empty());
        assert_eq!(field_win_probabilities(&[3.0], &[1.0], 100), vec![1.0]);
    }
}
