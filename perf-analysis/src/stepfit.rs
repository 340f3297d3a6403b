//! Step fitting: decide whether a trace steps up or down at a fixed
//! turning point, under one of five detection algorithms.

use perf_core::alert::StepDetection;
use perf_core::regression::{StepFit, StepFitStatus};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::vecops::{mean, std_dev};

/// Spread guard for the normalizing denominators.
pub const MIN_STD_DEV: f32 = 0.001;

/// `least_squares` carries this for algorithms that do not fit by LSE.
pub const INVALID_LEAST_SQUARES: f32 = -1.0;

fn none_fit(turning: usize) -> StepFit {
    StepFit {
        least_squares: INVALID_LEAST_SQUARES,
        turning_point: turning,
        step_size: 0.0,
        regression: 0.0,
        status: StepFitStatus::None,
    }
}

/// Fit a two-level step at `turning`: cells `[0, turning)` are the left
/// side, `[turning, len)` the right (the candidate commit opens the right
/// side). The trace must already be filled; for `Original` the caller
/// normalizes first.
///
/// The verdict is `High` when the normalized step magnitude clears
/// `interesting` upward, `Low` downward. A flat trace is never
/// interesting, regardless of threshold.
pub fn step_fit_at(
    trace: &[f32],
    turning: usize,
    algo: StepDetection,
    interesting: f32,
) -> StepFit {
    if turning < 1 || turning >= trace.len() {
        return none_fit(turning);
    }
    let (left, right) = trace.split_at(turning);
    let mean_left = mean(left);
    let mean_right = mean(right);
    let step_size = mean_right - mean_left;

    let (least_squares, regression) = match algo {
        StepDetection::Original => {
            let sse: f64 = left
                .iter()
                .map(|&x| ((x - mean_left) as f64).powi(2))
                .chain(right.iter().map(|&x| ((x - mean_right) as f64).powi(2)))
                .sum();
            let lse = ((sse / trace.len() as f64).sqrt() as f32).max(MIN_STD_DEV);
            (lse, step_size / lse)
        }
        StepDetection::Absolute => (INVALID_LEAST_SQUARES, step_size),
        StepDetection::Percent => {
            let denom = mean_left.abs().max(MIN_STD_DEV);
            (INVALID_LEAST_SQUARES, step_size / denom)
        }
        StepDetection::Cohen => {
            if left.len() < 2 || right.len() < 2 {
                return none_fit(turning);
            }
            let s0 = std_dev(left) as f64;
            let s1 = std_dev(right) as f64;
            let n0 = left.len() as f64;
            let n1 = right.len() as f64;
            let pooled = (((n0 - 1.0) * s0 * s0 + (n1 - 1.0) * s1 * s1) / (n0 + n1 - 2.0))
                .sqrt()
                .max(MIN_STD_DEV as f64);
            (INVALID_LEAST_SQUARES, (step_size as f64 / pooled) as f32)
        }
        StepDetection::MannWhitneyU => {
            return mann_whitney_fit(left, right, turning, step_size, interesting);
        }
    };

    let status = threshold_status(regression, interesting);
    StepFit {
        least_squares,
        turning_point: turning,
        step_size,
        regression,
        status,
    }
}

fn threshold_status(regression: f32, interesting: f32) -> StepFitStatus {
    if regression > 0.0 && regression >= interesting {
        StepFitStatus::High
    } else if regression < 0.0 && -regression >= interesting {
        StepFitStatus::Low
    } else {
        StepFitStatus::None
    }
}

/// Rank test with normal approximation. `interesting` in (0, 1) is used
/// as the significance level, anything else falls back to 0.05.
fn mann_whitney_fit(
    left: &[f32],
    right: &[f32],
    turning: usize,
    step_size: f32,
    interesting: f32,
) -> StepFit {
    let Some(z) = mann_whitney_z(left, right) else {
        return none_fit(turning);
    };
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return none_fit(turning);
    };
    let p = 2.0 * (1.0 - normal.cdf(z.abs()));
    let alpha = if interesting > 0.0 && interesting < 1.0 {
        interesting as f64
    } else {
        0.05
    };
    let status = if p <= alpha && step_size > 0.0 {
        StepFitStatus::High
    } else if p <= alpha && step_size < 0.0 {
        StepFitStatus::Low
    } else {
        StepFitStatus::None
    };
    StepFit {
        least_squares: INVALID_LEAST_SQUARES,
        turning_point: turning,
        step_size,
        regression: z as f32,
        status,
    }
}

/// z statistic of the Mann-Whitney U test, ties resolved by average
/// ranks (without the tie variance correction).
fn mann_whitney_z(left: &[f32], right: &[f32]) -> Option<f64> {
    let n1 = left.len();
    let n2 = right.len();
    if n1 < 2 || n2 < 2 {
        return None;
    }
    let mut combined: Vec<(f32, bool)> = left
        .iter()
        .map(|&x| (x, true))
        .chain(right.iter().map(|&x| (x, false)))
        .collect();
    combined.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut r1 = 0.0f64;
    let mut i = 0;
    while i < combined.len() {
        let mut j = i;
        while j + 1 < combined.len() && combined[j + 1].0 == combined[i].0 {
            j += 1;
        }
        // Average rank for the tie run [i, j].
        let avg_rank = (i + j + 2) as f64 / 2.0;
        for item in &combined[i..=j] {
            if item.1 {
                r1 += avg_rank;
            }
        }
        i = j + 1;
    }

    let n1f = n1 as f64;
    let n2f = n2 as f64;
    let u1 = r1 - n1f * (n1f + 1.0) / 2.0;
    let mu = n1f * n2f / 2.0;
    let sigma = (n1f * n2f * (n1f + n2f + 1.0) / 12.0).sqrt();
    if sigma <= 0.0 {
        return None;
    }
    Some((u1 - mu) / sigma)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_up(radius: usize, low: f32, high: f32) -> Vec<f32> {
        let mut t = vec![low; radius];
        t.extend(vec![high; radius + 1]);
        t
    }

    #[test]
    fn original_flags_clear_steps() {
        let t = step_up(5, 1.0, 10.0);
        let fit = step_fit_at(&t, 5, StepDetection::Original, 2.0);
        assert_eq!(fit.status, StepFitStatus::High);
        assert!(fit.regression > 2.0);
        assert_eq!(fit.turning_point, 5);
        assert!((fit.step_size - 9.0).abs() < 1e-5);

        let mut down = t.clone();
        down.reverse();
        let fit = step_fit_at(&down, 6, StepDetection::Original, 2.0);
        assert_eq!(fit.status, StepFitStatus::Low);
    }

    #[test]
    fn flat_trace_is_never_interesting() {
        let flat = vec![3.0; 11];
        for algo in [
            StepDetection::Original,
            StepDetection::Absolute,
            StepDetection::Percent,
            StepDetection::Cohen,
            StepDetection::MannWhitneyU,
        ] {
            let fit = step_fit_at(&flat, 5, algo, 0.0);
            assert_eq!(fit.status, StepFitStatus::None, "{algo:?}");
        }
    }

    #[test]
    fn step_away_from_turning_point_is_weak() {
        // Step sits at offset 2, but we fit at the center of an 11-wide
        // window; the misplaced step mostly cancels out.
        let mut t = vec![1.0; 2];
        t.extend(vec![10.0; 9]);
        let centered = step_fit_at(&t, 5, StepDetection::Original, 2.0);
        assert_eq!(centered.status, StepFitStatus::None);
        let at_step = step_fit_at(&t, 2, StepDetection::Original, 2.0);
        assert_eq!(at_step.status, StepFitStatus::High);
    }

    #[test]
    fn absolute_and_percent_use_raw_units() {
        let t = step_up(4, 100.0, 104.0);
        let abs = step_fit_at(&t, 4, StepDetection::Absolute, 3.0);
        assert_eq!(abs.status, StepFitStatus::High);
        assert!((abs.regression - 4.0).abs() < 1e-4);

        // A 4% move fails a 10% threshold but passes 2%.
        let pct = step_fit_at(&t, 4, StepDetection::Percent, 0.10);
        assert_eq!(pct.status, StepFitStatus::None);
        let pct = step_fit_at(&t, 4, StepDetection::Percent, 0.02);
        assert_eq!(pct.status, StepFitStatus::High);
    }

    #[test]
    fn cohen_normalizes_by_pooled_spread() {
        let mut t = vec![10.0, 10.2, 9.8, 10.1, 9.9];
        t.extend([12.0, 12.2, 11.8, 12.1, 11.9]);
        let fit = step_fit_at(&t, 5, StepDetection::Cohen, 2.0);
        assert_eq!(fit.status, StepFitStatus::High);
    }

    #[test]
    fn mann_whitney_detects_rank_shift() {
        let mut t: Vec<f32> = (0..8).map(|i| 1.0 + 0.01 * i as f32).collect();
        t.extend((0..8).map(|i| 5.0 + 0.01 * i as f32));
        let fit = step_fit_at(&t, 8, StepDetection::MannWhitneyU, 0.05);
        assert_eq!(fit.status, StepFitStatus::High);

        let noise: Vec<f32> = (0..16).map(|i| if i % 2 == 0 { 1.0 } else { 1.1 }).collect();
        let fit = step_fit_at(&noise, 8, StepDetection::MannWhitneyU, 0.05);
        assert_eq!(fit.status, StepFitStatus::None);
    }

    #[test]
    fn degenerate_windows_are_none() {
        assert_eq!(step_fit_at(&[1.0], 0, StepDetection::Original, 0.0).status, StepFitStatus::None);
        assert_eq!(step_fit_at(&[1.0, 2.0], 2, StepDetection::Original, 0.0).status, StepFitStatus::None);
        assert_eq!(step_fit_at(&[1.0, 5.0, 5.0], 1, StepDetection::Cohen, 0.0).status, StepFitStatus::None);
    }
}
