//! Missing-aware vector kernels used by filtering, clustering, and the
//! step fitter. Traces carry the missing-data sentinel in unfilled cells.

use perf_core::tile::{is_missing, MISSING_DATA_SENTINEL};

/// Fraction of cells that are missing. An empty slice counts as fully
/// missing.
pub fn missing_ratio(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return 1.0;
    }
    xs.iter().filter(|&&x| is_missing(x)).count() as f32 / xs.len() as f32
}

/// Replace missing cells with the nearest earlier sample; leading gaps
/// take the first real sample. An all-missing trace becomes all zeros.
pub fn fill(xs: &mut [f32]) {
    let Some(first_valid) = xs.iter().position(|&x| !is_missing(x)) else {
        xs.fill(0.0);
        return;
    };
    let lead = xs[first_valid];
    for x in xs[..first_valid].iter_mut() {
        *x = lead;
    }
    let mut last = lead;
    for x in xs[first_valid..].iter_mut() {
        if is_missing(*x) {
            *x = last;
        } else {
            last = *x;
        }
    }
}

/// Mean over the non-missing cells.
pub fn mean_miss(xs: &[f32]) -> Option<f32> {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for &x in xs {
        if !is_missing(x) {
            sum += x as f64;
            n += 1;
        }
    }
    if n == 0 {
        None
    } else {
        Some((sum / n as f64) as f32)
    }
}

/// Plain mean; the slice must not contain the sentinel.
pub fn mean(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return 0.0;
    }
    (xs.iter().map(|&x| x as f64).sum::<f64>() / xs.len() as f64) as f32
}

/// Sample standard deviation; the slice must not contain the sentinel.
pub fn std_dev(xs: &[f32]) -> f32 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs) as f64;
    let var = xs.iter().map(|&x| (x as f64 - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt() as f32
}

/// Normalize in place to mean 0, and standard deviation 1 when the
/// spread exceeds `min_std_dev`. Call `fill` first.
pub fn norm(xs: &mut [f32], min_std_dev: f32) {
    let m = mean(xs);
    for x in xs.iter_mut() {
        *x -= m;
    }
    let sd = std_dev(xs);
    if sd > min_std_dev {
        for x in xs.iter_mut() {
            *x /= sd;
        }
    }
}

/// Element-wise mean of several equal-length traces.
pub fn centroid(rows: &[&[f32]], len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    if rows.is_empty() {
        return out;
    }
    for row in rows {
        for (o, &x) in out.iter_mut().zip(row.iter()) {
            *o += x;
        }
    }
    for o in out.iter_mut() {
        *o /= rows.len() as f32;
    }
    out
}

/// Squared euclidean distance.
pub fn distance_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: f32 = MISSING_DATA_SENTINEL;

    #[test]
    fn missing_ratio_counts_sentinels() {
        assert_eq!(missing_ratio(&[1.0, M, 3.0, M]), 0.5);
        assert_eq!(missing_ratio(&[]), 1.0);
        assert_eq!(missing_ratio(&[1.0]), 0.0);
    }

    #[test]
    fn fill_uses_nearest_neighbors() {
        let mut xs = [M, M, 2.0, M, 4.0, M];
        fill(&mut xs);
        assert_eq!(xs, [2.0, 2.0, 2.0, 2.0, 4.0, 4.0]);

        let mut all_missing = [M, M];
        fill(&mut all_missing);
        assert_eq!(all_missing, [0.0, 0.0]);
    }

    #[test]
    fn norm_centers_and_scales() {
        let mut xs = [1.0, 2.0, 3.0, 4.0];
        norm(&mut xs, 0.001);
        assert!(mean(&xs).abs() < 1e-6);
        assert!((std_dev(&xs) - 1.0).abs() < 1e-5);

        // Flat traces are centered but not scaled.
        let mut flat = [5.0, 5.0, 5.0];
        norm(&mut flat, 0.001);
        assert_eq!(flat, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn centroid_averages_rows() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        assert_eq!(centroid(&[&a, &b], 2), vec![2.0, 3.0]);
    }
}
