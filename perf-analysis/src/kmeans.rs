//! K-means clustering of normalized traces.
//!
//! Deterministic on purpose: initial centroids are evenly spaced over the
//! input, so repeated scans of unchanged data produce identical clusters.

use rayon::prelude::*;

use crate::vecops::{centroid, distance_sq};

const MAX_ITERATIONS: usize = 25;

/// One cluster: its centroid and the indices of its member traces.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub centroid: Vec<f32>,
    pub members: Vec<usize>,
}

/// The automatic cluster count for `n` traces:
/// `clamp(40n/30000 + 10, 10, 100)`.
pub fn auto_k(n: usize) -> usize {
    (40 * n / 30_000 + 10).clamp(10, 100)
}

/// Cluster equal-length traces into at most `k` groups. Empty clusters
/// are dropped, so fewer than `k` may come back.
pub fn cluster(traces: &[Vec<f32>], k: usize) -> Vec<Cluster> {
    if traces.is_empty() {
        return Vec::new();
    }
    let n = traces.len();
    let k = k.clamp(1, n);
    let len = traces[0].len();

    // Evenly spaced seeds.
    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| traces[i * n / k].clone()).collect();
    let mut assignment: Vec<usize> = vec![0; n];

    for _ in 0..MAX_ITERATIONS {
        let next: Vec<usize> = traces
            .par_iter()
            .map(|trace| nearest(trace, &centroids))
            .collect();
        let changed = next != assignment;
        assignment = next;

        for (ci, c) in centroids.iter_mut().enumerate() {
            let members: Vec<&[f32]> = assignment
                .iter()
                .enumerate()
                .filter(|(_, &a)| a == ci)
                .map(|(ti, _)| traces[ti].as_slice())
                .collect();
            if !members.is_empty() {
                *c = centroid(&members, len);
            }
        }

        if !changed {
            break;
        }
    }

    let mut clusters: Vec<Cluster> = centroids
        .into_iter()
        .enumerate()
        .map(|(ci, c)| Cluster {
            centroid: c,
            members: assignment
                .iter()
                .enumerate()
                .filter(|(_, &a)| a == ci)
                .map(|(ti, _)| ti)
                .collect(),
        })
        .filter(|c| !c.members.is_empty())
        .collect();
    // Largest clusters first, then by first member for determinism.
    clusters.sort_by(|a, b| {
        b.members
            .len()
            .cmp(&a.members.len())
            .then_with(|| a.members.cmp(&b.members))
    });
    clusters
}

fn nearest(trace: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = distance_sq(trace, c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}
