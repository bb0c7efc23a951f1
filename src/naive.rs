//! Single-threaded reference implementation of Lloyd's algorithm.
//!
//! Matches the device pipelines' semantics exactly: "first K points"
//! initialization, squared Euclidean distance with ties toward the lower
//! centroid index, empty clusters retain their previous centroid, and the
//! loop counts the final no-change iteration like the device controllers
//! do. Used for verification and as the test oracle.

use crate::kernels::{ClLabel, ClMass, ClPoint};
use crate::matrix::{first_k_centroids, Matrix};

#[derive(Debug, Clone, PartialEq)]
pub struct NaiveOutcome<P, L, M> {
    /// Column-major `k x num_features`.
    pub centroids: Vec<P>,
    pub labels: Vec<L>,
    pub masses: Vec<M>,
    pub iterations: u32,
}

pub fn lloyd<P: ClPoint, L: ClLabel, M: ClMass>(
    points: &Matrix<P>,
    k: usize,
    max_iterations: u32,
) -> NaiveOutcome<P, L, M> {
    let num_points = points.rows();
    let num_features = points.cols();
    assert!(k > 0 && k <= num_points);

    let mut centroids = first_k_centroids(points, k);
    let mut labels = vec![L::from_usize(0); num_points];
    let mut masses = vec![M::from_usize(0); k];
    let mut iterations = 0;

    while iterations < max_iterations {
        let mut changed = false;

        for p in 0..num_points {
            let label = nearest(points, &centroids, k, p);
            if labels[p].to_usize() != label {
                labels[p] = L::from_usize(label);
                changed = true;
            }
        }

        let mut counts = vec![0usize; k];
        let mut sums = vec![P::default(); k * num_features];
        for p in 0..num_points {
            let c = labels[p].to_usize();
            counts[c] += 1;
            for f in 0..num_features {
                sums[f * k + c] = sums[f * k + c] + points.get(p, f);
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                // Empty cluster: keep the previous centroid.
                continue;
            }
            let mass = P::from_usize(counts[c]);
            for f in 0..num_features {
                centroids[f * k + c] = sums[f * k + c] / mass;
            }
        }
        for c in 0..k {
            masses[c] = M::from_usize(counts[c]);
        }

        iterations += 1;
        if !changed {
            break;
        }
    }

    NaiveOutcome { centroids, labels, masses, iterations }
}

fn nearest<P: ClPoint>(points: &Matrix<P>, centroids: &[P], k: usize, p: usize) -> usize {
    let num_features = points.cols();
    let mut best = 0;
    let mut best_dist = None;

    for c in 0..k {
        let mut dist = P::default();
        for f in 0..num_features {
            let d = points.get(p, f) - centroids[f * k + c];
            dist = dist + d * d;
        }
        // Strict `<` keeps the lowest index on ties.
        match best_dist {
            Some(b) if dist < b => {
                best = c;
                best_dist = Some(dist);
            }
            None => {
                best = c;
                best_dist = Some(dist);
            }
            _ => {}
        }
    }
    best
}
