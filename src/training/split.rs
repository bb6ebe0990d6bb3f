//! Split selection for a single tree node.

use rayon::prelude::*;

use crate::tree::SplitFeature;

use super::sample::TrainingSample;

/// A candidate `(feature, threshold)` test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SplitCandidate {
    pub feature: SplitFeature,
    pub threshold: f32,
}

impl SplitCandidate {
    /// Samples whose feature value exceeds the threshold go left.
    #[inline]
    pub fn goes_left(&self, pixel_values: &[f32]) -> bool {
        self.feature.value(pixel_values) > self.threshold
    }
}

/// Per-landmark residual sums of a group of samples.
pub(crate) fn residual_sums(samples: &[TrainingSample], indices: &[usize], num_landmarks: usize) -> Vec<[f64; 2]> {
    let mut sums = vec![[0.0f64; 2]; num_landmarks];
    for &i in indices {
        accumulate(&mut sums, &samples[i]);
    }
    sums
}

#[inline]
fn accumulate(sums: &mut [[f64; 2]], sample: &TrainingSample) {
    for (k, sum) in sums.iter_mut().enumerate() {
        let r = sample.residual(k);
        sum[0] += f64::from(r.x);
        sum[1] += f64::from(r.y);
    }
}

/// Score of a candidate: `|L|^2 / n_L + |R|^2 / n_R` over the residual sums.
///
/// Maximizing it minimizes the summed squared error left after replacing each
/// side by its mean. Returns `None` when either side would be empty.
fn score_split(
    samples: &[TrainingSample],
    indices: &[usize],
    candidate: &SplitCandidate,
    total: &[[f64; 2]],
) -> Option<f64> {
    let mut left = vec![[0.0f64; 2]; total.len()];
    let mut left_count = 0usize;

    for &i in indices {
        let sample = &samples[i];
        if candidate.goes_left(&sample.feature_pixel_values) {
            accumulate(&mut left, sample);
            left_count += 1;
        }
    }

    let right_count = indices.len() - left_count;
    if left_count == 0 || right_count == 0 {
        return None;
    }

    let (left_sq, right_sq) = left.iter().zip(total.iter()).fold(
        (0.0f64, 0.0f64),
        |(l_acc, r_acc), (l, t)| {
            let rx = t[0] - l[0];
            let ry = t[1] - l[1];
            (
                l_acc + l[0] * l[0] + l[1] * l[1],
                r_acc + rx * rx + ry * ry,
            )
        },
    );

    Some(left_sq / left_count as f64 + right_sq / right_count as f64)
}

/// Pick the best candidate for the samples at a node.
///
/// Candidates are scored in parallel; the highest score wins and ties go to
/// the earliest candidate. Candidates that would leave one side empty are
/// skipped, and `None` means every candidate was degenerate, in which case
/// the node must become a leaf.
pub(crate) fn select_best_split(
    samples: &[TrainingSample],
    indices: &[usize],
    candidates: &[SplitCandidate],
    total: &[[f64; 2]],
) -> Option<SplitCandidate> {
    let scores: Vec<Option<f64>> = candidates
        .par_iter()
        .map(|c| score_split(samples, indices, c, total))
        .collect();

    let mut best: Option<(usize, f64)> = None;
    for (i, score) in scores.into_iter().enumerate() {
        if let Some(score) = score {
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((i, score)),
            }
        }
    }

    best.map(|(i, _)| candidates[i])
}
