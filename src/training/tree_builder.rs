//! Regression tree construction.

use crate::rng::SeededRng;
use crate::tree::{RegressionTree, TreeNode};
use crate::types::{Point, Shape};

use super::feature_pool::generate_split;
use super::options::TrainingOptions;
use super::sample::TrainingSample;
use super::split::{residual_sums, select_best_split, SplitCandidate};

/// Builds one regression tree over the current residuals.
///
/// Nodes are emitted in pre-order, so every child index is larger than its
/// parent's. Samples are routed with the same `value > threshold` test that
/// [`RegressionTree::predict`] uses.
pub(crate) struct TreeBuilder<'a> {
    samples: &'a [TrainingSample],
    pixel_coordinates: &'a [Point],
    options: &'a TrainingOptions,
    num_landmarks: usize,
    nodes: Vec<TreeNode>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        samples: &'a [TrainingSample],
        pixel_coordinates: &'a [Point],
        options: &'a TrainingOptions,
        num_landmarks: usize,
    ) -> Self {
        Self {
            samples,
            pixel_coordinates,
            options,
            num_landmarks,
            nodes: Vec::new(),
        }
    }

    pub fn build(mut self, rng: &mut SeededRng) -> RegressionTree {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        self.build_node(&mut indices, self.options.tree_depth, rng);
        RegressionTree::new(self.nodes)
    }

    fn build_node(&mut self, indices: &mut [usize], depth_left: u32, rng: &mut SeededRng) -> u32 {
        let node_idx = self.nodes.len() as u32;
        let total = residual_sums(self.samples, indices, self.num_landmarks);

        let split = if depth_left > 0 && indices.len() > 1 {
            let candidates: Vec<SplitCandidate> = (0..self.options.num_test_splits)
                .map(|_| generate_split(rng, self.pixel_coordinates, self.options.lambda_param))
                .collect();
            select_best_split(self.samples, indices, &candidates, &total)
        } else {
            None
        };

        // No usable split (depth reached or every candidate degenerate): leaf
        let Some(split) = split else {
            let delta = self.leaf_delta(indices, &total);
            self.nodes.push(TreeNode::Leaf { delta });
            return node_idx;
        };

        // Reserve the slot; children are appended after it
        self.nodes.push(TreeNode::Leaf {
            delta: Shape::zeros(0),
        });

        let mid = self.partition(indices, &split);
        let (left_indices, right_indices) = indices.split_at_mut(mid);
        let left = self.build_node(left_indices, depth_left - 1, rng);
        let right = self.build_node(right_indices, depth_left - 1, rng);

        self.nodes[node_idx as usize] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        node_idx
    }

    /// Stable partition: samples going left first. Returns the left count.
    fn partition(&self, indices: &mut [usize], split: &SplitCandidate) -> usize {
        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| split.goes_left(&self.samples[i].feature_pixel_values));
        let mid = left.len();
        indices[..mid].copy_from_slice(&left);
        indices[mid..].copy_from_slice(&right);
        mid
    }

    /// Mean residual of the present observations per landmark, scaled by nu.
    fn leaf_delta(&self, indices: &[usize], total: &[[f64; 2]]) -> Shape {
        let mut counts = vec![0usize; self.num_landmarks];
        for &i in indices {
            for (count, &present) in counts.iter_mut().zip(&self.samples[i].present) {
                if present {
                    *count += 1;
                }
            }
        }

        let nu = self.options.nu;
        Shape::new(
            total
                .iter()
                .zip(counts)
                .map(|(sum, count)| {
                    if count == 0 {
                        Point::zero()
                    } else {
                        let scale = nu / count as f64;
                        Point::new((sum[0] * scale) as f32, (sum[1] * scale) as f32)
                    }
                })
                .collect(),
        )
    }
}
