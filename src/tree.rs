use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::FeaturePool;
use crate::types::Shape;

/// A split test comparing two entries of the stage's feature pool.
///
/// The feature value is the intensity difference `I(idx1) - I(idx2)`
/// between the pixels sampled for the two pool entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFeature {
    pub idx1: u32,
    pub idx2: u32,
}

impl SplitFeature {
    /// Feature value for a vector of pool intensities.
    #[inline]
    pub fn value(&self, pixel_values: &[f32]) -> f32 {
        pixel_values[self.idx1 as usize] - pixel_values[self.idx2 as usize]
    }
}

/// A node in the regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Internal split node.
    Split {
        feature: SplitFeature,
        threshold: f32,
        left: u32,
        right: u32,
    },
    /// Leaf node containing shape delta, already scaled by the learning rate.
    Leaf { delta: Shape },
}

/// A single regression tree.
///
/// The tree predicts a shape delta by:
/// 1. Starting at the root node
/// 2. At each split, computing a pixel intensity difference feature
/// 3. Going left if feature > threshold, right otherwise
/// 4. Returning the shape delta at the reached leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    /// Create a new regression tree with the given nodes.
    /// Node 0 is the root.
    pub fn new(nodes: Vec<TreeNode>) -> Self {
        Self { nodes }
    }

    /// Traverse the tree and return a reference to the leaf delta.
    ///
    /// `get_feature` is a closure that computes the pixel intensity difference
    /// for a given split feature and returns the value.
    pub fn predict<F>(&self, get_feature: F) -> &Shape
    where
        F: Fn(&SplitFeature) -> f32,
    {
        let mut node_idx = 0usize;

        loop {
            match &self.nodes[node_idx] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node_idx = if get_feature(feature) > *threshold {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
                TreeNode::Leaf { delta } => {
                    return delta;
                }
            }
        }
    }

    /// Get the number of nodes in the tree.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, TreeNode::Leaf { .. }))
            .count()
    }

    /// Number of split levels on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.depth_from(0)
    }

    fn depth_from(&self, node_idx: usize) -> usize {
        match &self.nodes[node_idx] {
            TreeNode::Split { left, right, .. } => {
                1 + self
                    .depth_from(*left as usize)
                    .max(self.depth_from(*right as usize))
            }
            TreeNode::Leaf { .. } => 0,
        }
    }

    /// Check that every child index points forward into the node list, every
    /// split references the pool, and every leaf has `num_landmarks` finite
    /// points.
    ///
    /// Children must have larger indices than their parent, which rules out
    /// cycles and makes `predict` terminate.
    pub fn validate(&self, num_landmarks: usize, pool_size: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::ModelLoad("regression tree has no nodes".into()));
        }
        let n = self.nodes.len();
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    for child in [*left as usize, *right as usize] {
                        if child <= i || child >= n {
                            return Err(Error::ModelLoad(format!(
                                "node {} has invalid child index {}",
                                i, child
                            )));
                        }
                    }
                    if feature.idx1 as usize >= pool_size || feature.idx2 as usize >= pool_size {
                        return Err(Error::ModelLoad(format!(
                            "node {} references feature ({}, {}) outside pool of {}",
                            i, feature.idx1, feature.idx2, pool_size
                        )));
                    }
                    if threshold.is_nan() {
                        return Err(Error::ModelLoad(format!("node {} has NaN threshold", i)));
                    }
                }
                TreeNode::Leaf { delta } => {
                    if delta.num_landmarks() != num_landmarks {
                        return Err(Error::ModelLoad(format!(
                            "leaf {} has {} landmarks, expected {}",
                            i,
                            delta.num_landmarks(),
                            num_landmarks
                        )));
                    }
                    if !delta.is_finite() {
                        return Err(Error::ModelLoad(format!("leaf {} has a non-finite delta", i)));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One boosting round: the feature pool sampled for this stage and the trees
/// fitted on the residuals at this stage, in training order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStage {
    pub feature_pool: FeaturePool,
    pub trees: Vec<RegressionTree>,
    pub num_landmarks: usize,
}

impl CascadeStage {
    pub fn new(feature_pool: FeaturePool, trees: Vec<RegressionTree>, num_landmarks: usize) -> Self {
        Self {
            feature_pool,
            trees,
            num_landmarks,
        }
    }

    /// Add every tree's leaf delta to `shape`, in training order.
    ///
    /// `pixel_values` are the pool intensities extracted at stage entry.
    pub fn refine(&self, shape: &mut Shape, pixel_values: &[f32]) {
        for tree in &self.trees {
            shape.add_delta(tree.predict(|f| f.value(pixel_values)));
        }
    }

    pub fn validate(&self, num_landmarks: usize) -> Result<()> {
        if self.num_landmarks != num_landmarks {
            return Err(Error::ModelLoad(format!(
                "stage declares {} landmarks, model has {}",
                self.num_landmarks, num_landmarks
            )));
        }
        if self.feature_pool.anchor_idx.len() != self.feature_pool.deltas.len() {
            return Err(Error::ModelLoad(
                "feature pool anchor and offset counts differ".into(),
            ));
        }
        if let Some(&bad) = self
            .feature_pool
            .anchor_idx
            .iter()
            .find(|&&a| a as usize >= num_landmarks)
        {
            return Err(Error::ModelLoad(format!(
                "feature anchor {} out of range for {} landmarks",
                bad, num_landmarks
            )));
        }
        if self
            .feature_pool
            .deltas
            .iter()
            .any(|d| !(d.x.is_finite() && d.y.is_finite()))
        {
            return Err(Error::ModelLoad("feature pool offset is not finite".into()));
        }
        for tree in &self.trees {
            tree.validate(num_landmarks, self.feature_pool.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn stump(left: f32, right: f32) -> RegressionTree {
        //        [0: split]
        //       /          \
        //   [1: leaf]   [2: leaf]
        RegressionTree::new(vec![
            TreeNode::Split {
                feature: SplitFeature { idx1: 0, idx2: 1 },
                threshold: 50.0,
                left: 1,
                right: 2,
            },
            TreeNode::Leaf {
                delta: Shape::new(vec![Point::new(left, left)]),
            },
            TreeNode::Leaf {
                delta: Shape::new(vec![Point::new(right, right)]),
            },
        ])
    }

    #[test]
    fn simple_tree_traversal() {
        let tree = stump(-0.1, 0.1);

        // Feature value > threshold => go left
        let result = tree.predict(|_| 100.0);
        assert_eq!(result[0].x, -0.1);

        // Feature value <= threshold => go right
        let result = tree.predict(|_| 50.0);
        assert_eq!(result[0].x, 0.1);

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.num_leaves(), 2);
    }

    #[test]
    fn stage_adds_every_tree_delta() {
        let pool = FeaturePool::new(vec![0, 0], vec![Point::zero(), Point::zero()]);
        let stage = CascadeStage::new(pool, vec![stump(0.1, -0.1), stump(0.3, -0.3)], 1);

        // 200 - 100 = 100 > 50: both trees go left
        let mut shape = Shape::new(vec![Point::new(1.0, 1.0)]);
        stage.refine(&mut shape, &[200.0, 100.0]);
        assert!((shape[0].x - 1.4).abs() < 1e-6);

        // 0 - 100 = -100: both go right
        let mut shape = Shape::zeros(1);
        stage.refine(&mut shape, &[0.0, 100.0]);
        assert!((shape[0].y + 0.4).abs() < 1e-6);
    }

    #[test]
    fn validation_rejects_backward_children() {
        let mut tree = stump(0.0, 0.0);
        if let TreeNode::Split { left, .. } = &mut tree.nodes[0] {
            *left = 0;
        }
        assert!(matches!(tree.validate(1, 2), Err(Error::ModelLoad(_))));
    }

    #[test]
    fn validation_rejects_wrong_leaf_size() {
        let tree = stump(0.0, 0.0);
        assert!(tree.validate(1, 2).is_ok());
        assert!(matches!(tree.validate(2, 2), Err(Error::ModelLoad(_))));
        assert!(matches!(tree.validate(1, 1), Err(Error::ModelLoad(_))));
    }

    #[test]
    fn validation_rejects_non_finite_leaves() {
        for bad in [f32::INFINITY, f32::NEG_INFINITY, f32::NAN] {
            let tree = stump(0.0, bad);
            assert!(matches!(tree.validate(1, 2), Err(Error::ModelLoad(_))));
        }
    }
}
