//! Training configuration.
//!
//! [`TrainingOptions`] is a plain parameter struct with public fields and
//! defaults matching dlib's trainer. It is validated once, when a
//! [`ShapePredictorTrainer`](super::ShapePredictorTrainer) takes ownership of
//! it; the trainer never mutates its copy afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest supported tree depth (2^16 leaves per tree).
pub const MAX_TREE_DEPTH: u32 = 16;

/// Region from which feature pool pixels are drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Bounding rectangle of the mean shape's landmarks, grown by the padding.
    #[default]
    LandmarkRelative,
    /// The unit (bounding-box) square, grown by the padding.
    BoundingBoxRelative,
}

/// Parameters for shape predictor training.
///
/// Use struct construction with `..Default::default()` for convenient configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    // --- Cascade structure ---
    /// Number of cascade stages.
    pub cascade_depth: u32,
    /// Depth of every regression tree (number of split levels).
    pub tree_depth: u32,
    /// Trees fitted per cascade stage.
    pub num_trees_per_cascade_level: u32,
    /// Shrinkage applied to every leaf delta, in (0, 1].
    pub nu: f64,

    // --- Oversampling ---
    /// Number of randomly initialized copies of every training object.
    pub oversampling_amount: u32,
    /// Maximum box translation of oversampled copies, as a fraction of the
    /// box size. 0 disables jitter.
    pub oversampling_translation_jitter: f64,

    // --- Features ---
    /// Pixel locations sampled per cascade stage.
    pub feature_pool_size: u32,
    /// Padding around the sampling region, in normalized box units.
    pub feature_pool_region_padding: f64,
    /// Decay of the distance prior on split pixel pairs.
    pub lambda_param: f64,
    /// Candidate splits scored per tree node.
    pub num_test_splits: u32,
    pub padding_mode: PaddingMode,

    // --- Reproducibility & resources ---
    pub random_seed: String,
    /// Worker threads; 0 uses rayon's global pool.
    pub num_threads: usize,

    // --- Logging ---
    /// Log per-stage progress at `info` level instead of `debug`.
    pub be_verbose: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            cascade_depth: 10,
            tree_depth: 4,
            num_trees_per_cascade_level: 500,
            nu: 0.1,
            oversampling_amount: 20,
            oversampling_translation_jitter: 0.0,
            feature_pool_size: 400,
            feature_pool_region_padding: 0.0,
            lambda_param: 0.1,
            num_test_splits: 20,
            padding_mode: PaddingMode::LandmarkRelative,
            random_seed: String::new(),
            num_threads: 0,
            be_verbose: false,
        }
    }
}

impl TrainingOptions {
    /// Check every option against its valid range.
    ///
    /// The first failing option is reported by name.
    pub fn validate(&self) -> Result<()> {
        if self.cascade_depth == 0 {
            return Err(Error::config("cascade_depth", "must be at least 1"));
        }
        if self.tree_depth == 0 || self.tree_depth > MAX_TREE_DEPTH {
            return Err(Error::config(
                "tree_depth",
                format!("must be in 1..={}, got {}", MAX_TREE_DEPTH, self.tree_depth),
            ));
        }
        if self.num_trees_per_cascade_level == 0 {
            return Err(Error::config(
                "num_trees_per_cascade_level",
                "must be at least 1",
            ));
        }
        if !(self.nu > 0.0 && self.nu <= 1.0) {
            return Err(Error::config(
                "nu",
                format!("must be in (0, 1], got {}", self.nu),
            ));
        }
        if self.oversampling_amount == 0 {
            return Err(Error::config("oversampling_amount", "must be at least 1"));
        }
        if !(self.oversampling_translation_jitter >= 0.0
            && self.oversampling_translation_jitter.is_finite())
        {
            return Err(Error::config(
                "oversampling_translation_jitter",
                format!(
                    "must be finite and >= 0, got {}",
                    self.oversampling_translation_jitter
                ),
            ));
        }
        if self.feature_pool_size < 2 {
            return Err(Error::config(
                "feature_pool_size",
                format!("must be at least 2, got {}", self.feature_pool_size),
            ));
        }
        if !(self.feature_pool_region_padding > -0.5
            && self.feature_pool_region_padding.is_finite())
        {
            return Err(Error::config(
                "feature_pool_region_padding",
                format!(
                    "must be finite and > -0.5, got {}",
                    self.feature_pool_region_padding
                ),
            ));
        }
        if !(self.lambda_param > 0.0 && self.lambda_param.is_finite()) {
            return Err(Error::config(
                "lambda_param",
                format!("must be finite and > 0, got {}", self.lambda_param),
            ));
        }
        if self.num_test_splits == 0 {
            return Err(Error::config("num_test_splits", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_option(options: TrainingOptions) -> &'static str {
        match options.validate() {
            Err(Error::Config { option, .. }) => option,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(TrainingOptions::default().validate().is_ok());
    }

    #[test]
    fn reports_the_failing_option() {
        let base = TrainingOptions::default();
        assert_eq!(failing_option(TrainingOptions { nu: 0.0, ..base.clone() }), "nu");
        assert_eq!(failing_option(TrainingOptions { nu: 1.5, ..base.clone() }), "nu");
        assert_eq!(
            failing_option(TrainingOptions { nu: f64::NAN, ..base.clone() }),
            "nu"
        );
        assert_eq!(
            failing_option(TrainingOptions { tree_depth: 0, ..base.clone() }),
            "tree_depth"
        );
        assert_eq!(
            failing_option(TrainingOptions { cascade_depth: 0, ..base.clone() }),
            "cascade_depth"
        );
        assert_eq!(
            failing_option(TrainingOptions { feature_pool_size: 1, ..base.clone() }),
            "feature_pool_size"
        );
        assert_eq!(
            failing_option(TrainingOptions { lambda_param: 0.0, ..base.clone() }),
            "lambda_param"
        );
        assert_eq!(
            failing_option(TrainingOptions {
                feature_pool_region_padding: -0.5,
                ..base.clone()
            }),
            "feature_pool_region_padding"
        );
        assert_eq!(
            failing_option(TrainingOptions {
                oversampling_translation_jitter: -0.1,
                ..base
            }),
            "oversampling_translation_jitter"
        );
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let options: TrainingOptions =
            serde_json::from_str(r#"{ "tree_depth": 5, "nu": 0.05, "padding_mode": "bounding_box_relative" }"#)
                .unwrap();
        assert_eq!(options.tree_depth, 5);
        assert_eq!(options.nu, 0.05);
        assert_eq!(options.padding_mode, PaddingMode::BoundingBoxRelative);
        assert_eq!(options.cascade_depth, 10);
        assert_eq!(options.num_trees_per_cascade_level, 500);
    }
}
