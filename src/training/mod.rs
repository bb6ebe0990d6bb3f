//! Shape predictor training.
//!
//! - [`TrainingOptions`]: validated configuration
//! - [`ShapePredictorTrainer`]: the cascade trainer
//!
//! The remaining modules are internal stages of the pipeline: the sample
//! store, the feature pool sampler, the split selector and the tree builder.

mod feature_pool;
mod options;
mod sample;
mod split;
mod tree_builder;
mod trainer;

pub use options::{PaddingMode, TrainingOptions, MAX_TREE_DEPTH};
pub use trainer::ShapePredictorTrainer;
