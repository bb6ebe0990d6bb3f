//! # landmark-ert
//!
//! Training and inference of ensemble-of-regression-trees shape predictors,
//! the method of "One Millisecond Face Alignment with an Ensemble of
//! Regression Trees" (Kazemi & Sullivan, 2014).
//!
//! A predictor places a fixed set of landmarks on an object given its
//! bounding box. It is usually trained on faces but works for any annotated
//! shape.
//!
//! ## Algorithm Overview
//!
//! 1. Start with the mean shape placed in the bounding box
//! 2. For each cascade stage:
//!    - Sample the stage's pixels relative to the current shape estimate
//!    - Each regression tree compares pixel pairs down to a leaf
//!    - Add every leaf's shape delta to the estimate
//! 3. Return the refined landmarks
//!
//! Training fits the trees by gradient boosting on the landmark residuals
//! (see [`ShapePredictorTrainer`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use landmark_ert::{
//!     BoundingBox, GrayImage, ObjectDetection, Point, ShapePredictorTrainer, TrainingOptions,
//! };
//!
//! let images = vec![GrayImage::from_fn(64, 64, |x, y| ((x * 3 + y) % 256) as u8)];
//! let rect = BoundingBox::new(8.0, 8.0, 48.0, 48.0);
//! let objects = vec![vec![ObjectDetection::new(
//!     rect,
//!     vec![Some(Point::new(20.0, 24.0)), Some(Point::new(44.0, 24.0))],
//! )]];
//!
//! let options = TrainingOptions {
//!     cascade_depth: 2,
//!     num_trees_per_cascade_level: 10,
//!     oversampling_amount: 2,
//!     feature_pool_size: 50,
//!     ..Default::default()
//! };
//! let trainer = ShapePredictorTrainer::new(options).unwrap();
//! let model = trainer.train(&images, &objects).unwrap();
//!
//! let landmarks = model.predict(&images[0], &rect);
//! assert_eq!(landmarks.num_landmarks(), 2);
//! ```
//!
//! ## Custom Image Types
//!
//! Implement the [`ImageAccess`] trait for your own image types:
//!
//! ```rust
//! use landmark_ert::ImageAccess;
//!
//! struct MyImage { /* ... */ }
//!
//! impl ImageAccess for MyImage {
//!     fn get_pixel(&self, x: i32, y: i32) -> u8 {
//!         // Return grayscale intensity at (x, y)
//!         // Return 0 for out-of-bounds
//!         0
//!     }
//!     fn width(&self) -> u32 { 640 }
//!     fn height(&self) -> u32 { 480 }
//! }
//! ```

mod dataset;
pub mod dlib;
mod error;
mod features;
mod metrics;
mod model;
mod pipeline;
mod rng;
pub mod training;
mod tree;
mod types;

pub use dataset::{load_image_dataset, Dataset, ObjectDetection};
pub use error::{Error, Result};
pub use features::{find_similarity_transform, FeaturePool, GrayImage, ImageAccess, SimilarityTransform2D};
pub use metrics::{stage_error_curve, test_shape_predictor, ErrorNormalization};
pub use model::{ModelFormat, ShapePredictor, ShapePredictorBuilder};
pub use pipeline::{evaluate, evaluate_with, predict, train};
pub use rng::SeededRng;
pub use training::{PaddingMode, ShapePredictorTrainer, TrainingOptions};
pub use tree::{CascadeStage, RegressionTree, SplitFeature, TreeNode};
pub use types::{BoundingBox, Point, Shape};
