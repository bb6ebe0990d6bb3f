//! Cascade trainer.
//!
//! Training runs through four phases:
//!
//! 1. **Init**: compute the mean shape and build the oversampled sample
//!    store, every estimate starting from the mean (or a random blend).
//! 2. **Stage**: sample a feature pool around the mean shape, read every
//!    sample's pool intensities at its current estimate, then fit
//!    `num_trees_per_cascade_level` trees one after another. Each tree is
//!    applied to all samples before the next one is fitted.
//! 3. **Stage complete**: freeze the stage; the next stage samples a fresh
//!    pool because the estimates have moved.
//! 4. **Done**: after `cascade_depth` stages, assemble the predictor.
//!
//! # Example
//!
//! ```ignore
//! use landmark_ert::{ShapePredictorTrainer, TrainingOptions};
//!
//! let options = TrainingOptions { tree_depth: 3, nu: 0.05, ..Default::default() };
//! let trainer = ShapePredictorTrainer::new(options)?;
//! let predictor = trainer.train(&images, &objects)?;
//! ```

use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info};

use crate::dataset::{Dataset, ObjectDetection};
use crate::error::{Error, Result};
use crate::features::{FeaturePool, ImageAccess};
use crate::model::ShapePredictor;
use crate::rng::SeededRng;
use crate::tree::CascadeStage;
use crate::types::Shape;

use super::feature_pool::sample_pixel_coordinates;
use super::options::TrainingOptions;
use super::sample::{build_samples, mean_training_error, TrainingSample};
use super::tree_builder::TreeBuilder;

macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Trains [`ShapePredictor`]s with a fixed, validated set of options.
#[derive(Debug, Clone)]
pub struct ShapePredictorTrainer {
    options: TrainingOptions,
}

impl ShapePredictorTrainer {
    /// Validate `options` and create a trainer owning them.
    pub fn new(options: TrainingOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &TrainingOptions {
        &self.options
    }

    /// Train on an in-memory dataset.
    pub fn train_dataset(&self, dataset: &Dataset) -> Result<ShapePredictor> {
        self.train(dataset.images(), dataset.objects())
    }

    /// Train a predictor.
    ///
    /// `objects[i]` holds the annotated objects of `images[i]`; part
    /// coordinates are in image space and every object must have the same
    /// number of parts.
    pub fn train<I>(&self, images: &[I], objects: &[Vec<ObjectDetection>]) -> Result<ShapePredictor>
    where
        I: ImageAccess + Sync,
    {
        if images.len() != objects.len() {
            return Err(Error::Dataset(format!(
                "{} images but {} object lists",
                images.len(),
                objects.len()
            )));
        }

        // Threading contract:
        // - num_threads == 0: use rayon's global pool
        // - num_threads > 0: dedicated pool for this training session
        match self.options.num_threads {
            0 => self.train_impl(images, objects),
            n => {
                let pool = ThreadPoolBuilder::new().num_threads(n).build()?;
                pool.install(|| self.train_impl(images, objects))
            }
        }
    }

    fn train_impl<I>(&self, images: &[I], objects: &[Vec<ObjectDetection>]) -> Result<ShapePredictor>
    where
        I: ImageAccess + Sync,
    {
        let options = &self.options;
        let verbose = options.be_verbose;
        let started = Instant::now();
        let mut rng = SeededRng::from_seed_str(&options.random_seed);

        let (mean_shape, mut samples) = build_samples(objects, options, &mut rng)?;
        let num_landmarks = mean_shape.num_landmarks();

        progress!(
            verbose,
            samples = samples.len(),
            landmarks = num_landmarks,
            stages = options.cascade_depth,
            trees_per_stage = options.num_trees_per_cascade_level,
            tree_depth = options.tree_depth,
            "starting shape predictor training"
        );
        progress!(
            verbose,
            error = mean_training_error(&samples),
            "initial mean training error"
        );

        let mut cascade = Vec::with_capacity(options.cascade_depth as usize);
        for stage_idx in 0..options.cascade_depth {
            let stage = self.train_stage(images, &mean_shape, &mut samples, &mut rng);
            progress!(
                verbose,
                stage = stage_idx + 1,
                of = options.cascade_depth,
                error = mean_training_error(&samples),
                elapsed_s = started.elapsed().as_secs_f64(),
                "cascade stage complete"
            );
            cascade.push(stage);
        }

        progress!(
            verbose,
            elapsed_s = started.elapsed().as_secs_f64(),
            "training complete"
        );

        Ok(ShapePredictor::new(mean_shape, cascade, options.padding_mode))
    }

    fn train_stage<I>(
        &self,
        images: &[I],
        mean_shape: &Shape,
        samples: &mut [TrainingSample],
        rng: &mut SeededRng,
    ) -> CascadeStage
    where
        I: ImageAccess + Sync,
    {
        let options = &self.options;
        let num_landmarks = mean_shape.num_landmarks();

        let pixel_coordinates = sample_pixel_coordinates(mean_shape, options, rng);
        let feature_pool = FeaturePool::encode(mean_shape, &pixel_coordinates);

        samples.par_iter_mut().for_each(|sample| {
            sample.feature_pixel_values = feature_pool.extract(
                &images[sample.image_idx],
                &sample.rect,
                &sample.current_shape,
                mean_shape,
            );
        });

        let mut trees = Vec::with_capacity(options.num_trees_per_cascade_level as usize);
        for _ in 0..options.num_trees_per_cascade_level {
            let tree = TreeBuilder::new(samples, &pixel_coordinates, options, num_landmarks).build(rng);

            // Scoring is finished; each sample now moves by its own leaf
            samples.par_iter_mut().for_each(|sample| {
                let delta = tree.predict(|f| f.value(&sample.feature_pixel_values));
                sample.current_shape.add_delta(delta);
            });

            trees.push(tree);
        }

        CascadeStage::new(feature_pool, trees, num_landmarks)
    }
}
