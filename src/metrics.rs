//! Landmark error measurement.
//!
//! The error of one landmark is its Euclidean distance to the ground truth
//! divided by a per-object scale chosen by [`ErrorNormalization`]. The
//! reported error is the mean over every present landmark of every object;
//! missing landmarks are skipped.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{Dataset, ObjectDetection};
use crate::error::{Error, Result};
use crate::features::ImageAccess;
use crate::model::ShapePredictor;
use crate::types::{Point, Shape};

/// Per-object scale applied to landmark distances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorNormalization {
    /// Raw pixel distances.
    Pixels,
    /// Distances divided by the diagonal of the ground-truth box.
    #[default]
    BoxDiagonal,
    /// Distances divided by the distance between the centroids of two
    /// landmark groups of the ground truth (usually the eyes).
    InterOcular { left: Vec<usize>, right: Vec<usize> },
}

impl ErrorNormalization {
    /// Inter-ocular normalization for the iBUG 68-point markup.
    pub fn inter_ocular_68() -> Self {
        ErrorNormalization::InterOcular {
            left: (36..=41).collect(),
            right: (42..=47).collect(),
        }
    }

    fn check(&self, num_landmarks: usize) -> Result<()> {
        if let ErrorNormalization::InterOcular { left, right } = self {
            if left.is_empty() || right.is_empty() {
                return Err(Error::config(
                    "normalization",
                    "inter-ocular landmark groups must not be empty",
                ));
            }
            if let Some(&bad) = left.iter().chain(right).find(|&&i| i >= num_landmarks) {
                return Err(Error::config(
                    "normalization",
                    format!(
                        "landmark {} out of range for a {}-landmark model",
                        bad, num_landmarks
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Scale of one object, `None` when it cannot be computed.
    fn scale(&self, object: &ObjectDetection) -> Option<f32> {
        let scale = match self {
            ErrorNormalization::Pixels => 1.0,
            ErrorNormalization::BoxDiagonal => object.rect.diagonal(),
            ErrorNormalization::InterOcular { left, right } => {
                let l = centroid(&object.parts, left)?;
                let r = centroid(&object.parts, right)?;
                l.distance(&r)
            }
        };
        (scale > 0.0 && scale.is_finite()).then_some(scale)
    }
}

fn centroid(parts: &[Option<Point>], group: &[usize]) -> Option<Point> {
    let present: Vec<Point> = group.iter().filter_map(|&i| parts[i]).collect();
    if present.is_empty() {
        return None;
    }
    let sum = present.iter().fold(Point::zero(), |acc, &p| acc + p);
    Some(sum * (1.0 / present.len() as f32))
}

/// Sum of normalized errors and number of present landmarks of one object.
fn object_error(predicted: &Shape, object: &ObjectDetection, scale: f32) -> (f64, usize) {
    predicted
        .points
        .iter()
        .zip(&object.parts)
        .filter_map(|(p, truth)| truth.map(|t| f64::from(p.distance(&t) / scale)))
        .fold((0.0, 0), |(sum, n), e| (sum + e, n + 1))
}

/// Mean normalized landmark error of `predictor` over annotated objects.
///
/// `objects[i]` holds the objects of `images[i]`. Objects are evaluated in
/// parallel; the result does not depend on the thread count.
pub fn test_shape_predictor<I>(
    predictor: &ShapePredictor,
    images: &[I],
    objects: &[Vec<ObjectDetection>],
    normalization: &ErrorNormalization,
) -> Result<f64>
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
    let num_landmarks = predictor.num_landmarks();
    normalization.check(num_landmarks)?;

    let flat: Vec<(usize, &ObjectDetection)> = objects
        .iter()
        .enumerate()
        .flat_map(|(i, objs)| objs.iter().map(move |o| (i, o)))
        .collect();

    for (i, (_, object)) in flat.iter().enumerate() {
        if object.num_parts() != num_landmarks {
            return Err(Error::Dataset(format!(
                "object {} has {} landmarks but the model predicts {}",
                i,
                object.num_parts(),
                num_landmarks
            )));
        }
    }

    let per_object: Vec<Result<(f64, usize)>> = flat
        .par_iter()
        .enumerate()
        .map(|(i, &(image_idx, object))| {
            let scale = normalization.scale(object).ok_or_else(|| {
                Error::Dataset(format!(
                    "object {} has no usable {:?} scale",
                    i, normalization
                ))
            })?;
            let predicted = predictor.predict(&images[image_idx], &object.rect);
            Ok(object_error(&predicted, object, scale))
        })
        .collect();

    let mut total = 0.0f64;
    let mut count = 0usize;
    for result in per_object {
        let (sum, n) = result?;
        total += sum;
        count += n;
    }

    if count == 0 {
        return Err(Error::Dataset("no annotated landmarks to evaluate".into()));
    }

    let error = total / count as f64;
    debug!(
        objects = flat.len(),
        landmarks = count,
        error,
        "evaluated shape predictor"
    );
    Ok(error)
}

/// Error after each prefix of the cascade: element `k` is the error of the
/// first `k` stages, element 0 being the mean-shape baseline.
pub fn stage_error_curve(
    predictor: &ShapePredictor,
    dataset: &Dataset,
    normalization: &ErrorNormalization,
) -> Result<Vec<f64>> {
    (0..=predictor.num_cascade_stages())
        .map(|k| {
            test_shape_predictor(
                &predictor.truncated(k),
                dataset.images(),
                dataset.objects(),
                normalization,
            )
        })
        .collect()
}
