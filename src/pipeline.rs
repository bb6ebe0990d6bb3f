//! File-level entry points: train a model from a dataset file, evaluate a
//! saved model, predict one object.

use std::path::Path;

use tracing::info;

use crate::dataset::load_image_dataset;
use crate::error::Result;
use crate::features::ImageAccess;
use crate::metrics::{test_shape_predictor, ErrorNormalization};
use crate::model::ShapePredictor;
use crate::training::{ShapePredictorTrainer, TrainingOptions};
use crate::types::{BoundingBox, Shape};

/// Train on an XML dataset and write the model to `output_model_path`.
///
/// Options are validated before anything is read or written, so a
/// [`Config`](crate::Error::Config) error never leaves a model file behind.
/// The output format follows the file extension (see
/// [`ModelFormat`](crate::ModelFormat)).
pub fn train<P, Q>(dataset_path: P, output_model_path: Q, options: TrainingOptions) -> Result<ShapePredictor>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let trainer = ShapePredictorTrainer::new(options)?;
    let dataset = load_image_dataset(dataset_path)?;
    let predictor = trainer.train_dataset(&dataset)?;

    let output_model_path = output_model_path.as_ref();
    predictor.write_to(output_model_path)?;
    info!(path = %output_model_path.display(), "model saved");
    Ok(predictor)
}

/// Mean box-diagonal-normalized landmark error of a saved model on an XML
/// dataset.
pub fn evaluate<P, Q>(dataset_path: P, model_path: Q) -> Result<f64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    evaluate_with(dataset_path, model_path, &ErrorNormalization::BoxDiagonal)
}

/// Like [`evaluate`] with an explicit normalization.
pub fn evaluate_with<P, Q>(
    dataset_path: P,
    model_path: Q,
    normalization: &ErrorNormalization,
) -> Result<f64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let predictor = ShapePredictor::open(model_path)?;
    let dataset = load_image_dataset(dataset_path)?;
    test_shape_predictor(&predictor, dataset.images(), dataset.objects(), normalization)
}

/// Landmarks of the object in `bounding_box`, in image coordinates.
pub fn predict<I: ImageAccess>(image: &I, bounding_box: &BoundingBox, model: &ShapePredictor) -> Shape {
    model.predict(image, bounding_box)
}
