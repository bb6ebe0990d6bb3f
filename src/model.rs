use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::ImageAccess;
use crate::training::PaddingMode;
use crate::tree::CascadeStage;
use crate::types::{BoundingBox, Shape};

const MODEL_MAGIC: [u8; 4] = *b"LERT";
const MODEL_FORMAT_VERSION: u32 = 1;

/// The trained shape predictor.
///
/// The model consists of:
/// - A mean shape (initial estimate), normalized to the object's bounding box
/// - A cascade of stages that iteratively refine the shape
///
/// The model is immutable once built and can be shared across threads;
/// prediction keeps all of its working state on the stack of the caller.
///
/// # Usage
///
/// ```ignore
/// let model = ShapePredictor::load("model.bin")?;
/// let face_rect = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
/// let landmarks = model.predict(&image, &face_rect);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapePredictor {
    /// The mean shape in normalized [0,1] coordinates.
    /// This serves as the initial estimate before cascade refinement.
    mean_shape: Shape,

    /// Cascade stages, applied in order.
    cascade: Vec<CascadeStage>,

    num_landmarks: usize,

    /// How the training feature pools were laid out.
    padding_mode: PaddingMode,
}

/// On-disk envelope of the native format.
#[derive(Serialize)]
struct ModelFileRef<'a> {
    magic: [u8; 4],
    format_version: u32,
    predictor: &'a ShapePredictor,
}

#[derive(Deserialize)]
struct ModelFile {
    magic: [u8; 4],
    format_version: u32,
    predictor: ShapePredictor,
}

/// Persistence formats understood by [`ShapePredictor::open`] and
/// [`ShapePredictor::write_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// bincode envelope written by this crate.
    Native,
    /// dlib's `shape_predictor` serialization, optionally bzip2-compressed.
    Dlib,
}

impl ModelFormat {
    /// `.dat` and `.bz2` files are dlib models, everything else is native.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("dat") | Some("bz2") => ModelFormat::Dlib,
            _ => ModelFormat::Native,
        }
    }
}

impl ShapePredictor {
    /// Create a new shape predictor with the given mean shape and cascade.
    pub fn new(mean_shape: Shape, cascade: Vec<CascadeStage>, padding_mode: PaddingMode) -> Self {
        let num_landmarks = mean_shape.num_landmarks();
        Self {
            mean_shape,
            cascade,
            num_landmarks,
            padding_mode,
        }
    }

    /// Load a model from a native binary file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::ModelLoad(format!("cannot open {}: {}", path.display(), e))
        })?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "loading native model");
        Self::from_bytes(&bytes)
    }

    /// Decode a model from the native binary representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let file: ModelFile = bincode::deserialize(bytes)
            .map_err(|e| Error::ModelLoad(format!("corrupt model file: {}", e)))?;
        if file.magic != MODEL_MAGIC {
            return Err(Error::ModelLoad("not a landmark-ert model file".into()));
        }
        if file.format_version != MODEL_FORMAT_VERSION {
            return Err(Error::ModelLoad(format!(
                "unsupported model format version {} (expected {})",
                file.format_version, MODEL_FORMAT_VERSION
            )));
        }
        file.predictor.validate()?;
        Ok(file.predictor)
    }

    /// Encode the model in the native binary representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&ModelFileRef {
            magic: MODEL_MAGIC,
            format_version: MODEL_FORMAT_VERSION,
            predictor: self,
        })?)
    }

    /// Save the model to a native binary file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a model in the format implied by the file extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match ModelFormat::from_path(path) {
            ModelFormat::Native => Self::load(path),
            ModelFormat::Dlib => crate::dlib::load_dlib_model(path),
        }
    }

    /// Save the model in the format implied by the file extension.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        match ModelFormat::from_path(path) {
            ModelFormat::Native => self.save(path),
            ModelFormat::Dlib => crate::dlib::save_dlib_model(self, path),
        }
    }

    /// Structural consistency check run on every loaded model.
    pub fn validate(&self) -> Result<()> {
        if self.num_landmarks == 0 || self.mean_shape.num_landmarks() != self.num_landmarks {
            return Err(Error::ModelLoad(format!(
                "mean shape has {} landmarks, model declares {}",
                self.mean_shape.num_landmarks(),
                self.num_landmarks
            )));
        }
        if !self.mean_shape.is_finite() {
            return Err(Error::ModelLoad("mean shape is not finite".into()));
        }
        for (i, stage) in self.cascade.iter().enumerate() {
            stage
                .validate(self.num_landmarks)
                .map_err(|e| Error::ModelLoad(format!("cascade stage {}: {}", i, e)))?;
        }
        Ok(())
    }

    /// Get the number of landmarks this model predicts.
    pub fn num_landmarks(&self) -> usize {
        self.num_landmarks
    }

    /// Get the number of cascade stages.
    pub fn num_cascade_stages(&self) -> usize {
        self.cascade.len()
    }

    /// Total number of regression trees across all stages.
    pub fn num_trees(&self) -> usize {
        self.cascade.iter().map(|s| s.trees.len()).sum()
    }

    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    pub fn cascade(&self) -> &[CascadeStage] {
        &self.cascade
    }

    pub fn padding_mode(&self) -> PaddingMode {
        self.padding_mode
    }

    /// A copy of this model keeping only the first `num_stages` stages.
    ///
    /// `truncated(0)` predicts the mean shape placed in the box, which is the
    /// natural baseline for error comparisons.
    pub fn truncated(&self, num_stages: usize) -> Self {
        Self {
            mean_shape: self.mean_shape.clone(),
            cascade: self.cascade.iter().take(num_stages).cloned().collect(),
            num_landmarks: self.num_landmarks,
            padding_mode: self.padding_mode,
        }
    }

    /// Predict landmarks for an object detected in the given bounding box.
    ///
    /// # Arguments
    ///
    /// * `image` - Grayscale image to analyze
    /// * `face_rect` - Bounding box of the detected object
    ///
    /// # Returns
    ///
    /// A `Shape` containing the predicted landmark positions in image coordinates.
    pub fn predict<I: ImageAccess>(&self, image: &I, face_rect: &BoundingBox) -> Shape {
        let normalized = self.predict_normalized(image, face_rect);
        face_rect.denormalize_shape(&normalized)
    }

    /// Run the cascade and return the estimate normalized to `face_rect`.
    pub fn predict_normalized<I: ImageAccess>(&self, image: &I, face_rect: &BoundingBox) -> Shape {
        let mut current_shape = self.mean_shape.clone();

        for stage in &self.cascade {
            // Sample the stage's pixels relative to the estimate at stage entry
            let pixel_values =
                stage
                    .feature_pool
                    .extract(image, face_rect, &current_shape, &self.mean_shape);
            stage.refine(&mut current_shape, &pixel_values);
        }

        current_shape
    }
}

/// Builder for creating a ShapePredictor model.
pub struct ShapePredictorBuilder {
    mean_shape: Option<Shape>,
    cascade: Vec<CascadeStage>,
    padding_mode: PaddingMode,
}

impl ShapePredictorBuilder {
    pub fn new() -> Self {
        Self {
            mean_shape: None,
            cascade: Vec::new(),
            padding_mode: PaddingMode::default(),
        }
    }

    /// Set the mean shape (initial estimate).
    pub fn mean_shape(mut self, shape: Shape) -> Self {
        self.mean_shape = Some(shape);
        self
    }

    /// Add a stage to the cascade.
    pub fn add_cascade_stage(mut self, stage: CascadeStage) -> Self {
        self.cascade.push(stage);
        self
    }

    pub fn padding_mode(mut self, mode: PaddingMode) -> Self {
        self.padding_mode = mode;
        self
    }

    /// Build the ShapePredictor.
    pub fn build(self) -> Result<ShapePredictor> {
        let mean_shape = self
            .mean_shape
            .ok_or_else(|| Error::ModelLoad("Missing mean shape".into()))?;

        if self.cascade.is_empty() {
            return Err(Error::ModelLoad(
                "Cascade must have at least one stage".into(),
            ));
        }

        let model = ShapePredictor::new(mean_shape, self.cascade, self.padding_mode);
        model.validate()?;
        Ok(model)
    }
}

impl Default for ShapePredictorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
