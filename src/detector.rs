use super::{
    bounding_box::Detection,
    decoder::ClassMode,
    postprocess::{DecodeStats, PostProcessor},
};
use candle_core::Tensor;
use kornia_image::ImageSize;
use serde::{Deserialize, Serialize};

/// Detection error enum.
#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    /// The raw output tensor does not have a decodable shape.
    #[error("Malformed output tensor: {0}")]
    MalformedTensor(String),

    /// A size, threshold or input tensor is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal candle error, including inference backend failures.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),
}

/// Label of the single class the tea leaf model is trained on.
pub const DEFAULT_CLASS_NAME: &str = "cacar daun";

/// Detector configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Side length of the square model input, in pixels
    pub input_resolution: usize,
    /// Minimum confidence for a prediction to be kept, inclusive
    pub confidence_threshold: f32,
    /// IoU above which a lower confidence box is suppressed
    pub iou_threshold: f32,
    /// Boxes must be strictly wider and taller than this, in image pixels
    pub min_box_size: f32,
    /// How class indices are resolved
    pub class_mode: ClassMode,
    /// Label table indexed by class id
    pub class_names: Vec<String>,
}

/// Default configuration, tuned for recall on the single-class model.
impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_resolution: 640,
            confidence_threshold: 0.10,
            iou_threshold: 0.5,
            min_box_size: 5.0,
            class_mode: ClassMode::Single,
            class_names: vec![DEFAULT_CLASS_NAME.to_string()],
        }
    }
}

impl DetectorConfig {
    /// Check every field is in range.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.input_resolution == 0 {
            return Err(DetectError::InvalidArgument(
                "input resolution must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DetectError::InvalidArgument(format!(
                "confidence threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(DetectError::InvalidArgument(format!(
                "IoU threshold must be in [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if !self.min_box_size.is_finite() || self.min_box_size < 0.0 {
            return Err(DetectError::InvalidArgument(format!(
                "minimum box size must be finite and non-negative, got {}",
                self.min_box_size
            )));
        }
        Ok(())
    }
}

/// Inference runtime seen as a black box.
///
/// Implementations own their session. [`Detector`] calls [`release`] exactly
/// once, when it is closed or dropped.
///
/// [`release`]: InferenceBackend::release
pub trait InferenceBackend {
    /// Run the model on a preprocessed `(1, 3, S, S)` input and return its raw
    /// `(1, D1, D2)` output.
    fn run(&mut self, input: &Tensor) -> candle_core::Result<Tensor>;

    /// Free the session.
    fn release(&mut self) {}
}

/// Detector high level interface.
///
/// Owns the inference backend for its whole lifetime.
pub struct Detector<B: InferenceBackend> {
    postprocessor: PostProcessor,
    backend: B,
    released: bool,
}

impl<B: InferenceBackend> Detector<B> {
    /// Create a new detector around an acquired backend
    ///
    /// The backend is released before returning if the config is invalid.
    pub fn new(mut backend: B, config: DetectorConfig) -> Result<Self, DetectError> {
        let postprocessor = match PostProcessor::new(config) {
            Ok(postprocessor) => postprocessor,
            Err(e) => {
                tracing::warn!("Releasing inference backend, invalid config: {}", e);
                backend.release();
                return Err(e);
            }
        };
        tracing::info!(
            "Detector ready: input {}x{}, confidence >= {}, IoU > {}",
            postprocessor.config().input_resolution,
            postprocessor.config().input_resolution,
            postprocessor.config().confidence_threshold,
            postprocessor.config().iou_threshold
        );
        Ok(Self {
            postprocessor,
            backend,
            released: false,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &DetectorConfig {
        self.postprocessor.config()
    }

    /// Perform inference on a preprocessed input tensor
    pub fn detect(
        &mut self,
        input: &Tensor,
        original: ImageSize,
    ) -> Result<Vec<Detection>, DetectError> {
        self.detect_with_stats(input, original)
            .map(|(detections, _)| detections)
    }

    /// Perform inference and also return the decode statistics
    pub fn detect_with_stats(
        &mut self,
        input: &Tensor,
        original: ImageSize,
    ) -> Result<(Vec<Detection>, DecodeStats), DetectError> {
        self.check_input(input)?;
        tracing::debug!("Image size: {}x{}", original.width, original.height);

        let output = self.backend.run(input)?;

        let (detections, stats) = self.postprocessor.process_with_stats(&output, original)?;
        tracing::debug!("Found {} detections", detections.len());
        Ok((detections, stats))
    }

    /// Release the backend now instead of on drop.
    pub fn close(mut self) {
        self.release();
    }

    fn check_input(&self, input: &Tensor) -> Result<(), DetectError> {
        let s = self.config().input_resolution;
        if input.dims() != [1, 3, s, s] {
            return Err(DetectError::InvalidArgument(format!(
                "expected input of shape [1, 3, {s}, {s}], got {:?}",
                input.dims()
            )));
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            tracing::info!("Releasing inference backend");
            self.backend.release();
            self.released = true;
        }
    }
}

impl<B: InferenceBackend> Drop for Detector<B> {
    fn drop(&mut self) {
        self.release();
    }
}
