use candle_core::Tensor;
use kornia_image::ImageSize;
use serde::Serialize;

use super::{
    bounding_box::{Detection, non_maximum_suppression},
    decoder::{Decoded, Layout, OutputRows, decode, decode_tensor},
    detector::{DetectError, DetectorConfig},
    mapper::Mapper,
};

/// Number of raw confidences reported in [`DecodeStats::top_scores`].
pub const TOP_SCORES: usize = 10;

/// Counters collected while post-processing one output, for threshold calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeStats {
    /// Detected tensor layout.
    pub layout: Layout,
    /// Candidates decoded from the tensor.
    pub raw_candidates: usize,
    /// Row-major rows skipped as truncated.
    pub skipped_rows: usize,
    /// Candidates at or above the confidence threshold.
    pub above_threshold: usize,
    /// Detections that also passed the size filter, before NMS.
    pub before_nms: usize,
    /// Detections kept by NMS.
    pub kept: usize,
    /// Highest raw confidences with their candidate index, descending.
    pub top_scores: Vec<(f32, usize)>,
}

/// Decode, filter and suppress pipeline over raw model outputs.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    config: DetectorConfig,
}

impl PostProcessor {
    /// Create a post-processor, validating the configuration.
    pub fn new(config: DetectorConfig) -> Result<Self, DetectError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The active configuration.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Post-process a `(1, D1, D2)` output tensor into detections ordered by
    /// descending confidence.
    pub fn process(
        &self,
        output: &Tensor,
        original: ImageSize,
    ) -> Result<Vec<Detection>, DetectError> {
        self.process_with_stats(output, original)
            .map(|(detections, _)| detections)
    }

    /// Like [`PostProcessor::process`], also returning the decode statistics.
    pub fn process_with_stats(
        &self,
        output: &Tensor,
        original: ImageSize,
    ) -> Result<(Vec<Detection>, DecodeStats), DetectError> {
        let mapper = Mapper::new(original, &self.config)?;
        let decoded = decode_tensor(output, self.config.class_mode)
            .inspect_err(|e| tracing::warn!("Rejected model output: {}", e))?;
        Ok(self.finish(decoded, &mapper))
    }

    /// Post-process already batch-squeezed rows, e.g. a nested array handed
    /// over by a runtime binding.
    pub fn process_rows<R: OutputRows + ?Sized>(
        &self,
        rows: &R,
        original: ImageSize,
    ) -> Result<(Vec<Detection>, DecodeStats), DetectError> {
        let mapper = Mapper::new(original, &self.config)?;
        let decoded = decode(rows, self.config.class_mode)
            .inspect_err(|e| tracing::warn!("Rejected model output: {}", e))?;
        Ok(self.finish(decoded, &mapper))
    }

    fn finish(&self, decoded: Decoded, mapper: &Mapper<'_>) -> (Vec<Detection>, DecodeStats) {
        let mut top_scores: Vec<(f32, usize)> = decoded
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.confidence, i))
            .collect();
        top_scores.sort_by(|a, b| b.0.total_cmp(&a.0));
        top_scores.truncate(TOP_SCORES);
        tracing::debug!("Top {} raw confidence scores: {:?}", TOP_SCORES, top_scores);

        let above_threshold = decoded
            .candidates
            .iter()
            .filter(|c| mapper.accepts_confidence(c))
            .count();
        let boxes: Vec<Detection> = decoded
            .candidates
            .iter()
            .filter_map(|c| mapper.map(c))
            .collect();
        let before_nms = boxes.len();
        tracing::debug!("Found {} detections before NMS", before_nms);

        let detections = non_maximum_suppression(boxes, self.config.iou_threshold);

        let stats = DecodeStats {
            layout: decoded.layout,
            raw_candidates: decoded.candidates.len(),
            skipped_rows: decoded.skipped_rows,
            above_threshold,
            before_nms,
            kept: detections.len(),
            top_scores,
        };
        (detections, stats)
    }
}

/// Decode a raw YOLOv8 output tensor and suppress overlapping boxes.
///
/// Uses the default single-class labels and minimum box size.
///
/// # Arguments
///
/// * `output` - The raw `(1, D1, D2)` output tensor.
/// * `original_width` - Width of the original image, in pixels.
/// * `original_height` - Height of the original image, in pixels.
/// * `input_resolution` - Side length of the square model input.
/// * `confidence_threshold` - Minimum confidence, inclusive.
/// * `iou_threshold` - The IoU threshold for suppression.
///
/// # Errors
///
/// [`DetectError::MalformedTensor`] when the tensor cannot be decoded and
/// [`DetectError::InvalidArgument`] for out of range sizes or thresholds. A
/// valid tensor without detections yields an empty vector.
pub fn decode_and_suppress(
    output: &Tensor,
    original_width: usize,
    original_height: usize,
    input_resolution: usize,
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<Detection>, DetectError> {
    let config = DetectorConfig {
        input_resolution,
        confidence_threshold,
        iou_threshold,
        ..Default::default()
    };
    PostProcessor::new(config)?.process(
        output,
        ImageSize {
            width: original_width,
            height: original_height,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn size(width: usize, height: usize) -> ImageSize {
        ImageSize { width, height }
    }

    #[test]
    fn test_process_rows_filters_confidence() -> Result<(), Box<dyn std::error::Error>> {
        let rows = vec![
            vec![100.0, 100.0, 50.0, 50.0, 0.9, 0.0],
            vec![300.0, 300.0, 50.0, 50.0, 0.05, 0.0],
            vec![500.0, 500.0, 50.0, 50.0, 0.5, 0.0],
        ];
        let processor = PostProcessor::new(DetectorConfig::default())?;

        let (detections, stats) = processor.process_rows(rows.as_slice(), size(640, 640))?;

        assert_eq!(stats.raw_candidates, 3);
        assert_eq!(stats.above_threshold, 2);
        assert_eq!(stats.before_nms, 2);
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.top_scores, vec![(0.9, 0), (0.5, 2), (0.05, 1)]);
        let confidences: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.5]);
        Ok(())
    }

    #[test]
    fn test_process_counts_skipped_rows() -> Result<(), Box<dyn std::error::Error>> {
        let rows = vec![
            vec![100.0, 100.0, 50.0, 50.0, 0.9, 0.0],
            vec![300.0],
            vec![500.0, 500.0, 50.0, 50.0, 0.5, 0.0],
            vec![],
            vec![200.0, 200.0, 2.0, 2.0, 0.5, 0.0],
            vec![400.0, 400.0, 40.0, 40.0, 0.01, 0.0],
        ];
        let processor = PostProcessor::new(DetectorConfig::default())?;

        let (detections, stats) = processor.process_rows(rows.as_slice(), size(640, 640))?;

        assert_eq!(stats.layout, Layout::RowMajor);
        assert_eq!(stats.skipped_rows, 2);
        assert_eq!(stats.raw_candidates, 4);
        assert_eq!(stats.above_threshold, 3);
        assert_eq!(stats.before_nms, 2);
        assert_eq!(detections.len(), 2);
        Ok(())
    }

    #[test]
    fn test_process_tensor_multi_class() -> Result<(), Box<dyn std::error::Error>> {
        // transposed (1, 7, 8): 5 base attributes + 2 class scores, 8 predictions
        #[rustfmt::skip]
        let data = vec![
            100.0, 400.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            100.0, 400.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            60.0, 60.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            60.0, 60.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.8, 0.7, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.9, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.1, 0.6, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ];
        let tensor = Tensor::from_vec(data, (1, 7, 8), &Device::Cpu)?;
        let config = DetectorConfig {
            class_mode: crate::ClassMode::ArgMax,
            class_names: vec!["healthy".to_string(), "blister".to_string()],
            ..Default::default()
        };

        let detections = PostProcessor::new(config)?.process(&tensor, size(640, 640))?;

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "healthy");
        assert_eq!(detections[1].class_id, 1);
        assert_eq!(detections[1].class_name, "blister");
        Ok(())
    }

    #[test]
    fn test_decode_and_suppress_empty_vs_malformed() -> Result<(), Box<dyn std::error::Error>> {
        let quiet = Tensor::zeros((1, 5, 100), candle_core::DType::F32, &Device::Cpu)?;
        let detections = decode_and_suppress(&quiet, 640, 480, 640, 0.1, 0.5)?;
        assert!(detections.is_empty());

        let narrow = Tensor::zeros((1, 4, 4), candle_core::DType::F32, &Device::Cpu)?;
        assert!(matches!(
            decode_and_suppress(&narrow, 640, 480, 640, 0.1, 0.5),
            Err(DetectError::MalformedTensor(_))
        ));
        Ok(())
    }

    #[test]
    fn test_decode_and_suppress_rejects_arguments() -> Result<(), Box<dyn std::error::Error>> {
        let tensor = Tensor::zeros((1, 5, 100), candle_core::DType::F32, &Device::Cpu)?;
        for result in [
            decode_and_suppress(&tensor, 0, 480, 640, 0.1, 0.5),
            decode_and_suppress(&tensor, 640, 480, 0, 0.1, 0.5),
            decode_and_suppress(&tensor, 640, 480, 640, -0.1, 0.5),
            decode_and_suppress(&tensor, 640, 480, 640, 0.1, 1.1),
        ] {
            assert!(matches!(result, Err(DetectError::InvalidArgument(_))));
        }
        Ok(())
    }
}
