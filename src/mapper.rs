use kornia_image::ImageSize;

use super::{
    bounding_box::Detection,
    decoder::Candidate,
    detector::{DetectError, DetectorConfig},
};

/// Label for `class_id`, falling back to `class_<id>` past the end of the table.
pub fn class_label(class_names: &[String], class_id: u32) -> String {
    class_names
        .get(class_id as usize)
        .cloned()
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Maps model input space candidates to original image space detections.
#[derive(Debug, Clone)]
pub struct Mapper<'a> {
    width: f32,
    height: f32,
    scale_x: f32,
    scale_y: f32,
    confidence_threshold: f32,
    min_box_size: f32,
    class_names: &'a [String],
}

impl<'a> Mapper<'a> {
    /// Create a mapper for an image of size `original`.
    ///
    /// The config is expected to be validated already.
    pub fn new(original: ImageSize, config: &'a DetectorConfig) -> Result<Self, DetectError> {
        if original.width == 0 || original.height == 0 {
            return Err(DetectError::InvalidArgument(format!(
                "image size must be positive, got {}x{}",
                original.width, original.height
            )));
        }
        let width = original.width as f32;
        let height = original.height as f32;
        let resolution = config.input_resolution as f32;
        Ok(Self {
            width,
            height,
            scale_x: width / resolution,
            scale_y: height / resolution,
            confidence_threshold: config.confidence_threshold,
            min_box_size: config.min_box_size,
            class_names: &config.class_names,
        })
    }

    /// Whether `candidate` clears the confidence threshold. Non-finite
    /// confidences never do.
    pub fn accepts_confidence(&self, candidate: &Candidate) -> bool {
        candidate.confidence.is_finite() && candidate.confidence >= self.confidence_threshold
    }

    /// Map one candidate, `None` when it is below the confidence threshold,
    /// has non-finite geometry or is not larger than the minimum box size on
    /// both axes after clamping to the image.
    pub fn map(&self, candidate: &Candidate) -> Option<Detection> {
        if !self.accepts_confidence(candidate) {
            return None;
        }
        let Candidate { cx, cy, w, h, .. } = *candidate;
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            return None;
        }

        let x1 = ((cx - w / 2.0) * self.scale_x).max(0.);
        let y1 = ((cy - h / 2.0) * self.scale_y).max(0.);
        let x2 = ((cx + w / 2.0) * self.scale_x).min(self.width);
        let y2 = ((cy + h / 2.0) * self.scale_y).min(self.height);

        if x2 - x1 > self.min_box_size && y2 - y1 > self.min_box_size {
            Some(Detection {
                x1,
                y1,
                x2,
                y2,
                confidence: candidate.confidence,
                class_id: candidate.class_id,
                class_name: class_label(self.class_names, candidate.class_id),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(cx: f32, cy: f32, w: f32, h: f32, confidence: f32) -> Candidate {
        Candidate {
            cx,
            cy,
            w,
            h,
            confidence,
            class_id: 0,
        }
    }

    fn size(width: usize, height: usize) -> ImageSize {
        ImageSize { width, height }
    }

    #[test]
    fn test_full_frame_box() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig::default();
        let mapper = Mapper::new(size(1280, 720), &config)?;

        let detection = mapper
            .map(&candidate(320.0, 320.0, 640.0, 640.0, 0.8))
            .ok_or("full frame box rejected")?;

        assert_eq!(
            (detection.x1, detection.y1, detection.x2, detection.y2),
            (0.0, 0.0, 1280.0, 720.0)
        );
        assert_eq!(detection.class_id, 0);
        assert_eq!(detection.class_name, "cacar daun");
        Ok(())
    }

    #[test]
    fn test_scaling() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig::default();
        let mapper = Mapper::new(size(1280, 320), &config)?;

        let detection = mapper
            .map(&candidate(100.0, 200.0, 40.0, 80.0, 0.5))
            .ok_or("box rejected")?;

        // scale_x = 2, scale_y = 0.5
        assert_eq!(
            (detection.x1, detection.y1, detection.x2, detection.y2),
            (160.0, 80.0, 240.0, 120.0)
        );
        Ok(())
    }

    #[test]
    fn test_clamps_to_image() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig::default();
        let mapper = Mapper::new(size(640, 480), &config)?;

        let detection = mapper
            .map(&candidate(0.0, 630.0, 100.0, 100.0, 0.5))
            .ok_or("box rejected")?;

        assert_eq!(detection.x1, 0.0);
        assert_eq!(detection.x2, 50.0);
        assert_eq!(detection.y2, 480.0);
        Ok(())
    }

    #[test]
    fn test_confidence_threshold_is_inclusive() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig {
            confidence_threshold: 0.5,
            ..Default::default()
        };
        let mapper = Mapper::new(size(640, 640), &config)?;

        assert!(mapper.map(&candidate(100.0, 100.0, 50.0, 50.0, 0.5)).is_some());
        assert!(mapper.map(&candidate(100.0, 100.0, 50.0, 50.0, 0.49)).is_none());
        assert!(mapper.map(&candidate(100.0, 100.0, 50.0, 50.0, f32::NAN)).is_none());
        assert!(mapper.map(&candidate(100.0, 100.0, 50.0, 50.0, f32::INFINITY)).is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_small_boxes() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig::default();
        let mapper = Mapper::new(size(640, 640), &config)?;

        // exactly the minimum size is rejected
        assert!(mapper.map(&candidate(100.0, 100.0, 5.0, 50.0, 0.9)).is_none());
        assert!(mapper.map(&candidate(100.0, 100.0, 50.0, 4.0, 0.9)).is_none());
        assert!(mapper.map(&candidate(100.0, 100.0, 6.0, 6.0, 0.9)).is_some());
        // entirely outside the image collapses after clamping
        assert!(mapper.map(&candidate(-100.0, 100.0, 50.0, 50.0, 0.9)).is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_non_finite_geometry() -> Result<(), Box<dyn std::error::Error>> {
        let config = DetectorConfig::default();
        let mapper = Mapper::new(size(640, 640), &config)?;

        assert!(mapper.map(&candidate(f32::NAN, 100.0, 50.0, 50.0, 0.9)).is_none());
        assert!(mapper.map(&candidate(100.0, 100.0, f32::INFINITY, 50.0, 0.9)).is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_empty_image() {
        let config = DetectorConfig::default();
        assert!(matches!(
            Mapper::new(size(0, 480), &config),
            Err(DetectError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_class_label() {
        let names = vec!["healthy".to_string(), "blister".to_string()];
        assert_eq!(class_label(&names, 1), "blister");
        assert_eq!(class_label(&names, 7), "class_7");
    }
}
