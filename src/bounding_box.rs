use serde::{Deserialize, Serialize};

/// Detection in original image pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Minimum x coordinate of the bounding box.
    pub x1: f32,
    /// Minimum y coordinate of the bounding box.
    pub y1: f32,
    /// Maximum x coordinate of the bounding box.
    pub x2: f32,
    /// Maximum y coordinate of the bounding box.
    pub y2: f32,
    /// Confidence score of the detection.
    pub confidence: f32,
    /// Class index of the detection.
    pub class_id: u32,
    /// Human readable class label.
    pub class_name: String,
}

impl Detection {
    /// Width of the box, zero for inverted boxes.
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.)
    }

    /// Height of the box, zero for inverted boxes.
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.)
    }

    /// Area of the box in square pixels.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

/// Intersection over union of two detections.
///
/// Returns 0 when the union is empty.
pub fn iou(b1: &Detection, b2: &Detection) -> f32 {
    let i_w = (b1.x2.min(b2.x2) - b1.x1.max(b2.x1)).max(0.);
    let i_h = (b1.y2.min(b2.y2) - b1.y1.max(b2.y1)).max(0.);
    let i_area = i_w * i_h;
    let union = b1.area() + b2.area() - i_area;
    if union > 0. { i_area / union } else { 0. }
}

/// Greedy non-maximum suppression.
///
/// Detections are ordered by confidence, highest first; equal confidences keep
/// their input order. Each kept detection suppresses every later detection whose
/// IoU with it exceeds `threshold`. The survivors are returned in that order.
///
/// # Arguments
///
/// * `detections` - The detections to filter.
/// * `threshold` - The IoU threshold for suppression.
pub fn non_maximum_suppression(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    // stable sort: ties stay in input order
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut suppressed = vec![false; detections.len()];
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > threshold {
                suppressed[j] = true;
            }
        }
    }

    let before = detections.len();
    let kept: Vec<Detection> = detections
        .into_iter()
        .zip(suppressed)
        .filter_map(|(d, s)| (!s).then_some(d))
        .collect();
    tracing::debug!("NMS: {} -> {}", before, kept.len());
    kept
}
