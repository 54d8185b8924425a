#![deny(missing_docs)]

//! Tea leaf disease detection post-processing in Rust
//!
//! This crate turns the raw output tensor of a single-class YOLOv8 detector
//! into bounding boxes in original image coordinates: the tensor is decoded in
//! either of its two memory layouts, candidates are filtered by confidence and
//! size, and overlapping boxes are removed with greedy non-maximum suppression.
//!
//! # Examples
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use detektea::decode_and_suppress;
//!
//! // raw model output for a 640x640 input, (1, 5, 8400)
//! let output = Tensor::zeros((1, 5, 8400), candle_core::DType::F32, &Device::Cpu)
//!     .expect("Failed to allocate tensor");
//!
//! let detections = decode_and_suppress(&output, 1280, 720, 640, 0.1, 0.5)
//!     .expect("Failed to decode output");
//! for detection in detections {
//!     println!("Detection: {:?}", detection);
//! }
//! ```

/// Detection boxes, IoU and non-maximum suppression
mod bounding_box;

/// Raw output tensor decoding
mod decoder;

/// Detector handle, configuration and errors
mod detector;

/// Model input space to image space mapping
mod mapper;

/// Decode, filter and suppress pipeline
mod postprocess;

pub use bounding_box::{Detection, iou, non_maximum_suppression};
pub use decoder::{
    BASE_ATTRIBUTES, Candidate, ClassMode, Decoded, DenseOutput, Layout, OutputRows, decode,
    decode_tensor,
};
pub use detector::{DEFAULT_CLASS_NAME, DetectError, Detector, DetectorConfig, InferenceBackend};
pub use mapper::{Mapper, class_label};
pub use postprocess::{DecodeStats, PostProcessor, TOP_SCORES, decode_and_suppress};
