use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use super::detector::DetectError;

/// Number of leading attributes every prediction carries: cx, cy, w, h, confidence.
pub const BASE_ATTRIBUTES: usize = 5;

/// Memory layout of the two non-batch dimensions of a raw output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layout {
    /// Each row is one prediction's attribute vector, `(N, A)`.
    RowMajor,
    /// Each row is one attribute across all predictions, `(A, N)`.
    Transposed,
}

impl Layout {
    /// Picks the layout by comparing the row length against the row count.
    ///
    /// Rows longer than the number of rows means attributes are the outer
    /// dimension.
    pub fn detect(num_rows: usize, row_len: usize) -> Self {
        if row_len > num_rows {
            Layout::Transposed
        } else {
            Layout::RowMajor
        }
    }

    /// `(predictions, attributes)` under this layout.
    pub fn split(self, num_rows: usize, row_len: usize) -> (usize, usize) {
        match self {
            Layout::Transposed => (row_len, num_rows),
            Layout::RowMajor => (num_rows, row_len),
        }
    }

    fn swapped(self) -> Self {
        match self {
            Layout::Transposed => Layout::RowMajor,
            Layout::RowMajor => Layout::Transposed,
        }
    }

    /// Picks the layout and checks it carries at least [`BASE_ATTRIBUTES`]
    /// attributes.
    ///
    /// The size heuristic of [`Layout::detect`] wins when it is viable; a small
    /// output such as `(3, 6)` falls back to the other orientation. Fails when
    /// neither orientation is viable.
    pub fn resolve(num_rows: usize, row_len: usize) -> Result<Self, DetectError> {
        let preferred = Layout::detect(num_rows, row_len);
        if preferred.split(num_rows, row_len).1 >= BASE_ATTRIBUTES {
            return Ok(preferred);
        }
        let fallback = preferred.swapped();
        if fallback.split(num_rows, row_len).1 >= BASE_ATTRIBUTES {
            tracing::debug!(
                "{:?} layout has too few attributes, using {:?}",
                preferred,
                fallback
            );
            return Ok(fallback);
        }
        Err(DetectError::MalformedTensor(format!(
            "output of {num_rows}x{row_len} has fewer than {BASE_ATTRIBUTES} attributes in either orientation"
        )))
    }

    /// Picks the layout of ragged rows, `first_len` being the first row's
    /// length and `widest` the longest row.
    ///
    /// Transposed planes must share one length, so the heuristic is only
    /// trusted when it says transposed with enough attribute rows. Anything
    /// else is read row-major, where short rows are skipped one by one.
    pub fn resolve_ragged(
        num_rows: usize,
        first_len: usize,
        widest: usize,
    ) -> Result<Self, DetectError> {
        let preferred = Layout::detect(num_rows, first_len);
        if preferred == Layout::Transposed && num_rows >= BASE_ATTRIBUTES {
            return Ok(preferred);
        }
        if widest >= BASE_ATTRIBUTES {
            return Ok(Layout::RowMajor);
        }
        Err(DetectError::MalformedTensor(format!(
            "no row of {num_rows} has {BASE_ATTRIBUTES} attributes, longest is {widest}"
        )))
    }
}

/// How the class of a prediction is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassMode {
    /// Single-class model: every prediction is class 0.
    #[default]
    Single,
    /// Multi-class model: arg-max over the scores after the base attributes.
    ArgMax,
}

/// Raw prediction in model input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Box center x.
    pub cx: f32,
    /// Box center y.
    pub cy: f32,
    /// Box width.
    pub w: f32,
    /// Box height.
    pub h: f32,
    /// Confidence score, not yet filtered.
    pub confidence: f32,
    /// Class index.
    pub class_id: u32,
}

/// Row access over the batch-squeezed output of a detection model.
///
/// Rows may be ragged for nested inputs; the first row's length drives layout
/// detection and ragged rows are never read as transposed unless the first
/// row says so.
pub trait OutputRows {
    /// Number of rows.
    fn num_rows(&self) -> usize;

    /// Row at `index`, `index < num_rows()`.
    fn row(&self, index: usize) -> &[f32];

    /// Length used for layout detection.
    fn row_len(&self) -> usize {
        if self.num_rows() == 0 {
            0
        } else {
            self.row(0).len()
        }
    }
}

impl<T: AsRef<[f32]>> OutputRows for [T] {
    fn num_rows(&self) -> usize {
        self.len()
    }

    fn row(&self, index: usize) -> &[f32] {
        self[index].as_ref()
    }
}

/// Borrowed view over a dense, contiguous `(1, D1, D2)` buffer.
#[derive(Debug, Clone, Copy)]
pub struct DenseOutput<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
}

impl<'a> DenseOutput<'a> {
    /// Wraps `data` with the given shape.
    ///
    /// The shape must be rank 3 with a batch dimension of 1 and must match the
    /// buffer length.
    pub fn new(data: &'a [f32], shape: &[usize]) -> Result<Self, DetectError> {
        let (rows, cols) = batch_dims(shape)?;
        let Some(len) = rows.checked_mul(cols) else {
            return Err(DetectError::MalformedTensor(format!(
                "shape {shape:?} overflows"
            )));
        };
        if len != data.len() {
            return Err(DetectError::MalformedTensor(format!(
                "shape {shape:?} needs {len} values, buffer holds {}",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }
}

impl OutputRows for DenseOutput<'_> {
    fn num_rows(&self) -> usize {
        self.rows
    }

    fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    fn row_len(&self) -> usize {
        self.cols
    }
}

/// Result of decoding one output tensor.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Detected layout.
    pub layout: Layout,
    /// Attributes per prediction.
    pub attributes: usize,
    /// Row-major rows skipped for being shorter than the base attributes.
    pub skipped_rows: usize,
    /// Candidates in prediction order.
    pub candidates: Vec<Candidate>,
}

fn batch_dims(shape: &[usize]) -> Result<(usize, usize), DetectError> {
    match shape {
        [1, rows, cols] => Ok((*rows, *cols)),
        [batch, _, _] => Err(DetectError::MalformedTensor(format!(
            "expected batch size 1, got {batch}"
        ))),
        _ => Err(DetectError::MalformedTensor(format!(
            "expected a rank 3 tensor, got shape {shape:?}"
        ))),
    }
}

/// Index of the largest score, first one on ties. Zero when there are none.
fn arg_max(scores: impl Iterator<Item = f32>) -> u32 {
    let mut best = (0, f32::NEG_INFINITY);
    for (index, score) in scores.enumerate() {
        if score > best.1 {
            best = (index, score);
        }
    }
    best.0 as u32
}

/// Decodes the rows of a batch-squeezed output into candidates.
///
/// # Arguments
///
/// * `output` - The rows of the output, batch dimension already removed.
/// * `class_mode` - How the class index of each candidate is resolved.
///
/// # Errors
///
/// Returns [`DetectError::MalformedTensor`] when no layout has at least
/// [`BASE_ATTRIBUTES`] attributes or, for transposed outputs, when an
/// attribute row is shorter than the prediction count.
pub fn decode<R: OutputRows + ?Sized>(
    output: &R,
    class_mode: ClassMode,
) -> Result<Decoded, DetectError> {
    let num_rows = output.num_rows();
    let row_len = output.row_len();
    let widest = (0..num_rows)
        .map(|r| output.row(r).len())
        .max()
        .unwrap_or(row_len);
    let ragged = (0..num_rows).any(|r| output.row(r).len() != widest);
    let layout = if ragged {
        Layout::resolve_ragged(num_rows, row_len, widest)?
    } else {
        Layout::resolve(num_rows, row_len)?
    };
    let (predictions, attributes) = match layout {
        Layout::Transposed => (row_len, num_rows),
        Layout::RowMajor => (num_rows, widest),
    };

    tracing::debug!(
        "Output format detected: layout={:?}, detections={}, attributes={}",
        layout,
        predictions,
        attributes
    );

    let mut candidates = Vec::with_capacity(predictions);
    let mut skipped_rows = 0;

    match layout {
        Layout::Transposed => {
            let planes: Vec<&[f32]> = (0..num_rows).map(|r| output.row(r)).collect();
            if let Some(r) = planes.iter().position(|p| p.len() < predictions) {
                return Err(DetectError::MalformedTensor(format!(
                    "attribute row {r} has {} values, expected {predictions}",
                    planes[r].len()
                )));
            }
            for i in 0..predictions {
                let class_id = match class_mode {
                    ClassMode::Single => 0,
                    ClassMode::ArgMax => arg_max(planes[BASE_ATTRIBUTES..].iter().map(|p| p[i])),
                };
                candidates.push(Candidate {
                    cx: planes[0][i],
                    cy: planes[1][i],
                    w: planes[2][i],
                    h: planes[3][i],
                    confidence: planes[4][i],
                    class_id,
                });
            }
        }
        Layout::RowMajor => {
            for i in 0..num_rows {
                let row = output.row(i);
                if row.len() < BASE_ATTRIBUTES {
                    skipped_rows += 1;
                    continue;
                }
                let class_id = match class_mode {
                    ClassMode::Single => 0,
                    ClassMode::ArgMax => arg_max(row[BASE_ATTRIBUTES..].iter().copied()),
                };
                candidates.push(Candidate {
                    cx: row[0],
                    cy: row[1],
                    w: row[2],
                    h: row[3],
                    confidence: row[4],
                    class_id,
                });
            }
        }
    }

    if skipped_rows > 0 {
        tracing::debug!("Skipped {} truncated prediction rows", skipped_rows);
    }

    Ok(Decoded {
        layout,
        attributes,
        skipped_rows,
        candidates,
    })
}

/// Decodes a `(1, D1, D2)` tensor as produced by the inference backend.
///
/// The tensor is converted to `f32` and read once; it is not retained.
pub fn decode_tensor(output: &Tensor, class_mode: ClassMode) -> Result<Decoded, DetectError> {
    // validate before touching the data so rank errors read as malformed input
    batch_dims(output.dims())?;
    let data = output.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let dense = DenseOutput::new(&data, output.dims())?;
    decode(&dense, class_mode)
}
