//! Decode raw detector output tensors into candidate boxes in original
//! image coordinates.
//!
//! Exported detection heads disagree about tensor layout: the same
//! logical `N x E` candidate matrix (N candidates, E attributes) may
//! arrive as `[1, N, E]`, `[1, E, N]`, or rank 2 with the batch dim
//! dropped. The decoder classifies the layout at runtime, then picks one
//! of two decode paths: a multi-scale anchor-free grid decode when the
//! candidate count matches the stride grids, or a flat pass over rows
//! that are already materialized boxes. Grid heads may additionally use
//! distribution-focal-loss box encoding, recognized from the attribute
//! count and decoded via a softmax expectation per box side.

use anyhow::Result;
use tract_onnx::prelude::Tensor;

use obscura_utils::geometry::Region;

use crate::{error::InputError, letterbox::Letterbox};

/// Detector stride scales; the grids they induce are concatenated in
/// this order in the candidate dimension.
const STRIDES: [u32; 3] = [8, 16, 32];

/// DFL bins-per-side candidates, checked in this preference order.
const REG_MAX_CANDIDATES: [usize; 4] = [4, 8, 16, 32];

/// Plausible attribute counts: 4 box values + score, up to a modest
/// class list. Candidate counts are typically in the thousands.
const MIN_ATTRS: usize = 5;
const MAX_ATTRS: usize = 64;

/// Smallest box side (original-image pixels) worth keeping.
const MIN_BOX_SIDE: f32 = 1.0;

/// A single decoded candidate in original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub region: Region,
    /// Combined confidence in `0..=1`.
    pub confidence: f32,
}

/// Decoder tunables. Defaults are supplied by the configuration layer,
/// not baked in here.
#[derive(Debug, Clone, Copy)]
pub struct DecodeConfig {
    /// Inclusive confidence cutoff: candidates exactly at the threshold
    /// are kept.
    pub confidence_threshold: f32,
    /// Force the whole-image-normalized interpretation of 5-attribute
    /// grid heads instead of the value-range heuristic.
    pub force_normalized: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            force_normalized: false,
        }
    }
}

/// Counters that make silent per-candidate discards observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Total candidate slots in the tensor.
    pub candidates: usize,
    /// Candidates dropped because a core value was NaN or infinite.
    pub non_finite_dropped: usize,
}

/// Decoded boxes plus discard counters.
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    pub detections: Vec<Detection>,
    pub stats: DecodeStats,
}

/// How the candidate matrix is laid out in the flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    /// Candidate count N.
    rows: usize,
    /// Attributes per candidate E.
    attrs: usize,
    /// `true` when the buffer is attribute-major (`[E, N]`).
    attr_major: bool,
}

/// Classify a tensor shape into a candidate-matrix layout.
///
/// The dimension in the plausible attribute range is E; when both or
/// neither qualify, the smaller dimension wins (candidate counts dwarf
/// attribute counts in practice).
fn classify_layout(shape: &[usize]) -> Result<Layout> {
    let dims: [usize; 2] = match shape {
        [a, b] => [*a, *b],
        [1, a, b] => [*a, *b],
        _ => {
            return Err(InputError::UnsupportedShape {
                shape: shape.to_vec(),
            }
            .into())
        }
    };

    let plausible = |d: usize| (MIN_ATTRS..=MAX_ATTRS).contains(&d);
    let first_is_attrs = match (plausible(dims[0]), plausible(dims[1])) {
        (true, false) => true,
        (false, true) => false,
        // Ambiguous either way: prefer the smaller dimension as E.
        _ => dims[0] < dims[1],
    };

    Ok(if first_is_attrs {
        Layout {
            rows: dims[1],
            attrs: dims[0],
            attr_major: true,
        }
    } else {
        Layout {
            rows: dims[0],
            attrs: dims[1],
            attr_major: false,
        }
    })
}

/// Total cell count of the multi-scale grids for a square input.
fn grid_cell_count(target: u32) -> usize {
    STRIDES
        .iter()
        .map(|stride| {
            let g = (target / stride) as usize;
            g * g
        })
        .sum()
}

/// Recognize a DFL head from its attribute count: `E = 4*reg_max + rem`
/// with a small score/class remainder.
fn detect_dfl(attrs: usize) -> Option<(usize, usize)> {
    for &reg_max in &REG_MAX_CANDIDATES {
        if attrs > 4 * reg_max {
            let rem = attrs - 4 * reg_max;
            if (1..=5).contains(&rem) {
                return Some((reg_max, rem));
            }
        }
    }
    None
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Expectation of a discrete distribution given by softmaxed logits:
/// `E = sum(k * softmax(logits)[k])`.
fn softmax_expectation(logits: &[f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    let mut weighted = 0.0f32;
    for (k, &logit) in logits.iter().enumerate() {
        let e = (logit - max).exp();
        sum += e;
        weighted += k as f32 * e;
    }
    if sum > 0.0 {
        weighted / sum
    } else {
        0.0
    }
}

/// Decode one output tensor into boxes in original image coordinates.
///
/// Rank other than 2 or 3 is a hard error; an empty result after
/// filtering is not. Candidates with non-finite core values are dropped
/// individually and counted in the returned stats.
pub fn decode_output(
    output: &Tensor,
    letterbox: &Letterbox,
    orig_w: u32,
    orig_h: u32,
    config: &DecodeConfig,
) -> Result<DecodeOutput> {
    let layout = classify_layout(output.shape())?;
    let data = output
        .as_slice::<f32>()
        .map_err(|e| anyhow::anyhow!("detector output is not f32: {e}"))?;
    anyhow::ensure!(
        data.len() == layout.rows * layout.attrs,
        "tensor data length {} does not match shape {:?}",
        data.len(),
        output.shape()
    );

    let decoder = CandidateDecoder {
        data,
        layout,
        letterbox: *letterbox,
        orig_w,
        orig_h,
        config: *config,
    };

    if layout.rows == grid_cell_count(letterbox.target) {
        Ok(decoder.decode_grid())
    } else {
        Ok(decoder.decode_flat())
    }
}

struct CandidateDecoder<'a> {
    data: &'a [f32],
    layout: Layout,
    letterbox: Letterbox,
    orig_w: u32,
    orig_h: u32,
    config: DecodeConfig,
}

impl CandidateDecoder<'_> {
    #[inline]
    fn at(&self, row: usize, attr: usize) -> f32 {
        if self.layout.attr_major {
            self.data[attr * self.layout.rows + row]
        } else {
            self.data[row * self.layout.attrs + attr]
        }
    }

    /// Best class confidence over `range`, squashed through a sigmoid.
    fn best_class_sigmoid(&self, row: usize, range: std::ops::Range<usize>) -> f32 {
        let mut best = f32::NEG_INFINITY;
        for attr in range {
            best = best.max(self.at(row, attr));
        }
        sigmoid(best)
    }

    /// Un-letterbox a model-space box, clamp it, and keep it when it
    /// still has usable extent.
    fn emit(&self, model_region: Region, confidence: f32, out: &mut Vec<Detection>) {
        let region = self
            .letterbox
            .to_original(&model_region, self.orig_w, self.orig_h);
        if region.width <= MIN_BOX_SIDE || region.height <= MIN_BOX_SIDE {
            return;
        }
        out.push(Detection { region, confidence });
    }

    /// Branch A: multi-scale anchor-free grid decode, cells in row-major
    /// order per stride, strides concatenated.
    fn decode_grid(&self) -> DecodeOutput {
        let attrs = self.layout.attrs;
        let dfl = detect_dfl(attrs);
        let mut output = DecodeOutput {
            stats: DecodeStats {
                candidates: self.layout.rows,
                non_finite_dropped: 0,
            },
            ..Default::default()
        };

        let mut row = 0usize;
        for &stride in &STRIDES {
            let grid = (self.letterbox.target / stride) as usize;
            let stride_f = stride as f32;
            for cell_y in 0..grid {
                for cell_x in 0..grid {
                    match dfl {
                        Some((reg_max, rem)) => self.decode_dfl_cell(
                            row,
                            reg_max,
                            rem,
                            cell_x,
                            cell_y,
                            stride_f,
                            &mut output,
                        ),
                        None => self.decode_center_size_cell(
                            row,
                            cell_x,
                            cell_y,
                            stride_f,
                            &mut output,
                        ),
                    }
                    row += 1;
                }
            }
        }
        output
    }

    fn decode_dfl_cell(
        &self,
        row: usize,
        reg_max: usize,
        rem: usize,
        cell_x: usize,
        cell_y: usize,
        stride: f32,
        output: &mut DecodeOutput,
    ) {
        let attrs = self.layout.attrs;
        let score_attr = 4 * reg_max;
        let confidence = if rem >= 2 {
            let objectness = sigmoid(self.at(row, score_attr));
            objectness * self.best_class_sigmoid(row, score_attr + 1..attrs)
        } else {
            sigmoid(self.at(row, score_attr))
        };
        if !confidence.is_finite() {
            output.stats.non_finite_dropped += 1;
            return;
        }
        if confidence < self.config.confidence_threshold {
            return;
        }

        // One distance per side: left, top, right, bottom.
        let mut sides = [0.0f32; 4];
        let mut logits = [0.0f32; 32];
        for (side, value) in sides.iter_mut().enumerate() {
            for k in 0..reg_max {
                logits[k] = self.at(row, side * reg_max + k);
            }
            *value = softmax_expectation(&logits[..reg_max]);
        }
        if sides.iter().any(|s| !s.is_finite()) {
            output.stats.non_finite_dropped += 1;
            return;
        }

        let cx = cell_x as f32 + 0.5;
        let cy = cell_y as f32 + 0.5;
        let model = Region::from_corners(
            (cx - sides[0]) * stride,
            (cy - sides[1]) * stride,
            (cx + sides[2]) * stride,
            (cy + sides[3]) * stride,
        );
        self.emit(model, confidence, &mut output.detections);
    }

    fn decode_center_size_cell(
        &self,
        row: usize,
        cell_x: usize,
        cell_y: usize,
        stride: f32,
        output: &mut DecodeOutput,
    ) {
        let attrs = self.layout.attrs;
        let tx = self.at(row, 0);
        let ty = self.at(row, 1);
        let tw = self.at(row, 2);
        let th = self.at(row, 3);
        let raw_score = self.at(row, 4);
        if ![tx, ty, tw, th, raw_score].iter().all(|v| v.is_finite()) {
            output.stats.non_finite_dropped += 1;
            return;
        }

        let mut confidence = sigmoid(raw_score);
        if attrs > 5 {
            confidence *= self.best_class_sigmoid(row, 5..attrs);
        }
        if confidence < self.config.confidence_threshold {
            return;
        }

        let target = self.letterbox.target as f32;
        let model = if attrs == 5 && (self.config.force_normalized || looks_normalized(tx, ty, tw, th))
        {
            // Single-class heads sometimes emit whole-image-normalized
            // center-size boxes instead of per-cell offsets.
            Region::from_center(tx * target, ty * target, tw * target, th * target)
        } else {
            let cx = (sigmoid(tx) * 2.0 - 0.5 + cell_x as f32) * stride;
            let cy = (sigmoid(ty) * 2.0 - 0.5 + cell_y as f32) * stride;
            let w = (sigmoid(tw) * 2.0).powi(2) * stride;
            let h = (sigmoid(th) * 2.0).powi(2) * stride;
            Region::from_center(cx, cy, w, h)
        };
        self.emit(model, confidence, &mut output.detections);
    }

    /// Branch B: rows are already materialized candidate boxes in
    /// model-input space.
    fn decode_flat(&self) -> DecodeOutput {
        let attrs = self.layout.attrs;
        let mut output = DecodeOutput {
            stats: DecodeStats {
                candidates: self.layout.rows,
                non_finite_dropped: 0,
            },
            ..Default::default()
        };

        for row in 0..self.layout.rows {
            let cx = self.at(row, 0);
            let cy = self.at(row, 1);
            let w = self.at(row, 2);
            let h = self.at(row, 3);
            let mut confidence = self.at(row, 4);
            if ![cx, cy, w, h, confidence].iter().all(|v| v.is_finite()) {
                output.stats.non_finite_dropped += 1;
                continue;
            }
            if attrs > 5 {
                let mut best = f32::NEG_INFINITY;
                for attr in 5..attrs {
                    best = best.max(self.at(row, attr));
                }
                confidence *= best;
            }
            if !confidence.is_finite() {
                output.stats.non_finite_dropped += 1;
                continue;
            }
            if confidence < self.config.confidence_threshold {
                continue;
            }
            let model = Region::from_center(cx, cy, w, h);
            self.emit(model, confidence, &mut output.detections);
        }
        output
    }
}

/// Heuristic for whole-image-normalized center-size encodings: at least
/// 3 of the 4 box values sit in the range a normalized head would emit.
fn looks_normalized(cx: f32, cy: f32, w: f32, h: f32) -> bool {
    let center_ok = |v: f32| (-0.05..=1.25).contains(&v);
    let size_ok = |v: f32| (-0.05..=1.6).contains(&v);
    let hits = usize::from(center_ok(cx))
        + usize::from(center_ok(cy))
        + usize::from(size_ok(w))
        + usize::from(size_ok(h));
    hits >= 3
}
