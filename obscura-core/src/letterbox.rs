//! Letterbox preprocessing: fit an arbitrary-aspect image into the
//! model's square input without distortion, and map detections back.
//!
//! The resized image is centered on a fixed neutral gray canvas
//! (114/255, the convention the detector family was trained with) and
//! converted into a `[1, 3, S, S]` channel-planar RGB tensor normalized
//! to `[0, 1]`.

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array3;
use tract_onnx::prelude::Tensor;

use obscura_utils::{geometry::Region, image_utils::resize_image, timing_guard};

use crate::error::InputError;

/// Gray value used for the padded border, matching detector training.
pub const PAD_VALUE: u8 = 114;

/// Affine map from original image space into the square model input:
/// `model = orig * scale + pad`.
///
/// Created once per inference call and consumed by the decoder to invert
/// the transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Square model input size in pixels.
    pub target: u32,
    /// Uniform scale applied to the original image.
    pub scale: f32,
    /// Horizontal padding in model-input pixels (left edge).
    pub pad_x: u32,
    /// Vertical padding in model-input pixels (top edge).
    pub pad_y: u32,
    /// Width of the resized image inside the square.
    pub resized_w: u32,
    /// Height of the resized image inside the square.
    pub resized_h: u32,
}

impl Letterbox {
    /// Compute the letterbox transform for an `orig_w x orig_h` image.
    ///
    /// Zero dimensions are a programmer error upstream (the caller must
    /// hand over a decoded image) and fail fast instead of producing NaN.
    pub fn fit(orig_w: u32, orig_h: u32, target: u32) -> Result<Self> {
        if orig_w == 0 || orig_h == 0 {
            return Err(InputError::EmptyImage {
                width: orig_w,
                height: orig_h,
            }
            .into());
        }
        anyhow::ensure!(target > 0, "model input size must be non-zero");

        let scale = (target as f32 / orig_w as f32).min(target as f32 / orig_h as f32);
        let resized_w = ((orig_w as f32 * scale).floor() as u32).clamp(1, target);
        let resized_h = ((orig_h as f32 * scale).floor() as u32).clamp(1, target);
        Ok(Self {
            target,
            scale,
            pad_x: (target - resized_w) / 2,
            pad_y: (target - resized_h) / 2,
            resized_w,
            resized_h,
        })
    }

    /// Map a point from original image space into model-input space.
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_x as f32,
            y * self.scale + self.pad_y as f32,
        )
    }

    /// Map a box from model-input space back into original image
    /// coordinates, clamped to the image bounds.
    pub fn to_original(&self, region: &Region, orig_w: u32, orig_h: u32) -> Region {
        let x0 = (region.x - self.pad_x as f32) / self.scale;
        let y0 = (region.y - self.pad_y as f32) / self.scale;
        let x1 = (region.right() - self.pad_x as f32) / self.scale;
        let y1 = (region.bottom() - self.pad_y as f32) / self.scale;
        Region::from_corners(x0, y0, x1, y1).clamp_to(orig_w as f32, orig_h as f32)
    }
}

/// Output of preprocessing: tensor plus the transform needed to map
/// detections back to the source image.
#[derive(Debug)]
pub struct LetterboxOutput {
    /// The `[1, 3, S, S]` model input tensor.
    pub tensor: Tensor,
    /// The transform that produced it.
    pub letterbox: Letterbox,
}

/// Letterbox an image into a model-ready tensor.
pub fn letterbox_image(image: &DynamicImage, target: u32) -> Result<LetterboxOutput> {
    let _guard = timing_guard("obscura_core::letterbox_image", log::Level::Trace);
    let (orig_w, orig_h) = image.dimensions();
    let letterbox = Letterbox::fit(orig_w, orig_h, target)?;

    let resized = resize_image(
        image,
        letterbox.resized_w,
        letterbox.resized_h,
        FilterType::Triangle,
    );

    let side = target as usize;
    let mut planes = Array3::<f32>::from_elem((3, side, side), PAD_VALUE as f32 / 255.0);
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (xi, yi) = (off_x + x as usize, off_y + y as usize);
        planes[(0, yi, xi)] = pixel[0] as f32 / 255.0;
        planes[(1, yi, xi)] = pixel[1] as f32 / 255.0;
        planes[(2, yi, xi)] = pixel[2] as f32 / 255.0;
    }

    let shape = [1usize, 3, side, side];
    let (data, offset) = planes.into_raw_vec_and_offset();
    debug_assert_eq!(offset, Some(0), "expected contiguous array");
    let tensor = Tensor::from_shape(&shape, &data)
        .map_err(|e| anyhow::anyhow!("failed to build input tensor: {e}"))?;

    Ok(LetterboxOutput { tensor, letterbox })
}
