//! Image loading and resizing helpers shared by the pipeline and tests.

use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, RgbImage};

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Resize an image to the requested resolution using the provided filter.
pub fn resize_image(image: &DynamicImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image.resize_exact(width, height, filter).to_rgb8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn resize_produces_requested_dimensions() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, _>::new(8, 4));
        let resized = resize_image(&img, 4, 2, FilterType::Triangle);
        assert_eq!(resized.dimensions(), (4, 2));
    }

    #[test]
    fn load_missing_image_fails_with_context() {
        let err = load_image("does_not_exist.png").expect_err("missing file");
        assert!(format!("{err:#}").contains("does_not_exist.png"));
    }
}
