//! Redaction compositing: blur, pixelate, and solid fill applied to
//! detected regions on an RGBA pixel buffer.
//!
//! The compositor only writes inside the regions it is given (plus the
//! feather ring around blurred regions), so several passes over the same
//! buffer compose: redacting plates and then faces never erases earlier
//! work. Blur passes sample their own target rectangle from the pristine
//! source buffer so repeated passes do not blur already-blurred pixels,
//! while the surrounding margin is sampled from the current destination
//! so feather blending matches what is already rendered.

use anyhow::Result;
use image::{
    imageops::{self, FilterType},
    RgbaImage,
};

use crate::{
    color::RgbaColor,
    config::{RedactionMode, RedactionSettings},
    geometry::Region,
};

/// Largest blur applied in a single pass. Bigger radii are split into
/// several passes, each feeding the next, which keeps kernel sizes small
/// and quality consistent across radii.
const MAX_BLUR_PASS: f32 = 20.0;

/// Extra sampling slack beyond the kernel reach and feather ring.
const MARGIN_SAFETY: f32 = 2.0;

/// Integer pixel window with exclusive right/bottom bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl PixelRect {
    fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

/// Snap a region to whole pixels, clamped to the image. `None` when the
/// region collapses to nothing inside the bounds.
fn pixel_rect(region: &Region, image_w: u32, image_h: u32) -> Option<PixelRect> {
    let clamped = region.clamp_to(image_w as f32, image_h as f32);
    let x0 = clamped.x.floor() as u32;
    let y0 = clamped.y.floor() as u32;
    let x1 = (clamped.right().ceil() as u32).min(image_w);
    let y1 = (clamped.bottom().ceil() as u32).min(image_h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(PixelRect { x0, y0, x1, y1 })
}

/// Apply the configured redaction to every region on `dest`.
///
/// `source` is the pristine, unredacted image; `dest` accumulates the
/// redaction passes and may start as a clone of `source`. Regions are in
/// destination pixel coordinates, are grown by the configured pad ratio
/// and vertical shift before use, and may overlap previously redacted
/// areas.
pub fn redact_regions(
    dest: &mut RgbaImage,
    source: &RgbaImage,
    regions: &[Region],
    settings: &RedactionSettings,
) -> Result<()> {
    anyhow::ensure!(
        dest.dimensions() == source.dimensions(),
        "source and destination buffers must match: {:?} vs {:?}",
        source.dimensions(),
        dest.dimensions()
    );
    let (image_w, image_h) = dest.dimensions();
    anyhow::ensure!(
        image_w > 0 && image_h > 0,
        "cannot redact a zero-sized buffer"
    );

    for region in regions {
        let grown = region
            .grown(settings.pad_ratio, settings.vertical_shift_ratio)
            .clamp_to(image_w as f32, image_h as f32);
        if grown.width < 1.0 || grown.height < 1.0 {
            continue;
        }
        match settings.mode {
            RedactionMode::Fill => fill_rect(dest, &grown, settings.fill_color),
            RedactionMode::Pixelate => {
                pixelate_rect(dest, source, &grown, settings.pixelate_cell_size)
            }
            RedactionMode::Blur => blur_ellipse(dest, source, &grown, settings),
        }
    }
    Ok(())
}

/// Overwrite the rectangular region with the fill color, alpha-blended
/// when the color is translucent.
fn fill_rect(dest: &mut RgbaImage, region: &Region, color: RgbaColor) {
    let (image_w, image_h) = dest.dimensions();
    let Some(rect) = pixel_rect(region, image_w, image_h) else {
        return;
    };
    let [r, g, b, a] = color.channels();
    let alpha = a as f32 / 255.0;
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let px = dest.get_pixel_mut(x, y);
            px[0] = blend_channel(px[0], r, alpha);
            px[1] = blend_channel(px[1], g, alpha);
            px[2] = blend_channel(px[2], b, alpha);
            px[3] = px[3].max(a);
        }
    }
}

/// Replace the rectangular region with a coarse nearest-neighbor mosaic
/// sampled from the pristine source.
fn pixelate_rect(dest: &mut RgbaImage, source: &RgbaImage, region: &Region, cell_size: u32) {
    let (image_w, image_h) = dest.dimensions();
    let Some(rect) = pixel_rect(region, image_w, image_h) else {
        return;
    };
    let cell = cell_size.max(2);
    let rect_w = rect.width();
    let rect_h = rect.height();

    let sub = imageops::crop_imm(source, rect.x0, rect.y0, rect_w, rect_h).to_image();
    let down_w = (rect_w / cell).max(1);
    let down_h = (rect_h / cell).max(1);
    let down = imageops::resize(&sub, down_w, down_h, FilterType::Nearest);
    let mosaic = imageops::resize(&down, rect_w, rect_h, FilterType::Nearest);
    imageops::replace(dest, &mosaic, rect.x0 as i64, rect.y0 as i64);
}

/// Blur the region and composite it back through a feathered elliptical
/// mask.
fn blur_ellipse(dest: &mut RgbaImage, source: &RgbaImage, region: &Region, settings: &RedactionSettings) {
    let (image_w, image_h) = dest.dimensions();
    let blur_radius = settings.blur_radius.max(0.0);
    let feather = settings.feather_radius.max(0.0);

    let rx = region.width / 2.0;
    let ry = region.height / 2.0;
    if rx <= 0.0 || ry <= 0.0 {
        return;
    }
    let (cx, cy) = region.center();

    // The falloff is radial in normalized-ellipse space, so its pixel
    // extent scales with each axis: on the major axis it reaches
    // `feather * rx.max(ry) / rx.min(ry)` past the ellipse. The write
    // window covers the full band on both axes, otherwise a wide region
    // would clip the feather mid-falloff and leave a visible seam.
    let feather_norm = feather / rx.min(ry);
    let draw_region = Region::from_center(
        cx,
        cy,
        region.width * (1.0 + feather_norm),
        region.height * (1.0 + feather_norm),
    );
    let Some(draw) = pixel_rect(&draw_region, image_w, image_h) else {
        return;
    };
    let Some(target) = pixel_rect(region, image_w, image_h) else {
        return;
    };

    // The blur kernel must never sample outside the scratch buffer, so the
    // scratch window extends past the write window by the kernel reach.
    let margin = (blur_radius * 3.0 + feather + MARGIN_SAFETY).ceil() as u32;
    let sx0 = draw.x0.saturating_sub(margin);
    let sy0 = draw.y0.saturating_sub(margin);
    let sx1 = draw.x1.saturating_add(margin).min(image_w);
    let sy1 = draw.y1.saturating_add(margin).min(image_h);

    // Margin ring comes from the current destination; the target rect is
    // refreshed from the pristine source so stacked passes never blur
    // already-blurred pixels.
    let mut scratch = imageops::crop_imm(dest, sx0, sy0, sx1 - sx0, sy1 - sy0).to_image();
    for y in target.y0..target.y1 {
        for x in target.x0..target.x1 {
            scratch.put_pixel(x - sx0, y - sy0, *source.get_pixel(x, y));
        }
    }

    let mut remaining = blur_radius;
    while remaining > 0.0 {
        let pass = remaining.min(MAX_BLUR_PASS);
        scratch = imageops::blur(&scratch, pass);
        remaining -= pass;
    }

    for y in draw.y0..draw.y1 {
        for x in draw.x0..draw.x1 {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let nx = (px - cx) / rx;
            let ny = (py - cy) / ry;
            let radial = (nx * nx + ny * ny).sqrt();

            let mask = if radial <= 1.0 {
                1.0
            } else if feather_norm > 0.0 && radial < 1.0 + feather_norm {
                1.0 - (radial - 1.0) / feather_norm
            } else {
                continue;
            };

            let blurred = scratch.get_pixel(x - sx0, y - sy0);
            let alpha = mask * (blurred[3] as f32 / 255.0);
            if alpha <= 0.0 {
                continue;
            }
            let out = dest.get_pixel_mut(x, y);
            out[0] = blend_channel(out[0], blurred[0], alpha);
            out[1] = blend_channel(out[1], blurred[1], alpha);
            out[2] = blend_channel(out[2], blurred[2], alpha);
        }
    }
}

fn blend_channel(under: u8, over: u8, alpha: f32) -> u8 {
    (over as f32 * alpha + under as f32 * (1.0 - alpha))
        .round()
        .clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn checkerboard(size: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    fn settings(mode: RedactionMode) -> RedactionSettings {
        RedactionSettings {
            mode,
            blur_radius: 4.0,
            feather_radius: 0.0,
            pixelate_cell_size: 8,
            fill_color: RgbaColor::opaque(255, 0, 0),
            pad_ratio: 0.0,
            vertical_shift_ratio: 0.0,
        }
    }

    #[test]
    fn blur_with_zero_feather_is_a_hard_ellipse() {
        let source = checkerboard(64);
        let mut dest = source.clone();
        let region = Region::new(16.0, 16.0, 32.0, 32.0);

        redact_regions(&mut dest, &source, &[region], &settings(RedactionMode::Blur))
            .expect("redact");

        // The rect corner lies outside the inscribed ellipse and must be
        // untouched.
        assert_eq!(dest.get_pixel(17, 17), source.get_pixel(17, 17));
        assert_eq!(dest.get_pixel(46, 17), source.get_pixel(46, 17));
        // The center is blurred toward gray.
        let center = dest.get_pixel(32, 32);
        assert!(center[0] > 40 && center[0] < 215, "center = {center:?}");
        // Pixels outside the region never change.
        assert_eq!(dest.get_pixel(4, 4), source.get_pixel(4, 4));
        assert_eq!(dest.get_pixel(60, 60), source.get_pixel(60, 60));
    }

    #[test]
    fn blur_pass_is_idempotent_on_pristine_source() {
        let source = checkerboard(64);
        let region = Region::new(16.0, 16.0, 32.0, 32.0);
        let config = settings(RedactionMode::Blur);

        let mut once = source.clone();
        redact_regions(&mut once, &source, &[region], &config).expect("first pass");

        let mut twice = once.clone();
        redact_regions(&mut twice, &source, &[region], &config).expect("second pass");

        assert_eq!(once, twice);
    }

    #[test]
    fn feather_fades_to_zero_on_wide_regions() {
        let source = checkerboard(128);
        let mut dest = source.clone();
        let mut config = settings(RedactionMode::Blur);
        config.feather_radius = 4.0;
        // A plate-shaped region: rx 32, ry 8, so the falloff reaches
        // feather * rx / ry = 16 pixels past the ellipse on the x axis.
        let region = Region::new(32.0, 56.0, 64.0, 16.0);

        redact_regions(&mut dest, &source, &[region], &config).expect("redact");

        let changed = |x: u32, y: u32| {
            (dest.get_pixel(x, y)[0] as i32 - source.get_pixel(x, y)[0] as i32).unsigned_abs()
        };
        // Well inside the falloff band on the major axis: visibly changed.
        assert!(changed(26, 64) > 10, "left band delta {}", changed(26, 64));
        assert!(changed(101, 64) > 10, "right band delta {}", changed(101, 64));
        // Beyond the full falloff extent: untouched.
        assert_eq!(dest.get_pixel(14, 64), source.get_pixel(14, 64));
        assert_eq!(dest.get_pixel(113, 64), source.get_pixel(113, 64));
        // The outermost written column carries near-zero alpha, so the
        // band fades out instead of ending in a seam.
        let edge_max = (52..76).map(|y| changed(16, y)).max().unwrap_or(0);
        assert!(edge_max < 20, "residual alpha at falloff edge: {edge_max}");
    }

    #[test]
    fn fill_covers_the_whole_rectangle() {
        let source = checkerboard(32);
        let mut dest = source.clone();
        let region = Region::new(8.0, 8.0, 12.0, 12.0);

        redact_regions(&mut dest, &source, &[region], &settings(RedactionMode::Fill))
            .expect("redact");

        assert_eq!(*dest.get_pixel(8, 8), Rgba([255, 0, 0, 255]));
        assert_eq!(*dest.get_pixel(19, 19), Rgba([255, 0, 0, 255]));
        assert_eq!(dest.get_pixel(7, 8), source.get_pixel(7, 8));
        assert_eq!(dest.get_pixel(20, 19), source.get_pixel(20, 19));
    }

    #[test]
    fn pixelate_produces_uniform_cells() {
        let source = checkerboard(64);
        let mut dest = source.clone();
        let region = Region::new(16.0, 16.0, 32.0, 32.0);

        redact_regions(
            &mut dest,
            &source,
            &[region],
            &settings(RedactionMode::Pixelate),
        )
        .expect("redact");

        // Every pixel of the first mosaic cell carries the same color.
        let anchor = *dest.get_pixel(16, 16);
        for y in 16..24 {
            for x in 16..24 {
                assert_eq!(*dest.get_pixel(x, y), anchor, "cell broken at ({x},{y})");
            }
        }
        assert_eq!(dest.get_pixel(10, 10), source.get_pixel(10, 10));
    }

    #[test]
    fn sequential_passes_leave_unrelated_regions_alone() {
        let source = checkerboard(96);
        let mut dest = source.clone();
        let plate = Region::new(8.0, 8.0, 24.0, 16.0);
        let face = Region::new(56.0, 56.0, 24.0, 24.0);

        redact_regions(&mut dest, &source, &[plate], &settings(RedactionMode::Blur))
            .expect("plates");
        let after_plates = dest.clone();
        redact_regions(&mut dest, &source, &[face], &settings(RedactionMode::Blur))
            .expect("faces");

        // The second pass must not disturb the first region.
        for y in 8..24 {
            for x in 8..32 {
                assert_eq!(dest.get_pixel(x, y), after_plates.get_pixel(x, y));
            }
        }
        // And far corners stay pristine throughout.
        assert_eq!(dest.get_pixel(90, 4), source.get_pixel(90, 4));
    }

    #[test]
    fn grown_regions_respect_image_bounds() {
        let source = checkerboard(32);
        let mut dest = source.clone();
        let mut config = settings(RedactionMode::Fill);
        config.pad_ratio = 0.5;
        config.vertical_shift_ratio = 0.5;
        // A region near the edge grows past the border and must clamp.
        let region = Region::new(0.0, 0.0, 16.0, 16.0);
        redact_regions(&mut dest, &source, &[region], &config).expect("redact");
        assert_eq!(*dest.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let source = checkerboard(32);
        let mut dest = RgbaImage::new(16, 16);
        let err = redact_regions(
            &mut dest,
            &source,
            &[Region::new(0.0, 0.0, 4.0, 4.0)],
            &settings(RedactionMode::Fill),
        )
        .expect_err("size mismatch");
        assert!(format!("{err}").contains("must match"));
    }
}
