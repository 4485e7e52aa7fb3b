//! End-to-end pipeline tests over the public API, using synthetic
//! tensors in place of a real ONNX session.

use obscura_core::{
    decode_output, fuse_detections, letterbox_image, DecodeConfig, FusionConfig, Letterbox,
    ModelKey, SessionRegistry,
};
use obscura_utils::geometry::Region;

use image::{DynamicImage, ImageBuffer, Rgb};
use tract_onnx::prelude::Tensor;

fn flat_tensor(rows: &[[f32; 5]]) -> Tensor {
    let data: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_shape(&[1, rows.len(), 5], &data).expect("tensor")
}

#[test]
fn synthetic_detections_flow_through_decode_and_fusion() {
    // A 400x300 image letterboxed to 640: scale 1.6, pad (0, 80).
    let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(400, 300, Rgb([64u8, 64, 64])));
    let preprocessed = letterbox_image(&image, 640).expect("letterbox");
    let letterbox = preprocessed.letterbox;
    assert_eq!(preprocessed.tensor.shape(), &[1, 3, 640, 640]);

    // Three candidates: two near-duplicates of one object plus one
    // distinct object, in model-input space (cx, cy, w, h, conf).
    let output = flat_tensor(&[
        [320.0, 240.0, 80.0, 80.0, 0.9],
        [324.0, 243.0, 82.0, 78.0, 0.6],
        [100.0, 400.0, 60.0, 40.0, 0.7],
    ]);

    let decoded = decode_output(
        &output,
        &letterbox,
        400,
        300,
        &DecodeConfig {
            confidence_threshold: 0.5,
            force_normalized: false,
        },
    )
    .expect("decode");
    assert_eq!(decoded.detections.len(), 3);
    assert_eq!(decoded.stats.candidates, 3);
    assert_eq!(decoded.stats.non_finite_dropped, 0);

    let fused = fuse_detections(&decoded.detections, 400, 300, &FusionConfig::default());
    assert_eq!(fused.len(), 2);
    // Strongest survivor first; the duplicate pair collapsed into one.
    assert_eq!(fused[0].confidence, 0.9);
    assert_eq!(fused[1].confidence, 0.7);

    // The fused strong box sits near the un-letterboxed center:
    // model (320, 240) -> original (200, 100).
    let (cx, cy) = fused[0].region.center();
    assert!((cx - 200.0).abs() < 3.0);
    assert!((cy - 100.0).abs() < 3.0);
}

#[test]
fn decoded_boxes_never_leave_the_image() {
    let letterbox = Letterbox::fit(400, 300, 640).expect("fit");
    // A candidate hanging off the right edge in model space.
    let output = flat_tensor(&[[630.0, 300.0, 100.0, 100.0, 0.9]]);

    let decoded = decode_output(&output, &letterbox, 400, 300, &DecodeConfig::default())
        .expect("decode");
    assert_eq!(decoded.detections.len(), 1);
    let region = decoded.detections[0].region;
    assert!(region.x >= 0.0);
    assert!(region.right() <= 400.0 + 1e-3);
    assert!(region.bottom() <= 300.0 + 1e-3);
}

#[test]
fn empty_detection_set_is_a_valid_result() {
    let letterbox = Letterbox::fit(640, 640, 640).expect("fit");
    let output = flat_tensor(&[[320.0, 320.0, 50.0, 50.0, 0.01]]);

    let decoded = decode_output(&output, &letterbox, 640, 640, &DecodeConfig::default())
        .expect("decode");
    let fused = fuse_detections(&decoded.detections, 640, 640, &FusionConfig::default());
    assert!(fused.is_empty());
}

#[test]
fn registry_shares_sessions_across_equivalent_keys() {
    let registry: SessionRegistry<String> = SessionRegistry::new();
    let a = ModelKey::new("face.onnx", 640, 0.35, 0.45, 0.08);
    let b = ModelKey::new("face.onnx", 640, 0.35 + 1e-7, 0.45, 0.08);

    let first = registry
        .get_or_load(&a, || Ok("session".to_string()))
        .expect("load");
    let second = registry
        .get_or_load(&b, || Ok("other".to_string()))
        .expect("cached");

    // Float noise rounds away; both keys hit the same session.
    assert_eq!(*first, "session");
    assert_eq!(*second, "session");

    registry.clear();
    let third = registry
        .get_or_load(&a, || Ok("reloaded".to_string()))
        .expect("reload");
    assert_eq!(*third, "reloaded");
}

#[test]
fn regions_round_trip_through_the_letterbox_transform() {
    let letterbox = Letterbox::fit(1920, 1080, 640).expect("fit");
    let original = Region::new(500.0, 300.0, 120.0, 90.0);

    let (mx, my) = letterbox.to_model(original.x, original.y);
    let (mr, mb) = letterbox.to_model(original.right(), original.bottom());
    let model = Region::from_corners(mx, my, mr, mb);
    let back = letterbox.to_original(&model, 1920, 1080);

    assert!((back.x - original.x).abs() < 1e-2);
    assert!((back.y - original.y).abs() < 1e-2);
    assert!((back.width - original.width).abs() < 1e-2);
    assert!((back.height - original.height).abs() < 1e-2);
}
