//! Cluster fusion and non-max suppression over decoded candidates.
//!
//! Grid detectors fire on the same object from several adjacent cells
//! and strides, so plain NMS leaves jittery near-duplicates of similar
//! confidence. Fusion first collapses each cluster of mutually-close
//! boxes into one confidence-weighted average box, then a final NMS pass
//! removes remaining redundancy via IoU, bidirectional containment, and
//! center distance.

use obscura_utils::{config::DetectionSettings, geometry::Region};

use crate::decode::Detection;

/// Deduplication thresholds. Every value is a policy input; nothing is
/// baked into the algorithm.
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Pre-filter: drop boxes whose minimum side is below this fraction
    /// of `min(image_w, image_h)`. Zero disables the filter.
    pub min_side_ratio: f32,
    /// Pre-filter: accepted aspect ratio range (width / height).
    pub aspect_ratio_min: f32,
    pub aspect_ratio_max: f32,
    /// Cluster absorption: IoU at or above this joins the cluster.
    pub fusion_iou: f32,
    /// Cluster absorption: center distance ratio at or below this joins
    /// the cluster.
    pub fusion_center_distance: f32,
    /// Final NMS IoU suppression threshold.
    pub final_iou: f32,
    /// Final NMS containment suppression threshold, applied in both
    /// directions.
    pub containment: f32,
    /// Final NMS center distance suppression threshold.
    pub final_center_distance: f32,
    /// Hard cap on the returned detection count.
    pub max_detections: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_side_ratio: 0.0,
            aspect_ratio_min: 0.05,
            aspect_ratio_max: 20.0,
            fusion_iou: 0.7,
            fusion_center_distance: 0.3,
            final_iou: 0.45,
            containment: 0.8,
            final_center_distance: 0.2,
            max_detections: 100,
        }
    }
}

impl From<&DetectionSettings> for FusionConfig {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            final_iou: settings.iou_threshold,
            containment: settings.containment_threshold,
            final_center_distance: settings.center_distance_threshold,
            max_detections: settings.max_detections,
            ..Self::default()
        }
    }
}

/// Deduplicate decoded candidates into the final detection set.
///
/// Output is sorted by descending confidence and truncated to
/// `config.max_detections`.
pub fn fuse_detections(
    detections: &[Detection],
    image_w: u32,
    image_h: u32,
    config: &FusionConfig,
) -> Vec<Detection> {
    let min_side = config.min_side_ratio * image_w.min(image_h) as f32;
    let mut candidates: Vec<Detection> = detections
        .iter()
        .filter(|d| {
            let ar = d.region.aspect_ratio();
            d.region.min_side() >= min_side
                && ar >= config.aspect_ratio_min
                && ar <= config.aspect_ratio_max
        })
        .copied()
        .collect();

    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let fused = fuse_clusters(&candidates, config);
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in &fused {
        let suppressed = kept.iter().any(|k| {
            k.region.iou(&candidate.region) >= config.final_iou
                || k.region.containment_ratio(&candidate.region) >= config.containment
                || candidate.region.containment_ratio(&k.region) >= config.containment
                || k.region.center_distance_ratio(&candidate.region)
                    <= config.final_center_distance
        });
        if !suppressed {
            kept.push(*candidate);
        }
    }

    kept.truncate(config.max_detections);
    kept
}

/// Greedy confidence-descending clustering. `sorted` must already be in
/// descending confidence order; the output preserves that order.
fn fuse_clusters(sorted: &[Detection], config: &FusionConfig) -> Vec<Detection> {
    let mut consumed = vec![false; sorted.len()];
    let mut fused = Vec::new();

    for seed_idx in 0..sorted.len() {
        if consumed[seed_idx] {
            continue;
        }
        consumed[seed_idx] = true;
        let seed = &sorted[seed_idx];

        let mut members = vec![*seed];
        for (other_idx, other) in sorted.iter().enumerate().skip(seed_idx + 1) {
            if consumed[other_idx] {
                continue;
            }
            let joins = seed.region.iou(&other.region) >= config.fusion_iou
                || seed.region.center_distance_ratio(&other.region)
                    <= config.fusion_center_distance;
            if joins {
                consumed[other_idx] = true;
                members.push(*other);
            }
        }
        fused.push(weighted_merge(&members));
    }
    fused
}

/// Collapse cluster members into one box: center and size averaged with
/// confidence weights, confidence taken as the cluster maximum so a
/// strong single detection is not diluted by weak neighbors.
fn weighted_merge(members: &[Detection]) -> Detection {
    debug_assert!(!members.is_empty());
    let mut weight_sum = 0.0f32;
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;
    let mut w = 0.0f32;
    let mut h = 0.0f32;
    let mut confidence = 0.0f32;

    for member in members {
        let weight = member.confidence.max(f32::EPSILON);
        let (mcx, mcy) = member.region.center();
        weight_sum += weight;
        cx += mcx * weight;
        cy += mcy * weight;
        w += member.region.width * weight;
        h += member.region.height * weight;
        confidence = confidence.max(member.confidence);
    }

    Detection {
        region: Region::from_center(
            cx / weight_sum,
            cy / weight_sum,
            w / weight_sum,
            h / weight_sum,
        ),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Detection {
        Detection {
            region: Region::new(x, y, w, h),
            confidence,
        }
    }

    /// A config where only the stage under test can fire.
    fn nms_only(final_iou: f32) -> FusionConfig {
        FusionConfig {
            fusion_iou: 1.1,
            fusion_center_distance: -1.0,
            final_iou,
            containment: 1.1,
            final_center_distance: -1.0,
            ..FusionConfig::default()
        }
    }

    #[test]
    fn heavily_overlapping_pair_keeps_only_the_stronger() {
        let input = [det(0.0, 0.0, 10.0, 10.0, 0.9), det(1.0, 1.0, 10.0, 10.0, 0.5)];
        let kept = fuse_detections(&input, 640, 640, &nms_only(0.3));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn contained_box_is_suppressed_despite_low_iou() {
        let outer = det(0.0, 0.0, 100.0, 100.0, 0.9);
        let inner = det(40.0, 40.0, 20.0, 20.0, 0.8);
        assert!(outer.region.iou(&inner.region) < 0.05);

        let config = FusionConfig {
            fusion_iou: 1.1,
            fusion_center_distance: -1.0,
            final_iou: 0.9,
            containment: 0.8,
            final_center_distance: -1.0,
            ..FusionConfig::default()
        };
        let kept = fuse_detections(&[outer, inner], 640, 640, &config);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn cluster_fusion_produces_weighted_average_with_max_confidence() {
        // Two near-identical boxes from adjacent grid cells.
        let a = det(100.0, 100.0, 40.0, 40.0, 0.9);
        let b = det(104.0, 104.0, 40.0, 40.0, 0.3);
        let config = FusionConfig {
            fusion_iou: 0.5,
            fusion_center_distance: -1.0,
            final_iou: 1.1,
            containment: 1.1,
            final_center_distance: -1.0,
            ..FusionConfig::default()
        };
        let kept = fuse_detections(&[a, b], 640, 640, &config);
        assert_eq!(kept.len(), 1);

        // Weighted centers: (120*0.9 + 124*0.3) / 1.2 = 121.
        let (cx, cy) = kept[0].region.center();
        assert!((cx - 121.0).abs() < 1e-3);
        assert!((cy - 121.0).abs() < 1e-3);
        assert!((kept[0].region.width - 40.0).abs() < 1e-3);
        // Max member confidence, never an average.
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn center_distance_suppresses_offset_duplicates() {
        // Boxes that barely overlap but share almost the same center.
        let a = det(100.0, 100.0, 40.0, 10.0, 0.9);
        let b = det(100.0, 104.0, 40.0, 10.0, 0.6);
        let config = FusionConfig {
            fusion_iou: 1.1,
            fusion_center_distance: -1.0,
            final_iou: 0.99,
            containment: 1.1,
            final_center_distance: 0.5,
            ..FusionConfig::default()
        };
        let kept = fuse_detections(&[a, b], 640, 640, &config);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn prefilter_drops_slivers_and_extreme_aspect_ratios() {
        let config = FusionConfig {
            min_side_ratio: 0.01, // 6.4px on a 640 image
            aspect_ratio_min: 0.2,
            aspect_ratio_max: 5.0,
            ..nms_only(0.99)
        };
        let input = [
            det(0.0, 0.0, 3.0, 50.0, 0.9),    // too thin
            det(200.0, 0.0, 100.0, 8.0, 0.9), // aspect 12.5
            det(400.0, 0.0, 40.0, 40.0, 0.9), // fine
        ];
        let kept = fuse_detections(&input, 640, 640, &config);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].region.x - 400.0).abs() < 1e-6);
    }

    #[test]
    fn output_is_truncated_in_confidence_order() {
        let config = FusionConfig {
            max_detections: 2,
            ..nms_only(0.99)
        };
        let input = [
            det(0.0, 0.0, 20.0, 20.0, 0.4),
            det(100.0, 0.0, 20.0, 20.0, 0.8),
            det(200.0, 0.0, 20.0, 20.0, 0.6),
        ];
        let kept = fuse_detections(&input, 640, 640, &config);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.8);
        assert_eq!(kept[1].confidence, 0.6);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let kept = fuse_detections(&[], 640, 640, &FusionConfig::default());
        assert!(kept.is_empty());
    }

    #[test]
    fn settings_conversion_carries_thresholds() {
        let settings = DetectionSettings {
            iou_threshold: 0.33,
            containment_threshold: 0.75,
            center_distance_threshold: 0.15,
            max_detections: 7,
            ..DetectionSettings::default()
        };
        let config = FusionConfig::from(&settings);
        assert_eq!(config.final_iou, 0.33);
        assert_eq!(config.containment, 0.75);
        assert_eq!(config.final_center_distance, 0.15);
        assert_eq!(config.max_detections, 7);
    }
}
