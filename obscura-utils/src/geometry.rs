//! Axis-aligned box geometry shared by the detection pipeline and the
//! redaction compositor.
//!
//! All functions here are pure and total: non-finite inputs propagate
//! unchanged, and callers filter them upstream.

/// Clamp `value` into the inclusive range `[lo, hi]`.
pub fn clamp(value: f32, lo: f32, hi: f32) -> f32 {
    value.max(lo).min(hi)
}

/// Axis-aligned rectangle in a single coordinate space.
///
/// The coordinate space (model input, letterboxed, or original image) is
/// a property of the surrounding code, not of the value; the pipeline
/// converts explicitly and never mixes spaces inside one computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    /// The x-coordinate of the top-left corner.
    pub x: f32,
    /// The y-coordinate of the top-left corner.
    pub y: f32,
    /// The width of the box.
    pub width: f32,
    /// The height of the box.
    pub height: f32,
}

impl Region {
    /// Construct a region from its top-left corner and size.
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Construct a region from two opposite corners.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// Construct a region from its center point and size.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    /// Area of the region. Negative extents count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// The x-coordinate of the right edge.
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// The y-coordinate of the bottom edge.
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Center point of the region.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Length of the shorter side.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    /// Width divided by height.
    pub fn aspect_ratio(&self) -> f32 {
        self.width / self.height
    }

    /// Area of the overlap with `other`, zero when disjoint.
    pub fn intersection_area(&self, other: &Self) -> f32 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }

    /// Intersection over union with `other`.
    ///
    /// Returns `0.0` when the boxes are disjoint or either has zero area.
    pub fn iou(&self, other: &Self) -> f32 {
        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Fraction of `other`'s area that lies inside `self`.
    ///
    /// Asymmetric by design: `a.containment_ratio(&b)` answers "how much
    /// of b is inside a". Returns `0.0` when `other` has zero area.
    pub fn containment_ratio(&self, other: &Self) -> f32 {
        let other_area = other.area();
        if other_area <= 0.0 {
            return 0.0;
        }
        self.intersection_area(other) / other_area
    }

    /// Distance between centers divided by the shortest side of either box.
    ///
    /// Normalizing by the smaller box keeps the measure meaningful for
    /// small near-duplicate detections regardless of absolute scale.
    /// Returns infinity when every side is degenerate.
    pub fn center_distance_ratio(&self, other: &Self) -> f32 {
        let min_side = self
            .width
            .min(self.height)
            .min(other.width)
            .min(other.height);
        if min_side <= 0.0 {
            return f32::INFINITY;
        }
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = ax - bx;
        let dy = ay - by;
        (dx * dx + dy * dy).sqrt() / min_side
    }

    /// Grow the region by a ratio of its own size, optionally shifting it
    /// upward.
    ///
    /// `pad_ratio` expands every side by that fraction of the matching
    /// dimension. `vertical_shift_ratio` then moves the grown box up by
    /// that fraction of the original height, so a face box can cover
    /// hair and forehead above the detected rectangle.
    pub fn grown(&self, pad_ratio: f32, vertical_shift_ratio: f32) -> Self {
        let pad_x = self.width * pad_ratio;
        let pad_y = self.height * pad_ratio;
        Self {
            x: self.x - pad_x,
            y: self.y - pad_y - self.height * vertical_shift_ratio,
            width: self.width + 2.0 * pad_x,
            height: self.height + 2.0 * pad_y,
        }
    }

    /// Clamp the region into `[0, width) x [0, height)`.
    ///
    /// The result can have zero or negative extents when the region lies
    /// entirely outside the image; callers discard those.
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        let x0 = clamp(self.x, 0.0, width);
        let y0 = clamp(self.y, 0.0, height);
        let x1 = clamp(self.right(), 0.0, width);
        let y1 = clamp(self.bottom(), 0.0, height);
        Self::from_corners(x0, y0, x1, y1)
    }
}
