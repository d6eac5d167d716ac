//! Non-maximum suppression shared by all decoders

use super::types::{BoundingBox, Detection, FaceRegion};

/// Anything NMS can rank and compare
pub trait Suppressible {
    fn bbox(&self) -> &BoundingBox;
    fn confidence(&self) -> f32;
    fn class_id(&self) -> u32 {
        0
    }
}

impl Suppressible for Detection {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
    fn confidence(&self) -> f32 {
        self.confidence
    }
    fn class_id(&self) -> u32 {
        self.class_id
    }
}

impl Suppressible for FaceRegion {
    fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }
    fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Compute intersection over union of two corner-origin boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.x2().min(b.x2());
    let y2 = a.y2().min(b.y2());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if intersection <= 0.0 {
        return 0.0;
    }

    let union = area_a + area_b - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy NMS: highest confidence first, drop anything whose IoU with a kept
/// item exceeds `iou_threshold`. With `class_aware`, only same-class items
/// suppress each other.
pub fn nms<T: Suppressible>(mut items: Vec<T>, iou_threshold: f32, class_aware: bool) -> Vec<T> {
    if items.len() < 2 {
        return items;
    }

    items.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

    let mut keep: Vec<T> = Vec::with_capacity(items.len());
    for candidate in items {
        let suppressed = keep.iter().any(|kept| {
            (!class_aware || kept.class_id() == candidate.class_id())
                && iou(kept.bbox(), candidate.bbox()) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }

    keep
}
