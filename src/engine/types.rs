//! Detection result types shared by every decoder

use serde::{Deserialize, Serialize};

/// Axis-aligned box in normalized [0, 1] image coordinates, top-left origin.
///
/// Constructors clamp, so `x + width <= 1` and `y + height <= 1` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from corner coordinates, clamping to the unit square
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let x1 = clamp_unit(x1);
        let y1 = clamp_unit(y1);
        let x2 = clamp_unit(x2).max(x1);
        let y2 = clamp_unit(y2).max(y1);
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Build from center form, clamping to the unit square
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::from_corners(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Corners scaled to pixel coordinates of an image
    pub fn to_pixels(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let (w, h) = (width as f32, height as f32);
        (self.x * w, self.y * h, self.x2() * w, self.y2() * h)
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Binary instance mask at original image resolution (0 or 255 per pixel)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegmentMask {
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl SegmentMask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Number of foreground pixels
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0).count()
    }
}

/// An object detection, optionally with an instance mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mask: Option<SegmentMask>,
}

/// A detected face with five landmarks (eyes, nose tip, mouth corners)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: [(f32, f32); 5],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_center_clamps() {
        let b = BoundingBox::from_center(0.95, 0.5, 0.2, 0.2);
        assert!((b.x - 0.85).abs() < 1e-6);
        assert!(b.x2() <= 1.0);
        assert!((b.width - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_inverted_corners_collapse() {
        let b = BoundingBox::from_corners(0.6, 0.6, 0.4, 0.4);
        assert_eq!(b.width, 0.0);
        assert_eq!(b.height, 0.0);
    }

    #[test]
    fn test_nan_is_clamped() {
        let b = BoundingBox::from_corners(f32::NAN, 0.1, 0.5, 0.5);
        assert_eq!(b.x, 0.0);
        assert!(b.x2() <= 1.0);
    }

    #[test]
    fn test_mask_area() {
        let mut mask = SegmentMask::empty(4, 2);
        mask.data[1] = 255;
        mask.data[6] = 255;
        assert_eq!(mask.area(), 2);
        assert_eq!(mask.get(2, 1), 255);
        assert_eq!(mask.get(10, 10), 0);
    }
}
