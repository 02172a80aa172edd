use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box for a detected face, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Clamp the box to an image of `width` × `height`.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox::new(self.x, self.y, w, h))
    }
}

/// Cut the region under `face` out of a grayscale image.
///
/// The box is clamped to the image first; an empty intersection yields `None`.
pub fn crop_face(image: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let b = face.clamp_to(image.width(), image.height())?;
    Some(image::imageops::crop_imm(image, b.x, b.y, b.width, b.height).to_image())
}

/// Every stored face crop of one identity, as returned by a full store scan.
#[derive(Debug, Clone)]
pub struct IdentityFaces {
    pub usn: String,
    pub faces: Vec<GrayImage>,
}

/// Per-identity face count, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub usn: String,
    pub faces: usize,
}

/// Outcome of classifying one face crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Matched identity, or [`UNKNOWN_IDENTITY`] when no label applies.
    pub usn: String,
    /// Histogram distance to the nearest training sample. Lower is closer.
    pub distance: f64,
}

impl Prediction {
    /// Distance truncated toward zero, as reported to clients.
    ///
    /// Saturates at `i64::MAX`, which is what a query with no training
    /// sample at a finite distance reports.
    pub fn confidence(&self) -> i64 {
        if self.distance >= i64::MAX as f64 {
            i64::MAX
        } else {
            self.distance.trunc() as i64
        }
    }
}

pub const UNKNOWN_IDENTITY: &str = "Unknown";

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_clamp_inside() {
        let b = BoundingBox::new(2, 3, 4, 5);
        assert_eq!(b.clamp_to(100, 100), Some(b));
    }

    #[test]
    fn test_clamp_overhanging() {
        let b = BoundingBox::new(8, 8, 10, 10);
        assert_eq!(b.clamp_to(12, 10), Some(BoundingBox::new(8, 8, 4, 2)));
    }

    #[test]
    fn test_clamp_outside() {
        assert!(BoundingBox::new(20, 0, 5, 5).clamp_to(10, 10).is_none());
    }

    #[test]
    fn test_crop_face_pixels() {
        let img = GrayImage::from_fn(10, 10, |x, y| Luma([(x + 10 * y) as u8]));
        let crop = crop_face(&img, &BoundingBox::new(2, 3, 3, 2)).unwrap();
        assert_eq!(crop.dimensions(), (3, 2));
        assert_eq!(crop.get_pixel(0, 0)[0], 32);
        assert_eq!(crop.get_pixel(2, 1)[0], 44);
    }

    #[test]
    fn test_confidence_truncates() {
        let p = Prediction { usn: "a".into(), distance: 41.97 };
        assert_eq!(p.confidence(), 41);
    }

    #[test]
    fn test_confidence_saturates_for_unbounded_distance() {
        let p = Prediction { usn: UNKNOWN_IDENTITY.into(), distance: f64::MAX };
        assert_eq!(p.confidence(), i64::MAX);
        let p = Prediction { usn: UNKNOWN_IDENTITY.into(), distance: f64::INFINITY };
        assert_eq!(p.confidence(), i64::MAX);
    }
}
