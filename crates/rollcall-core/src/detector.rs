//! Multi-scale Haar cascade face detector.
//!
//! Scans an image pyramid with a [`HaarCascade`], then clusters the raw window
//! hits so that each face is reported once. Output order is the order in which
//! clusters are first seen during the scan; callers relying on "the first face"
//! get that ordering.

use crate::cascade::{CascadeError, HaarCascade, IntegralImage, WindowVerdict};
use crate::types::BoundingBox;
use image::{GrayImage, Luma};
use std::path::Path;

// --- Named constants ---
const DEFAULT_SCALE_FACTOR: f64 = 1.3;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
/// Relative tolerance when deciding whether two hits belong to the same face.
const GROUP_EPS: f64 = 0.2;

/// Anything that can find faces in a grayscale image.
pub trait FaceDetector: Send {
    /// Return face bounding boxes in a deterministic order; empty when none found.
    fn detect(&self, image: &GrayImage) -> Vec<BoundingBox>;
}

/// Tunable multi-scale detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// Hits a cluster needs beyond this count to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest face (width, height) to report. Defaults to the cascade window.
    pub min_size: Option<(u32, u32)>,
    /// Largest face (width, height) to report. Defaults to the image size.
    pub max_size: Option<(u32, u32)>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: None,
            max_size: None,
        }
    }
}

/// Face detector backed by a boosted Haar cascade.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectionParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectionParams) -> Result<Self, CascadeError> {
        if !params.scale_factor.is_finite() || params.scale_factor <= 1.0 {
            return Err(CascadeError::Invalid(format!(
                "scale factor must be a finite value > 1, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    /// Load the cascade XML at `path` and wrap it in a detector.
    pub fn load(path: impl AsRef<Path>, params: DetectionParams) -> Result<Self, CascadeError> {
        Self::new(HaarCascade::load(path)?, params)
    }

    /// Raw accepted windows over all pyramid levels, before grouping.
    fn scan(&self, image: &GrayImage) -> Vec<BoundingBox> {
        let (img_w, img_h) = image.dimensions();
        let (win_w, win_h) = self.cascade.window_size();
        let (min_w, min_h) = self.params.min_size.unwrap_or((win_w, win_h));
        let (max_w, max_h) = self.params.max_size.unwrap_or((img_w, img_h));

        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_win_w = (win_w as f64 * factor).round() as u32;
            let scaled_win_h = (win_h as f64 * factor).round() as u32;
            if scaled_win_w > max_w || scaled_win_h > max_h {
                break;
            }

            let level_w = (img_w as f64 / factor).round() as u32;
            let level_h = (img_h as f64 / factor).round() as u32;
            if level_w < win_w || level_h < win_h {
                break;
            }

            if scaled_win_w >= min_w && scaled_win_h >= min_h {
                let integral = if factor == 1.0 {
                    IntegralImage::new(image)
                } else {
                    IntegralImage::new(&resize_bilinear(image, level_w, level_h))
                };
                let step = if factor > 2.0 { 1 } else { 2 };
                let before = candidates.len();

                for y in (0..=level_h - win_h).step_by(step as usize) {
                    let mut x = 0;
                    while x <= level_w - win_w {
                        match self.cascade.evaluate(&integral, x, y) {
                            WindowVerdict::Accepted => candidates.push(BoundingBox::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                scaled_win_w,
                                scaled_win_h,
                            )),
                            // Rejected right away: the neighbour is unlikely to fire either.
                            WindowVerdict::Rejected(0) => x += step,
                            WindowVerdict::Rejected(_) | WindowVerdict::LowContrast => {}
                        }
                        x += step;
                    }
                }

                tracing::trace!(
                    factor,
                    level = ?(level_w, level_h),
                    hits = candidates.len() - before,
                    "scanned pyramid level"
                );
            }

            factor *= self.params.scale_factor;
        }

        candidates
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, image: &GrayImage) -> Vec<BoundingBox> {
        let candidates = self.scan(image);
        let raw = candidates.len();
        let faces = if self.params.min_neighbors == 0 {
            candidates
        } else {
            group_rectangles(&candidates, self.params.min_neighbors, GROUP_EPS)
        };
        tracing::debug!(raw, faces = faces.len(), "cascade detection finished");
        faces
    }
}

/// Resize a grayscale image with bilinear interpolation (pixel-center aligned).
pub fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let frame = src.as_raw();
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w as usize * new_h as usize];
    for y in 0..new_h as usize {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w as usize {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w as usize + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_w, new_h, resized)
        .unwrap_or_else(|| GrayImage::from_pixel(new_w, new_h, Luma([0])))
}

/// Two hits describe the same face when every edge is within `eps` of the mean size.
fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Partition `rects` into equivalence classes of [`similar`] boxes.
///
/// Returns a class label per rect; labels are numbered by first appearance.
fn partition(rects: &[BoundingBox], eps: f64) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = vec![0; n];
    let mut classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels[i] = class_of_root[root];
    }

    (labels, classes)
}

/// Merge overlapping hits into one averaged box per face.
///
/// Clusters with `<= group_threshold` members are dropped, as are clusters
/// lying inside a larger cluster with more support.
pub fn group_rectangles(rects: &[BoundingBox], group_threshold: u32, eps: f64) -> Vec<BoundingBox> {
    if rects.is_empty() {
        return Vec::new();
    }

    let (labels, classes) = partition(rects, eps);

    let mut sums = vec![[0u64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (rect, &cls) in rects.iter().zip(&labels) {
        sums[cls][0] += rect.x as u64;
        sums[cls][1] += rect.y as u64;
        sums[cls][2] += rect.width as u64;
        sums[cls][3] += rect.height as u64;
        counts[cls] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            BoundingBox::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut grouped = Vec::new();
    for i in 0..classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = &averaged[i];

        let nested = (0..classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = &averaged[j];
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            grouped.push(*r1);
        }
    }

    grouped
}
