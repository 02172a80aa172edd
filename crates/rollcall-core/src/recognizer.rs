//! Local binary patterns histograms (LBPH) face recognizer.
//!
//! Each face crop is turned into a circular LBP code image, split into a
//! `grid_x × grid_y` grid, and summarised as concatenated per-cell histograms.
//! Prediction is nearest neighbour under the alternative chi-square distance.
//! Crops of different sizes are comparable because every cell histogram is
//! normalised by its pixel count.

use image::GrayImage;
use ndarray::{s, Array1, Array2};
use thiserror::Error;

// --- Named constants ---
const LBPH_DEFAULT_RADIUS: u32 = 1;
const LBPH_DEFAULT_NEIGHBORS: u32 = 8;
const LBPH_DEFAULT_GRID: u32 = 8;
/// 2^16 bins per cell is already far beyond anything useful.
const LBPH_MAX_NEIGHBORS: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("cannot train on an empty set of images")]
    EmptyTrainingSet,
    #[error("got {images} images but {labels} labels")]
    LabelCountMismatch { images: usize, labels: usize },
}

/// LBPH configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbphParams {
    /// Radius of the sampling circle around each pixel.
    pub radius: u32,
    /// Number of sample points on the circle (bits per LBP code).
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Predictions at or beyond this distance yield no label.
    pub threshold: f64,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: LBPH_DEFAULT_RADIUS,
            neighbors: LBPH_DEFAULT_NEIGHBORS,
            grid_x: LBPH_DEFAULT_GRID,
            grid_y: LBPH_DEFAULT_GRID,
            threshold: f64::MAX,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), RecognizerError> {
        if self.radius == 0 {
            return Err(RecognizerError::InvalidParams("radius must be >= 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > LBPH_MAX_NEIGHBORS {
            return Err(RecognizerError::InvalidParams(format!(
                "neighbors must be in 1..={LBPH_MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(RecognizerError::InvalidParams("grid must be at least 1x1".into()));
        }
        if self.threshold.is_nan() {
            return Err(RecognizerError::InvalidParams("threshold is NaN".into()));
        }
        Ok(())
    }

    fn bins(&self) -> usize {
        1usize << self.neighbors
    }
}

/// Nearest-neighbour result of an LBPH prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbphPrediction {
    /// Label of the closest training sample, `None` if nothing was under the threshold.
    pub label: Option<i32>,
    /// Distance to that sample; `f64::MAX` when `label` is `None`.
    pub distance: f64,
}

/// A trained LBPH model: one spatial histogram per training image.
pub struct LbphRecognizer {
    params: LbphParams,
    histograms: Vec<Array1<f32>>,
    labels: Vec<i32>,
}

impl LbphRecognizer {
    /// Fit a model on `images` with the matching `labels`.
    pub fn train(
        params: LbphParams,
        images: &[GrayImage],
        labels: &[i32],
    ) -> Result<Self, RecognizerError> {
        params.validate()?;
        if images.len() != labels.len() {
            return Err(RecognizerError::LabelCountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if images.is_empty() {
            return Err(RecognizerError::EmptyTrainingSet);
        }

        let histograms = images
            .iter()
            .map(|img| spatial_histogram(&params, img))
            .collect();

        Ok(Self {
            params,
            histograms,
            labels: labels.to_vec(),
        })
    }

    pub fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    /// Classify a face crop against every training sample.
    pub fn predict(&self, image: &GrayImage) -> LbphPrediction {
        let query = spatial_histogram(&self.params, image);

        let mut best = LbphPrediction {
            label: None,
            distance: f64::MAX,
        };
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square_alt(hist, &query);
            if distance < best.distance && distance < self.params.threshold {
                best = LbphPrediction {
                    label: Some(label),
                    distance,
                };
            }
        }

        best
    }
}

/// Circular (extended) LBP codes with bilinear sampling.
///
/// The output is `2 * radius` smaller than the input in each dimension; images
/// too small for that produce an empty code image.
fn elbp(image: &GrayImage, radius: u32, neighbors: u32) -> Array2<u32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let r = radius as usize;
    if width <= 2 * r || height <= 2 * r {
        return Array2::zeros((0, 0));
    }

    let src = Array2::from_shape_fn((height, width), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0] as f32
    });
    let mut dst = Array2::<u32>::zeros((height - 2 * r, width - 2 * r));

    for n in 0..neighbors {
        let angle = 2.0 * std::f32::consts::PI * n as f32 / neighbors as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32) * angle.sin();

        let fx = sx.floor() as isize;
        let fy = sy.floor() as isize;
        let cx = sx.ceil() as isize;
        let cy = sy.ceil() as isize;

        let tx = sx - fx as f32;
        let ty = sy - fy as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..height - r {
            for j in r..width - r {
                let at = |dy: isize, dx: isize| {
                    src[[(i as isize + dy) as usize, (j as isize + dx) as usize]]
                };
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = src[[i, j]];
                if t > center || (t - center).abs() < f32::EPSILON {
                    dst[[i - r, j - r]] += 1 << n;
                }
            }
        }
    }

    dst
}

/// Concatenated, per-cell normalised LBP histograms.
fn spatial_histogram(params: &LbphParams, image: &GrayImage) -> Array1<f32> {
    let bins = params.bins();
    let (grid_x, grid_y) = (params.grid_x as usize, params.grid_y as usize);
    let codes = elbp(image, params.radius, params.neighbors);
    let (rows, cols) = codes.dim();
    let cell_w = cols / grid_x;
    let cell_h = rows / grid_y;

    let mut hist = Array1::<f32>::zeros(grid_x * grid_y * bins);
    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let cell = codes.slice(s![gy * cell_h..(gy + 1) * cell_h, gx * cell_w..(gx + 1) * cell_w]);
            let offset = (gy * grid_x + gx) * bins;
            for &code in cell.iter() {
                hist[offset + code as usize] += 1.0;
            }
            let total = cell.len();
            if total > 0 {
                hist.slice_mut(s![offset..offset + bins])
                    .mapv_inplace(|v| v / total as f32);
            }
        }
    }

    hist
}

/// Symmetric chi-square distance: `2 Σ (a - b)² / (a + b)`.
fn chi_square_alt(a: &Array1<f32>, b: &Array1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let sum = x + y;
            if sum > f64::EPSILON {
                2.0 * (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}
