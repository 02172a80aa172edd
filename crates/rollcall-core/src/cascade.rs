//! Haar feature cascade classifier.
//!
//! Loads boosted cascades in the OpenCV `opencv-cascade-classifier` XML format
//! (e.g. `haarcascade_frontalface_default.xml`) and evaluates them on a single
//! detection window using integral images. Multi-scale scanning and candidate
//! grouping live in [`crate::detector`].

use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Windows with `area / sqrt(area * sq_sum - sum^2)` at or above this are not
/// classified.
const LOW_CONTRAST_LIMIT: f64 = 0.1;

/// File name of the stock OpenCV frontal-face cascade.
pub const DEFAULT_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";

/// Directories where OpenCV packages usually install their Haar cascades.
const CASCADE_SEARCH_DIRS: &[&str] = &[
    ".",
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/local/share/opencv/haarcascades",
    "/opt/homebrew/share/opencv4/haarcascades",
];

/// First existing copy of [`DEFAULT_CASCADE_FILE`] in the usual install locations.
pub fn default_cascade_path() -> Option<PathBuf> {
    CASCADE_SEARCH_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(DEFAULT_CASCADE_FILE))
        .find(|path| path.is_file())
}

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Parse(#[from] quick_xml::DeError),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

// --- XML schema (only the parts the evaluator needs) ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeXml {
    stage_type: String,
    feature_type: String,
    height: u32,
    width: u32,
    stages: ItemsXml<StageXml>,
    features: ItemsXml<FeatureXml>,
}

/// OpenCV FileStorage sequences serialize every element as `<_>`.
#[derive(Deserialize)]
struct ItemsXml<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageXml {
    stage_threshold: f64,
    weak_classifiers: ItemsXml<WeakClassifierXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeakClassifierXml {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: ItemsXml<String>,
    #[serde(default)]
    tilted: Option<i32>,
}

// --- Evaluator representation ---

#[derive(Debug, Clone, Copy, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree.
///
/// `left`/`right` > 0 index another node; <= 0 index the leaf `-left`/`-right`.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// Result of running the cascade on one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    Accepted,
    /// Rejected by the stage with this index.
    Rejected(usize),
    /// Skipped before any stage ran: the window is too uniform to classify.
    LowContrast,
}

/// A loaded boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let storage: StorageXml = quick_xml::de::from_str(xml)?;
        let raw = storage.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!(
                "stage type {}",
                raw.stage_type.trim()
            )));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!(
                "feature type {}",
                raw.feature_type.trim()
            )));
        }
        // The variance normalisation window is inset by one pixel on every side.
        if raw.width < 3 || raw.height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {}x{} is too small",
                raw.width, raw.height
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .enumerate()
            .map(|(i, f)| parse_feature(i, f, raw.width, raw.height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .enumerate()
            .map(|(i, s)| parse_stage(i, s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window_width: raw.width,
            window_height: raw.height,
            stages,
            features,
        })
    }

    /// Detection window size the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Evaluate the cascade on the window whose top-left corner is `(x, y)`.
    ///
    /// The caller guarantees the window lies inside the integral image.
    pub fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> WindowVerdict {
        let Some(inv_norm) = self.variance_norm_factor(integral, x, y) else {
            return WindowVerdict::LowContrast;
        };

        for (si, stage) in self.stages.iter().enumerate() {
            let mut sum = 0.0f64;
            for weak in &stage.classifiers {
                let mut idx = 0usize;
                loop {
                    let node = &weak.nodes[idx];
                    let value = self.feature_value(integral, node.feature, x, y) * inv_norm;
                    let next = if value < node.threshold { node.left } else { node.right };
                    if next <= 0 {
                        sum += weak.leaves[next.unsigned_abs() as usize];
                        break;
                    }
                    idx = next as usize;
                }
            }
            if sum < stage.threshold {
                return WindowVerdict::Rejected(si);
            }
        }

        WindowVerdict::Accepted
    }

    /// `1 / (area * stddev)` over the window inset by one pixel.
    ///
    /// `None` for flat windows and for windows with a standard deviation of
    /// 10 grey levels or less.
    fn variance_norm_factor(&self, integral: &IntegralImage, x: u32, y: u32) -> Option<f64> {
        let w = self.window_width - 2;
        let h = self.window_height - 2;
        let area = (w * h) as f64;
        let sum = integral.sum(x + 1, y + 1, w, h) as f64;
        let sq_sum = integral.sq_sum(x + 1, y + 1, w, h) as f64;
        let nf = area * sq_sum - sum * sum;
        if nf <= 0.0 {
            return None;
        }
        let inv_norm = 1.0 / nf.sqrt();
        (area * inv_norm < LOW_CONTRAST_LIMIT).then_some(inv_norm)
    }

    fn feature_value(&self, integral: &IntegralImage, feature: usize, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

fn parse_numbers<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>, CascadeError> {
    text.split_ascii_whitespace()
        .map(|t| {
            t.parse::<T>()
                .map_err(|_| CascadeError::Invalid(format!("bad number {t:?} in {what}")))
        })
        .collect()
}

fn parse_feature(
    index: usize,
    raw: &FeatureXml,
    window_width: u32,
    window_height: u32,
) -> Result<HaarFeature, CascadeError> {
    if raw.tilted.unwrap_or(0) != 0 {
        return Err(CascadeError::Unsupported(format!("tilted feature {index}")));
    }
    if raw.rects.items.is_empty() || raw.rects.items.len() > 3 {
        return Err(CascadeError::Invalid(format!(
            "feature {index} has {} rects",
            raw.rects.items.len()
        )));
    }

    let mut rects = Vec::with_capacity(raw.rects.items.len());
    for text in &raw.rects.items {
        let nums: Vec<f64> = parse_numbers(text, "feature rect")?;
        let &[x, y, w, h, weight] = &nums[..] else {
            return Err(CascadeError::Invalid(format!(
                "feature {index} rect needs 5 values, got {}",
                nums.len()
            )));
        };
        if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
            return Err(CascadeError::Invalid(format!("feature {index} has a degenerate rect")));
        }
        let rect = WeightedRect {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
            weight,
        };
        if rect.x + rect.width > window_width || rect.y + rect.height > window_height {
            return Err(CascadeError::Invalid(format!(
                "feature {index} rect exceeds the {window_width}x{window_height} window"
            )));
        }
        rects.push(rect);
    }

    Ok(HaarFeature { rects })
}

fn parse_stage(index: usize, raw: &StageXml, feature_count: usize) -> Result<Stage, CascadeError> {
    let mut classifiers = Vec::with_capacity(raw.weak_classifiers.items.len());

    for weak in &raw.weak_classifiers.items {
        let node_values: Vec<f64> = parse_numbers(&weak.internal_nodes, "internalNodes")?;
        let leaves: Vec<f64> = parse_numbers(&weak.leaf_values, "leafValues")?;

        // Categorical (LBP-style) nodes carry subset masks; HAAR nodes are 4 values each.
        if node_values.is_empty() || node_values.len() % 4 != 0 {
            return Err(CascadeError::Invalid(format!(
                "stage {index}: internalNodes length {} is not a multiple of 4",
                node_values.len()
            )));
        }

        let nodes: Vec<Node> = node_values
            .chunks_exact(4)
            .map(|c| Node {
                left: c[0] as i32,
                right: c[1] as i32,
                feature: c[2] as usize,
                threshold: c[3],
            })
            .collect();

        for node in &nodes {
            if node.feature >= feature_count {
                return Err(CascadeError::Invalid(format!(
                    "stage {index}: feature index {} out of range",
                    node.feature
                )));
            }
            for child in [node.left, node.right] {
                let ok = if child > 0 {
                    (child as usize) < nodes.len()
                } else {
                    (child.unsigned_abs() as usize) < leaves.len()
                };
                if !ok {
                    return Err(CascadeError::Invalid(format!(
                        "stage {index}: child index {child} out of range"
                    )));
                }
            }
        }

        classifiers.push(WeakClassifier { nodes, leaves });
    }

    Ok(Stage {
        threshold: raw.stage_threshold,
        classifiers,
    })
}

/// Summed-area tables of pixel values and squared pixel values.
pub struct IntegralImage {
    sum: Image<Luma<u64>>,
    sq_sum: Image<Luma<u64>>,
}

impl IntegralImage {
    pub fn new(image: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(image),
            sq_sum: integral_squared_image::<_, u64>(image),
        }
    }

    /// Sum of pixels in the rectangle `[x, x+w) × [y, y+h)`. `w` and `h` must be non-zero.
    pub fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        sum_image_pixels(&self.sum, x, y, x + w - 1, y + h - 1)[0]
    }

    /// Sum of squared pixels in the rectangle `[x, x+w) × [y, y+h)`.
    pub fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        sum_image_pixels(&self.sq_sum, x, y, x + w - 1, y + h - 1)[0]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 4×4 single-stage cascade that fires on a dark-left / bright-right edge.
    pub(crate) const EDGE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 2 4 -1.</_>
        <_>
          2 0 2 4 1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    pub(crate) fn edge_image(width: u32, height: u32, edge_x: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([if x < edge_x { 0 } else { 255 }]))
    }

    #[test]
    fn test_parse_edge_cascade() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        assert_eq!(cascade.window_size(), (4, 4));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.features[0].rects.len(), 2);
        assert_eq!(cascade.features[0].rects[1].weight, 1.0);
    }

    #[test]
    fn test_integral_sums() {
        let img = GrayImage::from_fn(3, 3, |x, y| Luma([(x + 3 * y) as u8]));
        let integral = IntegralImage::new(&img);
        assert_eq!(integral.sum(0, 0, 3, 3), 36);
        assert_eq!(integral.sum(1, 1, 2, 2), 4 + 5 + 7 + 8);
        assert_eq!(integral.sq_sum(0, 0, 2, 1), 1);
    }

    #[test]
    fn test_evaluate_edge_window() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let integral = IntegralImage::new(&edge_image(8, 4, 2));
        // Window at x=0 straddles the edge: two dark columns, two bright.
        assert_eq!(cascade.evaluate(&integral, 0, 0), WindowVerdict::Accepted);
        // Window at x=4 is entirely bright.
        assert_eq!(cascade.evaluate(&integral, 4, 0), WindowVerdict::LowContrast);
        // Bright-to-dark contrast fails the only stage.
        let reversed = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 255 } else { 0 }]));
        let integral = IntegralImage::new(&reversed);
        assert_eq!(cascade.evaluate(&integral, 0, 0), WindowVerdict::Rejected(0));
    }

    #[test]
    fn test_flat_window_skipped() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        let integral = IntegralImage::new(&GrayImage::from_pixel(4, 4, Luma([90])));
        assert_eq!(cascade.evaluate(&integral, 0, 0), WindowVerdict::LowContrast);
    }

    fn two_tone(left: u8, right: u8) -> GrayImage {
        GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { left } else { right }]))
    }

    #[test]
    fn test_low_contrast_window_skipped() {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        // Inner 2x2 is 100/104: stddev 2.
        let faint = IntegralImage::new(&two_tone(100, 104));
        assert_eq!(cascade.evaluate(&faint, 0, 0), WindowVerdict::LowContrast);
        // Stddev exactly 10 is still too faint.
        let borderline = IntegralImage::new(&two_tone(100, 120));
        assert_eq!(cascade.evaluate(&borderline, 0, 0), WindowVerdict::LowContrast);
        // Stddev 15 is classified, and the edge fires.
        let clear = IntegralImage::new(&two_tone(100, 130));
        assert_eq!(cascade.evaluate(&clear, 0, 0), WindowVerdict::Accepted);
    }

    #[test]
    fn test_reject_wrong_feature_type() {
        let xml = EDGE_CASCADE.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(matches!(
            HaarCascade::from_xml(&xml),
            Err(CascadeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_tilted_feature() {
        let xml = EDGE_CASCADE.replace("</rects></_></features>", "</rects>\n      <tilted>1</tilted></_></features>");
        assert!(matches!(
            HaarCascade::from_xml(&xml),
            Err(CascadeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_rect_outside_window() {
        let xml = EDGE_CASCADE.replace("2 0 2 4 1.", "3 0 2 4 1.");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_reject_bad_feature_index() {
        let xml = EDGE_CASCADE.replace("0 -1 0 1.", "0 -1 7 1.");
        assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            HaarCascade::load("/nonexistent/cascade.xml"),
            Err(CascadeError::NotFound(_))
        ));
    }
}
