//! Base64 data-URL image decoding.
//!
//! Clients send images as `"<prefix>,<base64 payload>"` (typically
//! `data:image/jpeg;base64,...`). Everything up to the first comma is
//! discarded, the rest is base64-decoded and handed to the `image` crate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use thiserror::Error;

// BT.601 luma weights, the usual computer-vision grayscale conversion.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image payload has no data-url prefix separator")]
    MissingSeparator,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a decodable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Color space requested from the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Grayscale,
    Color,
}

/// A decoded raster in the requested color space.
#[derive(Debug, Clone)]
pub enum DecodedImage {
    Gray(GrayImage),
    Color(RgbImage),
}

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DecodedImage::Gray(img) => img.dimensions(),
            DecodedImage::Color(img) => img.dimensions(),
        }
    }

    /// Grayscale view of the image. Color images are converted with BT.601 weights.
    pub fn to_gray(&self) -> GrayImage {
        match self {
            DecodedImage::Gray(img) => img.clone(),
            DecodedImage::Color(img) => rgb_to_gray(img),
        }
    }

    pub fn into_gray(self) -> GrayImage {
        match self {
            DecodedImage::Gray(img) => img,
            DecodedImage::Color(img) => rgb_to_gray(&img),
        }
    }
}

/// Decode a `"<prefix>,<base64>"` string into an image.
pub fn decode_data_url(input: &str, mode: ColorMode) -> Result<DecodedImage, DecodeError> {
    let (_, payload) = input.split_once(',').ok_or(DecodeError::MissingSeparator)?;
    let cleaned: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(cleaned.as_bytes())?;
    decode_bytes(&bytes, mode)
}

/// Decode raw image container bytes (JPEG, PNG, ...) into the requested color space.
pub fn decode_bytes(bytes: &[u8], mode: ColorMode) -> Result<DecodedImage, DecodeError> {
    let dynamic = image::load_from_memory(bytes)?;
    Ok(convert(dynamic, mode))
}

fn convert(dynamic: DynamicImage, mode: ColorMode) -> DecodedImage {
    match dynamic {
        // Already single-channel: keep the samples as they are.
        DynamicImage::ImageLuma8(gray) => match mode {
            ColorMode::Grayscale => DecodedImage::Gray(gray),
            ColorMode::Color => DecodedImage::Color(DynamicImage::ImageLuma8(gray).to_rgb8()),
        },
        other => {
            let rgb = other.to_rgb8();
            match mode {
                ColorMode::Grayscale => DecodedImage::Gray(rgb_to_gray(&rgb)),
                ColorMode::Color => DecodedImage::Color(rgb),
            }
        }
    }
}

fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}
