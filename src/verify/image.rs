use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use std::io::Cursor;
use thiserror::Error;

/// What the gateway receives for a product photo. Inline carries a
/// `data:image/jpeg;base64,` URI; Reference passes the original URL through
/// for the vision model to fetch itself.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    Inline(String),
    Reference(String),
}

impl ImagePayload {
    pub fn as_url(&self) -> &str {
        match self {
            ImagePayload::Inline(uri) => uri,
            ImagePayload::Reference(url) => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("image fetch failed: {0}")]
    Fetch(String),
    #[error("image payload not decodable: {0}")]
    Decode(String),
    #[error("image re-encode failed: {0}")]
    Encode(String),
}

/// Passthrough is the default: vision models accept plain URLs, and the
/// normalization step is a best-effort OCR aid, not a correctness
/// requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreprocessMode {
    #[default]
    Passthrough,
    Normalize,
}

impl PreprocessMode {
    pub fn from_env() -> Self {
        match std::env::var("IMAGE_PREPROCESS").as_deref() {
            Ok("normalize") | Ok("inline") | Ok("1") | Ok("true") => PreprocessMode::Normalize,
            _ => PreprocessMode::Passthrough,
        }
    }
}

#[derive(Clone)]
pub struct ImagePreprocessor {
    http: Client,
    mode: PreprocessMode,
}

impl ImagePreprocessor {
    pub fn new(http: Client, mode: PreprocessMode) -> Self {
        Self { http, mode }
    }

    pub async fn prepare(&self, image_url: &str) -> Result<ImagePayload, ImageFetchError> {
        match self.mode {
            PreprocessMode::Passthrough => Ok(ImagePayload::Reference(image_url.to_string())),
            PreprocessMode::Normalize => {
                let bytes = self.fetch_bytes(image_url).await?;
                inline_payload(&bytes)
            }
        }
    }

    async fn fetch_bytes(&self, image_url: &str) -> Result<Vec<u8>, ImageFetchError> {
        let response = self
            .http
            .get(image_url)
            .send()
            .await
            .map_err(|err| ImageFetchError::Fetch(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageFetchError::Fetch(format!("HTTP {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ImageFetchError::Fetch(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Greyscale + contrast stretch + JPEG + base64 data URI, mirroring the
/// label-OCR preparation the photos were originally tuned for.
pub(crate) fn inline_payload(bytes: &[u8]) -> Result<ImagePayload, ImageFetchError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| ImageFetchError::Decode(err.to_string()))?;

    let mut luma = decoded.to_luma8();
    stretch_contrast(&mut luma);
    let normalized = DynamicImage::ImageLuma8(luma);

    let mut encoded = Vec::new();
    normalized
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Jpeg)
        .map_err(|err| ImageFetchError::Encode(err.to_string()))?;

    Ok(ImagePayload::Inline(format!(
        "data:image/jpeg;base64,{}",
        BASE64.encode(&encoded)
    )))
}

fn stretch_contrast(luma: &mut image::GrayImage) {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for pixel in luma.pixels() {
        min = min.min(pixel.0[0]);
        max = max.max(pixel.0[0]);
    }
    if max <= min {
        return;
    }
    let range = (max - min) as f32;
    for pixel in luma.pixels_mut() {
        let value = pixel.0[0];
        pixel.0[0] = (((value - min) as f32 / range) * 255.0).round() as u8;
    }
}
