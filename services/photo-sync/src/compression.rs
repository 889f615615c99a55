//! Shrinks oversized photos before transfer.
//!
//! Only raster images above the configured threshold are touched. They are
//! downscaled so the longest edge fits `max_dimension` and re-encoded as JPEG,
//! lowering the quality until the output fits the byte budget. Anything that
//! goes wrong falls back to the original bytes.

use crate::config::CompressionConfig;
use crate::model::SourceFile;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to encode jpeg at quality {quality}: {reason}")]
    Encode { quality: u8, reason: String },
}

const COMPRESSIBLE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp", "image/bmp"];

pub struct CompressionStage {
    config: CompressionConfig,
}

impl CompressionStage {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Whether `file` is a candidate for compression at all.
    pub fn applies_to(&self, file: &SourceFile) -> bool {
        self.config.enabled
            && file.size() > self.config.threshold_bytes
            && COMPRESSIBLE_TYPES.contains(&file.mime_type.to_ascii_lowercase().as_str())
    }

    /// Compress `file`, or hand it back unchanged. Never fails.
    ///
    /// CPU bound; call it from the blocking pool.
    pub fn compress(&self, file: SourceFile) -> SourceFile {
        if !self.applies_to(&file) {
            return file;
        }

        match self.try_compress(&file) {
            Ok(Some(compressed)) => {
                debug!(
                    filename = %file.filename,
                    original_bytes = file.size(),
                    compressed_bytes = compressed.size(),
                    "Image compressed"
                );
                metrics::counter!("photo_sync.compression.applied").increment(1);
                compressed
            }
            Ok(None) => {
                debug!(filename = %file.filename, "Compression did not shrink image, keeping original");
                file
            }
            Err(e) => {
                warn!(filename = %file.filename, error = %e, "Compression failed, uploading original");
                metrics::counter!("photo_sync.compression.failed").increment(1);
                file
            }
        }
    }

    fn try_compress(&self, file: &SourceFile) -> Result<Option<SourceFile>, CompressionError> {
        let img = image::load_from_memory(&file.bytes)?;
        let img = self.downscale(img);
        // JPEG has no alpha channel
        let img = img.to_rgb8();

        let mut quality = self.config.initial_quality.clamp(1, 100);
        let min_quality = self.config.min_quality.clamp(1, quality);
        let step = self.config.quality_step.max(1);

        let encoded = loop {
            let buf = encode_jpeg(&img, quality)?;
            if buf.len() <= self.config.target_bytes || quality <= min_quality {
                break buf;
            }
            quality = quality.saturating_sub(step).max(min_quality);
        };

        if encoded.len() >= file.size() {
            return Ok(None);
        }

        Ok(Some(SourceFile {
            filename: jpeg_filename(&file.filename),
            mime_type: "image/jpeg".to_string(),
            bytes: Bytes::from(encoded),
        }))
    }

    fn downscale(&self, img: DynamicImage) -> DynamicImage {
        let max = self.config.max_dimension;
        if img.width() <= max && img.height() <= max {
            return img;
        }
        // resize keeps the aspect ratio and fits inside max x max
        img.resize(max, max, FilterType::Triangle)
    }
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(img.as_raw(), img.width(), img.height(), ColorType::Rgb8)
        .map_err(|e| CompressionError::Encode {
            quality,
            reason: e.to_string(),
        })?;
    Ok(buf)
}

/// `photo.png` -> `photo.jpg`
fn jpeg_filename(filename: &str) -> String {
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };
    format!("{stem}.jpg")
}
