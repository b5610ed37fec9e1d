use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

/// Upload byte budget used when the caller does not configure one (2 MiB).
pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_DIMENSION_PX: u32 = 1600;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Shrinks oversized images before they are uploaded for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePreprocessor {
    pub max_bytes: usize,
    pub max_dimension_px: u32,
    pub jpeg_quality: u8,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_dimension_px: DEFAULT_MAX_DIMENSION_PX,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ImagePreprocessor {
    pub fn new(max_bytes: usize, max_dimension_px: u32, jpeg_quality: u8) -> Self {
        Self {
            max_bytes,
            max_dimension_px,
            jpeg_quality,
        }
    }

    /// Reduce `bytes` to fit the byte budget.
    ///
    /// Images already within `max_bytes` come back untouched. Anything larger
    /// is downscaled by a power-of-two factor until both sides fit within
    /// `max_dimension_px`, then re-encoded once as JPEG. The result is not
    /// guaranteed to land under `max_bytes`.
    pub fn reduce(&self, bytes: &[u8]) -> Result<Vec<u8>, PreprocessError> {
        if bytes.len() <= self.max_bytes {
            return Ok(bytes.to_vec());
        }

        let start = std::time::Instant::now();

        // Header only: no pixel decode yet
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(image::ImageError::IoError(e)))?
            .into_dimensions()
            .map_err(PreprocessError::Decode)?;

        let factor = subsample_factor(width, height, self.max_dimension_px);

        let decoded = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(image::ImageError::IoError(e)))?
            .decode()
            .map_err(PreprocessError::Decode)?;

        let resized = if factor > 1 {
            decoded.resize_exact(
                (width / factor).max(1),
                (height / factor).max(1),
                FilterType::Triangle,
            )
        } else {
            decoded
        };

        let output = encode_jpeg(&resized, self.jpeg_quality)?;

        metrics::histogram!("scan_preprocess_seconds").record(start.elapsed().as_secs_f64());
        tracing::debug!(
            original_bytes = bytes.len(),
            reduced_bytes = output.len(),
            width,
            height,
            factor,
            "Image reduced for upload"
        );

        Ok(output)
    }
}

/// Reduce with the default JPEG quality of 80.
pub fn reduce(
    bytes: &[u8],
    max_bytes: usize,
    max_dimension_px: u32,
) -> Result<Vec<u8>, PreprocessError> {
    ImagePreprocessor::new(max_bytes, max_dimension_px, DEFAULT_JPEG_QUALITY).reduce(bytes)
}

/// Smallest power of two `k` with `width / k` and `height / k` both within
/// `max_dimension_px`.
///
/// The last doubling can overshoot: a 1700px side ends up at 850px.
pub fn subsample_factor(width: u32, height: u32, max_dimension_px: u32) -> u32 {
    let max_dimension_px = max_dimension_px.max(1);
    let mut factor = 1u32;
    while width / factor > max_dimension_px || height / factor > max_dimension_px {
        factor *= 2;
    }
    factor
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, PreprocessError> {
    // JPEG carries no alpha channel
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)))
        .map_err(PreprocessError::Encode)?;
    Ok(buffer)
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Input is not a decodable image: {0}")]
    Decode(image::ImageError),

    #[error("Failed to re-encode image: {0}")]
    Encode(image::ImageError),
}
