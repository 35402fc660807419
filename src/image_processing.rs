use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum ImageProcessingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("jpeg encoding failed: width={width}, height={height}, reason={reason}")]
    Encode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("no quality level fits within {budget} bytes (smallest was {smallest})")]
    OverBudget { budget: usize, smallest: usize },

    #[error("processing task aborted")]
    Aborted,
}

#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub max_image_pixels: u64,
    pub max_input_bytes: usize,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
    /// Longest side after downscaling.
    pub output_max_dimension: u32,
    pub max_concurrent_ops: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_image_pixels: 100_000_000,
            max_input_bytes: 50 * 1024 * 1024,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: 15_000,
            output_max_dimension: 1920,
            max_concurrent_ops: 4,
        }
    }
}

/// Quality ladder for fitting an encoded image under a byte budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityLadder {
    pub initial: u8,
    pub step: u8,
    pub attempts: u8,
}

impl Default for QualityLadder {
    fn default() -> Self {
        Self {
            initial: 90,
            step: 15,
            attempts: 5,
        }
    }
}

impl QualityLadder {
    pub fn levels(self) -> impl Iterator<Item = u8> {
        (0..self.attempts).map_while(move |i| {
            let drop = u16::from(i) * u16::from(self.step);
            let quality = u16::from(self.initial).checked_sub(drop)?;
            (quality > 0).then_some(quality as u8)
        })
    }
}

/// Runs decode/resize on the blocking pool with bounded concurrency.
pub struct ImageProcessor {
    config: ProcessingConfig,
    semaphore: Arc<Semaphore>,
}

impl ImageProcessor {
    pub fn new(config: ProcessingConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops.max(1)));
        Self { config, semaphore }
    }

    /// Decode downloaded bytes and shrink them to the configured dimension.
    #[instrument(skip(self, raw_bytes), fields(input_size = raw_bytes.len()))]
    pub async fn decode_and_downscale(
        &self,
        raw_bytes: Vec<u8>,
    ) -> Result<DynamicImage, ImageProcessingError> {
        let start = Instant::now();
        counter!("image.decode_and_downscale.requests").increment(1);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImageProcessingError::Aborted)?;

        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || {
            let img = decode_image(&config, &raw_bytes)?;
            Ok(downscale(img, config.output_max_dimension))
        })
        .await
        .map_err(|_| ImageProcessingError::Aborted)?;

        histogram!("image.decode_and_downscale.duration_ms")
            .record(start.elapsed().as_millis() as f64);

        if let Err(e) = &result {
            counter!("image.decode_and_downscale.errors").increment(1);
            warn!(error = %e, "decode_and_downscale failed");
        }

        result
    }
}

pub fn decode_image(
    config: &ProcessingConfig,
    raw_bytes: &[u8],
) -> Result<DynamicImage, ImageProcessingError> {
    if raw_bytes.is_empty() {
        return Err(ImageProcessingError::EmptyInput);
    }

    if raw_bytes.len() > config.max_input_bytes {
        return Err(ImageProcessingError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: config.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImageProcessingError::Decode { source: e.into() })?;

    if reader.format().is_none() {
        return Err(ImageProcessingError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader.decode()?;
    let (w, h) = img.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if pixels > config.max_image_pixels {
        return Err(ImageProcessingError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok(img)
}

/// Shrinks so the longest side is at most `max_dimension`, keeping aspect ratio.
pub fn downscale(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if max_dimension == 0 || (w <= max_dimension && h <= max_dimension) {
        return img;
    }
    img.resize(
        max_dimension,
        max_dimension,
        image::imageops::FilterType::Triangle,
    )
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageProcessingError> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();

    if width == 0 || height == 0 {
        return Err(ImageProcessingError::Encode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let mut buffer = Vec::with_capacity((width * height) as usize / 4);
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| ImageProcessingError::Encode {
            width,
            height,
            reason: e.to_string(),
        })?;

    Ok(buffer)
}

/// Encode at decreasing quality until the output fits in `budget` bytes.
pub fn encode_within_budget(
    img: &DynamicImage,
    budget: usize,
    ladder: QualityLadder,
) -> Result<(Vec<u8>, u8), ImageProcessingError> {
    let mut smallest = usize::MAX;
    for quality in ladder.levels() {
        let encoded = encode_jpeg(img, quality)?;
        if encoded.len() <= budget {
            debug!(quality, size = encoded.len(), "encoded within budget");
            return Ok((encoded, quality));
        }
        smallest = smallest.min(encoded.len());
    }
    Err(ImageProcessingError::OverBudget { budget, smallest })
}

/// Approximate in-memory footprint of a decoded image.
pub fn decoded_size(img: &DynamicImage) -> usize {
    img.as_bytes().len()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Rgba};
    use proptest::prelude::*;

    pub(crate) fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        let mut buffer = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buffer);
        encoder
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buffer
    }

    #[test]
    fn decode_rejects_empty() {
        let config = ProcessingConfig::default();
        assert!(matches!(
            decode_image(&config, &[]),
            Err(ImageProcessingError::EmptyInput)
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        let config = ProcessingConfig::default();
        assert!(decode_image(&config, &[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let config = ProcessingConfig {
            max_input_bytes: 100,
            ..Default::default()
        };
        let result = decode_image(&config, &[0u8; 101]);
        assert!(matches!(result, Err(ImageProcessingError::InputTooLarge { .. })));
    }

    #[test]
    fn downscale_keeps_aspect_ratio() {
        let img = image::load_from_memory(&create_test_png(400, 200)).unwrap();
        let small = downscale(img, 100);
        assert_eq!(small.dimensions(), (100, 50));
    }

    #[test]
    fn downscale_leaves_small_images_alone() {
        let img = image::load_from_memory(&create_test_png(40, 20)).unwrap();
        assert_eq!(downscale(img, 100).dimensions(), (40, 20));
    }

    #[test]
    fn quality_ladder_steps_down() {
        let levels: Vec<_> = QualityLadder::default().levels().collect();
        assert_eq!(levels, vec![90, 75, 60, 45, 30]);

        let short: Vec<_> = QualityLadder {
            initial: 20,
            step: 15,
            attempts: 5,
        }
        .levels()
        .collect();
        assert_eq!(short, vec![20, 5]);
    }

    #[test]
    fn encode_within_budget_picks_first_fitting_quality() {
        let img = image::load_from_memory(&create_test_png(64, 64)).unwrap();
        let (bytes, quality) =
            encode_within_budget(&img, usize::MAX, QualityLadder::default()).unwrap();
        assert_eq!(quality, 90);
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[test]
    fn encode_within_budget_reports_over_budget() {
        let img = image::load_from_memory(&create_test_png(64, 64)).unwrap();
        let result = encode_within_budget(&img, 16, QualityLadder::default());
        assert!(matches!(
            result,
            Err(ImageProcessingError::OverBudget { budget: 16, .. })
        ));
    }

    #[tokio::test]
    async fn processor_downscales_on_blocking_pool() {
        let processor = ImageProcessor::new(ProcessingConfig {
            output_max_dimension: 32,
            ..Default::default()
        });
        let img = processor
            .decode_and_downscale(create_test_png(128, 64))
            .await
            .unwrap();
        assert_eq!(img.dimensions(), (32, 16));
    }

    proptest! {
        #[test]
        fn downscale_never_exceeds_bound(w in 1u32..300, h in 1u32..300, max in 1u32..200) {
            let img = DynamicImage::new_rgb8(w, h);
            let (ow, oh) = downscale(img, max).dimensions();
            prop_assert!(ow <= max && oh <= max);
            prop_assert!(ow >= 1 && oh >= 1);
        }
    }
}
