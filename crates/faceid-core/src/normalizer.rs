//! Face normalization: decode, explicit channel ordering, exact resize.
//!
//! Faces are assumed to fill the image, so normalization is a plain resize to
//! the canonical square resolution. No detection or alignment is attempted.

use crate::extractor::EmbeddingExtractor;
use crate::types::{ChannelOrder, NormalizedFace};
use image::imageops::{self, FilterType};
use image::ImageFormat;
use thiserror::Error;

/// Canonical FaceNet input resolution.
pub const DEFAULT_FACE_SIZE: u32 = 160;

/// Container formats accepted at every entry point.
pub const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Detect the container format of `bytes`, admitting only JPEG and PNG.
pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, NormalizeError> {
    let format = image::guess_format(bytes)
        .map_err(|_| NormalizeError::UnsupportedFormat("unrecognized image signature".into()))?;
    if ACCEPTED_FORMATS.contains(&format) {
        Ok(format)
    } else {
        Err(NormalizeError::UnsupportedFormat(format!("{format:?}")))
    }
}

/// Converts raw image bytes into a [`NormalizedFace`].
#[derive(Debug, Clone, Copy)]
pub struct FaceNormalizer {
    size: u32,
    order: ChannelOrder,
}

impl Default for FaceNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_FACE_SIZE, ChannelOrder::Rgb)
    }
}

impl FaceNormalizer {
    pub fn new(size: u32, order: ChannelOrder) -> Self {
        Self { size, order }
    }

    /// Normalizer producing exactly the input shape an extractor declares.
    pub fn for_extractor(extractor: &dyn EmbeddingExtractor) -> Self {
        Self::new(extractor.input_size(), extractor.channel_order())
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<NormalizedFace, NormalizeError> {
        let format = detect_format(bytes)?;
        let decoded = image::load_from_memory_with_format(bytes, format)?;
        let rgb = decoded.to_rgb8();

        // Triangle = bilinear; deterministic and always lands on the exact size.
        let resized = imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);

        let mut pixels = resized.into_raw();
        if self.order == ChannelOrder::Bgr {
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }

        Ok(NormalizedFace {
            pixels,
            size: self.size,
            order: self.order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode, solid_image};
    use image::{Rgb, RgbImage};

    #[test]
    fn test_output_shape_independent_of_input_resolution() {
        let normalizer = FaceNormalizer::default();
        for (w, h) in [(1, 1), (37, 300), (640, 480), (160, 160), (1000, 20)] {
            let bytes = encode(&solid_image(w, h, [10, 20, 30]), ImageFormat::Png);
            let face = normalizer.normalize(&bytes).unwrap();
            assert_eq!(face.size, DEFAULT_FACE_SIZE);
            assert_eq!(face.shape(), (160, 160, 3));
            assert_eq!(face.pixels.len(), 160 * 160 * 3, "input {w}x{h}");
        }
    }

    #[test]
    fn test_rgb_order_preserved() {
        let bytes = encode(&solid_image(50, 80, [200, 100, 10]), ImageFormat::Png);
        let face = FaceNormalizer::new(32, ChannelOrder::Rgb).normalize(&bytes).unwrap();
        assert_eq!(face.order, ChannelOrder::Rgb);
        assert_eq!(face.pixel(0, 0), [200, 100, 10]);
        assert_eq!(face.pixel(31, 31), [200, 100, 10]);
    }

    #[test]
    fn test_bgr_order_is_explicit() {
        let bytes = encode(&solid_image(50, 80, [200, 100, 10]), ImageFormat::Png);
        let face = FaceNormalizer::new(32, ChannelOrder::Bgr).normalize(&bytes).unwrap();
        assert_eq!(face.order, ChannelOrder::Bgr);
        assert_eq!(face.pixel(5, 7), [10, 100, 200]);
    }

    #[test]
    fn test_jpeg_accepted() {
        let bytes = encode(&solid_image(64, 64, [120, 120, 120]), ImageFormat::Jpeg);
        let face = FaceNormalizer::new(16, ChannelOrder::Rgb).normalize(&bytes).unwrap();
        assert_eq!(face.pixels.len(), 16 * 16 * 3);
    }

    #[test]
    fn test_resize_is_deterministic() {
        let img = RgbImage::from_fn(97, 53, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, ((x + y) % 256) as u8]));
        let bytes = encode(&img, ImageFormat::Png);
        let normalizer = FaceNormalizer::default();
        assert_eq!(normalizer.normalize(&bytes).unwrap(), normalizer.normalize(&bytes).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = FaceNormalizer::default().normalize(b"definitely not an image").unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_truncated_png_is_decode_error() {
        let bytes = encode(&solid_image(64, 64, [1, 2, 3]), ImageFormat::Png);
        let err = FaceNormalizer::default().normalize(&bytes[..40]).unwrap_err();
        assert!(matches!(err, NormalizeError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn test_other_formats_rejected() {
        let bytes = encode(&solid_image(8, 8, [1, 2, 3]), ImageFormat::Bmp);
        let err = detect_format(&bytes).unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedFormat(_)));
    }
}
