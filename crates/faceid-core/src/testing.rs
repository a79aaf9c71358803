//! Shared fixtures for unit tests.

use crate::extractor::{l2_normalize, EmbeddingExtractor, ExtractionError};
use crate::types::{ChannelOrder, Embedding, NormalizedFace};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;

pub const GRID_MODEL_VERSION: &str = "grid-test";

pub fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(rgb))
}

pub fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buf, format)
        .unwrap();
    buf.into_inner()
}

pub fn png_bytes(rgb: [u8; 3]) -> Vec<u8> {
    encode(&solid_image(48, 64, rgb), ImageFormat::Png)
}

pub fn write_png(path: &Path, rgb: [u8; 3]) {
    std::fs::write(path, png_bytes(rgb)).unwrap();
}

pub fn face_from_fn(size: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> NormalizedFace {
    let mut pixels = Vec::with_capacity((size * size * 3) as usize);
    for y in 0..size {
        for x in 0..size {
            pixels.extend_from_slice(&f(x, y));
        }
    }
    NormalizedFace {
        pixels,
        size,
        order: ChannelOrder::Rgb,
    }
}

/// Deterministic stand-in for a real model: mean of each channel over a
/// 2x2 grid of the face, L2-normalized (12 dims).
pub struct GridExtractor {
    size: u32,
}

impl GridExtractor {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl EmbeddingExtractor for GridExtractor {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    fn dimension(&self) -> usize {
        12
    }

    fn model_version(&self) -> Option<&str> {
        Some(GRID_MODEL_VERSION)
    }

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, ExtractionError> {
        let half = (face.size / 2).max(1);
        let mut sums = [0f32; 12];
        let mut counts = [0f32; 4];
        for y in 0..face.size {
            for x in 0..face.size {
                let cell = ((y / half).min(1) * 2 + (x / half).min(1)) as usize;
                let px = face.pixel(x, y);
                for c in 0..3 {
                    sums[cell * 3 + c] += px[c] as f32 / 255.0;
                }
                counts[cell] += 1.0;
            }
        }
        let values = sums
            .iter()
            .enumerate()
            .map(|(i, s)| s / counts[i / 3].max(1.0))
            .collect();
        Ok(Embedding {
            values: l2_normalize(values),
            model_version: Some(GRID_MODEL_VERSION.into()),
        })
    }
}

/// Extractor whose model "produces" NaN for every input.
pub struct NanExtractor {
    size: u32,
}

impl NanExtractor {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl EmbeddingExtractor for NanExtractor {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    fn dimension(&self) -> usize {
        12
    }

    fn embed(&self, _face: &NormalizedFace) -> Result<Embedding, ExtractionError> {
        Ok(Embedding::new(vec![f32::NAN; 12]))
    }
}
