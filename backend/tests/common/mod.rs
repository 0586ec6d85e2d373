#![allow(dead_code)]

use std::io::Cursor;

use histolens::inference::InferencePipeline;
use histolens::inference::backbone::{ResNetBackbone, ResNetDepth};
use histolens::inference::config::PreprocessingConfig;
use histolens::inference::overlay::OverlayCompositor;
use histolens::inference::preprocess::ImagePreprocessor;
use histolens::inference::saliency::SaliencyEngine;
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use tch::Device;

pub fn labels() -> Vec<String> {
    vec!["benign".into(), "malignant".into()]
}

/// ResNet-18 with seeded random weights, explained at `layer4`.
pub fn random_pipeline(seed: i64) -> InferencePipeline {
    tch::manual_seed(seed);
    let backbone = ResNetBackbone::new(ResNetDepth::R18, 2, Device::Cpu);
    let engine = SaliencyEngine::new(Box::new(backbone), Some("layer4"), 1e-8).unwrap();
    InferencePipeline::new(
        ImagePreprocessor::new(&PreprocessingConfig::default(), Device::Cpu),
        engine,
        OverlayCompositor::default(),
        labels(),
    )
    .unwrap()
}

/// Stained-tissue-like texture: smooth background with a few dark nuclei.
pub fn tissue(width: u32, height: u32, offset: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let nucleus = [(0.3, 0.4), (0.7, 0.6), (0.5, 0.2)].iter().any(|(cx, cy)| {
            let dx = x as f32 - cx * width as f32 - offset as f32;
            let dy = y as f32 - cy * height as f32;
            dx * dx + dy * dy < (width.min(height) as f32 / 12.0).powi(2)
        });
        if nucleus {
            Rgb([70, 30, 120])
        } else {
            Rgb([
                (200 + (x * 7 + y * 3 + offset) % 40) as u8,
                (120 + (x * 5 + offset) % 60) as u8,
                (170 + (y * 11) % 50) as u8,
            ])
        }
    })
}

pub fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

pub fn tissue_png(width: u32, height: u32, offset: u32) -> Vec<u8> {
    encode(tissue(width, height, offset).into(), ImageFormat::Png)
}

pub fn grayscale_png(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, y| Luma([((x * 3 + y * 2) % 256) as u8]));
    encode(image.into(), ImageFormat::Png)
}
