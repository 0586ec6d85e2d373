use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::Array2;

use super::saliency::NormalizedCam;

#[derive(Debug, Clone, Copy)]
pub struct OverlayCompositor {
    alpha: f32,
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

impl OverlayCompositor {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Blends the jet-colored map over `image` at the image's own resolution.
    pub fn compose(&self, image: &RgbImage, cam: &NormalizedCam) -> RgbImage {
        let (width, height) = image.dimensions();
        let resized = resize_map(&cam.values, width, height);
        let alpha = self.alpha;
        RgbImage::from_fn(width, height, |x, y| {
            let intensity = (255.0 * resized.get_pixel(x, y)[0]) as u8;
            let heat = jet(intensity);
            let base = image.get_pixel(x, y);
            Rgb(std::array::from_fn(|c| {
                let blended = alpha * heat[c] as f32 + (1.0 - alpha) * base[c] as f32;
                blended.round().clamp(0.0, 255.0) as u8
            }))
        })
    }
}

fn resize_map(values: &Array2<f32>, width: u32, height: u32) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (rows, cols) = values.dim();
    let map = ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
        Luma([values[[y as usize, x as usize]]])
    });
    if (cols as u32, rows as u32) == (width, height) {
        map
    } else {
        imageops::resize(&map, width, height, FilterType::Triangle)
    }
}

/// Blue → cyan → yellow → red heat ramp.
pub fn jet(intensity: u8) -> [u8; 3] {
    let v = intensity as f32 / 255.0;
    let channel = |center: f32| ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}
