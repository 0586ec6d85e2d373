use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use tch::{Device, Tensor};

use super::config::PreprocessingConfig;
use super::error::InferenceError;

/// Normalized `[1, 3, size, size]` float tensor ready for the backbone.
#[derive(Debug)]
pub struct ModelInput {
    pub tensor: Tensor,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    device: Device,
}

impl ImagePreprocessor {
    pub fn new(config: &PreprocessingConfig, device: Device) -> Self {
        Self {
            input_size: config.input_size,
            mean: config.mean,
            std: config.std,
            device,
        }
    }

    /// Decodes `raw` into an RGB image at its original resolution plus the model input
    /// built from its resized center crop.
    pub fn decode_and_prepare(&self, raw: &[u8]) -> Result<(RgbImage, ModelInput), InferenceError> {
        let decoded = image::load_from_memory(raw)?.to_rgb8();
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(InferenceError::InvalidImage(image::ImageError::Limits(
                image::error::LimitError::from_kind(image::error::LimitErrorKind::DimensionError),
            )));
        }
        let cropped = self.resize_and_crop(&decoded);
        let input = self.to_tensor(&cropped);
        log::debug!(
            "Decoded {}x{} image into {:?} model input",
            decoded.width(),
            decoded.height(),
            input.tensor.size()
        );
        Ok((decoded, input))
    }

    /// Centered square crop of the shorter edge, scaled to `input_size`.
    ///
    /// Cropping before resampling keeps the work proportional to the source image, so very
    /// elongated inputs never expand into a huge intermediate buffer.
    pub fn resize_and_crop(&self, image: &RgbImage) -> RgbImage {
        let size = self.input_size;
        let (width, height) = image.dimensions();
        let side = width.min(height);
        let left = crop_offset(width, side);
        let top = crop_offset(height, side);
        let square = imageops::crop_imm(image, left, top, side, side).to_image();
        if side == size {
            square
        } else {
            imageops::resize(&square, size, size, FilterType::Triangle)
        }
    }

    fn to_tensor(&self, image: &RgbImage) -> ModelInput {
        let size = self.input_size as usize;
        let normalized = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            let sample = image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            (sample - self.mean[c]) / self.std[c]
        });
        let data: Vec<f32> = normalized.iter().copied().collect();
        let tensor = Tensor::from_slice(&data)
            .reshape([1, 3, size as i64, size as i64])
            .to_device(self.device);
        ModelInput {
            tensor,
            size: size as i64,
        }
    }
}

fn crop_offset(length: u32, crop: u32) -> u32 {
    ((length.saturating_sub(crop)) as f64 / 2.0).round_ties_even() as u32
}
