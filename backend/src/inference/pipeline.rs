use std::io::Cursor;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use image::{ImageFormat, RgbImage};
use tch::{Kind, Tensor};

use super::backbone::{Backbone, ResNetBackbone, ResNetDepth, ScriptedBackbone};
use super::config::{Architecture, PipelineConfig};
use super::error::InferenceError;
use super::overlay::OverlayCompositor;
use super::preprocess::ImagePreprocessor;
use super::saliency::{NormalizedCam, SaliencyEngine, to_vec_f32, top_class};

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub class_index: usize,
    pub label: String,
    /// Softmax probability of `class_index` in percent, two decimals.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub result: PredictionResult,
    /// Class the heatmap explains.
    pub explained_class: usize,
    pub cam: NormalizedCam,
    pub overlay: RgbImage,
}

/// Loaded once at startup and shared by every request.
pub struct InferencePipeline {
    preprocessor: ImagePreprocessor,
    engine: Mutex<SaliencyEngine>,
    compositor: OverlayCompositor,
    labels: Vec<String>,
}

impl InferencePipeline {
    pub fn new(
        preprocessor: ImagePreprocessor,
        engine: SaliencyEngine,
        compositor: OverlayCompositor,
        labels: Vec<String>,
    ) -> Result<Self, InferenceError> {
        if labels.len() as i64 != engine.num_classes() {
            return Err(InferenceError::Configuration(format!(
                "{} labels configured for a {}-class model",
                labels.len(),
                engine.num_classes()
            )));
        }
        Ok(Self {
            preprocessor,
            engine: Mutex::new(engine),
            compositor,
            labels,
        })
    }

    /// Loads the configured backbone and wires the pipeline around it.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, InferenceError> {
        config.validate()?;
        let device = config.model.device.to_device();
        let num_classes = config.labels.len() as i64;
        let weights = config.model.weights_path.as_deref().ok_or_else(|| {
            InferenceError::Configuration("model.weights_path is not set".into())
        })?;
        let target_layer = config.model.target_layer.as_deref();

        let backbone: Box<dyn Backbone> = match config.model.architecture {
            Architecture::Resnet18 => Box::new(ResNetBackbone::load(
                ResNetDepth::R18,
                num_classes,
                weights,
                device,
            )?),
            Architecture::Resnet34 => Box::new(ResNetBackbone::load(
                ResNetDepth::R34,
                num_classes,
                weights,
                device,
            )?),
            Architecture::Scripted => {
                let head = config.model.head_path.as_deref().ok_or_else(|| {
                    InferenceError::Configuration(
                        "model.head_path is required for scripted models".into(),
                    )
                })?;
                let layer = target_layer.ok_or_else(|| {
                    InferenceError::Configuration("no target layer configured".into())
                })?;
                Box::new(ScriptedBackbone::load(
                    weights,
                    head,
                    layer,
                    num_classes,
                    device,
                )?)
            }
        };

        let engine = SaliencyEngine::new(backbone, target_layer, config.saliency.epsilon)?;
        Self::new(
            ImagePreprocessor::new(&config.preprocessing, device),
            engine,
            OverlayCompositor::new(config.overlay.alpha),
            config.labels.clone(),
        )
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn predict(&self, raw: &[u8]) -> Result<Prediction, InferenceError> {
        self.predict_with_target(raw, None)
    }

    /// Like [`predict`](Self::predict) but explains `target_class` instead of the top class.
    /// The reported result is always the model's own top class.
    pub fn predict_with_target(
        &self,
        raw: &[u8],
        target_class: Option<i64>,
    ) -> Result<Prediction, InferenceError> {
        let start = Instant::now();
        let (decoded, input) = self.preprocessor.decode_and_prepare(raw)?;

        let saliency = {
            let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.compute_map(&input, target_class)?
        };

        let result = self.calculate_result(&saliency.logits)?;
        let overlay = self.compositor.compose(&decoded, &saliency.cam);

        log::debug!(
            "Predicted {} ({:.2}%), explained class {} in {:?}",
            result.label,
            result.confidence,
            saliency.target_class,
            start.elapsed()
        );
        Ok(Prediction {
            result,
            explained_class: saliency.target_class as usize,
            cam: saliency.cam,
            overlay,
        })
    }

    /// Top class by logit, with its softmax probability as the confidence.
    pub fn calculate_result(&self, logits: &Tensor) -> Result<PredictionResult, InferenceError> {
        if logits.numel() == 0 {
            return Err(InferenceError::SaliencyCapture("model produced no logits".into()));
        }
        let class_index = top_class(logits) as usize;
        let probabilities = to_vec_f32(&logits.softmax(-1, Kind::Float));
        let probability = probabilities.get(class_index).copied().ok_or_else(|| {
            InferenceError::SaliencyCapture(format!("no probability for class {}", class_index))
        })?;
        let label = self.labels.get(class_index).cloned().ok_or_else(|| {
            InferenceError::Configuration(format!("no label for class {}", class_index))
        })?;
        Ok(PredictionResult {
            class_index,
            label,
            confidence: round_percent(probability),
        })
    }

    pub fn encode_png(overlay: &RgbImage) -> Result<Vec<u8>, InferenceError> {
        let mut bytes = Vec::new();
        overlay
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| InferenceError::Encode(e.to_string()))?;
        Ok(bytes)
    }
}

fn round_percent(probability: f32) -> f64 {
    (probability as f64 * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::PreprocessingConfig;
    use tch::Device;

    fn pipeline() -> InferencePipeline {
        tch::manual_seed(3);
        let backbone = ResNetBackbone::new(ResNetDepth::R18, 2, Device::Cpu);
        let engine = SaliencyEngine::new(Box::new(backbone), Some("layer4"), 1e-8).unwrap();
        InferencePipeline::new(
            ImagePreprocessor::new(&PreprocessingConfig::default(), Device::Cpu),
            engine,
            OverlayCompositor::default(),
            vec!["benign".into(), "malignant".into()],
        )
        .unwrap()
    }

    fn logits(values: &[f32]) -> Tensor {
        Tensor::from_slice(values).view([1, values.len() as i64])
    }

    #[test]
    fn test_calculate_result_picks_highest_logit() {
        let result = pipeline().calculate_result(&logits(&[0.0, 2.0])).unwrap();
        assert_eq!(result.class_index, 1);
        assert_eq!(result.label, "malignant");
        assert_eq!(result.confidence, 88.08);
    }

    #[test]
    fn test_calculate_result_ties_go_to_first_class() {
        let result = pipeline().calculate_result(&logits(&[0.0, 0.0])).unwrap();
        assert_eq!(result.class_index, 0);
        assert_eq!(result.confidence, 50.0);
    }

    #[test]
    fn test_near_tie_follows_logits_not_rounded_probabilities() {
        // both softmax values round to 0.5 in f32, the logits still differ
        let scores = logits(&[1e-9, 2e-9]);
        let result = pipeline().calculate_result(&scores).unwrap();
        assert_eq!(result.class_index as i64, top_class(&scores));
        assert_eq!(result.class_index, 1);
        assert_eq!(result.confidence, 50.0);
    }

    #[test]
    fn test_label_count_must_match_classes() {
        let backbone = ResNetBackbone::new(ResNetDepth::R18, 3, Device::Cpu);
        let engine = SaliencyEngine::new(Box::new(backbone), Some("layer4"), 1e-8).unwrap();
        let result = InferencePipeline::new(
            ImagePreprocessor::new(&PreprocessingConfig::default(), Device::Cpu),
            engine,
            OverlayCompositor::default(),
            vec!["benign".into(), "malignant".into()],
        );
        assert!(matches!(result, Err(InferenceError::Configuration(_))));
    }

    #[test]
    fn test_round_percent_two_decimals() {
        assert_eq!(round_percent(1.0), 100.0);
        assert_eq!(round_percent(0.98766), 98.77);
    }

    #[test]
    fn test_encode_png_round_trips_dimensions() {
        let overlay = RgbImage::new(12, 7);
        let bytes = InferencePipeline::encode_png(&overlay).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (12, 7));
    }
}
