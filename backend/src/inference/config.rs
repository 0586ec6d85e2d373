use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::InferenceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub saliency: SaliencyConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Resnet18,
    Resnet34,
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl DeviceChoice {
    pub fn to_device(self) -> tch::Device {
        match self {
            DeviceChoice::Auto => tch::Device::cuda_if_available(),
            DeviceChoice::Cpu => tch::Device::Cpu,
            DeviceChoice::Cuda => tch::Device::Cuda(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub architecture: Architecture,
    /// Weights for the ResNet variants, or the features module for `scripted`.
    pub weights_path: Option<PathBuf>,
    /// Head module, only used by `scripted`.
    pub head_path: Option<PathBuf>,
    pub target_layer: Option<String>,
    #[serde(default)]
    pub device: DeviceChoice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    pub epsilon: f64,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self { epsilon: 1e-8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub alpha: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub allowed_origin: Option<String>,
    /// Sessions kept before the least recently updated one is dropped.
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            allowed_origin: None,
            max_sessions: 1024,
        }
    }
}

/// `config/pipeline.yaml` under the working directory, else the copy in the source workspace.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("config/pipeline.yaml");
    if local.is_file() {
        local
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/pipeline.yaml")
    }
}

fn default_labels() -> Vec<String> {
    vec!["benign".into(), "malignant".into()]
}

impl PipelineConfig {
    /// Loads from `HISTOLENS_CONFIG`, falling back to [`default_config_path`].
    pub fn load() -> Result<Self, InferenceError> {
        let config_path = std::env::var("HISTOLENS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        log::info!("Loading pipeline configuration from {}", config_path.display());
        let mut config = Self::from_path(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, InferenceError> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, InferenceError> {
        serde_yaml::from_str(config_str)
            .map_err(|e| InferenceError::Configuration(format!("invalid pipeline config: {}", e)))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(weights) = std::env::var("MODEL_WEIGHTS") {
            self.model.weights_path = Some(PathBuf::from(weights));
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Checks the constraints that do not require loading the model.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.labels.is_empty() {
            return Err(InferenceError::Configuration("no class labels configured".into()));
        }
        if self.preprocessing.input_size == 0 {
            return Err(InferenceError::Configuration("input_size must be positive".into()));
        }
        if self.preprocessing.std.iter().any(|s| *s == 0.0) {
            return Err(InferenceError::Configuration(
                "normalization std must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.overlay.alpha) {
            return Err(InferenceError::Configuration(format!(
                "overlay alpha {} outside [0, 1]",
                self.overlay.alpha
            )));
        }
        if self.saliency.epsilon <= 0.0 {
            return Err(InferenceError::Configuration("saliency epsilon must be positive".into()));
        }
        if self.server.max_sessions == 0 {
            return Err(InferenceError::Configuration("max_sessions must be positive".into()));
        }
        if self.model.target_layer.is_none() {
            return Err(InferenceError::Configuration("no target layer configured".into()));
        }
        Ok(())
    }
}
