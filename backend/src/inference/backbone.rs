use std::path::Path;

use tch::nn;
use tch::{CModule, Device, Tensor};

use super::error::InferenceError;

/// Output of one forward pass with the target layer exposed.
///
/// `activation` is a gradient-tracking leaf spliced in at the target layer, so a backward
/// pass from `logits` yields the gradient with respect to that layer's output.
#[derive(Debug)]
pub struct Capture {
    pub logits: Tensor,
    pub activation: Tensor,
}

/// A frozen classifier that can expose one internal layer.
pub trait Backbone: Send {
    fn num_classes(&self) -> i64;

    fn has_layer(&self, layer: &str) -> bool;

    /// Runs the network in evaluation mode, capturing the output of `layer`.
    fn forward_capture(&self, input: &Tensor, layer: &str) -> Result<Capture, InferenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResNetDepth {
    R18,
    R34,
}

impl ResNetDepth {
    fn blocks(self) -> [i64; 4] {
        match self {
            ResNetDepth::R18 => [2, 2, 2, 2],
            ResNetDepth::R34 => [3, 4, 6, 3],
        }
    }
}

/// Torchvision-compatible ResNet with a replaced `num_classes`-way head.
pub struct ResNetBackbone {
    vs: nn::VarStore,
    stages: Vec<(String, nn::SequentialT)>,
    fc: nn::Linear,
    num_classes: i64,
}

fn conv2d(
    p: nn::Path,
    c_in: i64,
    c_out: i64,
    ksize: i64,
    padding: i64,
    stride: i64,
) -> nn::Conv2D {
    let conv2d_cfg = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, conv2d_cfg)
}

fn downsample(p: nn::Path, c_in: i64, c_out: i64, stride: i64) -> nn::SequentialT {
    if stride != 1 || c_in != c_out {
        nn::seq_t()
            .add(conv2d(&p / "0", c_in, c_out, 1, 0, stride))
            .add(nn::batch_norm2d(&p / "1", c_out, Default::default()))
    } else {
        nn::seq_t()
    }
}

fn basic_block(p: nn::Path, c_in: i64, c_out: i64, stride: i64) -> nn::FuncT<'static> {
    let conv1 = conv2d(&p / "conv1", c_in, c_out, 3, 1, stride);
    let bn1 = nn::batch_norm2d(&p / "bn1", c_out, Default::default());
    let conv2 = conv2d(&p / "conv2", c_out, c_out, 3, 1, 1);
    let bn2 = nn::batch_norm2d(&p / "bn2", c_out, Default::default());
    let downsample = downsample(&p / "downsample", c_in, c_out, stride);
    nn::func_t(move |xs, train| {
        let ys = xs
            .apply(&conv1)
            .apply_t(&bn1, train)
            .relu()
            .apply(&conv2)
            .apply_t(&bn2, train);
        (xs.apply_t(&downsample, train) + ys).relu()
    })
}

fn stage(p: nn::Path, c_in: i64, c_out: i64, stride: i64, cnt: i64) -> nn::SequentialT {
    let mut layer = nn::seq_t().add(basic_block(&p / "0", c_in, c_out, stride));
    for block_index in 1..cnt {
        layer = layer.add(basic_block(&p / block_index, c_out, c_out, 1));
    }
    layer
}

impl ResNetBackbone {
    /// Builds the network with freshly initialised weights.
    pub fn new(depth: ResNetDepth, num_classes: i64, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let p = vs.root();
        let stem = nn::seq_t()
            .add(conv2d(&p / "conv1", 3, 64, 7, 3, 2))
            .add(nn::batch_norm2d(&p / "bn1", 64, Default::default()))
            .add_fn(|xs| xs.relu())
            .add_fn(|xs| xs.max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false));

        let [b1, b2, b3, b4] = depth.blocks();
        let stages = vec![
            ("stem".to_string(), stem),
            ("layer1".to_string(), stage(&p / "layer1", 64, 64, 1, b1)),
            ("layer2".to_string(), stage(&p / "layer2", 64, 128, 2, b2)),
            ("layer3".to_string(), stage(&p / "layer3", 128, 256, 2, b3)),
            ("layer4".to_string(), stage(&p / "layer4", 256, 512, 2, b4)),
        ];
        let fc = nn::linear(&p / "fc", 512, num_classes, Default::default());

        let mut backbone = Self {
            vs,
            stages,
            fc,
            num_classes,
        };
        backbone.vs.freeze();
        backbone
    }

    /// Builds the network and loads trained weights (`.safetensors` or `.ot`).
    pub fn load(
        depth: ResNetDepth,
        num_classes: i64,
        weights: &Path,
        device: Device,
    ) -> Result<Self, InferenceError> {
        if !weights.exists() {
            return Err(InferenceError::Configuration(format!(
                "model weights not found at {}",
                weights.display()
            )));
        }
        let mut backbone = Self::new(depth, num_classes, device);
        backbone.vs.load(weights).map_err(|e| {
            InferenceError::Configuration(format!(
                "failed to load weights from {}: {}",
                weights.display(),
                e
            ))
        })?;
        backbone.vs.freeze();
        log::info!(
            "Loaded {:?} backbone ({} classes) from {} on {:?}",
            depth,
            num_classes,
            weights.display(),
            device
        );
        Ok(backbone)
    }
}

impl Backbone for ResNetBackbone {
    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn has_layer(&self, layer: &str) -> bool {
        self.stages.iter().any(|(name, _)| name == layer)
    }

    fn forward_capture(&self, input: &Tensor, layer: &str) -> Result<Capture, InferenceError> {
        let mut xs = input.shallow_clone();
        let mut activation = None;
        for (name, stage) in &self.stages {
            xs = xs.apply_t(stage, false);
            if name == layer {
                let leaf = xs.detach().set_requires_grad(true);
                xs = leaf.shallow_clone();
                activation = Some(leaf);
            }
        }
        let logits = xs
            .adaptive_avg_pool2d([1, 1])
            .flat_view()
            .apply(&self.fc);
        let activation = activation.ok_or_else(|| {
            InferenceError::SaliencyCapture(format!("layer `{}` never executed", layer))
        })?;
        Ok(Capture { logits, activation })
    }
}

/// A TorchScript classifier exported as two modules split at the target layer.
pub struct ScriptedBackbone {
    features: CModule,
    head: CModule,
    layer: String,
    num_classes: i64,
}

impl ScriptedBackbone {
    pub fn load(
        features_path: &Path,
        head_path: &Path,
        layer: &str,
        num_classes: i64,
        device: Device,
    ) -> Result<Self, InferenceError> {
        let features = load_module(features_path, device)?;
        let head = load_module(head_path, device)?;
        log::info!(
            "Loaded scripted backbone split at `{}` from {} + {} on {:?}",
            layer,
            features_path.display(),
            head_path.display(),
            device
        );
        Ok(Self::from_modules(features, head, layer, num_classes))
    }

    /// `features` ends at `layer`; `head` maps its output to `num_classes` logits.
    pub fn from_modules(features: CModule, head: CModule, layer: &str, num_classes: i64) -> Self {
        Self {
            features,
            head,
            layer: layer.to_string(),
            num_classes,
        }
    }
}

fn load_module(path: &Path, device: Device) -> Result<CModule, InferenceError> {
    let mut module = CModule::load_on_device(path, device).map_err(|e| {
        InferenceError::Configuration(format!(
            "failed to load TorchScript module {}: {}",
            path.display(),
            e
        ))
    })?;
    module.set_eval();
    Ok(module)
}

impl Backbone for ScriptedBackbone {
    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn has_layer(&self, layer: &str) -> bool {
        self.layer == layer
    }

    fn forward_capture(&self, input: &Tensor, layer: &str) -> Result<Capture, InferenceError> {
        if !self.has_layer(layer) {
            return Err(InferenceError::SaliencyCapture(format!(
                "scripted backbone exposes `{}`, not `{}`",
                self.layer, layer
            )));
        }
        let activation = tch::no_grad(|| self.features.forward_ts(&[input]))?
            .detach()
            .set_requires_grad(true);
        let logits = self.head.forward_ts(&[&activation])?;
        if logits.size().last().copied() != Some(self.num_classes) {
            return Err(InferenceError::Configuration(format!(
                "scripted head produced shape {:?}, expected {} classes",
                logits.size(),
                self.num_classes
            )));
        }
        Ok(Capture { logits, activation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_resnet18_capture_shapes() {
        tch::manual_seed(7);
        let backbone = ResNetBackbone::new(ResNetDepth::R18, 2, Device::Cpu);
        let input = Tensor::randn([1, 3, 224, 224], (Kind::Float, Device::Cpu));
        let capture = backbone.forward_capture(&input, "layer4").unwrap();
        assert_eq!(capture.logits.size(), vec![1, 2]);
        assert_eq!(capture.activation.size(), vec![1, 512, 7, 7]);
        assert!(capture.activation.requires_grad());
    }

    #[test]
    fn test_earlier_layer_has_higher_resolution() {
        tch::manual_seed(7);
        let backbone = ResNetBackbone::new(ResNetDepth::R18, 2, Device::Cpu);
        let input = Tensor::randn([1, 3, 224, 224], (Kind::Float, Device::Cpu));
        let capture = backbone.forward_capture(&input, "layer3").unwrap();
        assert_eq!(capture.activation.size(), vec![1, 256, 14, 14]);
    }

    #[test]
    fn test_unknown_layer_is_a_capture_error() {
        let backbone = ResNetBackbone::new(ResNetDepth::R18, 2, Device::Cpu);
        assert!(!backbone.has_layer("layer9"));
        let input = Tensor::zeros([1, 3, 64, 64], (Kind::Float, Device::Cpu));
        assert!(matches!(
            backbone.forward_capture(&input, "layer9"),
            Err(InferenceError::SaliencyCapture(_))
        ));
    }

    #[test]
    fn test_layer_names_follow_torchvision() {
        let backbone = ResNetBackbone::new(ResNetDepth::R34, 3, Device::Cpu);
        for name in ["stem", "layer1", "layer2", "layer3", "layer4"] {
            assert!(backbone.has_layer(name));
        }
        assert!(!backbone.has_layer("fc"));
        assert_eq!(backbone.num_classes(), 3);
    }

    #[test]
    fn test_missing_weights_is_configuration_error() {
        let result = ResNetBackbone::load(
            ResNetDepth::R18,
            2,
            Path::new("does/not/exist.safetensors"),
            Device::Cpu,
        );
        assert!(matches!(result, Err(InferenceError::Configuration(_))));
    }

    #[test]
    fn test_missing_scripted_module_is_configuration_error() {
        let result = ScriptedBackbone::load(
            Path::new("missing/features.pt"),
            Path::new("missing/head.pt"),
            "features",
            2,
            Device::Cpu,
        );
        assert!(matches!(result, Err(InferenceError::Configuration(_))));
    }

    /// Features are a ReLU over 3 channels; the head pools each channel into one logit.
    fn traced_backbone(num_classes: i64) -> ScriptedBackbone {
        let example = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let features = CModule::create_by_tracing(
            "Features",
            "forward",
            &[example.shallow_clone()],
            &mut |xs: &[Tensor]| vec![xs[0].relu()],
        )
        .unwrap();
        let head = CModule::create_by_tracing(
            "Head",
            "forward",
            &[example],
            &mut |xs: &[Tensor]| vec![xs[0].adaptive_avg_pool2d([1, 1]).flatten(1, -1)],
        )
        .unwrap();
        ScriptedBackbone::from_modules(features, head, "features", num_classes)
    }

    #[test]
    fn test_scripted_capture_exposes_split_point() {
        let backbone = traced_backbone(3);
        let input = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let capture = backbone.forward_capture(&input, "features").unwrap();
        assert_eq!(capture.logits.size(), vec![1, 3]);
        assert_eq!(capture.activation.size(), vec![1, 3, 4, 4]);
        assert!(capture.activation.requires_grad());
    }

    #[test]
    fn test_scripted_wrong_layer_is_capture_error() {
        let backbone = traced_backbone(3);
        let input = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(!backbone.has_layer("layer4"));
        assert!(matches!(
            backbone.forward_capture(&input, "layer4"),
            Err(InferenceError::SaliencyCapture(_))
        ));
    }

    #[test]
    fn test_scripted_head_class_mismatch_is_configuration_error() {
        let backbone = traced_backbone(2);
        let input = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            backbone.forward_capture(&input, "features"),
            Err(InferenceError::Configuration(_))
        ));
    }
}
