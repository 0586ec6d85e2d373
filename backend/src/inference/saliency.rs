//! Gradient-weighted class activation mapping.

use ndarray::Array2;
use tch::{Device, Kind, Tensor};

use super::backbone::Backbone;
use super::error::InferenceError;
use super::preprocess::ModelInput;

/// Class activation map at model-input resolution, scaled to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCam {
    pub values: Array2<f32>,
}

impl NormalizedCam {
    /// `(height, width)`
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }
}

#[derive(Debug)]
pub struct SaliencyOutput {
    /// Logits of the forward pass that produced the map, shape `[1, num_classes]`.
    pub logits: Tensor,
    /// Class whose evidence the map shows.
    pub target_class: i64,
    pub cam: NormalizedCam,
}

/// Grad-CAM over a frozen backbone at one named layer.
///
/// Each call captures its own activation and gradient; nothing is cached between calls.
/// The backbone itself is not `Sync`, so callers share an engine behind a lock.
pub struct SaliencyEngine {
    backbone: Box<dyn Backbone>,
    target_layer: String,
    epsilon: f64,
}

impl SaliencyEngine {
    pub fn new(
        backbone: Box<dyn Backbone>,
        target_layer: Option<&str>,
        epsilon: f64,
    ) -> Result<Self, InferenceError> {
        let target_layer = target_layer
            .ok_or_else(|| InferenceError::Configuration("no target layer configured".into()))?;
        if !backbone.has_layer(target_layer) {
            return Err(InferenceError::Configuration(format!(
                "backbone has no layer named `{}`",
                target_layer
            )));
        }
        Ok(Self {
            backbone,
            target_layer: target_layer.to_string(),
            epsilon,
        })
    }

    pub fn num_classes(&self) -> i64 {
        self.backbone.num_classes()
    }

    /// Explains `target_class`, or the top-scoring class when `None`.
    pub fn compute_map(
        &self,
        input: &ModelInput,
        target_class: Option<i64>,
    ) -> Result<SaliencyOutput, InferenceError> {
        let capture = self
            .backbone
            .forward_capture(&input.tensor, &self.target_layer)?;
        let logits = capture.logits;
        let activation = capture.activation;

        let num_classes = logits.size().last().copied().unwrap_or(0);
        let target_class = match target_class {
            Some(class) if (0..num_classes).contains(&class) => class,
            Some(class) => {
                return Err(InferenceError::InvalidTargetClass {
                    requested: class,
                    num_classes,
                });
            }
            None => top_class(&logits),
        };

        let mut seed = vec![0f32; num_classes as usize];
        seed[target_class as usize] = 1.0;
        let one_hot = Tensor::from_slice(&seed)
            .view([1, num_classes])
            .to_device(logits.device());
        let score = (&logits * &one_hot).sum(Kind::Float);

        let gradient = Tensor::f_run_backward(&[&score], &[&activation], false, false)
            .map_err(|e| {
                InferenceError::SaliencyCapture(format!(
                    "backward pass did not reach `{}`: {}",
                    self.target_layer, e
                ))
            })?
            .into_iter()
            .next()
            .filter(|g| g.defined())
            .ok_or_else(|| {
                InferenceError::SaliencyCapture(format!(
                    "no gradient captured at `{}`",
                    self.target_layer
                ))
            })?;
        if activation.dim() != 4 || gradient.size() != activation.size() {
            return Err(InferenceError::SaliencyCapture(format!(
                "activation {:?} and gradient {:?} at `{}` are not matching feature maps",
                activation.size(),
                gradient.size(),
                self.target_layer
            )));
        }
        log::debug!(
            "Grad-CAM at `{}`: activation {:?}, target class {}",
            self.target_layer,
            activation.size(),
            target_class
        );

        let cam = tch::no_grad(|| {
            let raw = grad_cam(&activation.detach(), &gradient);
            let upsampled =
                raw.upsample_bilinear2d([input.size, input.size], false, None::<f64>, None::<f64>);
            normalize_map(&upsampled, self.epsilon)
        });
        let values = Array2::from_shape_vec(
            (input.size as usize, input.size as usize),
            to_vec_f32(&cam),
        )
        .map_err(|e| InferenceError::SaliencyCapture(format!("unexpected map shape: {}", e)))?;

        Ok(SaliencyOutput {
            logits: logits.detach(),
            target_class,
            cam: NormalizedCam { values },
        })
    }
}

/// Channel weights are the spatial mean of the gradient; the map is the weighted channel
/// sum with negative evidence clipped.
///
/// `activation` and `gradient` are `[batch, channels, h, w]`; the result is `[batch, 1, h, w]`.
pub fn grad_cam(activation: &Tensor, gradient: &Tensor) -> Tensor {
    let size = activation.size();
    let (batch, channels, height, width) = (size[0], size[1], size[2], size[3]);
    let weights = gradient
        .adaptive_avg_pool2d([1, 1])
        .reshape([batch, 1, channels]);
    weights
        .matmul(&activation.reshape([batch, channels, height * width]))
        .reshape([batch, 1, height, width])
        .relu()
}

/// Min-max scaling with `epsilon` added to the range, so constant maps become all zero.
pub fn normalize_map(cam: &Tensor, epsilon: f64) -> Tensor {
    let min = cam.min();
    let max = cam.max();
    (cam - &min) / ((max - &min) + epsilon)
}

/// Index of the highest logit; ties go to the lowest index.
pub(crate) fn top_class(logits: &Tensor) -> i64 {
    logits.argmax(-1, false).int64_value(&[0])
}

pub(crate) fn to_vec_f32(tensor: &Tensor) -> Vec<f32> {
    let flat = tensor
        .to_kind(Kind::Float)
        .to_device(Device::Cpu)
        .view([-1]);
    let num_elements = flat.size()[0] as usize;
    let mut output_vec = vec![0.0f32; num_elements];
    flat.copy_data(&mut output_vec, num_elements);
    output_vec
}
