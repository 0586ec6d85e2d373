#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Saliency capture error: {0}")]
    SaliencyCapture(String),
    #[error("Target class {requested} out of range for {num_classes} classes")]
    InvalidTargetClass { requested: i64, num_classes: i64 },
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
    #[error("Overlay encoding error: {0}")]
    Encode(String),
}

impl InferenceError {
    /// Whether the failure was caused by the caller's input rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InferenceError::InvalidImage(_) | InferenceError::InvalidTargetClass { .. }
        )
    }
}
