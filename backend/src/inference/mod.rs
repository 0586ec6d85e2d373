pub mod backbone;
pub mod config;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod preprocess;
pub mod saliency;

pub use error::InferenceError;
pub use pipeline::{InferencePipeline, Prediction, PredictionResult};
