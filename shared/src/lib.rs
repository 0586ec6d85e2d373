use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictResponse {
    pub diagnosis: String,
    pub class_index: usize,
    pub certainty_percent: f64,
    /// Grad-CAM overlay, base64 encoded PNG.
    pub heatmap: String,
    pub session_id: String,
}

/// Latest diagnosis recorded for one caller session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub diagnosis: String,
    pub class_index: usize,
    pub certainty_percent: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub labels: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}
