use actix_multipart::Multipart;
use actix_web::{Error, HttpRequest, HttpResponse, web};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{StreamExt, TryStreamExt};
use log::{error, info};
use serde::Deserialize;
use shared::{ErrorResponse, HealthResponse, PredictResponse};
use uuid::Uuid;

use crate::inference::{InferenceError, InferencePipeline};
use crate::session::SessionStore;

pub const SESSION_HEADER: &str = "X-Session-Id";

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub target_class: Option<i64>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/predict").route(web::post().to(handle_predict)))
        .service(web::resource("/api/sessions/{session_id}").route(web::get().to(get_session)))
        .service(web::resource("/api/health").route(web::get().to(health)));
}

fn error_response(err: &InferenceError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    if err.is_client_error() {
        HttpResponse::BadRequest().json(body)
    } else {
        HttpResponse::InternalServerError().json(body)
    }
}

async fn handle_predict(
    req: HttpRequest,
    pipeline: web::Data<InferencePipeline>,
    sessions: web::Data<SessionStore>,
    query: web::Query<PredictQuery>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let mut image_data = Vec::new();
    while let Ok(Some(mut field)) = payload.try_next().await {
        while let Some(chunk) = field.next().await {
            image_data.extend_from_slice(&chunk?);
        }
        if !image_data.is_empty() {
            break;
        }
    }
    if image_data.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: "no image uploaded".into(),
        }));
    }

    let session_id = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let target_class = query.target_class;

    let worker = pipeline.clone();
    let outcome = web::block(move || {
        let prediction = worker.predict_with_target(&image_data, target_class)?;
        let png = InferencePipeline::encode_png(&prediction.overlay)?;
        Ok::<_, InferenceError>((prediction, png))
    })
    .await?;

    match outcome {
        Ok((prediction, png)) => {
            sessions.record(&session_id, &prediction.result);
            info!(
                "Session {}: {} ({:.2}%)",
                session_id, prediction.result.label, prediction.result.confidence
            );
            Ok(HttpResponse::Ok().json(PredictResponse {
                diagnosis: prediction.result.label,
                class_index: prediction.result.class_index,
                certainty_percent: prediction.result.confidence,
                heatmap: STANDARD.encode(png),
                session_id,
            }))
        }
        Err(e) => {
            error!("Prediction failed for session {}: {}", session_id, e);
            Ok(error_response(&e))
        }
    }
}

async fn get_session(sessions: web::Data<SessionStore>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    match sessions.latest(&session_id) {
        Some(record) => HttpResponse::Ok().json(record),
        None => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("no prediction recorded for session {}", session_id),
        }),
    }
}

async fn health(pipeline: web::Data<InferencePipeline>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".into(),
        labels: pipeline.labels().to_vec(),
    })
}
