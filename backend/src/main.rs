use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use histolens::inference::InferencePipeline;
use histolens::inference::config::PipelineConfig;
use histolens::routes::configure_routes;
use histolens::session::SessionStore;
use std::env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = PipelineConfig::load().map_err(|e| {
        log::error!("Failed to load pipeline configuration: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    let pipeline = InferencePipeline::from_config(&config).map_err(|e| {
        log::error!("Failed to preload model at startup: {}", e);
        std::io::Error::other(format!("Model loading failed: {}", e))
    })?;
    log::info!(
        "Model ready: {:?} explained at `{}`, labels {:?}",
        config.model.architecture,
        config.model.target_layer.as_deref().unwrap_or_default(),
        pipeline.labels()
    );

    let pipeline = web::Data::new(pipeline);
    let sessions = web::Data::new(SessionStore::with_capacity(config.server.max_sessions));
    let allowed_origin = config.server.allowed_origin.clone();
    let bind_address = format!("0.0.0.0:{}", config.server.port);

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        let cors = match &allowed_origin {
            Some(origin) => Cors::default().allowed_origin(origin),
            None => Cors::default().allow_any_origin(),
        }
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
            actix_web::http::header::HeaderName::from_static("x-session-id"),
        ])
        .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(pipeline.clone())
            .app_data(sessions.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
