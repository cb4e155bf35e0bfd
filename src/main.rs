// src/main.rs
use actix_files::Files;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use anyhow::Context;
use log::info;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod errors;
mod handlers;
mod models;
mod services;
#[cfg(test)]
mod test_support;
mod workflow;

use crate::config::AppConfig;
use crate::services::{
    AnalysisRecords, Deadline, HttpInferenceClient, InferenceClient, MemoryRecords,
    MockInferenceClient, RedisService, SessionRegistry, TextReportExporter,
};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    sessions: Arc<SessionRegistry>,
    records: Arc<dyn AnalysisRecords>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting Farmsight service...");
    let config = AppConfig::from_env();

    // Initialize services
    let records: Arc<dyn AnalysisRecords> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisService::new(url)
                .await
                .with_context(|| format!("connecting to Redis at {}", url))?,
        ),
        None => {
            info!("REDIS_URL not set, keeping analysis records in memory");
            Arc::new(MemoryRecords::new())
        }
    };

    let inference: Arc<dyn InferenceClient> = match &config.inference_url {
        Some(url) => {
            let client =
                HttpInferenceClient::new(url, config.inference_api_key.clone(), config.inference_timeout)
                    .context("building inference client")?;
            info!("Using inference service at {}", client.endpoint());
            Arc::new(client)
        }
        None => {
            info!("INFERENCE_URL not set, using mock leaf classifier");
            Arc::new(Deadline::new(
                MockInferenceClient::new(config.mock_latency),
                config.inference_timeout,
            ))
        }
    };

    let sessions = Arc::new(SessionRegistry::new(
        inference,
        Arc::new(TextReportExporter::new()),
        config.session_idle_ttl,
    ));
    let _reaper = sessions.spawn_reaper(SESSION_SWEEP_INTERVAL);

    let app_state = AppState { sessions, records };

    let static_dir = config.static_dir.clone();
    info!("Starting HTTP server on {}", config.bind_addr);

    HttpServer::new(move || {
        let static_dir = static_dir.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .route("/health", web::get().to(health_check))
            .configure(handlers::configure)
            .configure(move |cfg| {
                if let Some(dir) = static_dir {
                    cfg.service(Files::new("/", dir).index_file("index.html"));
                }
            })
    })
    .bind(&config.bind_addr)
    .with_context(|| format!("binding {}", config.bind_addr))?
    .run()
    .await
    .context("HTTP server failed")
}

async fn health_check(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "farmsight",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": data.sessions.len()
    }))
}
