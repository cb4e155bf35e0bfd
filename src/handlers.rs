// src/handlers.rs
use crate::{
    AppState,
    errors::FarmsightError,
    models::*,
    services::file_intake::{IntakeSource, MAX_IMAGE_BYTES},
    services::records::{derive_pending_tasks, new_record, parse_flag_update, user_key},
    services::analysis_session::Dispatch,
};
use actix_multipart::Multipart;
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest, HttpResponse, http::header, web};
use bytes::BytesMut;
use futures_util::TryStreamExt;
use log::info;
use serde::Deserialize;
use std::future::{Ready, ready};
use uuid::Uuid;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/leaf/sessions", web::post().to(create_session))
            .route("/leaf/sessions/{session_id}", web::get().to(get_session))
            .route("/leaf/sessions/{session_id}", web::delete().to(close_session))
            .route("/leaf/sessions/{session_id}/image", web::post().to(upload_image))
            .route("/leaf/sessions/{session_id}/analyze", web::post().to(analyze_image))
            .route("/leaf/sessions/{session_id}/reset", web::post().to(reset_session))
            .route("/leaf/sessions/{session_id}/report", web::get().to(download_report))
            .route("/profile/analysis", web::get().to(list_analyses))
            .route("/profile/analysis", web::post().to(create_analysis))
            .route("/profile/analysis/{analysis_id}", web::put().to(update_analysis))
            .route("/profile/tasks", web::get().to(pending_tasks))
            .route("/predict-yield", web::post().to(predict_yield))
            .route("/predict-market", web::post().to(predict_market)),
    );
}

/// Caller identity taken from `Authorization: Bearer <token>`. Verifying
/// the token is the auth service's job; here it only scopes records.
/// Holds the token's digest, never the token itself.
pub struct AuthUser(pub String);

impl FromRequest for AuthUser {
    type Error = FarmsightError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());

        ready(
            token
                .map(|t| AuthUser(user_key(t)))
                .ok_or(FarmsightError::Unauthorized),
        )
    }
}

// Leaf analysis sessions

pub async fn create_session(data: web::Data<AppState>) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.create();

    Ok(HttpResponse::Created().json(serde_json::json!({
        "session_id": session.id(),
        "snapshot": session.snapshot()
    })))
}

pub async fn get_session(
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.get(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(session.snapshot()))
}

pub async fn close_session(
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    data.sessions.remove(&path.into_inner())?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    source: IntakeSource,
}

pub async fn upload_image(
    path: web::Path<Uuid>,
    query: web::Query<UploadQuery>,
    mut payload: Multipart,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.get(&path.into_inner())?;
    let upload_error = |e: actix_multipart::MultipartError| FarmsightError::Upload(e.to_string());

    while let Some(mut field) = payload.try_next().await.map_err(upload_error)? {
        if field.content_disposition().get_name() != Some("image") {
            while field.try_next().await.map_err(upload_error)?.is_some() {}
            continue;
        }

        let filename = field
            .content_disposition()
            .get_filename()
            .map(|f| f.to_string());

        let content_type = field
            .content_type()
            .map(|ct| ct.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        // Keep counting past the limit so the error reports the real size,
        // but stop buffering.
        let mut image_data = BytesMut::new();
        let mut size = 0usize;
        while let Some(chunk) = field.try_next().await.map_err(upload_error)? {
            size += chunk.len();
            if size <= MAX_IMAGE_BYTES {
                image_data.extend_from_slice(&chunk);
            }
        }

        let snapshot = session.select_file(
            query.source,
            filename,
            image_data.freeze(),
            &content_type,
            size,
        )?;
        return Ok(HttpResponse::Ok().json(snapshot));
    }

    Err(FarmsightError::Upload(
        "Multipart field 'image' is missing".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeQuery {
    #[serde(default)]
    wait: bool,
}

pub async fn analyze_image(
    path: web::Path<Uuid>,
    query: web::Query<AnalyzeQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.get(&path.into_inner())?;

    if let Dispatch::AlreadyInFlight = session.request_analysis()? {
        info!("Session {} already analyzing, request ignored", session.id());
    }

    if query.wait {
        return Ok(HttpResponse::Ok().json(session.settle().await));
    }
    Ok(HttpResponse::Accepted().json(session.snapshot()))
}

pub async fn reset_session(
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.get(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(session.reset()))
}

pub async fn download_report(
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let session = data.sessions.get(&path.into_inner())?;
    let report = session.export()?;

    Ok(HttpResponse::Ok()
        .content_type(report.content_type)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", report.filename),
        ))
        .body(report.body))
}

// Profile analysis records

pub async fn list_analyses(
    user: AuthUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let records = data.records.list(&user.0).await?;
    Ok(HttpResponse::Ok().json(records))
}

pub async fn create_analysis(
    user: AuthUser,
    data: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, FarmsightError> {
    let record = new_record(&body)?;
    data.records.create(&user.0, record.clone()).await?;
    Ok(HttpResponse::Created().json(record))
}

pub async fn update_analysis(
    user: AuthUser,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, FarmsightError> {
    let flags = parse_flag_update(&body)?;
    let record = data
        .records
        .update_flags(&user.0, path.into_inner(), &flags)
        .await?;
    Ok(HttpResponse::Ok().json(record))
}

pub async fn pending_tasks(
    user: AuthUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, FarmsightError> {
    let records = data.records.list(&user.0).await?;
    Ok(HttpResponse::Ok().json(derive_pending_tasks(&records)))
}

// Prediction placeholders

pub async fn predict_yield(_user: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(ApiEnvelope::success(
        "Yield prediction placeholder endpoint",
        YieldPrediction::placeholder(),
    ))
}

pub async fn predict_market(_user: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(ApiEnvelope::success(
        "Market prediction placeholder endpoint",
        MarketPrediction::placeholder(),
    ))
}
