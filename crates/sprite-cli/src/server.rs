use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::middleware::Logger;
use actix_web::rt::time::timeout;
use actix_web::{web, App, HttpResponse, HttpServer};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use sprite_contracts::records::SpriteList;
use sprite_contracts::{SpriteError, SpriteErrorKind};
use sprite_engine::{CancelFlag, SpriteService, SpriteUpload};

use crate::error::{ApiError, ApiResult};

const TEXT_FIELD_MAX_BYTES: usize = 4 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SpriteService>,
    pub request_timeout: Duration,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .route("/create-sprite", web::post().to(create_sprite))
        .route("/sprite-list", web::get().to(list_sprites))
        .route("/sprite-list/{owner}", web::get().to(list_owner_sprites))
        .route("/delete-sprite", web::delete().to(delete_sprite));
}

pub async fn serve(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    tracing::info!(host, port, "sprite server listening");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}

async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Sprite Maker API Server",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": state.service.publisher().store_name(),
        "ai": state.service.pipeline().model_name(),
    }))
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "provider": state.service.pipeline().model_name(),
        "storage": state.service.publisher().store_name(),
    }))
}

async fn create_sprite(state: web::Data<AppState>, payload: Multipart) -> ApiResult<HttpResponse> {
    let upload = read_sprite_form(payload, state.service.max_upload_bytes()).await?;
    let service = state.service.clone();
    let cancel = CancelFlag::new();
    let job_cancel = cancel.clone();
    let job = web::block(move || service.create_sprite_until(upload, &job_cancel));

    // The blocking job cannot be interrupted; once cancelled it stops before
    // publishing and never touches the previous sprite.
    let created = match timeout(state.request_timeout, job).await {
        Ok(joined) => joined??,
        Err(_) => {
            cancel.cancel();
            tracing::warn!(
                timeout_secs = state.request_timeout.as_secs(),
                "sprite request timed out"
            );
            return Err(SpriteError::timeout(format!(
                "sprite request exceeded {}s",
                state.request_timeout.as_secs()
            ))
            .into());
        }
    };
    Ok(HttpResponse::Ok().json(created))
}

async fn list_sprites(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    list_for(state, None).await
}

async fn list_owner_sprites(
    state: web::Data<AppState>,
    owner: web::Path<String>,
) -> ApiResult<HttpResponse> {
    list_for(state, Some(owner.into_inner())).await
}

/// Store failures degrade to an empty list; a bad owner id is still a 400.
async fn list_for(state: web::Data<AppState>, owner: Option<String>) -> ApiResult<HttpResponse> {
    let service = state.service.clone();
    let listed = web::block(move || service.list_sprites(owner.as_deref())).await?;
    match listed {
        Ok(list) => Ok(HttpResponse::Ok().json(list)),
        Err(err) if err.kind == SpriteErrorKind::InvalidInput => Err(err.into()),
        Err(err) => {
            tracing::warn!("sprite listing failed: {err}");
            Ok(HttpResponse::Ok().json(SpriteList::default()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    file_url: String,
}

async fn delete_sprite(
    state: web::Data<AppState>,
    form: web::Form<DeleteForm>,
) -> ApiResult<HttpResponse> {
    let url = form.into_inner().file_url;
    if url.trim().is_empty() {
        return Err(ApiError::BadRequest("file_url is required".to_string()));
    }
    let service = state.service.clone();
    let outcome = web::block(move || service.delete_sprite(url.trim())).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

/// Streams the multipart form into memory, refusing oversized parts as they
/// arrive instead of after buffering.
async fn read_sprite_form(mut payload: Multipart, max_file_bytes: usize) -> ApiResult<SpriteUpload> {
    let mut upload = SpriteUpload::default();
    let mut saw_file = false;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {err}")))?;
        let name = field.name().unwrap_or_default().to_string();
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let limit = if name == "file" {
            max_file_bytes
        } else {
            TEXT_FIELD_MAX_BYTES
        };

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk
                .map_err(|err| ApiError::BadRequest(format!("failed reading field {name}: {err}")))?;
            if data.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "file" => {
                saw_file = true;
                upload.bytes = data;
                upload.filename = filename;
            }
            "nickname" => upload.nickname = text_field(&name, data)?,
            "user_id" => upload.owner = optional_text(text_field(&name, data)?),
            "old_sprite_url" => upload.previous_url = optional_text(text_field(&name, data)?),
            other => tracing::debug!(field = other, "ignoring unknown form field"),
        }
    }

    if !saw_file {
        return Err(ApiError::BadRequest("file field is required".to_string()));
    }
    Ok(upload)
}

fn text_field(name: &str, data: Vec<u8>) -> ApiResult<String> {
    String::from_utf8(data)
        .map(|text| text.trim().to_string())
        .map_err(|_| ApiError::BadRequest(format!("field {name} is not valid UTF-8")))
}

fn optional_text(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}
