use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use sprite_contracts::events::{EventPayload, EventWriter};
use sprite_contracts::records::{CreatedSprite, DeleteOutcome, SpriteList};
use sprite_contracts::SpriteError;
use uuid::Uuid;

use crate::pipeline::SpritePipeline;
use crate::publish::PublishService;
use crate::upload::{persist_upload, standardize_upload, LocalFileGuard};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SpriteUpload {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub nickname: String,
    pub owner: Option<String>,
    pub previous_url: Option<String>,
}

/// Set by whoever gave up waiting on a request. The service checks it
/// between steps and never publishes or replaces once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One sprite request end to end: standardize, generate, publish, replace.
///
/// Temp uploads and the local sprite are owned by drop guards, so they are
/// gone on every return path.
pub struct SpriteService {
    pipeline: SpritePipeline,
    publisher: PublishService,
    temp_dir: PathBuf,
    max_upload_bytes: usize,
    events: Option<EventWriter>,
}

impl SpriteService {
    pub fn new(
        pipeline: SpritePipeline,
        publisher: PublishService,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            temp_dir: temp_dir.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            events: None,
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn pipeline(&self) -> &SpritePipeline {
        &self.pipeline
    }

    pub fn publisher(&self) -> &PublishService {
        &self.publisher
    }

    pub fn create_sprite(&self, upload: SpriteUpload) -> Result<CreatedSprite, SpriteError> {
        self.create_sprite_until(upload, &CancelFlag::new())
    }

    /// Like [`create_sprite`](Self::create_sprite), but stops with `Timeout`
    /// once `cancel` is set. A sprite uploaded after cancellation is removed
    /// again and the previous sprite is left alone.
    pub fn create_sprite_until(
        &self,
        upload: SpriteUpload,
        cancel: &CancelFlag,
    ) -> Result<CreatedSprite, SpriteError> {
        let request_id = Uuid::new_v4().to_string();
        self.emit(
            &request_id,
            "sprite_requested",
            json!({
                "nickname": upload.nickname,
                "owner": upload.owner,
                "bytes": upload.bytes.len(),
                "replaces": upload.previous_url,
            }),
        );

        match self.run_create(&request_id, upload, cancel) {
            Ok(created) => Ok(created),
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    kind = %err.kind,
                    "sprite request failed: {}",
                    err.detail
                );
                self.emit(
                    &request_id,
                    "sprite_failed",
                    json!({ "kind": err.kind, "detail": err.detail }),
                );
                Err(err)
            }
        }
    }

    fn run_create(
        &self,
        request_id: &str,
        upload: SpriteUpload,
        cancel: &CancelFlag,
    ) -> Result<CreatedSprite, SpriteError> {
        let nickname = upload.nickname.trim();
        if nickname.is_empty() {
            return Err(SpriteError::invalid_input("nickname is required"));
        }
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(SpriteError::invalid_input(format!(
                "upload exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        let owner = upload.owner.as_deref().map(str::trim);
        // rejects a missing or malformed owner before any remote call
        self.publisher.folder(owner)?;

        let raw = persist_upload(&self.temp_dir, &upload.bytes, upload.filename.as_deref())?;
        tracing::info!(request_id, nickname, bytes = upload.bytes.len(), "upload received");
        let standard = standardize_upload(raw.path(), &self.temp_dir)?;
        drop(raw);

        check_live(cancel, "before generation")?;

        let sprite_id = Uuid::new_v4().to_string();
        let _sprite_guard = LocalFileGuard::new(self.pipeline.output_path(&sprite_id));
        let artifact = self.pipeline.make_sprite(standard.path(), &sprite_id)?;
        self.emit(
            request_id,
            "sprite_created",
            json!({
                "sprite_id": sprite_id,
                "model": self.pipeline.model_name(),
                "attempts": artifact.attempts,
                "warnings": artifact.warnings,
            }),
        );

        check_live(cancel, "before publish")?;
        let filename = format!("{sprite_id}.png");
        let url = self.publisher.publish(&artifact.path, owner, &filename)?;
        if cancel.is_cancelled() {
            self.roll_back(request_id, &url);
            return Err(SpriteError::timeout(
                "request cancelled during publish; new sprite removed",
            ));
        }
        self.emit(
            request_id,
            "sprite_published",
            json!({ "url": url, "filename": filename }),
        );

        if let Some(previous) = upload
            .previous_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            self.replace_previous(request_id, previous);
        }

        Ok(CreatedSprite { url, filename })
    }

    fn replace_previous(&self, request_id: &str, previous: &str) {
        match self.publisher.unpublish(previous) {
            Ok(key) => self.emit(
                request_id,
                "sprite_unpublished",
                json!({ "url": previous, "key": key }),
            ),
            Err(warning) => {
                tracing::warn!(request_id, url = previous, "previous sprite not removed: {warning}");
                self.emit(
                    request_id,
                    "sprite_unpublish_skipped",
                    json!({ "url": previous, "warning": warning.to_string(), "reason": warning.reason }),
                );
            }
        }
    }

    fn roll_back(&self, request_id: &str, url: &str) {
        match self.publisher.unpublish(url) {
            Ok(key) => {
                tracing::warn!(request_id, key = %key, "published sprite rolled back");
                self.emit(request_id, "sprite_rolled_back", json!({ "url": url, "key": key }));
            }
            Err(warning) => {
                tracing::warn!(request_id, url, "rollback of published sprite failed: {warning}");
                self.emit(
                    request_id,
                    "sprite_rolled_back",
                    json!({ "url": url, "warning": warning.to_string(), "reason": warning.reason }),
                );
            }
        }
    }

    pub fn list_sprites(&self, owner: Option<&str>) -> Result<SpriteList, SpriteError> {
        let sprites = self.publisher.list(owner.map(str::trim))?;
        tracing::info!(owner = owner.unwrap_or("-"), count = sprites.len(), "sprites listed");
        Ok(SpriteList { sprites })
    }

    /// Never fails: a sprite that cannot be removed is reported in the
    /// message and logged.
    pub fn delete_sprite(&self, url: &str) -> DeleteOutcome {
        match self.publisher.unpublish(url) {
            Ok(key) => DeleteOutcome {
                success: true,
                message: format!("deleted {key}"),
            },
            Err(warning) => {
                tracing::warn!(url, "sprite delete skipped: {warning}");
                DeleteOutcome {
                    success: true,
                    message: format!("nothing deleted: {}", warning.detail),
                }
            }
        }
    }

    fn emit(&self, request_id: &str, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let payload: EventPayload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        if let Err(err) = events.emit(request_id, event_type, payload) {
            tracing::warn!(request_id, event_type, "event log write failed: {err:#}");
        }
    }
}

fn check_live(cancel: &CancelFlag, stage: &str) -> Result<(), SpriteError> {
    if cancel.is_cancelled() {
        return Err(SpriteError::timeout(format!("request cancelled {stage}")));
    }
    Ok(())
}
