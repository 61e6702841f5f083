use std::fs;
use std::path::Path;
use std::sync::Arc;

use sprite_contracts::records::SpriteEntry;
use sprite_contracts::{CleanupReason, CleanupWarning, SpriteError};

use crate::is_safe_segment;
use crate::storage::{KeyLookup, ObjectStore};
use crate::error_chain_text;

const SPRITE_CONTENT_TYPE: &str = "image/png";

/// Stores finished sprites under `{namespace}/{owner}/{name}` (owner-scoped
/// deployments) or `{namespace}/{name}`.
pub struct PublishService {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    owner_scoped: bool,
}

impl PublishService {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>, owner_scoped: bool) -> Self {
        Self {
            store,
            namespace: namespace.into().trim_matches('/').to_string(),
            owner_scoped,
        }
    }

    pub fn owner_scoped(&self) -> bool {
        self.owner_scoped
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Folder holding an owner's sprites; the namespace root when the
    /// deployment is not owner-scoped.
    pub fn folder(&self, owner: Option<&str>) -> Result<String, SpriteError> {
        if !self.owner_scoped {
            return Ok(self.namespace.clone());
        }
        let owner = owner
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .ok_or_else(|| SpriteError::invalid_input("user_id is required"))?;
        if !is_safe_segment(owner) {
            return Err(SpriteError::invalid_input(format!(
                "user_id contains unsupported characters: {owner:?}"
            )));
        }
        Ok(format!("{}/{owner}", self.namespace))
    }

    pub fn object_key(&self, owner: Option<&str>, object_name: &str) -> Result<String, SpriteError> {
        let valid_name = object_name
            .strip_suffix(".png")
            .map(is_safe_segment)
            .unwrap_or(false);
        if !valid_name {
            return Err(SpriteError::invalid_input(format!(
                "unusable object name: {object_name:?}"
            )));
        }
        Ok(format!("{}/{object_name}", self.folder(owner)?))
    }

    /// Uploads the sprite (overwriting any object at the same key) and
    /// returns its public URL.
    pub fn publish(
        &self,
        local_path: &Path,
        owner: Option<&str>,
        object_name: &str,
    ) -> Result<String, SpriteError> {
        let key = self.object_key(owner, object_name)?;
        let bytes = fs::read(local_path).map_err(|err| {
            SpriteError::local_io(format!("failed reading {}: {err}", local_path.display()))
        })?;
        tracing::info!(key = %key, store = self.store.name(), bytes = bytes.len(), "uploading sprite");
        self.store
            .put_object(&key, bytes, SPRITE_CONTENT_TYPE)
            .map_err(|err| SpriteError::publish(error_chain_text(&err, 512)))?;
        let url = self.store.public_url(&key);
        tracing::info!(key = %key, url = %url, "sprite uploaded");
        Ok(url)
    }

    /// Best-effort removal of a previously published sprite. Every failure
    /// comes back as a [`CleanupWarning`]; nothing here should abort a request.
    pub fn unpublish(&self, url: &str) -> Result<String, CleanupWarning> {
        let key = match self.store.key_for_url(url) {
            KeyLookup::Key(key) => key,
            KeyLookup::Foreign => {
                return Err(CleanupWarning::new(
                    CleanupReason::ForeignUrl,
                    format!("not a {} URL: {url}", self.store.name()),
                ))
            }
            KeyLookup::Unparsable(detail) => {
                return Err(CleanupWarning::new(CleanupReason::UnparsableKey, detail))
            }
        };
        if !self.is_sprite_key(&key) {
            return Err(CleanupWarning::new(
                CleanupReason::UnparsableKey,
                format!("key {key} is outside the {} namespace", self.namespace),
            ));
        }

        match self.store.delete(&key) {
            Ok(true) => {
                tracing::info!(key = %key, "previous sprite deleted");
                Ok(key)
            }
            Ok(false) => Err(CleanupWarning::new(
                CleanupReason::NotFound,
                format!("no object at {key}"),
            )),
            Err(err) => Err(CleanupWarning::new(
                CleanupReason::StoreError,
                error_chain_text(&err, 512),
            )),
        }
    }

    pub fn list(&self, owner: Option<&str>) -> Result<Vec<SpriteEntry>, SpriteError> {
        let folder = self.folder(owner)?;
        let objects = self
            .store
            .list(&folder)
            .map_err(|err| SpriteError::publish(error_chain_text(&err, 512)))?;
        Ok(objects
            .into_iter()
            .map(|object| SpriteEntry {
                url: self.store.public_url(&object.key),
                name: object.name,
                created_at: object.created_at,
            })
            .collect())
    }

    /// Marks the bucket publicly readable. Permission problems are logged
    /// and otherwise ignored.
    pub fn ensure_public_read(&self) {
        match self.store.ensure_public_read() {
            Ok(()) => tracing::info!(store = self.store.name(), "bucket public read ensured"),
            Err(err) => tracing::warn!(
                store = self.store.name(),
                "could not ensure public read on bucket: {err:#}"
            ),
        }
    }

    fn is_sprite_key(&self, key: &str) -> bool {
        let Some(rest) = key.strip_prefix(&format!("{}/", self.namespace)) else {
            return false;
        };
        let segments: Vec<&str> = rest.split('/').collect();
        let Some((file, folders)) = segments.split_last() else {
            return false;
        };
        folders.len() <= 1
            && folders.iter().all(|segment| is_safe_segment(segment))
            && file
                .strip_suffix(".png")
                .map(is_safe_segment)
                .unwrap_or(false)
    }
}
