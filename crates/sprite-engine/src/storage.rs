use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use reqwest::blocking::{Client as HttpClient, Request, RequestBuilder, Response as HttpResponse};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use url::Url;

use crate::truncate_text;

const UPSERT_HEADER: &str = "x-upsert";
const LIST_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub name: String,
    pub created_at: Option<String>,
}

/// Result of mapping a public URL back onto a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Key(String),
    /// Not issued by this store.
    Foreign,
    /// Issued by this store, but no object key could be read from it.
    Unparsable(String),
}

/// Blocking key/value blob store with public URLs.
///
/// `put_object` overwrites in place; `delete` reports whether anything was
/// removed and is a no-op for absent keys.
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;
    fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    fn public_url(&self, key: &str) -> String;
    fn key_for_url(&self, url: &str) -> KeyLookup;
    /// Direct children of `prefix` (a folder path without trailing slash).
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
    fn delete(&self, key: &str) -> Result<bool>;

    fn ensure_public_read(&self) -> Result<()> {
        Ok(())
    }
}

/// Supabase Storage over its REST API.
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    bucket: String,
    timeout: Duration,
    http: HttpClient,
}

impl SupabaseStore {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            bucket: bucket.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_endpoint(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    fn public_prefix(&self) -> String {
        format!("/storage/v1/object/public/{}/", self.bucket)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header(AUTHORIZATION, format!("Bearer {}", self.service_key))
            .header("apikey", &self.service_key)
            .timeout(self.timeout)
    }

    fn upload_request(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<Request> {
        Ok(self
            .authorized(self.http.post(self.object_endpoint(key)))
            .header(CONTENT_TYPE, content_type)
            // same key overwrites instead of failing with 409
            .header(UPSERT_HEADER, "true")
            .body(bytes)
            .build()?)
    }

    fn list_request(&self, prefix: &str) -> Result<Request> {
        let endpoint = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        Ok(self
            .authorized(self.http.post(endpoint))
            .json(&json!({
                "prefix": prefix,
                "limit": LIST_LIMIT,
                "offset": 0,
                "sortBy": { "column": "created_at", "order": "desc" },
            }))
            .build()?)
    }

    fn delete_request(&self, key: &str) -> Result<Request> {
        let endpoint = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        Ok(self
            .authorized(self.http.delete(endpoint))
            .json(&json!({ "prefixes": [key] }))
            .build()?)
    }

    fn bucket_update_request(&self) -> Result<Request> {
        let endpoint = format!("{}/storage/v1/bucket/{}", self.base_url, self.bucket);
        Ok(self
            .authorized(self.http.put(endpoint))
            .json(&json!({
                "id": self.bucket,
                "name": self.bucket,
                "public": true,
            }))
            .build()?)
    }

    fn send(&self, operation: &str, request: Request) -> Result<String> {
        let endpoint = request.url().to_string();
        let response = self
            .http
            .execute(request)
            .with_context(|| format!("{operation} failed ({endpoint})"))?;
        body_or_error(operation, response)
    }
}

impl ObjectStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let request = self.upload_request(key, bytes, content_type)?;
        self.send("Supabase upload", request)?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}{}{}", self.base_url, self.public_prefix(), key)
    }

    fn key_for_url(&self, url: &str) -> KeyLookup {
        let (Ok(candidate), Ok(base)) = (Url::parse(url.trim()), Url::parse(&self.base_url))
        else {
            return KeyLookup::Foreign;
        };
        if candidate.origin() != base.origin() {
            return KeyLookup::Foreign;
        }
        let Some(key) = candidate.path().strip_prefix(&self.public_prefix()) else {
            return KeyLookup::Unparsable(format!(
                "path {} is outside bucket {}",
                candidate.path(),
                self.bucket
            ));
        };
        if key.is_empty() {
            return KeyLookup::Unparsable("URL names no object".to_string());
        }
        KeyLookup::Key(key.to_string())
    }

    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let request = self.list_request(prefix)?;
        let body = self.send("Supabase list", request)?;
        parse_list_rows(prefix, &body)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let request = self.delete_request(key)?;
        let body = self.send("Supabase delete", request)?;
        parse_delete_reply(&body)
    }

    fn ensure_public_read(&self) -> Result<()> {
        let request = self.bucket_update_request()?;
        self.send("Supabase bucket update", request)?;
        Ok(())
    }
}

/// Rows of a storage list reply. Folders come back with a null `id` and are
/// skipped.
fn parse_list_rows(prefix: &str, body: &str) -> Result<Vec<StoredObject>> {
    let rows: Value =
        serde_json::from_str(body).context("Supabase list returned invalid JSON payload")?;
    let Some(rows) = rows.as_array() else {
        bail!("Supabase list returned a non-array payload");
    };

    Ok(rows
        .iter()
        .filter(|row| !row.get("id").map(Value::is_null).unwrap_or(true))
        .filter_map(|row| {
            let name = row.get("name").and_then(Value::as_str)?;
            Some(StoredObject {
                key: join_key(prefix, name),
                name: name.to_string(),
                created_at: row
                    .get("created_at")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect())
}

/// The delete endpoint echoes the removed objects; an empty array means the
/// key did not exist.
fn parse_delete_reply(body: &str) -> Result<bool> {
    let removed: Value =
        serde_json::from_str(body).context("Supabase delete returned invalid JSON payload")?;
    Ok(removed.as_array().map(|rows| !rows.is_empty()).unwrap_or(false))
}

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Vec<u8>,
    content_type: String,
    created_at: String,
}

/// In-process store for local runs and tests. URLs look like
/// `memory://{bucket}/{key}`.
#[derive(Debug)]
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn url_prefix(&self) -> String {
        format!("memory://{}/", self.bucket)
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryObject>>> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects()
            .ok()?
            .get(key)
            .map(|object| object.bytes.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects()
            .ok()?
            .get(key)
            .map(|object| object.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut objects = self.objects()?;
        let created_at = objects
            .get(key)
            .map(|existing| existing.created_at.clone())
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        objects.insert(
            key.to_string(),
            MemoryObject {
                bytes,
                content_type: content_type.to_string(),
                created_at,
            },
        );
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}{}", self.url_prefix(), key)
    }

    fn key_for_url(&self, url: &str) -> KeyLookup {
        match url.trim().strip_prefix(&self.url_prefix()) {
            None => KeyLookup::Foreign,
            Some("") => KeyLookup::Unparsable("URL names no object".to_string()),
            Some(key) => KeyLookup::Key(key.to_string()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let folder = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        let objects = self.objects()?;
        Ok(objects
            .iter()
            .filter_map(|(key, object)| {
                let name = key.strip_prefix(&folder)?;
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(StoredObject {
                    key: key.clone(),
                    name: name.to_string(),
                    created_at: Some(object.created_at.clone()),
                })
            })
            .collect())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.objects()?.remove(key).is_some())
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn body_or_error(operation: &str, response: HttpResponse) -> Result<String> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{operation} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{operation} failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supabase() -> SupabaseStore {
        SupabaseStore::new(
            "https://proj.supabase.co/",
            "service-key",
            "lms-assets",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn supabase_public_url_round_trips_to_key() {
        let store = supabase();
        let url = store.public_url("sprites/user-1/abc.png");
        assert_eq!(
            url,
            "https://proj.supabase.co/storage/v1/object/public/lms-assets/sprites/user-1/abc.png"
        );
        assert_eq!(
            store.key_for_url(&url),
            KeyLookup::Key("sprites/user-1/abc.png".to_string())
        );
    }

    #[test]
    fn supabase_ignores_query_string_on_public_urls() {
        let store = supabase();
        let url = format!("{}?t=123", store.public_url("sprites/a.png"));
        assert_eq!(
            store.key_for_url(&url),
            KeyLookup::Key("sprites/a.png".to_string())
        );
    }

    #[test]
    fn supabase_classifies_foreign_and_unparsable_urls() {
        let store = supabase();
        assert_eq!(
            store.key_for_url("https://cdn.example.com/storage/v1/object/public/lms-assets/x.png"),
            KeyLookup::Foreign
        );
        assert_eq!(store.key_for_url("not a url"), KeyLookup::Foreign);
        assert!(matches!(
            store.key_for_url("https://proj.supabase.co/storage/v1/object/public/other-bucket/x.png"),
            KeyLookup::Unparsable(_)
        ));
        assert!(matches!(
            store.key_for_url("https://proj.supabase.co/storage/v1/object/public/lms-assets/"),
            KeyLookup::Unparsable(_)
        ));
    }

    fn json_body(request: &Request) -> Result<Value> {
        let bytes = request
            .body()
            .and_then(|body| body.as_bytes())
            .ok_or_else(|| anyhow!("request has no buffered body"))?;
        Ok(serde_json::from_slice(bytes)?)
    }

    #[test]
    fn supabase_upload_overwrites_existing_objects() -> Result<()> {
        let store = supabase();
        let request = store.upload_request("sprites/u/a.png", b"png".to_vec(), "image/png")?;

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://proj.supabase.co/storage/v1/object/lms-assets/sprites/u/a.png"
        );
        let headers = request.headers();
        assert_eq!(headers.get("x-upsert").and_then(|v| v.to_str().ok()), Some("true"));
        assert_eq!(headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()), Some("image/png"));
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer service-key")
        );
        assert_eq!(headers.get("apikey").and_then(|v| v.to_str().ok()), Some("service-key"));
        Ok(())
    }

    #[test]
    fn supabase_delete_sends_the_key_as_a_prefix() -> Result<()> {
        let request = supabase().delete_request("sprites/u/a.png")?;
        assert_eq!(request.method(), reqwest::Method::DELETE);
        assert_eq!(
            request.url().as_str(),
            "https://proj.supabase.co/storage/v1/object/lms-assets"
        );
        assert_eq!(json_body(&request)?, json!({ "prefixes": ["sprites/u/a.png"] }));
        Ok(())
    }

    #[test]
    fn supabase_list_asks_for_newest_first() -> Result<()> {
        let request = supabase().list_request("sprites/user-1")?;
        let body = json_body(&request)?;
        assert_eq!(body["prefix"], json!("sprites/user-1"));
        assert_eq!(body["limit"], json!(LIST_LIMIT));
        assert_eq!(body["sortBy"], json!({ "column": "created_at", "order": "desc" }));
        Ok(())
    }

    #[test]
    fn supabase_bucket_update_marks_it_public() -> Result<()> {
        let request = supabase().bucket_update_request()?;
        assert_eq!(request.method(), reqwest::Method::PUT);
        assert_eq!(
            request.url().as_str(),
            "https://proj.supabase.co/storage/v1/bucket/lms-assets"
        );
        assert_eq!(
            json_body(&request)?,
            json!({ "id": "lms-assets", "name": "lms-assets", "public": true })
        );
        Ok(())
    }

    #[test]
    fn list_rows_skip_folders_and_keep_timestamps() -> Result<()> {
        let body = r#"[
            { "id": null, "name": "nested", "created_at": null },
            { "id": "f1", "name": "b.png", "created_at": "2026-03-02T10:00:00.000Z" },
            { "id": "f2", "name": "a.png" },
            { "id": "f3" }
        ]"#;
        let rows = parse_list_rows("sprites/user-1/", body)?;

        assert_eq!(
            rows,
            vec![
                StoredObject {
                    key: "sprites/user-1/b.png".to_string(),
                    name: "b.png".to_string(),
                    created_at: Some("2026-03-02T10:00:00.000Z".to_string()),
                },
                StoredObject {
                    key: "sprites/user-1/a.png".to_string(),
                    name: "a.png".to_string(),
                    created_at: None,
                },
            ]
        );
        assert_eq!(parse_list_rows("", r#"[{ "id": "x", "name": "top.png" }]"#)?[0].key, "top.png");
        Ok(())
    }

    #[test]
    fn list_rows_reject_non_array_replies() {
        assert!(parse_list_rows("sprites", r#"{ "error": "nope" }"#).is_err());
        assert!(parse_list_rows("sprites", "<html>").is_err());
    }

    #[test]
    fn delete_reply_reports_whether_anything_was_removed() -> Result<()> {
        assert!(!parse_delete_reply("[]")?);
        assert!(parse_delete_reply(r#"[{ "name": "sprites/u/a.png" }]"#)?);
        assert!(!parse_delete_reply(r#"{ "message": "ok" }"#)?);
        assert!(parse_delete_reply("not json").is_err());
        Ok(())
    }

    #[test]
    fn memory_store_overwrites_in_place() -> Result<()> {
        let store = MemoryStore::new("bucket");
        store.put_object("sprites/u/a.png", b"one".to_vec(), "image/png")?;
        store.put_object("sprites/u/a.png", b"two".to_vec(), "image/png")?;

        assert_eq!(store.keys(), vec!["sprites/u/a.png".to_string()]);
        assert_eq!(store.get("sprites/u/a.png"), Some(b"two".to_vec()));
        assert_eq!(store.content_type("sprites/u/a.png").as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn memory_store_lists_direct_children_only() -> Result<()> {
        let store = MemoryStore::new("bucket");
        store.put_object("sprites/u/a.png", Vec::new(), "image/png")?;
        store.put_object("sprites/u/b.png", Vec::new(), "image/png")?;
        store.put_object("sprites/u/nested/c.png", Vec::new(), "image/png")?;
        store.put_object("sprites/other/d.png", Vec::new(), "image/png")?;

        let names: Vec<String> = store
            .list("sprites/u")?
            .into_iter()
            .map(|object| object.name)
            .collect();
        assert_eq!(names, vec!["a.png".to_string(), "b.png".to_string()]);
        Ok(())
    }

    #[test]
    fn memory_store_delete_is_idempotent() -> Result<()> {
        let store = MemoryStore::new("bucket");
        store.put_object("k.png", Vec::new(), "image/png")?;
        assert!(store.delete("k.png")?);
        assert!(!store.delete("k.png")?);
        Ok(())
    }

    #[test]
    fn memory_store_url_mapping() {
        let store = MemoryStore::new("bucket");
        assert_eq!(
            store.key_for_url(&store.public_url("sprites/x.png")),
            KeyLookup::Key("sprites/x.png".to_string())
        );
        assert_eq!(store.key_for_url("memory://elsewhere/x.png"), KeyLookup::Foreign);
        assert!(matches!(
            store.key_for_url("memory://bucket/"),
            KeyLookup::Unparsable(_)
        ));
    }
}
