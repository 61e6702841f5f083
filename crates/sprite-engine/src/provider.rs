use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{non_empty_env, push_unique_warning, truncate_text};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-pro-image-preview";
const API_KEY_HEADER: &str = "x-goog-api-key";

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Image bytes handed to the model as an inline attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceImage {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::from_bytes(bytes, mime_for_path(path)))
    }

    pub fn from_bytes(bytes: Vec<u8>, hint: Option<&str>) -> Self {
        let mime_type = image::guess_format(&bytes)
            .ok()
            .map(|format| format.to_mime_type())
            .or(hint)
            .unwrap_or("image/png")
            .to_string();
        Self { bytes, mime_type }
    }

    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    /// Pose grid the output must copy.
    pub layout: &'a ReferenceImage,
    /// Photo the character's appearance comes from.
    pub character: &'a ReferenceImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Text(String),
    InlineImage {
        mime_type: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub parts: Vec<ResponsePart>,
    pub warnings: Vec<String>,
}

impl ModelResponse {
    /// Concatenated text parts, if the model explained itself.
    pub fn explanation(&self) -> Option<String> {
        let text = self
            .parts
            .iter()
            .filter_map(|part| match part {
                ResponsePart::Text(text) => Some(text.as_str()),
                ResponsePart::InlineImage { .. } => None,
            })
            .collect::<Vec<&str>>()
            .join("");
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn first_image(&self) -> Option<&[u8]> {
        self.parts.iter().find_map(|part| match part {
            ResponsePart::InlineImage { data, .. } if !data.is_empty() => Some(data.as_slice()),
            _ => None,
        })
    }
}

/// Remote (or stand-in) generative model. One call per attempt; retries
/// belong to the caller.
pub trait SpriteModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<ModelResponse>;
}

pub struct GeminiProvider {
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    pub fn from_env(model: &str, timeout: Duration) -> Result<Self> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let api_base =
            non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string());
        Ok(Self::new(api_base, api_key, model, timeout))
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn safety_settings() -> Vec<Value> {
        SAFETY_CATEGORIES
            .into_iter()
            .map(|category| {
                json!({
                    "category": category,
                    "threshold": "BLOCK_NONE",
                })
            })
            .collect()
    }

    fn build_payload(request: &GenerationRequest<'_>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": request.prompt },
                    request.layout.inline_part(),
                    request.character.inline_part(),
                ],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
            "safetySettings": Self::safety_settings(),
        })
    }

    fn parse_response(payload: &Value) -> ModelResponse {
        let mut response = ModelResponse::default();

        if let Some(reason) = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            push_unique_warning(
                &mut response.warnings,
                format!("Gemini blocked the prompt: {reason}"),
            );
        }

        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                if reason != "STOP" {
                    push_unique_warning(
                        &mut response.warnings,
                        format!("Gemini finish reason: {reason}"),
                    );
                }
            }
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    response.parts.push(ResponsePart::Text(text.to_string()));
                    continue;
                }
                let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => response.parts.push(ResponsePart::InlineImage {
                        mime_type,
                        data: bytes,
                    }),
                    Err(err) => push_unique_warning(
                        &mut response.warnings,
                        format!("Gemini inline payload base64 decode failed: {err}"),
                    ),
                }
            }
        }

        response
    }
}

impl SpriteModel for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<ModelResponse> {
        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            // error text is surfaced to HTTP clients, keep the URL out of it
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        Ok(Self::parse_response(&response_payload))
    }
}

/// Offline stand-in: paints a green-screen grid sheet tinted from the
/// character photo so the whole service runs without credentials.
pub struct DryrunProvider {
    columns: u32,
    rows: u32,
    cell: u32,
}

impl Default for DryrunProvider {
    fn default() -> Self {
        Self {
            columns: 7,
            rows: 8,
            cell: 96,
        }
    }
}

impl DryrunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn render_sheet(&self, character: &ReferenceImage) -> Result<Vec<u8>> {
        let digest = Sha256::digest(&character.bytes);
        let body = Rgba([digest[0] / 2, digest[1] / 2, digest[2] / 2 + 64, 255]);
        let accent = Rgba([255, digest[3] / 2 + 100, digest[4] / 3, 255]);
        let green = Rgba([0, 255, 0, 255]);

        let width = self.columns * self.cell;
        let height = self.rows * self.cell;
        let inset = self.cell / 4;
        let mut sheet = RgbaImage::from_pixel(width, height, green);
        for (x, y, pixel) in sheet.enumerate_pixels_mut() {
            let local_x = x % self.cell;
            let local_y = y % self.cell;
            let inside = local_x >= inset
                && local_x < self.cell - inset
                && local_y >= inset / 2
                && local_y < self.cell - inset / 2;
            if !inside {
                continue;
            }
            *pixel = if local_y < self.cell / 3 { accent } else { body };
        }

        let mut buf = Cursor::new(Vec::new());
        sheet
            .write_to(&mut buf, ImageFormat::Png)
            .context("dryrun sheet encode failed")?;
        Ok(buf.into_inner())
    }
}

impl SpriteModel for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest<'_>) -> Result<ModelResponse> {
        let data = self.render_sheet(request.character)?;
        Ok(ModelResponse {
            parts: vec![
                ResponsePart::Text(format!(
                    "dryrun sheet {}x{} ({})",
                    self.columns,
                    self.rows,
                    hex::encode(&Sha256::digest(&request.character.bytes)[..4])
                )),
                ResponsePart::InlineImage {
                    mime_type: Some("image/png".to_string()),
                    data,
                },
            ],
            warnings: Vec::new(),
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
