use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::DynamicImage;
use sprite_contracts::{SpriteError, SpriteErrorKind};

use crate::provider::{GenerationRequest, ReferenceImage, SpriteModel};
use crate::{error_chain_text, push_unique_warning, truncate_text};

pub const SPRITE_PROMPT: &str = "\
Act as a professional Pixel Art Animator.
Generate a high-quality pixel art sprite sheet image (336x384px) with a pure green background (#00FF00).

Structure:
- The output MUST be an IMAGE, not text.
- Use the first image as a layout reference (poses, grid structure).
- Use the second image as a character reference (colors, appearance).
- Copy the poses from image 1 exactly.
- Replace the character in image 1 with the character from image 2.
- Do not include any objects or items held by the character in the first image.
";

const EMPTY_DETAIL_MAX_CHARS: usize = 200;
const ERROR_DETAIL_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::GENERATION_ATTEMPTS,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }
}

/// Outcome of a single attempt inside [`retry_bounded`].
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// The call went through but produced nothing usable.
    Empty(String),
    Failed(anyhow::Error),
}

/// Runs `run` until it yields a value or the attempt budget is spent.
///
/// Only the last attempt decides the error kind: `Empty` maps to
/// `GenerationEmpty`, `Failed` to `GenerationTransport`. Returns the value
/// together with the 1-based attempt number that produced it.
pub fn retry_bounded<T>(
    policy: RetryPolicy,
    mut run: impl FnMut(u32) -> Attempt<T>,
) -> Result<(T, u32), SpriteError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match run(attempt) {
            Attempt::Ready(value) => return Ok((value, attempt)),
            Attempt::Empty(text) => {
                tracing::warn!(attempt, max_attempts, "model returned no image");
                let detail = if text.trim().is_empty() {
                    format!("model returned no image after {attempt} attempts")
                } else {
                    format!(
                        "model returned no image after {attempt} attempts; response text: {}",
                        truncate_text(text.trim(), EMPTY_DETAIL_MAX_CHARS)
                    )
                };
                last_error = Some(SpriteError::new(SpriteErrorKind::GenerationEmpty, detail));
            }
            Attempt::Failed(err) => {
                tracing::warn!(attempt, max_attempts, "generation attempt failed: {err:#}");
                last_error = Some(SpriteError::new(
                    SpriteErrorKind::GenerationTransport,
                    format!(
                        "generation attempt {attempt}/{max_attempts} failed: {}",
                        error_chain_text(&err, ERROR_DETAIL_MAX_CHARS)
                    ),
                ));
            }
        }
        if attempt < max_attempts && !policy.backoff.is_zero() {
            thread::sleep(policy.backoff);
        }
    }

    Err(last_error.unwrap_or_else(|| {
        SpriteError::new(SpriteErrorKind::GenerationEmpty, "no generation attempts ran")
    }))
}

#[derive(Debug, Clone)]
pub struct GeneratedSprite {
    pub image: DynamicImage,
    pub attempts: u32,
    pub explanation: Option<String>,
    pub warnings: Vec<String>,
}

/// Calls the model with the fixed sprite prompt and both references.
pub struct GenerationClient {
    model: Arc<dyn SpriteModel>,
    prompt: String,
    policy: RetryPolicy,
}

impl GenerationClient {
    pub fn new(model: Arc<dyn SpriteModel>, policy: RetryPolicy) -> Self {
        Self {
            model,
            prompt: SPRITE_PROMPT.to_string(),
            policy,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn generate(
        &self,
        layout: &ReferenceImage,
        character: &ReferenceImage,
    ) -> Result<GeneratedSprite, SpriteError> {
        let request = GenerationRequest {
            prompt: &self.prompt,
            layout,
            character,
        };
        let mut warnings = Vec::new();
        let mut explanation = None;

        let (image, attempts) = retry_bounded(self.policy, |attempt| {
            tracing::info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                model = self.model.name(),
                "requesting sprite sheet"
            );
            let response = match self.model.generate(&request) {
                Ok(response) => response,
                Err(err) => return Attempt::Failed(err),
            };
            for warning in &response.warnings {
                push_unique_warning(&mut warnings, warning.clone());
            }

            let text = response.explanation();
            if let Some(text) = text.as_deref() {
                tracing::info!(attempt, "model text: {}", truncate_text(text, 400));
            }
            explanation = text.clone();

            let Some(bytes) = response.first_image() else {
                return Attempt::Empty(text.unwrap_or_default());
            };
            match image::load_from_memory(bytes) {
                Ok(image) => Attempt::Ready(image),
                Err(err) => Attempt::Failed(
                    anyhow::Error::new(err).context("model image payload could not be decoded"),
                ),
            }
        })?;

        tracing::info!(
            attempts,
            width = image.width(),
            height = image.height(),
            "sprite sheet generated"
        );
        Ok(GeneratedSprite {
            image,
            attempts,
            explanation,
            warnings,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    use anyhow::{anyhow, bail, Result};
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::provider::{GeminiProvider, ModelResponse, ResponsePart};

    pub(crate) fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        RgbaImage::from_pixel(width, height, Rgba(color))
            .write_to(&mut buf, ImageFormat::Png)
            .map(|_| buf.into_inner())
            .unwrap_or_default()
    }

    pub(crate) fn image_reply(bytes: Vec<u8>) -> ModelResponse {
        ModelResponse {
            parts: vec![ResponsePart::InlineImage {
                mime_type: Some("image/png".to_string()),
                data: bytes,
            }],
            warnings: Vec::new(),
        }
    }

    pub(crate) fn text_reply(text: &str) -> ModelResponse {
        ModelResponse {
            parts: vec![ResponsePart::Text(text.to_string())],
            warnings: vec!["finish reason: OTHER".to_string()],
        }
    }

    /// Replays scripted replies; once the script runs out it repeats the
    /// fallback. Counts every call.
    pub(crate) struct ScriptedModel {
        script: Mutex<VecDeque<Result<ModelResponse>>>,
        fallback: fn() -> Result<ModelResponse>,
        calls: Mutex<u32>,
    }

    impl ScriptedModel {
        pub(crate) fn new(
            script: Vec<Result<ModelResponse>>,
            fallback: fn() -> Result<ModelResponse>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.lock().map(|calls| *calls).unwrap_or_default()
        }
    }

    impl SpriteModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, _request: &GenerationRequest<'_>) -> Result<ModelResponse> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls += 1;
            }
            let next = self
                .script
                .lock()
                .map_err(|_| anyhow!("script lock poisoned"))?
                .pop_front();
            next.unwrap_or_else(self.fallback)
        }
    }

    fn references() -> (ReferenceImage, ReferenceImage) {
        (
            ReferenceImage::from_bytes(png_bytes(4, 4, [0, 0, 0, 255]), None),
            ReferenceImage::from_bytes(png_bytes(4, 4, [255, 255, 255, 255]), None),
        )
    }

    #[test]
    fn succeeds_on_third_attempt_after_two_empty_replies() -> Result<()> {
        let model = Arc::new(ScriptedModel::new(
            vec![
                Ok(text_reply("I cannot draw that.")),
                Ok(ModelResponse::default()),
                Ok(image_reply(png_bytes(10, 12, [0, 255, 0, 255]))),
            ],
            || Err(anyhow!("script exhausted")),
        ));
        let client = GenerationClient::new(model.clone(), RetryPolicy::immediate(3));
        let (layout, character) = references();

        let generated = client.generate(&layout, &character)?;

        assert_eq!(generated.attempts, 3);
        assert_eq!(generated.image.width(), 10);
        assert_eq!(model.calls(), 3);
        assert_eq!(generated.warnings, vec!["finish reason: OTHER".to_string()]);
        Ok(())
    }

    #[test]
    fn never_exceeds_three_calls_when_no_image_arrives() -> Result<()> {
        let model = Arc::new(ScriptedModel::new(Vec::new(), || {
            Ok(text_reply(&"x".repeat(500)))
        }));
        let client = GenerationClient::new(model.clone(), RetryPolicy::immediate(3));
        let (layout, character) = references();

        let Err(err) = client.generate(&layout, &character) else {
            bail!("generation succeeded without an image");
        };

        assert_eq!(model.calls(), 3);
        assert_eq!(err.kind, SpriteErrorKind::GenerationEmpty);
        assert!(err.detail.contains("after 3 attempts"));
        // truncated to 200 chars plus ellipsis
        assert!(err.detail.contains(&format!("{}…", "x".repeat(200))));
        assert!(!err.detail.contains(&"x".repeat(201)));
        Ok(())
    }

    #[test]
    fn final_transport_error_is_classified_and_carries_message() -> Result<()> {
        let model = Arc::new(ScriptedModel::new(
            vec![Ok(ModelResponse::default())],
            || Err(anyhow!("connection reset by peer")),
        ));
        let client = GenerationClient::new(model.clone(), RetryPolicy::immediate(3));
        let (layout, character) = references();

        let Err(err) = client.generate(&layout, &character) else {
            bail!("generation succeeded against a failing model");
        };

        assert_eq!(model.calls(), 3);
        assert_eq!(err.kind, SpriteErrorKind::GenerationTransport);
        assert!(err.detail.contains("3/3"));
        assert!(err.detail.contains("connection reset by peer"));
        Ok(())
    }

    #[test]
    fn unreachable_gemini_detail_omits_the_api_key() -> Result<()> {
        let provider = GeminiProvider::new(
            "http://127.0.0.1:1/v1beta",
            "SECRET-API-KEY-123",
            "gemini-x",
            Duration::from_secs(2),
        );
        let client = GenerationClient::new(Arc::new(provider), RetryPolicy::immediate(1));
        let (layout, character) = references();

        let Err(err) = client.generate(&layout, &character) else {
            bail!("generation succeeded against a closed port");
        };

        assert_eq!(err.kind, SpriteErrorKind::GenerationTransport);
        assert!(!err.detail.contains("SECRET-API-KEY-123"), "{}", err.detail);
        Ok(())
    }

    #[test]
    fn transport_error_on_early_attempt_is_retried() -> Result<()> {
        let model = Arc::new(ScriptedModel::new(
            vec![
                Err(anyhow!("timeout")),
                Ok(image_reply(png_bytes(2, 2, [1, 2, 3, 255]))),
            ],
            || Err(anyhow!("script exhausted")),
        ));
        let client = GenerationClient::new(model.clone(), RetryPolicy::immediate(3));
        let (layout, character) = references();

        let generated = client.generate(&layout, &character)?;

        assert_eq!(generated.attempts, 2);
        assert_eq!(model.calls(), 2);
        Ok(())
    }

    #[test]
    fn undecodable_payload_counts_as_failed_attempt() {
        let model = Arc::new(ScriptedModel::new(Vec::new(), || {
            Ok(image_reply(b"definitely not an image".to_vec()))
        }));
        let client = GenerationClient::new(model.clone(), RetryPolicy::immediate(3));
        let (layout, character) = references();

        let err = client.generate(&layout, &character).err();

        assert_eq!(model.calls(), 3);
        assert_eq!(
            err.map(|err| err.kind),
            Some(SpriteErrorKind::GenerationTransport)
        );
    }

    #[test]
    fn retry_bounded_reports_attempt_number() {
        let mut seen = Vec::new();
        let result = retry_bounded(RetryPolicy::immediate(3), |attempt| {
            seen.push(attempt);
            if attempt == 2 {
                Attempt::Ready("ok")
            } else {
                Attempt::Empty(String::new())
            }
        });
        assert_eq!(result, Ok(("ok", 2)));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn retry_bounded_treats_zero_budget_as_one_attempt() {
        let mut calls = 0;
        let result: Result<((), u32), SpriteError> =
            retry_bounded(RetryPolicy::immediate(0), |_| {
                calls += 1;
                Attempt::Empty(String::new())
            });
        assert_eq!(calls, 1);
        assert_eq!(
            result.err().map(|err| err.kind),
            Some(SpriteErrorKind::GenerationEmpty)
        );
    }
}
