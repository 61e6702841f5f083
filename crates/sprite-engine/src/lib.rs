use std::env;

pub mod canvas;
pub mod chroma;
pub mod generation;
pub mod pipeline;
pub mod provider;
pub mod publish;
pub mod service;
pub mod storage;
pub mod upload;

pub use canvas::fit_canvas;
pub use chroma::{strip_green, ChromaKey};
pub use generation::{retry_bounded, Attempt, GeneratedSprite, GenerationClient, RetryPolicy};
pub use pipeline::{SpriteArtifact, SpritePipeline};
pub use provider::{DryrunProvider, GeminiProvider, ModelResponse, ReferenceImage, SpriteModel};
pub use publish::PublishService;
pub use service::{CancelFlag, SpriteService, SpriteUpload};
pub use storage::{MemoryStore, ObjectStore, StoredObject, SupabaseStore};

pub const CANVAS_WIDTH: u32 = 336;
pub const CANVAS_HEIGHT: u32 = 384;
pub const CHROMA_MIN_GREEN: u8 = 100;
pub const CHROMA_DOMINANCE: f64 = 1.3;
pub const GENERATION_ATTEMPTS: u32 = 3;

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

/// Ids that end up in file names and object keys: `[A-Za-z0-9_-]{1,128}`.
pub fn is_safe_segment(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{error_chain_text, is_safe_segment, push_unique_warning, truncate_text};

    #[test]
    fn error_chain_text_joins_distinct_causes() {
        let err = anyhow!("connection refused")
            .context("Gemini request failed")
            .context("Gemini request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: connection refused"
        );
    }

    #[test]
    fn truncate_text_counts_chars_not_bytes() {
        assert_eq!(truncate_text("스프라이트", 3), "스프라…");
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn push_unique_warning_skips_blank_and_duplicates() {
        let mut warnings = Vec::new();
        push_unique_warning(&mut warnings, "a".to_string());
        push_unique_warning(&mut warnings, "a".to_string());
        push_unique_warning(&mut warnings, "  ".to_string());
        assert_eq!(warnings, vec!["a".to_string()]);
    }

    #[test]
    fn safe_segments_reject_path_tricks() {
        assert!(is_safe_segment("3f2c9a4e-user_01"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment("../etc"));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment("name.png"));
        assert!(!is_safe_segment(&"a".repeat(129)));
    }
}
