use std::fmt;

use serde::Serialize;

/// Failure classes surfaced by the sprite pipeline and the publish path.
///
/// Every variant aborts the current request. Cleanup problems are not part
/// of this taxonomy; they travel as [`CleanupWarning`] and are only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpriteErrorKind {
    /// Template or source image absent on disk.
    MissingAsset,
    /// Upload is empty, too large, malformed, or not a decodable image.
    InvalidInput,
    /// The model returned no usable image after every attempt.
    GenerationEmpty,
    /// The final model attempt failed in transport or at the provider.
    GenerationTransport,
    /// Object store rejected the upload.
    Publish,
    /// A temp or output file could not be written on the local disk.
    LocalIo,
    /// The request exceeded its overall deadline.
    Timeout,
}

impl SpriteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingAsset => "missing_asset",
            Self::InvalidInput => "invalid_input",
            Self::GenerationEmpty => "generation_empty",
            Self::GenerationTransport => "generation_transport",
            Self::Publish => "publish",
            Self::LocalIo => "local_io",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for SpriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct SpriteError {
    pub kind: SpriteErrorKind,
    pub detail: String,
}

impl SpriteError {
    pub fn new(kind: SpriteErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn missing_asset(detail: impl Into<String>) -> Self {
        Self::new(SpriteErrorKind::MissingAsset, detail)
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::new(SpriteErrorKind::InvalidInput, detail)
    }

    pub fn publish(detail: impl Into<String>) -> Self {
        Self::new(SpriteErrorKind::Publish, detail)
    }

    pub fn local_io(detail: impl Into<String>) -> Self {
        Self::new(SpriteErrorKind::LocalIo, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(SpriteErrorKind::Timeout, detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    /// URL was not issued by the configured store.
    ForeignUrl,
    /// URL belongs to the store but no sprite key could be derived from it.
    UnparsableKey,
    NotFound,
    StoreError,
    LocalFile,
}

/// Non-fatal outcome of a best-effort delete. Callers log it and move on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cleanup skipped ({reason:?}): {detail}")]
pub struct CleanupWarning {
    pub reason: CleanupReason,
    pub detail: String,
}

impl CleanupWarning {
    pub fn new(reason: CleanupReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}
