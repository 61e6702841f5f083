use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use sprite_contracts::{CleanupReason, CleanupWarning, SpriteError};
use tempfile::{Builder as TempBuilder, NamedTempFile};

const STANDARD_JPEG_QUALITY: u8 = 90;

/// Writes the raw upload to a uniquely named temp file. The file is removed
/// when the returned handle drops.
pub fn persist_upload(
    temp_dir: &Path,
    bytes: &[u8],
    original_filename: Option<&str>,
) -> Result<NamedTempFile, SpriteError> {
    if bytes.is_empty() {
        return Err(SpriteError::invalid_input("uploaded file is empty"));
    }
    fs::create_dir_all(temp_dir).map_err(|err| {
        SpriteError::local_io(format!("failed to create {}: {err}", temp_dir.display()))
    })?;
    let suffix = original_filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 8 && ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    let mut file = TempBuilder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(temp_dir)
        .map_err(|err| SpriteError::local_io(format!("failed to create upload temp file: {err}")))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|err| SpriteError::local_io(format!("failed to write upload temp file: {err}")))?;
    Ok(file)
}

/// Decodes any supported still or animated format, keeps the first frame,
/// drops alpha and re-encodes as baseline JPEG next to the raw upload.
///
/// This is where corrupt or unsupported uploads are turned away.
pub fn standardize_upload(raw: &Path, temp_dir: &Path) -> Result<NamedTempFile, SpriteError> {
    let bytes = fs::read(raw)
        .map_err(|err| SpriteError::local_io(format!("failed reading {}: {err}", raw.display())))?;
    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| SpriteError::invalid_input(format!("image processing failed: {err}")))?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, STANDARD_JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|err| SpriteError::invalid_input(format!("image re-encode failed: {err}")))?;

    let mut file = TempBuilder::new()
        .prefix("upload-")
        .suffix(".standard.jpg")
        .tempfile_in(temp_dir)
        .map_err(|err| {
            SpriteError::local_io(format!("failed to create standardized temp file: {err}"))
        })?;
    file.write_all(&encoded)
        .and_then(|_| file.flush())
        .map_err(|err| {
            SpriteError::local_io(format!("failed to write standardized temp file: {err}"))
        })?;
    tracing::debug!(
        width = rgb.width(),
        height = rgb.height(),
        path = %file.path().display(),
        "upload standardized"
    );
    Ok(file)
}

pub fn remove_local(path: &Path) -> Result<(), CleanupWarning> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CleanupWarning::new(
            CleanupReason::LocalFile,
            format!("failed to remove {}: {err}", path.display()),
        )),
    }
}

/// Deletes a path on drop, logging instead of failing.
#[derive(Debug)]
pub struct LocalFileGuard {
    path: PathBuf,
}

impl LocalFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalFileGuard {
    fn drop(&mut self) {
        if let Err(warning) = remove_local(&self.path) {
            tracing::warn!("{warning}");
        }
    }
}
