use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use sprite_contracts::SpriteError;

use crate::canvas::fit_canvas;
use crate::chroma::ChromaKey;
use crate::generation::GenerationClient;
use crate::provider::ReferenceImage;
use crate::is_safe_segment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpriteArtifact {
    pub path: PathBuf,
    pub attempts: u32,
    pub warnings: Vec<String>,
}

/// Generation → chroma-key → canvas → `{output_dir}/{id}.png`.
///
/// The template is read once and cached; while it is missing every call
/// fails with `MissingAsset`.
pub struct SpritePipeline {
    client: GenerationClient,
    chroma: ChromaKey,
    template_path: PathBuf,
    template: Mutex<Option<Arc<ReferenceImage>>>,
    output_dir: PathBuf,
}

impl SpritePipeline {
    pub fn new(
        client: GenerationClient,
        template_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            chroma: ChromaKey::default(),
            template_path: template_path.into(),
            template: Mutex::new(None),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn output_path(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{id}.png"))
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    fn template(&self) -> Result<Arc<ReferenceImage>, SpriteError> {
        let mut cached = self
            .template
            .lock()
            .map_err(|_| SpriteError::missing_asset("template cache lock poisoned"))?;
        if let Some(template) = cached.as_ref() {
            return Ok(template.clone());
        }
        if !self.template_path.is_file() {
            return Err(SpriteError::missing_asset(format!(
                "template image not found: {}",
                self.template_path.display()
            )));
        }
        let template = ReferenceImage::load(&self.template_path)
            .map(Arc::new)
            .map_err(|err| SpriteError::missing_asset(format!("{err:#}")))?;
        tracing::info!(path = %self.template_path.display(), "template image loaded");
        *cached = Some(template.clone());
        Ok(template)
    }

    /// Chroma-key first, then resize, so the key sees the model's raw pixels.
    pub fn render(&self, generated: &DynamicImage) -> RgbaImage {
        let keyed = self.chroma.apply(generated);
        fit_canvas(&keyed)
    }

    pub fn make_sprite(&self, source_path: &Path, id: &str) -> Result<SpriteArtifact, SpriteError> {
        if !is_safe_segment(id) {
            return Err(SpriteError::invalid_input(format!("unusable sprite id: {id:?}")));
        }
        let template = self.template()?;
        if !source_path.is_file() {
            return Err(SpriteError::missing_asset(format!(
                "source image not found: {}",
                source_path.display()
            )));
        }
        let source = ReferenceImage::load(source_path)
            .map_err(|err| SpriteError::missing_asset(format!("{err:#}")))?;
        // header only; uploads were already fully decoded when standardized
        let header = ImageReader::new(Cursor::new(source.bytes.as_slice()))
            .with_guessed_format()
            .map_err(|err| err.to_string())
            .and_then(|reader| reader.into_dimensions().map_err(|err| err.to_string()));
        if let Err(err) = header {
            return Err(SpriteError::invalid_input(format!(
                "source image could not be decoded: {err}"
            )));
        }

        tracing::info!(id, source = %source_path.display(), "sprite generation started");
        let generated = self.client.generate(&template, &source)?;
        let sprite = self.render(&generated.image);

        fs::create_dir_all(&self.output_dir).map_err(|err| {
            SpriteError::local_io(format!(
                "failed to create {}: {err}",
                self.output_dir.display()
            ))
        })?;
        let path = self.output_path(id);
        sprite
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|err| {
                SpriteError::local_io(format!("failed to write {}: {err}", path.display()))
            })?;
        tracing::info!(id, path = %path.display(), attempts = generated.attempts, "sprite written");

        Ok(SpriteArtifact {
            path,
            attempts: generated.attempts,
            warnings: generated.warnings,
        })
    }
}
