use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, ValueEnum};
use sprite_contracts::events::EventWriter;
use sprite_engine::service::DEFAULT_MAX_UPLOAD_BYTES;
use sprite_engine::{
    DryrunProvider, GeminiProvider, GenerationClient, MemoryStore, ObjectStore, PublishService,
    RetryPolicy, SpriteModel, SpritePipeline, SpriteService, SupabaseStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    Gemini,
    Dryrun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageKind {
    Supabase,
    Memory,
}

/// Settings shared by every subcommand. Each flag falls back to its
/// environment variable, and `.env` is loaded before parsing.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    #[arg(long, env = "SPRITE_PROVIDER", value_enum, default_value_t = ProviderKind::Gemini)]
    pub provider: ProviderKind,
    #[arg(long, env = "SPRITE_MODEL", default_value = sprite_engine::provider::DEFAULT_GEMINI_MODEL)]
    pub model: String,
    #[arg(long, env = "SPRITE_STORAGE", value_enum, default_value_t = StorageKind::Supabase)]
    pub storage: StorageKind,
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,
    #[arg(long, env = "SPRITE_BUCKET", default_value = "lms-assets")]
    pub bucket: String,
    #[arg(long, env = "SPRITE_NAMESPACE", default_value = "sprites")]
    pub namespace: String,
    #[arg(long, env = "SPRITE_OWNER_SCOPED", default_value_t = true, action = ArgAction::Set)]
    pub owner_scoped: bool,
    #[arg(long, env = "SPRITE_ENSURE_PUBLIC_BUCKET", default_value_t = false, action = ArgAction::Set)]
    pub ensure_public_bucket: bool,
    #[arg(long, env = "SPRITE_TEMPLATE", default_value = "assets/template.png")]
    pub template: PathBuf,
    #[arg(long, env = "SPRITE_WORK_DIR", default_value = "./work")]
    pub work_dir: PathBuf,
    #[arg(long, env = "SPRITE_EVENTS")]
    pub events: Option<PathBuf>,
    #[arg(long, env = "SPRITE_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
    #[arg(long, env = "SPRITE_MODEL_TIMEOUT_SECS", default_value_t = 120)]
    pub model_timeout_secs: u64,
    #[arg(long, env = "SPRITE_STORE_TIMEOUT_SECS", default_value_t = 60)]
    pub store_timeout_secs: u64,
    #[arg(long, env = "SPRITE_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,
}

impl EngineArgs {
    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join("temp_uploads")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("outputs")
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

/// Must run outside any async runtime: the blocking HTTP clients built
/// here refuse to be created or dropped inside one.
pub fn build_model(args: &EngineArgs) -> Result<Arc<dyn SpriteModel>> {
    let model: Arc<dyn SpriteModel> = match args.provider {
        ProviderKind::Gemini => Arc::new(
            GeminiProvider::from_env(&args.model, Duration::from_secs(args.model_timeout_secs))
                .context("gemini provider unavailable (set SPRITE_PROVIDER=dryrun to run offline)")?,
        ),
        ProviderKind::Dryrun => Arc::new(DryrunProvider::new()),
    };
    Ok(model)
}

pub fn build_store(args: &EngineArgs) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match args.storage {
        StorageKind::Supabase => {
            let (Some(url), Some(key)) = (args.supabase_url.as_deref(), args.supabase_key.as_deref())
            else {
                bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY must be set for supabase storage");
            };
            Arc::new(SupabaseStore::new(
                url,
                key,
                args.bucket.clone(),
                Duration::from_secs(args.store_timeout_secs),
            ))
        }
        StorageKind::Memory => Arc::new(MemoryStore::new(args.bucket.clone())),
    };
    Ok(store)
}

pub fn build_pipeline(args: &EngineArgs, model: Arc<dyn SpriteModel>) -> SpritePipeline {
    let client = GenerationClient::new(model, args.retry_policy());
    SpritePipeline::new(client, args.template.clone(), args.output_dir())
}

pub fn build_service(args: &EngineArgs) -> Result<SpriteService> {
    let model = build_model(args)?;
    let store = build_store(args)?;
    let publisher = PublishService::new(store, args.namespace.clone(), args.owner_scoped);
    if args.ensure_public_bucket {
        publisher.ensure_public_read();
    }
    if !args.template.is_file() {
        tracing::warn!(
            path = %args.template.display(),
            "template image missing; sprite requests will fail until it exists"
        );
    }

    let mut service = SpriteService::new(build_pipeline(args, model), publisher, args.temp_dir())
        .with_max_upload_bytes(args.max_upload_bytes);
    if let Some(path) = args.events.as_ref() {
        service = service.with_events(EventWriter::new(path));
    }
    tracing::info!(
        provider = service.pipeline().model_name(),
        storage = service.publisher().store_name(),
        owner_scoped = service.publisher().owner_scoped(),
        work_dir = %args.work_dir.display(),
        "sprite service configured"
    );
    Ok(service)
}
