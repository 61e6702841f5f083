mod config;
mod error;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{build_model, build_pipeline, build_service, EngineArgs};
use crate::server::AppState;

#[derive(Debug, Parser)]
#[command(name = "sprite-maker", version, about = "Turns a photo into a game sprite sheet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Generate one sprite locally without publishing it.
    Make(MakeArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "SPRITE_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "SPRITE_PORT", default_value_t = 8000)]
    port: u16,
    #[arg(long, env = "SPRITE_REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    request_timeout_secs: u64,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct MakeArgs {
    #[arg(long)]
    photo: PathBuf,
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    engine: EngineArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sprite-maker error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Make(args) => run_make(args),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// The service (and its blocking HTTP clients) is built here and dropped
/// here, outside the actix runtime.
fn run_serve(args: ServeArgs) -> Result<i32> {
    let service = Arc::new(build_service(&args.engine)?);
    let state = AppState {
        service: service.clone(),
        request_timeout: Duration::from_secs(args.request_timeout_secs),
    };
    actix_web::rt::System::new()
        .block_on(server::serve(state, &args.host, args.port))
        .with_context(|| format!("server on {}:{} failed", args.host, args.port))?;
    drop(service);
    Ok(0)
}

fn run_make(args: MakeArgs) -> Result<i32> {
    let model = build_model(&args.engine)?;
    let pipeline = build_pipeline(&args.engine, model);
    let id = args.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let artifact = pipeline.make_sprite(&args.photo, &id)?;
    for warning in &artifact.warnings {
        eprintln!("warning: {warning}");
    }
    println!("{}", artifact.path.display());
    Ok(0)
}
