use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use billscan_core::{
    Config, HttpChatClient, MemoryStore, ModelResolver, OcrTier, PipelineJob, QualityThresholds,
    Scheduler, Settings, TierController, WorkerConfig,
};

/// Extract structured invoice data from a PDF or image.
#[derive(Parser)]
#[command(name = "billscan", version)]
struct Args {
    /// Document to process (PDF, PNG, JPEG, TIFF, BMP or WebP).
    file: PathBuf,

    /// Force a specific extraction tier (1 = text layer, 2 = fast OCR,
    /// 3 = deep OCR) instead of automatic escalation.
    #[arg(long)]
    tier: Option<u8>,

    /// Use this model without probing the candidate list.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("billscan=info")),
        )
        .init();

    let args = Args::parse();
    if !args.file.exists() {
        bail!("no such file: {}", args.file.display());
    }
    let forced_tier = match args.tier {
        None => None,
        Some(n) => Some(
            OcrTier::from_u8(n).with_context(|| format!("invalid tier {n}, expected 1, 2 or 3"))?,
        ),
    };

    let config = Config::from_env()?;
    config.ensure_dirs()?;
    let settings = Settings::load(&config.settings_file)?;
    info!(
        tier_concurrency = settings.tier_concurrency,
        worker_idle_minutes = settings.worker_idle_minutes,
        "settings loaded"
    );

    let worker = billscan_core::spawn_manager(WorkerConfig {
        program: config.worker_program.clone(),
        args: config.worker_args.clone(),
        label: "ocr".to_string(),
        idle_timeout: settings.worker_idle(),
    });
    let controller = TierController::new(
        worker.clone(),
        Arc::new(tokio::sync::Mutex::new(())),
        QualityThresholds::default(),
    );

    let client = Arc::new(HttpChatClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    )?);
    let resolver = ModelResolver::new(config.model_candidates.clone());
    if let Some(model) = &args.model {
        resolver.force(model.clone()).await;
    }

    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(
        controller,
        client,
        resolver,
        store.clone(),
        worker,
        settings.tier_concurrency,
    );

    let document_id = uuid::Uuid::new_v4().to_string();
    scheduler
        .process(PipelineJob {
            document_id: document_id.clone(),
            path: args.file.clone(),
            forced_tier,
        })
        .await?;
    scheduler.shutdown();

    let record = store
        .get(&document_id)
        .context("document record missing after processing")?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
