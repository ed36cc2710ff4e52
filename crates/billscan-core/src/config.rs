//! Process configuration (environment) and operator settings (JSON file).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL_CANDIDATES: &[&str] = &["gpt-4.1-mini", "gpt-4o-mini", "gpt-4o"];

/// Fixed-per-process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub settings_file: PathBuf,
    /// OCR worker command. Defaults to the bundled Python worker, started
    /// through the interpreter on PATH.
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub model_candidates: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var_os("BILLSCAN_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .context("could not determine a platform data directory")?
                .join("billscan"),
        };

        let worker_program =
            std::env::var("BILLSCAN_WORKER").unwrap_or_else(|_| "python3".to_string());
        let worker_args = match std::env::var("BILLSCAN_WORKER_ARGS") {
            Ok(args) => args.split_whitespace().map(str::to_string).collect(),
            Err(_) => vec![data_dir.join("ocr_worker.py").to_string_lossy().into_owned()],
        };

        let llm_base_url =
            std::env::var("BILLSCAN_LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let llm_api_key = std::env::var("BILLSCAN_LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        let model_candidates = match std::env::var("BILLSCAN_MODELS") {
            Ok(models) => models.split(',').map(|m| m.trim().to_string()).collect(),
            Err(_) => DEFAULT_MODEL_CANDIDATES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        };

        Ok(Self {
            upload_dir: data_dir.join("uploads"),
            settings_file: data_dir.join("settings.json"),
            data_dir,
            worker_program,
            worker_args,
            llm_base_url,
            llm_api_key,
            model_candidates,
        })
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        std::fs::create_dir_all(&self.upload_dir)
            .with_context(|| format!("failed to create {}", self.upload_dir.display()))?;
        Ok(())
    }
}

/// Operator-adjustable settings, persisted between runs and applicable to a
/// running pipeline without restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Parallel tier-1 extractions (OCR itself stays serialized).
    pub tier_concurrency: usize,
    /// Minutes of worker idleness before the child process is torn down.
    pub worker_idle_minutes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tier_concurrency: 2,
            worker_idle_minutes: 5,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.tier_concurrency) {
            bail!(
                "tier_concurrency must be between 1 and 4, got {}",
                self.tier_concurrency
            );
        }
        if !(1..=30).contains(&self.worker_idle_minutes) {
            bail!(
                "worker_idle_minutes must be between 1 and 30, got {}",
                self.worker_idle_minutes
            );
        }
        Ok(())
    }

    /// Missing file means defaults; a malformed or out-of-range file is an
    /// error rather than a silent reset.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Self>(&raw)
                .with_context(|| format!("malformed settings file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_minutes * 60)
    }
}
