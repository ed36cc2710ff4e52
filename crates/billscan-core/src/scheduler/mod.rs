//! Pipeline scheduler: admission control, per-document status flow, and
//! failure isolation.
//!
//! Tier-1 extraction runs under a resizable semaphore; the OCR tiers are
//! additionally serialized by the controller's mutex, so raising the
//! concurrency only increases overlap of cheap work.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::client::ChatClient;
use crate::agent::schema::StructuredExtraction;
use crate::agent::{self, ModelResolver};
use crate::display::generate_display_name;
use crate::extract::{ExtractionResult, OcrTier, TierController};
use crate::store::{DocumentResult, DocumentStatus, DocumentStore};
use crate::verify;
use crate::worker::WorkerHandle;

const MAX_TIER_CONCURRENCY: usize = 4;

/// One document to process.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub document_id: String,
    pub path: PathBuf,
    /// Set when an operator retries with a specific tier; bypasses
    /// escalation.
    pub forced_tier: Option<OcrTier>,
}

struct SchedulerInner {
    controller: TierController,
    client: Arc<dyn ChatClient>,
    resolver: ModelResolver,
    store: Arc<dyn DocumentStore>,
    worker: WorkerHandle,
    semaphore: Arc<Semaphore>,
    configured_permits: Mutex<usize>,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    job_tx: mpsc::UnboundedSender<PipelineJob>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        controller: TierController,
        client: Arc<dyn ChatClient>,
        resolver: ModelResolver,
        store: Arc<dyn DocumentStore>,
        worker: WorkerHandle,
        tier_concurrency: usize,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            controller,
            client,
            resolver,
            store,
            worker,
            semaphore: Arc::new(Semaphore::new(tier_concurrency)),
            configured_permits: Mutex::new(tier_concurrency),
        });

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(dispatch_loop(inner.clone(), job_rx, cancel.clone()));

        Self {
            inner,
            job_tx,
            cancel,
        }
    }

    /// Queue a document. Returns immediately; processing happens on the
    /// dispatcher.
    pub async fn enqueue(&self, job: PipelineJob) -> Result<()> {
        self.inner
            .store
            .set_status(&job.document_id, DocumentStatus::Queued)
            .await;
        self.job_tx
            .send(job)
            .context("scheduler is shut down")?;
        Ok(())
    }

    /// Process one document inline, still subject to the concurrency limit.
    pub async fn process(&self, job: PipelineJob) -> Result<()> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("scheduler is shut down")?;
        process_job(&self.inner, job).await;
        drop(permit);
        Ok(())
    }

    /// Apply new settings to the running pipeline. Concurrency changes take
    /// effect for jobs not yet admitted; running jobs are never interrupted.
    pub async fn update_config(
        &self,
        tier_concurrency: Option<usize>,
        worker_idle: Option<std::time::Duration>,
    ) -> Result<()> {
        if let Some(target) = tier_concurrency {
            if !(1..=MAX_TIER_CONCURRENCY).contains(&target) {
                anyhow::bail!(
                    "tier_concurrency must be between 1 and {MAX_TIER_CONCURRENCY}, got {target}"
                );
            }
            let mut current = self.inner.configured_permits.lock().await;
            if target > *current {
                self.inner.semaphore.add_permits(target - *current);
            } else if target < *current {
                // Shrink by eating permits as running jobs release them.
                let shrink = (*current - target) as u32;
                let semaphore = self.inner.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(shrink).await {
                        permits.forget();
                    }
                });
            }
            info!(from = *current, to = target, "tier concurrency updated");
            *current = target;
        }

        if let Some(idle) = worker_idle {
            self.inner.worker.set_idle_timeout(idle);
        }
        Ok(())
    }

    /// Stop admitting jobs and tear the worker down. Running jobs finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.worker.shutdown();
    }
}

async fn dispatch_loop(
    inner: Arc<SchedulerInner>,
    mut job_rx: mpsc::UnboundedReceiver<PipelineJob>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            process_job(&inner, job).await;
            drop(permit);
        });
    }
    info!("pipeline dispatcher stopped");
}

/// Run one document start to finish. Never propagates an error: every
/// failure path lands in the store so one bad document cannot take the
/// pipeline down.
async fn process_job(inner: &SchedulerInner, job: PipelineJob) {
    let id = job.document_id.as_str();
    info!(document = id, path = %job.path.display(), "processing document");

    inner.store.set_status(id, DocumentStatus::Extracting).await;
    let extraction = match run_extraction(inner, &job).await {
        Ok(extraction) => extraction,
        Err(e) => {
            error!(document = id, error = %e, "extraction failed");
            inner.store.record_error(id, &format!("{e:#}")).await;
            inner.store.set_status(id, DocumentStatus::Error).await;
            return;
        }
    };
    inner
        .store
        .record_raw_extraction(id, extraction.ocr_tier, &extraction.full_text)
        .await;

    inner.store.set_status(id, DocumentStatus::Processing).await;

    // A model must be reachable before any LLM work; without one the
    // document cannot proceed at all.
    let model = match inner.resolver.resolve(inner.client.as_ref()).await {
        Ok(model) => model,
        Err(e) => {
            error!(document = id, error = %e, "no language model available");
            inner.store.record_error(id, &format!("{e:#}")).await;
            inner.store.set_status(id, DocumentStatus::Error).await;
            return;
        }
    };

    let (mut structured, raw_conversation) = match agent::agentic_extract(
        inner.client.as_ref(),
        &model,
        &extraction.full_text,
        extraction.pages.clone(),
    )
    .await
    {
        Ok(outcome) => (outcome.extraction, outcome.raw_conversation),
        Err(e) => {
            // The raw text is already stored; surface a draft the operator
            // can fill in by hand rather than a dead document.
            warn!(document = id, error = %e, "agentic extraction failed");
            let mut fallback = StructuredExtraction::default();
            fallback.push_note(&format!("LLM extraction failed: {e:#}. Raw text preserved."));
            (fallback, Vec::new())
        }
    };

    if let Some(text_layer) = extraction.text_layer_ref.as_deref() {
        inner.store.set_status(id, DocumentStatus::Verifying).await;
        match verify::verify_extraction(inner.client.as_ref(), &model, &structured, text_layer)
            .await
        {
            Ok(verification) if !verification.corrections.is_empty() => {
                info!(
                    document = id,
                    corrections = verification.corrections.len(),
                    "verification corrected the extraction"
                );
                structured = verification.corrected;
                structured.push_note(&format!(
                    "OCR corrections applied: {}",
                    verification.corrections.join("; ")
                ));
            }
            Ok(_) => info!(document = id, "verification found nothing to correct"),
            Err(e) => {
                // Verification is advisory; the unverified draft still ships.
                warn!(document = id, error = %e, "verification pass failed");
            }
        }
    }

    let original_filename = job
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| id.to_string());
    let display_name = generate_display_name(&structured, &original_filename);

    inner
        .store
        .record_result(
            id,
            DocumentResult {
                display_name,
                extraction: structured,
                raw_conversation,
            },
        )
        .await;
    inner.store.set_status(id, DocumentStatus::Draft).await;
    info!(document = id, "document processed");
}

async fn run_extraction(inner: &SchedulerInner, job: &PipelineJob) -> Result<ExtractionResult> {
    match job.forced_tier {
        Some(tier) => inner.controller.extract_with_tier(&job.path, tier).await,
        None => inner.controller.extract_document(&job.path).await,
    }
}
