//! Picks the first reachable model from an ordered candidate list and
//! remembers the answer for the life of the process.

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::client::{ChatClient, ChatMessage};

pub struct ModelResolver {
    candidates: Vec<String>,
    cached: Mutex<Option<String>>,
}

impl ModelResolver {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates,
            cached: Mutex::new(None),
        }
    }

    /// Probe candidates in order with a one-token ping and cache the first
    /// that answers. Subsequent calls return the cached name without probing.
    pub async fn resolve(&self, client: &dyn ChatClient) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(model) = cached.as_ref() {
            return Ok(model.clone());
        }

        let ping = [ChatMessage::user("ping")];
        let mut failures = Vec::new();
        for candidate in &self.candidates {
            match client.complete(candidate, &ping, &[]).await {
                Ok(_) => {
                    info!(model = %candidate, "resolved language model");
                    *cached = Some(candidate.clone());
                    return Ok(candidate.clone());
                }
                Err(e) => {
                    warn!(model = %candidate, error = %e, "model candidate unreachable");
                    failures.push(format!("{candidate}: {e}"));
                }
            }
        }

        bail!("No reachable language model. Tried: {}", failures.join("; "))
    }

    /// Pin a model, bypassing probing. Used when the operator knows better.
    pub async fn force(&self, model: impl Into<String>) {
        *self.cached.lock().await = Some(model.into());
    }
}
