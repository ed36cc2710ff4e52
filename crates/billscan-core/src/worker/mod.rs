//! Persistent external worker process management.
//!
//! A worker is a long-lived child process (in production, the Python OCR
//! worker) that speaks line-delimited JSON: one request object in on stdin,
//! one response object out on stdout. Keeping it alive between requests
//! means interpreters and ML models load once, not per document.
//!
//! The manager owns the process exclusively. Requests funnel through a
//! channel into a single consumer loop, so exactly one request is in flight
//! at a time and responses match requests in strict FIFO order. After an
//! idle period with nothing queued, the process is torn down to reclaim
//! memory; the next request transparently respawns it.
//!
//! ```text
//! stopped ──request──► starting ──► ready ──request──► busy
//!    ▲                                │ ▲                │
//!    └────────── idle timeout ────────┘ └── response ────┘
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors surfaced to callers of [`WorkerHandle::request`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(String),
    #[error("worker process exited unexpectedly (code={code:?})")]
    UnexpectedExit { code: Option<i32> },
    #[error("failed to parse worker response: {0}")]
    MalformedResponse(String),
    #[error("worker error: {0}")]
    Remote(String),
    #[error("worker manager is shut down")]
    ShutDown,
}

/// How to launch the external process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Short name used in log lines (e.g. "ocr").
    pub label: String,
    /// Tear the process down after this long with no requests.
    pub idle_timeout: Duration,
}

/// A request waiting in the manager's queue.
///
/// Created per `request()` call and consumed when its response line arrives
/// or the owning process dies; it never outlives the call.
struct PendingRequest {
    input: serde_json::Value,
    reply: oneshot::Sender<Result<serde_json::Value, WorkerError>>,
}

/// Cloneable handle to one worker manager.
///
/// Dropping all handles does not kill a running worker immediately; call
/// [`WorkerHandle::shutdown`] for deterministic teardown.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<PendingRequest>,
    idle_tx: Arc<watch::Sender<Duration>>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Send one request to the worker, spawning the process if needed.
    ///
    /// Requests are answered in submission order, one at a time. There is
    /// no protocol-level timeout: a stuck worker blocks this call until the
    /// process dies. A caller that imposes its own deadline must treat the
    /// worker as compromised afterwards and call [`shutdown`](Self::shutdown)
    /// rather than reuse it.
    pub async fn request(
        &self,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingRequest { input, reply })
            .map_err(|_| WorkerError::ShutDown)?;
        rx.await.map_err(|_| WorkerError::ShutDown)?
    }

    /// Change the idle timeout. Applies from the next dispatch.
    pub fn set_idle_timeout(&self, timeout: Duration) {
        let _ = self.idle_tx.send(timeout);
    }

    /// Stop the consumer loop and kill the process. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the manager task for one external worker program.
pub fn spawn_manager(config: WorkerConfig) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (idle_tx, idle_rx) = watch::channel(config.idle_timeout);
    let cancel = CancellationToken::new();

    tokio::spawn(run_manager(config, rx, idle_rx, cancel.clone()));

    WorkerHandle {
        tx,
        idle_tx: Arc::new(idle_tx),
        cancel,
    }
}

/// A spawned child with its stream ends split out.
struct RunningWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

async fn run_manager(
    config: WorkerConfig,
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
    idle_rx: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    let mut proc: Option<RunningWorker> = None;

    loop {
        // ready: wait for work, or tear down on idle; stopped: just wait.
        let next = if proc.is_some() {
            let idle = *idle_rx.borrow();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                req = rx.recv() => req,
                _ = tokio::time::sleep(idle) => {
                    info!(label = %config.label, "Idle timeout - shutting down worker");
                    stop_worker(proc.take()).await;
                    continue;
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                req = rx.recv() => req,
            }
        };

        let Some(PendingRequest { input, reply }) = next else {
            break; // all handles dropped
        };

        // A worker that exited cleanly between requests is replaced, not reused.
        if let Some(running) = proc.as_mut() {
            if let Ok(Some(status)) = running.child.try_wait() {
                debug!(label = %config.label, code = ?status.code(), "Worker exited while idle");
                proc = None;
            }
        }

        if proc.is_none() {
            match spawn_worker(&config) {
                Ok(running) => proc = Some(running),
                Err(e) => {
                    // Spawn failure rejects this request only; no auto-retry.
                    let _ = reply.send(Err(WorkerError::Spawn(e.to_string())));
                    continue;
                }
            }
        }
        let worker = proc.as_mut().expect("worker spawned above");

        // busy: one line out, one line back.
        let outcome = dispatch(worker, &input).await;

        match outcome {
            Err(WorkerError::UnexpectedExit { code }) => {
                warn!(label = %config.label, code = ?code, "Worker exited with request in flight");
                let _ = reply.send(Err(WorkerError::UnexpectedExit { code }));
                stop_worker(proc.take()).await;
                reject_queued(&mut rx, code);
            }
            other => {
                let _ = reply.send(other);
            }
        }
    }

    stop_worker(proc.take()).await;
    // Anything still queued at shutdown is rejected, not silently dropped.
    while let Ok(pending) = rx.try_recv() {
        let _ = pending.reply.send(Err(WorkerError::ShutDown));
    }
    debug!(label = %config.label, "Worker manager stopped");
}

/// Write one request line and wait for exactly one response line.
async fn dispatch(
    worker: &mut RunningWorker,
    input: &serde_json::Value,
) -> Result<serde_json::Value, WorkerError> {
    let mut line = input.to_string();
    line.push('\n');

    if worker.stdin.write_all(line.as_bytes()).await.is_err()
        || worker.stdin.flush().await.is_err()
    {
        let code = worker.child.wait().await.ok().and_then(|s| s.code());
        return Err(WorkerError::UnexpectedExit { code });
    }

    tokio::select! {
        biased;
        line = worker.stdout.next_line() => match line {
            Ok(Some(line)) => parse_response(&line),
            // stdout closed: the process is gone; collect the exit code.
            Ok(None) | Err(_) => {
                let code = worker.child.wait().await.ok().and_then(|s| s.code());
                Err(WorkerError::UnexpectedExit { code })
            }
        },
        status = worker.child.wait() => {
            Err(WorkerError::UnexpectedExit { code: status.ok().and_then(|s| s.code()) })
        }
    }
}

/// A response line is one JSON object; an `error` field means failure.
fn parse_response(line: &str) -> Result<serde_json::Value, WorkerError> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|_| {
        let snippet: String = line.chars().take(200).collect();
        WorkerError::MalformedResponse(snippet)
    })?;
    if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
        return Err(WorkerError::Remote(message.to_string()));
    }
    Ok(value)
}

fn spawn_worker(config: &WorkerConfig) -> anyhow::Result<RunningWorker> {
    info!(label = %config.label, program = %config.program, "Spawning worker");

    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("worker stdin not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("worker stdout not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("worker stderr not piped"))?;

    // Diagnostics go to the log, never into the response stream.
    let label = config.label.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(label = %label, "{}", line);
        }
    });

    Ok(RunningWorker {
        child,
        stdin,
        stdout: BufReader::new(stdout).lines(),
    })
}

async fn stop_worker(proc: Option<RunningWorker>) {
    if let Some(mut worker) = proc {
        drop(worker.stdin); // close the pipe so well-behaved workers exit on EOF
        let _ = worker.child.kill().await;
    }
}

/// Reject everything queued behind a request that died with its process.
/// The next `request()` call triggers a fresh spawn.
fn reject_queued(rx: &mut mpsc::UnboundedReceiver<PendingRequest>, code: Option<i32>) {
    while let Ok(pending) = rx.try_recv() {
        let _ = pending.reply.send(Err(WorkerError::UnexpectedExit { code }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh_worker(script: &str, idle_timeout: Duration) -> WorkerHandle {
        spawn_manager(WorkerConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            label: "test".to_string(),
            idle_timeout,
        })
    }

    /// Echoes each request line back verbatim.
    const ECHO: &str = r#"while IFS= read -r line; do printf '%s\n' "$line"; done"#;

    #[tokio::test]
    async fn test_request_round_trip() {
        let handle = sh_worker(ECHO, Duration::from_secs(60));
        let response = handle.request(json!({"op": "ping", "n": 1})).await.unwrap();
        assert_eq!(response, json!({"op": "ping", "n": 1}));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_fifo_order_across_concurrent_callers() {
        let handle = sh_worker(ECHO, Duration::from_secs(60));

        let futures: Vec<_> = (0..8)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { (i, handle.request(json!({"seq": i})).await) })
            })
            .collect();

        // Each caller must get the echo of its own request; with the echo
        // worker, any reordering would cross-deliver payloads.
        for fut in futures {
            let (i, result) = fut.await.unwrap();
            assert_eq!(result.unwrap(), json!({"seq": i}));
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_error_field_rejects() {
        let script = r#"while IFS= read -r line; do printf '{"error":"boom"}\n'; done"#;
        let handle = sh_worker(script, Duration::from_secs(60));

        let err = handle.request(json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::Remote(ref m) if m == "boom"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_response_rejects_without_killing_manager() {
        let script = r#"while IFS= read -r line; do printf 'not json\n'; done"#;
        let handle = sh_worker(script, Duration::from_secs(60));

        let err = handle.request(json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedResponse(_)));

        // The manager survives and keeps serving.
        let err = handle.request(json!({"a": 2})).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedResponse(_)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_crash_rejects_in_flight_and_queued() {
        // Reads one request, then dies without responding.
        let script = r#"IFS= read -r line; exit 3"#;
        let handle = sh_worker(script, Duration::from_secs(60));

        let futures: Vec<_> = (0..3)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.request(json!({"seq": i})).await })
            })
            .collect();

        let mut exit_errors = 0;
        for fut in futures {
            match fut.await.unwrap() {
                Err(WorkerError::UnexpectedExit { .. }) => exit_errors += 1,
                other => panic!("expected UnexpectedExit, got {:?}", other),
            }
        }
        assert_eq!(exit_errors, 3);

        // Next call self-heals with a fresh spawn (which also crashes, but
        // the manager itself keeps working).
        let err = handle.request(json!({"seq": 99})).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnexpectedExit { .. }));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_spawn_failure_rejects_only_that_request() {
        let handle = spawn_manager(WorkerConfig {
            program: "/nonexistent/billscan-worker".to_string(),
            args: vec![],
            label: "test".to_string(),
            idle_timeout: Duration::from_secs(60),
        });

        let err = handle.request(json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));

        // No retry of the failed request, but the manager accepts new ones.
        let err = handle.request(json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_idle_teardown_and_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!(
            r#"echo spawned >> {}; while IFS= read -r line; do printf '%s\n' "$line"; done"#,
            marker.display()
        );
        let handle = sh_worker(&script, Duration::from_millis(100));

        handle.request(json!({"n": 1})).await.unwrap();

        // Let the idle timer fire with nothing in flight.
        tokio::time::sleep(Duration::from_millis(400)).await;

        handle.request(json!({"n": 2})).await.unwrap();
        // A short wait so the second marker line is flushed.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spawns = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(spawns.lines().count(), 2, "expected teardown then respawn");
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let handle = sh_worker(ECHO, Duration::from_secs(60));
        handle.request(json!({})).await.unwrap();

        handle.shutdown();
        handle.shutdown();

        let err = handle.request(json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::ShutDown));
    }
}
