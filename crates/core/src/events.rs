use overseer_shared::{RunEvent, Severity};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const EVENT_QUEUE_DEPTH: usize = 1024;
const APPEND_ATTEMPTS: u32 = 3;

enum LogCommand {
    Append(RunEvent),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSONL RunEvent log.
///
/// All appends go through one writer task, so lines land in emission order.
/// `emit` never blocks the caller and never fails: a full queue or a dead
/// writer drops the event with a warning.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::Sender<LogCommand>,
    path: Arc<PathBuf>,
}

impl EventLog {
    /// Starts the writer task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(writer_loop(path.clone(), rx));
        Self {
            tx,
            path: Arc::new(path),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(&self, event: RunEvent) {
        trace_event(&event);
        if let Err(e) = self.tx.try_send(LogCommand::Append(event)) {
            warn!("RunEvent dropped: {}", e);
        }
    }

    /// Waits until every event emitted before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(ack_tx)).await.is_err() {
            warn!("RunEvent writer is gone; flush skipped");
            return;
        }
        let _ = ack_rx.await;
    }
}

fn trace_event(event: &RunEvent) {
    let phase = event.phase;
    match event.severity {
        Severity::Debug => debug!(phase = %phase, event_type = %event.event_type, payload = %event.payload, "run event"),
        Severity::Info => info!(phase = %phase, event_type = %event.event_type, payload = %event.payload, "run event"),
        Severity::Warning => warn!(phase = %phase, event_type = %event.event_type, payload = %event.payload, "run event"),
        Severity::Error | Severity::Critical => {
            error!(phase = %phase, event_type = %event.event_type, payload = %event.payload, "run event");
        }
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::Receiver<LogCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Append(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    Err(e) => {
                        error!("Failed to serialize RunEvent: {}", e);
                        continue;
                    }
                };
                append_with_retry(&path, &line).await;
            }
            LogCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn append_with_retry(path: &Path, line: &str) {
    for attempt in 0..APPEND_ATTEMPTS {
        match append_line(path, line).await {
            Ok(()) => return,
            Err(e) => {
                error!(attempt = attempt + 1, "Failed to append RunEvent: {}", e);
                if attempt + 1 < APPEND_ATTEMPTS {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        100 * (u64::from(attempt) + 1),
                    ))
                    .await;
                }
            }
        }
    }
    error!("RunEvent permanently lost after {} attempts", APPEND_ATTEMPTS);
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Reads the log back, skipping lines that do not parse.
pub async fn read_events(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<RunEvent>(l) {
            Ok(ev) => Some(ev),
            Err(e) => {
                warn!("Skipping malformed RunEvent line: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_shared::Phase;

    fn temp_log() -> PathBuf {
        std::env::temp_dir()
            .join(format!("overseer-events-{}", uuid::Uuid::new_v4()))
            .join("run_events.jsonl")
    }

    #[tokio::test]
    async fn test_events_are_appended_in_order() {
        let path = temp_log();
        let log = EventLog::spawn(path.clone());
        for i in 0..20 {
            log.emit(RunEvent::info(
                Phase::Loop,
                "tick",
                serde_json::json!({ "i": i }),
            ));
        }
        log.flush().await;

        let events = read_events(&path).await.unwrap();
        assert_eq!(events.len(), 20);
        for (i, ev) in events.iter().enumerate() {
            assert_eq!(ev.payload["i"], i);
        }
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_unwritable_path_is_not_fatal() {
        // A directory cannot be opened for append
        let dir = std::env::temp_dir().join(format!("overseer-events-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = EventLog::spawn(dir.clone());
        log.emit(RunEvent::warning(Phase::Canary, "lost", serde_json::json!({})));
        log.flush().await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let events = read_events(&temp_log()).await.unwrap();
        assert!(events.is_empty());
    }
}
