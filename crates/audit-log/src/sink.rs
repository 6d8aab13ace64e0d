use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::writer::{AuditWriteError, AuditWriter};

/// Channel buffer size used between producers and the background writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Flush after this long without new entries.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// The background writer has exited; the entry was not recorded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit sink is closed")]
pub struct AuditSinkClosed;

/// Cloneable handle that submits [`AuditEntry`] values to a background
/// JSON-lines writer.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditSink {
    /// Open the log at `path` and spawn the writer task.
    ///
    /// The task flushes after [`FLUSH_INTERVAL`] of inactivity and once more
    /// when the last `AuditSink` clone is dropped. It resolves to the number
    /// of entries written. Write errors are logged and the entry skipped.
    pub async fn start(
        path: impl AsRef<Path>,
    ) -> Result<(Self, JoinHandle<u64>), AuditWriteError> {
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_BUFFER);

        let writer = AuditWriter::new(path).await?;
        tracing::debug!(path = %writer.path().display(), "audit writer started");

        let handle = tokio::spawn(run_writer_loop(writer, rx));

        Ok((Self { tx }, handle))
    }

    /// Queue an entry, waiting for channel capacity if needed.
    pub async fn log(&self, entry: AuditEntry) -> Result<(), AuditSinkClosed> {
        self.tx.send(entry).await.map_err(|err| {
            tracing::warn!(event_type = ?err.0.event_type, "audit sink closed, entry dropped");
            AuditSinkClosed
        })
    }
}

async fn run_writer_loop(mut writer: AuditWriter, mut rx: mpsc::Receiver<AuditEntry>) -> u64 {
    let mut dirty = false;

    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(entry)) => match writer.write(&entry).await {
                Ok(()) => dirty = true,
                Err(err) => tracing::error!(%err, entry_id = %entry.id, "failed to write audit entry"),
            },
            Ok(None) => {
                if dirty {
                    if let Err(err) = writer.flush().await {
                        tracing::error!(%err, "failed to flush audit log on shutdown");
                    }
                }
                tracing::debug!(written = writer.written(), "audit writer shutting down");
                return writer.written();
            }
            Err(_) if dirty => match writer.flush().await {
                Ok(()) => dirty = false,
                Err(err) => tracing::error!(%err, "periodic audit log flush failed"),
            },
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entry::{AuditEventType, AuditSource};
    use crate::writer::read_entries;

    #[tokio::test]
    async fn drains_all_entries_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let (sink, handle) = AuditSink::start(&path).await.unwrap();
        let clone = sink.clone();
        for n in 0..10 {
            let target = if n % 2 == 0 { &sink } else { &clone };
            target
                .log(AuditEntry::new(
                    AuditEventType::PolicyEvaluated,
                    AuditSource::new("test"),
                    json!({"n": n}),
                ))
                .await
                .unwrap();
        }
        drop(sink);
        drop(clone);

        assert_eq!(handle.await.unwrap(), 10);
        let entries = read_entries(&path).await.unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[9].details["n"], 9);
    }

    #[tokio::test]
    async fn log_fails_once_writer_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, handle) = AuditSink::start(dir.path().join("audit.jsonl")).await.unwrap();
        handle.abort();
        let _ = handle.await;

        let result = sink
            .log(AuditEntry::new(
                AuditEventType::PolicyDenied,
                AuditSource::new("test"),
                json!({}),
            ))
            .await;
        assert_eq!(result, Err(AuditSinkClosed));
    }
}
