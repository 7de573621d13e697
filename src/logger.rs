use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::report::{duration_ms, rfc3339};

/// One logged query execution.
#[derive(Debug, Serialize)]
pub struct QueryLog {
    pub query: String,
    #[serde(with = "duration_ms")]
    pub time: Duration,
    #[serde(with = "rfc3339")]
    pub timestamp: SystemTime,
}

/// Asynchronous query logger.
///
/// Entries are sent to a dedicated writer task that persists them as JSON
/// lines; only entries at or above the configured threshold are written.
/// [`Logger::null`] discards everything without spawning a task. Clones
/// share the same sink; [`Logger::close`] flushes all pending entries and
/// releases it, and must be called exactly once, after every clone has been
/// dropped or detached.
#[derive(Clone, Default)]
pub struct Logger {
    tx: Option<mpsc::UnboundedSender<QueryLog>>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Logger {
    /// A logger that silently discards all entries.
    pub fn null() -> Self {
        Self::default()
    }

    /// Spawns the writer task persisting entries with `time >= threshold`
    /// to `out`.
    pub fn new<W>(out: W, threshold: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryLog>();

        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(out);

            while let Some(entry) = rx.recv().await {
                if entry.time < threshold {
                    continue;
                }

                match serde_json::to_vec(&entry) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        if out.write_all(&line).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "unloggable query entry"),
                }
            }

            let _ = out.flush().await;
            let _ = out.shutdown().await;
        });

        Self {
            tx: Some(tx),
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Queues one entry; never blocks the caller.
    pub fn log(&self, query: &str, time: Duration, timestamp: SystemTime) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(QueryLog {
                query: query.to_owned(),
                time,
                timestamp,
            });
        }
    }

    /// Drops this clone's sender without closing the shared sink.
    pub fn detach(&mut self) {
        self.tx = None;
    }

    /// Flushes pending entries and releases the sink.
    pub async fn close(&mut self) {
        self.tx = None;

        let writer = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}
