//! Automation audit trail.
//!
//! Every flow transition and triage decision produces an [`AutomationLog`].
//! Recording never blocks or fails the operation that produced it: the
//! production sink hands entries to a queue drained by a dedicated writer
//! with its own connection, and write failures are logged and dropped.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::db::{self, Database};
use crate::models::AutomationLog;

/// Upper bound on entries written per transaction by the queue writer.
const WRITE_BATCH_SIZE: usize = 64;

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Queue an entry. Never blocks, never fails.
    fn record(&self, entry: AutomationLog);

    /// Wait until everything recorded so far has been persisted.
    async fn flush(&self);
}

enum AuditCommand {
    Record(AutomationLog),
    Flush(oneshot::Sender<()>),
}

/// Queue-backed sink. Cloning is cheap; all clones feed the same writer.
#[derive(Clone)]
pub struct QueuedAuditSink {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl QueuedAuditSink {
    /// Start the writer on a blocking thread. It exits once every sink clone
    /// has been dropped and the queue is drained.
    pub fn start(database: Database) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || run_writer(database, rx));
        (Self { tx }, handle)
    }
}

#[async_trait]
impl AuditSink for QueuedAuditSink {
    fn record(&self, entry: AutomationLog) {
        if self.tx.send(AuditCommand::Record(entry)).is_err() {
            tracing::warn!("Audit writer stopped; dropping entry");
        }
    }

    async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn run_writer(database: Database, mut rx: mpsc::UnboundedReceiver<AuditCommand>) {
    let mut conn = match database.connect() {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(error = %e, "Audit writer could not open database");
            None
        }
    };

    let mut batch: Vec<AutomationLog> = Vec::with_capacity(WRITE_BATCH_SIZE);
    while let Some(command) = rx.blocking_recv() {
        let mut pending_flush = Vec::new();
        push_command(command, &mut batch, &mut pending_flush);
        // Drain whatever else is already queued into the same transaction.
        while batch.len() < WRITE_BATCH_SIZE {
            match rx.try_recv() {
                Ok(command) => push_command(command, &mut batch, &mut pending_flush),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if conn.is_none() {
                conn = database.connect().ok();
            }
            match conn.as_mut() {
                Some(c) => {
                    if let Err(e) = db::insert_automation_logs(c, &batch) {
                        tracing::warn!(error = %e, count = batch.len(), "Audit write failed");
                    } else {
                        tracing::debug!(count = batch.len(), "Flushed automation logs");
                    }
                }
                None => tracing::warn!(count = batch.len(), "Audit entries dropped: no database"),
            }
            batch.clear();
        }

        for done in pending_flush {
            let _ = done.send(());
        }
    }
}

fn push_command(
    command: AuditCommand,
    batch: &mut Vec<AutomationLog>,
    pending_flush: &mut Vec<oneshot::Sender<()>>,
) {
    match command {
        AuditCommand::Record(entry) => batch.push(entry),
        AuditCommand::Flush(done) => pending_flush.push(done),
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AutomationLog>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AutomationLog> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AutomationLog) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    async fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::ts;
    use crate::models::enums::AutomationAction;
    use uuid::Uuid;

    #[tokio::test]
    async fn queued_sink_persists_on_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let database = Database::initialize(&tmp.path().join("audit.db")).unwrap();
        let (sink, _writer) = QueuedAuditSink::start(database.clone());

        let flow_id = Uuid::new_v4();
        for _ in 0..3 {
            sink.record(
                AutomationLog::new(AutomationAction::StepResponseProcessed, ts(2026, 3, 1, 9, 0))
                    .flow(flow_id),
            );
        }
        sink.flush().await;

        let conn = database.connect().unwrap();
        let logs = db::get_logs_for_flow(&conn, &flow_id).unwrap();
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test]
    async fn writer_exits_when_sinks_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let database = Database::initialize(&tmp.path().join("audit.db")).unwrap();
        let (sink, writer) = QueuedAuditSink::start(database.clone());
        sink.record(AutomationLog::new(AutomationAction::TriageDecision, ts(2026, 3, 1, 9, 0)));
        drop(sink);
        writer.await.unwrap();

        let conn = database.connect().unwrap();
        let logs = db::get_logs_by_action(&conn, AutomationAction::TriageDecision).unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn memory_sink_collects_entries() {
        let sink = MemoryAuditSink::new();
        sink.record(AutomationLog::new(AutomationAction::FlowPaused, ts(2026, 3, 1, 9, 0)));
        sink.flush().await;
        assert_eq!(sink.entries().len(), 1);
        assert_eq!(sink.entries()[0].action_type, AutomationAction::FlowPaused);
    }
}
