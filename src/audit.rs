//! `AuditLogger`: best-effort audit trail. See §4.2. Two independent
//! sinks — the `Store` (if it supports `append_audit_entry` and audit
//! is enabled) and an optional streaming emitter — and failures in
//! either are swallowed: audit must never affect workflow correctness.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::DurableConfig;
use crate::model::{AuditEntry, AuditKind, ExecutionId};
use crate::store::Store;

/// Bounded so a slow/absent consumer can never backpressure the hot
/// execution path; per §9's "audit as fire-and-forget" note, a full
/// channel drops the entry rather than blocks.
const EMITTER_CAPACITY: usize = 1024;

pub struct AuditLogger {
    store: Arc<dyn Store>,
    audit_enabled: bool,
    emitter: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn Store>, config: &DurableConfig) -> Self {
        Self { store, audit_enabled: config.audit_enabled, emitter: None }
    }

    /// Installs a streaming emitter, returning the receiver half for the
    /// caller to drain. Entries are dropped (with a warning) once the
    /// channel fills up rather than blocking the workflow.
    pub fn with_emitter(mut self) -> (Self, mpsc::Receiver<AuditEntry>) {
        let (tx, rx) = mpsc::channel(EMITTER_CAPACITY);
        self.emitter = Some(tx);
        (self, rx)
    }

    pub async fn record(&self, execution_id: ExecutionId, attempt: u32, kind: AuditKind) {
        if !self.audit_enabled {
            return;
        }
        let entry = AuditEntry::new(execution_id, attempt, kind);
        if self.store.capabilities().audit {
            if let Err(err) = self.store.append_audit_entry(&entry).await {
                tracing::warn!(execution_id = %execution_id, error = %err, "failed to persist audit entry");
            }
        }
        if let Some(emitter) = &self.emitter {
            if emitter.try_send(entry).is_err() {
                tracing::warn!(execution_id = %execution_id, "audit emitter channel full, dropping entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    #[tokio::test]
    async fn disabled_audit_never_touches_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let logger = AuditLogger::new(store.clone(), &DurableConfig::default());
        logger.record(uuid::Uuid::now_v7(), 1, AuditKind::Note { message: "hi".into() }).await;
        assert!(store.list_audit_entries(uuid::Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_audit_persists_to_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let config = DurableConfig::default().with_audit_enabled(true);
        let logger = AuditLogger::new(store.clone(), &config);
        let execution_id = uuid::Uuid::now_v7();
        logger.record(execution_id, 1, AuditKind::Note { message: "hi".into() }).await;
        let rows = store.list_audit_entries(execution_id).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn emitter_receives_entries_and_drops_when_full() {
        let store = Arc::new(InMemoryStore::new());
        let config = DurableConfig::default().with_audit_enabled(true);
        let (logger, mut rx) = AuditLogger::new(store, &config).with_emitter();
        let execution_id = uuid::Uuid::now_v7();
        logger.record(execution_id, 1, AuditKind::Note { message: "hi".into() }).await;
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.execution_id, execution_id);
    }
}
