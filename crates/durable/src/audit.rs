//! Best-effort structured audit logging
//!
//! Every state-changing operation emits at most one audit entry. Audit
//! writes must never fail workflow progress: persistence and emitter errors
//! are logged and swallowed.

use std::sync::Arc;

use tracing::warn;

use crate::bus::EventBus;
use crate::persistence::{AuditEntry, Namespace, Store};

/// Appends audit entries through the store, mirroring them on the event bus
/// when one is configured (channel `audit:<execution_id>`)
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn Store>,
    bus: Option<Arc<dyn EventBus>>,
    namespace: Namespace,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn Store>, bus: Option<Arc<dyn EventBus>>, namespace: Namespace) -> Self {
        Self {
            store,
            bus,
            namespace,
        }
    }

    /// Append an entry; failures are swallowed after logging
    pub async fn append(&self, entry: AuditEntry) {
        if let Err(err) = self.store.append_audit_entry(entry.clone()).await {
            warn!(
                execution_id = %entry.execution_id,
                kind = ?entry.kind,
                error = %err,
                "failed to persist audit entry"
            );
        }

        if let Some(bus) = &self.bus {
            let channel = self
                .namespace
                .scoped(&format!("audit:{}", entry.execution_id));
            match serde_json::to_value(&entry) {
                Ok(payload) => {
                    if let Err(err) = bus.publish(&channel, payload).await {
                        warn!(%channel, error = %err, "failed to emit audit entry");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to encode audit entry");
                }
            }
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("namespace", &self.namespace)
            .field("has_bus", &self.bus.is_some())
            .finish()
    }
}
