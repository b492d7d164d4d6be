//! Persistence layer: the [`Store`] contract and its reference backends
//!
//! The store uniquely owns the canonical engine state. Two implementations
//! ship with the crate:
//! - [`MemoryStore`]: single-process, used by tests and inline mode
//! - [`PostgresStore`]: relational backend for production deployments

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    AuditEntry, AuditKind, ErrorInfo, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus,
    Schedule, ScheduleKind, SchedulePatch, ScheduleStatus, SlotState, StepResult, Store,
    StoreError, Timer, TimerKind, TimerStatus,
};

/// Rejected namespace value
#[derive(Debug, thiserror::Error)]
#[error("invalid namespace {0:?}: must not be blank")]
pub struct InvalidNamespace(pub String);

/// Tenant-scoping prefix applied to persistent keys, queue names, and bus
/// channels
///
/// The raw value is percent-encoded so arbitrary tenant names cannot collide
/// with the `:`-separated key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(raw: &str) -> Result<Self, InvalidNamespace> {
        if raw.trim().is_empty() {
            return Err(InvalidNamespace(raw.to_string()));
        }
        Ok(Self(urlencoding::encode(raw).into_owned()))
    }

    /// The encoded namespace value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix a bus channel or storage key: `durable:<ns>:<suffix>`
    pub fn scoped(&self, suffix: &str) -> String {
        format!("durable:{}:{suffix}", self.0)
    }

    /// Queue name for this namespace
    pub fn queue_name(&self) -> String {
        format!("durable_executions:{}", self.0)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self("default".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_namespace_rejected() {
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("   ").is_err());
    }

    #[test]
    fn test_namespace_encoding() {
        let ns = Namespace::new("tenant a:b").unwrap();
        assert_eq!(ns.as_str(), "tenant%20a%3Ab");
        assert_eq!(ns.scoped("execution:e1"), "durable:tenant%20a%3Ab:execution:e1");
    }

    #[test]
    fn test_queue_name() {
        let ns = Namespace::new("prod").unwrap();
        assert_eq!(ns.queue_name(), "durable_executions:prod");
    }
}
