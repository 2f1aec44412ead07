//! Ready-made collaborator implementations: an in-memory credential store and
//! notification sinks.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::model::{AccountId, Additionals, ServiceLinkId};
use crate::ports::{CredentialStore, NotificationSink, PartialFailure, PortError};

#[derive(Default)]
/// Credential store keeping every bag in memory.
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<(AccountId, ServiceLinkId), Additionals>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
    ) -> Result<Option<Additionals>, PortError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(account.clone(), link.clone())).cloned())
    }

    async fn save(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
        additionals: &Additionals,
    ) -> Result<(), PortError> {
        let mut entries = self.entries.write().await;
        entries.insert((account.clone(), link.clone()), additionals.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
/// Sink reporting degraded providers as warn-level events.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn partial_failure(&self, failure: &PartialFailure) {
        warn!(
            link = %failure.link_id,
            provider = %failure.provider,
            capability = %failure.capability,
            severity = ?failure.severity,
            message = %failure.message,
            "provider degraded"
        );
    }
}

#[derive(Debug, Default)]
/// Sink collecting failures until a caller drains them.
pub struct RecordingSink {
    failures: Mutex<Vec<PartialFailure>>,
}

impl RecordingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded failures.
    pub fn take(&self) -> Vec<PartialFailure> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *failures)
    }
}

impl NotificationSink for RecordingSink {
    fn partial_failure(&self, failure: &PartialFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure.clone());
    }
}
