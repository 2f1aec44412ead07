//! Registry for all provider plugins and their factories.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{AccountId, ProviderKind, ServiceLinkId};
use crate::ports::{PortError, ServicePlugin};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identity of the link a plugin instance serves, stamped on the records it returns.
pub struct PluginContext {
    /// Owning account.
    pub account_id: AccountId,
    /// Link the instance was created for.
    pub link_id: ServiceLinkId,
}

/// Builds a fresh plugin instance for one link.
pub trait PluginFactory: Send + Sync {
    /// Create a plugin bound to `context`.
    fn create(&self, context: PluginContext) -> Arc<dyn ServicePlugin>;
}

impl<F> PluginFactory for F
where
    F: Fn(PluginContext) -> Arc<dyn ServicePlugin> + Send + Sync,
{
    fn create(&self, context: PluginContext) -> Arc<dyn ServicePlugin> {
        self(context)
    }
}

#[derive(Debug, Clone)]
/// Metadata describing a provider and its human-friendly name.
pub struct ProviderMeta {
    /// Provider kind handled by the entry.
    pub kind: ProviderKind,
    /// Display name.
    pub name: String,
}

/// A provider known to the application.
pub struct ProviderEntry {
    /// Static metadata describing the provider.
    pub meta: ProviderMeta,
    /// Factory creating one plugin per link.
    pub factory: Arc<dyn PluginFactory>,
}

/// Registry that resolves plugin factories by provider kind.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, ProviderEntry>,
}

impl ProviderRegistry {
    /// Build a registry from the provided entries.
    #[must_use]
    pub fn new(providers: Vec<ProviderEntry>) -> Self {
        let providers_map = providers
            .into_iter()
            .map(|entry| (entry.meta.kind, entry))
            .collect();
        Self {
            providers: providers_map,
        }
    }

    /// Return metadata for all registered providers.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderMeta> {
        self.providers
            .values()
            .map(|entry| entry.meta.clone())
            .collect()
    }

    /// Look up the entry for a provider kind.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnsupportedProvider`] when nothing is registered.
    pub fn provider(&self, kind: ProviderKind) -> Result<&ProviderEntry, PortError> {
        self.providers
            .get(&kind)
            .ok_or(PortError::UnsupportedProvider(kind))
    }

    /// Create a new plugin instance for a link.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::UnsupportedProvider`] when nothing is registered.
    pub fn instantiate(
        &self,
        kind: ProviderKind,
        context: PluginContext,
    ) -> Result<Arc<dyn ServicePlugin>, PortError> {
        Ok(self.provider(kind)?.factory.create(context))
    }
}
