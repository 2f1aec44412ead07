//! Credential store backed by a JSON file, so refreshed tokens survive restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cartable_core::{AccountId, Additionals, CredentialStore, PortError, ServiceLinkId};
use tokio::sync::Mutex;
use tracing::debug;

type Entries = BTreeMap<String, BTreeMap<String, Additionals>>;

/// `{ "<account>": { "<link>": { …credentials… } } }` on disk.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Store`] when the file exists but cannot be read or parsed.
    pub async fn open(path: &Path) -> Result<Self, PortError> {
        let entries = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|error| {
                PortError::Store(format!("{} is not a credential file: {error}", path.display()))
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Entries::new(),
            Err(error) => {
                return Err(PortError::Store(format!(
                    "failed to read {}: {error}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }
}

#[async_trait]
impl CredentialStore for JsonFileStore {
    async fn load(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
    ) -> Result<Option<Additionals>, PortError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&account.0)
            .and_then(|links| links.get(&link.0))
            .cloned())
    }

    async fn save(
        &self,
        account: &AccountId,
        link: &ServiceLinkId,
        additionals: &Additionals,
    ) -> Result<(), PortError> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(account.0.clone())
            .or_default()
            .insert(link.0.clone(), additionals.clone());

        let json = serde_json::to_vec_pretty(&*entries)
            .map_err(|error| PortError::Store(error.to_string()))?;
        // Replace the file atomically.
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|error| PortError::Store(format!("{}: {error}", staging.display())))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|error| PortError::Store(format!("{}: {error}", self.path.display())))?;
        debug!(path = %self.path.display(), %link, "credentials saved");
        Ok(())
    }
}
