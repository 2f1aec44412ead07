//! `cartable.toml` loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use cartable_core::{
    Account, AccountId, Additionals, Capability, FederationConfig, ProviderKind, ServiceLink,
    ServiceLinkId,
};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
/// Everything the command-line driver needs to build an account manager.
pub struct CliConfig {
    /// Timeouts and refresh policy.
    #[serde(default)]
    pub federation: FederationConfig,
    /// The account and its links.
    pub account: AccountConfig,
    /// JSON file holding refreshed credentials.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

#[derive(Debug, Deserialize)]
/// `[account]` section.
pub struct AccountConfig {
    /// Account identifier, also the key in the credential file.
    pub id: String,
    /// Name shown in listings.
    #[serde(default)]
    pub display_name: String,
    /// `[[account.links]]` entries.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

#[derive(Debug, Deserialize)]
/// One `[[account.links]]` entry.
pub struct LinkConfig {
    /// Link identifier.
    pub id: String,
    /// Provider kind, e.g. `pronote`.
    pub provider: ProviderKind,
    /// Capabilities remembered from an earlier login, if any.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Inline credentials; the credential file wins when it has an entry.
    #[serde(default)]
    pub additionals: Additionals,
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("cartable-credentials.json")
}

impl CliConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, malformed or does not validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the account manager cannot work with.
    ///
    /// # Errors
    ///
    /// Names the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.account.id.trim().is_empty() {
            bail!("account.id must not be empty");
        }
        if self.federation.call_timeout_secs == 0 {
            bail!("federation.call_timeout_secs must be positive");
        }
        let mut seen = Vec::with_capacity(self.account.links.len());
        for link in &self.account.links {
            if link.id.trim().is_empty() {
                bail!("account.links entries need an id");
            }
            if seen.contains(&link.id.as_str()) {
                bail!("duplicate link id `{}`", link.id);
            }
            seen.push(link.id.as_str());
        }
        Ok(())
    }

    /// Build the domain account from the configured links.
    #[must_use]
    pub fn account(&self) -> Account {
        let mut account = Account::new(
            AccountId(self.account.id.clone()),
            if self.account.display_name.is_empty() {
                self.account.id.clone()
            } else {
                self.account.display_name.clone()
            },
        );
        let now = Utc::now();
        for link in &self.account.links {
            let mut service_link = ServiceLink::new(
                ServiceLinkId(link.id.clone()),
                link.provider,
                link.additionals.clone(),
            );
            service_link.capabilities.clone_from(&link.capabilities);
            service_link.updated_at = now;
            account.upsert_link(service_link);
        }
        account
    }
}
