//! Federation tuning loaded from the application's configuration file.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Timeouts and session-expiry policy applied to every linked provider.
pub struct FederationConfig {
    /// Per-provider deadline for one capability call, in seconds.
    pub call_timeout_secs: u64,
    /// Refresh ahead of a known token expiry instead of waiting for a 401.
    pub proactive_refresh: bool,
    /// How long before the declared expiry a token counts as expired, in seconds.
    pub expiry_skew_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 20,
            proactive_refresh: true,
            expiry_skew_secs: 30,
        }
    }
}

impl FederationConfig {
    /// Per-provider call deadline.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Expiry skew as a signed duration.
    #[must_use]
    pub fn expiry_skew(&self) -> TimeDelta {
        TimeDelta::from_std(Duration::from_secs(self.expiry_skew_secs)).unwrap_or(TimeDelta::MAX)
    }
}
