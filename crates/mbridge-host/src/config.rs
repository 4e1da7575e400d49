use std::path::Path;

use mbridge_attach::DetachPolicy;
use mbridge_operator::{ClassNames, ProviderRetention};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// Overrides [`BridgeConfig::detach_policy`].
pub const ENV_DETACH_POLICY: &str = "MBRIDGE_DETACH_POLICY";
/// Overrides [`BridgeConfig::provider_retention`].
pub const ENV_PROVIDER_RETENTION: &str = "MBRIDGE_PROVIDER_RETENTION";

/// Process-wide bridge settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// When bridge-attached threads are detached.
    pub detach_policy: DetachPolicy,
    /// How adapters hold their provider unless the adapter says otherwise.
    pub provider_retention: ProviderRetention,
    /// Managed types the loaders resolve.
    pub class_names: ClassNames,
}

impl BridgeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> HostResult<Self> {
        toml::from_str(text).map_err(|e| HostError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> HostResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> HostResult<String> {
        toml::to_string_pretty(self).map_err(|e| HostError::Config(e.to_string()))
    }

    /// Apply `MBRIDGE_*` overrides from the process environment.
    pub fn apply_env(self) -> HostResult<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up by environment variable name.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> HostResult<Self> {
        if let Some(value) = lookup(ENV_DETACH_POLICY) {
            self.detach_policy = value
                .parse()
                .map_err(|e| HostError::Config(format!("{ENV_DETACH_POLICY}: {e}")))?;
        }
        if let Some(value) = lookup(ENV_PROVIDER_RETENTION) {
            self.provider_retention = value
                .parse()
                .map_err(|e| HostError::Config(format!("{ENV_PROVIDER_RETENTION}: {e}")))?;
        }
        Ok(self)
    }
}
