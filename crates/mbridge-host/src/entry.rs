//! Process-wide entry points for the embedding host.

use std::sync::{Arc, OnceLock};

use mbridge_hooks::UnloadReport;
use mbridge_runtime::ManagedRuntime;
use tracing::warn;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::{HostError, HostResult};

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Install the process-wide bridge. Fails if one is already installed.
pub fn install(runtime: Arc<dyn ManagedRuntime>, config: BridgeConfig) -> HostResult<&'static Bridge> {
    let bridge = Bridge::new(runtime, config)?;
    BRIDGE.set(bridge).map_err(|_| HostError::AlreadyInstalled)?;
    BRIDGE.get().ok_or(HostError::AlreadyInstalled)
}

/// The installed bridge, if any.
pub fn installed() -> Option<&'static Bridge> {
    BRIDGE.get()
}

/// Library load: install a bridge configured from the environment and run
/// its loaders. Returns the runtime interface version.
pub fn on_load(runtime: Arc<dyn ManagedRuntime>) -> HostResult<u32> {
    let config = BridgeConfig::default().apply_env()?;
    install(runtime, config)?.load()
}

/// Library unload. Returns `None` if nothing was installed.
pub fn on_unload() -> Option<UnloadReport> {
    let Some(bridge) = BRIDGE.get() else {
        warn!("unload without a loaded bridge");
        return None;
    };
    Some(bridge.unload())
}
