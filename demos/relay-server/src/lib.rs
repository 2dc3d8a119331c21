//! Setup shared by the relay server and the watch client.

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_bridge_transport::BridgeConfig;

const CONFIG_ENV: &str = "AGENT_BRIDGE_CONFIG";

fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("agent-bridge").join("config.toml")))
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Load `$AGENT_BRIDGE_CONFIG`, else the per-user config file, else defaults.
///
/// # Errors
/// Returns error if a config file exists but is unreadable or invalid.
pub fn load_config() -> anyhow::Result<BridgeConfig> {
    match config_path() {
        Some(path) => {
            BridgeConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(BridgeConfig::default()),
    }
}
