/// `load_config` module: loads the static YAML config and injects secrets from the environment.
///
/// This is the only place where untrusted YAML is parsed. The environment and proxy sections
/// map directly onto [`BridgeConfig`]; the `management` section describes the connector's
/// management API and stays in the CLI crate.
///
/// # Secrets
/// The management API key is never expected in the file. `AAS_BRIDGE_MANAGEMENT_API_KEY`
/// (possibly from a `.env` file loaded by `main`) overrides whatever the file says.
///
/// # Errors
/// Every failure is an `anyhow::Error` naming the file, surfaced at the CLI boundary.
///
/// Example:
/// ```yaml
/// management:
///   url: http://connector:19193/management
/// environments:
///   - name: factory
///     base_url: http://aas-repository:8081/api/v3.0
///     inventory_path: ./state/factory.json
///     policies:
///       default: { access_policy_id: allow-members, contract_policy_id: use-eu }
/// ```
use aas_bridge_core::config::BridgeConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const MANAGEMENT_API_KEY_ENV: &str = "AAS_BRIDGE_MANAGEMENT_API_KEY";

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub management: Option<ManagementSection>,
    #[serde(flatten)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagementSection {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_management_timeout")]
    pub request_timeout_secs: u64,
}

fn default_management_timeout() -> u64 {
    30
}

/// Reads, parses and validates the config at `path`, then applies environment secrets.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let mut config: CliConfig = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = %e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML {:?}: {e}", path_ref)
    })?;

    if let Ok(api_key) = std::env::var(MANAGEMENT_API_KEY_ENV) {
        match config.management.as_mut() {
            Some(management) => management.api_key = Some(api_key),
            None => info!("{MANAGEMENT_API_KEY_ENV} set but no management section configured"),
        }
    }

    config
        .bridge
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path_ref))?;
    if let Some(management) = &config.management {
        reqwest::Url::parse(&management.url)
            .with_context(|| format!("Invalid management url {:?}", management.url))?;
        if management.request_timeout_secs == 0 {
            bail!("management.request_timeout_secs must be at least 1");
        }
    }

    config.bridge.trace_loaded();
    info!(
        management = ?config.management.as_ref().map(|m| m.url.as_str()),
        api_key_set = config.management.as_ref().is_some_and(|m| m.api_key.is_some()),
        "Configuration loaded"
    );
    Ok(config)
}
