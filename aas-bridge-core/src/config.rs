//! Configuration consumed by the core. Loading (YAML, secrets) lives in the CLI crate;
//! these structs only describe and validate the values.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;
use crate::model::PolicyPair;
use crate::reference::KeyKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// One backing repository and how it is mirrored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Base URL of the repository. Also the namespace of this environment's stable ids.
    pub base_url: String,
    /// Static headers sent to the repository (e.g. an API key). Travel in data addresses.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
    /// Catalog shells as resources too. Submodels and elements are always cataloged.
    #[serde(default)]
    pub catalog_shells: bool,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub policies: PolicyConfig,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            headers: BTreeMap::new(),
            inventory_path: None,
            catalog_shells: false,
            sync: SyncConfig::default(),
            walk: WalkConfig::default(),
            probe: ProbeConfig::default(),
            policies: PolicyConfig::default(),
        }
    }

    /// Base URL without a trailing slash; the stable-id namespace.
    pub fn namespace(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Consecutive successful cycles an element must be absent before it is deleted.
    pub delete_after_missed: u32,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 50,
            delete_after_missed: 2,
            backoff_min_secs: 5,
            backoff_max_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    pub page_limit: u32,
    /// Submodels fetched in parallel.
    pub concurrency: usize,
    pub max_depth: usize,
    pub request_timeout_secs: u64,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            concurrency: 4,
            max_depth: 64,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive failures before the repository is considered down.
    pub down_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 5,
            down_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Pair bound to resources that no rule (and no parent) selects.
    #[serde(default)]
    pub default: Option<PolicyPair>,
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    #[serde(default)]
    pub semantic_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub kinds: Vec<KeyKind>,
    pub access_policy_id: String,
    pub contract_policy_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Abort transfers larger than this.
    pub max_bytes: Option<u64>,
    /// Outbound requests in flight across all transfers.
    pub max_concurrent: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            max_bytes: None,
            max_concurrent: 16,
        }
    }
}

fn at_least(field: &'static str, min: u64, value: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange { field, min, value });
    }
    Ok(())
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.as_str()) {
                return Err(ConfigError::DuplicateEnvironment(env.name.clone()));
            }
            env.validate()?;
        }
        at_least("proxy.request_timeout_secs", 1, self.proxy.request_timeout_secs)?;
        at_least("proxy.max_concurrent", 1, self.proxy.max_concurrent as u64)?;
        at_least("proxy.initial_backoff_ms", 1, self.proxy.initial_backoff_ms)?;
        if let Some(max_bytes) = self.proxy.max_bytes {
            at_least("proxy.max_bytes", 1, max_bytes)?;
        }
        Ok(())
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn trace_loaded(&self) {
        info!(
            environments = self.environments.len(),
            names = ?self.environments.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            proxy_timeout_secs = self.proxy.request_timeout_secs,
            proxy_max_bytes = ?self.proxy.max_bytes,
            "Loaded BridgeConfig"
        );
        debug!(?self, "BridgeConfig loaded (full debug)");
    }
}

impl EnvironmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            environment: self.name.clone(),
            url: self.base_url.clone(),
            reason,
        };
        let url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("no host".to_string()));
        }
        crate::validate::header_map(&self.headers).map_err(|v| ConfigError::InvalidHeader {
            environment: self.name.clone(),
            reason: v.message,
        })?;
        at_least("sync.interval_secs", 1, self.sync.interval_secs)?;
        at_least("sync.delete_after_missed", 1, self.sync.delete_after_missed.into())?;
        at_least("sync.backoff_min_secs", 1, self.sync.backoff_min_secs)?;
        at_least("walk.page_limit", 1, self.walk.page_limit.into())?;
        at_least("walk.concurrency", 1, self.walk.concurrency as u64)?;
        at_least("walk.max_depth", 2, self.walk.max_depth as u64)?;
        at_least("walk.request_timeout_secs", 1, self.walk.request_timeout_secs)?;
        at_least("probe.interval_secs", 1, self.probe.interval_secs)?;
        at_least("probe.timeout_secs", 1, self.probe.timeout_secs)?;
        at_least("probe.down_threshold", 1, self.probe.down_threshold.into())?;
        crate::policy::PolicyRules::compile(&self.policies)?;
        Ok(())
    }
}
