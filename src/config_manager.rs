// src/config_manager.rs
// Unified configuration for the agri-anchor service.
// Loaded once at startup and handed to each component explicitly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub anchoring: AnchoringConfig,
    pub integration: IntegrationConfig,
    pub security: SecurityConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkConfig {
    pub api_addr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

/// Ledger endpoint and signing credential.
/// Live anchoring needs both `rpc_url` and `signing_key_hex`; anything less selects the fallback ledger.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: Option<String>,
    /// 32-byte ed25519 seed, hex encoded
    pub signing_key_hex: Option<String>,
    pub contract_address: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AnchoringConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct IntegrationConfig {
    pub request_ttl_hours: i64,
    pub max_distance_m: f64,
    pub expiry_sweep_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_keys: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./agri_data".to_string(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            signing_key_hex: None,
            contract_address: None,
            timeout_ms: 10_000,
        }
    }
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            queue_capacity: 1024,
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            request_ttl_hours: 168,
            max_distance_m: 500.0,
            expiry_sweep_secs: 300,
        }
    }
}

impl LedgerConfig {
    /// True when both halves of the live credential are present and non-blank.
    pub fn has_live_credential(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        present(&self.rpc_url) && present(&self.signing_key_hex)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AnchoringConfig {
    /// Upper bound on how long a caller may wait for one agreement to settle.
    pub fn settle_budget(&self, ledger_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff_total = (0..attempts)
            .map(|i| self.base_delay_ms.saturating_mul(1u64 << i.min(20)).min(self.max_delay_ms))
            .sum::<u64>();
        ledger_timeout * attempts + Duration::from_millis(backoff_total) + Duration::from_secs(1)
    }
}

impl NodeConfig {
    /// Load from `path` (or the default location), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);
        let mut config = if config_path.exists() {
            let json = fs::read_to_string(&config_path)
                .with_context(|| format!("read config {}", config_path.display()))?;
            serde_json::from_str::<NodeConfig>(&json)
                .with_context(|| format!("parse config {}", config_path.display()))?
        } else {
            log::info!(
                "No config file at {} - using defaults",
                config_path.display()
            );
            NodeConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(addr) = var("API_ADDR") {
            self.network.api_addr = addr;
        }
        if let Some(path) = var("ROCKSDB_PATH") {
            self.storage.db_path = path;
        }
        if let Some(url) = var("LEDGER_RPC_URL") {
            self.ledger.rpc_url = Some(url);
        }
        if let Some(key) = var("LEDGER_SIGNING_KEY") {
            self.ledger.signing_key_hex = Some(key);
        }
        if let Some(addr) = var("LEDGER_CONTRACT_ADDRESS") {
            self.ledger.contract_address = Some(addr);
        }
        if let Some(ms) = var("LEDGER_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.ledger.timeout_ms = ms;
        }
        if let Some(n) = var("ANCHOR_WORKERS").and_then(|v| v.parse().ok()) {
            self.anchoring.workers = n;
        }
        if let Some(n) = var("ANCHOR_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.anchoring.max_attempts = n;
        }
        if let Some(keys) = var("API_KEYS") {
            self.security.api_keys = keys
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AGRI_CONFIG") {
        return PathBuf::from(path);
    }
    let home = if cfg!(windows) {
        std::env::var("USERPROFILE").unwrap_or_else(|_| "C:\\Users\\Default".to_string())
    } else {
        std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())
    };
    PathBuf::from(home).join(".agri_anchor").join("config.json")
}
