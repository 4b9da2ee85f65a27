// src/config.rs
// Startup validation of the loaded NodeConfig

use crate::config_manager::NodeConfig;
use log::{error, info, warn};

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("Configuration warnings:");
            for w in &self.warnings {
                warn!(" - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("Configuration errors:");
            for e in &self.errors {
                error!(" - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("Configuration validation passed");
        }
    }
}

/// Validate all critical configuration at startup
pub fn validate_config(config: &NodeConfig) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    validate_addresses(config, &mut validation);
    validate_ledger(config, &mut validation);
    validate_anchoring(config, &mut validation);
    validate_integration(config, &mut validation);
    validate_api_keys(config, &mut validation);

    validation
}

fn validate_addresses(config: &NodeConfig, validation: &mut ConfigValidation) {
    if config
        .network
        .api_addr
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        validation.add_error(format!(
            "network.api_addr '{}' is not a valid socket address",
            config.network.api_addr
        ));
    }
    if config.storage.db_path.trim().is_empty() {
        validation.add_error("storage.db_path is empty".into());
    }
}

fn validate_ledger(config: &NodeConfig, validation: &mut ConfigValidation) {
    let ledger = &config.ledger;
    let url = ledger.rpc_url.as_deref().filter(|s| !s.trim().is_empty());
    let key = ledger
        .signing_key_hex
        .as_deref()
        .filter(|s| !s.trim().is_empty());

    if let Some(url) = url {
        match url::Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
            Ok(parsed) => validation.add_error(format!(
                "ledger.rpc_url must be http(s), got scheme '{}'",
                parsed.scheme()
            )),
            Err(e) => validation.add_error(format!("ledger.rpc_url is not a URL: {}", e)),
        }
    }

    if let Some(key) = key {
        match hex::decode(key.trim()) {
            Ok(bytes) if bytes.len() == 32 => {}
            Ok(bytes) => validation.add_error(format!(
                "ledger.signing_key_hex must be 32 bytes (64 hex chars), got {} bytes",
                bytes.len()
            )),
            Err(_) => validation.add_error("ledger.signing_key_hex is not valid hex".into()),
        }
    }

    match (url, key) {
        (Some(_), Some(_)) => info!("Ledger credential configured - live anchoring enabled"),
        (Some(_), None) => validation.add_warning(
            "ledger.rpc_url set but no signing key - fallback ledger will be used".into(),
        ),
        (None, Some(_)) => validation.add_warning(
            "ledger signing key set but no rpc_url - fallback ledger will be used".into(),
        ),
        (None, None) => validation.add_warning(
            "No ledger endpoint configured - agreements anchor to the local fallback ledger".into(),
        ),
    }

    if ledger.timeout_ms == 0 {
        validation.add_error("ledger.timeout_ms must be greater than zero".into());
    }
}

fn validate_anchoring(config: &NodeConfig, validation: &mut ConfigValidation) {
    let anchoring = &config.anchoring;
    if anchoring.workers == 0 {
        validation.add_error("anchoring.workers must be at least 1".into());
    } else if anchoring.workers > 64 {
        validation.add_warning(format!(
            "anchoring.workers = {} is unusually high for ledger submission",
            anchoring.workers
        ));
    }
    if anchoring.max_attempts == 0 {
        validation.add_error("anchoring.max_attempts must be at least 1".into());
    }
    if anchoring.base_delay_ms > anchoring.max_delay_ms {
        validation.add_warning(format!(
            "anchoring.base_delay_ms ({}) exceeds max_delay_ms ({}) - every retry waits max_delay_ms",
            anchoring.base_delay_ms, anchoring.max_delay_ms
        ));
    }
    if anchoring.queue_capacity == 0 {
        validation.add_error("anchoring.queue_capacity must be at least 1".into());
    }
}

fn validate_integration(config: &NodeConfig, validation: &mut ConfigValidation) {
    let integration = &config.integration;
    if integration.request_ttl_hours <= 0 {
        validation.add_error("integration.request_ttl_hours must be positive".into());
    }
    if !(integration.max_distance_m > 0.0) {
        validation.add_error("integration.max_distance_m must be positive".into());
    }
    if integration.expiry_sweep_secs == 0 {
        validation.add_error("integration.expiry_sweep_secs must be positive".into());
    }
}

fn validate_api_keys(config: &NodeConfig, validation: &mut ConfigValidation) {
    let keys = &config.security.api_keys;
    if keys.is_empty() {
        validation.add_warning("API_KEYS not set - service will run without API authentication".into());
        return;
    }

    info!("API authentication enabled ({} key(s))", keys.len());

    for (i, key) in keys.iter().enumerate() {
        if key.len() < 32 {
            validation.add_warning(format!(
                "API key #{} is too short ({} chars) - recommend at least 32 characters",
                i + 1,
                key.len()
            ));
        }
        let lowered = key.to_lowercase();
        if lowered == "password" || lowered == "secret" || key == "12345" || lowered == "test" {
            validation.add_error(format!("API key #{} is a common/weak value", i + 1));
        }
    }
}
