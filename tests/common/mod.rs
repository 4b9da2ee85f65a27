// tests/common/mod.rs
// Shared node setup for the integration tests
#![allow(dead_code)]

use agri_anchor::anchor_service::{LedgerBackend, LedgerMode, LedgerReceipt};
use agri_anchor::config_manager::NodeConfig;
use agri_anchor::error::LedgerError;
use agri_anchor::land::{GeoPoint, LandParcel, NewParcel};
use agri_anchor::payload::LedgerPayload;
use agri_anchor::storage;
use agri_anchor::AgriNode;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Small delays so retry paths finish quickly.
pub fn fast_config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.storage.db_path = dir.path().join("db").to_string_lossy().into_owned();
    config.ledger.timeout_ms = 1_000;
    config.anchoring.workers = 2;
    config.anchoring.max_attempts = 3;
    config.anchoring.base_delay_ms = 10;
    config.anchoring.max_delay_ms = 40;
    config
}

/// Node on the local fallback ledger. Not started.
pub fn fallback_node() -> (TempDir, AgriNode) {
    let dir = tempfile::tempdir().unwrap();
    let node = AgriNode::open(fast_config(&dir)).unwrap();
    (dir, node)
}

/// Node wired to a test ledger strategy. Not started.
pub fn node_with(backend: Arc<dyn LedgerBackend>) -> (TempDir, AgriNode) {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(&dir);
    let db = storage::open_db(&config.storage.db_path).unwrap();
    (dir, AgriNode::with_ledger(config, db, backend))
}

pub async fn started(pair: (TempDir, AgriNode)) -> (TempDir, AgriNode) {
    let (dir, mut node) = pair;
    node.start().await.unwrap();
    (dir, node)
}

/// Register a parcel at (lat, lon) and mark it ready.
pub fn ready_parcel(node: &AgriNode, farmer: &str, lat: f64, lon: f64, acres: f64) -> LandParcel {
    let parcel = node
        .parcels
        .register(NewParcel {
            farmer_id: farmer.to_string(),
            owner_name: format!("{} name", farmer),
            boundary: Vec::new(),
            centroid: Some(GeoPoint::new(lat, lon)),
            area_acres: acres,
            survey: Default::default(),
        })
        .unwrap();
    node.parcels.set_ready(farmer, &parcel.id, true).unwrap()
}

/// Ledger strategy that fails the first `failures` calls with `error`, then commits.
pub struct ScriptedLedger {
    pub calls: AtomicU32,
    failures: u32,
    error: LedgerError,
}

impl ScriptedLedger {
    pub fn failing(failures: u32, error: LedgerError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            error,
        })
    }

    pub fn always(error: LedgerError) -> Arc<Self> {
        Self::failing(u32::MAX, error)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerBackend for ScriptedLedger {
    fn mode(&self) -> LedgerMode {
        LedgerMode::Live
    }

    async fn submit(
        &self,
        agreement_id: &str,
        payload: &LedgerPayload,
    ) -> Result<LedgerReceipt, LedgerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(self.error.clone());
        }
        Ok(LedgerReceipt {
            agreement_id: agreement_id.to_string(),
            mode: LedgerMode::Live,
            transaction_reference: format!("0xscripted{}", call),
            block_reference: Some("42".to_string()),
            payload_digest: payload.digest_hex().unwrap(),
            committed_at: Utc::now(),
        })
    }
}
