// src/documents.rs
// Document storage seam. The anchoring path only ever sees the returned content id.

use crate::error::{CoreError, Result};
use crate::storage::{self, RocksDb, DOCUMENT_PREFIX};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Serialize};

/// Multicodec for raw bytes.
const RAW_CODEC: u64 = 0x55;

pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DocumentMetadata {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub agreement_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredDocument {
    pub cid: String,
    pub size: usize,
    pub metadata: DocumentMetadata,
    pub stored_at: DateTime<Utc>,
    content_hex: String,
}

impl StoredDocument {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.content_hex)
            .map_err(|e| CoreError::Storage(format!("corrupt document {}: {}", self.cid, e)))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store `bytes` and return their content identifier.
    async fn upload(&self, bytes: Vec<u8>, metadata: DocumentMetadata) -> Result<String>;

    async fn exists(&self, cid: &str) -> Result<bool>;
}

/// CIDv1, raw codec, sha2-256.
pub fn content_id(data: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(data);
    Cid::new_v1(RAW_CODEC, hash).to_string()
}

/// Content-addressed store kept in the node's RocksDB.
pub struct LocalDocumentStore {
    db: RocksDb,
}

impl LocalDocumentStore {
    pub fn new(db: RocksDb) -> Self {
        Self { db }
    }

    pub fn get(&self, cid: &str) -> Result<Option<StoredDocument>> {
        storage::get(&self.db, &document_key(cid))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn upload(&self, bytes: Vec<u8>, metadata: DocumentMetadata) -> Result<String> {
        if bytes.is_empty() {
            return Err(CoreError::InvalidInput("document is empty".into()));
        }
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(CoreError::InvalidInput(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                MAX_DOCUMENT_BYTES
            )));
        }

        let cid = content_id(&bytes);
        let doc = StoredDocument {
            cid: cid.clone(),
            size: bytes.len(),
            metadata,
            stored_at: Utc::now(),
            content_hex: hex::encode(&bytes),
        };
        let (_, wrote) = storage::put_if_absent(&self.db, &document_key(&cid), &doc)?;
        if wrote {
            log::info!("Stored document {} ({} bytes)", cid, doc.size);
        }
        Ok(cid)
    }

    async fn exists(&self, cid: &str) -> Result<bool> {
        Ok(self.get(cid)?.is_some())
    }
}

fn document_key(cid: &str) -> String {
    format!("{}{}", DOCUMENT_PREFIX, cid)
}
