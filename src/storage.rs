// src/storage.rs
// RocksDB-backed record storage for parcels, requests, agreements and receipts

use crate::error::CoreError;
use once_cell::sync::Lazy;
use parking_lot::Mutex as SyncMutex;
use rocksdb::{Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

const KEY_LOCK_STRIPES: usize = 64;

/// Striped locks for read-modify-write sequences (counters, insert-if-absent).
/// Keys share a stripe by hash, so the set never grows with the key space.
static KEY_LOCKS: Lazy<Vec<SyncMutex<()>>> =
    Lazy::new(|| (0..KEY_LOCK_STRIPES).map(|_| SyncMutex::new(())).collect());

/// Type alias for RocksDB (Arc for cheap cloning)
pub type RocksDb = Arc<DB>;

pub const PARCEL_PREFIX: &str = "parcel:";
pub const REQUEST_PREFIX: &str = "integration_request:";
pub const AGREEMENT_PREFIX: &str = "agreement:";
pub const RECEIPT_PREFIX: &str = "receipt:";
pub const FALLBACK_LEDGER_PREFIX: &str = "fallback_ledger:";
pub const FALLBACK_LEDGER_SEQ: &str = "fallback_ledger_seq";
pub const DOCUMENT_PREFIX: &str = "document:";
pub const AGREEMENT_DOCUMENT_PREFIX: &str = "agreement_document:";

impl From<rocksdb::Error> for CoreError {
    fn from(e: rocksdb::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Storage(format!("corrupt record: {}", e))
    }
}

/// Open RocksDB, retrying with doubling backoff while another process holds the lock.
pub fn open_db(path: impl AsRef<Path>) -> Result<RocksDb, String> {
    let path = path.as_ref();
    let mut attempt = 0u32;
    let max_attempts = 8u32;
    let mut wait = 250u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(format!(
                        "Failed to open RocksDB at '{}' after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    ));
                }
                log::warn!(
                    "open_db attempt {}/{} failed: {} - retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &Path) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(num_cpus::get().max(1) as i32);
    opts.set_max_background_jobs(2);
    opts.set_max_open_files(256);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    DB::open(&opts, path)
}

/// Put a serializable value under a string key.
pub fn put<V: Serialize>(db: &RocksDb, key: &str, val: &V) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec(val)?;
    db.put(key.as_bytes(), bytes)?;
    Ok(())
}

/// Get and deserialize a value stored under a string key.
pub fn get<T: DeserializeOwned>(db: &RocksDb, key: &str) -> Result<Option<T>, CoreError> {
    match db.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice::<T>(&bytes)?)),
        None => Ok(None),
    }
}

/// Store `val` only if nothing is stored under `key` yet.
/// Returns whichever value ends up stored, plus whether this call wrote it.
pub fn put_if_absent<V>(db: &RocksDb, key: &str, val: &V) -> Result<(V, bool), CoreError>
where
    V: Serialize + DeserializeOwned + Clone,
{
    let lock = key_lock(key);
    let _guard = lock.lock();

    if let Some(existing) = get::<V>(db, key)? {
        return Ok((existing, false));
    }
    put(db, key, val)?;
    Ok((val.clone(), true))
}

/// Apply multiple (key, value) entries atomically.
pub fn batch_put<V: Serialize>(db: &RocksDb, entries: &[(String, V)]) -> Result<(), CoreError> {
    let mut batch = WriteBatch::default();
    for (k, v) in entries {
        batch.put(k.as_bytes(), serde_json::to_vec(v)?);
    }
    db.write(batch)?;
    Ok(())
}

/// Iterate values whose keys start with the given prefix.
pub fn iter_prefix<T: DeserializeOwned>(db: &RocksDb, prefix: &str) -> Result<Vec<T>, CoreError> {
    let prefix_bytes = prefix.as_bytes();
    let mut out = Vec::new();

    for item in db.prefix_iterator(prefix_bytes) {
        let (k, v) = item?;
        if !k.starts_with(prefix_bytes) {
            break;
        }
        out.push(serde_json::from_slice::<T>(&v)?);
    }
    Ok(out)
}

/// Get a u64 counter (missing counters read as zero).
pub fn get_counter(db: &RocksDb, key: &str) -> Result<u64, CoreError> {
    match db.get(key.as_bytes())? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::Storage(format!("invalid counter bytes at {}", key)))?;
            Ok(u64::from_le_bytes(arr))
        }
        None => Ok(0),
    }
}

/// Increment a counter under its key lock and return the new value.
pub fn increment_counter(db: &RocksDb, key: &str, amount: u64) -> Result<u64, CoreError> {
    let lock = key_lock(key);
    let _guard = lock.lock();

    let next = get_counter(db, key)?.saturating_add(amount);
    db.put(key.as_bytes(), next.to_le_bytes())?;
    Ok(next)
}

fn key_stripe(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % KEY_LOCK_STRIPES as u64) as usize
}

fn key_lock(key: &str) -> &'static SyncMutex<()> {
    &KEY_LOCKS[key_stripe(key)]
}
