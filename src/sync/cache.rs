use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::store::LocalStore;
use crate::sync::key::RequestKey;
use crate::types::now_unix_ms;

pub const DURABLE_KEY_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEnvelope {
    value: serde_json::Value,
    stored_at_ms: i64,
    ttl_ms: i64,
}

impl CacheEnvelope {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms - self.stored_at_ms < self.ttl_ms
    }
}

/// Memory-first cache with a durable second tier. Reads check TTL, expire
/// lazily, and promote durable hits into memory. Writes land in both tiers;
/// a full durable tier degrades the cache to memory-only instead of failing
/// the caller.
pub struct TieredCache {
    memory: Mutex<HashMap<String, CacheEnvelope>>,
    durable: Arc<dyn LocalStore>,
    memory_cap: usize,
    quota_warned: AtomicBool,
}

impl TieredCache {
    pub fn new(durable: Arc<dyn LocalStore>, memory_cap: usize) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            durable,
            memory_cap: memory_cap.max(1),
            quota_warned: AtomicBool::new(false),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &RequestKey) -> Option<T> {
        let now_ms = now_unix_ms();

        let memory_hit = {
            let mut memory = self.memory.lock();
            match memory.get(key.as_str()) {
                Some(envelope) if envelope.is_fresh(now_ms) => Some(envelope.value.clone()),
                Some(_) => {
                    memory.remove(key.as_str());
                    None
                }
                None => None,
            }
        };
        if let Some(value) = memory_hit {
            return decode_envelope_value(key, value);
        }

        let stored = match self.durable.get(&durable_key(key)).await {
            Ok(stored) => stored,
            Err(error) => {
                debug!(key = %key, error = %error, "durable cache read failed");
                return None;
            }
        };
        let text = stored?;
        let envelope: CacheEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(key = %key, error = %error, "dropping undecodable cache entry");
                let _ = self.durable.remove(&durable_key(key)).await;
                return None;
            }
        };
        if !envelope.is_fresh(now_ms) {
            let _ = self.durable.remove(&durable_key(key)).await;
            return None;
        }

        let value = envelope.value.clone();
        self.insert_bounded(key.as_str().to_string(), envelope);
        decode_envelope_value(key, value)
    }

    pub async fn set<T: Serialize>(&self, key: &RequestKey, value: &T, ttl_ms: i64) {
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(key = %key, error = %error, "cache value failed to encode");
                return;
            }
        };
        let envelope = CacheEnvelope {
            value: encoded,
            stored_at_ms: now_unix_ms(),
            ttl_ms,
        };

        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(error) => {
                warn!(key = %key, error = %error, "cache envelope failed to encode");
                return;
            }
        };
        self.insert_bounded(key.as_str().to_string(), envelope);

        match self.durable.set(&durable_key(key), &text).await {
            Ok(()) => {}
            Err(FeedError::QuotaExceeded) => {
                if !self.quota_warned.swap(true, Ordering::SeqCst) {
                    warn!("durable cache quota exceeded; caching stays memory-only this session");
                }
            }
            Err(error) => {
                warn!(key = %key, error = %error, "durable cache write failed");
            }
        }
    }

    /// Removes every entry whose key satisfies the predicate, in both tiers.
    pub async fn invalidate<F: Fn(&str) -> bool>(&self, predicate: F) -> usize {
        let mut removed = {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|key, _| !predicate(key));
            before - memory.len()
        };

        if let Ok(keys) = self.durable.list_keys(DURABLE_KEY_PREFIX).await {
            for stored_key in keys {
                let bare = stored_key
                    .strip_prefix(DURABLE_KEY_PREFIX)
                    .unwrap_or(&stored_key);
                if predicate(bare) {
                    if let Ok(true) = self.durable.remove(&stored_key).await {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    /// Sweeps expired entries out of both tiers. Corrupt durable entries are
    /// removed along the way.
    pub async fn prune_expired(&self) -> usize {
        let now_ms = now_unix_ms();
        let mut removed = {
            let mut memory = self.memory.lock();
            let before = memory.len();
            memory.retain(|_, envelope| envelope.is_fresh(now_ms));
            before - memory.len()
        };

        if let Ok(keys) = self.durable.list_keys(DURABLE_KEY_PREFIX).await {
            for stored_key in keys {
                let stale = match self.durable.get(&stored_key).await {
                    Ok(Some(text)) => serde_json::from_str::<CacheEnvelope>(&text)
                        .map(|envelope| !envelope.is_fresh(now_ms))
                        .unwrap_or(true),
                    Ok(None) => false,
                    Err(_) => false,
                };
                if stale {
                    if let Ok(true) = self.durable.remove(&stored_key).await {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }

    pub async fn durable_len(&self) -> usize {
        self.durable
            .list_keys(DURABLE_KEY_PREFIX)
            .await
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    fn insert_bounded(&self, key: String, envelope: CacheEnvelope) {
        let mut memory = self.memory.lock();
        memory.insert(key, envelope);
        while memory.len() > self.memory_cap {
            let oldest = memory
                .iter()
                .min_by_key(|(_, envelope)| envelope.stored_at_ms)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    memory.remove(&key);
                    debug!(key = %key, "evicted oldest entry over memory cap");
                }
                None => break,
            }
        }
    }
}

fn durable_key(key: &RequestKey) -> String {
    format!("{DURABLE_KEY_PREFIX}{}", key.as_str())
}

fn decode_envelope_value<T: DeserializeOwned>(key: &RequestKey, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            debug!(key = %key, error = %error, "cached value no longer decodes; treating as miss");
            None
        }
    }
}
