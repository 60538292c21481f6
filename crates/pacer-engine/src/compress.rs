//! Tool-output compression with a fingerprint cache.
//!
//! Oversized tool results are condensed once and reused: identical output
//! from the same tool hashes to the same fingerprint, so repeated calls hit
//! the cache instead of the summarizer. The cache is capacity-bounded with
//! oldest-first eviction and shared across runs.

use crate::capability::CompressionCapability;
use ahash::AHashMap;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default capacity for the condensed-output cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 200;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub summarizer_calls: u64,
    pub truncation_fallbacks: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / self.lookups as f64
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct CacheInner {
    entries: AHashMap<u64, String>,
    order: VecDeque<u64>,
    stats: CacheStats,
}

/// Shared cache of condensed tool outputs keyed by content fingerprint.
/// Cloning is cheap and clones share the same underlying table.
#[derive(Clone)]
pub struct CompressionCache {
    capacity: usize,
    inner: Arc<RwLock<CacheInner>>,
}

impl Default for CompressionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl CompressionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(RwLock::new(CacheInner {
                entries: AHashMap::new(),
                order: VecDeque::new(),
                stats: CacheStats::default(),
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fingerprint of a tool output, keyed by tool name and exact content.
    pub fn fingerprint(tool_name: &str, raw_text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        tool_name.hash(&mut hasher);
        raw_text.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.read().await.stats
    }

    async fn lookup(&self, fingerprint: u64) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.stats.lookups += 1;
        match inner.entries.get(&fingerprint).cloned() {
            Some(condensed) => {
                inner.stats.hits += 1;
                Some(condensed)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    async fn store(&self, fingerprint: u64, condensed: String) {
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&fingerprint) {
            inner.entries.insert(fingerprint, condensed);
            return;
        }
        while inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
            } else {
                break;
            }
        }
        inner.entries.insert(fingerprint, condensed);
        inner.order.push_back(fingerprint);
    }

    /// Condense an oversized tool output.
    ///
    /// Cache hit returns the stored summary without touching the capability.
    /// On a miss the capability summarizes and the result is cached; when the
    /// capability is absent or fails, the output is truncated instead and the
    /// truncation is deliberately not cached so a later identical output can
    /// retry the summarizer.
    pub async fn condense(
        &self,
        tool_name: &str,
        raw_text: &str,
        max_chars: usize,
        capability: Option<&dyn CompressionCapability>,
    ) -> String {
        let fingerprint = Self::fingerprint(tool_name, raw_text);
        if let Some(condensed) = self.lookup(fingerprint).await {
            return condensed;
        }

        if let Some(capability) = capability {
            {
                let mut inner = self.inner.write().await;
                inner.stats.summarizer_calls += 1;
            }
            match capability.summarize(tool_name, raw_text, max_chars).await {
                Ok(condensed) => {
                    self.store(fingerprint, condensed.clone()).await;
                    return condensed;
                }
                Err(e) => {
                    tracing::warn!(
                        tool = tool_name,
                        error = %e,
                        "tool output summarization failed, falling back to truncation"
                    );
                }
            }
        }

        {
            let mut inner = self.inner.write().await;
            inner.stats.truncation_fallbacks += 1;
        }
        pacer_core::tokens::truncate_chars(raw_text, max_chars)
    }
}
