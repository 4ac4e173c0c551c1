//! Response cache for LLM requests.
//!
//! Identical requests — same model, same serialized messages, same tool
//! schema — are served from cache without touching the transport. Hits are
//! flagged on the response so the engine can emit `llm_call(cached=true)`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// In-memory response store keyed by a request content hash.
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, ChatResponse>>,
    stats: RwLock<CacheStats>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 over (model, serialized messages, serialized tools).
    pub fn request_key(request: &ChatRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update(serde_json::to_vec(&request.messages).unwrap_or_default());
        hasher.update(serde_json::to_vec(&request.tools).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    pub fn lookup(&self, key: &str) -> Option<ChatResponse> {
        let found = self
            .entries
            .read()
            .expect("cache lock poisoned")
            .get(key)
            .cloned();
        let mut stats = self.stats.write().expect("stats lock poisoned");
        match found {
            Some(response) => {
                stats.hits += 1;
                Some(response)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn store(&self, key: String, response: ChatResponse) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, response);
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read().expect("stats lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// LLM client wrapper that short-circuits identical requests.
pub struct CachedLlmClient {
    inner: Arc<dyn LlmClient>,
    cache: ResponseCache,
}

impl CachedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            cache: ResponseCache::new(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[async_trait]
impl LlmClient for CachedLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let key = ResponseCache::request_key(&request);
        if let Some(mut hit) = self.cache.lookup(&key) {
            debug!(key = %&key[..12], "llm cache hit");
            hit.cached = true;
            return Ok(hit);
        }

        let response = self.inner.chat(request).await?;
        self.cache.store(key, response.clone());
        Ok(response)
    }
}
