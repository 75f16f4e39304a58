use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::evidence::CallKey;

#[derive(Debug, Clone)]
struct CachedPayload {
    payload: Value,
    source_label: String,
    stored_at: Instant,
}

/// Cross-request cache of successful tool payloads keyed by call identity.
///
/// Lives at the tool boundary only; orchestration never sees whether a result
/// came from the cache.
#[derive(Debug, Clone)]
pub struct ResultCache {
    entries: Arc<DashMap<CallKey, CachedPayload>>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            capacity,
        }
    }

    pub fn get(&self, key: &CallKey) -> Option<(Value, String)> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some((entry.payload.clone(), entry.source_label.clone()))
    }

    pub fn insert(&self, key: CallKey, payload: Value, source_label: String) {
        if self.entries.len() >= self.capacity {
            self.evict_expired();
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.stored_at)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CachedPayload {
                payload,
                source_label,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::ToolCall;
    use crate::tools::ToolKind;
    use serde_json::json;

    fn key(name: &str) -> CallKey {
        ToolCall::new(ToolKind::CompanyInfo, json!({"company_name": name})).key()
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = ResultCache::new(Duration::from_millis(0), 8);
        cache.insert(key("Acme"), json!({"a": 1}), "linkedin.com".into());
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&key("Acme")).is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert(key("A"), json!(1), "x".into());
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key("B"), json!(2), "x".into());
        cache.insert(key("C"), json!(3), "x".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("A")).is_none());
        assert!(cache.get(&key("C")).is_some());
    }
}
