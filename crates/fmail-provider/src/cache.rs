//! Short-TTL cache for one-shot queries.

use forge_mail_core::filter::MessageFilter;
use forge_mail_core::schema::Message;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Distinct (target, filter) keys retained before eviction.
const CACHE_CAPACITY: usize = 64;

type CacheKey = (String, MessageFilter);

/// Per-process query cache keyed by `(target, filter)`.
///
/// UIs redraw several panels from the same query within a frame; a 500 ms
/// TTL collapses those scans without letting stale views linger. Never
/// shared across processes.
#[derive(Debug)]
pub(crate) struct QueryCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, Vec<Message>)>>,
}

impl QueryCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, target: &str, filter: &MessageFilter) -> Option<Vec<Message>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().expect("query cache lock poisoned");
        let (stored_at, messages) = entries.get(&(target.to_string(), filter.clone()))?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(messages.clone())
    }

    pub(crate) fn put(&self, target: &str, filter: &MessageFilter, messages: Vec<Message>) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().expect("query cache lock poisoned");
        if entries.len() >= CACHE_CAPACITY {
            // Evict expired entries first, then the oldest if still full.
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() <= ttl);
            if entries.len() >= CACHE_CAPACITY
                && let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, (at, _))| *at)
                    .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert((target.to_string(), filter.clone()), (Instant::now(), messages));
    }
}
