/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct Entry<V> {
    value: V,
    limit: usize,
    expires_at: Instant,
}

/// Per-owner read cache for computed feeds. An entry computed for `limit`
/// items can serve any request for at most that many; nothing is evicted
/// besides by TTL or explicit invalidation.
pub struct FeedCache<V: Clone> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> Default for FeedCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> FeedCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &str, limit: usize) -> Option<V> {
        self.get_at(owner, limit, Instant::now())
    }

    fn get_at(&self, owner: &str, limit: usize, now: Instant) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let e = entries.get(&owner.to_ascii_lowercase())?;
        if e.expires_at <= now || e.limit < limit {
            return None;
        }
        Some(e.value.clone())
    }

    /// Stores `value` unless a live entry computed for more items exists.
    pub fn set(&self, owner: &str, value: V, limit: usize, ttl: Duration) {
        self.set_at(owner, value, limit, ttl, Instant::now())
    }

    fn set_at(&self, owner: &str, value: V, limit: usize, ttl: Duration, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let key = owner.to_ascii_lowercase();
        if let Some(e) = entries.get(&key) {
            if e.expires_at > now && e.limit > limit {
                return;
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                limit,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, owner: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&owner.to_ascii_lowercase());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn serves_smaller_limits_only() {
        let cache = FeedCache::new();
        cache.set("Alice@Hub", vec![1, 2, 3], 20, TTL);
        assert_eq!(cache.get("alice@hub", 10), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("alice@hub", 20), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("alice@hub", 21), None);
        assert_eq!(cache.get("bob@hub", 1), None);
    }

    #[test]
    fn smaller_limit_never_overwrites_live_entry() {
        let cache = FeedCache::new();
        cache.set("a", "wide", 50, TTL);
        cache.set("a", "narrow", 10, TTL);
        assert_eq!(cache.get("a", 50), Some("wide"));
        cache.set("a", "wider", 80, TTL);
        assert_eq!(cache.get("a", 80), Some("wider"));
        cache.set("a", "same", 80, TTL);
        assert_eq!(cache.get("a", 80), Some("same"));
    }

    #[test]
    fn expired_entries_miss_and_can_be_replaced() {
        let cache = FeedCache::new();
        let t0 = Instant::now();
        cache.set_at("a", 1, 50, Duration::from_secs(5), t0);
        let later = t0 + Duration::from_secs(6);
        assert_eq!(cache.get_at("a", 1, later), None);
        cache.set_at("a", 2, 10, TTL, later);
        assert_eq!(cache.get_at("a", 10, later), Some(2));
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = FeedCache::new();
        cache.set("a", 1, 10, TTL);
        cache.invalidate("A");
        assert!(cache.get("a", 1).is_none());
        assert!(cache.is_empty());
    }
}
