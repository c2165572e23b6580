//! Local engine of the replicated key-value store
//!
//! One of these lives on every node; the manager layers placement and
//! replication on top. Entries carry a version counter for CAS and
//! replica reconciliation (highest version wins) and an optional absolute
//! expiry. Expired entries are dropped lazily on access and proactively
//! by the background sweeper.

use crate::cluster::types::{DistributedLock, StateEntry};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub struct LocalStore {
    entries: RwLock<HashMap<String, StateEntry>>,
}

/// Compare-and-swap failure: carries the version actually present
/// (None when the key is absent).
#[derive(Debug, Clone, PartialEq)]
pub struct CasMismatch {
    pub actual_version: Option<u64>,
}

fn expiry_for(ttl: Option<Duration>) -> Option<chrono::DateTime<Utc>> {
    ttl.map(|ttl| Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default())
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StateEntry> {
        // Lazy expiry on access.
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_expired() => true,
                Some(entry) => return Some(entry.clone()),
                None => return None,
            }
        };
        if expired {
            self.entries.write().await.remove(key);
        }
        None
    }

    /// Set a value, bumping the version. Returns the stored entry.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StateEntry {
        let mut entries = self.entries.write().await;
        let version = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.version + 1)
            .unwrap_or(1);
        let entry = StateEntry {
            value,
            version,
            expires_at: expiry_for(ttl),
        };
        entries.insert(key.to_string(), entry.clone());
        entry
    }

    /// Apply a replicated entry from another node: higher version wins,
    /// equal versions keep the resident value.
    pub async fn apply_replica(&self, key: &str, incoming: StateEntry) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(existing) if !existing.is_expired() && existing.version >= incoming.version => {
                false
            }
            _ => {
                entries.insert(key.to_string(), incoming);
                true
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn get_multiple(&self, keys: &[String]) -> HashMap<String, StateEntry> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(entry) = self.get(key).await {
                found.insert(key.clone(), entry);
            }
        }
        found
    }

    /// Atomic multi-key set: all keys land under one write lock.
    pub async fn set_multiple(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) {
        let expires_at = expiry_for(ttl);
        let mut entries = self.entries.write().await;
        for (key, value) in pairs {
            let version = entries
                .get(&key)
                .filter(|e| !e.is_expired())
                .map(|e| e.version + 1)
                .unwrap_or(1);
            entries.insert(
                key,
                StateEntry {
                    value,
                    version,
                    expires_at,
                },
            );
        }
    }

    /// Compare-and-swap on the version counter. `expected_version` 0 means
    /// "key must be absent".
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<StateEntry, CasMismatch> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).filter(|e| !e.is_expired());
        let actual = current.map(|e| e.version);

        if actual.unwrap_or(0) != expected_version {
            return Err(CasMismatch {
                actual_version: actual,
            });
        }

        let entry = StateEntry {
            value,
            version: expected_version + 1,
            expires_at: expiry_for(ttl),
        };
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    /// Atomic counter increment; a missing or expired key starts at zero.
    /// Counters are stored as little-endian i64.
    pub async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        let mut entries = self.entries.write().await;
        let (current, version) = match entries.get(key).filter(|e| !e.is_expired()) {
            Some(entry) => (decode_counter(&entry.value), entry.version + 1),
            None => (0, 1),
        };
        let next = current + delta;
        entries.insert(
            key.to_string(),
            StateEntry {
                value: next.to_le_bytes().to_vec(),
                version,
                expires_at: expiry_for(ttl),
            },
        );
        next
    }

    /// Keys matching a glob-lite pattern: `*` matches any run, only as a
    /// prefix/suffix wildcard (`rl:*`, `*:pending`, `session:*:state`).
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }

    /// Set-if-absent lock acquisition with a generated lock id.
    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Option<DistributedLock> {
        self.acquire_lock_with_id(resource, &Uuid::new_v4().to_string(), ttl)
            .await
    }

    /// Lock acquisition with a caller-supplied id (used by the wire path).
    pub async fn acquire_lock_with_id(
        &self,
        resource: &str,
        lock_id: &str,
        ttl: Duration,
    ) -> Option<DistributedLock> {
        let key = lock_key(resource);
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            if !existing.is_expired() {
                return None;
            }
        }
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default();
        entries.insert(
            key,
            StateEntry {
                value: lock_id.as_bytes().to_vec(),
                version: 1,
                expires_at: Some(expires_at),
            },
        );
        debug!("Lock acquired on {} ({})", resource, lock_id);
        Some(DistributedLock {
            resource: resource.to_string(),
            lock_id: lock_id.to_string(),
            expires_at,
        })
    }

    /// Release only if the lock id still matches.
    pub async fn release_lock(&self, resource: &str, lock_id: &str) -> bool {
        let key = lock_key(resource);
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some(entry) if entry.value == lock_id.as_bytes() => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Extend a held lock's TTL; fails for a lost or stolen lock.
    pub async fn extend_lock(
        &self,
        resource: &str,
        lock_id: &str,
        ttl: Duration,
    ) -> Option<DistributedLock> {
        let key = lock_key(resource);
        let mut entries = self.entries.write().await;
        match entries.get_mut(&key) {
            Some(entry) if !entry.is_expired() && entry.value == lock_id.as_bytes() => {
                let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default();
                entry.expires_at = Some(expires_at);
                entry.version += 1;
                Some(DistributedLock {
                    resource: resource.to_string(),
                    lock_id: lock_id.to_string(),
                    expires_at,
                })
            }
            _ => None,
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn size(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    /// Drop expired entries; called by the background sweeper.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_key(resource: &str) -> String {
    format!("lock:{}", resource)
}

fn decode_counter(value: &[u8]) -> i64 {
    match <[u8; 8]>::try_from(value) {
        Ok(bytes) => i64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), None) => key.ends_with(suffix),
        (None, Some(prefix)) => key.starts_with(prefix),
        (None, None) => {
            // One interior wildcard: prefix*suffix.
            if let Some((prefix, suffix)) = pattern.split_once('*') {
                key.starts_with(prefix)
                    && key.ends_with(suffix)
                    && key.len() >= prefix.len() + suffix.len()
            } else {
                key == pattern
            }
        }
        (Some(_), Some(infix)) => key.contains(infix.trim_start_matches('*')),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = LocalStore::new();
        let entry = store.set("k", b"v".to_vec(), None).await;
        assert_eq!(entry.version, 1);

        let got = store.get("k").await.unwrap();
        assert_eq!(got.value, b"v");

        assert!(store.delete("k").await);
        assert!(!store.exists("k").await);
    }

    #[tokio::test]
    async fn test_version_bumps_on_set() {
        let store = LocalStore::new();
        store.set("k", b"1".to_vec(), None).await;
        let entry = store.set("k", b"2".to_vec(), None).await;
        assert_eq!(entry.version, 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let store = LocalStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await;
        assert!(store.exists("k").await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired() {
        let store = LocalStore::new();
        store
            .set("a", b"v".to_vec(), Some(Duration::from_millis(5)))
            .await;
        store.set("b", b"v".to_vec(), None).await;

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.size().await, 1);
    }

    #[tokio::test]
    async fn test_cas_success_and_mismatch() {
        let store = LocalStore::new();
        let entry = store.set("k", b"1".to_vec(), None).await;

        let swapped = store
            .compare_and_swap("k", entry.version, b"2".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(swapped.version, 2);

        let err = store
            .compare_and_swap("k", entry.version, b"3".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err.actual_version, Some(2));
    }

    #[tokio::test]
    async fn test_cas_create_if_absent() {
        let store = LocalStore::new();
        assert!(store.compare_and_swap("k", 0, b"v".to_vec(), None).await.is_ok());
        assert!(store.compare_and_swap("k", 0, b"v".to_vec(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_increment() {
        let store = LocalStore::new();
        assert_eq!(store.increment("c", 1, None).await, 1);
        assert_eq!(store.increment("c", 1, None).await, 2);
        assert_eq!(store.increment("c", -3, None).await, -1);
    }

    #[tokio::test]
    async fn test_apply_replica_prefers_higher_version() {
        let store = LocalStore::new();
        store.set("k", b"local".to_vec(), None).await; // version 1

        let stale = StateEntry {
            value: b"stale".to_vec(),
            version: 1,
            expires_at: None,
        };
        assert!(!store.apply_replica("k", stale).await);

        let newer = StateEntry {
            value: b"newer".to_vec(),
            version: 5,
            expires_at: None,
        };
        assert!(store.apply_replica("k", newer).await);
        assert_eq!(store.get("k").await.unwrap().value, b"newer");
    }

    #[tokio::test]
    async fn test_key_patterns() {
        let store = LocalStore::new();
        store.set("rl:1.2.3.4", b"v".to_vec(), None).await;
        store.set("rl:5.6.7.8", b"v".to_vec(), None).await;
        store.set("session:n1:abc", b"v".to_vec(), None).await;

        let mut keys = store.keys("rl:*").await;
        keys.sort();
        assert_eq!(keys, vec!["rl:1.2.3.4", "rl:5.6.7.8"]);

        assert_eq!(store.keys("session:n1:*").await.len(), 1);
        assert_eq!(store.keys("*").await.len(), 3);
        assert_eq!(store.keys("rl:1.2.3.4").await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let store = LocalStore::new();
        let lock = store
            .acquire_lock("resource", Duration::from_secs(30))
            .await
            .unwrap();

        // Second acquisition fails while held.
        assert!(store.acquire_lock("resource", Duration::from_secs(30)).await.is_none());

        // Release with the wrong id is refused.
        assert!(!store.release_lock("resource", "wrong-id").await);
        assert!(store.release_lock("resource", &lock.lock_id).await);

        // Free again.
        assert!(store.acquire_lock("resource", Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn test_lock_expires_by_ttl() {
        let store = LocalStore::new();
        store
            .acquire_lock("resource", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.acquire_lock("resource", Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn test_lock_extend() {
        let store = LocalStore::new();
        let lock = store
            .acquire_lock("resource", Duration::from_millis(50))
            .await
            .unwrap();

        let extended = store
            .extend_lock("resource", &lock.lock_id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(extended.expires_at > lock.expires_at);

        assert!(store
            .extend_lock("resource", "wrong-id", Duration::from_secs(30))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_set_multiple_and_get_multiple() {
        let store = LocalStore::new();
        store
            .set_multiple(
                vec![
                    ("a".to_string(), b"1".to_vec()),
                    ("b".to_string(), b"2".to_vec()),
                ],
                None,
            )
            .await;

        let found = store
            .get_multiple(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await;
        assert_eq!(found.len(), 2);
        assert_eq!(found.get("a").unwrap().value, b"1");
    }

    #[tokio::test]
    async fn test_clear() {
        let store = LocalStore::new();
        store.set("a", b"1".to_vec(), None).await;
        store.clear().await;
        assert_eq!(store.size().await, 0);
    }
}
