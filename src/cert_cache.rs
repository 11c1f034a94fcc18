use crate::{
    Error,
    certificate_authority::{CACHE_TTL, CertificateAuthority, LEAF_TTL, LeafCertificate, ONE_DAY},
};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError, RwLock},
    time::{Duration, Instant, SystemTime},
};
use tracing::debug;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    // `None` when `now + ttl` is not representable.
    expires_at: Option<Instant>,
}

/// String-keyed map whose entries expire after a per-entry TTL.
///
/// Expired entries are reported as misses but never removed; the map only grows.
#[derive(Debug)]
pub struct ExpiringCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the value stored under `key` if it has not expired yet.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Like [`ExpiringCache::get`], evaluated at `now`.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        entries
            .get(key)
            .filter(|entry| entry.expires_at.is_none_or(|expires_at| expires_at > now))
            .map(|entry| entry.value.clone())
    }

    /// Stores `value` under `key`, replacing any previous entry, until `ttl` from now.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    /// Like [`ExpiringCache::set`], with the TTL counted from `now`.
    pub fn set_at(&self, key: impl Into<String>, value: V, ttl: Duration, now: Instant) {
        let entry = Entry {
            value,
            expires_at: now.checked_add(ttl),
        };

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leaf certificates keyed by bare hostname, minted on demand by a [`CertificateAuthority`].
///
/// Concurrent misses are collapsed: at most one leaf is minted per hostname per TTL window, and
/// every caller racing on that miss receives the same certificate.
pub struct LeafCertificateCache<CA> {
    ca: CA,
    entries: ExpiringCache<LeafCertificate>,
    mint_lock: Mutex<()>,
}

impl<CA: CertificateAuthority> LeafCertificateCache<CA> {
    pub fn new(ca: CA) -> Self {
        Self {
            ca,
            entries: ExpiringCache::new(),
            mint_lock: Mutex::new(()),
        }
    }

    pub fn ca(&self) -> &CA {
        &self.ca
    }

    /// Returns a usable leaf for `host`, minting and storing one on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the authority's issuance error. Nothing is cached on failure.
    pub fn get_or_mint(&self, host: &str) -> Result<LeafCertificate, Error> {
        if let Some(leaf) = self.entries.get(host) {
            return Ok(leaf);
        }

        let _guard = self.mint_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(leaf) = self.entries.get(host) {
            return Ok(leaf);
        }

        let now = SystemTime::now();
        let leaf = self.ca.issue_leaf(host, now + LEAF_TTL)?;
        let ttl = cache_ttl(&leaf, now);
        debug!("Caching certificate for {} for {:?}", host, ttl);

        self.entries.set(host, leaf.clone(), ttl);
        Ok(leaf)
    }

    /// Number of hostnames ever cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_ttl(leaf: &LeafCertificate, now: SystemTime) -> Duration {
    leaf.not_after()
        .duration_since(now)
        .ok()
        .and_then(|remaining| remaining.checked_sub(ONE_DAY))
        .map_or(Duration::ZERO, |ttl| ttl.min(CACHE_TTL))
}
