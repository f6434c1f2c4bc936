//! Two-tier identity cache with nearest-neighbour lookup.
//!
//! The durable tier mirrors a [`DurableStore`] and survives restarts. The
//! session tier lives for the process. It is seeded lazily from durable hits
//! and also holds entries whose durable write failed.
//! Lookups scan each tier linearly for the closest stored embedding within
//! the match threshold.

use crate::store::{CacheEntry, DurableStore, StoreError};
use crate::types::Embedding;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Durable,
    Session,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub label: String,
    pub tier: CacheTier,
    pub distance: f32,
}

pub struct IdentityCache {
    store: Box<dyn DurableStore>,
    durable: Vec<CacheEntry>,
    session: Vec<CacheEntry>,
    threshold: f32,
}

impl IdentityCache {
    /// Load the durable tier from `store`.
    pub fn open(store: Box<dyn DurableStore>, threshold: f32) -> Result<Self, StoreError> {
        let durable = store.load_all()?;
        tracing::info!(entries = durable.len(), threshold, "identity cache loaded");
        Ok(Self {
            store,
            durable,
            session: Vec::new(),
            threshold,
        })
    }

    /// Find the closest known identity within the threshold.
    ///
    /// The durable tier is consulted first; a durable hit is copied into the
    /// session tier.
    pub fn lookup(&mut self, embedding: &Embedding) -> Option<CacheHit> {
        if let Some((idx, distance)) = nearest(&self.durable, embedding, self.threshold) {
            let entry = &self.durable[idx];
            if !self.session.iter().any(|e| e.key == entry.key) {
                self.session.push(entry.clone());
            }
            return Some(CacheHit {
                label: entry.label.clone(),
                tier: CacheTier::Durable,
                distance,
            });
        }

        nearest(&self.session, embedding, self.threshold).map(|(idx, distance)| CacheHit {
            label: self.session[idx].label.clone(),
            tier: CacheTier::Session,
            distance,
        })
    }

    /// Record a resolved label.
    ///
    /// The entry joins the durable tier only once the store accepts it. A
    /// failed durable write is logged and the entry lives in the session tier
    /// for the rest of this process.
    pub fn insert(&mut self, embedding: Embedding, label: &str) -> CacheEntry {
        let entry = CacheEntry::new(embedding, label);

        match self.store.upsert(&entry) {
            Ok(()) => upsert(&mut self.durable, &entry),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "durable cache write failed"),
        }
        upsert(&mut self.session, &entry);

        tracing::debug!(key = %entry.key, label, "identity cached");
        entry
    }

    pub fn durable_len(&self) -> usize {
        self.durable.len()
    }

    pub fn session_len(&self) -> usize {
        self.session.len()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

fn nearest(entries: &[CacheEntry], probe: &Embedding, threshold: f32) -> Option<(usize, f32)> {
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| (i, probe.distance(&e.embedding)))
        .filter(|(_, d)| *d < threshold)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn upsert(entries: &mut Vec<CacheEntry>, entry: &CacheEntry) {
    match entries.iter_mut().find(|e| e.key == entry.key) {
        Some(existing) => existing.label = entry.label.clone(),
        None => entries.push(entry.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FailingStore;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_empty_cache_misses() {
        let mut cache = IdentityCache::open(Box::new(MemoryStore::default()), 0.6).unwrap();
        assert!(cache.lookup(&emb(&[0.0, 0.0])).is_none());
    }

    #[test]
    fn test_insert_then_nearby_lookup_hits() {
        let mut cache = IdentityCache::open(Box::new(MemoryStore::default()), 0.6).unwrap();
        cache.insert(emb(&[0.0, 0.0]), "Jane Doe");

        let hit = cache.lookup(&emb(&[0.3, 0.0])).expect("within threshold");
        assert_eq!(hit.label, "Jane Doe");
        assert!((hit.distance - 0.3).abs() < 1e-6);

        assert!(cache.lookup(&emb(&[0.7, 0.0])).is_none());
    }

    #[test]
    fn test_insert_writes_both_tiers_and_store() {
        let store = MemoryStore::default();
        let mut cache = IdentityCache::open(Box::new(store.clone()), 0.6).unwrap();
        cache.insert(emb(&[1.0]), "Unrecognized");
        assert_eq!(cache.durable_len(), 1);
        assert_eq!(cache.session_len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_durable_hit_seeds_session_once() {
        let store = MemoryStore::with_entries(vec![CacheEntry::new(emb(&[0.0, 1.0]), "John Roe")]);
        let mut cache = IdentityCache::open(Box::new(store), 0.6).unwrap();
        assert_eq!(cache.session_len(), 0);

        let hit = cache.lookup(&emb(&[0.0, 1.1])).unwrap();
        assert_eq!(hit.tier, CacheTier::Durable);
        assert_eq!(cache.session_len(), 1);

        cache.lookup(&emb(&[0.0, 0.9])).unwrap();
        assert_eq!(cache.session_len(), 1);
    }

    #[test]
    fn test_lookup_picks_closest() {
        let store = MemoryStore::with_entries(vec![
            CacheEntry::new(emb(&[0.0]), "far"),
            CacheEntry::new(emb(&[0.5]), "near"),
        ]);
        let mut cache = IdentityCache::open(Box::new(store), 0.6).unwrap();
        assert_eq!(cache.lookup(&emb(&[0.45])).unwrap().label, "near");
    }

    #[test]
    fn test_store_failure_keeps_session_entry() {
        let mut cache = IdentityCache::open(Box::new(FailingStore), 0.6).unwrap();
        cache.insert(emb(&[2.0]), "Jane Doe");
        assert_eq!(cache.durable_len(), 0);
        assert_eq!(cache.session_len(), 1);

        let hit = cache.lookup(&emb(&[2.0])).unwrap();
        assert_eq!(hit.label, "Jane Doe");
        assert_eq!(hit.tier, CacheTier::Session);
    }
}
