//! Cross-frame deduplication of detections by embedding distance.

use crate::cache::DEFAULT_MATCH_THRESHOLD;
use crate::types::Embedding;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;
/// A face the cache would match must never count as novel, so the two
/// thresholds share a default.
pub const DEFAULT_NOVELTY_THRESHOLD: f32 = DEFAULT_MATCH_THRESHOLD;

/// Bounded FIFO of embeddings seen over the last few ticks.
#[derive(Debug, Clone)]
pub struct RecentEmbeddingHistory {
    entries: VecDeque<Embedding>,
    capacity: usize,
}

impl RecentEmbeddingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Smallest distance from `probe` to any remembered embedding.
    pub fn min_distance(&self, probe: &Embedding) -> Option<f32> {
        self.entries
            .iter()
            .map(|e| probe.distance(e))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn push(&mut self, embedding: Embedding) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(embedding);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Decides whether a detection is a face not already being tracked.
#[derive(Debug, Clone)]
pub struct NoveltyFilter {
    history: RecentEmbeddingHistory,
    threshold: f32,
}

impl NoveltyFilter {
    pub fn new(capacity: usize, threshold: f32) -> Self {
        Self {
            history: RecentEmbeddingHistory::new(capacity),
            threshold,
        }
    }

    /// Returns `true` and remembers the embedding when nothing in the history
    /// lies within the threshold. Returns `false` otherwise and leaves the
    /// history untouched.
    pub fn observe(&mut self, embedding: &Embedding) -> bool {
        if let Some(nearest) = self.history.min_distance(embedding) {
            if nearest < self.threshold {
                tracing::trace!(distance = nearest, "face already tracked");
                return false;
            }
        }
        self.history.push(embedding.clone());
        true
    }

    pub fn history(&self) -> &RecentEmbeddingHistory {
        &self.history
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for NoveltyFilter {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_NOVELTY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_first_face_is_novel() {
        let mut filter = NoveltyFilter::new(10, 0.6);
        assert!(filter.observe(&emb(&[0.0, 0.0])));
        assert_eq!(filter.history().len(), 1);
    }

    #[test]
    fn test_near_duplicate_suppressed() {
        let mut filter = NoveltyFilter::new(10, 0.6);
        assert!(filter.observe(&emb(&[0.0, 0.0])));
        // distance 0.1
        assert!(!filter.observe(&emb(&[0.1, 0.0])));
        assert_eq!(filter.history().len(), 1);
    }

    #[test]
    fn test_distance_at_threshold_is_novel() {
        let mut filter = NoveltyFilter::new(10, 0.5);
        assert!(filter.observe(&emb(&[0.0])));
        assert!(filter.observe(&emb(&[0.5])));
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut filter = NoveltyFilter::new(2, 0.5);
        assert!(filter.observe(&emb(&[0.0])));
        assert!(filter.observe(&emb(&[10.0])));
        assert!(filter.observe(&emb(&[20.0])));
        assert_eq!(filter.history().len(), 2);
        // [0.0] aged out, so a repeat of it is novel again
        assert!(filter.observe(&emb(&[0.05])));
        // [20.0] still remembered
        assert!(!filter.observe(&emb(&[20.1])));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let history = RecentEmbeddingHistory::new(0);
        assert_eq!(history.capacity(), 1);
    }

    #[test]
    fn test_min_distance_empty() {
        let history = RecentEmbeddingHistory::new(4);
        assert!(history.min_distance(&emb(&[1.0])).is_none());
        assert!(history.is_empty());
    }

    #[test]
    fn test_default_threshold_covers_cache_match_distance() {
        let mut filter = NoveltyFilter::default();
        assert_eq!(filter.threshold(), DEFAULT_MATCH_THRESHOLD);
        assert!(filter.observe(&emb(&[0.0, 0.0])));
        assert!(!filter.observe(&emb(&[0.55, 0.0])));
    }
}
