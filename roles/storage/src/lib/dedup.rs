//! Sorted set of recently credited share keys.
//!
//! An insert into this set is the single point at which a share becomes counted, so
//! `add_if_new` must be atomic with respect to concurrent callers.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Mutex};

use crate::error::StorageResult;

/// Default set name, one per pool instance.
pub const DEFAULT_DEDUP_KEY: &str = "share_buffer";

/// Builds the dedup member for a share: `"{blue_score}_{nonce}"`.
pub fn share_key(blue_score: u64, nonce: u64) -> String {
    format!("{}_{}", blue_score, nonce)
}

#[async_trait]
pub trait ShareDedupStore: Send + Sync {
    /// Insert `member` with `score` only if it is not present. Returns `true` when inserted.
    async fn add_if_new(&self, member: &str, score: u64) -> StorageResult<bool>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn range_by_score(&self, min: u64, max: u64) -> StorageResult<Vec<String>>;

    async fn count(&self) -> StorageResult<u64>;

    /// Remove members with `min <= score <= max`. Returns the number removed.
    async fn remove_by_score(&self, min: u64, max: u64) -> StorageResult<u64>;
}

/// In-process sorted set.
#[derive(Debug, Default)]
pub struct MemoryShareSet {
    members: Mutex<HashMap<String, u64>>,
}

impl MemoryShareSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ShareDedupStore for MemoryShareSet {
    async fn add_if_new(&self, member: &str, score: u64) -> StorageResult<bool> {
        let mut members = self.lock();
        if members.contains_key(member) {
            return Ok(false);
        }
        members.insert(member.to_string(), score);
        Ok(true)
    }

    async fn range_by_score(&self, min: u64, max: u64) -> StorageResult<Vec<String>> {
        let members = self.lock();
        let mut found: Vec<(&String, u64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(found.into_iter().map(|(member, _)| member.clone()).collect())
    }

    async fn count(&self) -> StorageResult<u64> {
        Ok(self.lock().len() as u64)
    }

    async fn remove_by_score(&self, min: u64, max: u64) -> StorageResult<u64> {
        let mut members = self.lock();
        let before = members.len();
        members.retain(|_, score| *score < min || *score > max);
        Ok((before - members.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_if_new_rejects_replay() {
        let set = MemoryShareSet::new();
        let key = share_key(1000, 0xdead);
        assert_eq!(key, "1000_57005");
        assert!(set.add_if_new(&key, 10).await.unwrap());
        assert!(!set.add_if_new(&key, 11).await.unwrap());
        assert_eq!(set.count().await.unwrap(), 1);
        // score is not bumped by the rejected insert
        assert_eq!(set.range_by_score(11, 11).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_single_winner() {
        let set = Arc::new(MemoryShareSet::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                set.add_if_new("42_7", 1).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_range_and_remove_by_score() {
        let set = MemoryShareSet::new();
        set.add_if_new("a", 5).await.unwrap();
        set.add_if_new("b", 10).await.unwrap();
        set.add_if_new("c", 15).await.unwrap();

        assert_eq!(set.range_by_score(5, 10).await.unwrap(), vec!["a", "b"]);
        assert_eq!(set.remove_by_score(0, 10).await.unwrap(), 2);
        assert_eq!(set.range_by_score(0, u64::MAX).await.unwrap(), vec!["c"]);
    }
}
