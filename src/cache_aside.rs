//! # Cache-Aside Retrieval
//!
//! One helper shared by every cached entity kind (listings, offers, collections,
//! releases, NFTs). The helper owns the freshness decision; each entity only has
//! to say what its key is and which of its fields may change on refresh.
//!
//! ## Rules
//!
//! - Missing record: fetch once; `Ok(None)` caches nothing.
//! - Stale record (older than the TTL) or `force`: fetch once and merge in place.
//!   A refetch that comes back empty or fails leaves the cached record untouched.
//! - Records are never evicted.
//! - The fetch runs between [`CachePolicy::lookup`] and [`CachePolicy::merge`],
//!   outside any lock on the records.

use crate::error::SourceError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// A record that can live in a cache-aside list.
pub trait Cached {
    type Key: PartialEq + Clone + fmt::Debug;

    fn key(&self) -> Self::Key;

    fn last_retrieved(&self) -> DateTime<Utc>;

    fn touch(&mut self, at: DateTime<Utc>);

    /// Overwrite the mutable fields with the ones from `fresh`. Identity fields stay.
    fn update_from(&mut self, fresh: Self);
}

/// What happened during a retrieval.
#[derive(Debug)]
pub enum Outcome {
    /// Served from cache, no authoritative call.
    Hit,
    /// Not cached before; fetched and inserted.
    Inserted,
    /// Cached record was re-fetched and merged.
    Refreshed,
    /// Source has no such entity and nothing was cached.
    Missing,
    /// Re-fetch returned nothing; the cached record was kept as-is.
    Kept,
    /// Source failed. The cached record (if any) was kept.
    Failed(SourceError),
}

impl Outcome {
    /// Whether this retrieval issued an authoritative call.
    pub fn fetched(&self) -> bool {
        !matches!(self, Outcome::Hit)
    }
}

pub struct Retrieved<'a, T> {
    pub record: Option<&'a mut T>,
    pub outcome: Outcome,
}

/// Result of the read-only half of a retrieval.
#[derive(Debug)]
pub enum Lookup<T> {
    /// Cached and fresh; no authoritative call needed.
    Hit(T),
    /// Missing, stale or forced; the caller fetches and then merges.
    Fetch,
}

/// Freshness policy for one cache.
///
/// A retrieval is split in two so the caller never holds its lock across the
/// authoritative call: [`lookup`](Self::lookup) under a read lock, the fetch
/// with no lock held, then [`merge`](Self::merge) under a write lock.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    ttl: Duration,
}

impl CachePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn is_fresh<T: Cached>(&self, record: &T, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(record.last_retrieved());
        match age.to_std() {
            Ok(age) => age <= self.ttl,
            // last_retrieved in the future (clock skew): treat as fresh
            Err(_) => true,
        }
    }

    pub fn lookup<T: Cached + Clone>(&self, records: &[T], key: &T::Key, force: bool) -> Lookup<T> {
        if force {
            return Lookup::Fetch;
        }
        match records.iter().find(|r| r.key() == *key) {
            Some(record) if self.is_fresh(record, Utc::now()) => Lookup::Hit(record.clone()),
            _ => Lookup::Fetch,
        }
    }

    /// Fold the result of one authoritative call into `records`.
    ///
    /// The key is located again here, so a record inserted by a concurrent
    /// retrieval while the fetch was in flight is merged rather than duplicated.
    pub fn merge<'a, T: Cached>(
        &self,
        records: &'a mut Vec<T>,
        key: &T::Key,
        fetched: Result<Option<T>, SourceError>,
    ) -> Retrieved<'a, T> {
        let Some(idx) = records.iter().position(|r| r.key() == *key) else {
            return match fetched {
                Ok(Some(mut fresh)) => {
                    fresh.touch(Utc::now());
                    records.push(fresh);
                    Retrieved { record: records.last_mut(), outcome: Outcome::Inserted }
                }
                Ok(None) => Retrieved { record: None, outcome: Outcome::Missing },
                Err(e) => Retrieved { record: None, outcome: Outcome::Failed(e) },
            };
        };

        let outcome = match fetched {
            Ok(Some(fresh)) => {
                let record = &mut records[idx];
                record.update_from(fresh);
                record.touch(Utc::now());
                Outcome::Refreshed
            }
            Ok(None) => Outcome::Kept,
            Err(e) => Outcome::Failed(e),
        };
        Retrieved { record: Some(&mut records[idx]), outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        id: u64,
        value: u64,
        label: &'static str,
        at: DateTime<Utc>,
    }

    impl Cached for Entry {
        type Key = u64;
        fn key(&self) -> u64 {
            self.id
        }
        fn last_retrieved(&self) -> DateTime<Utc> {
            self.at
        }
        fn touch(&mut self, at: DateTime<Utc>) {
            self.at = at;
        }
        fn update_from(&mut self, fresh: Self) {
            self.value = fresh.value;
        }
    }

    fn entry(id: u64, value: u64) -> Entry {
        Entry { id, value, label: "fetched", at: DateTime::<Utc>::MIN_UTC }
    }

    fn fresh(id: u64, value: u64) -> Entry {
        Entry { at: Utc::now(), ..entry(id, value) }
    }

    #[test]
    fn test_insert_then_hit_within_ttl() {
        let policy = CachePolicy::new(Duration::from_secs(300));
        let mut records = Vec::new();

        assert!(matches!(policy.lookup(&records, &7, false), Lookup::Fetch));
        let r = policy.merge(&mut records, &7, Ok(Some(entry(7, 1))));
        assert!(matches!(r.outcome, Outcome::Inserted));
        let first = r.record.cloned();

        match policy.lookup(&records, &7, false) {
            Lookup::Hit(hit) => assert_eq!(Some(hit), first),
            Lookup::Fetch => panic!("fresh record should be a hit"),
        }
    }

    #[test]
    fn test_stale_record_needs_fetch() {
        let policy = CachePolicy::new(Duration::from_secs(60));
        let mut stale = entry(1, 10);
        stale.at = Utc::now() - chrono::Duration::seconds(120);
        let before = stale.at;
        let mut records = vec![stale];

        assert!(matches!(policy.lookup(&records, &1, false), Lookup::Fetch));
        let r = policy.merge(&mut records, &1, Ok(Some(entry(1, 11))));
        assert!(matches!(r.outcome, Outcome::Refreshed));
        let rec = r.record.unwrap();
        assert_eq!(rec.value, 11);
        assert!(rec.at > before);
    }

    #[test]
    fn test_force_skips_fresh_record() {
        let policy = CachePolicy::new(Duration::from_secs(300));
        let records = vec![fresh(1, 10)];
        assert!(matches!(policy.lookup(&records, &1, true), Lookup::Fetch));
    }

    #[test]
    fn test_update_keeps_identity_fields() {
        let policy = CachePolicy::new(Duration::from_secs(60));
        let mut cached = fresh(1, 10);
        cached.label = "original";
        let mut records = vec![cached];

        let mut replacement = entry(1, 99);
        replacement.label = "replacement";
        let rec = policy.merge(&mut records, &1, Ok(Some(replacement))).record.unwrap();
        assert_eq!(rec.value, 99);
        assert_eq!(rec.label, "original");
    }

    #[test]
    fn test_concurrent_insert_is_merged_not_duplicated() {
        let policy = CachePolicy::new(Duration::from_secs(60));
        let mut records = Vec::new();
        policy.merge(&mut records, &5, Ok(Some(entry(5, 1))));
        let r = policy.merge(&mut records, &5, Ok(Some(entry(5, 2))));
        assert!(matches!(r.outcome, Outcome::Refreshed));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 2);
    }

    #[test]
    fn test_missing_is_not_cached() {
        let policy = CachePolicy::new(Duration::from_secs(60));
        let mut records: Vec<Entry> = Vec::new();
        let r = policy.merge(&mut records, &3, Ok(None));
        assert!(r.record.is_none());
        assert!(matches!(r.outcome, Outcome::Missing));
        assert!(records.is_empty());
    }

    #[test]
    fn test_failed_refresh_keeps_last_good_value() {
        let policy = CachePolicy::new(Duration::from_secs(60));
        let mut records = vec![entry(4, 40)];

        let r = policy.merge(&mut records, &4, Err(SourceError::Timeout));
        assert!(matches!(r.outcome, Outcome::Failed(SourceError::Timeout)));
        assert_eq!(r.record.unwrap().value, 40);

        let r = policy.merge(&mut records, &4, Ok(None));
        assert!(matches!(r.outcome, Outcome::Kept));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 40);
    }
}
