//! In-memory enrollment index.
//!
//! A read-mostly cache of identity → embedding rebuilt from the persistent
//! enrollment records. Rebuilds assemble a complete new snapshot first and
//! then swap the `Arc`, so readers only ever see a whole index.

use crate::codec;
use crate::types::{Embedding, UserId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// One persisted enrollment as read back from storage, descriptor still encoded.
#[derive(Debug, Clone)]
pub struct StoredEnrollment {
    pub record_id: String,
    pub user: UserId,
    pub descriptor: Vec<u8>,
}

/// Persistent source of active enrollments.
pub trait EnrollmentSource {
    fn load_active(&self) -> Result<Vec<StoredEnrollment>, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("enrollment source unavailable: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Counts from one rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub loaded: usize,
    pub skipped: usize,
}

/// Immutable identity → embedding map.
#[derive(Debug, Default, Clone)]
pub struct IndexSnapshot {
    entries: HashMap<UserId, Embedding>,
}

impl IndexSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = (UserId, Embedding)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Decode stored records, skipping (and logging) the ones that fail.
    pub fn from_records(records: Vec<StoredEnrollment>) -> (Self, RebuildSummary) {
        let mut entries = HashMap::with_capacity(records.len());
        let mut skipped = 0;

        for record in records {
            match codec::decode(&record.descriptor) {
                Ok(embedding) => {
                    if entries.insert(record.user, embedding).is_some() {
                        tracing::warn!(
                            user = %record.user,
                            record_id = %record.record_id,
                            "duplicate active enrollment; keeping the later record"
                        );
                    }
                }
                Err(e) => {
                    skipped += 1;
                    tracing::error!(
                        user = %record.user,
                        record_id = %record.record_id,
                        error = %e,
                        "skipping corrupt enrollment descriptor"
                    );
                }
            }
        }

        let summary = RebuildSummary {
            loaded: entries.len(),
            skipped,
        };
        (Self { entries }, summary)
    }

    pub fn get(&self, user: UserId) -> Option<&Embedding> {
        self.entries.get(&user)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UserId, &Embedding)> {
        self.entries.iter().map(|(u, e)| (*u, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared, atomically replaceable enrollment index.
#[derive(Debug, Default)]
pub struct EnrollmentIndex {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl EnrollmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload every active enrollment from `source` and swap it in.
    ///
    /// Corrupt descriptors are skipped. If the source itself fails, the
    /// previous snapshot stays installed.
    pub fn rebuild(&self, source: &dyn EnrollmentSource) -> Result<RebuildSummary, IndexError> {
        let records = source.load_active().map_err(|e| {
            tracing::error!(error = %e, "index rebuild failed; keeping previous index");
            IndexError::Source(e)
        })?;

        let (snapshot, summary) = IndexSnapshot::from_records(records);
        self.install(snapshot);
        tracing::info!(loaded = summary.loaded, skipped = summary.skipped, "enrollment index rebuilt");
        Ok(summary)
    }

    /// Replace the current snapshot.
    pub fn install(&self, snapshot: IndexSnapshot) {
        let next = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// The whole current index, for 1-to-N identification.
    pub fn lookup_all(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// One identity's embedding, for 1-to-1 verification.
    pub fn lookup_one(&self, user: UserId) -> Option<Embedding> {
        self.lookup_all().get(user).cloned()
    }

    pub fn len(&self) -> usize {
        self.lookup_all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_all().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Records(Mutex<Result<Vec<StoredEnrollment>, String>>);

    impl Records {
        fn ok(records: Vec<StoredEnrollment>) -> Self {
            Self(Mutex::new(Ok(records)))
        }

        fn set(&self, next: Result<Vec<StoredEnrollment>, String>) {
            *self.0.lock().unwrap() = next;
        }
    }

    impl EnrollmentSource for Records {
        fn load_active(&self) -> Result<Vec<StoredEnrollment>, Box<dyn std::error::Error + Send + Sync>> {
            self.0.lock().unwrap().clone().map_err(Into::into)
        }
    }

    fn stored(user: i64, values: &[f32]) -> StoredEnrollment {
        StoredEnrollment {
            record_id: format!("rec-{user}"),
            user: UserId(user),
            descriptor: codec::encode(&Embedding::from_raw(values.to_vec()).unwrap()),
        }
    }

    #[test]
    fn test_starts_empty() {
        let index = EnrollmentIndex::new();
        assert!(index.is_empty());
        assert!(index.lookup_one(UserId(1)).is_none());
    }

    #[test]
    fn test_rebuild_loads_records() {
        let index = EnrollmentIndex::new();
        let source = Records::ok(vec![stored(1, &[1.0, 0.0]), stored(2, &[0.0, 1.0])]);

        let summary = index.rebuild(&source).unwrap();
        assert_eq!(summary, RebuildSummary { loaded: 2, skipped: 0 });
        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup_one(UserId(2)).unwrap().values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let index = EnrollmentIndex::new();
        let mut corrupt = stored(2, &[0.0, 1.0]);
        corrupt.descriptor.truncate(5);
        let source = Records::ok(vec![stored(1, &[1.0, 0.0]), corrupt, stored(3, &[1.0, 1.0])]);

        let summary = index.rebuild(&source).unwrap();
        assert_eq!(summary, RebuildSummary { loaded: 2, skipped: 1 });
        assert!(index.lookup_one(UserId(1)).is_some());
        assert!(index.lookup_one(UserId(2)).is_none());
        assert!(index.lookup_one(UserId(3)).is_some());
    }

    #[test]
    fn test_failed_source_keeps_previous_index() {
        let index = EnrollmentIndex::new();
        let source = Records::ok(vec![stored(1, &[1.0, 0.0])]);
        index.rebuild(&source).unwrap();

        source.set(Err("database locked".into()));
        assert!(matches!(index.rebuild(&source), Err(IndexError::Source(_))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_rebuild_replaces_not_merges() {
        let index = EnrollmentIndex::new();
        let source = Records::ok(vec![stored(1, &[1.0, 0.0]), stored(2, &[0.0, 1.0])]);
        index.rebuild(&source).unwrap();

        source.set(Ok(vec![stored(2, &[0.0, 1.0])]));
        index.rebuild(&source).unwrap();
        assert!(index.lookup_one(UserId(1)).is_none());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_swap() {
        let index = EnrollmentIndex::new();
        let source = Records::ok(vec![stored(1, &[1.0, 0.0])]);
        index.rebuild(&source).unwrap();

        let held = index.lookup_all();
        source.set(Ok(Vec::new()));
        index.rebuild(&source).unwrap();

        assert_eq!(held.len(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let index = Arc::new(EnrollmentIndex::new());
        let small: Vec<_> = (0..10).map(|u| stored(u, &[1.0, u as f32])).collect();
        let large: Vec<_> = (0..50).map(|u| stored(u, &[1.0, u as f32])).collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let n = index.lookup_all().len();
                        assert!(n == 0 || n == 10 || n == 50, "observed partial index of {n}");
                    }
                })
            })
            .collect();

        for i in 0..20 {
            let records = if i % 2 == 0 { small.clone() } else { large.clone() };
            index.rebuild(&Records::ok(records)).unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
