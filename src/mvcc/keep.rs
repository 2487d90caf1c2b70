use std::collections::HashSet;

use crate::mvcc::revision::Revision;

// KeepSet holds the revisions a compaction must not delete: for every key
// still alive at the compaction revision, its latest revision at or below it.
pub type KeepSet = HashSet<Revision>;

// KeepSetResolver computes the KeepSet of a compaction revision. The index
// that owns the key history implements it; compaction trusts the result to be
// complete.
pub trait KeepSetResolver {
    fn keep(&self, compact_rev: i64) -> KeepSet;
}

impl<F> KeepSetResolver for F
where
    F: Fn(i64) -> KeepSet,
{
    fn keep(&self, compact_rev: i64) -> KeepSet {
        self(compact_rev)
    }
}

// keep_set builds a KeepSet from (main, sub) pairs.
pub fn keep_set<I>(revs: I) -> KeepSet
where
    I: IntoIterator<Item = (i64, i64)>,
{
    revs.into_iter().map(Revision::from).collect()
}
