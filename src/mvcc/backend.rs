// Copyright 2015 The etcd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

// keyBucketName holds every revisioned key of the store.
pub const KEY_BUCKET_NAME: &[u8] = b"key";
// metaBucketName holds the bookkeeping records, e.g. the compaction checkpoint.
pub const META_BUCKET_NAME: &[u8] = b"meta";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    // BucketNotFound is returned when an operation names a bucket that was never created.
    #[error("bucket {0} does not exist")]
    BucketNotFound(String),
    // Io wraps a failure of the underlying storage medium.
    #[error("backend io error: {0}")]
    Io(String),
    // Corrupted is returned when the backend detects damaged data.
    #[error("backend is corrupted: {0}")]
    Corrupted(String),
}

// BatchTx is the write transaction of a backend. A BatchTx is only reachable
// through Backend::batch_tx, which means the holder owns the backend's
// writer lock; the `unsafe_` prefix keeps the etcd naming for operations that
// rely on that lock being held.
pub trait BatchTx {
    // unsafe_range returns the keys and values in [start, end) of bucket in
    // ascending key order. A limit of 0 returns every key in the range.
    fn unsafe_range(&self, bucket: &[u8], start: &[u8], end: &[u8], limit: usize) -> Result<(Vec<Bytes>, Vec<Bytes>), BackendError>;
    fn unsafe_put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), BackendError>;
    fn unsafe_delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<(), BackendError>;
}

pub trait Backend: Send + Sync {
    // batch_tx acquires the exclusive batch transaction lock. The lock is
    // released when the returned transaction is dropped, whichever way the
    // caller leaves its scope.
    fn batch_tx(&self) -> Box<dyn BatchTx + '_>;
}

type Buckets = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Bytes>>;

// MemoryBackend implements the Backend interface backed by ordered
// in-memory maps. The key and meta buckets exist from the start.
pub struct MemoryBackend {
    buckets: Mutex<Buckets>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut buckets = Buckets::new();
        buckets.insert(KEY_BUCKET_NAME.to_vec(), BTreeMap::new());
        buckets.insert(META_BUCKET_NAME.to_vec(), BTreeMap::new());
        MemoryBackend { buckets: Mutex::new(buckets) }
    }

    pub fn create_bucket(&self, bucket: &[u8]) {
        self.buckets.lock().entry(bucket.to_vec()).or_default();
    }

    // keys returns a snapshot of the keys stored in bucket.
    pub fn keys(&self, bucket: &[u8]) -> Vec<Vec<u8>> {
        self.buckets.lock().get(bucket).map_or_else(Vec::new, |b| b.keys().cloned().collect())
    }

    pub fn len(&self, bucket: &[u8]) -> usize {
        self.buckets.lock().get(bucket).map_or(0, |b| b.len())
    }

    pub fn is_empty(&self, bucket: &[u8]) -> bool {
        self.len(bucket) == 0
    }

    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Option<Bytes> {
        self.buckets.lock().get(bucket).and_then(|b| b.get(key).cloned())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn batch_tx(&self) -> Box<dyn BatchTx + '_> {
        Box::new(MemoryBatchTx { buckets: self.buckets.lock() })
    }
}

struct MemoryBatchTx<'a> {
    buckets: MutexGuard<'a, Buckets>,
}

impl MemoryBatchTx<'_> {
    fn bucket_mut(&mut self, bucket: &[u8]) -> Result<&mut BTreeMap<Vec<u8>, Bytes>, BackendError> {
        self.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))
    }
}

impl BatchTx for MemoryBatchTx<'_> {
    fn unsafe_range(&self, bucket: &[u8], start: &[u8], end: &[u8], limit: usize) -> Result<(Vec<Bytes>, Vec<Bytes>), BackendError> {
        let b = self.buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let mut keys = vec![];
        let mut values = vec![];
        // BTreeMap::range panics on an inverted range
        if start >= end {
            return Ok((keys, values));
        }
        for (k, v) in b.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end))) {
            if limit > 0 && keys.len() >= limit {
                break;
            }
            keys.push(Bytes::copy_from_slice(k));
            values.push(v.clone());
        }
        Ok((keys, values))
    }

    fn unsafe_put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        self.bucket_mut(bucket)?.insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn unsafe_delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<(), BackendError> {
        self.bucket_mut(bucket)?.remove(key);
        Ok(())
    }
}

fn bucket_not_found(bucket: &[u8]) -> BackendError {
    BackendError::BucketNotFound(String::from_utf8_lossy(bucket).into_owned())
}
