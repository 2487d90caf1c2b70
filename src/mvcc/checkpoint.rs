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

use crate::mvcc::backend::{Backend, BackendError, BatchTx, META_BUCKET_NAME};
use crate::mvcc::revision::{try_bytes_to_rev, Revision, REV_BYTES_LEN};

// finishedCompactKeyName records the main revision of the last compaction
// that scanned its whole range.
pub const FINISHED_COMPACT_KEY_NAME: &[u8] = b"finishedCompactRev";

// read_finished_compact_rev returns the checkpoint, or None if no compaction
// ever finished on this backend.
pub fn read_finished_compact_rev(tx: &dyn BatchTx) -> Result<Option<i64>, BackendError> {
    let (_, values) = tx.unsafe_range(META_BUCKET_NAME, FINISHED_COMPACT_KEY_NAME, &end_of(FINISHED_COMPACT_KEY_NAME), 1)?;
    match values.first() {
        None => Ok(None),
        Some(v) => match try_bytes_to_rev(v) {
            Some(rev) => Ok(Some(rev.main())),
            None => Err(BackendError::Corrupted(format!("checkpoint record {:?} is not a {}-byte revision", v, REV_BYTES_LEN))),
        },
    }
}

// write_finished_compact_rev stores rev as the checkpoint. The checkpoint
// never moves backwards: an older rev leaves the stored value in place, and
// the value that is in effect afterwards is returned.
pub fn write_finished_compact_rev(tx: &mut dyn BatchTx, rev: i64) -> Result<i64, BackendError> {
    if let Some(current) = read_finished_compact_rev(tx)? {
        if current > rev {
            warn!("ignore compaction checkpoint {} older than the recorded {}", rev, current);
            return Ok(current);
        }
    }
    tx.unsafe_put(META_BUCKET_NAME, FINISHED_COMPACT_KEY_NAME, &Revision::new(rev, 0).to_bytes())?;
    Ok(rev)
}

// finished_compact_rev locks the backend and reads the checkpoint.
pub fn finished_compact_rev<B: Backend + ?Sized>(backend: &B) -> Result<Option<i64>, BackendError> {
    let tx = backend.batch_tx();
    read_finished_compact_rev(&*tx)
}

// end_of returns the smallest key greater than key, so that [key, end_of(key))
// selects exactly key.
fn end_of(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    end.push(0);
    end
}
