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

use std::fmt::{self, Display, Formatter};

// revBytesLen is the byte length of a normal revision.
// First 8 bytes is the revision.main in big-endian format. The 9th byte
// is a '_'. The last 8 bytes is the revision.sub in big-endian format.
pub const REV_BYTES_LEN: usize = 8 + 1 + 8;

const REV_SEPARATOR: u8 = b'_';

// A revision indicates modification of the key-value space.
// The set of changes that share same main revision changes the key-value space atomically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    // main is the main revision of a set of changes that happen atomically.
    main: i64,
    // sub is the sub revision of a change in a set of changes that happen
    // atomically. Each change has different increasing sub revision in that
    // set.
    sub: i64,
}

impl Revision {
    pub const fn new(main: i64, sub: i64) -> Self {
        Revision { main, sub }
    }

    pub fn main(&self) -> i64 {
        self.main
    }

    pub fn sub(&self) -> i64 {
        self.sub
    }

    pub fn greater_than(&self, b: &Revision) -> bool {
        self > b
    }

    // successor returns the smallest revision greater than self. Range scans
    // resume from it so that the last observed revision is neither skipped
    // nor visited twice. Past the last sub revision it moves on to the next
    // main revision.
    pub fn successor(&self) -> Revision {
        match self.sub.checked_add(1) {
            Some(sub) => Revision { main: self.main, sub },
            None => match self.main.checked_add(1) {
                Some(main) => Revision { main, sub: 0 },
                None => panic!("revision {} has no successor", self),
            },
        }
    }

    pub fn to_bytes(&self) -> [u8; REV_BYTES_LEN] {
        let mut bytes = [0u8; REV_BYTES_LEN];
        rev_to_bytes(self, &mut bytes);
        bytes
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.main, self.sub)
    }
}

impl From<(i64, i64)> for Revision {
    fn from((main, sub): (i64, i64)) -> Self {
        Revision::new(main, sub)
    }
}

// rev_to_bytes writes the order preserving encoding of rev into bytes.
// Revisions are never negative, so the big-endian image of the unsigned
// value sorts the same way as the revision itself.
pub fn rev_to_bytes(rev: &Revision, bytes: &mut [u8]) {
    assert_eq!(bytes.len(), REV_BYTES_LEN, "revision buffer must be {} bytes", REV_BYTES_LEN);
    bytes[0..8].copy_from_slice(&(rev.main as u64).to_be_bytes());
    bytes[8] = REV_SEPARATOR;
    bytes[9..].copy_from_slice(&(rev.sub as u64).to_be_bytes());
}

// bytes_to_rev decodes a key produced by rev_to_bytes. Every caller decodes
// keys it wrote itself, so a malformed key is a broken store and panics.
pub fn bytes_to_rev(bytes: &[u8]) -> Revision {
    match try_bytes_to_rev(bytes) {
        Some(rev) => rev,
        None => panic!("malformed revision key {:?}: expected {} bytes joined by '_'", bytes, REV_BYTES_LEN),
    }
}

// try_bytes_to_rev decodes bytes read from a record that may be damaged.
pub fn try_bytes_to_rev(bytes: &[u8]) -> Option<Revision> {
    if bytes.len() != REV_BYTES_LEN || bytes[8] != REV_SEPARATOR {
        return None;
    }
    let mut main = [0u8; 8];
    let mut sub = [0u8; 8];
    main.copy_from_slice(&bytes[0..8]);
    sub.copy_from_slice(&bytes[9..]);
    Some(Revision {
        main: u64::from_be_bytes(main) as i64,
        sub: u64::from_be_bytes(sub) as i64,
    })
}
