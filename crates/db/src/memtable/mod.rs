// Copyright 2025 loam developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod tree;

use std::path::Path;

use tracing::info;

use crate::{
    config::Config,
    err::Result,
    format::{Entry, Key, Value},
    memtable::tree::LlrbTree,
    sst::table::{Segment, SegmentRef},
    wal::{self, Wal},
};

/// The engine's sole mutable structure: an ordered in-memory table fronted
/// by a write-ahead log.
///
/// The log is the durability source of truth; the tree is a read-optimized
/// cache of the log's effect. Every mutation is appended to the log before
/// it is applied to the tree, and on startup the log is replayed in write
/// order to rebuild the exact pre-crash tree state.
pub(crate) struct MemTable {
    tree:        LlrbTree,
    wal:         Wal,
    max_entries: usize,
}

impl MemTable {
    /// Opens the memtable, replaying any existing log at `wal_path`.
    ///
    /// A decode failure partway through the log is a replay error carrying
    /// the cause: the engine must not start serving with a partially
    /// reconstructed state it does not know about.
    pub(crate) fn open(wal_path: &Path, config: &Config) -> Result<Self> {
        let recovered = wal::replay(wal_path)?;
        let wal = Wal::open(wal_path, config.wal_batch_size)?;

        let mut tree = LlrbTree::new();
        for entry in recovered {
            tree.insert(entry);
        }
        if !tree.is_empty() {
            info!(entries = tree.len(), "memtable recovered from wal");
        }

        Ok(Self {
            tree,
            wal,
            max_entries: config.memtable_max_entries,
        })
    }

    /// Upserts a key. The entry is logged before the tree is touched.
    pub(crate) fn put(&mut self, key: Key, value: Value) -> Result<()> {
        let entry = Entry::insert(key, value);
        self.wal.append(entry.clone())?;
        self.tree.insert(entry);
        Ok(())
    }

    /// Inserts a tombstone for `key`. Physical removal happens during
    /// compaction, not here.
    pub(crate) fn delete(&mut self, key: Key) -> Result<()> {
        let entry = Entry::tombstone(key);
        self.wal.append(entry.clone())?;
        self.tree.insert(entry);
        Ok(())
    }

    /// Looks up the stored entry for `key`, tombstones included.
    ///
    /// The read path needs the distinction: a tombstone here means the key
    /// is gone and the levels below must not be consulted.
    pub(crate) fn entry(&self, key: &[u8]) -> Option<&Entry> { self.tree.get(key) }

    /// Looks up a live value; absent and tombstoned keys are both `None`.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Value> {
        match self.tree.get(key) {
            Some(entry) if !entry.is_tombstone() => Some(&entry.value),
            _ => None,
        }
    }

    /// Number of distinct keys, tombstones included.
    pub(crate) fn len(&self) -> usize { self.tree.len() }

    /// True once the table has reached its flush threshold.
    pub(crate) fn is_full(&self) -> bool { self.tree.len() >= self.max_entries }

    /// Snapshots the table into a new immutable segment in `dir`.
    ///
    /// The in-order traversal yields entries in ascending key order, the
    /// segment's key range comes from the traversal endpoints, and a fresh
    /// membership filter is populated with every key. The caller registers
    /// the segment and only then calls [`MemTable::clear`].
    pub(crate) fn snapshot(&self, dir: &Path, config: &Config) -> Result<SegmentRef> {
        Segment::build(dir, self.tree.entries(), config.filter_false_positive_rate)
    }

    /// Discards the tree and truncates the log.
    ///
    /// Only safe after the snapshot segment is durably synced and
    /// registered: that hand-off moves durability responsibility from the
    /// log to the segment.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.tree.clear();
        self.wal.discard()
    }

    /// Forces the pending log batch to disk.
    pub(crate) fn sync(&self) -> Result<()> { self.wal.sync() }

    /// Drains the log and releases its file handle.
    pub(crate) fn close(&mut self) -> Result<()> { self.wal.close() }
}
