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

use std::{path::PathBuf, time::Duration};

use loam_common::readable_size::ReadableSize;

/// Default engine parameters
pub(crate) const DEFAULT_WAL_BATCH_SIZE: usize = 32; // entries fsynced per WAL batch
pub(crate) const DEFAULT_MEMTABLE_MAX_ENTRIES: usize = 4096; // memtable flush threshold
pub(crate) const DEFAULT_LEVEL_BASE_MAX_SIZE: ReadableSize = ReadableSize::mb(10); // level 0 budget
pub(crate) const DEFAULT_LEVEL_SIZE_MULTIPLIER: u64 = 10; // each level is 10x larger than previous
pub(crate) const DEFAULT_MAX_LEVELS: usize = 7; // L0 through L6
pub(crate) const DEFAULT_SEGMENT_MAX_ENTRIES: usize = 4096; // split bound for compaction outputs
pub(crate) const DEFAULT_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01; // 1% membership filter FPR
pub(crate) const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) const WAL_FILE: &str = "wal.log";
pub(crate) const MANIFEST_FILE: &str = "MANIFEST";

/// Engine configuration, threaded through every constructor.
///
/// There is deliberately no process-wide state: two engines opened with
/// different configs in the same process do not interfere.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database root directory.
    path: PathBuf,
    /// Number of queued WAL entries encoded and fsynced as one batch.
    pub wal_batch_size: usize,
    /// Number of distinct keys after which the memtable is flushed.
    pub memtable_max_entries: usize,
    /// Size budget for level 0; deeper levels multiply from here.
    pub level_base_max_size: ReadableSize,
    /// Growth factor between consecutive level budgets.
    pub level_size_multiplier: u64,
    /// Number of levels, level 0 included.
    pub max_levels: usize,
    /// Maximum entries per segment produced by a compaction split.
    pub segment_max_entries: usize,
    /// Target false-positive rate for per-segment membership filters.
    pub filter_false_positive_rate: f64,
    /// How often the compaction loop evaluates level triggers.
    pub compaction_interval: Duration,
}

impl Config {
    /// Creates a configuration with default parameters rooted at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            wal_batch_size: DEFAULT_WAL_BATCH_SIZE,
            memtable_max_entries: DEFAULT_MEMTABLE_MAX_ENTRIES,
            level_base_max_size: DEFAULT_LEVEL_BASE_MAX_SIZE,
            level_size_multiplier: DEFAULT_LEVEL_SIZE_MULTIPLIER,
            max_levels: DEFAULT_MAX_LEVELS,
            segment_max_entries: DEFAULT_SEGMENT_MAX_ENTRIES,
            filter_false_positive_rate: DEFAULT_FILTER_FALSE_POSITIVE_RATE,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }

    pub fn with_wal_batch_size(mut self, entries: usize) -> Self {
        self.wal_batch_size = entries.max(1);
        self
    }

    pub fn with_memtable_max_entries(mut self, entries: usize) -> Self {
        self.memtable_max_entries = entries.max(1);
        self
    }

    pub fn with_level_base_max_size(mut self, size: ReadableSize) -> Self {
        self.level_base_max_size = size;
        self
    }

    pub fn with_level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier.max(2);
        self
    }

    pub fn with_max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels.max(2);
        self
    }

    pub fn with_segment_max_entries(mut self, entries: usize) -> Self {
        self.segment_max_entries = entries.max(1);
        self
    }

    pub fn with_filter_false_positive_rate(mut self, rate: f64) -> Self {
        self.filter_false_positive_rate = rate;
        self
    }

    pub fn with_compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Database root directory.
    pub fn path(&self) -> &PathBuf { &self.path }

    /// Path of the active memtable's write-ahead log.
    pub(crate) fn wal_path(&self) -> PathBuf { self.path.join(WAL_FILE) }

    /// Path of the manifest's own durability log.
    pub(crate) fn manifest_path(&self) -> PathBuf { self.path.join(MANIFEST_FILE) }

    /// Directory holding the segment and filter files of one level.
    pub(crate) fn level_dir(&self, level: usize) -> PathBuf {
        self.path.join(format!("level-{level}"))
    }

    /// Size budget of a level: `base * multiplier^level`.
    pub(crate) fn level_max_size(&self, level: usize) -> u64 {
        self.level_base_max_size.as_bytes()
            * self.level_size_multiplier.pow(level as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_budgets_grow_by_multiplier() {
        let config = Config::new("/tmp/db")
            .with_level_base_max_size(ReadableSize::kb(1))
            .with_level_size_multiplier(10);

        assert_eq!(config.level_max_size(0), 1024);
        assert_eq!(config.level_max_size(1), 10 * 1024);
        assert_eq!(config.level_max_size(3), 1000 * 1024);
    }

    #[test]
    fn paths_derive_from_root() {
        let config = Config::new("/data/loam");
        assert_eq!(config.wal_path(), PathBuf::from("/data/loam/wal.log"));
        assert_eq!(config.manifest_path(), PathBuf::from("/data/loam/MANIFEST"));
        assert_eq!(config.level_dir(2), PathBuf::from("/data/loam/level-2"));
    }
}
