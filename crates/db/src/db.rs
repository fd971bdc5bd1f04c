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

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, RwLock, RwLockWriteGuard},
};

use snafu::ResultExt;
use tracing::{debug, info};

use crate::{
    compaction::{Compactor, run_cycle},
    config::Config,
    err::{IoSnafu, NotFoundSnafu, Result},
    manifest::{LevelStats, Manifest},
    memtable::MemTable,
};

impl Config {
    /// Opens (or recovers) the database described by this configuration.
    pub fn open(self) -> Result<Db> { Db::open_with(self) }
}

/// The engine facade: a memtable, a manifest and a background compactor
/// behind `put`/`get`/`delete`/`close`.
#[derive(Clone)]
pub struct Db(Arc<DbInner>);

struct DbInner {
    config:    Config,
    memtable:  RwLock<MemTable>,
    manifest:  Arc<Manifest>,
    compactor: Mutex<Option<Compactor>>,
}

impl Db {
    /// Opens a database with default configuration at `path`.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Db> { Config::new(path).open() }

    fn open_with(config: Config) -> Result<Db> {
        info!("opening database at {}", config.path().display());

        std::fs::create_dir_all(config.path()).context(IoSnafu {
            op: "create database directory",
        })?;

        // Replay failures abort construction: the engine must not serve
        // traffic over a partially reconstructed state.
        let manifest = Arc::new(Manifest::open(&config)?);
        let memtable = MemTable::open(&config.wal_path(), &config)?;

        let compactor = Compactor::spawn(manifest.clone(), config.compaction_interval)?;

        Ok(Db(Arc::new(DbInner {
            config,
            memtable: RwLock::new(memtable),
            manifest,
            compactor: Mutex::new(Some(compactor)),
        })))
    }

    /// Upserts a key/value pair.
    ///
    /// If the memtable is at its size bound the write first flushes it to a
    /// level-0 segment; the exclusive lock is held until the segment is
    /// durably registered, so no reader can observe the gap between the
    /// old memtable and the new segment.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut memtable = self.0.write_memtable()?;
        if memtable.is_full() {
            self.0.flush_locked(&mut memtable)?;
        }
        memtable.put(key.to_vec(), value.to_vec())
    }

    /// Reads the newest value for `key`: memtable first, then level 0
    /// newest-first, then the sorted levels.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        {
            let memtable = self.0.read_memtable()?;
            if let Some(entry) = memtable.entry(key) {
                // A tombstone here shadows anything on disk.
                if entry.is_tombstone() {
                    return NotFoundSnafu.fail();
                }
                return Ok(entry.value.clone());
            }
        }

        match self.0.manifest.search(key)? {
            Some(entry) if !entry.is_tombstone() => Ok(entry.value),
            _ => NotFoundSnafu.fail(),
        }
    }

    /// Deletes a key by writing a tombstone; the space comes back during
    /// compaction.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut memtable = self.0.write_memtable()?;
        if memtable.is_full() {
            self.0.flush_locked(&mut memtable)?;
        }
        memtable.delete(key.to_vec())
    }

    /// Flushes the memtable to a level-0 segment regardless of size.
    pub fn flush(&self) -> Result<()> {
        let mut memtable = self.0.write_memtable()?;
        self.0.flush_locked(&mut memtable)
    }

    /// Runs compaction cycles until no level is over budget.
    pub fn compact(&self) -> Result<()> {
        while run_cycle(&self.0.manifest)? {}
        Ok(())
    }

    /// Database statistics: memtable occupancy and per-level layout.
    pub fn stats(&self) -> Result<DbStats> {
        let memtable_entries = self.0.read_memtable()?.len();
        let levels = self.0.manifest.stats()?;
        Ok(DbStats {
            memtable_entries,
            levels,
        })
    }

    /// Finishes outstanding WAL writes, waits for in-flight compaction and
    /// releases all files. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        info!("closing database");

        let compactor = self
            .0
            .compactor
            .lock()
            .map_err(|_| std::io::Error::other("compactor lock poisoned"))
            .context(IoSnafu { op: "lock compactor" })?
            .take();
        if let Some(mut compactor) = compactor {
            compactor.shutdown();
        }

        let mut memtable = self.0.write_memtable()?;
        memtable.close()
    }
}

impl DbInner {
    fn read_memtable(&self) -> Result<std::sync::RwLockReadGuard<'_, MemTable>> {
        self.memtable
            .read()
            .map_err(|_| std::io::Error::other("memtable lock poisoned"))
            .context(IoSnafu { op: "lock memtable" })
    }

    fn write_memtable(&self) -> Result<RwLockWriteGuard<'_, MemTable>> {
        self.memtable
            .write()
            .map_err(|_| std::io::Error::other("memtable lock poisoned"))
            .context(IoSnafu { op: "lock memtable" })
    }

    /// Snapshot, register, clear — in that order, under the caller's
    /// exclusive memtable guard.
    ///
    /// The WAL is only discarded after the segment (and its filter) are
    /// synced and the manifest has durably logged the addition; until then
    /// the WAL still owns durability for these entries.
    fn flush_locked(&self, memtable: &mut MemTable) -> Result<()> {
        if memtable.len() == 0 {
            return Ok(());
        }

        let entries = memtable.len();
        let segment = memtable.snapshot(&self.config.level_dir(0), &self.config)?;
        self.manifest.add_table(segment, 0)?;
        memtable.clear()?;

        debug!(entries, "memtable flushed to level 0");
        Ok(())
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Distinct keys (tombstones included) in the active memtable.
    pub memtable_entries: usize,
    /// Per-level table counts and sizes.
    pub levels:           Vec<LevelStats>,
}
