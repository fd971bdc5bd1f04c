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

pub(crate) mod edit;
pub(crate) mod level;

use std::{
    fs::{File, OpenOptions},
    io::Write,
    sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use snafu::ResultExt;
use tracing::info;

use crate::{
    config::Config,
    err::{CorruptionSnafu, IoSnafu, LogReplaySnafu, Result},
    format::{Codec, Entry, FrameReader, frame},
    manifest::{
        edit::{ManifestEdit, TableMeta},
        level::Level,
    },
    sst::table::{Segment, SegmentRef},
};

/// The authoritative record of which segments belong to which level.
///
/// The manifest exclusively owns all level and segment metadata. Every
/// structural mutation is appended to the manifest's own durability log
/// first and applied to the in-memory levels second, so the level layout is
/// replayable after a crash. Compaction borrows the level array through
/// [`Manifest::levels_write`] for a whole cycle and routes its mutations
/// back through the logged `log_*` operations.
#[derive(Debug)]
pub(crate) struct Manifest {
    levels: RwLock<Vec<Level>>,
    log:    Mutex<ManifestLog>,
    config: Config,
}

impl Manifest {
    /// Opens the manifest, replaying its log to rebuild level contents and
    /// loading every referenced segment's filter from its side file.
    ///
    /// A log that cannot be decoded or applied aborts engine construction:
    /// serving reads over an unknown layout is worse than failing loudly.
    pub(crate) fn open(config: &Config) -> Result<Self> {
        for level in 0..config.max_levels {
            std::fs::create_dir_all(config.level_dir(level)).context(IoSnafu {
                op: "create level directory",
            })?;
        }

        let mut levels: Vec<Level> = (0..config.max_levels)
            .map(|number| Level::new(number, config.level_max_size(number)))
            .collect();

        let manifest_path = config.manifest_path();
        match std::fs::read(&manifest_path) {
            Ok(data) => {
                replay(&mut levels, &data, config).context(LogReplaySnafu { log: "manifest" })?;
                let tables: usize = levels.iter().map(|l| l.tables().len()).sum();
                info!(tables, "manifest recovered");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(IoSnafu {
                    op: "read manifest log",
                });
            }
        }

        let log = ManifestLog::open(config)?;
        Ok(Self {
            levels: RwLock::new(levels),
            log: Mutex::new(log),
            config: config.clone(),
        })
    }

    /// Shared view of the level array, for the read path and statistics.
    pub(crate) fn levels_read(&self) -> Result<RwLockReadGuard<'_, Vec<Level>>> {
        self.levels
            .read()
            .map_err(|_| std::io::Error::other("manifest lock poisoned"))
            .context(IoSnafu { op: "lock manifest" })
    }

    /// Exclusive view of the level array. Compaction holds this guard for a
    /// whole cycle, blocking structural readers and writers; flushes take
    /// it per mutation through [`Manifest::add_table`].
    pub(crate) fn levels_write(&self) -> Result<RwLockWriteGuard<'_, Vec<Level>>> {
        self.levels
            .write()
            .map_err(|_| std::io::Error::other("manifest lock poisoned"))
            .context(IoSnafu { op: "lock manifest" })
    }

    /// Registers a segment into a level: logged, then applied.
    pub(crate) fn add_table(&self, segment: SegmentRef, level: usize) -> Result<()> {
        let mut levels = self.levels_write()?;
        self.log_add(&mut levels, segment, level)
    }

    /// Logged insertion against an already-held level guard.
    pub(crate) fn log_add(
        &self,
        levels: &mut [Level],
        segment: SegmentRef,
        level: usize,
    ) -> Result<()> {
        self.append_edit(&ManifestEdit::AddTable {
            level: level as u32,
            table: TableMeta::of(&segment),
        })?;
        levels[level].add(segment);
        Ok(())
    }

    /// Logged removal against an already-held level guard.
    pub(crate) fn log_remove(
        &self,
        levels: &mut [Level],
        segment: &Segment,
        level: usize,
    ) -> Result<Option<SegmentRef>> {
        self.append_edit(&ManifestEdit::RemoveTable {
            level: level as u32,
            name:  segment.name().to_string(),
        })?;
        Ok(levels[level].remove(segment.name()))
    }

    /// Logged relocation of a segment one level down without a merge: the
    /// addition is logged before the file moves and the removal after, so
    /// replay at any intermediate point still sees the segment exactly
    /// once.
    pub(crate) fn log_relocate(
        &self,
        levels: &mut [Level],
        segment: &SegmentRef,
        from: usize,
        to: usize,
    ) -> Result<SegmentRef> {
        self.append_edit(&ManifestEdit::AddTable {
            level: to as u32,
            table: TableMeta::of(segment),
        })?;
        let moved = segment.relocate(&self.config.level_dir(to))?;
        levels[to].add(moved.clone());

        self.append_edit(&ManifestEdit::RemoveTable {
            level: from as u32,
            name:  segment.name().to_string(),
        })?;
        levels[from].remove(segment.name());
        Ok(moved)
    }

    /// Logged clear against an already-held level guard; returns what the
    /// level held so the caller can delete the files.
    pub(crate) fn log_clear(&self, levels: &mut [Level], level: usize) -> Result<Vec<SegmentRef>> {
        self.append_edit(&ManifestEdit::ClearLevel {
            level: level as u32,
        })?;
        Ok(levels[level].clear())
    }

    fn append_edit(&self, edit: &ManifestEdit) -> Result<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| std::io::Error::other("manifest log lock poisoned"))
            .context(IoSnafu {
                op: "lock manifest log",
            })?;
        log.append(edit)
    }

    /// The full on-disk read path: level 0 newest-first with filter gating,
    /// then levels 1..N by binary search with filter gating.
    ///
    /// Returns the raw entry; the caller decides what a tombstone means.
    pub(crate) fn search(&self, key: &[u8]) -> Result<Option<Entry>> {
        let levels = self.levels_read()?;

        if let Some(level_zero) = levels.first() {
            for segment in level_zero.tables().iter().rev() {
                if !segment.contains(key) || !segment.may_contain(key) {
                    continue;
                }
                let open = segment.open()?;
                if let Some(entry) = open.search(key) {
                    return Ok(Some(entry.clone()));
                }
            }
        }

        for level in levels.iter().skip(1) {
            let Some(index) = level.binary_search(key) else {
                continue;
            };
            let segment = &level.tables()[index];
            if !segment.may_contain(key) {
                continue;
            }
            let open = segment.open()?;
            if let Some(entry) = open.search(key) {
                return Ok(Some(entry.clone()));
            }
        }

        Ok(None)
    }

    pub(crate) fn stats(&self) -> Result<Vec<LevelStats>> {
        let levels = self.levels_read()?;
        Ok(levels
            .iter()
            .map(|level| LevelStats {
                level:            level.number(),
                table_count:      level.tables().len(),
                size_bytes:       level.size(),
                max_size_bytes:   level.max_size(),
                needs_compaction: level.is_over_budget(),
            })
            .collect())
    }

    pub(crate) fn config(&self) -> &Config { &self.config }
}

/// Statistics for a single level.
#[derive(Debug, Clone)]
pub struct LevelStats {
    pub level:            usize,
    pub table_count:      usize,
    pub size_bytes:       u64,
    pub max_size_bytes:   u64,
    pub needs_compaction: bool,
}

/// Append-only writer for the manifest log; every edit is framed,
/// checksummed and fsynced before the in-memory mutation it covers.
#[derive(Debug)]
struct ManifestLog {
    file: File,
}

impl ManifestLog {
    fn open(config: &Config) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.manifest_path())
            .context(IoSnafu {
                op: "open manifest log",
            })?;
        Ok(Self { file })
    }

    fn append(&mut self, edit: &ManifestEdit) -> Result<()> {
        let payload = edit.encode_into_vec().context(IoSnafu {
            op: "encode manifest edit",
        })?;
        self.file.write_all(&frame(&payload)).context(IoSnafu {
            op: "write manifest log",
        })?;
        self.file.sync_all().context(IoSnafu {
            op: "sync manifest log",
        })
    }
}

/// Re-applies the manifest log in write order.
fn replay(levels: &mut [Level], data: &[u8], config: &Config) -> Result<()> {
    let mut frames = FrameReader::new(data);
    loop {
        let payload = frames.next_frame().map_err(|e| corrupt(e.to_string()))?;
        let Some(payload) = payload else {
            return Ok(());
        };

        let mut cursor = payload;
        let edit =
            ManifestEdit::decode_from(&mut cursor).map_err(|e| corrupt(e.to_string()))?;
        apply(levels, edit, config)?;
    }
}

fn apply(levels: &mut [Level], edit: ManifestEdit, config: &Config) -> Result<()> {
    let level_count = levels.len();
    let check = |level: u32| -> Result<usize> {
        let level = level as usize;
        snafu::ensure!(
            level < level_count,
            CorruptionSnafu {
                what:   "manifest log",
                reason: format!("level {level} out of range (max {level_count})"),
            }
        );
        Ok(level)
    };

    match edit {
        ManifestEdit::AddTable { level, table } => {
            let level = check(level)?;
            if let Some(segment) = Segment::from_meta(&table, &config.level_dir(level))? {
                levels[level].add(segment);
            }
        }
        ManifestEdit::RemoveTable { level, name } => {
            // A remove may refer to a record that was skipped on add
            // because its file was already gone.
            let level = check(level)?;
            levels[level].remove(&name);
        }
        ManifestEdit::ClearLevel { level } => {
            let level = check(level)?;
            levels[level].clear();
        }
    }
    Ok(())
}

fn corrupt(reason: String) -> crate::err::Error {
    CorruptionSnafu {
        what: "manifest log",
        reason,
    }
    .build()
}
