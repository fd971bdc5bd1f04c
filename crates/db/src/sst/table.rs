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
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::{Rng, distributions::Alphanumeric};
use snafu::{ResultExt, ensure};
use tracing::warn;

use crate::{
    err::{CorruptionSnafu, IoSnafu, Result},
    format::{Codec, Entry, FrameReader, Key, frame},
    manifest::edit::TableMeta,
    sst::filter::BloomFilter,
};

/// Magic number identifying segment files.
const SEGMENT_MAGIC: u64 = 0x4c4f_414d_5345_4731; // "LOAMSEG1"

pub(crate) const SEGMENT_EXT: &str = "seg";
pub(crate) const FILTER_EXT: &str = "flt";

pub(crate) type SegmentRef = Arc<Segment>;

/// An immutable, sorted on-disk run of entries with range metadata and a
/// membership filter.
///
/// Once synced a segment is cold: only metadata and the filter stay in
/// memory. [`Segment::open`] checks the segment out by loading its entries
/// under an exclusive lock; dropping the returned guard releases the memory
/// and the lock again.
///
/// File layout:
///
/// ```text
///  +-----------+--------------+-----------+---------------------+
///  | magic (8) | len (4, LE)  | crc32 (4) | count (4) entries…  |
///  +-----------+--------------+-----------+---------------------+
/// ```
pub(crate) struct Segment {
    name:        String,
    path:        PathBuf,
    filter_path: PathBuf,
    first:       Key,
    last:        Key,
    /// Nanoseconds since the epoch; orders segments by recency.
    created_at:  u64,
    size_bytes:  u64,
    entry_count: u32,
    filter:      BloomFilter,
    entries:     Mutex<Vec<Entry>>,
}

impl Segment {
    /// Writes `entries` (ascending by key, non-empty) as a new segment file
    /// in `dir`, fsyncs it, saves its filter side file and returns the cold
    /// segment.
    pub(crate) fn build(
        dir: &Path,
        entries: Vec<Entry>,
        filter_false_positive_rate: f64,
    ) -> Result<SegmentRef> {
        ensure!(
            !entries.is_empty(),
            CorruptionSnafu {
                what:   "segment",
                reason: "refusing to build an empty segment".to_string(),
            }
        );

        let created_at = unix_nanos();
        let name = unique_name(created_at);
        let path = dir.join(format!("{name}.{SEGMENT_EXT}"));
        let filter_path = dir.join(format!("{name}.{FILTER_EXT}"));

        let mut filter =
            BloomFilter::with_capacity(entries.len(), filter_false_positive_rate);
        for entry in &entries {
            filter.insert(&entry.key);
        }

        let mut payload = Vec::new();
        payload
            .write_u32::<LittleEndian>(entries.len() as u32)
            .context(IoSnafu { op: "encode segment" })?;
        for entry in &entries {
            entry
                .encode_into(&mut payload)
                .context(IoSnafu { op: "encode segment" })?;
        }

        let mut buf = Vec::with_capacity(8 + 8 + payload.len());
        buf.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&frame(&payload));

        let mut file = std::fs::File::create(&path).context(IoSnafu {
            op: "create segment file",
        })?;
        file.write_all(&buf).context(IoSnafu {
            op: "write segment file",
        })?;
        file.sync_all().context(IoSnafu {
            op: "sync segment file",
        })?;

        filter.save(&filter_path)?;

        let first = entries[0].key.clone();
        let last = entries[entries.len() - 1].key.clone();
        Ok(Arc::new(Segment {
            name,
            path,
            filter_path,
            first,
            last,
            created_at,
            size_bytes: buf.len() as u64,
            entry_count: entries.len() as u32,
            filter,
            entries: Mutex::new(Vec::new()),
        }))
    }

    /// Rebuilds a cold segment from replayed manifest metadata, loading its
    /// filter from the side file.
    ///
    /// A missing segment file is tolerated with a warning and `None`: a
    /// crash between the logged addition at the new level and the logged
    /// removal at the old one leaves a stale manifest record behind.
    pub(crate) fn from_meta(meta: &TableMeta, dir: &Path) -> Result<Option<SegmentRef>> {
        let path = dir.join(format!("{}.{SEGMENT_EXT}", meta.name));
        let filter_path = dir.join(format!("{}.{FILTER_EXT}", meta.name));

        let exists = path.try_exists().context(IoSnafu {
            op: "stat segment file",
        })?;
        if !exists {
            warn!(
                "segment {} referenced by the manifest is missing on disk, skipping",
                path.display()
            );
            return Ok(None);
        }

        let filter = BloomFilter::load(&filter_path)?;
        Ok(Some(Arc::new(Segment {
            name: meta.name.clone(),
            path,
            filter_path,
            first: meta.first.clone(),
            last: meta.last.clone(),
            created_at: meta.created_at,
            size_bytes: meta.size_bytes,
            entry_count: meta.entry_count,
            filter,
            entries: Mutex::new(Vec::new()),
        })))
    }

    /// Checks the segment out: loads its entries under the exclusive lock.
    /// Dropping the guard closes the segment again.
    pub(crate) fn open(&self) -> Result<OpenSegment<'_>> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("segment lock poisoned"))
            .context(IoSnafu { op: "open segment" })?;

        let data = std::fs::read(&self.path).context(IoSnafu {
            op: "read segment file",
        })?;
        *guard = decode_entries(&data)?;

        Ok(OpenSegment {
            entries: guard,
        })
    }

    /// Moves the segment's files into `dir` (a level change without a
    /// merge) and returns the relocated segment.
    pub(crate) fn relocate(&self, dir: &Path) -> Result<SegmentRef> {
        let path = dir.join(format!("{}.{SEGMENT_EXT}", self.name));
        let filter_path = dir.join(format!("{}.{FILTER_EXT}", self.name));

        std::fs::rename(&self.path, &path).context(IoSnafu {
            op: "relocate segment file",
        })?;
        std::fs::rename(&self.filter_path, &filter_path).context(IoSnafu {
            op: "relocate filter file",
        })?;

        Ok(Arc::new(Segment {
            name: self.name.clone(),
            path,
            filter_path,
            first: self.first.clone(),
            last: self.last.clone(),
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            entry_count: self.entry_count,
            filter: self.filter.clone(),
            entries: Mutex::new(Vec::new()),
        }))
    }

    /// Deletes the segment file and its filter side file.
    pub(crate) fn remove_files(&self) -> Result<()> {
        std::fs::remove_file(&self.path).context(IoSnafu {
            op: "remove segment file",
        })?;
        std::fs::remove_file(&self.filter_path).context(IoSnafu {
            op: "remove filter file",
        })?;
        Ok(())
    }

    pub(crate) fn name(&self) -> &str { &self.name }

    pub(crate) fn first(&self) -> &[u8] { &self.first }

    pub(crate) fn last(&self) -> &[u8] { &self.last }

    pub(crate) fn created_at(&self) -> u64 { self.created_at }

    pub(crate) fn size_bytes(&self) -> u64 { self.size_bytes }

    pub(crate) fn entry_count(&self) -> u32 { self.entry_count }

    /// Range test: could this segment hold `key`?
    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.first.as_slice() <= key && key <= self.last.as_slice()
    }

    /// Two segments overlap iff their `[first, last]` ranges intersect.
    pub(crate) fn overlaps(&self, other: &Segment) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Filter gate for the read path; `false` is authoritative.
    pub(crate) fn may_contain(&self, key: &[u8]) -> bool { self.filter.may_contain(key) }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("first", &String::from_utf8_lossy(&self.first))
            .field("last", &String::from_utf8_lossy(&self.last))
            .field("entries", &self.entry_count)
            .finish()
    }
}

/// A checked-out segment with its entries resident in memory.
pub(crate) struct OpenSegment<'a> {
    entries: MutexGuard<'a, Vec<Entry>>,
}

impl OpenSegment<'_> {
    /// Binary search by key over the loaded entries.
    pub(crate) fn search(&self, key: &[u8]) -> Option<&Entry> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
            .ok()
            .map(|index| &self.entries[index])
    }

    pub(crate) fn entries(&self) -> &[Entry] { &self.entries }
}

impl Drop for OpenSegment<'_> {
    fn drop(&mut self) {
        // Release the memory with the lock; the segment goes cold again.
        self.entries.clear();
        self.entries.shrink_to_fit();
    }
}

fn decode_entries(data: &[u8]) -> Result<Vec<Entry>> {
    ensure!(
        data.len() >= 8 && data[0..8] == SEGMENT_MAGIC.to_le_bytes(),
        CorruptionSnafu {
            what:   "segment",
            reason: "bad magic number".to_string(),
        }
    );

    let mut frames = FrameReader::new(&data[8..]);
    let payload = frames
        .next_frame()
        .map_err(|e| corrupt(e.to_string()))?
        .ok_or_else(|| corrupt("missing entry frame".into()))?;

    let mut cursor = payload;
    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| corrupt(e.to_string()))?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(Entry::decode_from(&mut cursor).map_err(|e| corrupt(e.to_string()))?);
    }
    Ok(entries)
}

fn corrupt(reason: String) -> crate::err::Error {
    CorruptionSnafu {
        what: "segment",
        reason,
    }
    .build()
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Timestamp plus a random suffix so concurrent flush and compaction can
/// never collide on a file name.
fn unique_name(created_at: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{created_at}-{suffix}")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::err::Error;

    fn sorted_entries(keys: &[&str]) -> Vec<Entry> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.iter()
            .map(|k| Entry::insert(k.as_bytes(), format!("value-{k}").into_bytes()))
            .collect()
    }

    #[test]
    fn build_sets_range_metadata() {
        let dir = TempDir::new().unwrap();
        let segment =
            Segment::build(dir.path(), sorted_entries(&["b", "d", "f"]), 0.01).unwrap();

        assert_eq!(segment.first(), b"b");
        assert_eq!(segment.last(), b"f");
        assert_eq!(segment.entry_count(), 3);
        assert!(segment.size_bytes() > 0);
        assert!(segment.path.exists());
        assert!(segment.filter_path.exists());
    }

    #[test]
    fn build_rejects_empty_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Segment::build(dir.path(), Vec::new(), 0.01),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn open_search_close() {
        let dir = TempDir::new().unwrap();
        let segment =
            Segment::build(dir.path(), sorted_entries(&["a", "c", "e"]), 0.01).unwrap();

        {
            let open = segment.open().unwrap();
            assert_eq!(open.entries().len(), 3);
            assert_eq!(open.search(b"c").unwrap().value, b"value-c".to_vec());
            assert!(open.search(b"d").is_none());
        }

        // Dropping the guard released the entries; reopening works.
        let open = segment.open().unwrap();
        assert_eq!(open.entries().len(), 3);
    }

    #[test]
    fn range_and_overlap_tests() {
        let dir = TempDir::new().unwrap();
        let left = Segment::build(dir.path(), sorted_entries(&["a", "d"]), 0.01).unwrap();
        let mid = Segment::build(dir.path(), sorted_entries(&["c", "f"]), 0.01).unwrap();
        let right = Segment::build(dir.path(), sorted_entries(&["g", "j"]), 0.01).unwrap();

        assert!(left.contains(b"b"));
        assert!(!left.contains(b"e"));

        assert!(left.overlaps(&mid)); // a-d intersects c-f
        assert!(!left.overlaps(&right)); // a-d does not reach g-j
        assert!(mid.overlaps(&left));
    }

    #[test]
    fn filter_gates_absent_keys() {
        let dir = TempDir::new().unwrap();
        let segment =
            Segment::build(dir.path(), sorted_entries(&["k1", "k2", "k3"]), 0.01).unwrap();

        assert!(segment.may_contain(b"k1"));
        // Not a guarantee for any single key, but with 3 keys at 1% the
        // chance of this exact probe colliding is negligible.
        assert!(!segment.may_contain(b"definitely-not-present"));
    }

    #[test]
    fn metadata_round_trips_through_the_manifest_record() {
        let dir = TempDir::new().unwrap();
        let built =
            Segment::build(dir.path(), sorted_entries(&["m", "p", "s"]), 0.01).unwrap();

        let meta = TableMeta::of(&built);
        let restored = Segment::from_meta(&meta, dir.path()).unwrap().unwrap();

        assert_eq!(restored.name(), built.name());
        assert_eq!(restored.first(), built.first());
        assert_eq!(restored.last(), built.last());
        assert_eq!(restored.created_at(), built.created_at());
        assert_eq!(restored.entry_count(), built.entry_count());

        let open = restored.open().unwrap();
        assert_eq!(open.search(b"p").unwrap().value, b"value-p".to_vec());
    }

    #[test]
    fn from_meta_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        let built = Segment::build(dir.path(), sorted_entries(&["x"]), 0.01).unwrap();
        let meta = TableMeta::of(&built);
        built.remove_files().unwrap();

        assert!(Segment::from_meta(&meta, dir.path()).unwrap().is_none());
    }

    #[test]
    fn relocate_moves_both_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("lower");
        std::fs::create_dir_all(&target).unwrap();

        let segment = Segment::build(dir.path(), sorted_entries(&["q", "r"]), 0.01).unwrap();
        let moved = segment.relocate(&target).unwrap();

        assert!(!segment.path.exists());
        assert!(moved.path.starts_with(&target));
        assert!(moved.filter_path.starts_with(&target));

        let open = moved.open().unwrap();
        assert_eq!(open.entries().len(), 2);
    }

    #[test]
    fn corrupt_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let segment = Segment::build(dir.path(), sorted_entries(&["y", "z"]), 0.01).unwrap();

        let mut data = std::fs::read(&segment.path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&segment.path, &data).unwrap();

        assert!(matches!(segment.open(), Err(Error::Corruption { .. })));
    }
}
