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

use crate::sst::table::{Segment, SegmentRef};

/// One tier of segments with a size budget.
///
/// Level 0 collects flushed memtables in arrival order; its segments may
/// overlap and are scanned newest-first. Levels >= 1 keep their tables
/// sorted by `first` and mutually non-overlapping, so a key maps to at most
/// one table and `binary_search` finds it.
#[derive(Debug)]
pub(crate) struct Level {
    number:   usize,
    tables:   Vec<SegmentRef>,
    size:     u64,
    max_size: u64,
}

impl Level {
    pub(crate) fn new(number: usize, max_size: u64) -> Self {
        Self {
            number,
            tables: Vec::new(),
            size: 0,
            max_size,
        }
    }

    pub(crate) fn number(&self) -> usize { self.number }

    pub(crate) fn size(&self) -> u64 { self.size }

    pub(crate) fn max_size(&self) -> u64 { self.max_size }

    pub(crate) fn tables(&self) -> &[SegmentRef] { &self.tables }

    /// Compaction trigger: the level is at or past its budget.
    pub(crate) fn is_over_budget(&self) -> bool {
        !self.tables.is_empty() && self.size >= self.max_size
    }

    /// Inserts a segment, maintaining sort order by `first` on levels >= 1.
    pub(crate) fn add(&mut self, segment: SegmentRef) {
        self.size += segment.size_bytes();
        if self.number == 0 {
            self.tables.push(segment);
        } else {
            let at = self
                .tables
                .partition_point(|table| table.first() < segment.first());
            self.tables.insert(at, segment);
        }
    }

    /// Removes a segment by identity, keeping the size accounting straight.
    pub(crate) fn remove(&mut self, name: &str) -> Option<SegmentRef> {
        let position = self.tables.iter().position(|table| table.name() == name)?;
        let segment = self.tables.remove(position);
        self.size = self.size.saturating_sub(segment.size_bytes());
        Some(segment)
    }

    /// Empties the level, returning what it held.
    pub(crate) fn clear(&mut self) -> Vec<SegmentRef> {
        self.size = 0;
        std::mem::take(&mut self.tables)
    }

    /// Index of the (at most one, for levels >= 1) table whose range could
    /// contain `key`.
    pub(crate) fn binary_search(&self, key: &[u8]) -> Option<usize> {
        let index = self.tables.partition_point(|table| table.first() <= key);
        let candidate = index.checked_sub(1)?;
        self.tables[candidate].contains(key).then_some(candidate)
    }

    /// All tables whose range intersects `segment`'s.
    pub(crate) fn overlapping(&self, segment: &Segment) -> Vec<SegmentRef> {
        self.tables
            .iter()
            .filter(|table| table.overlaps(segment))
            .cloned()
            .collect()
    }

    /// The next compaction victim: oldest by creation timestamp.
    pub(crate) fn oldest(&self) -> Option<SegmentRef> {
        self.tables
            .iter()
            .min_by_key(|table| table.created_at())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::format::Entry;

    fn segment(dir: &TempDir, keys: &[&str]) -> SegmentRef {
        let mut keys = keys.to_vec();
        keys.sort();
        let entries = keys
            .iter()
            .map(|k| Entry::insert(k.as_bytes(), b"v".to_vec()))
            .collect();
        crate::sst::table::Segment::build(dir.path(), entries, 0.01).unwrap()
    }

    #[test]
    fn add_keeps_sorted_order_on_lower_levels() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, u64::MAX);

        level.add(segment(&dir, &["m", "p"]));
        level.add(segment(&dir, &["a", "c"]));
        level.add(segment(&dir, &["f", "j"]));

        let firsts: Vec<_> = level.tables().iter().map(|t| t.first().to_vec()).collect();
        assert_eq!(firsts, vec![b"a".to_vec(), b"f".to_vec(), b"m".to_vec()]);
    }

    #[test]
    fn level_zero_keeps_arrival_order() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(0, u64::MAX);

        let newer_range = segment(&dir, &["m", "p"]);
        let older_range = segment(&dir, &["a", "c"]);
        level.add(newer_range.clone());
        level.add(older_range.clone());

        assert_eq!(level.tables()[0].name(), newer_range.name());
        assert_eq!(level.tables()[1].name(), older_range.name());
    }

    #[test]
    fn size_accounting_through_add_and_remove() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, u64::MAX);

        let first = segment(&dir, &["a", "b"]);
        let second = segment(&dir, &["x", "y"]);
        let expected = first.size_bytes() + second.size_bytes();

        level.add(first.clone());
        level.add(second);
        assert_eq!(level.size(), expected);

        level.remove(first.name());
        assert_eq!(level.size(), expected - first.size_bytes());

        level.clear();
        assert_eq!(level.size(), 0);
    }

    #[test]
    fn binary_search_finds_exactly_the_covering_table() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, u64::MAX);

        level.add(segment(&dir, &["a", "d"]));
        level.add(segment(&dir, &["f", "j"]));
        level.add(segment(&dir, &["m", "r"]));

        // A hit iff some table's range contains the key.
        assert_eq!(level.binary_search(b"b"), Some(0));
        assert_eq!(level.binary_search(b"f"), Some(1));
        assert_eq!(level.binary_search(b"j"), Some(1));
        assert_eq!(level.binary_search(b"r"), Some(2));

        // Gaps and out-of-range keys miss.
        assert_eq!(level.binary_search(b"e"), None);
        assert_eq!(level.binary_search(b"k"), None);
        assert_eq!(level.binary_search(b"A"), None);
        assert_eq!(level.binary_search(b"z"), None);
    }

    #[test]
    fn overlapping_selects_intersecting_tables() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, u64::MAX);

        level.add(segment(&dir, &["a", "d"]));
        level.add(segment(&dir, &["f", "j"]));
        level.add(segment(&dir, &["m", "r"]));

        let probe = segment(&dir, &["c", "g"]);
        let hits = level.overlapping(&probe);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].first(), b"a");
        assert_eq!(hits[1].first(), b"f");
    }

    #[test]
    fn oldest_picks_the_earliest_created_segment() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, u64::MAX);

        let first = segment(&dir, &["a", "b"]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = segment(&dir, &["x", "y"]);

        level.add(second);
        level.add(first.clone());

        assert_eq!(level.oldest().unwrap().name(), first.name());
    }

    #[test]
    fn over_budget_requires_content() {
        let dir = TempDir::new().unwrap();
        let mut level = Level::new(1, 1); // 1-byte budget

        assert!(!level.is_over_budget());
        level.add(segment(&dir, &["a"]));
        assert!(level.is_over_budget());
    }
}
