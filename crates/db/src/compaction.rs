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
    collections::BTreeMap,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{Sender, bounded, select, tick};
use snafu::ResultExt;
use tracing::{debug, error, info};

use crate::{
    config::Config,
    err::{IoSnafu, Result},
    format::{Entry, Key},
    manifest::{Manifest, level::Level},
    sst::table::{Segment, SegmentRef},
};

/// Background compaction driver.
///
/// One thread per manifest, woken by a periodic tick rather than by
/// requests. Each tick evaluates every level's size trigger and runs the
/// due compactions under the manifest's exclusive lock. A failed cycle is
/// logged and abandoned: the manifest stays at its last durably logged
/// state and the next tick retries.
pub(crate) struct Compactor {
    shutdown: Sender<()>,
    handle:   Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn spawn(manifest: Arc<Manifest>, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = std::thread::Builder::new()
            .name("compaction".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => return,
                        recv(ticker) -> _ => {
                            match run_cycle(&manifest) {
                                Ok(true) => debug!("compaction cycle finished"),
                                Ok(false) => {}
                                Err(e) => error!("compaction cycle failed, will retry: {e}"),
                            }
                        }
                    }
                }
            })
            .context(IoSnafu {
                op: "spawn compaction thread",
            })?;

        Ok(Self {
            shutdown: shutdown_tx,
            handle:   Some(handle),
        })
    }

    /// Stops the loop and waits for any in-flight cycle to finish.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) { self.shutdown(); }
}

/// Evaluates every level's trigger once and compacts the ones over budget.
/// Returns whether any work was done.
///
/// The manifest's exclusive lock is held for the duration of the cycle:
/// structural reads and flush registrations wait, memtable traffic does
/// not.
pub(crate) fn run_cycle(manifest: &Manifest) -> Result<bool> {
    let config = manifest.config().clone();
    let mut levels = manifest.levels_write()?;
    let mut compacted = false;

    // The bottom level has nowhere to push data, so its trigger is ignored.
    for number in 0..levels.len().saturating_sub(1) {
        if !levels[number].is_over_budget() {
            continue;
        }
        if number == 0 {
            compact_level_zero(manifest, &mut levels, &config)?;
        } else {
            compact_level(manifest, &mut levels, number, &config)?;
        }
        compacted = true;
    }

    Ok(compacted)
}

/// Merges all of level 0 (plus whatever level 1 overlaps) into level 1.
///
/// Level-0 segments may overlap each other, so they are all consumed at
/// once; overlapping level-1 segments join the merge so level 1 stays
/// non-overlapping. Consumed files are deleted and level 0 is cleared, all
/// as logged manifest mutations.
fn compact_level_zero(manifest: &Manifest, levels: &mut [Level], config: &Config) -> Result<()> {
    let inputs = levels[0].tables().to_vec();
    if inputs.is_empty() {
        return Ok(());
    }

    let lower: Vec<SegmentRef> = levels[1]
        .tables()
        .iter()
        .filter(|table| inputs.iter().any(|input| input.overlaps(table)))
        .cloned()
        .collect();

    // Oldest data first: level 1 holds older data than any level-0
    // segment, and within level 0 the flush timestamp orders recency.
    let mut ordered = lower.clone();
    let mut flushes = inputs.clone();
    flushes.sort_by_key(|segment| segment.created_at());
    ordered.extend(flushes);

    let merged = merge_inputs(&ordered)?;
    let outputs = split_and_build(merged, 1, levels.len(), config)?;

    for output in &outputs {
        manifest.log_add(levels, output.clone(), 1)?;
    }
    for segment in &lower {
        manifest.log_remove(levels, segment, 1)?;
        segment.remove_files()?;
    }
    let cleared = manifest.log_clear(levels, 0)?;
    for segment in &cleared {
        segment.remove_files()?;
    }

    info!(
        inputs = inputs.len(),
        rewritten = lower.len(),
        outputs = outputs.len(),
        "level 0 compacted into level 1"
    );
    Ok(())
}

/// Pushes the oldest segment of `number` one level down.
///
/// With no overlap below this is a pure relocation (rename plus manifest
/// update); otherwise the segment is merged with everything it overlaps,
/// split into bounded outputs and the consumed segments removed from both
/// levels.
fn compact_level(
    manifest: &Manifest,
    levels: &mut [Level],
    number: usize,
    config: &Config,
) -> Result<()> {
    let Some(victim) = levels[number].oldest() else {
        return Ok(());
    };
    let target = number + 1;
    let overlapping = levels[target].overlapping(&victim);

    if overlapping.is_empty() {
        manifest.log_relocate(levels, &victim, number, target)?;
        debug!(
            segment = victim.name(),
            from = number,
            to = target,
            "segment relocated without merge"
        );
        return Ok(());
    }

    // The upper level holds the newer data, so the victim goes last.
    let mut ordered = overlapping.clone();
    ordered.push(victim.clone());

    let merged = merge_inputs(&ordered)?;
    let outputs = split_and_build(merged, target, levels.len(), config)?;

    for output in &outputs {
        manifest.log_add(levels, output.clone(), target)?;
    }
    manifest.log_remove(levels, &victim, number)?;
    victim.remove_files()?;
    for segment in &overlapping {
        manifest.log_remove(levels, segment, target)?;
        segment.remove_files()?;
    }

    info!(
        level = number,
        merged = overlapping.len() + 1,
        outputs = outputs.len(),
        "level compacted"
    );
    Ok(())
}

/// Sorted merge across input segments, ordered oldest to newest.
///
/// Entries land in an ordered map keyed by key, so a later (newer) input
/// overwrites an earlier one: a tombstone from a newer segment discards an
/// older insert of the same key, and draining the map yields ascending key
/// order.
fn merge_inputs(ordered: &[SegmentRef]) -> Result<BTreeMap<Key, Entry>> {
    let mut merged = BTreeMap::new();
    for segment in ordered {
        let open = segment.open()?;
        for entry in open.entries() {
            merged.insert(entry.key.clone(), entry.clone());
        }
    }
    Ok(merged)
}

/// Partitions the merged stream into contiguous chunks of at most
/// `segment_max_entries`; each chunk becomes a segment with its own range
/// metadata and a freshly populated filter.
///
/// Tombstones are carried along so they keep shadowing older values below;
/// only when the output level is the bottom one is there nothing left to
/// shadow and they are dropped for good.
fn split_and_build(
    merged: BTreeMap<Key, Entry>,
    target_level: usize,
    level_count: usize,
    config: &Config,
) -> Result<Vec<SegmentRef>> {
    let drop_tombstones = target_level == level_count - 1;
    let dir = config.level_dir(target_level);

    let mut outputs = Vec::new();
    let mut chunk: Vec<Entry> = Vec::with_capacity(config.segment_max_entries);

    for (_, entry) in merged {
        if drop_tombstones && entry.is_tombstone() {
            continue;
        }
        chunk.push(entry);
        if chunk.len() == config.segment_max_entries {
            outputs.push(Segment::build(
                &dir,
                std::mem::take(&mut chunk),
                config.filter_false_positive_rate,
            )?);
        }
    }
    if !chunk.is_empty() {
        outputs.push(Segment::build(
            &dir,
            chunk,
            config.filter_false_positive_rate,
        )?);
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use loam_common::readable_size::ReadableSize;
    use tempfile::TempDir;

    use super::*;

    /// Level 0 triggers at ~100 bytes, level 1 at ~1000: small flushes
    /// overflow level 0 without cascading further in the same cycle.
    fn test_config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .with_max_levels(3)
            .with_level_base_max_size(ReadableSize(100))
            .with_segment_max_entries(4)
    }

    /// Every non-empty level is over budget; cycles cascade to the bottom.
    fn tiny_config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .with_max_levels(3)
            .with_level_base_max_size(ReadableSize(1))
            .with_segment_max_entries(4)
    }

    fn roomy_config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .with_max_levels(3)
            .with_level_base_max_size(ReadableSize::mb(100))
            .with_segment_max_entries(4)
    }

    fn add_l0_segment(manifest: &Manifest, config: &Config, entries: Vec<Entry>) {
        let segment = Segment::build(&config.level_dir(0), entries, 0.01).unwrap();
        manifest.add_table(segment, 0).unwrap();
        // Keep flush timestamps strictly ordered.
        std::thread::sleep(Duration::from_millis(2));
    }

    fn assert_no_overlaps(manifest: &Manifest) {
        let levels = manifest.levels_read().unwrap();
        for level in levels.iter().skip(1) {
            let tables = level.tables();
            for pair in tables.windows(2) {
                assert!(
                    !pair[0].overlaps(&pair[1]),
                    "level {} has overlapping segments {:?} and {:?}",
                    level.number(),
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn level_zero_drains_into_level_one() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        add_l0_segment(
            &manifest,
            &config,
            vec![
                Entry::insert(b"a".to_vec(), b"1".to_vec()),
                Entry::insert(b"c".to_vec(), b"1".to_vec()),
            ],
        );
        add_l0_segment(
            &manifest,
            &config,
            vec![
                Entry::insert(b"b".to_vec(), b"2".to_vec()),
                Entry::insert(b"c".to_vec(), b"2".to_vec()),
            ],
        );

        assert!(run_cycle(&manifest).unwrap());

        let stats = manifest.stats().unwrap();
        assert_eq!(stats[0].table_count, 0, "level 0 should be cleared");
        assert!(stats[1].table_count > 0, "level 1 should hold the merge");
        assert_no_overlaps(&manifest);

        // Newer segment wins the key collision on "c".
        let entry = manifest.search(b"c").unwrap().unwrap();
        assert_eq!(entry.value, b"2".to_vec());

        // The level-0 files are gone from disk.
        let remaining = std::fs::read_dir(config.level_dir(0)).unwrap().count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn merge_conserves_live_keys_exactly_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        // 10 keys spread over two overlapping level-0 segments.
        add_l0_segment(
            &manifest,
            &config,
            (0..6)
                .map(|i| Entry::insert(format!("key{i}").into_bytes(), b"v".to_vec()))
                .collect(),
        );
        add_l0_segment(
            &manifest,
            &config,
            (4..10)
                .map(|i| Entry::insert(format!("key{i}").into_bytes(), b"v".to_vec()))
                .collect(),
        );

        assert!(run_cycle(&manifest).unwrap());

        let levels = manifest.levels_read().unwrap();
        let mut seen = Vec::new();
        for table in levels[1].tables() {
            let open = table.open().unwrap();
            for entry in open.entries() {
                seen.push(entry.key.clone());
            }
        }
        drop(levels);

        let mut expected: Vec<Key> = (0..10).map(|i| format!("key{i}").into_bytes()).collect();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected, "each live key in exactly one output");
    }

    #[test]
    fn split_respects_the_segment_bound() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir); // segment_max_entries = 4
        let manifest = Manifest::open(&config).unwrap();

        add_l0_segment(
            &manifest,
            &config,
            (0..10)
                .map(|i| Entry::insert(format!("key{i}").into_bytes(), b"v".to_vec()))
                .collect(),
        );

        assert!(run_cycle(&manifest).unwrap());

        let levels = manifest.levels_read().unwrap();
        let counts: Vec<u32> = levels[1]
            .tables()
            .iter()
            .map(|t| t.entry_count())
            .collect();
        assert_eq!(counts.iter().sum::<u32>(), 10);
        assert!(counts.iter().all(|&c| c <= 4));
        assert!(counts.len() >= 3);
    }

    #[test]
    fn tombstone_shadows_older_value_through_merge() {
        let dir = TempDir::new().unwrap();
        let config = roomy_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        // Older insert and newer delete in different level-0 segments.
        add_l0_segment(
            &manifest,
            &config,
            vec![
                Entry::insert(b"doomed".to_vec(), b"v".to_vec()),
                Entry::insert(b"keeper".to_vec(), b"v".to_vec()),
            ],
        );
        add_l0_segment(
            &manifest,
            &config,
            vec![Entry::tombstone(b"doomed".to_vec())],
        );

        // Force just the level-0 compaction.
        {
            let mut levels = manifest.levels_write().unwrap();
            compact_level_zero(&manifest, &mut levels, &config).unwrap();
        }

        // Level 1 is not the bottom level, so the tombstone must survive
        // the merge and keep shadowing.
        let entry = manifest.search(b"doomed").unwrap().unwrap();
        assert!(entry.is_tombstone());
        assert!(!manifest.search(b"keeper").unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn tombstones_are_purged_when_merged_into_the_bottom_level() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        // Old value already at the bottom level.
        let bottom = Segment::build(
            &config.level_dir(2),
            vec![
                Entry::insert(b"doomed".to_vec(), b"old".to_vec()),
                Entry::insert(b"zz".to_vec(), b"z".to_vec()),
            ],
            0.01,
        )
        .unwrap();
        manifest.add_table(bottom, 2).unwrap();

        // Newer tombstone one level up, overlapping it.
        let upper = Segment::build(
            &config.level_dir(1),
            vec![
                Entry::tombstone(b"doomed".to_vec()),
                Entry::insert(b"keeper".to_vec(), b"v".to_vec()),
            ],
            0.01,
        )
        .unwrap();
        manifest.add_table(upper, 1).unwrap();

        {
            let mut levels = manifest.levels_write().unwrap();
            compact_level(&manifest, &mut levels, 1, &config).unwrap();
        }

        // The merge reached the bottom level: nothing is left to shadow,
        // so the tombstone and the value it killed are both gone.
        let levels = manifest.levels_read().unwrap();
        let mut keys = Vec::new();
        for level in levels.iter() {
            for table in level.tables() {
                let open = table.open().unwrap();
                for entry in open.entries() {
                    keys.push((entry.key.clone(), entry.is_tombstone()));
                }
            }
        }
        drop(levels);

        assert!(
            keys.iter().all(|(_, tomb)| !tomb),
            "no tombstone survives the bottom level: {keys:?}"
        );
        assert!(!keys.iter().any(|(k, _)| k == &b"doomed".to_vec()));
        assert!(keys.iter().any(|(k, _)| k == &b"keeper".to_vec()));
        assert!(manifest.search(b"doomed").unwrap().is_none());
        assert!(manifest.search(b"keeper").unwrap().is_some());
    }

    #[test]
    fn non_overlapping_victim_is_relocated() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        let segment = Segment::build(
            &config.level_dir(1),
            vec![Entry::insert(b"solo".to_vec(), b"v".to_vec())],
            0.01,
        )
        .unwrap();
        let name = segment.name().to_string();
        manifest.add_table(segment, 1).unwrap();

        {
            let mut levels = manifest.levels_write().unwrap();
            compact_level(&manifest, &mut levels, 1, &config).unwrap();
        }

        let stats = manifest.stats().unwrap();
        assert_eq!(stats[1].table_count, 0);
        assert_eq!(stats[2].table_count, 1);

        // Same file, new directory: a rename, not a rewrite.
        assert!(config.level_dir(2).join(format!("{name}.seg")).exists());
        assert_eq!(manifest.search(b"solo").unwrap().unwrap().value, b"v");
    }

    #[test]
    fn lower_level_merge_keeps_non_overlap_invariant() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(&dir);
        let manifest = Manifest::open(&config).unwrap();

        // Three separate flushes, each compacted straight down, build up
        // overlapping pressure across levels.
        for round in 0..3 {
            add_l0_segment(
                &manifest,
                &config,
                (0..8)
                    .map(|i| {
                        Entry::insert(
                            format!("key{i:02}").into_bytes(),
                            format!("round{round}").into_bytes(),
                        )
                    })
                    .collect(),
            );
            run_cycle(&manifest).unwrap();
        }

        assert_no_overlaps(&manifest);

        // Last writer wins regardless of which level the key settled in.
        for i in 0..8 {
            let entry = manifest
                .search(format!("key{i:02}").as_bytes())
                .unwrap()
                .unwrap();
            assert_eq!(entry.value, b"round2".to_vec());
        }
    }

    #[test]
    fn compactor_thread_runs_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(&dir).with_compaction_interval(Duration::from_millis(10));
        let manifest = Arc::new(Manifest::open(&config).unwrap());

        add_l0_segment(
            &manifest,
            &config,
            vec![Entry::insert(b"k".to_vec(), b"v".to_vec())],
        );

        let mut compactor = Compactor::spawn(manifest.clone(), config.compaction_interval).unwrap();

        // Wait for the timer-driven cycle to drain level 0.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = manifest.stats().unwrap();
            if stats[0].table_count == 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "compaction never drained level 0"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        compactor.shutdown();
        assert_eq!(manifest.search(b"k").unwrap().unwrap().value, b"v");
    }
}
