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
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{Receiver, Sender, bounded};
use snafu::ResultExt;
use tracing::{debug, error};

use crate::{
    err::{CorruptionSnafu, IoSnafu, LogReplaySnafu, Result},
    format::{Codec, Entry, FrameReader, frame},
};

/// Upper bound on entries queued ahead of the writer thread.
const QUEUE_CAPACITY: usize = 1024;

/// Append-only durability log for one memtable generation.
///
/// Entries are queued on a bounded channel and consumed by a dedicated
/// writer thread, which encodes `batch_size` entries into one checksummed
/// frame and fsyncs it as a unit. An encode or sync failure cannot be
/// repaired without risking silently dropped acknowledged writes, so it is
/// latched as fatal and returned from the next `append`, `sync` or `close`.
pub(crate) struct Wal {
    tx:     Sender<Command>,
    handle: Option<JoinHandle<()>>,
    failed: Arc<Mutex<Option<String>>>,
}

enum Command {
    Append(Entry),
    /// Flush the pending partial batch and fsync before acknowledging.
    Sync(Sender<Result<()>>),
    /// Truncate the log to empty, dropping any pending batch.
    Discard(Sender<Result<()>>),
    /// Flush the final (possibly short) batch and stop.
    Shutdown(Sender<Result<()>>),
}

impl Wal {
    /// Opens (or creates) the log at `path` and starts its writer thread.
    pub(crate) fn open(path: &Path, batch_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(IoSnafu { op: "open wal file" })?;

        let failed = Arc::new(Mutex::new(None));
        let (tx, rx) = bounded(QUEUE_CAPACITY);

        let writer = BatchWriter {
            file,
            batch: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            failed: failed.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || writer.run(rx))
            .context(IoSnafu { op: "spawn wal writer" })?;

        Ok(Self {
            tx,
            handle: Some(handle),
            failed,
        })
    }

    /// Queues one entry for the next batch.
    ///
    /// Blocks only when the queue is full. A previously latched writer
    /// failure is surfaced here so the caller knows durability is gone.
    pub(crate) fn append(&self, entry: Entry) -> Result<()> {
        self.check_failed()?;
        self.tx
            .send(Command::Append(entry))
            .map_err(|_| writer_gone())
            .context(IoSnafu { op: "queue wal entry" })
    }

    /// Flushes the pending partial batch and fsyncs before returning.
    pub(crate) fn sync(&self) -> Result<()> { self.round_trip(Command::Sync) }

    /// Truncates the log to empty. Only safe once the data it covers has
    /// been handed over to a durably synced segment.
    pub(crate) fn discard(&self) -> Result<()> { self.round_trip(Command::Discard) }

    /// Drains all queued entries, flushes the final batch and releases the
    /// file handle. Closing twice is a no-op.
    pub(crate) fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = self.round_trip(Command::Shutdown);
        let _ = handle.join();
        result
    }

    fn round_trip(&self, make: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        self.check_failed()?;
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(make(ack_tx))
            .map_err(|_| writer_gone())
            .context(IoSnafu { op: "queue wal command" })?;
        ack_rx
            .recv()
            .map_err(|_| writer_gone())
            .context(IoSnafu { op: "await wal writer" })?
    }

    fn check_failed(&self) -> Result<()> {
        let failed = self
            .failed
            .lock()
            .map_err(|_| std::io::Error::other("wal failure latch poisoned"))
            .context(IoSnafu { op: "check wal state" })?;
        if let Some(reason) = failed.as_ref() {
            return Err(std::io::Error::other(reason.clone())).context(IoSnafu {
                op: "write-ahead log failed",
            });
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.close();
        }
    }
}

fn writer_gone() -> std::io::Error { std::io::Error::other("wal writer thread exited") }

struct BatchWriter {
    file:       File,
    batch:      Vec<Entry>,
    batch_size: usize,
    failed:     Arc<Mutex<Option<String>>>,
}

impl BatchWriter {
    fn run(mut self, rx: Receiver<Command>) {
        for command in rx {
            match command {
                Command::Append(entry) => {
                    self.batch.push(entry);
                    if self.batch.len() >= self.batch_size {
                        if let Err(e) = self.flush_batch() {
                            self.latch(&e);
                        }
                    }
                }
                Command::Sync(ack) => {
                    let result = self.flush_batch();
                    if let Err(e) = &result {
                        self.latch(e);
                    }
                    let _ = ack.send(result.context(IoSnafu { op: "wal writer" }));
                }
                Command::Discard(ack) => {
                    let result = self.truncate();
                    if let Err(e) = &result {
                        self.latch(e);
                    }
                    let _ = ack.send(result.context(IoSnafu { op: "wal writer" }));
                }
                Command::Shutdown(ack) => {
                    let result = self.flush_batch();
                    if let Err(e) = &result {
                        self.latch(e);
                    }
                    let _ = ack.send(result.context(IoSnafu { op: "wal writer" }));
                    return;
                }
            }
        }
    }

    /// Encodes the pending entries as one frame, writes and fsyncs it.
    fn flush_batch(&mut self) -> std::io::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(self.batch.len() as u32)?;
        for entry in &self.batch {
            entry.encode_into(&mut payload)?;
        }

        self.file.write_all(&frame(&payload))?;
        self.file.sync_all()?;

        debug!(entries = self.batch.len(), "wal batch synced");
        self.batch.clear();
        Ok(())
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.batch.clear();
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn latch(&self, e: &dyn std::fmt::Display) {
        error!("wal writer failed, latching as fatal: {e}");
        if let Ok(mut failed) = self.failed.lock() {
            failed.get_or_insert_with(|| e.to_string());
        }
    }
}

/// Decodes all batches of a log file in write order.
///
/// A missing file means a fresh memtable generation and yields no entries.
/// Anything other than a clean end of file is a replay error carrying the
/// underlying cause: the log tail may hold writes that are now lost.
pub(crate) fn replay(path: &Path) -> Result<Vec<Entry>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(IoSnafu { op: "read wal file" }),
    };

    decode_batches(&data).context(LogReplaySnafu { log: "write-ahead" })
}

fn decode_batches(data: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut frames = FrameReader::new(data);
    loop {
        let payload = frames
            .next_frame()
            .map_err(|e| corrupt_batch(e.to_string()))?;
        let Some(payload) = payload else {
            return Ok(entries);
        };

        let mut cursor = payload;
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| corrupt_batch(e.to_string()))?;
        for _ in 0..count {
            let entry =
                Entry::decode_from(&mut cursor).map_err(|e| corrupt_batch(e.to_string()))?;
            entries.push(entry);
        }
    }
}

fn corrupt_batch(reason: String) -> crate::err::Error {
    CorruptionSnafu {
        what: "wal batch",
        reason,
    }
    .build()
}
