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

//! An embedded, ordered key-value storage engine built on the
//! log-structured merge design.
//!
//! Writes land in an in-memory sorted table backed by a write-ahead log,
//! are flushed to immutable sorted segment files once the table fills up,
//! and are reorganized in the background by leveled compaction, which
//! bounds read amplification and reclaims the space of overwritten and
//! deleted keys.
//!
//! ```no_run
//! use loam_db::Db;
//!
//! let db = Db::open("/tmp/loam")?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, b"world".to_vec());
//! db.delete(b"hello")?;
//! db.close()?;
//! # Ok::<(), loam_db::Error>(())
//! ```

mod compaction;
mod config;
mod db;
mod err;
mod format;
mod manifest;
mod memtable;
mod sst;
mod wal;

pub use config::Config;
pub use db::{Db, DbStats};
pub use err::{Error, Result};
pub use format::{Codec, Entry, Key, Operation, Value};
pub use manifest::LevelStats;
