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

use snafu::Snafu;

/// Errors surfaced by the storage engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The key is absent from the memtable and every level.
    #[snafu(display("key not found"))]
    NotFound,

    /// A file operation failed; `op` names the operation that failed so the
    /// caller knows which write/read did not complete.
    #[snafu(display("{op}: {source}"))]
    Io {
        op:     &'static str,
        source: std::io::Error,
    },

    /// A durability log could not be decoded or re-applied during replay.
    /// Signals possible partial data loss rather than total failure; the
    /// underlying cause is preserved.
    #[snafu(display("replaying {log} log: {source}"))]
    LogReplay {
        log:    &'static str,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// A segment or filter payload failed validation.
    #[snafu(display("corrupt {what}: {reason}"))]
    Corruption {
        what:   &'static str,
        reason: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for the not-found case, which reads treat as a normal outcome.
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound) }
}
