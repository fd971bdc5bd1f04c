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
    io::{Read, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::ResultExt;
use xxhash_rust::xxh3::xxh3_128;

use crate::{
    err::{CorruptionSnafu, IoSnafu, Result},
    format::Codec,
};

/// Per-segment membership filter: answers "definitely absent" or "maybe
/// present" for a key without touching the segment file.
///
/// No false negatives; the false-positive rate is bounded by the configured
/// bits per key. Consulted on the read path before a segment is opened, so
/// a miss costs no disk I/O.
///
/// Hashing: one 128-bit xxh3 hash split into two 64-bit halves drives
/// double hashing, `h_i = h1 + i * h2 (mod num_bits)`, instead of k
/// independent hash functions.
#[derive(Debug, Clone)]
pub(crate) struct BloomFilter {
    bits:       Vec<u64>,
    num_bits:   u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `expected_keys` at the target false-positive
    /// rate: `bits_per_key = -1.44 * log2(fpr)`, `hashes = bits_per_key *
    /// ln 2`. Out-of-range inputs are clamped rather than rejected.
    pub(crate) fn with_capacity(expected_keys: usize, false_positive_rate: f64) -> Self {
        let expected = expected_keys.max(1) as f64;
        let rate = false_positive_rate.clamp(1e-6, 0.5);

        let bits_per_key = -1.44 * rate.log2();
        let num_bits = ((expected * bits_per_key).ceil() as u64).max(64);
        let num_hashes = ((bits_per_key * 2.0f64.ln()).ceil() as u32).max(1);

        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
        }
    }

    pub(crate) fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = split_hash(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// `false` means the key is definitely not in the segment.
    pub(crate) fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split_hash(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            if self.bits[(pos / 64) as usize] >> (pos % 64) & 1 == 0 {
                return false;
            }
        }
        true
    }

    pub(crate) fn clear(&mut self) { self.bits.fill(0); }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    /// Persists the filter to its side file and fsyncs it.
    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let payload = self.encode_into_vec().context(IoSnafu {
            op: "encode filter",
        })?;
        let framed = crate::format::frame(&payload);

        let mut file = std::fs::File::create(path).context(IoSnafu {
            op: "create filter file",
        })?;
        file.write_all(&framed).context(IoSnafu {
            op: "write filter file",
        })?;
        file.sync_all().context(IoSnafu {
            op: "sync filter file",
        })?;
        Ok(())
    }

    /// Restores a filter from its side file, verifying the checksum.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).context(IoSnafu {
            op: "read filter file",
        })?;

        let mut frames = crate::format::FrameReader::new(&data);
        let payload = frames
            .next_frame()
            .map_err(|e| corrupt(e.to_string()))?
            .ok_or_else(|| corrupt("empty filter file".into()))?;

        let mut cursor = payload;
        Self::decode_from(&mut cursor).map_err(|e| corrupt(e.to_string()))
    }
}

impl Codec for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.num_bits)?;
        writer.write_u32::<LittleEndian>(self.num_hashes)?;
        writer.write_u32::<LittleEndian>(self.bits.len() as u32)?;
        for word in &self.bits {
            writer.write_u64::<LittleEndian>(*word)?;
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let num_bits = reader.read_u64::<LittleEndian>()?;
        let num_hashes = reader.read_u32::<LittleEndian>()?;
        let words = reader.read_u32::<LittleEndian>()?;
        if num_bits == 0 || num_hashes == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "degenerate filter dimensions",
            ));
        }
        let mut bits = Vec::with_capacity(words as usize);
        for _ in 0..words {
            bits.push(reader.read_u64::<LittleEndian>()?);
        }
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }
}

fn split_hash(key: &[u8]) -> (u64, u64) {
    let hash = xxh3_128(key);
    (hash as u64, (hash >> 64) as u64)
}

fn corrupt(reason: String) -> crate::err::Error {
    CorruptionSnafu {
        what: "membership filter",
        reason,
    }
    .build()
}
