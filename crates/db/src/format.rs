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

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Trait to serialize stuff
pub trait Codec {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> std::io::Result<Vec<u8>> {
        let mut v = vec![];
        self.encode_into(&mut v)?;
        Ok(v)
    }

    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self>
    where
        Self: Sized;
}

/// User keys and values are opaque byte strings, ordered lexicographically.
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// The kind of mutation an [`Entry`] records.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Upsert of a key/value pair.
    Insert = 0,

    /// Tombstone. Logically removes the key; stored and merged like any
    /// other entry so an older value cannot resurrect once the delete has
    /// moved down the tree.
    Delete = 1,
}

impl Operation {
    fn from_u8(value: u8) -> std::io::Result<Self> {
        match value {
            0 => Ok(Operation::Insert),
            1 => Ok(Operation::Delete),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid operation tag: {value}"),
            )),
        }
    }
}

/// A single mutation record: the unit stored in the WAL, the memtable and
/// segment files.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub key:   Key,
    pub value: Value,
    pub op:    Operation,
}

impl Entry {
    pub fn insert<K: Into<Key>, V: Into<Value>>(key: K, value: V) -> Self {
        Self {
            key:   key.into(),
            value: value.into(),
            op:    Operation::Insert,
        }
    }

    /// Tombstones carry an empty value.
    pub fn tombstone<K: Into<Key>>(key: K) -> Self {
        Self {
            key:   key.into(),
            value: Value::new(),
            op:    Operation::Delete,
        }
    }

    pub fn is_tombstone(&self) -> bool { self.op == Operation::Delete }

    /// Returns the serialized size of this entry in bytes.
    /// This includes:
    /// - 1 byte for the operation tag,
    /// - 8 bytes for the key length (u64) plus the key itself,
    /// - 8 bytes for the value length (u64) plus the value itself.
    pub fn encoded_size(&self) -> u64 { 1 + 8 + self.key.len() as u64 + 8 + self.value.len() as u64 }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value),
            match self.op {
                Operation::Insert => "I",
                Operation::Delete => "T",
            },
        )
    }
}

impl Codec for Entry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(self.op as u8)?;
        writer.write_u64::<LittleEndian>(self.key.len() as u64)?;
        writer.write_all(&self.key)?;
        writer.write_u64::<LittleEndian>(self.value.len() as u64)?;
        writer.write_all(&self.value)?;
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let op = Operation::from_u8(reader.read_u8()?)?;
        let key_len = reader.read_u64::<LittleEndian>()?;
        let mut key = vec![0; key_len as usize];
        reader.read_exact(&mut key)?;
        let value_len = reader.read_u64::<LittleEndian>()?;
        let mut value = vec![0; value_len as usize];
        reader.read_exact(&mut value)?;
        Ok(Self { key, value, op })
    }
}

/// Builds a checksummed frame, the unit of the append-only logs (WAL and
/// manifest log).
///
/// ```text
///  +--------------+-----------+----------------+
///  | len (4, LE)  | crc32 (4) | payload (len)  |
///  +--------------+-----------+----------------+
/// ```
///
/// The crc covers the payload only. A frame that fails its checksum or is
/// cut short means the tail of the log was a partial write.
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Iterates the frames of an append-only log buffer.
pub(crate) struct FrameReader<'a> {
    data:   &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self { Self { data, offset: 0 } }

    /// Returns the next payload, `None` on a clean end of log, or an
    /// `InvalidData` error on a truncated or corrupt frame.
    pub(crate) fn next_frame(&mut self) -> std::io::Result<Option<&'a [u8]>> {
        if self.offset == self.data.len() {
            return Ok(None);
        }
        let remaining = &self.data[self.offset..];
        if remaining.len() < 8 {
            return Err(invalid_data("truncated frame header"));
        }
        let len = u32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(remaining[4..8].try_into().unwrap());
        if remaining.len() < 8 + len {
            return Err(invalid_data("truncated frame payload"));
        }
        let payload = &remaining[8..8 + len];
        if crc32fast::hash(payload) != crc {
            return Err(invalid_data("frame checksum mismatch"));
        }
        self.offset += 8 + len;
        Ok(Some(payload))
    }
}

fn invalid_data(reason: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason.to_string())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Entry::insert(b"hello".to_vec(), b"world".to_vec()); "insert entry")]
    #[test_case(Entry::tombstone(b"gone".to_vec()); "tombstone entry")]
    #[test_case(Entry::insert(Vec::new(), Vec::new()); "empty key and value")]
    fn entry_codec(entry: Entry) {
        let encoded = entry.encode_into_vec().unwrap();
        assert_eq!(encoded.len() as u64, entry.encoded_size());

        let decoded = Entry::decode_from(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn entry_rejects_unknown_operation() {
        let mut encoded = Entry::insert(b"k".to_vec(), b"v".to_vec())
            .encode_into_vec()
            .unwrap();
        encoded[0] = 7;
        let err = Entry::decode_from(&mut encoded.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn frame_round_trip() {
        let mut log = Vec::new();
        log.extend_from_slice(&frame(b"first"));
        log.extend_from_slice(&frame(b"second"));

        let mut reader = FrameReader::new(&log);
        assert_eq!(reader.next_frame().unwrap(), Some(&b"first"[..]));
        assert_eq!(reader.next_frame().unwrap(), Some(&b"second"[..]));
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn frame_detects_corruption() {
        let mut log = frame(b"payload");
        let last = log.len() - 1;
        log[last] ^= 0xff;

        let mut reader = FrameReader::new(&log);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn frame_detects_truncation() {
        let log = frame(b"payload");
        let mut reader = FrameReader::new(&log[..log.len() - 2]);
        assert!(reader.next_frame().is_err());
    }
}
