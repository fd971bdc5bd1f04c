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

use crate::{
    format::{Codec, Key},
    sst::table::Segment,
};

/// Durable record of one segment: everything needed to rebuild the cold
/// segment on replay (the entries themselves stay in the segment file, the
/// filter in its side file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableMeta {
    pub name:        String,
    pub first:       Key,
    pub last:        Key,
    pub size_bytes:  u64,
    pub created_at:  u64,
    pub entry_count: u32,
}

impl TableMeta {
    pub(crate) fn of(segment: &Segment) -> Self {
        Self {
            name:        segment.name().to_string(),
            first:       segment.first().to_vec(),
            last:        segment.last().to_vec(),
            size_bytes:  segment.size_bytes(),
            created_at:  segment.created_at(),
            entry_count: segment.entry_count(),
        }
    }
}

impl Codec for TableMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        write_bytes(writer, self.name.as_bytes())?;
        write_bytes(writer, &self.first)?;
        write_bytes(writer, &self.last)?;
        writer.write_u64::<LittleEndian>(self.size_bytes)?;
        writer.write_u64::<LittleEndian>(self.created_at)?;
        writer.write_u32::<LittleEndian>(self.entry_count)?;
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let name = String::from_utf8(read_bytes(reader)?).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("table name: {e}"))
        })?;
        let first = read_bytes(reader)?;
        let last = read_bytes(reader)?;
        let size_bytes = reader.read_u64::<LittleEndian>()?;
        let created_at = reader.read_u64::<LittleEndian>()?;
        let entry_count = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            name,
            first,
            last,
            size_bytes,
            created_at,
            entry_count,
        })
    }
}

/// One structural mutation of the level layout.
///
/// A closed set dispatched by `match`: adding a variant without handling it
/// everywhere fails to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ManifestEdit {
    AddTable { level: u32, table: TableMeta },
    RemoveTable { level: u32, name: String },
    ClearLevel { level: u32 },
}

const TAG_ADD_TABLE: u8 = 0;
const TAG_REMOVE_TABLE: u8 = 1;
const TAG_CLEAR_LEVEL: u8 = 2;

impl Codec for ManifestEdit {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            ManifestEdit::AddTable { level, table } => {
                writer.write_u8(TAG_ADD_TABLE)?;
                writer.write_u32::<LittleEndian>(*level)?;
                table.encode_into(writer)?;
            }
            ManifestEdit::RemoveTable { level, name } => {
                writer.write_u8(TAG_REMOVE_TABLE)?;
                writer.write_u32::<LittleEndian>(*level)?;
                write_bytes(writer, name.as_bytes())?;
            }
            ManifestEdit::ClearLevel { level } => {
                writer.write_u8(TAG_CLEAR_LEVEL)?;
                writer.write_u32::<LittleEndian>(*level)?;
            }
        }
        Ok(())
    }

    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let tag = reader.read_u8()?;
        let level = reader.read_u32::<LittleEndian>()?;
        match tag {
            TAG_ADD_TABLE => Ok(ManifestEdit::AddTable {
                level,
                table: TableMeta::decode_from(reader)?,
            }),
            TAG_REMOVE_TABLE => {
                let name = String::from_utf8(read_bytes(reader)?).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("table name: {e}"),
                    )
                })?;
                Ok(ManifestEdit::RemoveTable { level, name })
            }
            TAG_CLEAR_LEVEL => Ok(ManifestEdit::ClearLevel { level }),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid manifest edit tag: {tag}"),
            )),
        }
    }
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
    writer.write_all(bytes)
}

fn read_bytes<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()?;
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn meta(name: &str, first: &str, last: &str) -> TableMeta {
        TableMeta {
            name:        name.to_string(),
            first:       first.as_bytes().to_vec(),
            last:        last.as_bytes().to_vec(),
            size_bytes:  4096,
            created_at:  1234567890,
            entry_count: 77,
        }
    }

    #[test_case(ManifestEdit::AddTable { level: 0, table: meta("100-abc", "a", "m") }; "add table")]
    #[test_case(ManifestEdit::RemoveTable { level: 3, name: "100-abc".into() }; "remove table")]
    #[test_case(ManifestEdit::ClearLevel { level: 0 }; "clear level")]
    fn edit_codec_round_trip(edit: ManifestEdit) {
        let encoded = edit.encode_into_vec().unwrap();
        let decoded = ManifestEdit::decode_from(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn unknown_tag_is_invalid_data() {
        let mut encoded = ManifestEdit::ClearLevel { level: 1 }
            .encode_into_vec()
            .unwrap();
        encoded[0] = 0xff;
        let err = ManifestEdit::decode_from(&mut encoded.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
