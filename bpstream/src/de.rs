use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::core::index::{Attribute, IndexEntry, LocalIndex, StepIndex};
use crate::header::{
    Footer, MetadataHeader, SlotState, StagingControl, StreamHeader, MAGIC_BYTES,
    METADATA_MAGIC_BYTES,
};
use crate::transform::TransformRecord;
use crate::types::{ElementType, ShapeKind};

/// Upper bound for up-front allocations driven by lengths read from a stream.
const MAX_PREALLOC: u64 = 4096;

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

pub(crate) trait DeserializeOwned {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self>
    where
        Self: Sized;

    fn from_slice(mut bytes: &[u8]) -> std::io::Result<Self>
    where
        Self: Sized,
    {
        Self::deserialize_owned(&mut bytes)
    }
}

impl DeserializeOwned for String {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u64::<LittleEndian>()?;
        let mut string = String::with_capacity(len.min(MAX_PREALLOC) as usize);
        let read = reader.by_ref().take(len).read_to_string(&mut string)?;
        if read as u64 != len {
            return Err(invalid_data("truncated string"));
        }
        Ok(string)
    }
}

impl DeserializeOwned for Vec<u8> {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u64::<LittleEndian>()?;
        let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
        reader.by_ref().take(len).read_to_end(&mut buf)?;
        if buf.len() as u64 != len {
            return Err(invalid_data("truncated byte string"));
        }
        Ok(buf)
    }
}

impl DeserializeOwned for usize {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let value = reader.read_u64::<LittleEndian>()?;
        usize::try_from(value).map_err(|_| invalid_data("dimension does not fit in usize"))
    }
}

impl DeserializeOwned for u64 {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        reader.read_u64::<LittleEndian>()
    }
}

impl<T: DeserializeOwned> DeserializeOwned for Vec<T> {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u64::<LittleEndian>()?;
        let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
        for _ in 0..len {
            buf.push(T::deserialize_owned(reader)?);
        }
        Ok(buf)
    }
}

impl<K, V> DeserializeOwned for BTreeMap<K, V>
where
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let len = reader.read_u64::<LittleEndian>()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = K::deserialize_owned(reader)?;
            let value = V::deserialize_owned(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl DeserializeOwned for ElementType {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let id = reader.read_u8()?;
        let compound_size = reader.read_u32::<LittleEndian>()?;
        ElementType::from_id(id, compound_size)
            .ok_or_else(|| invalid_data(format!("unknown element type id {:#x}", id)))
    }
}

impl DeserializeOwned for ShapeKind {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let id = reader.read_u8()?;
        ShapeKind::from_id(id).ok_or_else(|| invalid_data(format!("unknown shape kind {}", id)))
    }
}

impl DeserializeOwned for TransformRecord {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(TransformRecord {
            name: String::deserialize_owned(reader)?,
            params: BTreeMap::deserialize_owned(reader)?,
            input_size: reader.read_u64::<LittleEndian>()?,
            output_size: reader.read_u64::<LittleEndian>()?,
        })
    }
}

impl DeserializeOwned for IndexEntry {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let name = String::deserialize_owned(reader)?;
        let element_type = ElementType::deserialize_owned(reader)?;
        let shape_kind = ShapeKind::deserialize_owned(reader)?;
        let shape = Vec::deserialize_owned(reader)?;
        let start = Vec::deserialize_owned(reader)?;
        let count = Vec::deserialize_owned(reader)?;
        let step = reader.read_u64::<LittleEndian>()?;
        let step_count = reader.read_u64::<LittleEndian>()?;
        let rank = reader.read_u32::<LittleEndian>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        let length = reader.read_u64::<LittleEndian>()?;
        let payload_size = reader.read_u64::<LittleEndian>()?;
        let transforms = Vec::deserialize_owned(reader)?;

        tracing::trace!(%name, step, rank, offset, length, "deserialized IndexEntry");

        Ok(IndexEntry {
            name,
            element_type,
            shape_kind,
            shape,
            start,
            count,
            step,
            step_count,
            rank,
            offset,
            length,
            payload_size,
            transforms,
        })
    }
}

impl DeserializeOwned for StepIndex {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let step = reader.read_u64::<LittleEndian>()?;
        let entries = Vec::deserialize_owned(reader)?;
        Ok(StepIndex { step, entries })
    }
}

impl DeserializeOwned for Attribute {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Attribute {
            name: String::deserialize_owned(reader)?,
            element_type: ElementType::deserialize_owned(reader)?,
            data: Vec::deserialize_owned(reader)?,
        })
    }
}

impl DeserializeOwned for LocalIndex {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let rank = reader.read_u32::<LittleEndian>()?;
        let attributes = Vec::deserialize_owned(reader)?;
        let steps = Vec::deserialize_owned(reader)?;
        Ok(LocalIndex {
            rank,
            attributes,
            steps,
        })
    }
}

impl DeserializeOwned for StreamHeader {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut magic_bytes = [0u8; 4];
        reader.read_exact(&mut magic_bytes)?;

        if &magic_bytes != MAGIC_BYTES {
            return Err(invalid_data("magic bytes invalid"));
        }

        Ok(StreamHeader {
            magic_bytes,
            version: reader.read_u32::<LittleEndian>()?,
            rank: reader.read_u32::<LittleEndian>()?,
            group_size: reader.read_u32::<LittleEndian>()?,
            host_language: String::deserialize_owned(reader)?,
            transports: Vec::deserialize_owned(reader)?,
        })
    }
}

impl DeserializeOwned for Footer {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let index_offset = reader.read_u64::<LittleEndian>()?;
        let index_length = reader.read_u64::<LittleEndian>()?;
        let mut magic_bytes = [0u8; 4];
        reader.read_exact(&mut magic_bytes)?;

        if &magic_bytes != MAGIC_BYTES {
            return Err(invalid_data("footer magic bytes invalid"));
        }

        Ok(Footer {
            index_offset,
            index_length,
        })
    }
}

impl DeserializeOwned for MetadataHeader {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut magic_bytes = [0u8; 4];
        reader.read_exact(&mut magic_bytes)?;

        if &magic_bytes != METADATA_MAGIC_BYTES {
            return Err(invalid_data("metadata magic bytes invalid"));
        }

        Ok(MetadataHeader {
            magic_bytes,
            version: reader.read_u32::<LittleEndian>()?,
            block_lengths: Vec::deserialize_owned(reader)?,
        })
    }
}

impl DeserializeOwned for StagingControl {
    fn deserialize_owned<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        let state = reader.read_u32::<LittleEndian>()?;
        let state = SlotState::from_id(state)
            .ok_or_else(|| invalid_data(format!("unknown slot state {}", state)))?;

        Ok(StagingControl {
            magic,
            state,
            step: reader.read_u64::<LittleEndian>()?,
            payload_length: reader.read_u64::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::Serialize;
    use crate::types::Params;

    fn entry() -> IndexEntry {
        let mut params = Params::new();
        params.insert("level".into(), "3".into());
        IndexEntry {
            name: "T".into(),
            element_type: ElementType::Float32,
            shape_kind: ShapeKind::GlobalArray,
            shape: vec![4, 4],
            start: vec![0, 0],
            count: vec![4, 4],
            step: 2,
            step_count: 1,
            rank: 3,
            offset: 128,
            length: 40,
            payload_size: 64,
            transforms: vec![TransformRecord {
                name: "zstd".into(),
                params,
                input_size: 64,
                output_size: 40,
            }],
        }
    }

    #[test]
    fn local_index_decodes() {
        let index = LocalIndex {
            rank: 3,
            attributes: vec![Attribute {
                name: "units".into(),
                element_type: ElementType::Char,
                data: b"K".to_vec(),
            }],
            steps: vec![
                StepIndex {
                    step: 0,
                    entries: vec![],
                },
                StepIndex {
                    step: 2,
                    entries: vec![entry()],
                },
            ],
        };

        let bytes = index.to_bytes();
        assert_eq!(LocalIndex::from_slice(&bytes).unwrap(), index);
    }

    #[test]
    fn header_rejects_garbage() {
        let err = StreamHeader::from_slice(b"hello world, this is not a stream").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_entry_fails() {
        let bytes = entry().to_bytes();
        assert!(IndexEntry::from_slice(&bytes[..bytes.len() - 3]).is_err());
    }
}
