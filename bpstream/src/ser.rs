use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::core::index::{Attribute, IndexEntry, LocalIndex, StepIndex};
use crate::header::{Footer, MetadataHeader, StagingControl, StreamHeader, MAGIC_BYTES};
use crate::transform::TransformRecord;
use crate::types::{ElementType, ShapeKind};

pub(crate) trait Serialize {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut buf);
        buf
    }
}

impl Serialize for String {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.len() as u64)?;
        writer.write_all(self.as_bytes())
    }
}

impl Serialize for Vec<u8> {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.len() as u64)?;
        writer.write_all(self)
    }
}

impl Serialize for usize {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(*self as u64)
    }
}

impl Serialize for u64 {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(*self)
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.len() as u64)?;
        for item in self.iter() {
            item.write(writer)?;
        }
        Ok(())
    }
}

impl<K, V> Serialize for BTreeMap<K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.len() as u64)?;
        for (key, value) in self.iter() {
            key.write(writer)?;
            value.write(writer)?;
        }
        Ok(())
    }
}

impl Serialize for ElementType {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(self.id())?;
        let compound_size = match self {
            ElementType::Compound(size) => *size,
            _ => 0,
        };
        writer.write_u32::<LittleEndian>(compound_size)
    }
}

impl Serialize for ShapeKind {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(self.id())
    }
}

impl Serialize for TransformRecord {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name.write(writer)?;
        self.params.write(writer)?;
        writer.write_u64::<LittleEndian>(self.input_size)?;
        writer.write_u64::<LittleEndian>(self.output_size)
    }
}

impl Serialize for IndexEntry {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name.write(writer)?;
        self.element_type.write(writer)?;
        self.shape_kind.write(writer)?;
        self.shape.write(writer)?;
        self.start.write(writer)?;
        self.count.write(writer)?;
        writer.write_u64::<LittleEndian>(self.step)?;
        writer.write_u64::<LittleEndian>(self.step_count)?;
        writer.write_u32::<LittleEndian>(self.rank)?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        writer.write_u64::<LittleEndian>(self.length)?;
        writer.write_u64::<LittleEndian>(self.payload_size)?;
        self.transforms.write(writer)
    }
}

impl Serialize for StepIndex {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.step)?;
        self.entries.write(writer)
    }
}

impl Serialize for Attribute {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name.write(writer)?;
        self.element_type.write(writer)?;
        self.data.write(writer)
    }
}

impl Serialize for LocalIndex {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.rank)?;
        self.attributes.write(writer)?;
        self.steps.write(writer)
    }
}

impl Serialize for StreamHeader {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic_bytes)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.rank)?;
        writer.write_u32::<LittleEndian>(self.group_size)?;
        self.host_language.write(writer)?;
        self.transports.write(writer)
    }
}

impl Serialize for Footer {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.index_offset)?;
        writer.write_u64::<LittleEndian>(self.index_length)?;
        writer.write_all(MAGIC_BYTES)
    }
}

impl Serialize for MetadataHeader {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.magic_bytes)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        self.block_lengths.write(writer)
    }
}

impl Serialize for StagingControl {
    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.state.id())?;
        writer.write_u64::<LittleEndian>(self.step)?;
        writer.write_u64::<LittleEndian>(self.payload_length)
    }
}
