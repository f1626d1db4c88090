use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::assemble::{read_selection, selection_size};
use crate::core::index::{Attribute, IndexEntry, LocalIndex, VariableInfo};
use crate::de::DeserializeOwned;
use crate::header::{Footer, MetadataHeader, StreamHeader};
use crate::io::Io;
use crate::ser::Serialize;
use crate::transform::TransformRegistry;
use crate::transport::{data_file_name, FileTransport, Transport, TransportReader};
use crate::types::Mode;
use crate::{Element, Error, Result, Variable};

fn decode_error(what: &str, name: &str, e: std::io::Error) -> Error {
    Error::InvalidFormat(format!("{} of {}: {}", what, name, e))
}

fn open_read(path: &str) -> Result<FileTransport> {
    let mut file = FileTransport::new(false);
    file.open(path, Mode::Read, false)?;
    Ok(file)
}

/// Reads `length` bytes at `offset`, rejecting ranges past the end of the file
/// before allocating.
fn read_exact_at(file: &mut FileTransport, offset: u64, length: u64) -> Result<Vec<u8>> {
    let size = file.size()?;
    let len = offset
        .checked_add(length)
        .filter(|end| *end <= size)
        .and_then(|_| usize::try_from(length).ok())
        .ok_or_else(|| {
            Error::InvalidFormat(format!(
                "{} bytes at offset {} run past the end of a {} byte file",
                length, offset, size
            ))
        })?;
    let mut buf = vec![0u8; len];
    file.read(&mut buf, Some(offset))?;
    Ok(buf)
}

/// Reads the local index of one rank's data file through its footer.
fn read_local_index(file: &mut FileTransport, path: &str) -> Result<LocalIndex> {
    let size = file.size()?;
    if size < Footer::SIZE as u64 {
        return Err(Error::InvalidFormat(format!(
            "{} is too short to hold a footer",
            path
        )));
    }

    let footer_bytes = read_exact_at(file, size - Footer::SIZE as u64, Footer::SIZE as u64)?;
    let footer = Footer::from_slice(&footer_bytes).map_err(|e| decode_error("footer", path, e))?;
    let index = read_exact_at(file, footer.index_offset, footer.index_length)?;
    LocalIndex::from_slice(&index).map_err(|e| decode_error("local index", path, e))
}

/// Reads a finished stream: the aggregated metadata when it exists, otherwise the
/// footer of every rank's data file.
#[derive(Debug)]
pub struct BpReader {
    name: String,
    registry: Arc<TransformRegistry>,
    indices: Vec<LocalIndex>,
    data: Vec<Option<FileTransport>>,
    variables: BTreeMap<String, VariableInfo>,
    entries: BTreeMap<String, Vec<IndexEntry>>,
    attributes: BTreeMap<String, Attribute>,
    steps: u64,
}

impl BpReader {
    pub fn open(io: &Io, name: &str) -> Result<BpReader> {
        let indices = if Path::new(name).is_file() {
            Self::read_aggregated(name)?
        } else {
            Self::read_fragments(name)?
        };

        let mut reader = BpReader {
            name: name.to_string(),
            registry: io.registry().clone(),
            data: indices.iter().map(|_| None).collect(),
            indices,
            variables: BTreeMap::new(),
            entries: BTreeMap::new(),
            attributes: BTreeMap::new(),
            steps: 0,
        };
        reader.build_catalog();

        tracing::debug!(
            %name,
            ranks = reader.indices.len(),
            steps = reader.steps,
            variables = reader.variables.len(),
            "opened stream"
        );
        Ok(reader)
    }

    fn read_aggregated(name: &str) -> Result<Vec<LocalIndex>> {
        let mut file = open_read(name)?;
        let size = file.size()?;

        let header = {
            let mut reader = TransportReader::new(&mut file, 0)?;
            MetadataHeader::deserialize_owned(&mut reader)
                .map_err(|e| decode_error("metadata header", name, e))?
        };
        let header_len = header.to_bytes().len() as u64;

        let total = header
            .block_lengths
            .iter()
            .try_fold(0u64, |total, length| total.checked_add(*length))
            .filter(|total| {
                header_len
                    .checked_add(*total)
                    .map_or(false, |end| end <= size)
            })
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "{} announces more metadata than its {} bytes hold",
                    name, size
                ))
            })?;

        let blocks = read_exact_at(&mut file, header_len, total)?;
        file.close()?;

        let mut indices = Vec::with_capacity(header.block_lengths.len());
        let mut position = 0usize;
        for length in header.block_lengths {
            // The lengths sum to `blocks.len()`, checked above.
            let end = position + length as usize;
            indices.push(
                LocalIndex::from_slice(&blocks[position..end])
                    .map_err(|e| decode_error("local index", name, e))?,
            );
            position = end;
        }
        Ok(indices)
    }

    fn read_fragments(name: &str) -> Result<Vec<LocalIndex>> {
        let first = data_file_name(name, 0);
        let mut file = open_read(&first)?;
        let header = {
            let mut reader = TransportReader::new(&mut file, 0)?;
            StreamHeader::deserialize_owned(&mut reader)
                .map_err(|e| decode_error("stream header", &first, e))?
        };

        let mut indices = vec![read_local_index(&mut file, &first)?];
        file.close()?;

        for rank in 1..header.group_size as usize {
            let path = data_file_name(name, rank);
            let mut file = open_read(&path)?;
            indices.push(read_local_index(&mut file, &path)?);
            file.close()?;
        }
        Ok(indices)
    }

    fn build_catalog(&mut self) {
        for index in &self.indices {
            for attribute in &index.attributes {
                self.attributes
                    .entry(attribute.name.clone())
                    .or_insert_with(|| attribute.clone());
            }
            for step in &index.steps {
                self.steps = self.steps.max(step.step.saturating_add(1));
                for entry in &step.entries {
                    self.steps = self.steps.max(entry.step.saturating_add(entry.step_count));
                    self.variables
                        .entry(entry.name.clone())
                        .and_modify(|info| info.merge(entry))
                        .or_insert_with(|| VariableInfo::from_entry(entry));
                    self.entries
                        .entry(entry.name.clone())
                        .or_default()
                        .push(entry.clone());
                }
            }
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps in the stream.
    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableInfo> {
        self.variables.values()
    }

    /// A variable selecting its whole shape (or first block, for local arrays)
    /// at its first available step.
    pub fn inquire_variable(&self, name: &str) -> Option<Variable> {
        let info = self.variables.get(name)?;
        let mut variable = info.to_variable();
        // A count of one is always valid.
        let _ = variable.set_step_selection((info.first_step as usize, 1));
        Some(variable)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    fn entries_for(&self, variable: &Variable) -> Result<(std::ops::Range<u64>, Vec<IndexEntry>)> {
        let info = self
            .variables
            .get(variable.name())
            .ok_or_else(|| Error::NotFound(variable.name().to_string()))?;

        if info.element_type != variable.element_type() {
            return Err(Error::InvalidArgument(format!(
                "{} holds {}, requested as {}",
                variable.name(),
                info.element_type,
                variable.element_type()
            )));
        }

        let (start, count) = variable.step_selection();
        let steps = start
            .checked_add(count)
            .and_then(|end| u64::try_from(end).ok())
            .filter(|end| *end <= self.steps)
            .map(|end| start as u64..end)
            .ok_or_else(|| {
                Error::InvalidSelection(format!(
                    "steps {}..+{} of {} exceed the {} steps in {}",
                    start,
                    count,
                    variable.name(),
                    self.steps,
                    self.name
                ))
            })?;

        let entries = self
            .entries
            .get(variable.name())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| steps.clone().any(|s| e.covers_step(s)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok((steps, entries))
    }

    /// Bytes [`BpReader::get`] needs for the variable's current selection.
    pub fn selection_size(&self, variable: &Variable) -> Result<usize> {
        let (steps, entries) = self.entries_for(variable)?;
        Ok(selection_size(variable, steps, &entries))
    }

    fn read_block(&mut self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let rank = entry.rank as usize;
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(rank)
            .ok_or(Error::OutOfRange { index: rank, len })?;

        if slot.is_none() {
            *slot = Some(open_read(&data_file_name(&self.name, rank))?);
        }
        match slot.as_mut() {
            Some(file) => read_exact_at(file, entry.offset, entry.length),
            None => Err(Error::InvalidState("data file not open".into())),
        }
    }

    /// Fills `out` with the variable's selection over its selected steps. Each step
    /// of a global array is laid out as `count`; local arrays and values yield every
    /// rank's block in rank order.
    pub fn get(&mut self, variable: &Variable, out: &mut [u8]) -> Result<()> {
        let (steps, entries) = self.entries_for(variable)?;
        let registry = self.registry.clone();
        read_selection(&registry, variable, steps, &entries, out, |entry| {
            self.read_block(entry)
        })
    }

    pub fn get_typed<T: Element>(&mut self, variable: &Variable) -> Result<Vec<T>> {
        if T::TYPE != variable.element_type() {
            return Err(Error::InvalidArgument(format!(
                "{} holds {}, requested as {}",
                variable.name(),
                variable.element_type(),
                T::TYPE
            )));
        }
        let mut out = vec![0u8; self.selection_size(variable)?];
        self.get(variable, &mut out)?;
        Ok(T::from_bytes(&out))
    }

    pub fn close(&mut self) -> Result<()> {
        for slot in self.data.iter_mut() {
            if let Some(mut file) = slot.take() {
                file.close()?;
            }
        }
        Ok(())
    }
}
