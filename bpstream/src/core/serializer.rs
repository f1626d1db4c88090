use std::sync::Arc;

use super::buffer::SerializedBuffer;
use super::index::{Attribute, IndexEntry, LocalIndex, StepIndex};
use super::selection::{copy_region, Region};
use crate::header::{Footer, StreamHeader};
use crate::ser::Serialize;
use crate::transform::{encode_chain, TransformRegistry};
use crate::types::Dims;
use crate::{Error, Result, Variable};

/// Builds one rank's stream: `[header][data][step metadata]...[local index][footer]`.
///
/// Offsets in index entries are positions in the serialized buffer, so they are
/// absolute within a file stream and relative to the step's data region for
/// staging, which takes the buffer after every step.
#[derive(Debug)]
pub(crate) struct Serializer {
    rank: u32,
    registry: Arc<TransformRegistry>,
    buffer: SerializedBuffer,
    current_step: u64,
    /// One past the last step covered by a multi-step put in the current step.
    step_horizon: u64,
    pending: Vec<IndexEntry>,
    steps: Vec<StepIndex>,
    attributes: Vec<Attribute>,
    finished: bool,
}

/// Gathers the memory-selected sub-box out of a count-shaped buffer, one step at a time.
fn extract_memory_selection(variable: &Variable, bytes: &[u8], steps: usize) -> Vec<u8> {
    let element_size = variable.element_size();
    let count = variable.count();
    let mcount = variable.memory_count();
    let zero: Dims = vec![0; count.len()];
    let chunk = variable.payload_size();
    let selected: usize = mcount.iter().product::<usize>() * element_size;

    let mut out = vec![0u8; selected * steps];
    for step in 0..steps {
        copy_region(
            &bytes[step * chunk..(step + 1) * chunk],
            Region::new(&zero, count),
            &mut out[step * selected..(step + 1) * selected],
            Region::new(variable.memory_start(), mcount),
            None,
            element_size,
        );
    }
    out
}

impl Serializer {
    pub(crate) fn new(rank: usize, registry: Arc<TransformRegistry>, capacity: usize) -> Self {
        Serializer {
            rank: rank as u32,
            registry,
            buffer: SerializedBuffer::with_capacity(capacity),
            current_step: 0,
            step_horizon: 0,
            pending: Vec::new(),
            steps: Vec::new(),
            attributes: Vec::new(),
            finished: false,
        }
    }

    pub(crate) fn write_header(&mut self, header: &StreamHeader) {
        self.buffer.append(&header.to_bytes());
    }

    pub(crate) fn set_attributes(&mut self, attributes: Vec<Attribute>) {
        self.attributes = attributes;
    }

    #[inline]
    pub(crate) fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    #[inline]
    pub(crate) fn current_step(&self) -> u64 {
        self.current_step
    }

    #[inline]
    pub(crate) fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Validates and appends one put. `bytes` is laid out as the variable's count,
    /// repeated for each selected step.
    pub(crate) fn put(&mut self, variable: &mut Variable, bytes: &[u8]) -> Result<&IndexEntry> {
        if self.finished {
            return Err(Error::InvalidState(format!(
                "stream is finished, cannot put {}",
                variable.name()
            )));
        }

        let hint = format!("in call to put {}", variable.name());
        variable.check_dims_before_write(&hint)?;

        let (_, step_count) = variable.step_selection();
        let expected = variable.payload_size() * step_count;
        if bytes.len() != expected {
            return Err(Error::dims(
                hint,
                format!(
                    "buffer holds {} bytes, the selection needs {}",
                    bytes.len(),
                    expected
                ),
            ));
        }

        let payload = if variable.memory_count().is_empty() {
            bytes.to_vec()
        } else {
            extract_memory_selection(variable, bytes, step_count)
        };
        let payload_size = payload.len() as u64;

        let stages: Vec<_> = variable
            .transforms()
            .iter()
            .map(|info| (info.handle, info.params.clone()))
            .collect();
        let (stored, records) = encode_chain(&self.registry, &stages, payload)?;
        variable.record_transform_sizes(&records);
        variable.mark_used();

        let offset = self.buffer.append(&stored);
        let (start, count) = variable.transfer_box();

        tracing::trace!(
            name = variable.name(),
            step = self.current_step,
            offset,
            stored = stored.len(),
            "appended payload"
        );

        self.step_horizon = self
            .step_horizon
            .max(self.current_step + step_count as u64);

        self.pending.push(IndexEntry {
            name: variable.name().to_string(),
            element_type: variable.element_type(),
            shape_kind: variable.shape_kind(),
            shape: variable.shape().to_vec(),
            start,
            count,
            step: self.current_step,
            step_count: step_count as u64,
            rank: self.rank,
            offset,
            length: stored.len() as u64,
            payload_size,
            transforms: records,
        });

        match self.pending.last() {
            Some(entry) => Ok(entry),
            None => Err(Error::InvalidState("index entry vanished".into())),
        }
    }

    fn close_step_index(&mut self) -> StepIndex {
        StepIndex {
            step: self.current_step,
            entries: std::mem::take(&mut self.pending),
        }
    }

    fn next_step(&mut self) {
        self.current_step = self.step_horizon.max(self.current_step + 1);
        self.step_horizon = self.current_step;
    }

    /// Appends the metadata region of the current step and moves to the next one.
    /// An empty step is valid and still gets its region.
    pub(crate) fn advance(&mut self) {
        let index = self.close_step_index();
        self.buffer.append(&index.to_bytes());
        self.steps.push(index);
        self.next_step();
    }

    /// Closes the last step if it holds data, then appends the local index and the
    /// footer. Returns the serialized local index. Calling it again returns the same
    /// index without touching the buffer.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        if self.finished {
            return self.local_index().to_bytes();
        }

        if !self.pending.is_empty() || self.steps.is_empty() {
            self.advance();
        }

        let index = self.local_index().to_bytes();
        let index_offset = self.buffer.append(&index);
        let footer = Footer {
            index_offset,
            index_length: index.len() as u64,
        };
        self.buffer.append(&footer.to_bytes());
        self.finished = true;
        index
    }

    pub(crate) fn local_index(&self) -> LocalIndex {
        LocalIndex {
            rank: self.rank,
            attributes: self.attributes.clone(),
            steps: self.steps.clone(),
        }
    }

    /// The current step's index as it stands, leaving the step open.
    pub(crate) fn pending_step(&self) -> StepIndex {
        StepIndex {
            step: self.current_step,
            entries: self.pending.clone(),
        }
    }

    /// Hands out the current step's index and data region and moves to the next
    /// step. The buffer starts over, so offsets are relative to the returned data.
    pub(crate) fn take_step(&mut self) -> (StepIndex, Vec<u8>) {
        let index = self.close_step_index();
        let data = self.buffer.take();
        self.next_step();
        (index, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::de::DeserializeOwned;
    use crate::transform::tests::test_registry;
    use crate::types::{to_bytes, ElementType, Params};

    fn serializer() -> (Serializer, crate::transform::TransformHandle) {
        let (registry, xor, _) = test_registry();
        (Serializer::new(0, Arc::new(registry), 64), xor)
    }

    fn variable(shape: Dims, start: Dims, count: Dims) -> Variable {
        Variable::new("T", ElementType::Float32, shape, start, count, false).unwrap()
    }

    #[test]
    fn put_records_entry() {
        let (mut s, xor) = serializer();
        let mut v = variable(vec![4, 4], vec![0, 0], vec![4, 4]);
        v.add_transform(xor, Params::new());

        let entry = s.put(&mut v, &to_bytes(&[1.0f32; 16])).unwrap().clone();
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.length, 64);
        assert_eq!(entry.payload_size, 64);
        assert_eq!(entry.transforms.len(), 1);
        assert_eq!(v.transforms()[0].resulting_size, Some(64));
        assert_ne!(&s.buffer()[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn wrong_length_is_dimension_mismatch() {
        let (mut s, _) = serializer();
        let mut v = variable(vec![4, 4], vec![0, 0], vec![4, 4]);
        assert!(matches!(
            s.put(&mut v, &to_bytes(&[1.0f32; 15])),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(s.buffer().is_empty());
    }

    #[test]
    fn memory_selection_transfers_interior() {
        let (mut s, _) = serializer();
        let mut v = variable(vec![8], vec![2], vec![4]);
        v.set_memory_selection(vec![1], vec![2]).unwrap();

        let entry = s
            .put(&mut v, &to_bytes(&[0.0f32, 1.0, 2.0, 3.0]))
            .unwrap()
            .clone();
        assert_eq!(entry.start, vec![3]);
        assert_eq!(entry.count, vec![2]);
        assert_eq!(s.buffer(), to_bytes(&[1.0f32, 2.0]).as_slice());
    }

    #[test]
    fn multi_step_put_moves_counter() {
        let (mut s, _) = serializer();
        let mut v = variable(vec![2], vec![0], vec![2]);
        v.set_step_selection((0, 3)).unwrap();
        let entry = s.put(&mut v, &to_bytes(&[0.0f32; 6])).unwrap().clone();
        assert_eq!((entry.step, entry.step_count), (0, 3));
        assert_eq!(entry.step_payload_size(), 8);

        s.advance();
        assert_eq!(s.current_step(), 3);
        s.advance();
        assert_eq!(s.current_step(), 4);
    }

    #[test]
    fn finish_appends_footer() {
        let (mut s, _) = serializer();
        let mut v = variable(vec![], vec![], vec![]);
        s.put(&mut v, &to_bytes(&[2.5f32])).unwrap();
        s.advance();
        s.advance();

        let index = s.finish();
        let again = s.finish();
        assert_eq!(index, again);

        let bytes = s.buffer();
        let footer = Footer::from_slice(&bytes[bytes.len() - Footer::SIZE..]).unwrap();
        let start = footer.index_offset as usize;
        let local =
            LocalIndex::from_slice(&bytes[start..start + footer.index_length as usize]).unwrap();
        // Two advances: one step with data, one empty step.
        assert_eq!(local.steps.len(), 2);
        assert_eq!(local.steps[0].entries.len(), 1);
        assert!(local.steps[1].entries.is_empty());
        assert!(s.put(&mut v, &to_bytes(&[1.0f32])).is_err());
    }

    #[test]
    fn take_step_restarts_offsets() {
        let (mut s, _) = serializer();
        let mut v = variable(vec![], vec![], vec![]);
        s.put(&mut v, &to_bytes(&[1.0f32])).unwrap();
        let pending = s.pending_step();
        assert_eq!(pending.entries.len(), 1);
        assert_eq!(s.current_step(), 0);
        assert_eq!(s.buffer().len(), 4);

        let (index, data) = s.take_step();
        assert_eq!(index, pending);
        assert_eq!(index.step, 0);
        assert_eq!(data.len(), 4);

        let entry = s.put(&mut v, &to_bytes(&[2.0f32])).unwrap();
        assert_eq!((entry.step, entry.offset), (1, 0));
    }
}
