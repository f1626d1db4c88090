//! Step-at-a-time streaming between a writer and a reader that run concurrently.
//!
//! The writer publishes one step into a slot, the reader consumes it and releases
//! the slot. [`StepSource`] is the reader's view of the slot; [`ShmStepSource`]
//! implements it over a shared-memory segment written by [`StagingWriter`].

use std::time::Duration;

use crate::core::index::{Attribute, LocalIndex, StepIndex};
use crate::de::DeserializeOwned;
use crate::ser::Serialize;
use crate::types::StepMode;
use crate::{Error, Result};

mod reader;
mod shm;
mod writer;

pub use reader::{GetTicket, ReaderState, StagingReader};
pub use shm::ShmStepSource;
pub use writer::StagingWriter;

/// Everything the reader needs for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepBlock {
    pub index: StepIndex,
    pub attributes: Vec<Attribute>,
    /// Data region; index entry offsets are relative to its start.
    pub data: Vec<u8>,
}

impl StepBlock {
    #[inline]
    pub fn step(&self) -> u64 {
        self.index.step
    }

    /// `[metadata length u64][metadata][data]`
    pub(crate) fn encode(&self, rank: usize) -> Vec<u8> {
        encode_payload(rank, &self.index, &self.attributes, &self.data)
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<StepBlock> {
        let invalid = |what: &str| Error::InvalidFormat(format!("staging payload: {}", what));

        let len_bytes: [u8; 8] = payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| invalid("missing metadata length"))?;
        let metadata_end = usize::try_from(u64::from_le_bytes(len_bytes))
            .ok()
            .and_then(|len| len.checked_add(8))
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| invalid("metadata runs past the payload"))?;
        let metadata = &payload[8..metadata_end];

        let mut local = LocalIndex::from_slice(metadata).map_err(|e| invalid(&e.to_string()))?;
        let index = match local.steps.pop() {
            Some(index) if local.steps.is_empty() => index,
            _ => return Err(invalid("expected exactly one step")),
        };

        Ok(StepBlock {
            index,
            attributes: local.attributes,
            data: payload[metadata_end..].to_vec(),
        })
    }
}

/// Lays out one step the way [`StepBlock::decode`] reads it back.
pub(crate) fn encode_payload(
    rank: usize,
    index: &StepIndex,
    attributes: &[Attribute],
    data: &[u8],
) -> Vec<u8> {
    let metadata = LocalIndex {
        rank: rank as u32,
        attributes: attributes.to_vec(),
        steps: vec![index.clone()],
    }
    .to_bytes();

    let mut payload = Vec::with_capacity(8 + metadata.len() + data.len());
    payload.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
    payload.extend_from_slice(&metadata);
    payload.extend_from_slice(data);
    payload
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    Ready(StepBlock),
    End,
    Timeout,
}

/// Where a [`StagingReader`] gets its steps from.
pub trait StepSource: std::fmt::Debug + Send {
    fn open(&mut self) -> Result<()>;

    /// Waits for the next step, at most `timeout` when given.
    fn poll_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepEvent>;

    /// Hands the slot of `step` back to the writer.
    fn release_step(&mut self, step: u64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::IndexEntry;
    use crate::types::{ElementType, ShapeKind};

    #[test]
    fn payload_layout() {
        let block = StepBlock {
            index: StepIndex {
                step: 4,
                entries: vec![IndexEntry {
                    name: "x".into(),
                    element_type: ElementType::UInt8,
                    shape_kind: ShapeKind::LocalArray,
                    shape: vec![],
                    start: vec![],
                    count: vec![3],
                    step: 4,
                    step_count: 1,
                    rank: 0,
                    offset: 0,
                    length: 3,
                    payload_size: 3,
                    transforms: vec![],
                }],
            },
            attributes: vec![],
            data: vec![1, 2, 3],
        };

        let payload = block.encode(0);
        let metadata_len = u64::from_le_bytes(payload[..8].try_into().unwrap()) as usize;
        assert_eq!(&payload[8 + metadata_len..], &[1, 2, 3]);
        assert_eq!(StepBlock::decode(&payload).unwrap(), block);
        assert!(StepBlock::decode(&payload[..4]).is_err());
    }
}
