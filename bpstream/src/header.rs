// Make some attempt to not accidentally load plain text files,
// and also make it break almost immediately in any UTF-8 compliant text parser.
pub(crate) const MAGIC_BYTES: &[u8; 4] = b"\xffBPS";
pub(crate) const METADATA_MAGIC_BYTES: &[u8; 4] = b"\xffBPM";
pub(crate) const STAGING_MAGIC: u32 = u32::from_le_bytes(*b"\xffBPQ");

pub(crate) const VERSION: u32 = 1;

/// Process-group descriptor written once at the start of every rank's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamHeader {
    pub(crate) magic_bytes: [u8; 4],
    pub(crate) version: u32,
    pub(crate) rank: u32,
    pub(crate) group_size: u32,
    pub(crate) host_language: String,
    pub(crate) transports: Vec<String>,
}

impl StreamHeader {
    pub(crate) fn new(
        rank: usize,
        group_size: usize,
        host_language: &str,
        transports: Vec<String>,
    ) -> StreamHeader {
        StreamHeader {
            magic_bytes: *MAGIC_BYTES,
            version: VERSION,
            rank: rank as u32,
            group_size: group_size as u32,
            host_language: host_language.to_string(),
            transports,
        }
    }
}

/// Fixed-size trailer locating a rank's local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footer {
    pub(crate) index_offset: u64,
    pub(crate) index_length: u64,
}

impl Footer {
    pub(crate) const SIZE: usize = 8 + 8 + 4;
}

/// Header of the aggregated metadata file, followed by one length per rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetadataHeader {
    pub(crate) magic_bytes: [u8; 4],
    pub(crate) version: u32,
    pub(crate) block_lengths: Vec<u64>,
}

/// Control block at the start of a staging segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StagingControl {
    pub(crate) magic: u32,
    pub(crate) state: SlotState,
    pub(crate) step: u64,
    pub(crate) payload_length: u64,
}

impl StagingControl {
    pub(crate) const SIZE: usize = 4 + 4 + 8 + 8;

    pub(crate) fn new(state: SlotState, step: u64, payload_length: u64) -> Self {
        StagingControl {
            magic: STAGING_MAGIC,
            state,
            step,
            payload_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Empty,
    Ready,
    End,
    /// The reader closed and takes no more steps.
    Detached,
}

impl SlotState {
    pub(crate) fn id(self) -> u32 {
        match self {
            SlotState::Empty => 0,
            SlotState::Ready => 1,
            SlotState::End => 2,
            SlotState::Detached => 3,
        }
    }

    pub(crate) fn from_id(id: u32) -> Option<SlotState> {
        Some(match id {
            0 => SlotState::Empty,
            1 => SlotState::Ready,
            2 => SlotState::End,
            3 => SlotState::Detached,
            _ => return None,
        })
    }
}
