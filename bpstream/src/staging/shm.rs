use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{StepBlock, StepEvent, StepSource};
use crate::config::TransportConfig;
use crate::de::DeserializeOwned;
use crate::header::{SlotState, StagingControl, STAGING_MAGIC};
use crate::ser::Serialize;
use crate::transport::{TransportKind, TransportManager};
use crate::types::{Mode, StepMode};
use crate::{Error, Result};

/// Reads the control block; `None` while the segment holds no valid one yet.
pub(crate) fn read_control(manager: &mut TransportManager) -> Result<Option<StagingControl>> {
    let mut bytes = [0u8; StagingControl::SIZE];
    manager.read_at(&mut bytes, 0, 0)?;
    fence(Ordering::Acquire);
    match StagingControl::from_slice(&bytes) {
        Ok(control) if control.magic == STAGING_MAGIC => Ok(Some(control)),
        _ => Ok(None),
    }
}

/// Publishes the control block after everything written before it. Step and
/// length land before magic and state, so a reader that sees a new state also
/// sees the matching length on its next read.
pub(crate) fn write_control(manager: &mut TransportManager, control: StagingControl) -> Result<()> {
    let bytes = control.to_bytes();
    fence(Ordering::Release);
    manager.write_at(&bytes[8..], 8, Some(0))?;
    fence(Ordering::Release);
    manager.write_at(&bytes[..8], 0, Some(0))
}

pub(crate) fn check_shm(config: &TransportConfig, name: &str) -> Result<()> {
    if config.kind != TransportKind::SharedMemory {
        return Err(Error::InvalidArgument(format!(
            "staging stream {} needs a shared memory transport, got {}",
            name, config.kind
        )));
    }
    Ok(())
}

/// Consumes the steps a [`super::StagingWriter`] publishes into a shared-memory segment.
#[derive(Debug)]
pub struct ShmStepSource {
    name: String,
    config: TransportConfig,
    manager: TransportManager,
    wait: Duration,
}

impl ShmStepSource {
    pub fn new(name: &str, config: TransportConfig, wait: Duration) -> Result<Self> {
        check_shm(&config, name)?;
        Ok(ShmStepSource {
            name: name.to_string(),
            config,
            manager: TransportManager::new(0),
            wait,
        })
    }

    fn read_payload(&mut self, length: u64) -> Result<StepBlock> {
        let capacity = self.manager.size(0)?;
        let len = length
            .checked_add(StagingControl::SIZE as u64)
            .filter(|end| *end <= capacity)
            .and_then(|_| usize::try_from(length).ok())
            .ok_or_else(|| {
                Error::InvalidFormat(format!(
                    "staging payload of {} bytes does not fit segment {} of {} bytes",
                    length, self.name, capacity
                ))
            })?;
        let mut payload = vec![0u8; len];
        self.manager
            .read_at(&mut payload, StagingControl::SIZE as u64, 0)?;
        StepBlock::decode(&payload)
    }
}

impl StepSource for ShmStepSource {
    fn open(&mut self) -> Result<()> {
        self.manager.open_files(
            &[self.name.clone()],
            Mode::Append,
            std::slice::from_ref(&self.config),
            false,
        )
    }

    /// A single slot holds at most one step, so both step modes take whatever the
    /// writer published last.
    fn poll_step(&mut self, _mode: StepMode, timeout: Option<Duration>) -> Result<StepEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(control) = read_control(&mut self.manager)? {
                match control.state {
                    SlotState::Ready => {
                        let control = read_control(&mut self.manager)?.unwrap_or(control);
                        let mut block = self.read_payload(control.payload_length)?;
                        block.index.step = control.step;
                        return Ok(StepEvent::Ready(block));
                    }
                    SlotState::End | SlotState::Detached => return Ok(StepEvent::End),
                    SlotState::Empty => {}
                }
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(StepEvent::Timeout),
                _ => thread::sleep(self.wait),
            }
        }
    }

    fn release_step(&mut self, step: u64) -> Result<()> {
        write_control(
            &mut self.manager,
            StagingControl::new(SlotState::Empty, step, 0),
        )
    }

    /// Tells the writer no more steps will be taken, then detaches.
    fn close(&mut self) -> Result<()> {
        if !self.manager.all_transports_closed() {
            let step = read_control(&mut self.manager)?.map_or(0, |control| control.step);
            write_control(
                &mut self.manager,
                StagingControl::new(SlotState::Detached, step, 0),
            )?;
        }
        self.manager.close_files(None)
    }
}
