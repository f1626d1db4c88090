use std::thread;
use std::time::{Duration, Instant};

use super::shm::{check_shm, read_control, write_control};
use super::encode_payload;
use crate::config::EngineConfig;
use crate::core::serializer::Serializer;
use crate::header::{SlotState, StagingControl};
use crate::io::Io;
use crate::transport::TransportManager;
use crate::types::{to_bytes, Mode, StepStatus};
use crate::{Element, Error, Result, Variable};

/// Publishes steps into a shared-memory segment, one at a time.
#[derive(Debug)]
pub struct StagingWriter {
    name: String,
    config: EngineConfig,
    manager: TransportManager,
    serializer: Serializer,
    step_active: bool,
    closed: bool,
}

impl StagingWriter {
    /// Creates the segment from the context's first transport, which must be `shm`
    /// with a capacity.
    pub fn open(io: &Io, name: &str) -> Result<StagingWriter> {
        let config = io.engine_config()?;
        let transports = io.transport_configs()?;
        let transport = transports
            .first()
            .ok_or_else(|| Error::InvalidArgument(format!("no transport for {}", name)))?;
        check_shm(transport, name)?;

        let mut manager = TransportManager::new(0);
        manager.open_files(
            &[name.to_string()],
            Mode::Write,
            std::slice::from_ref(transport),
            config.profile,
        )?;
        write_control(&mut manager, StagingControl::new(SlotState::Empty, 0, 0))?;

        let mut serializer = Serializer::new(0, io.registry().clone(), config.initial_buffer_size);
        serializer.set_attributes(io.attributes().to_vec());

        if config.trace_calls() {
            tracing::debug!(%name, "StagingWriter::open");
        }

        Ok(StagingWriter {
            name: name.to_string(),
            config,
            manager,
            serializer,
            step_active: false,
            closed: false,
        })
    }

    #[inline]
    pub fn current_step(&self) -> u64 {
        self.serializer.current_step()
    }

    /// Waits until the reader has released the slot or detached. Returns the slot
    /// state it found, or `None` on timeout.
    fn wait_for_slot(&mut self, timeout: Option<Duration>) -> Result<Option<SlotState>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match read_control(&mut self.manager)? {
                Some(control) if control.state == SlotState::Ready => {}
                Some(control) => return Ok(Some(control.state)),
                None => return Ok(Some(SlotState::Empty)),
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(None),
                _ => thread::sleep(self.config.step_wait),
            }
        }
    }

    fn reader_detached(&mut self) -> Result<bool> {
        Ok(matches!(
            read_control(&mut self.manager)?,
            Some(control) if control.state == SlotState::Detached
        ))
    }

    /// Drops the active step once nobody will read it.
    fn discard_step(&mut self) {
        let (index, data) = self.serializer.take_step();
        self.step_active = false;
        tracing::warn!(
            name = %self.name,
            step = index.step,
            bytes = data.len(),
            "reader detached, step discarded"
        );
    }

    fn check_open(&self, call: &str) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidState(format!(
                "{} is closed, in call to {}",
                self.name, call
            )));
        }
        Ok(())
    }

    pub fn begin_step(&mut self, timeout: Option<Duration>) -> Result<StepStatus> {
        self.check_open("begin_step")?;
        if self.step_active {
            return Err(Error::InvalidState(format!(
                "step {} of {} is still active, in call to begin_step",
                self.current_step(),
                self.name
            )));
        }

        match self.wait_for_slot(timeout)? {
            None => return Ok(StepStatus::NotReady),
            Some(SlotState::Detached) => return Ok(StepStatus::EndOfStream),
            Some(_) => {}
        }

        self.step_active = true;
        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, step = self.current_step(), "StagingWriter::begin_step");
        }
        Ok(StepStatus::Ok)
    }

    fn check_step(&self, call: &str) -> Result<()> {
        self.check_open(call)?;
        if !self.step_active {
            return Err(Error::InvalidState(format!(
                "no active step on {}, in call to {}",
                self.name, call
            )));
        }
        Ok(())
    }

    pub fn put<T: Element>(&mut self, variable: &mut Variable, values: &[T]) -> Result<()> {
        if T::TYPE != variable.element_type() {
            return Err(Error::InvalidArgument(format!(
                "variable {} holds {}, values are {}",
                variable.name(),
                variable.element_type(),
                T::TYPE
            )));
        }
        self.put_bytes(variable, &to_bytes(values))
    }

    pub fn put_bytes(&mut self, variable: &mut Variable, bytes: &[u8]) -> Result<()> {
        self.check_step("put")?;
        self.serializer.put(variable, bytes)?;
        Ok(())
    }

    /// Writes the step's payload, then flips the slot to ready. The step stays
    /// active, data included, when the write fails.
    pub fn end_step(&mut self) -> Result<()> {
        self.check_step("end_step")?;

        if self.reader_detached()? {
            self.discard_step();
            return Err(Error::InvalidState(format!(
                "reader of {} detached, in call to end_step",
                self.name
            )));
        }

        let index = self.serializer.pending_step();
        let step = index.step;
        let payload = encode_payload(
            0,
            &index,
            self.serializer.attributes(),
            self.serializer.buffer(),
        );

        self.manager
            .write_at(&payload, StagingControl::SIZE as u64, Some(0))?;
        write_control(
            &mut self.manager,
            StagingControl::new(SlotState::Ready, step, payload.len() as u64),
        )?;
        self.serializer.take_step();
        self.step_active = false;

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, step, bytes = payload.len(), "StagingWriter::end_step");
        }
        Ok(())
    }

    /// Ends an active step, waits for the reader to release the last one and marks
    /// the stream ended. Closing twice does nothing.
    pub fn close(&mut self) -> Result<()> {
        self.close_within(None).map(|_| ())
    }

    /// Like [`StagingWriter::close`], but gives up after `timeout` when the reader
    /// still holds the last step. The writer then stays open and returns
    /// [`StepStatus::NotReady`]; calling again resumes the wait.
    pub fn close_within(&mut self, timeout: Option<Duration>) -> Result<StepStatus> {
        if self.closed {
            return Ok(StepStatus::Ok);
        }
        if self.step_active {
            if self.reader_detached()? {
                self.discard_step();
            } else {
                self.end_step()?;
            }
        }

        match self.wait_for_slot(timeout)? {
            None => return Ok(StepStatus::NotReady),
            Some(SlotState::Detached) => {}
            Some(_) => {
                let step = self.current_step();
                write_control(&mut self.manager, StagingControl::new(SlotState::End, step, 0))?;
            }
        }
        self.manager.close_files(None)?;
        self.closed = true;

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, "StagingWriter::close");
        }
        Ok(StepStatus::Ok)
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(name = %self.name, "StagingWriter dropped without calling close()");
        }
    }
}
