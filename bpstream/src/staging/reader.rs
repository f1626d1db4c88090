use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::{ShmStepSource, StepBlock, StepEvent, StepSource};
use crate::config::EngineConfig;
use crate::core::assemble::{read_selection, selection_size};
use crate::core::index::{Attribute, IndexEntry, VariableInfo};
use crate::io::Io;
use crate::transform::TransformRegistry;
use crate::types::{StepMode, StepStatus};
use crate::{Element, Error, Result, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Unopened,
    Ready,
    AwaitingStep,
    StepActive,
    EndOfStream,
    Closed,
}

/// Claim on the result of a deferred get, redeemed with [`StagingReader::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GetTicket(u64);

/// Reads a stream one step at a time while its writer is still running.
#[derive(Debug)]
pub struct StagingReader {
    name: String,
    config: EngineConfig,
    registry: Arc<TransformRegistry>,
    source: Box<dyn StepSource>,
    state: ReaderState,
    current_step: Option<u64>,
    block: Option<StepBlock>,
    variables: BTreeMap<String, VariableInfo>,
    attributes: BTreeMap<String, Attribute>,
    pending: Vec<(GetTicket, Variable)>,
    completed: HashMap<GetTicket, Vec<u8>>,
    next_ticket: u64,
}

impl StagingReader {
    /// Wraps `source` without opening it.
    pub fn new(io: &Io, name: &str, source: Box<dyn StepSource>) -> Result<StagingReader> {
        Ok(StagingReader {
            name: name.to_string(),
            config: io.engine_config()?,
            registry: io.registry().clone(),
            source,
            state: ReaderState::Unopened,
            current_step: None,
            block: None,
            variables: BTreeMap::new(),
            attributes: BTreeMap::new(),
            pending: Vec::new(),
            completed: HashMap::new(),
            next_ticket: 0,
        })
    }

    /// Attaches to the segment a [`super::StagingWriter`] created under `name`.
    pub fn open_shm(io: &Io, name: &str) -> Result<StagingReader> {
        let config = io.engine_config()?;
        let transport = io
            .transport_configs()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("no transport for {}", name)))?;
        let source = ShmStepSource::new(name, transport, config.step_wait)?;

        let mut reader = StagingReader::new(io, name, Box::new(source))?;
        reader.open()?;
        Ok(reader)
    }

    pub fn open(&mut self) -> Result<()> {
        if self.state != ReaderState::Unopened {
            return Err(Error::InvalidState(format!(
                "{} is already open, in call to open",
                self.name
            )));
        }
        self.source.open()?;
        self.state = ReaderState::Ready;

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, "StagingReader::open");
        }
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// The step being read, if any step was ever begun.
    #[inline]
    pub fn current_step(&self) -> Option<u64> {
        self.current_step
    }

    /// Waits for the next step. The catalog is populated before `Ok` is returned; the
    /// current step only changes on `Ok`.
    pub fn begin_step(&mut self, mode: StepMode, timeout: Option<Duration>) -> Result<StepStatus> {
        match self.state {
            ReaderState::Ready | ReaderState::AwaitingStep => {}
            ReaderState::StepActive => {
                return Err(Error::InvalidState(format!(
                    "step {:?} of {} is still active, in call to begin_step",
                    self.current_step, self.name
                )))
            }
            ReaderState::EndOfStream => {
                return Err(Error::InvalidState(format!(
                    "{} already reached the end of the stream, in call to begin_step",
                    self.name
                )))
            }
            ReaderState::Unopened | ReaderState::Closed => {
                return Err(Error::InvalidState(format!(
                    "{} is not open, in call to begin_step",
                    self.name
                )))
            }
        }

        let status = match self.source.poll_step(mode, timeout)? {
            StepEvent::Ready(block) => {
                self.load_catalog(&block);
                self.current_step = Some(block.step());
                self.block = Some(block);
                self.state = ReaderState::StepActive;
                StepStatus::Ok
            }
            StepEvent::End => {
                self.state = ReaderState::EndOfStream;
                StepStatus::EndOfStream
            }
            StepEvent::Timeout => {
                self.state = ReaderState::AwaitingStep;
                StepStatus::NotReady
            }
        };

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, step = ?self.current_step, ?status, "StagingReader::begin_step");
        }
        Ok(status)
    }

    fn load_catalog(&mut self, block: &StepBlock) {
        self.variables.clear();
        for entry in &block.index.entries {
            self.variables
                .entry(entry.name.clone())
                .and_modify(|info| info.merge(entry))
                .or_insert_with(|| VariableInfo::from_entry(entry));
        }
        for attribute in &block.attributes {
            self.attributes
                .entry(attribute.name.clone())
                .or_insert_with(|| attribute.clone());
        }
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableInfo> {
        self.variables.values()
    }

    /// The variable as published in the current step, selecting all of it.
    pub fn inquire_variable(&self, name: &str) -> Option<Variable> {
        if self.state != ReaderState::StepActive {
            return None;
        }
        self.variables.get(name).map(|info| info.to_variable())
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    fn check_step(&self, call: &str) -> Result<()> {
        if self.state != ReaderState::StepActive {
            return Err(Error::InvalidState(format!(
                "no active step on {}, in call to {}",
                self.name, call
            )));
        }
        Ok(())
    }

    fn check_variable(&self, variable: &Variable) -> Result<()> {
        match self.variables.get(variable.name()) {
            None => Err(Error::NotFound(format!(
                "{} in step {:?} of {}",
                variable.name(),
                self.current_step,
                self.name
            ))),
            Some(info) if info.element_type != variable.element_type() => {
                Err(Error::InvalidArgument(format!(
                    "{} holds {}, requested as {}",
                    variable.name(),
                    info.element_type,
                    variable.element_type()
                )))
            }
            Some(_) => Ok(()),
        }
    }

    fn step_entries(&self, variable: &Variable) -> (std::ops::Range<u64>, Vec<IndexEntry>) {
        let step = self.current_step.unwrap_or(0);
        let entries = self
            .block
            .as_ref()
            .map(|block| {
                block
                    .index
                    .entries
                    .iter()
                    .filter(|e| e.name == variable.name())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        (step..step.saturating_add(1), entries)
    }

    /// Bytes a get of `variable` produces in the current step.
    pub fn selection_size(&self, variable: &Variable) -> Result<usize> {
        self.check_step("selection_size")?;
        self.check_variable(variable)?;
        let (steps, entries) = self.step_entries(variable);
        Ok(selection_size(variable, steps, &entries))
    }

    fn read_into(&self, variable: &Variable, out: &mut [u8]) -> Result<()> {
        let (steps, entries) = self.step_entries(variable);
        let data = match self.block.as_ref() {
            Some(block) => &block.data,
            None => return Err(Error::InvalidState("step data missing".into())),
        };

        read_selection(&self.registry, variable, steps, &entries, out, |entry| {
            usize::try_from(entry.offset)
                .ok()
                .zip(usize::try_from(entry.length).ok())
                .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                .and_then(|range| data.get(range))
                .map(|bytes| bytes.to_vec())
                .ok_or_else(|| {
                    Error::InvalidFormat(format!("block of {} outside step data", entry.name))
                })
        })
    }

    /// Reads the variable's selection from the current step into `out` right away.
    pub fn get_sync(&mut self, variable: &Variable, out: &mut [u8]) -> Result<()> {
        self.check_step("get_sync")?;
        self.check_variable(variable)?;
        self.read_into(variable, out)?;

        if self.config.trace_calls() {
            tracing::debug!(name = variable.name(), bytes = out.len(), "StagingReader::get_sync");
        }
        Ok(())
    }

    pub fn get<T: Element>(&mut self, variable: &Variable) -> Result<Vec<T>> {
        let mut out = vec![0u8; self.selection_size(variable)?];
        self.get_sync(variable, &mut out)?;
        Ok(T::from_bytes(&out))
    }

    /// Queues a get for [`StagingReader::perform_gets`] or the next `end_step`.
    /// Unknown variables fail here, not when the queue runs.
    pub fn get_deferred(&mut self, variable: &Variable) -> Result<GetTicket> {
        self.check_step("get_deferred")?;
        self.check_variable(variable)?;

        let ticket = GetTicket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.push((ticket, variable.clone()));
        Ok(ticket)
    }

    pub fn perform_gets(&mut self) -> Result<()> {
        self.check_step("perform_gets")?;

        for (ticket, variable) in std::mem::take(&mut self.pending) {
            let (steps, entries) = self.step_entries(&variable);
            let mut out = vec![0u8; selection_size(&variable, steps, &entries)];
            self.read_into(&variable, &mut out)?;
            self.completed.insert(ticket, out);
        }
        Ok(())
    }

    /// Result of a deferred get, once performed.
    pub fn take(&mut self, ticket: GetTicket) -> Option<Vec<u8>> {
        self.completed.remove(&ticket)
    }

    /// Performs outstanding gets and releases the step to the writer.
    pub fn end_step(&mut self) -> Result<()> {
        self.check_step("end_step")?;
        if !self.pending.is_empty() {
            self.perform_gets()?;
        }

        let step = self.current_step.unwrap_or(0);
        self.source.release_step(step)?;
        self.block = None;
        self.variables.clear();
        self.state = ReaderState::AwaitingStep;

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, step, "StagingReader::end_step");
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ReaderState::Closed => {
                return Err(Error::InvalidState(format!(
                    "{} is already closed, in call to close",
                    self.name
                )))
            }
            ReaderState::Unopened => {
                self.state = ReaderState::Closed;
                return Ok(());
            }
            ReaderState::StepActive => self.end_step()?,
            ReaderState::Ready | ReaderState::AwaitingStep | ReaderState::EndOfStream => {}
        }

        self.source.close()?;
        self.state = ReaderState::Closed;

        if self.config.trace_calls() {
            tracing::debug!(name = %self.name, "StagingReader::close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::core::index::{IndexEntry, StepIndex};
    use crate::types::{to_bytes, ElementType, ShapeKind};

    #[derive(Debug, Default)]
    struct Scripted {
        events: VecDeque<StepEvent>,
        released: Vec<u64>,
        open: bool,
    }

    impl StepSource for Scripted {
        fn open(&mut self) -> Result<()> {
            self.open = true;
            Ok(())
        }

        fn poll_step(&mut self, _: StepMode, _: Option<Duration>) -> Result<StepEvent> {
            Ok(self.events.pop_front().unwrap_or(StepEvent::End))
        }

        fn release_step(&mut self, step: u64) -> Result<()> {
            self.released.push(step);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }
    }

    fn block(step: u64, values: &[f64]) -> StepBlock {
        let data = to_bytes(values);
        StepBlock {
            index: StepIndex {
                step,
                entries: vec![IndexEntry {
                    name: "u".into(),
                    element_type: ElementType::Float64,
                    shape_kind: ShapeKind::GlobalArray,
                    shape: vec![values.len()],
                    start: vec![0],
                    count: vec![values.len()],
                    step,
                    step_count: 1,
                    rank: 0,
                    offset: 0,
                    length: data.len() as u64,
                    payload_size: data.len() as u64,
                    transforms: vec![],
                }],
            },
            attributes: vec![Attribute {
                name: "units".into(),
                element_type: ElementType::Char,
                data: b"m/s".to_vec(),
            }],
            data,
        }
    }

    fn reader(events: Vec<StepEvent>) -> StagingReader {
        let source = Scripted {
            events: events.into(),
            ..Scripted::default()
        };
        let mut reader = StagingReader::new(&Io::new("test"), "stream", Box::new(source)).unwrap();
        reader.open().unwrap();
        reader
    }

    #[test]
    fn scripted_sequence() {
        let mut r = reader(vec![
            StepEvent::Ready(block(0, &[1.0, 2.0])),
            StepEvent::Timeout,
            StepEvent::Ready(block(1, &[3.0, 4.0])),
            StepEvent::End,
        ]);

        assert_eq!(r.begin_step(StepMode::NextAvailable, None).unwrap(), StepStatus::Ok);
        assert_eq!(r.current_step(), Some(0));
        let u = r.inquire_variable("u").unwrap();
        assert_eq!(r.get::<f64>(&u).unwrap(), vec![1.0, 2.0]);
        assert_eq!(r.attribute("units").unwrap().data, b"m/s");
        assert!(matches!(
            r.begin_step(StepMode::NextAvailable, None),
            Err(Error::InvalidState(_))
        ));
        r.end_step().unwrap();

        let timeout = Some(Duration::from_millis(1));
        assert_eq!(
            r.begin_step(StepMode::NextAvailable, timeout).unwrap(),
            StepStatus::NotReady
        );
        assert_eq!(r.current_step(), Some(0));
        assert_eq!(r.state(), ReaderState::AwaitingStep);
        assert!(r.inquire_variable("u").is_none());

        assert_eq!(r.begin_step(StepMode::NextAvailable, None).unwrap(), StepStatus::Ok);
        assert_eq!(r.current_step(), Some(1));
        r.end_step().unwrap();

        assert_eq!(
            r.begin_step(StepMode::NextAvailable, None).unwrap(),
            StepStatus::EndOfStream
        );
        assert!(matches!(
            r.begin_step(StepMode::NextAvailable, None),
            Err(Error::InvalidState(_))
        ));
        r.close().unwrap();
        assert!(matches!(r.close(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn deferred_gets_run_at_end_step() {
        let mut r = reader(vec![StepEvent::Ready(block(7, &[5.0, 6.0, 7.0]))]);
        r.begin_step(StepMode::LatestAvailable, None).unwrap();

        let mut u = r.inquire_variable("u").unwrap();
        let whole = r.get_deferred(&u).unwrap();
        u.set_selection(vec![1], vec![2], (0, 1)).unwrap();
        let tail = r.get_deferred(&u).unwrap();
        assert_eq!(r.take(whole), None);

        let missing = Variable::new("v", ElementType::Float64, vec![], vec![], vec![], false)
            .unwrap();
        assert!(matches!(r.get_deferred(&missing), Err(Error::NotFound(_))));

        r.end_step().unwrap();
        assert_eq!(f64::from_bytes(&r.take(whole).unwrap()), vec![5.0, 6.0, 7.0]);
        assert_eq!(f64::from_bytes(&r.take(tail).unwrap()), vec![6.0, 7.0]);
        assert_eq!(r.take(tail), None);
    }

    #[test]
    fn calls_outside_a_step() {
        let mut r = reader(vec![]);
        let v = Variable::new("u", ElementType::Float64, vec![], vec![], vec![], false).unwrap();
        assert!(matches!(r.get_deferred(&v), Err(Error::InvalidState(_))));
        assert!(matches!(r.end_step(), Err(Error::InvalidState(_))));
        assert!(matches!(r.open(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn block_outside_step_data_is_invalid_format() {
        let mut bad = block(0, &[1.0, 2.0]);
        bad.index.entries[0].offset = u64::MAX - 4;
        let mut r = reader(vec![StepEvent::Ready(bad)]);
        r.begin_step(StepMode::NextAvailable, None).unwrap();

        let u = r.inquire_variable("u").unwrap();
        assert!(matches!(r.get::<f64>(&u), Err(Error::InvalidFormat(_))));
    }
}
