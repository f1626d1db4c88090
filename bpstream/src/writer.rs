use serde_json::{json, Value};

use crate::comm::{gather_bytes, split_blocks, Communicator};
use crate::config::EngineConfig;
use crate::core::serializer::Serializer;
use crate::header::{MetadataHeader, StreamHeader, METADATA_MAGIC_BYTES, VERSION};
use crate::io::Io;
use crate::profiling::Profiler;
use crate::ser::Serialize;
use crate::transport::{FileTransport, Transport, TransportManager};
use crate::types::{to_bytes, Mode};
use crate::{Element, Error, Result, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Initialized,
    Buffering,
    Closing,
    Closed,
}

/// Buffers a rank's puts in memory and ships them through its transports at close.
///
/// `close` is collective when metadata aggregation or profiling is on: every rank of
/// the group must call it.
#[derive(Debug)]
pub struct BpWriter {
    name: String,
    config: EngineConfig,
    comm: Box<dyn Communicator>,
    manager: TransportManager,
    serializer: Serializer,
    profiler: Profiler,
    state: WriterState,
    local_index: Option<Vec<u8>>,
    profiling_dir: String,
}

impl BpWriter {
    pub fn open<C>(io: &Io, name: &str, mode: Mode, comm: C) -> Result<BpWriter>
    where
        C: Communicator + 'static,
    {
        match mode {
            Mode::Write => {}
            Mode::Append => {
                return Err(Error::InvalidArgument(format!(
                    "append mode is not supported by the BP writer, in call to open {}",
                    name
                )))
            }
            Mode::Read => {
                return Err(Error::InvalidArgument(format!(
                    "the BP writer cannot open {} for reading, use BpReader",
                    name
                )))
            }
        }

        let config = io.engine_config()?;
        if config.aggregator_rank >= comm.size() {
            return Err(Error::InvalidArgument(format!(
                "aggregator rank {} outside process group of size {}",
                config.aggregator_rank,
                comm.size()
            )));
        }

        let transports = io.transport_configs()?;
        let mut profiler = Profiler::new(config.profile);
        profiler.start("buffering");

        let mut manager = TransportManager::new(comm.rank());
        let profiling_dir = manager
            .base_names(name, &transports)
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("{}.dir", name));
        let full_names = manager.full_names(name, &transports);
        manager.open_files(&full_names, mode, &transports, config.profile)?;

        let mut serializer =
            Serializer::new(comm.rank(), io.registry().clone(), config.initial_buffer_size);
        serializer.set_attributes(io.attributes().to_vec());
        serializer.write_header(&StreamHeader::new(
            comm.rank(),
            comm.size(),
            io.host_language(),
            manager.transport_kinds(),
        ));

        if config.trace_calls() {
            tracing::debug!(rank = comm.rank(), %name, %mode, "BpWriter::open");
        }

        Ok(BpWriter {
            name: name.to_string(),
            config,
            comm: Box::new(comm),
            manager,
            serializer,
            profiler,
            state: WriterState::Initialized,
            local_index: None,
            profiling_dir,
        })
    }

    #[inline]
    pub fn state(&self) -> WriterState {
        self.state
    }

    #[inline]
    pub fn current_step(&self) -> u64 {
        self.serializer.current_step()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transports(&self) -> &TransportManager {
        &self.manager
    }

    fn check_accepting(&self, call: &str) -> Result<()> {
        match self.state {
            WriterState::Initialized | WriterState::Buffering => Ok(()),
            WriterState::Closing | WriterState::Closed => Err(Error::InvalidState(format!(
                "{} is closing or closed, in call to {}",
                self.name, call
            ))),
        }
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

    /// Puts raw little-endian element bytes; compound variables go through here.
    pub fn put_bytes(&mut self, variable: &mut Variable, bytes: &[u8]) -> Result<()> {
        self.check_accepting("put")?;

        self.profiler.start("transforms");
        let result = self.serializer.put(variable, bytes);
        self.profiler.stop("transforms");
        let entry = result?;

        if self.config.trace_calls() {
            tracing::debug!(
                rank = self.comm.rank(),
                name = %entry.name,
                step = entry.step,
                bytes = entry.length,
                "BpWriter::put"
            );
        }

        self.profiler.add_bytes("buffering", bytes.len() as u64);
        self.state = WriterState::Buffering;
        Ok(())
    }

    /// Closes the current step and moves to the next one.
    pub fn advance(&mut self) -> Result<()> {
        self.check_accepting("advance")?;
        self.serializer.advance();
        self.state = WriterState::Buffering;

        if self.config.trace_calls() {
            tracing::debug!(
                rank = self.comm.rank(),
                step = self.serializer.current_step(),
                "BpWriter::advance"
            );
        }
        Ok(())
    }

    /// Flushes the stream to the transport at `transport_index`, or to every
    /// transport still open, and closes it. Once the last transport is closed,
    /// metadata aggregation and the profiling summary run. Closing a closed writer
    /// does nothing.
    pub fn close(&mut self, transport_index: Option<usize>) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }

        if !self.manager.check_transport_index(transport_index) {
            return Err(Error::InvalidArgument(format!(
                "transport index {:?} does not exist, {} has {} transports, in call to close",
                transport_index,
                self.name,
                self.manager.len()
            )));
        }

        if self.local_index.is_none() {
            self.local_index = Some(self.serializer.finish());
            self.state = WriterState::Closing;
        }

        self.manager
            .write_files(self.serializer.buffer(), transport_index)?;
        self.manager.close_files(transport_index)?;

        if self.config.trace_calls() {
            tracing::debug!(
                rank = self.comm.rank(),
                transport = ?transport_index,
                "BpWriter::close"
            );
        }

        if self.manager.all_transports_closed() {
            self.profiler.stop("buffering");

            if self.config.collective_metadata {
                self.profiler.start("aggregation");
                self.aggregate_metadata()?;
                self.profiler.stop("aggregation");
            }

            if self.config.profile {
                self.write_profiling()?;
            }

            self.state = WriterState::Closed;
        }

        Ok(())
    }

    fn write_side_file(&self, path: &str, blocks: &[&[u8]]) -> Result<()> {
        let mut file = FileTransport::new(false);
        file.open(path, Mode::Write, false)?;
        for block in blocks {
            file.write(block, None)?;
        }
        file.close()
    }

    fn aggregate_metadata(&mut self) -> Result<()> {
        let local = self.local_index.clone().unwrap_or_default();
        let root = self.config.aggregator_rank;
        let (lengths, gathered) = gather_bytes(self.comm.as_ref(), &local, root)?;

        if self.comm.rank() != root {
            return Ok(());
        }

        let header = MetadataHeader {
            magic_bytes: *METADATA_MAGIC_BYTES,
            version: VERSION,
            block_lengths: lengths,
        };
        self.write_side_file(&self.name, &[&header.to_bytes(), &gathered])?;

        tracing::debug!(
            name = %self.name,
            ranks = self.comm.size(),
            bytes = gathered.len(),
            "wrote aggregated metadata"
        );
        Ok(())
    }

    fn profiling_json(&self) -> Value {
        let transports: Vec<Value> = self
            .manager
            .profilers()
            .into_iter()
            .zip(self.manager.transport_kinds())
            .map(|(profiler, kind)| {
                let mut value = profiler.to_json();
                if let Value::Object(map) = &mut value {
                    map.insert("type".to_string(), json!(kind));
                }
                value
            })
            .collect();

        json!({
            "rank": self.comm.rank(),
            "bytes": self.serializer.buffer().len(),
            "engine": self.profiler.to_json(),
            "transports": transports,
        })
    }

    fn write_profiling(&mut self) -> Result<()> {
        let local = serde_json::to_vec(&self.profiling_json())
            .map_err(|e| Error::InvalidFormat(format!("profiling summary: {}", e)))?;
        let root = self.config.aggregator_rank;
        let (lengths, gathered) = gather_bytes(self.comm.as_ref(), &local, root)?;

        if self.comm.rank() != root {
            return Ok(());
        }

        let ranks = split_blocks(&lengths, &gathered)?
            .into_iter()
            .map(|block| serde_json::from_slice::<Value>(block))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidFormat(format!("profiling summary: {}", e)))?;
        let summary = serde_json::to_vec_pretty(&Value::Array(ranks))
            .map_err(|e| Error::InvalidFormat(format!("profiling summary: {}", e)))?;

        let path = format!("{}/profiling.json", self.profiling_dir);
        self.write_side_file(&path, &[&summary])
    }
}

impl Drop for BpWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            tracing::warn!(
                name = %self.name,
                rank = self.comm.rank(),
                "BpWriter dropped without calling close(); buffered steps are lost"
            );
        }
    }
}
