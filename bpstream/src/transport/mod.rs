//! Byte-addressable sinks and sources behind a common open/write/read/close lifecycle.

use std::fmt;

use crate::profiling::Profiler;
use crate::types::Mode;
use crate::{Error, Result};

mod file;
mod manager;
mod shm;

pub use file::FileTransport;
pub use manager::TransportManager;
pub use shm::ShmTransport;

pub(crate) use manager::data_file_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    File,
    SharedMemory,
}

impl TransportKind {
    pub const fn name(self) -> &'static str {
        match self {
            TransportKind::File => "File",
            TransportKind::SharedMemory => "Shm",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping every transport carries.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub name: String,
    pub kind: TransportKind,
    pub mode: Option<Mode>,
    pub profiler: Profiler,
    open: bool,
}

impl TransportRecord {
    pub(crate) fn new(kind: TransportKind, profile: bool) -> Self {
        TransportRecord {
            name: String::new(),
            kind,
            mode: None,
            profiler: Profiler::new(profile),
            open: false,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn mark_open(&mut self, name: &str, mode: Mode) {
        self.name = name.to_string();
        self.mode = Some(mode);
        self.open = true;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.open = false;
    }

    pub(crate) fn check_open(&self, hint: &str) -> Result<()> {
        if !self.open {
            return Err(Error::InvalidState(format!(
                "{} transport {} is not open {}",
                self.kind,
                if self.name.is_empty() { "(unnamed)" } else { self.name.as_str() },
                hint
            )));
        }
        Ok(())
    }

    pub(crate) fn check_not_open(&self, name: &str) -> Result<()> {
        if self.open {
            return Err(Error::InvalidState(format!(
                "{} transport is already open as {}, cannot open {}",
                self.kind, self.name, name
            )));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self, hint: &str) -> Result<()> {
        if self.mode == Some(Mode::Read) {
            return Err(Error::InvalidState(format!(
                "{} transport {} is open for reading {}",
                self.kind, self.name, hint
            )));
        }
        Ok(())
    }
}

/// `offset: None` continues at the transport's current position. Transports
/// without a position (shared memory) treat it as offset 0.
pub trait Transport: fmt::Debug + Send {
    fn record(&self) -> &TransportRecord;

    fn open(&mut self, name: &str, mode: Mode, async_hint: bool) -> Result<()>;

    fn write(&mut self, buffer: &[u8], offset: Option<u64>) -> Result<()>;

    fn read(&mut self, buffer: &mut [u8], offset: Option<u64>) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn seek_to_begin(&mut self) -> Result<()>;

    fn seek_to_end(&mut self) -> Result<()>;

    /// Addressable extent: current file length or segment capacity.
    fn size(&self) -> Result<u64>;

    fn is_open(&self) -> bool {
        self.record().is_open()
    }
}

/// Sequential [`std::io::Read`] over a transport, for decoding variable-length records.
pub(crate) struct TransportReader<'a> {
    transport: &'a mut dyn Transport,
    position: u64,
    size: u64,
}

impl<'a> TransportReader<'a> {
    pub(crate) fn new(transport: &'a mut dyn Transport, position: u64) -> Result<Self> {
        let size = transport.size()?;
        Ok(TransportReader {
            transport,
            position,
            size,
        })
    }
}

impl std::io::Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.size.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }

        self.transport
            .read(&mut buf[..n], Some(self.position))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        self.position += n as u64;
        Ok(n)
    }
}
