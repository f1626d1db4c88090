use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;

use memmap2::{Mmap, MmapMut};

use super::{Transport, TransportKind, TransportRecord};
use crate::types::Mode;
use crate::{Error, Result};

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(map) => &map[..],
            Mapping::ReadWrite(map) => &map[..],
        }
    }
}

/// A fixed-capacity segment mapped from a backing file in a shared directory,
/// `/dev/shm` by default. Every process mapping the same name sees the same bytes.
#[derive(Debug)]
pub struct ShmTransport {
    record: TransportRecord,
    capacity: u64,
    remove_on_close: bool,
    directory: PathBuf,
    path: Option<PathBuf>,
    mapping: Option<Mapping>,
}

impl ShmTransport {
    /// `capacity` sizes a segment created in write mode; attaching ignores it and uses
    /// the existing segment's size.
    pub fn new(capacity: u64, remove_on_close: bool, directory: PathBuf, profile: bool) -> Self {
        ShmTransport {
            record: TransportRecord::new(TransportKind::SharedMemory, profile),
            capacity,
            remove_on_close,
            directory,
            path: None,
            mapping: None,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Segment names are flat: path separators become underscores.
    fn segment_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "shared memory segment name is empty".into(),
            ));
        }
        let flat: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        Ok(self.directory.join(flat))
    }

    fn check_bounds(&self, offset: u64, size: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                size,
                capacity: self.capacity,
            }),
        }
    }
}

impl Transport for ShmTransport {
    fn record(&self) -> &TransportRecord {
        &self.record
    }

    fn open(&mut self, name: &str, mode: Mode, _async_hint: bool) -> Result<()> {
        self.record.check_not_open(name)?;
        let path = self.segment_path(name)?;
        self.record.profiler.start("open");

        let open_failure = |source| Error::OpenFailure {
            name: name.to_string(),
            source,
        };
        let attach_failure = |source: std::io::Error| {
            if source.kind() == ErrorKind::NotFound {
                Error::NotFound(name.to_string())
            } else {
                open_failure(source)
            }
        };

        let mapping = match mode {
            Mode::Write => {
                if self.capacity == 0 {
                    return Err(Error::InvalidArgument(format!(
                        "shared memory segment {} needs a capacity",
                        name
                    )));
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)
                    .map_err(open_failure)?;
                file.set_len(self.capacity).map_err(open_failure)?;
                // SAFETY: the segment is shared on purpose; cross-process access is
                // sequenced by the staging handshake.
                Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file) }.map_err(open_failure)?)
            }
            Mode::Read => {
                let file = OpenOptions::new()
                    .read(true)
                    .open(&path)
                    .map_err(attach_failure)?;
                self.capacity = file.metadata().map_err(open_failure)?.len();
                // SAFETY: as above.
                Mapping::ReadOnly(unsafe { Mmap::map(&file) }.map_err(open_failure)?)
            }
            Mode::Append => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(attach_failure)?;
                self.capacity = file.metadata().map_err(open_failure)?.len();
                // SAFETY: as above.
                Mapping::ReadWrite(unsafe { MmapMut::map_mut(&file) }.map_err(open_failure)?)
            }
        };

        self.mapping = Some(mapping);
        self.path = Some(path);
        self.record.mark_open(name, mode);
        self.record.profiler.stop("open");
        tracing::trace!(%name, %mode, capacity = self.capacity, "attached shared memory");
        Ok(())
    }

    fn write(&mut self, buffer: &[u8], offset: Option<u64>) -> Result<()> {
        self.record.check_open("in call to write")?;
        self.record.check_writable("in call to write")?;
        let offset = offset.unwrap_or(0);
        self.check_bounds(offset, buffer.len() as u64)?;

        self.record.profiler.start("write");
        match self.mapping.as_mut() {
            Some(Mapping::ReadWrite(map)) => {
                let start = offset as usize;
                map[start..start + buffer.len()].copy_from_slice(buffer);
            }
            _ => {
                return Err(Error::InvalidState(format!(
                    "segment {} is not mapped writable",
                    self.record.name
                )))
            }
        }
        self.record.profiler.stop("write");
        self.record.profiler.add_bytes("write", buffer.len() as u64);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], offset: Option<u64>) -> Result<()> {
        self.record.check_open("in call to read")?;
        let offset = offset.unwrap_or(0);
        self.check_bounds(offset, buffer.len() as u64)?;

        self.record.profiler.start("read");
        let mapping = self.mapping.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("segment {} is not mapped", self.record.name))
        })?;
        let start = offset as usize;
        buffer.copy_from_slice(&mapping.as_slice()[start..start + buffer.len()]);
        self.record.profiler.stop("read");
        self.record.profiler.add_bytes("read", buffer.len() as u64);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.record.check_open("in call to close")?;
        self.record.profiler.start("close");

        self.mapping = None;
        self.record.mark_closed();

        if let Some(path) = self.path.take() {
            if self.remove_on_close {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    // Another process may have removed it first.
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Error::io(
                            format!("removing segment {}", path.display()),
                            e,
                        ))
                    }
                }
            }
        }

        self.record.profiler.stop("close");
        Ok(())
    }

    fn seek_to_begin(&mut self) -> Result<()> {
        self.record.check_open("in call to seek_to_begin")
    }

    fn seek_to_end(&mut self) -> Result<()> {
        self.record.check_open("in call to seek_to_end")
    }

    fn size(&self) -> Result<u64> {
        self.record.check_open("in call to size")?;
        Ok(self.capacity)
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        if self.record.is_open() {
            tracing::warn!(
                name = %self.record.name,
                "ShmTransport dropped while open; detaching"
            );
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "failed to detach shared memory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(dir: &tempfile::TempDir, capacity: u64, remove: bool) -> ShmTransport {
        ShmTransport::new(capacity, remove, dir.path().to_path_buf(), false)
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = segment(&dir, 1024, true);
        shm.open("bounds", Mode::Write, false).unwrap();

        let err = shm.write(&[1u8; 600], Some(500)).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfBounds {
                offset: 500,
                size: 600,
                capacity: 1024
            }
        ));
        shm.write(&[7u8; 400], Some(500)).unwrap();
        assert!(shm.write(&[0u8; 1], Some(u64::MAX)).is_err());

        let mut back = [0u8; 400];
        shm.read(&mut back, Some(500)).unwrap();
        assert!(back.iter().all(|b| *b == 7));
        shm.close().unwrap();
    }

    #[test]
    fn attach_sees_writer_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = segment(&dir, 64, false);
        writer.open("a/b", Mode::Write, false).unwrap();
        writer.write(b"shared", Some(8)).unwrap();

        let mut reader = segment(&dir, 0, false);
        reader.open("a/b", Mode::Read, false).unwrap();
        assert_eq!(reader.size().unwrap(), 64);
        let mut buf = [0u8; 6];
        reader.read(&mut buf, Some(8)).unwrap();
        assert_eq!(&buf, b"shared");
        assert!(matches!(reader.write(b"x", None), Err(Error::InvalidState(_))));
        reader.seek_to_end().unwrap();

        reader.close().unwrap();
        writer.close().unwrap();
        assert!(dir.path().join("a_b").exists());
    }

    #[test]
    fn attach_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = segment(&dir, 0, false);
        assert!(matches!(
            shm.open("missing", Mode::Append, false),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            shm.read(&mut [0u8; 1], None),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn remove_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = segment(&dir, 16, true);
        shm.open("gone", Mode::Write, false).unwrap();
        assert!(dir.path().join("gone").exists());
        shm.close().unwrap();
        assert!(!dir.path().join("gone").exists());
        assert!(matches!(shm.close(), Err(Error::InvalidState(_))));
    }
}
