use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{Transport, TransportKind, TransportRecord};
use crate::types::Mode;
use crate::{Error, Result};

/// A persistent file. Grows on write; reads past the end fail with `OutOfBounds`.
#[derive(Debug)]
pub struct FileTransport {
    record: TransportRecord,
    file: Option<File>,
}

impl FileTransport {
    pub fn new(profile: bool) -> Self {
        FileTransport {
            record: TransportRecord::new(TransportKind::File, profile),
            file: None,
        }
    }

    fn file(&mut self, hint: &str) -> Result<&mut File> {
        self.record.check_open(hint)?;
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(Error::InvalidState(format!("file handle missing {}", hint))),
        }
    }

    fn seek(&mut self, to: SeekFrom, hint: &str) -> Result<u64> {
        let name = self.record.name.clone();
        self.file(hint)?
            .seek(to)
            .map_err(|e| Error::io(format!("seeking in {}", name), e))
    }
}

impl Transport for FileTransport {
    fn record(&self) -> &TransportRecord {
        &self.record
    }

    fn open(&mut self, name: &str, mode: Mode, _async_hint: bool) -> Result<()> {
        self.record.check_not_open(name)?;
        self.record.profiler.start("open");

        let open_failure = |source| Error::OpenFailure {
            name: name.to_string(),
            source,
        };

        let file = match mode {
            Mode::Write => {
                if let Some(parent) = Path::new(name).parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).map_err(open_failure)?;
                    }
                }
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(name)
                    .map_err(open_failure)?
            }
            Mode::Read => File::open(name).map_err(open_failure)?,
            Mode::Append => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(name)
                    .map_err(open_failure)?;
                file.seek(SeekFrom::End(0)).map_err(open_failure)?;
                file
            }
        };

        self.file = Some(file);
        self.record.mark_open(name, mode);
        self.record.profiler.stop("open");
        tracing::trace!(%name, %mode, "opened file transport");
        Ok(())
    }

    fn write(&mut self, buffer: &[u8], offset: Option<u64>) -> Result<()> {
        self.record.check_writable("in call to write")?;
        if let Some(offset) = offset {
            self.seek(SeekFrom::Start(offset), "in call to write")?;
        }

        self.record.profiler.start("write");
        let name = self.record.name.clone();
        self.file("in call to write")?
            .write_all(buffer)
            .map_err(|e| Error::io(format!("writing {} bytes to {}", buffer.len(), name), e))?;
        self.record.profiler.stop("write");
        self.record.profiler.add_bytes("write", buffer.len() as u64);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], offset: Option<u64>) -> Result<()> {
        let position = match offset {
            Some(offset) => self.seek(SeekFrom::Start(offset), "in call to read")?,
            None => self.seek(SeekFrom::Current(0), "in call to read")?,
        };

        self.record.profiler.start("read");
        let name = self.record.name.clone();
        let result = self.file("in call to read")?.read_exact(buffer);
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::OutOfBounds {
                    offset: position,
                    size: buffer.len() as u64,
                    capacity: self.size()?,
                })
            }
            Err(e) => return Err(Error::io(format!("reading from {}", name), e)),
        }
        self.record.profiler.stop("read");
        self.record.profiler.add_bytes("read", buffer.len() as u64);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.record.profiler.start("close");
        let name = self.record.name.clone();
        let file = self.file("in call to close")?;
        file.flush()
            .map_err(|e| Error::io(format!("flushing {}", name), e))?;
        self.file = None;
        self.record.mark_closed();
        self.record.profiler.stop("close");
        Ok(())
    }

    fn seek_to_begin(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0), "in call to seek_to_begin")
            .map(|_| ())
    }

    fn seek_to_end(&mut self) -> Result<()> {
        self.seek(SeekFrom::End(0), "in call to seek_to_end")
            .map(|_| ())
    }

    fn size(&self) -> Result<u64> {
        self.record.check_open("in call to size")?;
        match self.file.as_ref() {
            Some(file) => file
                .metadata()
                .map(|m| m.len())
                .map_err(|e| Error::io(format!("reading metadata of {}", self.record.name), e)),
            None => Err(Error::InvalidState("file handle missing".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data.bin");
        let path = path.to_str().unwrap();

        let mut t = FileTransport::new(true);
        t.open(path, Mode::Write, false).unwrap();
        t.write(b"hello", None).unwrap();
        t.write(b"world", Some(10)).unwrap();
        assert_eq!(t.size().unwrap(), 15);
        t.close().unwrap();
        assert!(!t.is_open());
        assert_eq!(t.record().profiler.bytes("write"), 10);

        let mut t = FileTransport::new(false);
        t.open(path, Mode::Read, false).unwrap();
        let mut buf = [0u8; 5];
        t.read(&mut buf, Some(10)).unwrap();
        assert_eq!(&buf, b"world");
        assert!(matches!(
            t.read(&mut buf, Some(12)),
            Err(Error::OutOfBounds {
                offset: 12,
                size: 5,
                capacity: 15
            })
        ));
        assert!(matches!(
            t.write(b"x", None),
            Err(Error::InvalidState(_))
        ));
        t.close().unwrap();
    }

    #[test]
    fn unopened_calls_fail() {
        let mut t = FileTransport::new(false);
        assert!(matches!(t.write(b"x", None), Err(Error::InvalidState(_))));
        assert!(matches!(t.close(), Err(Error::InvalidState(_))));
        assert!(matches!(t.seek_to_end(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn missing_file_is_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let mut t = FileTransport::new(false);
        assert!(matches!(
            t.open(path.to_str().unwrap(), Mode::Read, false),
            Err(Error::OpenFailure { .. })
        ));
        assert!(!t.is_open());
    }
}
