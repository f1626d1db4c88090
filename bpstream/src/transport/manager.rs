use std::path::Path;

use super::{FileTransport, ShmTransport, Transport, TransportKind};
use crate::config::TransportConfig;
use crate::profiling::Profiler;
use crate::types::Mode;
use crate::{Error, Result};

/// `out.bp` on rank 3 becomes `out.bp.dir/out.bp.3`.
pub(crate) fn data_file_name(name: &str, rank: usize) -> String {
    let stem = Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    format!("{}.dir/{}.{}", name, stem, rank)
}

/// The transports serving one stream on one rank.
#[derive(Debug)]
pub struct TransportManager {
    rank: usize,
    transports: Vec<Box<dyn Transport>>,
}

impl TransportManager {
    pub fn new(rank: usize) -> Self {
        TransportManager {
            rank,
            transports: Vec::new(),
        }
    }

    /// Directory holding the per-rank data files of each transport.
    pub fn base_names(&self, name: &str, configs: &[TransportConfig]) -> Vec<String> {
        configs.iter().map(|_| format!("{}.dir", name)).collect()
    }

    /// Per-rank data file of each transport. The first transport writes the file
    /// readers look for; every further one gets its index appended.
    pub fn full_names(&self, name: &str, configs: &[TransportConfig]) -> Vec<String> {
        let file = data_file_name(name, self.rank);
        (0..configs.len())
            .map(|index| match index {
                0 => file.clone(),
                _ => format!("{}.{}", file, index),
            })
            .collect()
    }

    fn build(config: &TransportConfig, profile: bool) -> Box<dyn Transport> {
        match config.kind {
            TransportKind::File => Box::new(FileTransport::new(profile)),
            TransportKind::SharedMemory => Box::new(ShmTransport::new(
                config.capacity.unwrap_or(0),
                config.remove_on_close,
                config.shm_dir.clone(),
                profile,
            )),
        }
    }

    /// Opens one transport per config, all or nothing: if any open fails, the
    /// transports opened by this call are closed again and the failure is returned.
    pub fn open_files(
        &mut self,
        names: &[String],
        mode: Mode,
        configs: &[TransportConfig],
        profile: bool,
    ) -> Result<()> {
        if names.len() != configs.len() {
            return Err(Error::InvalidArgument(format!(
                "{} names for {} transports",
                names.len(),
                configs.len()
            )));
        }

        let mut opened: Vec<Box<dyn Transport>> = Vec::with_capacity(configs.len());

        for (name, config) in names.iter().zip(configs) {
            let mut transport = Self::build(config, profile);
            if let Err(e) = transport.open(name, mode, config.async_hint) {
                tracing::debug!(%name, error = %e, "transport open failed, rolling back");
                for t in opened.iter_mut() {
                    if let Err(close_err) = t.close() {
                        tracing::warn!(error = %close_err, "rollback close failed");
                    }
                }
                return Err(e);
            }
            opened.push(transport);
        }

        self.transports.extend(opened);
        Ok(())
    }

    /// `None` addresses every open transport.
    pub fn check_transport_index(&self, index: Option<usize>) -> bool {
        match index {
            None => true,
            Some(i) => i < self.transports.len(),
        }
    }

    fn selected(&mut self, index: Option<usize>) -> Result<Vec<&mut Box<dyn Transport>>> {
        match index {
            None => Ok(self.transports.iter_mut().filter(|t| t.is_open()).collect()),
            Some(i) => {
                let len = self.transports.len();
                match self.transports.get_mut(i) {
                    Some(t) => Ok(vec![t]),
                    None => Err(Error::OutOfRange { index: i, len }),
                }
            }
        }
    }

    /// Writes `data` at the current position of the addressed transports.
    pub fn write_files(&mut self, data: &[u8], index: Option<usize>) -> Result<()> {
        for transport in self.selected(index)? {
            transport.write(data, None)?;
        }
        Ok(())
    }

    pub fn write_at(&mut self, data: &[u8], offset: u64, index: Option<usize>) -> Result<()> {
        for transport in self.selected(index)? {
            transport.write(data, Some(offset))?;
        }
        Ok(())
    }

    /// Reads from the transport at `index`.
    pub fn read_at(&mut self, buffer: &mut [u8], offset: u64, index: usize) -> Result<()> {
        self.transport_mut(index)?.read(buffer, Some(offset))
    }

    /// Current size of the transport at `index`.
    pub fn size(&self, index: usize) -> Result<u64> {
        let len = self.transports.len();
        match self.transports.get(index) {
            Some(t) => t.size(),
            None => Err(Error::OutOfRange { index, len }),
        }
    }

    pub fn close_files(&mut self, index: Option<usize>) -> Result<()> {
        for transport in self.selected(index)? {
            transport.close()?;
        }
        Ok(())
    }

    pub fn all_transports_closed(&self) -> bool {
        self.transports.iter().all(|t| !t.is_open())
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn transport_kinds(&self) -> Vec<String> {
        self.transports
            .iter()
            .map(|t| t.record().kind.name().to_string())
            .collect()
    }

    pub fn profilers(&self) -> Vec<&Profiler> {
        self.transports
            .iter()
            .map(|t| &t.record().profiler)
            .collect()
    }

    pub fn transport_mut(&mut self, index: usize) -> Result<&mut dyn Transport> {
        let len = self.transports.len();
        match self.transports.get_mut(index) {
            Some(t) => Ok(t.as_mut()),
            None => Err(Error::OutOfRange { index, len }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming() {
        let manager = TransportManager::new(3);
        let configs = [TransportConfig::file()];
        assert_eq!(
            manager.base_names("runs/out.bp", &configs),
            vec!["runs/out.bp.dir".to_string()]
        );
        assert_eq!(
            manager.full_names("runs/out.bp", &configs),
            vec!["runs/out.bp.dir/out.bp.3".to_string()]
        );

        let configs = [TransportConfig::file(), TransportConfig::file(), TransportConfig::file()];
        assert_eq!(
            manager.full_names("out.bp", &configs),
            vec![
                "out.bp.dir/out.bp.3".to_string(),
                "out.bp.dir/out.bp.3.1".to_string(),
                "out.bp.dir/out.bp.3.2".to_string(),
            ]
        );
    }

    #[test]
    fn failed_open_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good").to_string_lossy().into_owned();
        let mut shm = TransportConfig::shm(0);
        shm.shm_dir = dir.path().to_path_buf();

        let mut manager = TransportManager::new(0);
        let err = manager
            .open_files(
                &[good.clone(), "missing-segment".to_string()],
                Mode::Append,
                &[TransportConfig::file(), shm.clone()],
                false,
            )
            .unwrap_err();
        // The file transport fails first in append mode: nothing exists yet.
        assert!(matches!(err, Error::OpenFailure { .. }));
        assert!(manager.is_empty());

        let err = manager
            .open_files(
                &[good, "missing-segment".to_string()],
                Mode::Write,
                &[TransportConfig::file(), shm],
                false,
            )
            .unwrap_err();
        // Capacity 0 cannot create a segment; the file opened first is closed again.
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(manager.is_empty());
        assert!(manager.all_transports_closed());
    }

    #[test]
    fn partial_close() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a").to_string_lossy().into_owned();
        let b = dir.path().join("b").to_string_lossy().into_owned();

        let mut manager = TransportManager::new(0);
        manager
            .open_files(
                &[a.clone(), b],
                Mode::Write,
                &[TransportConfig::file(), TransportConfig::file()],
                true,
            )
            .unwrap();
        assert_eq!(manager.transport_kinds(), vec!["File", "File"]);
        assert!(manager.check_transport_index(Some(1)));
        assert!(!manager.check_transport_index(Some(2)));

        manager.write_files(b"abc", None).unwrap();
        manager.close_files(Some(0)).unwrap();
        assert!(!manager.all_transports_closed());

        // Broadcast now only reaches the transport still open.
        manager.write_files(b"def", None).unwrap();
        assert!(matches!(
            manager.write_files(b"x", Some(0)),
            Err(Error::InvalidState(_))
        ));
        manager.close_files(None).unwrap();
        assert!(manager.all_transports_closed());
        assert_eq!(std::fs::read(&a).unwrap(), b"abc");
        assert_eq!(manager.profilers()[1].bytes("write"), 6);
    }
}
