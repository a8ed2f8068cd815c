//! Named pipe bindings.
//!
//! A [`PipeBinding`] places a FIFO either in a volume of the run's
//! [`VolumeSet`] or at an explicit host/container directory pair, and turns
//! it into the host-side endpoint:
//!
//! | Direction | Container | Host endpoint | Created |
//! |-----------|-----------|---------------|---------|
//! | input | reads | [`NamedPipeWriter`] | mkfifo only; opened by the loop once the container reads |
//! | output | writes | [`NamedPipeReader`] | mkfifo + non-blocking read open, immediately |
//!
//! Both must exist before the container starts.

use crate::connector::StreamConnector;
use crate::error::Result;
use crate::stream::{NamedPipe, NamedPipeReader, NamedPipeWriter, Reader, Writer};
use crate::volume::{VolumeRef, VolumeSet, join_container_path};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipeLocation {
    Explicit {
        host_dir: PathBuf,
        container_dir: String,
    },
    Volume(VolumeRef),
}

/// Where a named pipe lives and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeBinding {
    name: String,
    location: PipeLocation,
}

impl PipeBinding {
    /// A pipe named `name` inside `volume`.
    pub fn in_volume(name: impl Into<String>, volume: VolumeRef) -> Self {
        Self {
            name: name.into(),
            location: PipeLocation::Volume(volume),
        }
    }

    /// A pipe named `name` in a caller-owned directory that the container
    /// sees at `container_dir`. The FIFO is removed when its endpoint closes.
    pub fn explicit(
        name: impl Into<String>,
        host_dir: impl Into<PathBuf>,
        container_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            location: PipeLocation::Explicit {
                host_dir: host_dir.into(),
                container_dir: container_dir.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host and container paths of the FIFO, resolving its volume if needed.
    pub fn paths(&self, volumes: &mut VolumeSet) -> Result<(PathBuf, String)> {
        match &self.location {
            PipeLocation::Explicit {
                host_dir,
                container_dir,
            } => Ok((
                host_dir.join(&self.name),
                join_container_path(container_dir, &self.name),
            )),
            PipeLocation::Volume(volume) => {
                let resolved = volumes.resolve(*volume)?;
                Ok((
                    resolved.host_join(&self.name),
                    resolved.container_join(&self.name),
                ))
            }
        }
    }

    fn create(&self, volumes: &mut VolumeSet) -> Result<(NamedPipe, String)> {
        let (host_path, container_path) = self.paths(volumes)?;
        let mut pipe = NamedPipe::create(host_path)?;
        if matches!(self.location, PipeLocation::Explicit { .. }) {
            pipe = pipe.remove_on_close();
        }
        Ok((pipe, container_path))
    }

    /// Creates a FIFO the container reads from.
    pub fn create_input(&self, volumes: &mut VolumeSet) -> Result<NamedPipeWriter> {
        let (pipe, container_path) = self.create(volumes)?;
        Ok(NamedPipeWriter::new(pipe, Some(container_path)))
    }

    /// Creates a FIFO the container writes to, opened for reading.
    pub fn create_output(&self, volumes: &mut VolumeSet) -> Result<NamedPipeReader> {
        let (pipe, container_path) = self.create(volumes)?;
        let mut reader = NamedPipeReader::new(pipe, Some(container_path));
        reader.open()?;
        Ok(reader)
    }

    /// Creates an input FIFO fed from `source`.
    pub fn connect_input(
        &self,
        volumes: &mut VolumeSet,
        source: Box<dyn Reader>,
    ) -> Result<StreamConnector> {
        let writer = self.create_input(volumes)?;
        Ok(StreamConnector::writer(source, Box::new(writer)))
    }

    /// Creates an output FIFO drained into `sink`.
    pub fn connect_output(
        &self,
        volumes: &mut VolumeSet,
        sink: Box<dyn Writer>,
    ) -> Result<StreamConnector> {
        let reader = self.create_output(volumes)?;
        Ok(StreamConnector::reader(Box::new(reader), sink))
    }
}
