//! Relay targets: where a session sends the bytes it reads.

use crate::config::{RelayMode, RelaySettings, WritePolicy};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A newly created file receiving relayed bytes.
#[derive(Debug)]
pub struct Sink {
    file: File,
    path: PathBuf,
}

impl Sink {
    /// Create `path`, failing if anything already exists there.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Sink file created");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

/// Destination of the bytes one session reads.
#[derive(Debug)]
pub enum RelayTarget {
    /// Back to the connection they came from.
    Echo,
    /// Into a file, followed by an acknowledgement once the peer is done.
    Sink { sink: Sink, ack: Arc<[u8]> },
}

/// Hands out sink file paths, one per accepted connection.
///
/// The first connection writes to the configured path itself; the n-th
/// writes to `<path>.<n>`.
#[derive(Debug)]
pub struct SinkPaths {
    base: PathBuf,
    issued: u64,
}

impl SinkPaths {
    pub fn new(base: PathBuf) -> Self {
        Self { base, issued: 0 }
    }

    pub fn next_path(&mut self) -> PathBuf {
        self.issued += 1;
        if self.issued == 1 {
            return self.base.clone();
        }
        let mut name = OsString::from(self.base.as_os_str());
        name.push(format!(".{}", self.issued));
        PathBuf::from(name)
    }
}

/// Per-server factory producing a relay target for each connection.
#[derive(Debug)]
pub struct Relay {
    mode: RelayMode,
    policy: WritePolicy,
    buffer_size: usize,
    ack: Arc<[u8]>,
    sink_paths: Option<SinkPaths>,
}

impl Relay {
    pub fn new(settings: &RelaySettings) -> io::Result<Self> {
        let sink_paths = match (settings.mode, &settings.sink_path) {
            (RelayMode::Sink, Some(path)) => Some(SinkPaths::new(path.clone())),
            (RelayMode::Sink, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "sink mode requires a sink path",
                ))
            }
            (RelayMode::Echo, _) => None,
        };

        Ok(Self {
            mode: settings.mode,
            policy: settings.write_policy,
            buffer_size: settings.buffer_size,
            ack: Arc::from(settings.ack.as_slice()),
            sink_paths,
        })
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Open the target for the next accepted connection.
    ///
    /// Sink creation failures are returned to the caller unchanged.
    pub fn open_target(&mut self) -> io::Result<RelayTarget> {
        match self.sink_paths.as_mut() {
            None => Ok(RelayTarget::Echo),
            Some(paths) => {
                let sink = Sink::create(&paths.next_path())?;
                Ok(RelayTarget::Sink {
                    sink,
                    ack: Arc::clone(&self.ack),
                })
            }
        }
    }
}

/// Write the unsent region of `buf` to `sink` according to `policy`.
///
/// Returns the number of bytes that were discarded (always zero for
/// `Drain`). Only for use with sinks that never report `WouldBlock`.
pub(crate) fn write_blocking<W: Write + ?Sized>(
    buf: &mut crate::runtime::TransferBuffer,
    sink: &mut W,
    policy: WritePolicy,
) -> io::Result<usize> {
    loop {
        match buf.write_to(sink) {
            Ok(0) if buf.has_remaining() => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if !buf.has_remaining() {
            return Ok(0);
        }
        if policy == WritePolicy::Single {
            return Ok(buf.remaining());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TransferBuffer;

    fn sink_settings(path: PathBuf) -> RelaySettings {
        RelaySettings {
            mode: RelayMode::Sink,
            sink_path: Some(path),
            ..RelaySettings::default()
        }
    }

    #[test]
    fn test_sink_paths_numbering() {
        let mut paths = SinkPaths::new(PathBuf::from("/tmp/copy.jpg"));
        assert_eq!(paths.next_path(), PathBuf::from("/tmp/copy.jpg"));
        assert_eq!(paths.next_path(), PathBuf::from("/tmp/copy.jpg.2"));
        assert_eq!(paths.next_path(), PathBuf::from("/tmp/copy.jpg.3"));
    }

    #[test]
    fn test_echo_relay_needs_no_files() {
        let mut relay = Relay::new(&RelaySettings::default()).unwrap();
        assert_eq!(relay.mode(), RelayMode::Echo);
        assert!(matches!(relay.open_target().unwrap(), RelayTarget::Echo));
    }

    #[test]
    fn test_sink_relay_creates_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("upload.bin");
        let mut relay = Relay::new(&sink_settings(base.clone())).unwrap();

        match relay.open_target().unwrap() {
            RelayTarget::Sink { sink, ack } => {
                assert_eq!(sink.path(), base.as_path());
                assert_eq!(&*ack, b"received\n");
            }
            other => panic!("unexpected target: {:?}", other),
        }
        relay.open_target().unwrap();

        assert!(base.exists());
        assert!(dir.path().join("upload.bin.2").exists());
    }

    #[test]
    fn test_sink_fails_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("taken.bin");
        std::fs::write(&base, b"old").unwrap();

        let mut relay = Relay::new(&sink_settings(base.clone())).unwrap();
        let err = relay.open_target().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&base).unwrap(), b"old");
    }

    #[test]
    fn test_sink_mode_without_path() {
        let settings = RelaySettings {
            mode: RelayMode::Sink,
            ..RelaySettings::default()
        };
        assert!(Relay::new(&settings).is_err());
    }

    #[test]
    fn test_write_blocking_single_discards_rest() {
        struct Half(Vec<u8>);
        impl Write for Half {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = (buf.len() + 1) / 2;
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buf = TransferBuffer::new(16);
        buf.put_slice(b"abcdefgh");
        buf.flip();
        let mut out = Half(Vec::new());
        assert_eq!(write_blocking(&mut buf, &mut out, WritePolicy::Single).unwrap(), 4);
        assert_eq!(out.0, b"abcd");

        buf.clear();
        buf.put_slice(b"abcdefgh");
        buf.flip();
        let mut out = Half(Vec::new());
        assert_eq!(write_blocking(&mut buf, &mut out, WritePolicy::Drain).unwrap(), 0);
        assert_eq!(out.0, b"abcdefgh");
    }
}
