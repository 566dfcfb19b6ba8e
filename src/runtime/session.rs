//! Echo session: the per-connection read/relay cycle.
//!
//! ```text
//! READING --data, relayed--------------------> READING
//! READING --data, peer would block-----------> WRITING --drained--> READING
//! READING --end-of-stream, sink with ack-----> ACKNOWLEDGING --sent--> CLOSED
//! READING --end-of-stream--------------------> CLOSED
//! ```
//!
//! Any I/O error other than `WouldBlock`/`Interrupted` is returned to the
//! caller, which closes the connection.
//!
//! The session only ever asks for one kind of readiness at a time: each
//! handler returns the `Step` the caller should register for next.
//!
//! Every read starts from position zero of a cleared transfer buffer, and
//! every relay write starts right after a flip, so the buffer limit equals
//! the bytes just read.

use crate::config::WritePolicy;
use crate::runtime::relay::{write_blocking, RelayTarget};
use crate::runtime::TransferBuffer;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{trace, warn};

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the peer to send bytes.
    Reading,
    /// Echoed bytes are still waiting in the buffer for the peer to accept them.
    Writing,
    /// The peer finished sending; the acknowledgement is being written.
    Acknowledging,
    /// End-of-stream observed and all owed bytes sent.
    Closed,
}

/// Readiness the session needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AwaitReadable,
    AwaitWritable,
    Close,
}

#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    buffer: TransferBuffer,
    target: RelayTarget,
    policy: WritePolicy,
    state: SessionState,
    /// Bytes read from the peer.
    received: u64,
    /// Bytes dropped under `WritePolicy::Single`.
    discarded: u64,
}

impl<S: Read + Write> Session<S> {
    pub fn new(
        stream: S,
        mut buffer: TransferBuffer,
        target: RelayTarget,
        policy: WritePolicy,
    ) -> Self {
        buffer.clear();
        Self {
            stream,
            buffer,
            target,
            policy,
            state: SessionState::Reading,
            received: 0,
            discarded: 0,
        }
    }

    /// Read until the stream would block, relaying each chunk.
    pub fn on_readable(&mut self) -> io::Result<Step> {
        match self.state {
            SessionState::Reading => {}
            SessionState::Writing | SessionState::Acknowledging => {
                return Ok(Step::AwaitWritable)
            }
            SessionState::Closed => return Ok(Step::Close),
        }

        loop {
            debug_assert_eq!(self.buffer.position(), 0);
            match self.buffer.read_from(&mut self.stream) {
                Ok(0) => return self.on_end_of_stream(),
                Ok(n) => {
                    self.received += n as u64;
                    self.buffer.flip();
                    debug_assert_eq!(self.buffer.limit(), n);
                    trace!(bytes = n, "Relaying chunk");

                    if !self.relay()? {
                        self.state = SessionState::Writing;
                        return Ok(Step::AwaitWritable);
                    }
                    self.buffer.clear();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::AwaitReadable)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Continue a pending write; resumes reading once the buffer is drained.
    pub fn on_writable(&mut self) -> io::Result<Step> {
        match self.state {
            SessionState::Writing => {
                if !self.drain()? {
                    return Ok(Step::AwaitWritable);
                }
                self.buffer.clear();
                self.state = SessionState::Reading;
                // Bytes may have arrived while only write readiness was registered.
                self.on_readable()
            }
            SessionState::Acknowledging => {
                if !self.send_to_peer()? {
                    return Ok(Step::AwaitWritable);
                }
                self.state = SessionState::Closed;
                Ok(Step::Close)
            }
            SessionState::Reading => Ok(Step::AwaitReadable),
            SessionState::Closed => Ok(Step::Close),
        }
    }

    fn on_end_of_stream(&mut self) -> io::Result<Step> {
        let ack = match &mut self.target {
            RelayTarget::Echo => None,
            RelayTarget::Sink { sink, ack } => {
                sink.file_mut().flush()?;
                (!ack.is_empty()).then(|| Arc::clone(ack))
            }
        };

        let Some(ack) = ack else {
            self.state = SessionState::Closed;
            return Ok(Step::Close);
        };

        self.buffer.clear();
        self.buffer.put_slice(&ack);
        self.buffer.flip();
        self.state = SessionState::Acknowledging;

        if self.send_to_peer()? {
            self.state = SessionState::Closed;
            Ok(Step::Close)
        } else {
            Ok(Step::AwaitWritable)
        }
    }

    /// Hand the flipped buffer to the relay target.
    ///
    /// Returns `false` when bytes remain and write readiness is needed.
    fn relay(&mut self) -> io::Result<bool> {
        if let RelayTarget::Sink { sink, .. } = &mut self.target {
            let dropped = write_blocking(&mut self.buffer, sink.file_mut(), self.policy)?;
            self.note_discarded(dropped);
            return Ok(true);
        }
        self.send_to_peer()
    }

    fn send_to_peer(&mut self) -> io::Result<bool> {
        match self.policy {
            WritePolicy::Drain => self.drain(),
            WritePolicy::Single => {
                match self.buffer.write_to(&mut self.stream) {
                    Ok(_) => {}
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
                let dropped = self.buffer.remaining();
                self.note_discarded(dropped);
                Ok(true)
            }
        }
    }

    /// Write until the buffer is empty or the stream would block.
    fn drain(&mut self) -> io::Result<bool> {
        while self.buffer.has_remaining() {
            match self.buffer.write_to(&mut self.stream) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn note_discarded(&mut self, dropped: usize) {
        if dropped > 0 {
            self.discarded += dropped as u64;
            warn!(
                dropped,
                total_discarded = self.discarded,
                "Partial write, discarding unsent bytes"
            );
        }
    }
}

impl<S> Session<S> {
    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Sink file this session writes to, if any.
    pub fn sink_path(&self) -> Option<&Path> {
        match &self.target {
            RelayTarget::Echo => None,
            RelayTarget::Sink { sink, .. } => Some(sink.path()),
        }
    }

    /// Tear the session down, returning its stream and buffer.
    pub fn into_parts(self) -> (S, TransferBuffer) {
        (self.stream, self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::relay::Sink;
    use std::collections::VecDeque;

    enum Chunk {
        Data(Vec<u8>),
        WouldBlock,
        Reset,
    }

    /// In-memory stream: scripted reads, quota-limited writes.
    ///
    /// An empty script reads as end-of-stream.
    #[derive(Default)]
    struct MockStream {
        input: VecDeque<Chunk>,
        output: Vec<u8>,
        /// Bytes accepted before writes report `WouldBlock`; `None` is unlimited.
        write_quota: Option<usize>,
        read_sizes: Vec<usize>,
        write_sizes: Vec<usize>,
    }

    impl MockStream {
        fn with_input(chunks: Vec<Chunk>) -> Self {
            Self {
                input: chunks.into(),
                ..Self::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read_sizes.push(buf.len());
            match self.input.pop_front() {
                None => Ok(0),
                Some(Chunk::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(Chunk::Reset) => Err(io::ErrorKind::ConnectionReset.into()),
                Some(Chunk::Data(mut data)) => {
                    let n = buf.len().min(data.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.input.push_front(Chunk::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_sizes.push(buf.len());
            let n = match self.write_quota {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(quota) => {
                    let n = buf.len().min(quota);
                    self.write_quota = Some(quota - n);
                    n
                }
                None => buf.len(),
            };
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn echo_session(stream: MockStream, capacity: usize, policy: WritePolicy) -> Session<MockStream> {
        Session::new(stream, TransferBuffer::new(capacity), RelayTarget::Echo, policy)
    }

    #[test]
    fn test_ping_echoed_before_end_of_stream() {
        let stream = MockStream::with_input(vec![Chunk::Data(b"ping".to_vec())]);
        let mut session = echo_session(stream, 1024, WritePolicy::Drain);

        assert_eq!(session.on_readable().unwrap(), Step::Close);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.stream().output, b"ping");
        assert_eq!(session.received(), 4);
        // One read for the data, one observing end-of-stream
        assert_eq!(session.stream().read_sizes.len(), 2);
    }

    #[test]
    fn test_reads_start_cleared_and_writes_match_reads() {
        let stream = MockStream::with_input(vec![
            Chunk::Data(b"abcdefghij".to_vec()),
            Chunk::WouldBlock,
        ]);
        let mut session = echo_session(stream, 4, WritePolicy::Drain);

        assert_eq!(session.on_readable().unwrap(), Step::AwaitReadable);
        assert_eq!(session.state(), SessionState::Reading);

        let stream = session.stream();
        // Every read was offered the whole buffer: position 0, limit = capacity
        assert!(stream.read_sizes.iter().all(|&len| len == 4));
        // Every write was offered exactly what the preceding read returned
        assert_eq!(stream.write_sizes, vec![4, 4, 2]);
        assert_eq!(stream.output, b"abcdefghij");
    }

    #[test]
    fn test_partial_write_switches_to_writing() {
        let mut stream = MockStream::with_input(vec![Chunk::Data(b"abcdefgh".to_vec())]);
        stream.write_quota = Some(3);
        let mut session = echo_session(stream, 8, WritePolicy::Drain);

        assert_eq!(session.on_readable().unwrap(), Step::AwaitWritable);
        assert_eq!(session.state(), SessionState::Writing);
        assert_eq!(session.stream().output, b"abc");

        // Readable while writing must not read into a buffer holding unsent bytes
        assert_eq!(session.on_readable().unwrap(), Step::AwaitWritable);
        assert_eq!(session.stream().read_sizes.len(), 1);

        let stream = session.stream_mut();
        stream.write_quota = None;
        stream.input.push_back(Chunk::Data(b"ij".to_vec()));
        stream.input.push_back(Chunk::WouldBlock);

        assert_eq!(session.on_writable().unwrap(), Step::AwaitReadable);
        assert_eq!(session.state(), SessionState::Reading);
        assert_eq!(session.stream().output, b"abcdefghij");
        assert_eq!(session.discarded(), 0);
    }

    #[test]
    fn test_single_write_policy_discards_remainder() {
        let mut stream = MockStream::with_input(vec![
            Chunk::Data(b"abcdefgh".to_vec()),
            Chunk::WouldBlock,
        ]);
        stream.write_quota = Some(3);
        let mut session = echo_session(stream, 8, WritePolicy::Single);

        assert_eq!(session.on_readable().unwrap(), Step::AwaitReadable);
        assert_eq!(session.state(), SessionState::Reading);
        assert_eq!(session.stream().output, b"abc");
        assert_eq!(session.stream().write_sizes, vec![8]);
        assert_eq!(session.discarded(), 5);
    }

    #[test]
    fn test_sink_stores_bytes_then_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.jpg");
        let target = RelayTarget::Sink {
            sink: Sink::create(&path).unwrap(),
            ack: Arc::from(&b"received\n"[..]),
        };
        let stream = MockStream::with_input(vec![
            Chunk::Data(b"\xff\xd8jpeg".to_vec()),
            Chunk::Data(b" bytes".to_vec()),
        ]);
        let mut session = Session::new(stream, TransferBuffer::new(16), target, WritePolicy::Drain);

        assert_eq!(session.sink_path(), Some(path.as_path()));
        assert_eq!(session.on_readable().unwrap(), Step::Close);
        assert_eq!(session.stream().output, b"received\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8jpeg bytes");
    }

    #[test]
    fn test_ack_waits_for_write_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let target = RelayTarget::Sink {
            sink: Sink::create(&path).unwrap(),
            ack: Arc::from(&b"ok"[..]),
        };
        let mut stream = MockStream::with_input(vec![Chunk::Data(b"data".to_vec())]);
        stream.write_quota = Some(0);
        let mut session = Session::new(stream, TransferBuffer::new(16), target, WritePolicy::Drain);

        assert_eq!(session.on_readable().unwrap(), Step::AwaitWritable);
        assert_eq!(session.state(), SessionState::Acknowledging);

        session.stream_mut().write_quota = None;
        assert_eq!(session.on_writable().unwrap(), Step::Close);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.stream().output, b"ok");
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn test_empty_ack_closes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let target = RelayTarget::Sink {
            sink: Sink::create(&dir.path().join("quiet.bin")).unwrap(),
            ack: Arc::from(&b""[..]),
        };
        let stream = MockStream::with_input(vec![Chunk::Data(b"x".to_vec())]);
        let mut session = Session::new(stream, TransferBuffer::new(16), target, WritePolicy::Drain);

        assert_eq!(session.on_readable().unwrap(), Step::Close);
        assert!(session.stream().output.is_empty());
    }

    #[test]
    fn test_read_error_propagates() {
        let stream = MockStream::with_input(vec![Chunk::Data(b"a".to_vec()), Chunk::Reset]);
        let mut session = echo_session(stream, 16, WritePolicy::Drain);

        let err = session.on_readable().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(session.stream().output, b"a");
    }

    #[test]
    fn test_into_parts_returns_buffer() {
        let stream = MockStream::with_input(vec![Chunk::WouldBlock]);
        let mut session = echo_session(stream, 32, WritePolicy::Drain);
        session.on_readable().unwrap();

        let (_, buffer) = session.into_parts();
        assert_eq!(buffer.capacity(), 32);
    }
}
