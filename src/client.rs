//! Client role: stream a payload to a relay and collect its reply.
//!
//! The payload is pushed through a transfer buffer on a writer thread, which
//! half-closes the connection when the payload is exhausted. Meanwhile the
//! calling thread drains the reply until the relay closes its side, so an
//! echo larger than both socket buffers cannot wedge the two peers.

use crate::config::{Payload, SendSettings};
use crate::runtime::TransferBuffer;
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use tracing::debug;

/// Outcome of one transfer.
#[derive(Debug)]
pub struct Transfer {
    /// Payload bytes written before the half-close.
    pub sent: u64,
    /// Everything the relay sent back.
    pub reply: Bytes,
}

pub fn send(settings: &SendSettings) -> io::Result<Transfer> {
    let source: Box<dyn Read + Send> = match &settings.payload {
        Payload::File(path) => Box::new(
            File::open(path)
                .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?,
        ),
        Payload::Message(bytes) => Box::new(Cursor::new(bytes.clone())),
    };

    let mut stream = match settings.timeout {
        Some(timeout) => TcpStream::connect_timeout(&settings.connect, timeout)?,
        None => TcpStream::connect(settings.connect)?,
    };
    stream.set_read_timeout(settings.timeout)?;
    stream.set_write_timeout(settings.timeout)?;
    debug!(addr = %settings.connect, "Connected to relay");

    let writer = stream.try_clone()?;
    let buffer_size = settings.buffer_size;
    let uploader = thread::Builder::new()
        .name("client-writer".to_string())
        .spawn(move || upload(source, writer, buffer_size))?;

    let reply = drain_reply(&mut stream, settings.buffer_size);
    let sent = uploader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "writer thread panicked"))??;
    let reply = reply?;

    debug!(sent, received = reply.len(), "Transfer finished");
    Ok(Transfer { sent, reply })
}

/// Copy `source` to `stream` chunk by chunk, then half-close the write side.
fn upload<R: Read, W: Write + HalfClose>(
    mut source: R,
    mut stream: W,
    buffer_size: usize,
) -> io::Result<u64> {
    let mut buffer = TransferBuffer::new(buffer_size);
    let mut sent = 0u64;

    loop {
        let n = match buffer.read_from(&mut source) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buffer.flip();
        while buffer.has_remaining() {
            match buffer.write_to(&mut stream) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        sent += n as u64;
        buffer.clear();
    }

    stream.flush()?;
    stream.shutdown_write()?;
    Ok(sent)
}

/// Read until end-of-stream.
fn drain_reply<R: Read>(stream: &mut R, buffer_size: usize) -> io::Result<Bytes> {
    let mut buffer = TransferBuffer::new(buffer_size);
    let mut reply = BytesMut::new();

    loop {
        match buffer.read_from(stream) {
            Ok(0) => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        buffer.flip();
        reply.put(&mut buffer);
        buffer.clear();
    }

    Ok(reply.freeze())
}

/// Streams whose write direction can be closed on its own.
trait HalfClose {
    fn shutdown_write(&mut self) -> io::Result<()>;
}

impl HalfClose for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}
