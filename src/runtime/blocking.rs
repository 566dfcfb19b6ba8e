//! Thread-per-connection blocking server.
//!
//! Each accepted connection is handed to its own named thread, which drives
//! the same session state machine as the event loop over a blocking
//! `std::net::TcpStream`. Every thread owns its stream, its transfer buffer
//! and its relay target. The server only keeps a clone of each stream so
//! that shutdown can close it and join the thread.

use crate::config::ServeSettings;
use crate::runtime::{create_listener, Relay, Session, ShutdownHandle, Step, TransferBuffer};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after an accept failure that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct BlockingServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Relay,
    max_connections: usize,
    sessions: SessionTable,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    next_id: u64,
}

/// Clones of the streams owned by live session threads.
///
/// Shutdown closes these to unblock every session.
#[derive(Clone, Default)]
struct SessionTable(Arc<Mutex<Slab<TcpStream>>>);

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, Slab<TcpStream>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Track `stream`; the entry lives as long as the returned guard.
    fn track(&self, stream: TcpStream) -> SessionGuard {
        let key = self.lock().insert(stream);
        SessionGuard {
            key,
            table: self.clone(),
        }
    }

    /// Shut down both directions of every tracked stream.
    fn close_all(&self) -> usize {
        let sessions = self.lock();
        for (_, stream) in sessions.iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        sessions.len()
    }
}

/// Removes a session's entry from the table when its thread ends.
struct SessionGuard {
    key: usize,
    table: SessionTable,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.lock().try_remove(self.key);
    }
}

/// How long to wait before the next accept after `err`.
///
/// Failures scoped to one pending connection retry at once; anything else
/// (such as running out of descriptors) backs off.
fn accept_retry_delay(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

impl BlockingServer {
    pub fn bind(settings: &ServeSettings) -> io::Result<Self> {
        let relay = Relay::new(&settings.relay)?;
        let listener = create_listener(settings.listen, settings.backlog, false)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            relay,
            max_connections: settings.max_connections,
            sessions: SessionTable::default(),
            workers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::connected(Arc::clone(&self.shutdown), self.local_addr)
    }

    /// Accept connections until shut down. Sink creation failures end the loop.
    ///
    /// Either way every open connection is closed and its session thread
    /// joined before returning.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            mode = ?self.relay.mode(),
            write_policy = ?self.relay.policy(),
            buffer_size = self.relay.buffer_size(),
            "Blocking server started"
        );

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    let delay = accept_retry_delay(&e);
                    if delay.is_zero() {
                        debug!(error = %e, "Accept failed, retrying");
                    } else {
                        error!("Accept error: {}", e);
                        thread::sleep(delay);
                    }
                    continue;
                }
            };

            if self.shutdown.load(Ordering::Acquire) {
                drop(stream);
                self.stop();
                return Ok(());
            }

            self.workers.retain(|worker| !worker.is_finished());
            if self.sessions.len() >= self.max_connections {
                warn!(peer = %peer, "Connection limit reached");
                continue;
            }

            let tracked = match stream.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Failed to track connection");
                    continue;
                }
            };

            let target = match self.relay.open_target() {
                Ok(target) => target,
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            };
            let session = Session::new(
                stream,
                TransferBuffer::new(self.relay.buffer_size()),
                target,
                self.relay.policy(),
            );

            let conn_id = self.next_id;
            self.next_id += 1;
            let guard = self.sessions.track(tracked);

            let worker = thread::Builder::new()
                .name(format!("session-{conn_id}"))
                .spawn(move || {
                    let _guard = guard;
                    debug!(conn_id, peer = %peer, "Accepted connection");
                    match drive(session) {
                        Ok(received) => debug!(conn_id, peer = %peer, received, "Connection closed"),
                        Err(e) => debug!(conn_id, peer = %peer, error = %e, "Connection error"),
                    }
                })?;
            self.workers.push(worker);
        }
    }

    /// Close every open connection and wait for its session thread.
    fn stop(&mut self) {
        let closed = self.sessions.close_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Session thread panicked");
            }
        }
        info!(addr = %self.local_addr, closed, "Blocking server stopped");
    }
}

/// Run a session to completion on a blocking stream.
///
/// Returns the number of bytes received from the peer.
fn drive(mut session: Session<TcpStream>) -> io::Result<u64> {
    let mut step = session.on_readable()?;
    loop {
        step = match step {
            Step::Close => return Ok(session.received()),
            Step::AwaitReadable => session.on_readable()?,
            Step::AwaitWritable => session.on_writable()?,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelayMode, RelaySettings, RuntimeType};
    use crate::runtime::testing::{local_settings, pattern, round_trip};
    use std::io::{Read, Write};

    fn start(settings: ServeSettings) -> (SocketAddr, ShutdownHandle, JoinHandle<io::Result<()>>) {
        let server = BlockingServer::bind(&ServeSettings {
            runtime: RuntimeType::Blocking,
            ..settings
        })
        .unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        (addr, handle, thread::spawn(move || server.run()))
    }

    #[test]
    fn test_ping_echo() {
        let (addr, handle, join) = start(local_settings());

        assert_eq!(round_trip(addr, b"ping"), b"ping");

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_concurrent_sessions() {
        let (addr, handle, join) = start(local_settings());

        let clients: Vec<_> = (0..4u8)
            .map(|i| {
                thread::spawn(move || {
                    let payload = vec![i; 64 * 1024];
                    assert_eq!(round_trip(addr, &payload), payload);
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_sink_with_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        let (addr, handle, join) = start(ServeSettings {
            relay: RelaySettings {
                mode: RelayMode::Sink,
                sink_path: Some(path.clone()),
                ack: b"stored".to_vec(),
                ..RelaySettings::default()
            },
            ..local_settings()
        });

        let payload = pattern(4096 + 17);
        assert_eq!(round_trip(addr, &payload), b"stored");

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (addr, handle, join) = start(local_settings());

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        client.write_all(b"x").unwrap();
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();

        // The session is gone: nothing is echoed once run has returned
        let _ = client.write_all(b"y");
        let mut rest = Vec::new();
        match client.read_to_end(&mut rest) {
            Ok(_) => assert!(rest.is_empty()),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn test_session_table_guard_removes_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let b = a.try_clone().unwrap();

        let table = SessionTable::default();
        let first = table.track(a);
        let second = table.track(b);
        assert_eq!(table.len(), 2);

        drop(first);
        assert_eq!(table.len(), 1);
        assert_eq!(table.close_all(), 1);
        drop(second);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_accept_retry_delay() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_retry_delay(&aborted), Duration::ZERO);

        let exhausted = io::Error::new(io::ErrorKind::Other, "too many open files");
        assert_eq!(accept_retry_delay(&exhausted), ACCEPT_BACKOFF);
    }
}
