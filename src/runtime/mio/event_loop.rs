//! mio event loop implementation.
//!
//! Readiness-based model: the multiplexer tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls. Each wait result is
//! processed in the order it was reported, fully handling one entry before
//! moving to the next.
//!
//! The listener is registered for accept readiness only. Accepted
//! connections start out registered for read readiness and switch to write
//! readiness only while an echo is waiting for the peer to drain.

use super::multiplexer::{Multiplexer, Readiness, Ready};
use crate::config::ServeSettings;
use crate::runtime::{
    create_listener, BufferPool, Connection, ConnectionRegistry, Relay, Session,
    ShutdownHandle, Step,
};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

type MioConnection = Connection<TcpStream>;

/// Single-threaded multiplexed relay server.
pub struct EventLoop {
    mux: Multiplexer,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry<MioConnection>,
    buffers: BufferPool,
    relay: Relay,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    /// Bind the listening socket and register it for accept readiness.
    pub fn bind(settings: &ServeSettings) -> io::Result<Self> {
        let relay = Relay::new(&settings.relay)?;
        let mut mux = Multiplexer::new(settings.events_capacity)?;

        let listener = create_listener(settings.listen, settings.backlog, true)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;
        mux.register(&mut listener, LISTENER_TOKEN, Readiness::Accept)?;

        Ok(Self {
            mux,
            listener,
            local_addr,
            connections: ConnectionRegistry::new(settings.max_connections),
            buffers: BufferPool::new(settings.max_connections, settings.relay.buffer_size),
            relay,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::polled(Arc::clone(&self.shutdown), self.mux.waker())
    }

    /// Serve until shut down. Sink creation failures end the loop.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            mode = ?self.relay.mode(),
            write_policy = ?self.relay.policy(),
            buffer_size = self.relay.buffer_size(),
            "Event loop started"
        );

        loop {
            let ready = self.mux.wait_for_ready()?;
            trace!(ready = ready.len(), "Readiness wait returned");

            for entry in ready {
                if entry.is_wake() {
                    if self.shutdown.load(Ordering::Acquire) {
                        let open = self.connections.len();
                        self.close_all();
                        info!(
                            addr = %self.local_addr,
                            closed = open,
                            registered = self.mux.registered(),
                            "Event loop stopped"
                        );
                        return Ok(());
                    }
                    continue;
                }

                if entry.token == LISTENER_TOKEN {
                    if entry.acceptable {
                        self.accept_connections()?;
                    }
                    continue;
                }

                let conn_id = entry.token.0;
                if let Err(e) = self.handle_connection_event(conn_id, entry) {
                    debug!(conn_id, error = %e, "Connection error");
                    self.close_connection(conn_id);
                }
            }
        }
    }

    /// Accept every pending connection and register each for read readiness.
    ///
    /// A wake with nothing to accept registers nothing.
    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    return Ok(());
                }
            };

            if self.connections.is_full() {
                warn!(peer = %peer, "Connection limit reached");
                continue;
            }

            let target = self.relay.open_target()?;
            let session = Session::new(stream, self.buffers.acquire(), target, self.relay.policy());

            let conn_id = match self.connections.insert(Connection::new(peer, session)) {
                Ok(id) => id,
                Err(conn) => {
                    warn!(peer = %peer, "Connection limit reached");
                    self.buffers.release(conn.session.into_parts().1);
                    continue;
                }
            };

            let Some(conn) = self.connections.get_mut(conn_id) else {
                continue;
            };
            let sink = conn.session.sink_path().map(|p| p.display().to_string());
            if let Err(e) =
                self.mux
                    .register(conn.session.stream_mut(), Token(conn_id), Readiness::Read)
            {
                debug!(conn_id, error = %e, "Failed to register connection");
                self.close_connection(conn_id);
                continue;
            }

            debug!(
                conn_id,
                peer = %peer,
                sink = ?sink,
                open = self.connections.len(),
                "Accepted connection"
            );
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, entry: Ready) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        let step = if entry.writable {
            conn.session.on_writable()?
        } else if entry.readable {
            conn.session.on_readable()?
        } else {
            return Ok(());
        };

        let readiness = match step {
            Step::AwaitReadable => Readiness::Read,
            Step::AwaitWritable => Readiness::Write,
            Step::Close => {
                self.close_connection(conn_id);
                return Ok(());
            }
        };

        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.mux
            .register(conn.session.stream_mut(), Token(conn_id), readiness)
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.remove(conn_id) {
            self.retire(conn_id, conn);
        }
    }

    /// Deregister and close every connection, then the listener.
    fn close_all(&mut self) {
        let open: Vec<_> = self.connections.drain().collect();
        for (conn_id, conn) in open {
            self.retire(conn_id, conn);
        }
        let _ = self.mux.deregister(&mut self.listener, LISTENER_TOKEN);
    }

    fn retire(&mut self, conn_id: usize, conn: MioConnection) {
        let Connection { peer, mut session } = conn;
        let _ = self.mux.deregister(session.stream_mut(), Token(conn_id));

        let received = session.received();
        let discarded = session.discarded();
        let (stream, buffer) = session.into_parts();
        drop(stream);
        self.buffers.release(buffer);

        debug!(conn_id, peer = %peer, received, discarded, "Connection closed");
    }
}
