//! Relay server runtimes.
//!
//! Two variants share the same session logic:
//! - `mio`: one thread multiplexing every connection via epoll/kqueue
//! - `blocking`: one blocking thread per accepted connection
//!
//! Both share common abstractions:
//! - `TransferBuffer`: position/limit staging area between read and write
//! - `Session`: per-connection read/relay state machine
//! - `Relay`: per-connection relay target (echo or sink file)

mod blocking;
mod buffer;
mod connection;
mod mio;
mod relay;
mod session;

pub(crate) use buffer::{BufferPool, TransferBuffer};
pub(crate) use connection::{Connection, ConnectionRegistry};
pub(crate) use relay::Relay;
pub(crate) use session::{Session, Step};

use crate::config::{RuntimeType, ServeSettings};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use self::blocking::BlockingServer;
pub use self::mio::EventLoop;

/// A bound relay server of either variant.
pub enum Server {
    Mio(EventLoop),
    Blocking(BlockingServer),
}

impl Server {
    /// Bind the listener and open nothing else; sink files are created per
    /// connection once `run` starts accepting.
    pub fn bind(settings: &ServeSettings) -> io::Result<Self> {
        match settings.runtime {
            RuntimeType::Mio => EventLoop::bind(settings).map(Server::Mio),
            RuntimeType::Blocking => BlockingServer::bind(settings).map(Server::Blocking),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Mio(server) => server.local_addr(),
            Server::Blocking(server) => server.local_addr(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        match self {
            Server::Mio(server) => server.shutdown_handle(),
            Server::Blocking(server) => server.shutdown_handle(),
        }
    }

    /// Serve until shut down or a fatal error occurs.
    pub fn run(self) -> io::Result<()> {
        match self {
            Server::Mio(server) => server.run(),
            Server::Blocking(server) => server.run(),
        }
    }
}

/// Stops a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Wake,
}

#[derive(Debug, Clone)]
enum Wake {
    /// Wake the multiplexer directly.
    Poll(Arc<::mio::Waker>),
    /// Unblock a blocking accept by connecting to the listener.
    Connect(SocketAddr),
}

impl ShutdownHandle {
    pub(crate) fn polled(flag: Arc<AtomicBool>, waker: Arc<::mio::Waker>) -> Self {
        Self {
            flag,
            wake: Wake::Poll(waker),
        }
    }

    pub(crate) fn connected(flag: Arc<AtomicBool>, listen: SocketAddr) -> Self {
        let mut target = listen;
        if target.ip().is_unspecified() {
            target.set_ip(match listen {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }
        Self {
            flag,
            wake: Wake::Connect(target),
        }
    }

    /// Ask the server to close its listener and connections and return.
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        match &self.wake {
            Wake::Poll(waker) => waker.wake(),
            Wake::Connect(addr) => TcpStream::connect(addr).map(drop),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Create a TCP listener with SO_REUSEADDR and an explicit backlog.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: u32,
    nonblocking: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
