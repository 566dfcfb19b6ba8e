//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS), all
//! connections serviced from a single thread.

mod event_loop;
mod multiplexer;

pub use event_loop::EventLoop;
