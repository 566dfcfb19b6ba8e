//! Connection multiplexer over `mio::Poll`.
//!
//! Every registered resource holds exactly one `Readiness` interest.
//! Registering an already-registered token replaces its interest instead of
//! adding to it. The listener is registered for `Accept`, which maps to
//! readable readiness on the listening socket.
//!
//! Deregistering a token that was never registered is a no-op that
//! reports `false`.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Token reserved for the shutdown waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// The single readiness kind a resource is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Accept,
    Read,
    Write,
}

impl Readiness {
    fn interest(self) -> Interest {
        match self {
            Readiness::Accept | Readiness::Read => Interest::READABLE,
            Readiness::Write => Interest::WRITABLE,
        }
    }
}

/// One entry of a readiness set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub token: Token,
    pub acceptable: bool,
    pub readable: bool,
    pub writable: bool,
}

impl Ready {
    /// True for the shutdown waker rather than a registered resource.
    pub fn is_wake(&self) -> bool {
        self.token == WAKER_TOKEN
    }
}

/// Resources ready after one wait, in the order the OS reported them.
#[derive(Debug, Default)]
pub struct ReadinessSet {
    entries: Vec<Ready>,
}

impl ReadinessSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Ready> {
        self.entries.iter()
    }
}

impl IntoIterator for ReadinessSet {
    type Item = Ready;
    type IntoIter = std::vec::IntoIter<Ready>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registered: HashMap<Token, Readiness>,
}

impl Multiplexer {
    /// Create a multiplexer that reports up to `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            waker,
            registered: HashMap::new(),
        })
    }

    /// Handle that interrupts `wait_for_ready` from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Register `source` under `token`, replacing any previous interest.
    pub fn register<S>(&mut self, source: &mut S, token: Token, readiness: Readiness) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        debug_assert_ne!(token, WAKER_TOKEN, "token reserved for the waker");
        match self.registered.get(&token) {
            Some(&current) if current == readiness => return Ok(()),
            Some(_) => self
                .poll
                .registry()
                .reregister(source, token, readiness.interest())?,
            None => self
                .poll
                .registry()
                .register(source, token, readiness.interest())?,
        }
        self.registered.insert(token, readiness);
        Ok(())
    }

    /// Remove `source` from the multiplexer.
    ///
    /// Returns `Ok(false)` without touching the OS if `token` is unknown.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<bool>
    where
        S: Source + ?Sized,
    {
        if self.registered.remove(&token).is_none() {
            debug!(token = token.0, "Deregister of unknown token ignored");
            return Ok(false);
        }
        self.poll.registry().deregister(source)?;
        Ok(true)
    }

    /// Current interest of `token`, if registered.
    #[cfg(test)]
    pub fn interest_of(&self, token: Token) -> Option<Readiness> {
        self.registered.get(&token).copied()
    }

    /// Number of registered resources (the waker is not counted).
    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    /// Block until at least one resource is ready.
    ///
    /// Interrupted and empty waits are logged and retried, so the returned
    /// set is never empty.
    pub fn wait_for_ready(&mut self) -> io::Result<ReadinessSet> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    warn!("Readiness wait interrupted, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut entries = Vec::with_capacity(self.events.iter().count());
            for event in self.events.iter() {
                let token = event.token();
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let kind = self.registered.get(&token).copied();
                entries.push(Ready {
                    token,
                    acceptable: kind == Some(Readiness::Accept) && readable,
                    readable: kind == Some(Readiness::Read) && readable,
                    writable: kind == Some(Readiness::Write)
                        && (event.is_writable() || event.is_write_closed() || event.is_error()),
                });
            }

            if entries.is_empty() {
                debug!("Spurious wakeup with no events");
                continue;
            }
            return Ok(ReadinessSet { entries });
        }
    }
}
