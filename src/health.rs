//! Health checks for a relay deployment.
//!
//! Every checker kind answers the same question through `verify`, so a
//! caller can run a mixed list without knowing what each one probes.
//! `verify_all` runs them concurrently and waits until every checker has
//! reported, like a count-down latch.
//!
//! Against a sink-mode relay every probe connection creates a sink file, so
//! `plan` opens exactly one and expects the acknowledgement instead of an
//! echo.

use crate::client::{self, Transfer};
use crate::config::{CheckSettings, Payload, RelayMode, SendSettings};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROBE: &[u8] = b"ping";

/// A service that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Up {
    pub service: String,
    pub elapsed: Duration,
}

/// A service that did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Down {
    pub service: String,
    pub reason: String,
}

impl fmt::Display for Up {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is UP ({} ms)", self.service, self.elapsed.as_millis())
    }
}

impl fmt::Display for Down {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is DOWN: {}", self.service, self.reason)
    }
}

#[derive(Debug, Clone)]
pub enum Checker {
    /// A TCP connection to the relay can be established.
    Endpoint { addr: SocketAddr, timeout: Duration },
    /// The relay answers a probe with `expect`: the probe itself when
    /// echoing, the acknowledgement when storing.
    RoundTrip {
        addr: SocketAddr,
        timeout: Duration,
        expect: Vec<u8>,
    },
    /// A sink file could be created at this path.
    SinkPath { path: PathBuf },
}

impl Checker {
    pub fn service(&self) -> String {
        match self {
            Checker::Endpoint { addr, .. } => format!("endpoint {addr}"),
            Checker::RoundTrip { addr, .. } => format!("round trip {addr}"),
            Checker::SinkPath { path } => format!("sink {}", path.display()),
        }
    }

    pub fn verify(&self) -> Result<Up, Down> {
        let service = self.service();
        debug!(service = %service, "Checking");
        let started = Instant::now();

        let outcome = match self {
            Checker::Endpoint { addr, timeout } => TcpStream::connect_timeout(addr, *timeout)
                .map(drop)
                .map_err(|e| e.to_string()),
            Checker::RoundTrip {
                addr,
                timeout,
                expect,
            } => round_trip(*addr, *timeout, expect),
            Checker::SinkPath { path } => sink_available(path),
        };

        match outcome {
            Ok(()) => Ok(Up {
                service,
                elapsed: started.elapsed(),
            }),
            Err(reason) => Err(Down { service, reason }),
        }
    }
}

/// Checkers suited to the relay described by `settings`.
///
/// A sink-mode relay gets a single round trip: it already proves the endpoint
/// accepts connections, and the sink path belongs to the relay, so it is not
/// checked for availability.
pub fn plan(settings: &CheckSettings) -> Vec<Checker> {
    match settings.mode {
        RelayMode::Echo => {
            let mut checkers = vec![
                Checker::Endpoint {
                    addr: settings.connect,
                    timeout: settings.timeout,
                },
                Checker::RoundTrip {
                    addr: settings.connect,
                    timeout: settings.timeout,
                    expect: PROBE.to_vec(),
                },
            ];
            if let Some(path) = &settings.sink_path {
                checkers.push(Checker::SinkPath { path: path.clone() });
            }
            checkers
        }
        RelayMode::Sink => vec![Checker::RoundTrip {
            addr: settings.connect,
            timeout: settings.timeout,
            expect: settings.ack.clone(),
        }],
    }
}

fn round_trip(addr: SocketAddr, timeout: Duration, expect: &[u8]) -> Result<(), String> {
    let settings = SendSettings {
        connect: addr,
        payload: Payload::Message(PROBE.to_vec()),
        buffer_size: 64,
        timeout: Some(timeout),
    };
    match client::send(&settings) {
        Ok(Transfer { reply, .. }) if reply == expect => Ok(()),
        Ok(Transfer { reply, .. }) => Err(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expect),
            String::from_utf8_lossy(&reply)
        )),
        Err(e) => Err(e.to_string()),
    }
}

fn sink_available(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err("path already exists".to_string());
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match std::fs::metadata(parent) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
        Ok(meta) if meta.is_dir() => Err(format!("{} is read-only", parent.display())),
        Ok(_) => Err(format!("{} is not a directory", parent.display())),
        Err(e) => Err(format!("{}: {e}", parent.display())),
    }
}

/// Run every checker on its own thread and wait for all of them.
///
/// Results come back in the same order as `checkers`.
pub fn verify_all(checkers: Vec<Checker>) -> Vec<Result<Up, Down>> {
    let count = checkers.len();
    let (tx, rx) = mpsc::channel();

    for (idx, checker) in checkers.into_iter().enumerate() {
        let worker_tx = tx.clone();
        let service = checker.service();
        let spawned = thread::Builder::new()
            .name(format!("check-{idx}"))
            .spawn(move || {
                let _ = worker_tx.send((idx, checker.verify()));
            });
        if let Err(e) = spawned {
            let _ = tx.send((
                idx,
                Err(Down {
                    service,
                    reason: format!("could not start check: {e}"),
                }),
            ));
        }
    }
    drop(tx);

    let mut results: Vec<Option<Result<Up, Down>>> = vec![None; count];
    for (idx, result) in rx {
        results[idx] = Some(result);
    }

    results
        .into_iter()
        .enumerate()
        .map(|(idx, result)| {
            result.unwrap_or_else(|| {
                Err(Down {
                    service: format!("check {idx}"),
                    reason: "check thread exited without reporting".to_string(),
                })
            })
        })
        .collect()
}

/// Log each result; true when everything is up.
pub fn report(results: &[Result<Up, Down>]) -> bool {
    let mut healthy = true;
    for result in results {
        match result {
            Ok(up) => info!(service = %up.service, elapsed_ms = up.elapsed.as_millis() as u64, "{up}"),
            Err(down) => {
                healthy = false;
                warn!(service = %down.service, reason = %down.reason, "{down}");
            }
        }
    }
    healthy
}
