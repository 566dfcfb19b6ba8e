//! Configuration module for echo-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "echo-relay")]
#[command(author = "echo-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexed TCP echo and file-sink relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Stream a file or message to a relay and print its reply
    Send(SendArgs),
    /// Verify that a relay endpoint and sink location are usable
    Check(CheckArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 0.0.0.0:8899)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Server variant: single-threaded multiplexed or thread-per-connection
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Maximum number of simultaneously open connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Where received bytes go: back to the peer, or into a new file
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<RelayMode>,

    /// Destination file for sink mode (must not exist yet)
    #[arg(short = 's', long)]
    pub sink_path: Option<PathBuf>,

    /// Reply sent to the client after a sink transfer completes
    #[arg(long)]
    pub ack: Option<String>,

    /// Transfer buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// What to do when a write cannot take the whole buffer
    #[arg(short = 'w', long, value_enum)]
    pub write_policy: Option<WritePolicy>,
}

#[derive(Args, Debug, Default)]
pub struct SendArgs {
    /// Relay address to connect to
    #[arg(short = 'a', long)]
    pub connect: Option<String>,

    /// File whose bytes are streamed to the relay
    #[arg(short = 'f', long, conflicts_with = "message")]
    pub file: Option<PathBuf>,

    /// Literal message sent instead of a file
    #[arg(short = 'M', long)]
    pub message: Option<String>,

    /// Transfer buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Connect, read and write timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct CheckArgs {
    /// Relay address to probe
    #[arg(short = 'a', long)]
    pub connect: Option<String>,

    /// Sink destination to verify
    #[arg(short = 's', long)]
    pub sink_path: Option<PathBuf>,

    /// Mode the probed relay runs in
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<RelayMode>,

    /// Acknowledgement a sink-mode relay replies with
    #[arg(long)]
    pub ack: Option<String>,

    /// Per-check timeout in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,
}

/// Server variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// One thread, readiness multiplexing via mio (epoll/kqueue).
    #[default]
    Mio,
    /// One blocking thread per accepted connection.
    Blocking,
}

/// Destination of relayed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Write received bytes back to the sending connection.
    #[default]
    Echo,
    /// Store received bytes in a newly created file.
    Sink,
}

/// Handling of writes that accept fewer bytes than offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Keep unsent bytes and wait for write readiness until drained.
    #[default]
    Drain,
    /// Issue a single write per read cycle and discard whatever is left.
    Single,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub runtime: RuntimeType,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Capacity of the readiness event batch
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub mode: RelayMode,
    pub sink_path: Option<PathBuf>,
    #[serde(default = "default_ack")]
    pub ack: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub write_policy: WritePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            sink_path: None,
            ack: default_ack(),
            buffer_size: default_buffer_size(),
            write_policy: WritePolicy::default(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect")]
    pub connect: String,
    pub timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            timeout_ms: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8899".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_ack() -> String {
    "received\n".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

fn default_connect() -> String {
    "127.0.0.1:8899".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub action: Action,
}

/// What the process has been asked to do.
#[derive(Debug, Clone)]
pub enum Action {
    Serve(ServeSettings),
    Send(SendSettings),
    Check(CheckSettings),
}

/// Resolved settings for running a relay server.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub runtime: RuntimeType,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub relay: RelaySettings,
}

/// Resolved settings shared by every session of a server.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub sink_path: Option<PathBuf>,
    pub ack: Vec<u8>,
    pub buffer_size: usize,
    pub write_policy: WritePolicy,
}

/// Bytes the client streams to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    File(PathBuf),
    Message(Vec<u8>),
}

/// Resolved settings for the client role.
#[derive(Debug, Clone)]
pub struct SendSettings {
    pub connect: SocketAddr,
    pub payload: Payload,
    pub buffer_size: usize,
    pub timeout: Option<Duration>,
}

/// Resolved settings for health checks.
#[derive(Debug, Clone)]
pub struct CheckSettings {
    pub connect: SocketAddr,
    pub sink_path: Option<PathBuf>,
    /// Mode of the relay behind `connect`; decides what a probe expects back.
    pub mode: RelayMode,
    pub ack: Vec<u8>,
    pub timeout: Duration,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8899)),
            backlog: default_backlog(),
            runtime: RuntimeType::default(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
            relay: RelaySettings::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            sink_path: None,
            ack: default_ack().into_bytes(),
            buffer_size: default_buffer_size(),
            write_policy: WritePolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            relay,
            client,
            logging,
        } = toml_config;

        let action = match cli.command {
            Command::Serve(args) => Action::Serve(resolve_serve(args, server, relay)?),
            Command::Send(args) => Action::Send(resolve_send(args, client, &relay)?),
            Command::Check(args) => Action::Check(resolve_check(args, client, relay)?),
        };

        Ok(Config {
            log_level: cli.log_level.unwrap_or(logging.level),
            action,
        })
    }
}

fn resolve_serve(
    args: ServeArgs,
    server: ServerConfig,
    relay: RelayConfig,
) -> Result<ServeSettings, ConfigError> {
    let listen = parse_addr(&args.listen.unwrap_or(server.listen))?;
    let backlog = positive("backlog", args.backlog.unwrap_or(server.backlog))?;
    let max_connections = positive(
        "max_connections",
        args.max_connections.unwrap_or(server.max_connections),
    )?;
    let events_capacity = positive("events_capacity", server.events_capacity)?;
    let buffer_size = positive("buffer_size", args.buffer_size.unwrap_or(relay.buffer_size))?;

    let mode = args.mode.unwrap_or(relay.mode);
    let sink_path = args.sink_path.or(relay.sink_path);
    if mode == RelayMode::Sink && sink_path.is_none() {
        return Err(ConfigError::Invalid(
            "sink mode requires a sink_path".to_string(),
        ));
    }

    let ack = args.ack.unwrap_or(relay.ack).into_bytes();
    if ack.len() > buffer_size {
        return Err(ConfigError::Invalid(format!(
            "ack is {} bytes but buffer_size is only {buffer_size}",
            ack.len()
        )));
    }

    Ok(ServeSettings {
        listen,
        backlog,
        runtime: args.runtime.unwrap_or(server.runtime),
        max_connections,
        events_capacity,
        relay: RelaySettings {
            mode,
            sink_path,
            ack,
            buffer_size,
            write_policy: args.write_policy.unwrap_or(relay.write_policy),
        },
    })
}

fn resolve_send(
    args: SendArgs,
    client: ClientConfig,
    relay: &RelayConfig,
) -> Result<SendSettings, ConfigError> {
    let payload = match (args.file, args.message) {
        (Some(path), None) => Payload::File(path),
        (None, Some(message)) => Payload::Message(message.into_bytes()),
        _ => {
            return Err(ConfigError::Invalid(
                "send needs exactly one of --file or --message".to_string(),
            ))
        }
    };

    Ok(SendSettings {
        connect: parse_addr(&args.connect.unwrap_or(client.connect))?,
        payload,
        buffer_size: positive("buffer_size", args.buffer_size.unwrap_or(relay.buffer_size))?,
        timeout: args
            .timeout_ms
            .or(client.timeout_ms)
            .map(Duration::from_millis),
    })
}

fn resolve_check(
    args: CheckArgs,
    client: ClientConfig,
    relay: RelayConfig,
) -> Result<CheckSettings, ConfigError> {
    Ok(CheckSettings {
        connect: parse_addr(&args.connect.unwrap_or(client.connect))?,
        sink_path: args.sink_path.or(relay.sink_path),
        mode: args.mode.unwrap_or(relay.mode),
        ack: args.ack.unwrap_or(relay.ack).into_bytes(),
        timeout: args
            .timeout_ms
            .or(client.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CHECK_TIMEOUT),
    })
}

/// Parse `host:port`, resolving hostnames to their first address.
fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = value.parse() {
        return Ok(addr);
    }
    match value.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ConfigError::InvalidAddress(value.to_string(), "no addresses".into())),
        Err(e) => Err(ConfigError::InvalidAddress(value.to_string(), e.to_string())),
    }
}

fn positive<T: PartialEq + Default + Copy>(name: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String, String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidAddress(addr, reason) => {
                write!(f, "Invalid address '{addr}': {reason}")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
