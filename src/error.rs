//! Error taxonomy for the emulator.
//!
//! Each fallible component gets its own enum; only startup-time variants
//! (bind/listen/config) are ever allowed to terminate the process. Every
//! other error is logged and handled at the session or datagram level.

use std::net::AddrParseError;
use thiserror::Error;

/// Errors from the byte cursor codec (§4.1).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
}

/// Errors from DIRCON frame parsing (§4.4, §4.5.7).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("short or malformed frame header")]
    ShortHeader,
    #[error("mesg_len {mesg_len} exceeds rx buffer size {limit}")]
    LengthExceedsBuffer { mesg_len: usize, limit: usize },
    #[error("unknown protocol version {0:#04x}")]
    UnknownVersion(u8),
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),
    #[error("connection dropped")]
    ConnectionDropped,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced while building or querying the mDNS responder (§4.8).
#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("malformed name: label length overruns buffer")]
    LabelOverrun,
    #[error("malformed name: reserved pointer pattern {0:#04b}")]
    ReservedPointerPattern(u8),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from CLI-flag parsing (§4.10, §6). All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown flag: {0}")]
    UnknownFlag(String),
    #[error("flag {flag} requires a value")]
    MissingValue { flag: &'static str },
    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: &'static str, value: String },
    #[error("tcp port {0} out of range 1024..=49151")]
    PortOutOfRange(u32),
    #[error("invalid ip address: {0}")]
    InvalidAddress(#[from] AddrParseError),
    #[error("invalid supported power range: {0}")]
    InvalidPowerRange(String),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("invalid log destination: {0}")]
    InvalidLogDest(String),
}

/// Top-level fatal error returned from `main`.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind TCP listener on {addr}: {source}")]
    TcpBind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind mDNS socket: {0}")]
    MdnsBind(std::io::Error),
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
