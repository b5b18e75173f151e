//! Library surface for the DIRCON emulator: the binary in `main.rs` is a
//! thin CLI/logging wrapper around these modules, split out so the
//! integration tests can drive a real `Server` over TCP/UDP in-process
//! without spawning a subprocess.

pub mod byte_codec;
pub mod config;
pub mod error;
pub mod gatt;
pub mod handlers;
pub mod mdns;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod uuid;
