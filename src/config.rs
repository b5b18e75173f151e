//! Layered configuration (§4.10, §6): a hand-rolled `argv` walk producing
//! one immutable `Config`, built once at startup and threaded into
//! `Server::new`. No flag parsing happens anywhere else.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use log::LevelFilter;

use crate::error::ConfigError;
use crate::telemetry::ConstantTelemetry;

pub const DEFAULT_TCP_PORT: u16 = 36866;
pub const TCP_PORT_RANGE: std::ops::RangeInclusive<u32> = 1024..=49151;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerRange {
    pub min: i16,
    pub max: i16,
    pub inc: u16,
}

impl Default for PowerRange {
    fn default() -> Self {
        PowerRange { min: 0, max: 1500, inc: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDest {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub activity_path: Option<PathBuf>,
    pub telemetry: ConstantTelemetry,
    pub supported_power_range: PowerRange,
    pub tcp_port: u16,
    pub bind_addr: Ipv4Addr,
    pub mdns_enabled: bool,
    pub log_level: LevelFilter,
    pub log_dest: LogDest,
    pub dissect: Option<u8>,
    pub hex_dump: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            activity_path: None,
            telemetry: ConstantTelemetry { speed: 0, cadence: 0, heart_rate: 0, power: 0 },
            supported_power_range: PowerRange::default(),
            tcp_port: DEFAULT_TCP_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            mdns_enabled: true,
            log_level: LevelFilter::Info,
            log_dest: LogDest::Console,
            dissect: None,
            hex_dump: false,
        }
    }
}

impl Config {
    #[cfg(test)]
    pub fn default_for_tests() -> Self {
        Config::default()
    }
}

/// Outcome of parsing `argv`: either a validated config ready to run the
/// server, or one of the two short-circuiting flags.
#[derive(Debug)]
pub enum ParsedArgs {
    Run(Config),
    Help(&'static str),
    Version(&'static str),
}

pub const USAGE: &str = "\
Usage: dircon-emulator [OPTIONS]

  --activity <path>                 Replay telemetry from a recorded activity file
  --cadence <rpm>                   Constant cadence when no activity is active
  --speed <kph>                     Constant speed when no activity is active
  --power <W>                       Constant power when no activity is active
  --heart-rate <bpm>                Constant heart rate when no activity is active
  --supported-power-range <min,max,inc>  Default: 0,1500,1
  --tcp-port <1024..49151>          Default: 36866
  --ip-address <ipv4>               Interface address to bind
  --no-mdns                         Disable the mDNS responder
  --log-level {none,info,trace,debug}
  --log-dest {both,console,file}
  --dissect <mesg-id>               Trace-dump frames of the given message id
  --hex-dump                        Trace-dump raw frame bytes
  --help                            Print this message and exit
  --version                         Print version and exit
";

pub const VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

pub fn parse_args(args: &[String]) -> Result<ParsedArgs, ConfigError> {
    let mut cfg = Config::default();
    let mut i = 0;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" => return Ok(ParsedArgs::Help(USAGE)),
            "--version" => return Ok(ParsedArgs::Version(VERSION)),
            "--no-mdns" => {
                cfg.mdns_enabled = false;
            }
            "--hex-dump" => {
                cfg.hex_dump = true;
            }
            "--activity" => {
                cfg.activity_path = Some(PathBuf::from(next_value(args, &mut i, "--activity")?));
            }
            "--cadence" => {
                let rpm: f64 = parse_value(args, &mut i, "--cadence")?;
                cfg.telemetry.cadence = (rpm * 2.0).round() as u16;
            }
            "--speed" => {
                let kph: f64 = parse_value(args, &mut i, "--speed")?;
                cfg.telemetry.speed = (kph * 100.0).round() as u16;
            }
            "--power" => {
                cfg.telemetry.power = parse_value(args, &mut i, "--power")?;
            }
            "--heart-rate" => {
                cfg.telemetry.heart_rate = parse_value(args, &mut i, "--heart-rate")?;
            }
            "--supported-power-range" => {
                let raw = next_value(args, &mut i, "--supported-power-range")?;
                cfg.supported_power_range = parse_power_range(&raw)?;
            }
            "--tcp-port" => {
                let raw = next_value(args, &mut i, "--tcp-port")?;
                let port: u32 = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue { flag: "--tcp-port", value: raw.clone() })?;
                if !TCP_PORT_RANGE.contains(&port) {
                    return Err(ConfigError::PortOutOfRange(port));
                }
                cfg.tcp_port = port as u16;
            }
            "--ip-address" => {
                let raw = next_value(args, &mut i, "--ip-address")?;
                cfg.bind_addr = raw.parse()?;
            }
            "--log-level" => {
                let raw = next_value(args, &mut i, "--log-level")?;
                cfg.log_level = parse_log_level(&raw)?;
            }
            "--log-dest" => {
                let raw = next_value(args, &mut i, "--log-dest")?;
                cfg.log_dest = parse_log_dest(&raw)?;
            }
            "--dissect" => {
                cfg.dissect = Some(parse_value(args, &mut i, "--dissect")?);
            }
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        }
        i += 1;
    }

    Ok(ParsedArgs::Run(cfg))
}

fn next_value(args: &[String], i: &mut usize, flag: &'static str) -> Result<String, ConfigError> {
    *i += 1;
    args.get(*i).cloned().ok_or(ConfigError::MissingValue { flag })
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &'static str) -> Result<T, ConfigError> {
    let raw = next_value(args, i, flag)?;
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue { flag, value: raw })
}

fn parse_power_range(raw: &str) -> Result<PowerRange, ConfigError> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 3 {
        return Err(ConfigError::InvalidPowerRange(raw.to_string()));
    }
    let min: i16 = parts[0].parse().map_err(|_| ConfigError::InvalidPowerRange(raw.to_string()))?;
    let max: i16 = parts[1].parse().map_err(|_| ConfigError::InvalidPowerRange(raw.to_string()))?;
    let inc: u16 = parts[2].parse().map_err(|_| ConfigError::InvalidPowerRange(raw.to_string()))?;
    if min > max {
        return Err(ConfigError::InvalidPowerRange(raw.to_string()));
    }
    Ok(PowerRange { min, max, inc })
}

fn parse_log_level(raw: &str) -> Result<LevelFilter, ConfigError> {
    match raw {
        "none" => Ok(LevelFilter::Off),
        "info" => Ok(LevelFilter::Info),
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        _ => Err(ConfigError::InvalidLogLevel(raw.to_string())),
    }
}

fn parse_log_dest(raw: &str) -> Result<LogDest, ConfigError> {
    match raw {
        "both" => Ok(LogDest::Both),
        "console" => Ok(LogDest::Console),
        "file" => Ok(LogDest::File),
        _ => Err(ConfigError::InvalidLogDest(raw.to_string())),
    }
}
