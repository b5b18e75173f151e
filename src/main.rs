use std::io::Write as IoWrite;

use dircon_emulator::config::{self, LogDest, ParsedArgs};
use dircon_emulator::error::FatalError;
use dircon_emulator::server::Server;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let parsed = match config::parse_args(&args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("{}", config::USAGE);
            std::process::exit(1);
        }
    };

    let cfg = match parsed {
        ParsedArgs::Help(usage) => {
            println!("{usage}");
            std::process::exit(0);
        }
        ParsedArgs::Version(v) => {
            println!("{v}");
            std::process::exit(0);
        }
        ParsedArgs::Run(cfg) => cfg,
    };

    if let Err(e) = init_logging(&cfg) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current-thread runtime");

    let result = runtime.block_on(async move {
        let server = Server::new(cfg);
        server.run().await
    });

    if let Err(e) = result {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

/// Wires `--log-level`/`--log-dest` into `env_logger`, per §4.11: console,
/// file, or a small fan-out `Write` duplicating to both.
fn init_logging(cfg: &config::Config) -> Result<(), FatalError> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(cfg.log_level);

    match cfg.log_dest {
        LogDest::Console => {
            builder.init();
        }
        LogDest::File => {
            let path = "dircon-emulator.log";
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| FatalError::LogFile { path: path.to_string(), source: e })?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
            builder.init();
        }
        LogDest::Both => {
            let path = "dircon-emulator.log";
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| FatalError::LogFile { path: path.to_string(), source: e })?;
            builder.target(env_logger::Target::Pipe(Box::new(FanOutWriter { file })));
            builder.init();
        }
    }

    Ok(())
}

/// Duplicates every write to both stderr and an open log file, for
/// `--log-dest both`.
struct FanOutWriter {
    file: std::fs::File,
}

impl IoWrite for FanOutWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}
