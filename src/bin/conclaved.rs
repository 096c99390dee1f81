//! The conclave daemon: runs a single consensus node. The replicated state
//! machine is pluggable by the embedding database; standalone, the daemon
//! runs the log-only state machine, which is enough to form clusters and
//! replicate commands.

#![warn(clippy::all)]

use serde_derive::Deserialize;

use conclave::raft::{self, Engine, NullState};
use conclave::{storage, Error};

fn main() -> Result<(), Error> {
    let opts = clap::App::new("conclaved")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed consensus engine node")
        .arg(
            clap::Arg::with_name("config")
                .short("c")
                .long("config")
                .help("Configuration file path")
                .takes_value(true)
                .default_value("/etc/conclave.yaml"),
        )
        .get_matches();
    let cfg = Config::new(opts.value_of("config").unwrap())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>().map_err(|e| {
        Error::InvalidInput(format!("invalid log level {}: {e}", cfg.log_level))
    })?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("conclave");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())
        .map_err(|e| Error::InvalidInput(e.to_string()))?;

    let path = std::path::Path::new(&cfg.data_dir).join("log");
    let store = Box::new(storage::File::new(&path)?);
    let engine = Engine::new(
        &cfg.listen,
        store,
        Box::new(NullState::new()),
        raft::Options::default(),
    )?;

    if cfg.bootstrap {
        match engine.bootstrap() {
            Ok(()) => {}
            // Already a member from a previous run.
            Err(Error::InvalidInput(_)) => {}
            Err(e) => return Err(e),
        }
    }

    // Run until killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    listen: String,
    log_level: String,
    data_dir: String,
    bootstrap: bool,
}

impl Config {
    fn new(file: &str) -> Result<Self, Error> {
        let mut c = config::Config::new();
        c.set_default("listen", "0.0.0.0:9705")
            .and_then(|c| c.set_default("log_level", "info"))
            .and_then(|c| c.set_default("data_dir", "/var/lib/conclave"))
            .and_then(|c| c.set_default("bootstrap", false))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        c.merge(config::File::with_name(file))
            .and_then(|c| c.merge(config::Environment::with_prefix("CONCLAVE")))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        c.try_into().map_err(|e: config::ConfigError| Error::InvalidInput(e.to_string()))
    }
}
