use std::sync::Arc;

use clap::{App, Arg};

use burrow::config;
use burrow::tun::{MemoryTunFactory, ShellExecutor};
use burrow::usecase::ClientUseCase;
use loam::logging;

pub fn main() {
    let matches = App::new("Burrow Client")
        .version("0.1.0")
        .about("Connects a burrow VPN client to its server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let cfg = match config::load_client(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load config {}: {}", config_path, err);
            std::process::exit(1);
        }
    };

    let log = logging::init(&cfg.logger.level);

    let factory = MemoryTunFactory::new("bur");
    let cmd = Arc::new(ShellExecutor::new(&cfg.system.shell));

    let uc = match ClientUseCase::new(&log, cfg, factory, cmd) {
        Ok(uc) => uc,
        Err(err) => {
            logging::crit!(log, "failed to create client"; "error" => %err);
            std::process::exit(1);
        }
    };

    if let Err(err) = uc.start() {
        logging::crit!(log, "failed to connect"; "error" => %err);
        std::process::exit(1);
    }

    loop {
        std::thread::park();
    }
}
