//! `nocc-server` entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use nocc_worker::{cron, logging, NoccServer, WorkerConfig};

#[derive(Parser)]
#[command(name = "nocc-server", version = nocc_worker::VERSION)]
struct Cli {
    /// Path to the worker config file.
    #[arg(long, short = 'c', default_value = "/etc/nocc/server.conf")]
    config: PathBuf,
}

fn failed_start(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("failed to start nocc-server: {message}");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    // single-dash -version / -v, the form ops scripts probe with
    if std::env::args().any(|a| a == "-version" || a == "-v") {
        println!("nocc-server {}", nocc_worker::VERSION);
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    let explicit_config = cli.config != PathBuf::from("/etc/nocc/server.conf");
    let config = match WorkerConfig::load(&cli.config, explicit_config) {
        Ok(config) => config,
        Err(e) => return failed_start(e),
    };

    let log_writer = match logging::init(&config.log_file_name, config.log_level) {
        Ok(writer) => writer,
        Err(e) => return failed_start(format!("can't init logger: {e}")),
    };
    logging::install_sigusr1_handler();

    let server = match NoccServer::new(&config) {
        Ok(server) => server,
        Err(e) => return failed_start(e),
    };

    {
        let server = server.clone();
        if let Err(e) = ctrlc::set_handler(move || server.quit_gracefully()) {
            return failed_start(format!("can't install signal handler: {e}"));
        }
    }

    {
        let server = server.clone();
        std::thread::spawn(move || cron::run_cron(server, log_writer));
    }

    if let Err(e) = server.start_listening() {
        return failed_start(e);
    }
    ExitCode::SUCCESS
}
