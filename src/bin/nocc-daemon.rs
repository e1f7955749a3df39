//! `nocc-daemon` entry point.
//!
//! Spawned by the first wrapper invocation (`nocc-daemon start`) and exits
//! by itself once the build stops sending work. Prints `1` on stdout when
//! ready, so the spawning wrapper knows when to connect; any startup error
//! goes to stdout too (the wrapper is listening on that pipe).

use std::path::PathBuf;

use clap::Parser;

use nocc::{Daemon, DaemonConfig, DaemonUnixSockListener};

#[derive(Parser)]
#[command(name = "nocc-daemon", version = nocc::VERSION)]
struct Cli {
    /// Start serving (spawned by the wrapper).
    #[arg(value_name = "COMMAND")]
    command: Option<String>,

    /// Path to the daemon config file.
    #[arg(long, short = 'c', default_value = "/etc/nocc/daemon.conf")]
    config: PathBuf,
}

fn failed_start(message: impl std::fmt::Display) -> ! {
    // the parent wrapper reads our stdout
    println!("daemon not started: {message}");
    std::process::exit(1);
}

fn main() {
    // single-dash -version / -v, the form build scripts probe with
    if std::env::args().any(|a| a == "-version" || a == "-v") {
        println!("nocc-daemon {}", nocc::VERSION);
        return;
    }

    let cli = Cli::parse();

    if cli.command.as_deref() != Some("start") {
        eprintln!("usage: nocc-daemon start [--config <path>]");
        std::process::exit(1);
    }

    let explicit_config = cli.config != PathBuf::from("/etc/nocc/daemon.conf");
    let config = match DaemonConfig::load(&cli.config, explicit_config) {
        Ok(config) => config,
        Err(e) => failed_start(e),
    };

    if let Err(e) = nocc::logging::init(&config.log_file_name, config.log_level) {
        failed_start(format!("can't init logger: {e}"));
    }

    let daemon = Daemon::new(&config);
    daemon.start();

    let listener = match DaemonUnixSockListener::bind(&config.socket_path) {
        Ok(listener) => listener,
        Err(e) => failed_start(format!("can't listen on {}: {e}", config.socket_path)),
    };

    // SIGTERM/SIGINT: finish in-flight work bookkeeping, then exit
    {
        let daemon = daemon.clone();
        let listener = listener.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            daemon.quit_gracefully("got termination signal");
            listener.interrupt_accept();
        }) {
            failed_start(format!("can't install signal handler: {e}"));
        }
    }

    tracing::info!(
        "nocc-daemon started: clientID {}, socket {}",
        daemon.client_id,
        config.socket_path
    );
    println!("1");

    listener.serve(&daemon);
    daemon.quit_gracefully("listener closed");
}
