//! remapd daemon binary.
//!
//! Waits for a client on the control endpoint, grabs the devices the
//! client selects and remaps them until the client disconnects, then waits
//! for the next client. Press Ctrl+C to exit.

use clap::Parser;
use remapd::{Logger, MappingStage, Settings, daemon, log_error};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Key-remapping daemon
#[derive(Parser)]
#[command(name = "remapd", version, about)]
struct Cli {
    /// Print diagnostic output
    #[arg(short, long)]
    verbose: bool,

    /// Control endpoint (socket path or pipe name)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "error" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut settings = Settings::default().with_verbose(cli.verbose);
    if let Some(socket) = cli.socket {
        settings = settings.with_ipc_path(socket);
    }
    let log = Logger::new(settings.verbose);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        log_error!(log, "Failed to install Ctrl+C handler: {e}");
        return ExitCode::FAILURE;
    }

    match daemon::run::<MappingStage>(&settings, &shutdown, &log) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log_error!(log, "{e}");
            ExitCode::FAILURE
        }
    }
}
