//! Logging setup. `-v` (0..4) maps onto a `tracing` level; `-l` swaps the
//! writer from stdout to a non-blocking file appender named
//! `<host>_<ip>_<pid>_edacc_client.log` (spec.md §6.2), matching the
//! original's choice of log destination without reproducing its ad hoc
//! `fprintf`-based format.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Returns the `WorkerGuard` when logging to a file; it must be kept alive
/// for the process lifetime or buffered lines are dropped on exit.
pub fn init(verbosity: u8, log_to_file: bool, host: &str, ip: &str, pid: u32) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    if log_to_file {
        let file_name = format!("{host}_{ip}_{pid}_edacc_client.log");
        let file_appender = tracing_appender::rolling::never(".", file_name);
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
