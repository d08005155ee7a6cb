//! Command-line flags (spec.md §6.2). `-h` means "allow running on
//! inhomogeneous hosts" in this protocol, so it cannot double as clap's
//! default help flag; `--help` is reinstated as its own long-only flag.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gridworker", disable_help_flag = true)]
pub struct Cli {
    /// Log verbosity, 0..4.
    #[arg(short = 'v', default_value_t = 1)]
    pub verbosity: u8,

    /// Log to `<host>_<ip>_<pid>_edacc_client.log` instead of stdout.
    #[arg(short = 'l')]
    pub log_to_file: bool,

    /// Idle-exit window, in seconds.
    #[arg(short = 'w')]
    pub wait_jobs_time: Option<u64>,

    /// Initial `check_jobs_interval`, in milliseconds.
    #[arg(short = 'i')]
    pub check_interval_ms: Option<u64>,

    /// Retain solver/watcher output files after the job is persisted.
    #[arg(short = 'k')]
    pub keep_output: bool,

    /// Base path for `instances/`, `solvers/`, `results/`.
    #[arg(short = 'b', default_value = ".")]
    pub base_path: PathBuf,

    /// Allow running on hosts whose CPU differs from the grid queue record.
    #[arg(short = 'h')]
    pub allow_inhomogeneous: bool,

    /// Simulation mode: no DB writes, enumerate jobs, summarize statuses.
    #[arg(short = 's')]
    pub simulate: bool,

    /// Print usage and exit 0.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    _help: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_flag_is_allow_inhomogeneous_not_help() {
        let cli = Cli::parse_from(["gridworker", "-h"]);
        assert!(cli.allow_inhomogeneous);
    }

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["gridworker"]);
        assert_eq!(cli.verbosity, 1);
        assert!(!cli.log_to_file);
        assert_eq!(cli.base_path, PathBuf::from("."));
        assert!(!cli.simulate);
    }

    #[test]
    fn flags_with_arguments_parse() {
        let cli = Cli::parse_from(["gridworker", "-w", "600", "-i", "250", "-b", "/data"]);
        assert_eq!(cli.wait_jobs_time, Some(600));
        assert_eq!(cli.check_interval_ms, Some(250));
        assert_eq!(cli.base_path, PathBuf::from("/data"));
    }
}
