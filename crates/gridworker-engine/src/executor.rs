//! Per-slot subprocess supervision: build the watchdog/solver command
//! lines, fork+exec, poll non-blockingly, parse watchdog output, run the
//! verifier, and assemble the persisted job result.
//!
//! Ported from `original_source/src/client.cc` (`build_watcher_command`,
//! `build_solver_command`, `process_results`, `handle_workers`). Fork/exec
//! is translated to `tokio::process::Command`; `waitpid(…, WNOHANG)`
//! becomes `Child::try_wait`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

use gridworker_core::model::{Job, JobStatus, Parameter, ResultCode};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn watchdog: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Builds the `runsolver` invocation. Any limit whose value is `-1` is
/// omitted entirely, including `-O`, which requires *both* output-size
/// limits to be present since it emits a single `first,first+last` pair.
pub fn build_watcher_command(job: &Job, watcher_path: &str, wfile: &str, ofile: &str) -> Vec<String> {
    let mut cmd = vec![
        watcher_path.to_string(),
        "--timestamp".to_string(),
        "-w".to_string(),
        wfile.to_string(),
        "-o".to_string(),
        ofile.to_string(),
    ];
    if Job::has_limit(job.cpu_time_limit) {
        cmd.push("-C".to_string());
        cmd.push(job.cpu_time_limit.to_string());
    }
    if Job::has_limit(job.wall_clock_time_limit) {
        cmd.push("-W".to_string());
        cmd.push(job.wall_clock_time_limit.to_string());
    }
    if Job::has_limit(job.memory_limit) {
        cmd.push("-M".to_string());
        cmd.push(job.memory_limit.to_string());
    }
    if Job::has_limit(job.stack_size_limit) {
        cmd.push("-S".to_string());
        cmd.push(job.stack_size_limit.to_string());
    }
    if Job::has_limit(job.output_size_limit_first) && Job::has_limit(job.output_size_limit_last) {
        cmd.push("-O".to_string());
        cmd.push(format!(
            "{},{}",
            job.output_size_limit_first,
            job.output_size_limit_first + job.output_size_limit_last
        ));
    }
    cmd
}

/// Assembles the solver command line from the sorted parameter vector.
/// `seed` and `instance` are special-cased substitutions; everything else
/// emits `[space] prefix [space] value`, with `attachToPrevious` removing
/// the leading separator.
pub fn build_solver_command(
    run_command: &str,
    solver_base_path_absolute: &str,
    run_path: &str,
    params: &[Parameter],
    job: &Job,
    instance_path: &str,
) -> String {
    let mut cmd = String::new();
    if !run_command.is_empty() {
        cmd.push_str(run_command);
        cmd.push(' ');
    }
    cmd.push('"');
    cmd.push_str(solver_base_path_absolute);
    cmd.push('/');
    cmd.push_str(run_path);
    cmd.push('"');

    let mut sorted: Vec<&Parameter> = params.iter().collect();
    sorted.sort_by_key(|p| p.order);

    for p in sorted {
        if !p.attach_to_previous {
            cmd.push(' ');
        }
        cmd.push_str(&p.prefix);
        if !p.prefix.is_empty() && p.space {
            cmd.push(' ');
        }
        match p.name.as_str() {
            "seed" => cmd.push_str(&job.seed.to_string()),
            "instance" => {
                cmd.push('"');
                cmd.push_str(instance_path);
                cmd.push('"');
            }
            _ if p.has_value => cmd.push_str(&p.value),
            _ => {}
        }
    }
    cmd
}

/// Launches the watchdog as `/bin/bash -c <cmd>` with its working directory
/// set to the solver's absolute base path, so shell quoting and any
/// `runCommand` wrapper script behave exactly as on the original host.
pub fn spawn_watchdog(full_command: &str, solver_base_path_absolute: &Path) -> Result<Child, ExecutorError> {
    Command::new("/bin/bash")
        .arg("-c")
        .arg(full_command)
        .current_dir(solver_base_path_absolute)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(ExecutorError::Spawn)
}

/// How long a `kill`-based process tree teardown waits between SIGTERM and
/// the follow-up SIGKILL sweep, per `process.cc`'s `killProcessTree`.
const KILL_TREE_GRACE: Duration = Duration::from_secs(2);

/// Linux exposes a process's direct children without scanning all of
/// `/proc`, via the `task/<pid>/children` file (present since 3.5).
fn direct_children(pid: u32) -> Vec<u32> {
    std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

/// `pid` plus every descendant, in no particular order.
fn process_tree(pid: u32) -> Vec<u32> {
    let mut tree = vec![pid];
    let mut frontier = vec![pid];
    while let Some(p) = frontier.pop() {
        let kids = direct_children(p);
        frontier.extend(kids.iter().copied());
        tree.extend(kids);
    }
    tree
}

async fn signal_pid(pid: u32, signal: &str) {
    let _ = Command::new("kill").arg(signal).arg(pid.to_string()).status().await;
}

/// Sends SIGTERM to the whole subprocess tree rooted at `pid`, waits
/// `KILL_TREE_GRACE`, then SIGKILLs whatever is still around. A slot's
/// watchdog may itself fork children (the solver, a wrapper script) that
/// `Child::start_kill` never reaches, so a `kill <job_id>` control command
/// has to walk the tree rather than just signal the watchdog.
pub async fn kill_process_tree(pid: u32) {
    let tree = process_tree(pid);
    for &p in &tree {
        signal_pid(p, "-TERM").await;
    }
    tokio::time::sleep(KILL_TREE_GRACE).await;
    for &p in &tree {
        signal_pid(p, "-KILL").await;
    }
}

/// The watchdog result-parsing outcome before the verifier (if any) runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogOutcome {
    pub status: JobStatus,
    pub result_code: ResultCode,
    pub result_time: f64,
}

/// Parses the watchdog's text output. Token precedence matches the
/// original exactly: the limit/signal/exec-failure searches are
/// independent of the CPU-time search and override its tentative
/// `status=1` whenever present, because in the source those branches
/// `return` immediately regardless of where in the buffer the token
/// appears relative to "CPU time (s):".
pub fn parse_watchdog_output(output: &str) -> WatchdogOutcome {
    if output.contains("Maximum CPU time exceeded:") {
        return WatchdogOutcome {
            status: JobStatus::CPU_LIMIT,
            result_code: ResultCode::CPU_LIMIT,
            result_time: 0.0,
        };
    }
    if output.contains("Maximum wall clock time exceeded:") {
        return WatchdogOutcome {
            status: JobStatus::WALL_LIMIT,
            result_code: ResultCode::WALL_LIMIT,
            result_time: 0.0,
        };
    }
    if output.contains("Maximum VSize exceeded:") {
        return WatchdogOutcome {
            status: JobStatus::MEMORY_LIMIT,
            result_code: ResultCode::MEMORY_LIMIT,
            result_time: 0.0,
        };
    }
    if output.contains("Maximum stack size exceeded:") {
        return WatchdogOutcome {
            status: JobStatus::STACK_LIMIT,
            result_code: ResultCode::STACK_LIMIT,
            result_time: 0.0,
        };
    }
    if let Some(sig) = find_signal_token(output) {
        return WatchdogOutcome {
            status: JobStatus::SIGNAL_OR_EXEC_FAILURE,
            result_code: ResultCode::child_signalled(sig),
            result_time: 0.0,
        };
    }
    if output.contains("Child status: 126") {
        return WatchdogOutcome {
            status: JobStatus::SIGNAL_OR_EXEC_FAILURE,
            result_code: ResultCode::EXEC_BASH_MISSING,
            result_time: 0.0,
        };
    }
    if output.contains("Child status: 127") {
        return WatchdogOutcome {
            status: JobStatus::SIGNAL_OR_EXEC_FAILURE,
            result_code: ResultCode::EXEC_SOLVER_MISSING,
            result_time: 0.0,
        };
    }
    if let Some(t) = find_cpu_time(output) {
        return WatchdogOutcome {
            status: JobStatus::FINISHED,
            result_code: ResultCode::UNKNOWN,
            result_time: t,
        };
    }
    // Nothing recognized; the original leaves `status` at its prior value
    // (0, "running") in this case, which the caller should treat as
    // incomplete/unexpected output rather than silently success.
    WatchdogOutcome {
        status: JobStatus::RUNNING,
        result_code: ResultCode::UNKNOWN,
        result_time: 0.0,
    }
}

fn find_signal_token(output: &str) -> Option<i32> {
    let marker = "Child ended because it received signal ";
    let start = output.find(marker)? + marker.len();
    let rest = &output[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn find_cpu_time(output: &str) -> Option<f64> {
    let marker = "CPU time (s):";
    let start = output.find(marker)? + marker.len();
    let rest = output[start..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// If the watchdog child itself died by signal `sig`, this overrides
/// whatever `parse_watchdog_output` produced.
pub fn watchdog_crashed(outcome: WatchdogOutcome, sig: i32) -> WatchdogOutcome {
    let _ = outcome;
    WatchdogOutcome {
        status: JobStatus::watchdog_crashed(sig),
        result_code: ResultCode::UNKNOWN,
        result_time: 0.0,
    }
}

/// Runs the verifier (`<cmd> "<instance_path>" "<solver_out_path>"`),
/// capturing its stdout and exit code. Only called when `status` is still
/// `FINISHED` after watchdog parsing (no limit/signal/exec-failure was
/// seen).
pub async fn run_verifier(
    verifier_cmd: &str,
    instance_path: &str,
    solver_output_path: &str,
) -> std::io::Result<(Vec<u8>, i32)> {
    let output = Command::new("/bin/bash")
        .arg("-c")
        .arg(format!(
            "{verifier_cmd} {instance_path:?} {solver_output_path:?}"
        ))
        .output()
        .await?;
    let code = output.status.code().unwrap_or(-1);
    Ok((output.stdout, code))
}

/// The last whitespace-delimited integer following the final newline in
/// the verifier's stdout. `None` leaves `resultCode` at its prior value
/// (0, unknown) — the original only overwrites a *zero* `resultCode`.
pub fn parse_verifier_result_code(stdout: &[u8]) -> Option<i32> {
    let text = String::from_utf8_lossy(stdout);
    let last_line = text.lines().rev().find(|l| !l.trim().is_empty())?;
    last_line
        .split_whitespace()
        .last()
        .and_then(|tok| tok.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job() -> Job {
        Job {
            id_job: 7,
            id_solver_config: 1,
            id_experiment: 1,
            id_instance: 1,
            run: 0,
            seed: 42,
            status: JobStatus::RUNNING,
            result_time: 0.0,
            result_code: ResultCode::UNKNOWN,
            priority: 0,
            compute_queue: 1,
            compute_node: String::new(),
            compute_node_ip: String::new(),
            cpu_time_limit: 60,
            wall_clock_time_limit: -1,
            memory_limit: -1,
            stack_size_limit: -1,
            output_size_limit_first: -1,
            output_size_limit_last: -1,
            watcher_output: String::new(),
            launcher_output: String::new(),
            verifier_output: String::new(),
            solver_output: Vec::new(),
            solver_exit_code: 0,
            watcher_exit_code: 0,
            verifier_exit_code: 0,
            instance_file_name: String::new(),
        }
    }

    #[test]
    fn watcher_command_includes_only_present_limits() {
        let job = base_job();
        let cmd = build_watcher_command(&job, "runsolver", "w.w", "o.o");
        assert!(cmd.contains(&"-C".to_string()));
        assert!(cmd.contains(&"60".to_string()));
        assert!(!cmd.contains(&"-W".to_string()));
        assert!(!cmd.contains(&"-O".to_string()));
    }

    #[test]
    fn watcher_command_omits_output_limit_unless_both_present() {
        let mut job = base_job();
        job.output_size_limit_first = 10;
        // last still -1
        let cmd = build_watcher_command(&job, "runsolver", "w", "o");
        assert!(!cmd.contains(&"-O".to_string()));

        job.output_size_limit_last = 5;
        let cmd = build_watcher_command(&job, "runsolver", "w", "o");
        let idx = cmd.iter().position(|s| s == "-O").unwrap();
        assert_eq!(cmd[idx + 1], "10,15");
    }

    #[test]
    fn solver_command_scenario_1() {
        let job = base_job();
        let params = vec![
            Parameter {
                id_parameter: 1,
                name: "t".into(),
                prefix: "-t".into(),
                has_value: true,
                default_value: String::new(),
                order: 0,
                space: true,
                attach_to_previous: false,
                value: "4".into(),
            },
            Parameter {
                id_parameter: 2,
                name: "seed".into(),
                prefix: String::new(),
                has_value: false,
                default_value: String::new(),
                order: 1,
                space: true,
                attach_to_previous: false,
                value: String::new(),
            },
            Parameter {
                id_parameter: 3,
                name: "instance".into(),
                prefix: String::new(),
                has_value: false,
                default_value: String::new(),
                order: 2,
                space: true,
                attach_to_previous: false,
                value: String::new(),
            },
        ];
        let cmd = build_solver_command(
            "",
            "/base/solvers/mysolver",
            "bin/solve",
            &params,
            &job,
            "/base/instances/d41_in.cnf",
        );
        assert!(cmd.starts_with("\"/base/solvers/mysolver/bin/solve\""));
        assert!(cmd.ends_with("-t 4 42 \"/base/instances/d41_in.cnf\""));
    }

    #[test]
    fn attach_to_previous_suppresses_leading_separator() {
        let job = base_job();
        let params = vec![Parameter {
            id_parameter: 1,
            name: "x".into(),
            prefix: "=5".into(),
            has_value: false,
            default_value: String::new(),
            order: 0,
            space: false,
            attach_to_previous: true,
            value: String::new(),
        }];
        let cmd = build_solver_command("", "/base/solvers/s", "solve", &params, &job, "");
        assert_eq!(cmd, "\"/base/solvers/s/solve\"=5");
    }

    #[test]
    fn cpu_limit_token_wins() {
        let out = "blah\nMaximum CPU time exceeded: yes\nCPU time (s): 12.3\n";
        let outcome = parse_watchdog_output(out);
        assert_eq!(outcome.status, JobStatus::CPU_LIMIT);
        assert_eq!(outcome.result_code, ResultCode::CPU_LIMIT);
    }

    #[test]
    fn wall_limit_token() {
        let outcome = parse_watchdog_output("Maximum wall clock time exceeded: x\n");
        assert_eq!(outcome.status, JobStatus::WALL_LIMIT);
    }

    #[test]
    fn vsize_limit_token() {
        let outcome = parse_watchdog_output("Maximum VSize exceeded: x\n");
        assert_eq!(outcome.status, JobStatus::MEMORY_LIMIT);
    }

    #[test]
    fn signal_token() {
        let outcome = parse_watchdog_output("Child ended because it received signal 9\n");
        assert_eq!(outcome.status, JobStatus::SIGNAL_OR_EXEC_FAILURE);
        assert_eq!(outcome.result_code, ResultCode::child_signalled(9));
    }

    #[test]
    fn exec_failure_126() {
        let outcome = parse_watchdog_output("Child status: 126\n");
        assert_eq!(outcome.result_code, ResultCode::EXEC_BASH_MISSING);
    }

    #[test]
    fn exec_failure_127() {
        let outcome = parse_watchdog_output("Child status: 127\n");
        assert_eq!(outcome.result_code, ResultCode::EXEC_SOLVER_MISSING);
    }

    #[test]
    fn happy_path_cpu_time() {
        let outcome = parse_watchdog_output("blah\nCPU time (s): 12.3\nmore\n");
        assert_eq!(outcome.status, JobStatus::FINISHED);
        assert_eq!(outcome.result_time, 12.3);
    }

    #[test]
    fn verifier_trailing_integer_extracted() {
        assert_eq!(parse_verifier_result_code(b"all good\nfinal line 11\n"), Some(11));
    }

    #[test]
    fn verifier_no_integer_present() {
        assert_eq!(parse_verifier_result_code(b"no integer here\n"), None);
    }
}
