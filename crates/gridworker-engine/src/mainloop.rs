//! The orchestrating loop: claims jobs into idle slots, reaps finished
//! children, drains the Control Channel, and backs off when the fleet is
//! idle. Ported from `original_source/src/client.cc`'s `main` loop
//! (design-level pseudocode in spec.md §4.6); `waitpid(…, WNOHANG)` becomes
//! `Child::try_wait`, and the deferred-signal region becomes a
//! [`crate::lifecycle::CancellationScope`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::mpsc;

use gridworker_core::model::{GridQueue, HostInfo, Job, JobStatus, ResultCode, Slot};
use gridworker_db::{Gateway, GatewayError};

use crate::artifact::{self, ArtifactError, ArtifactKind};
use crate::control::ControlCommand;
use crate::executor::{self, ExecutorError};
use crate::lifecycle::{CancellationScope, ShutdownFlag};
use crate::simulate::JobSource;

/// How often the message channel is drained, per spec.md §4.5.
pub const MESSAGE_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MainLoopError {
    #[error(transparent)]
    Database(#[from] GatewayError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Exec(#[from] ExecutorError),
}

pub struct MainLoopConfig {
    pub client_id: i32,
    pub grid_queue_id: i32,
    pub compute_node: String,
    pub compute_node_ip: String,
    pub base_path: PathBuf,
    pub num_slots: usize,
    pub initial_check_interval: Duration,
    pub upper_check_interval: Duration,
    pub wait_jobs_time: Duration,
    pub keep_output: bool,
    pub verifier_command: Option<String>,
}

/// spec.md §4.6 homogeneity guard. A grid-queue record with `num_cores==0`
/// and an empty `cpu_model` (not yet backfilled by `fill_grid_queue_info`)
/// is treated as "nothing to compare against" rather than a mismatch.
pub fn check_homogeneity(host: &HostInfo, grid: &GridQueue, allow_inhomogeneous: bool) -> Result<(), String> {
    let cores_mismatch = grid.num_cores != 0 && grid.num_cores != host.num_cores;
    let model_mismatch = !grid.cpu_model.is_empty() && grid.cpu_model != host.cpu_model;
    if !cores_mismatch && !model_mismatch {
        return Ok(());
    }
    let msg = format!(
        "host reports {} cores / \"{}\", grid queue {} expects {} cores / \"{}\"",
        host.num_cores, host.cpu_model, grid.name, grid.num_cores, grid.cpu_model
    );
    if allow_inhomogeneous {
        tracing::warn!("{msg}");
        Ok(())
    } else {
        Err(msg)
    }
}

/// `check_interval ← min(2·check_interval, max(UPPER, initial))`.
pub fn back_off(current: Duration, initial: Duration, upper: Duration) -> Duration {
    let doubled = current.saturating_mul(2);
    let cap = upper.max(initial);
    doubled.min(cap)
}

struct RunningJob {
    job: Job,
    child: Child,
    wfile: PathBuf,
    ofile: PathBuf,
    instance_path: PathBuf,
}

/// Fetches solver/instance artifacts, builds the watchdog command line, and
/// spawns it. Returns `None` if the scheduler found no job to claim. The
/// filesystem-lock identity reuses `client_id`: each worker here owns a
/// private `base_path`, so the original's separate "filesystem id" concept
/// collapses to "whichever client is writing this copy" (DESIGN.md).
async fn try_start_job(
    gateway: &Gateway,
    job_source: &mut JobSource,
    cfg: &MainLoopConfig,
) -> Result<Option<RunningJob>, MainLoopError> {
    let Some(job) = job_source
        .fetch_job(cfg.client_id, cfg.grid_queue_id, &cfg.compute_node, &cfg.compute_node_ip)
        .await?
    else {
        return Ok(None);
    };

    let solver = gateway.get_solver(job.id_solver_config).await?;
    let instance = gateway.get_instance(job.id_instance).await?;
    let params = gateway.get_solver_config_params(job.id_solver_config).await?;

    let solver_path = artifact::materialize(
        gateway.pool(),
        &cfg.base_path,
        ArtifactKind::Solver,
        solver.id_solver_binary,
        cfg.client_id,
        &solver.binary_name,
        &solver.md5,
        || async { gateway.get_solver_binary(solver.id_solver_binary).await },
    )
    .await?;

    let instance_path = artifact::materialize(
        gateway.pool(),
        &cfg.base_path,
        ArtifactKind::Instance,
        job.id_instance,
        cfg.client_id,
        &instance.name,
        &instance.md5,
        || async { gateway.get_instance_binary(job.id_instance).await },
    )
    .await?;

    let results_dir = cfg.base_path.join("results");
    tokio::fs::create_dir_all(&results_dir).await.ok();
    let wfile = results_dir.join(format!("{}_{}.w", cfg.compute_node, job.id_job));
    let ofile = results_dir.join(format!("{}_{}.o", cfg.compute_node, job.id_job));

    let watcher = executor::build_watcher_command(
        &job,
        &solver_path.to_string_lossy(),
        &wfile.to_string_lossy(),
        &ofile.to_string_lossy(),
    );
    let solver_cmd = executor::build_solver_command(
        &solver.run_command,
        &solver_path.to_string_lossy(),
        &solver.run_path,
        &params,
        &job,
        &instance_path.to_string_lossy(),
    );
    let full_command = format!("{} {}", watcher.join(" "), solver_cmd);

    let child = executor::spawn_watchdog(&full_command, &cfg.base_path)?;

    Ok(Some(RunningJob {
        job,
        child,
        wfile,
        ofile,
        instance_path,
    }))
}

/// Non-blocking check of a running slot. Returns `true` if the child has
/// exited and the slot was reaped (result persisted, slot freed).
async fn try_reap(
    job_source: &mut JobSource,
    client_id: i32,
    gateway: Option<&Gateway>,
    running: &mut RunningJob,
    verifier_command: Option<&str>,
    keep_output: bool,
) -> Result<bool, MainLoopError> {
    let status = match running.child.try_wait() {
        Ok(Some(status)) => status,
        Ok(None) => return Ok(false),
        Err(_) => return Ok(false),
    };

    let watcher_text = tokio::fs::read_to_string(&running.wfile).await.unwrap_or_default();
    let mut outcome = executor::parse_watchdog_output(&watcher_text);

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            outcome = executor::watchdog_crashed(outcome, sig);
        }
    }

    running.job.watcher_output = watcher_text;
    running.job.watcher_exit_code = status.code().unwrap_or(-1);
    running.job.status = outcome.status;
    running.job.result_code = outcome.result_code;
    running.job.result_time = outcome.result_time;

    if outcome.status == JobStatus::FINISHED {
        running.job.solver_output = tokio::fs::read(&running.ofile).await.unwrap_or_default();
        if let Some(verifier) = verifier_command {
            if let Ok((stdout, code)) = executor::run_verifier(
                verifier,
                &running.instance_path.to_string_lossy(),
                &running.ofile.to_string_lossy(),
            )
            .await
            {
                running.job.verifier_exit_code = code;
                running.job.verifier_output = String::from_utf8_lossy(&stdout).to_string();
                if let Some(rc) = executor::parse_verifier_result_code(&stdout) {
                    running.job.result_code = ResultCode(rc);
                }
            }
        }
    }

    job_source.update_job(&running.job, true).await?;
    if let (JobSource::Live(_), Some(gateway)) = (&job_source, gateway) {
        gateway.decrement_core_count(client_id, running.job.id_experiment).await?;
    }

    if !keep_output {
        let _ = tokio::fs::remove_file(&running.wfile).await;
        let _ = tokio::fs::remove_file(&running.ofile).await;
    }

    Ok(true)
}

/// Runs until the idle-exit window elapses or a `kill_client` command
/// drains every slot. Returns the simulation summary when `job_source` is
/// [`JobSource::Simulated`].
pub async fn run_main_loop(
    gateway: Gateway,
    mut job_source: JobSource,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    shutdown: ShutdownFlag,
    cfg: MainLoopConfig,
) -> Result<Option<String>, MainLoopError> {
    let mut slots: Vec<Slot> = vec![Slot::idle(); cfg.num_slots];
    let mut running: Vec<Option<RunningJob>> = (0..cfg.num_slots).map(|_| None).collect();
    let mut check_interval = cfg.initial_check_interval;
    let mut t_started_last_job = Instant::now();
    let mut wait_jobs_time = cfg.wait_jobs_time;
    let mut accepting_new_jobs = true;

    'outer: loop {
        let scope = CancellationScope::enter(&shutdown);

        if accepting_new_jobs {
            for i in 0..cfg.num_slots {
                if slots[i].used {
                    continue;
                }
                match try_start_job(&gateway, &mut job_source, &cfg).await {
                    Ok(Some(started)) => {
                        slots[i].used = true;
                        slots[i].pid = started.child.id();
                        slots[i].current_job = Some(started.job.clone());
                        t_started_last_job = Instant::now();
                        running[i] = Some(started);
                        check_interval = cfg.initial_check_interval;
                    }
                    Ok(None) => {
                        check_interval =
                            back_off(check_interval, cfg.initial_check_interval, cfg.upper_check_interval);
                        break;
                    }
                    // A permanent SQL error on one job's rows (bad record, constraint
                    // violation) shouldn't take the whole worker down — treat it like
                    // `NoJob` and let the scheduler retry the next slot.
                    Err(MainLoopError::Database(GatewayError::Query(err))) => {
                        tracing::warn!(%err, "permanent SQL error starting job, treating as no job available");
                        check_interval =
                            back_off(check_interval, cfg.initial_check_interval, cfg.upper_check_interval);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        for i in 0..cfg.num_slots {
            if let Some(r) = running[i].as_mut() {
                let live_gateway = matches!(job_source, JobSource::Live(_)).then_some(&gateway);
                if try_reap(
                    &mut job_source,
                    cfg.client_id,
                    live_gateway,
                    r,
                    cfg.verifier_command.as_deref(),
                    cfg.keep_output,
                )
                .await?
                {
                    running[i] = None;
                    slots[i] = Slot::idle();
                }
            }
        }

        while let Ok(cmd) = control_rx.try_recv() {
            match cmd {
                ControlCommand::Kill { job_id } => {
                    for r in running.iter_mut().flatten() {
                        if r.job.id_job == job_id {
                            r.job.status = JobStatus::CLIENT_ERROR;
                            r.job.result_code = ResultCode::UNKNOWN;
                            job_source.update_job(&r.job, true).await?;
                            if let Some(pid) = r.child.id() {
                                executor::kill_process_tree(pid).await;
                            }
                        }
                    }
                }
                ControlCommand::KillClientSoft => accepting_new_jobs = false,
                ControlCommand::KillClientHard => {
                    for r in running.iter_mut().flatten() {
                        r.job.status = JobStatus::CLIENT_ERROR;
                        r.job.result_code = ResultCode::UNKNOWN;
                        job_source.update_job(&r.job, true).await?;
                        if let Some(pid) = r.child.id() {
                            executor::kill_process_tree(pid).await;
                        }
                    }
                    break 'outer;
                }
                ControlCommand::WaitTime { seconds } => {
                    wait_jobs_time = Duration::from_secs(seconds.max(0) as u64);
                    t_started_last_job = Instant::now();
                }
            }
        }

        let idle = slots.iter().all(|s| !s.used);
        if idle && (!accepting_new_jobs || t_started_last_job.elapsed() > wait_jobs_time) {
            break;
        }

        if scope.close() {
            break;
        }
        tokio::time::sleep(check_interval).await;
    }

    Ok(job_source.summary().map(|s| s.report()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(cores: i32, model: &str) -> HostInfo {
        HostInfo {
            num_cores: cores,
            cpu_model: model.to_string(),
            ..Default::default()
        }
    }

    fn grid(cores: i32, model: &str) -> GridQueue {
        GridQueue {
            id: 1,
            name: "q".into(),
            location: String::new(),
            num_cpus: cores,
            num_cores: cores,
            cpu_model: model.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn matching_host_passes() {
        assert!(check_homogeneity(&host(4, "Xeon"), &grid(4, "Xeon"), false).is_ok());
    }

    #[test]
    fn mismatch_is_fatal_without_flag() {
        assert!(check_homogeneity(&host(4, "Xeon"), &grid(8, "Xeon"), false).is_err());
    }

    #[test]
    fn mismatch_is_tolerated_with_flag() {
        assert!(check_homogeneity(&host(4, "Xeon"), &grid(8, "Xeon"), true).is_ok());
    }

    #[test]
    fn blank_grid_record_is_not_a_mismatch() {
        assert!(check_homogeneity(&host(4, "Xeon"), &grid(0, ""), false).is_ok());
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let initial = Duration::from_millis(100);
        let upper = Duration::from_millis(10_000);
        let mut cur = initial;
        for _ in 0..20 {
            cur = back_off(cur, initial, upper);
        }
        assert_eq!(cur, upper);
    }

    #[test]
    fn backoff_never_drops_below_initial_even_with_a_smaller_upper() {
        let initial = Duration::from_millis(500);
        let upper = Duration::from_millis(200);
        assert_eq!(back_off(initial, initial, upper), initial * 2);
    }
}
