//! Wire-stable data model shared by the DB Gateway, Scheduler, and Executor.
//!
//! Field names mirror the columns the core actually reads or writes; this is
//! not a full schema, only the slice the worker touches.

/// Snapshot of this node's hardware, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub num_cores: i32,
    pub num_threads: i32,
    pub hyperthreading: bool,
    pub turboboost: bool,
    pub cpu_model: String,
    pub cache_size: i32,
    pub cpu_flags: String,
    pub memory: u64,
    pub free_memory: u64,
    pub cpuinfo: String,
    pub meminfo: String,
    pub hostname: String,
    pub ip_address: String,
}

/// A logical partition of the fleet, read-only to the core.
#[derive(Debug, Clone, Default)]
pub struct GridQueue {
    pub id: i32,
    pub name: String,
    pub location: String,
    pub num_cpus: i32,
    pub num_cores: i32,
    pub cpu_model: String,
    pub description: String,
}

/// This worker's fleet-global row.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: i32,
    pub host_info: HostInfo,
    pub jobs_wait_time: i32,
    pub current_wait_time: i32,
}

#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: i32,
    pub name: String,
    pub priority: i32,
}

/// `(experiment_id, client_id) -> numCores`, mutated only by its owner.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentHasClient {
    pub experiment_id: i32,
    pub client_id: i32,
    pub num_cores: i32,
}

/// Stable, persisted job status code. Not a closed enum: the watchdog can in
/// principle report a signal number the core has never seen before
/// (`-400 - sig`), so arbitrary values must round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobStatus(pub i32);

impl JobStatus {
    pub const NOT_STARTED: JobStatus = JobStatus(-1);
    pub const RUNNING: JobStatus = JobStatus(0);
    pub const FINISHED: JobStatus = JobStatus(1);
    pub const CPU_LIMIT: JobStatus = JobStatus(21);
    pub const WALL_LIMIT: JobStatus = JobStatus(22);
    pub const MEMORY_LIMIT: JobStatus = JobStatus(23);
    /// Stack-size limit. Not present in the original source (a `TODO` there);
    /// assigned here per the open question in the design notes.
    pub const STACK_LIMIT: JobStatus = JobStatus(24);
    pub const SIGNAL_OR_EXEC_FAILURE: JobStatus = JobStatus(-3);
    pub const CLIENT_ERROR: JobStatus = JobStatus(-5);

    /// The watchdog itself was killed by signal `sig`.
    pub fn watchdog_crashed(sig: i32) -> JobStatus {
        JobStatus(-400 - sig)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const UNKNOWN: ResultCode = ResultCode(0);
    pub const CPU_LIMIT: ResultCode = ResultCode(-21);
    pub const WALL_LIMIT: ResultCode = ResultCode(-22);
    pub const MEMORY_LIMIT: ResultCode = ResultCode(-23);
    pub const STACK_LIMIT: ResultCode = ResultCode(-24);
    pub const EXEC_BASH_MISSING: ResultCode = ResultCode(-398);
    pub const EXEC_SOLVER_MISSING: ResultCode = ResultCode(-399);

    pub fn child_signalled(sig: i32) -> ResultCode {
        ResultCode(-(300 + sig))
    }
}

/// Resource limits and bookkeeping for a single solver run.
#[derive(Debug, Clone)]
pub struct Job {
    pub id_job: i32,
    pub id_solver_config: i32,
    pub id_experiment: i32,
    pub id_instance: i32,
    pub run: i32,
    pub seed: i32,
    pub status: JobStatus,
    pub result_time: f64,
    pub result_code: ResultCode,
    pub priority: i32,
    pub compute_queue: i32,
    pub compute_node: String,
    pub compute_node_ip: String,

    pub cpu_time_limit: i32,
    pub wall_clock_time_limit: i32,
    pub memory_limit: i32,
    pub stack_size_limit: i32,
    pub output_size_limit_first: i32,
    pub output_size_limit_last: i32,

    pub watcher_output: String,
    pub launcher_output: String,
    pub verifier_output: String,
    pub solver_output: Vec<u8>,

    pub solver_exit_code: i32,
    pub watcher_exit_code: i32,
    pub verifier_exit_code: i32,

    /// Not persisted; carried alongside the job for the verifier invocation.
    pub instance_file_name: String,
}

impl Job {
    /// `-1` means "no limit" for every resource field; this is the one test
    /// spec.md calls out explicitly (§8 boundary behaviors).
    pub fn has_limit(value: i32) -> bool {
        value != -1
    }
}

#[derive(Debug, Clone)]
pub struct SolverBinary {
    pub id_solver_binary: i32,
    pub solver_name: String,
    pub binary_name: String,
    pub md5: String,
    pub run_command: String,
    pub run_path: String,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id_instance: i32,
    pub name: String,
    pub md5: String,
}

/// A single solver command-line parameter. Sorted by `order` before use.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub id_parameter: i32,
    pub name: String,
    pub prefix: String,
    pub has_value: bool,
    pub default_value: String,
    pub order: i32,
    pub space: bool,
    pub attach_to_previous: bool,
    pub value: String,
}

/// `(binary_id, filesystem_id) -> lastReport`, shared across all workers on
/// one filesystem.
#[derive(Debug, Clone)]
pub struct FsDownloadLock {
    pub binary_id: i32,
    pub filesystem_id: i32,
    pub last_report_age_secs: i64,
}

/// One of `numCPUs` per-worker execution contexts. Replaces the original's
/// module-level `workers[]` array and `downloading_job` static (design
/// notes §9): the Main Loop owns a `Vec<Slot>` and passes it by reference.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub used: bool,
    pub pid: Option<u32>,
    pub current_job: Option<Job>,
}

impl Slot {
    pub fn idle() -> Self {
        Slot::default()
    }
}
