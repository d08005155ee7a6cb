//! All SQL the core issues. Query text is ported verbatim (table/column
//! names, joins) from `original_source/src/database.h`, but reissued as
//! parameterized `sqlx` queries instead of the original's
//! escape-then-`snprintf` pattern (DESIGN.md, design notes §9).

use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::{MySqlPool, Row};

use gridworker_core::model::{
    Experiment, ExperimentHasClient, GridQueue, HostInfo, Instance, Job, JobStatus, Parameter,
    ResultCode, SolverBinary,
};

use crate::error::GatewayError;

/// How long to sleep between reconnect attempts on a transient error.
pub const WAIT_BETWEEN_RECONNECTS: Duration = Duration::from_secs(5);

/// Owns the pooled connections the core talks to MySQL through. The "one
/// primary connection" spec.md describes is modeled here as ordinary pool
/// checkouts: `sqlx`'s pool already gives each caller an exclusive
/// connection for the duration of a query or transaction, so the Main Loop
/// simply never runs two queries concurrently against the same pool handle,
/// which is the invariant spec.md §5 actually cares about ("no shared
/// connection is used from more than one task").
#[derive(Clone)]
pub struct Gateway {
    pool: MySqlPool,
}

impl Gateway {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
    ) -> Result<Gateway, GatewayError> {
        let options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(username)
            .password(password)
            .database(database);
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(GatewayError::Connect)?;
        Ok(Gateway { pool })
    }

    /// A dedicated connection for a background task (Control Channel, a
    /// lock refresher) that must not share a connection with the Main
    /// Loop's queries.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Retries `f` on `GatewayError::Transient` every
    /// [`WAIT_BETWEEN_RECONNECTS`], until the cumulative sleep exceeds
    /// `budget`, then returns `RetryBudgetExhausted`.
    pub async fn with_retry<T, F, Fut>(
        &self,
        budget: Duration,
        mut f: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut waited = Duration::ZERO;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(GatewayError::Transient(e)) => {
                    if waited >= budget {
                        return Err(GatewayError::RetryBudgetExhausted);
                    }
                    tracing::warn!(error = %e, "transient database error, retrying");
                    tokio::time::sleep(WAIT_BETWEEN_RECONNECTS).await;
                    waited += WAIT_BETWEEN_RECONNECTS;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Inserts this worker's `Client` row; also backfills `gridQueue`'s
    /// host-describing columns when they are still `NULL` (grounded in
    /// `fill_grid_queue_info`, called right after `insert_client` in the
    /// original's `sign_on`).
    pub async fn insert_client(
        &self,
        host_info: &HostInfo,
        grid_queue_id: i32,
        jobs_wait_time: i32,
    ) -> Result<i32, GatewayError> {
        let result = sqlx::query(
            "INSERT INTO Client (numCores, numThreads, hyperthreading, turboboost, \
             CPUName, cacheSize, cpuflags, memory, memoryFree, cpuinfo, meminfo, message, \
             gridQueue_idgridQueue, lastReport, jobs_wait_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '', ?, NOW(), ?)",
        )
        .bind(host_info.num_cores)
        .bind(host_info.num_threads)
        .bind(host_info.hyperthreading)
        .bind(host_info.turboboost)
        .bind(&host_info.cpu_model)
        .bind(host_info.cache_size)
        .bind(&host_info.cpu_flags)
        .bind(host_info.memory)
        .bind(host_info.free_memory)
        .bind(&host_info.cpuinfo)
        .bind(&host_info.meminfo)
        .bind(grid_queue_id)
        .bind(jobs_wait_time)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        let client_id = result.last_insert_id();
        if client_id == 0 {
            return Err(GatewayError::NoIdReturned("insert_client"));
        }

        self.fill_grid_queue_info(host_info, grid_queue_id).await?;
        Ok(client_id as i32)
    }

    async fn fill_grid_queue_info(
        &self,
        host_info: &HostInfo,
        grid_queue_id: i32,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE gridQueue SET numCores=?, numThreads=?, hyperthreading=?, turboboost=?, \
             CPUName=?, cacheSize=?, cpuflags=?, memory=?, cpuinfo=?, meminfo=? \
             WHERE idgridQueue=? AND numCores IS NULL",
        )
        .bind(host_info.num_cores)
        .bind(host_info.num_threads)
        .bind(host_info.hyperthreading)
        .bind(host_info.turboboost)
        .bind(&host_info.cpu_model)
        .bind(host_info.cache_size)
        .bind(&host_info.cpu_flags)
        .bind(host_info.memory)
        .bind(&host_info.cpuinfo)
        .bind(&host_info.meminfo)
        .bind(grid_queue_id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    pub async fn delete_client(&self, client_id: i32) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM Client WHERE idClient=?")
            .bind(client_id)
            .execute(&self.pool)
            .await
            .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    pub async fn get_grid_queue_info(&self, grid_queue_id: i32) -> Result<GridQueue, GatewayError> {
        let row = sqlx::query(
            "SELECT name, location, numCPUs, description, numCores, CPUName \
             FROM gridQueue WHERE idgridQueue=?",
        )
        .bind(grid_queue_id)
        .fetch_one(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        Ok(GridQueue {
            id: grid_queue_id,
            name: row.try_get("name").unwrap_or_default(),
            location: row.try_get("location").unwrap_or_default(),
            num_cpus: row.try_get("numCPUs").unwrap_or_default(),
            num_cores: row.try_get("numCores").unwrap_or_default(),
            cpu_model: row.try_get("CPUName").unwrap_or_default(),
            description: row.try_get("description").unwrap_or_default(),
        })
    }

    /// `active = true AND countUnprocessedJobs > 0`, linked to the grid
    /// queue. When `experiment_ids` is `Some` (job-server mode), the set is
    /// narrowed to those ids instead of being looked up by grid queue.
    pub async fn get_possible_experiments(
        &self,
        grid_queue_id: i32,
        experiment_ids: Option<&[i32]>,
    ) -> Result<Vec<Experiment>, GatewayError> {
        let rows = match experiment_ids {
            None => {
                sqlx::query(
                    "SELECT Experiment.idExperiment, Experiment.name, Experiment.priority \
                     FROM Experiment \
                     JOIN Experiment_has_gridQueue \
                       ON Experiment_has_gridQueue.Experiment_idExperiment = Experiment.idExperiment \
                     WHERE gridQueue_idgridQueue=? AND Experiment.active=TRUE \
                       AND Experiment.countUnprocessedJobs > 0 \
                     GROUP BY idExperiment",
                )
                .bind(grid_queue_id)
                .fetch_all(&self.pool)
                .await
            }
            Some(ids) => {
                let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                let sql = format!(
                    "SELECT Experiment.idExperiment, Experiment.name, Experiment.priority \
                     FROM Experiment WHERE idExperiment IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                query.fetch_all(&self.pool).await
            }
        }
        .map_err(GatewayError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| Experiment {
                id: row.try_get("idExperiment").unwrap_or_default(),
                name: row.try_get("name").unwrap_or_default(),
                priority: row.try_get("priority").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn get_experiment_cpu_count(
        &self,
    ) -> Result<Vec<ExperimentHasClient>, GatewayError> {
        let rows = sqlx::query(
            "SELECT Experiment_idExperiment, SUM(numCores) AS total_cores \
             FROM Experiment_has_Client GROUP BY Experiment_idExperiment",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ExperimentHasClient {
                experiment_id: row.try_get("Experiment_idExperiment").unwrap_or_default(),
                client_id: 0,
                num_cores: row.try_get("total_cores").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn increment_core_count(
        &self,
        client_id: i32,
        experiment_id: i32,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO Experiment_has_Client (Experiment_idExperiment, Client_idClient, numCores) \
             VALUES (?, ?, 1) ON DUPLICATE KEY UPDATE numCores=numCores+1",
        )
        .bind(experiment_id)
        .bind(client_id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    pub async fn decrement_core_count(
        &self,
        client_id: i32,
        experiment_id: i32,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE Experiment_has_Client SET numCores=numCores-1 \
             WHERE Experiment_idExperiment=? AND Client_idClient=?",
        )
        .bind(experiment_id)
        .bind(client_id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    /// Scheduler Step B: the random-offset claim transaction. Returns
    /// `Ok(None)` when the row lock reveals the candidate job was already
    /// taken (`ClaimRace` in spec.md §7's taxonomy) — this is an expected
    /// outcome, not an error.
    pub async fn fetch_and_lock_job(
        &self,
        client_id: i32,
        grid_queue_id: i32,
        experiment_id: i32,
        compute_node: &str,
        compute_node_ip: &str,
    ) -> Result<Option<Job>, GatewayError> {
        let mut tx = self.pool.begin().await.map_err(GatewayError::from_sqlx)?;

        let unprocessed: i64 = sqlx::query_scalar(
            "SELECT FLOOR(RAND() * countUnprocessedJobs) FROM Experiment WHERE idExperiment=?",
        )
        .bind(experiment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        let candidate_id: Option<i32> = sqlx::query_scalar(
            "SELECT idJob FROM ExperimentResults \
             WHERE Experiment_idExperiment=? AND status=-1 AND priority >= 0 LIMIT ?, 1",
        )
        .bind(experiment_id)
        .bind(unprocessed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        let Some(candidate_id) = candidate_id else {
            tx.commit().await.map_err(GatewayError::from_sqlx)?;
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT idJob, SolverConfig_idSolverConfig, Experiment_idExperiment, \
             Instances_idInstance, run, seed, priority, CPUTimeLimit, wallClockTimeLimit, \
             memoryLimit, stackSizeLimit, outputSizeLimitFirst, outputSizeLimitLast \
             FROM ExperimentResults WHERE idJob = ? AND status=-1 FOR UPDATE",
        )
        .bind(candidate_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        let Some(row) = row else {
            // lost the race: another worker claimed it between the two reads
            tx.commit().await.map_err(GatewayError::from_sqlx)?;
            return Ok(None);
        };

        sqlx::query(
            "UPDATE ExperimentResults SET status=0, startTime=NOW(), computeQueue=?, \
             computeNode=?, computeNodeIP=?, Client_idClient=? WHERE idJob=?",
        )
        .bind(grid_queue_id)
        .bind(compute_node)
        .bind(compute_node_ip)
        .bind(client_id)
        .bind(candidate_id)
        .execute(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        tx.commit().await.map_err(GatewayError::from_sqlx)?;

        Ok(Some(Job {
            id_job: row.try_get("idJob").unwrap_or_default(),
            id_solver_config: row.try_get("SolverConfig_idSolverConfig").unwrap_or_default(),
            id_experiment: row.try_get("Experiment_idExperiment").unwrap_or_default(),
            id_instance: row.try_get("Instances_idInstance").unwrap_or_default(),
            run: row.try_get("run").unwrap_or_default(),
            seed: row.try_get("seed").unwrap_or_default(),
            status: JobStatus::RUNNING,
            result_time: 0.0,
            result_code: ResultCode::UNKNOWN,
            priority: row.try_get("priority").unwrap_or_default(),
            compute_queue: grid_queue_id,
            compute_node: compute_node.to_string(),
            compute_node_ip: compute_node_ip.to_string(),
            cpu_time_limit: row.try_get("CPUTimeLimit").unwrap_or(-1),
            wall_clock_time_limit: row.try_get("wallClockTimeLimit").unwrap_or(-1),
            memory_limit: row.try_get("memoryLimit").unwrap_or(-1),
            stack_size_limit: row.try_get("stackSizeLimit").unwrap_or(-1),
            output_size_limit_first: row.try_get("outputSizeLimitFirst").unwrap_or(-1),
            output_size_limit_last: row.try_get("outputSizeLimitLast").unwrap_or(-1),
            watcher_output: String::new(),
            launcher_output: String::new(),
            verifier_output: String::new(),
            solver_output: Vec::new(),
            solver_exit_code: 0,
            watcher_exit_code: 0,
            verifier_exit_code: 0,
            instance_file_name: String::new(),
        }))
    }

    /// Crash-recovery path: reverts a claimed-but-not-launched job back to
    /// `status=-1`. Called from `exit_client`'s equivalent when a worker
    /// shuts down with `downloading_job` still set.
    pub async fn reset_job(&self, job_id: i32) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE ExperimentResults SET status=-1, startTime=NULL, computeQueue=NULL, \
             computeNode=NULL, Client_idClient=NULL WHERE idJob=?",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    pub async fn update_job(&self, job: &Job, write_solver_output: bool) -> Result<(), GatewayError> {
        let solver_output = if write_solver_output {
            String::from_utf8_lossy(&job.solver_output).to_string()
        } else {
            String::new()
        };
        sqlx::query(
            "UPDATE ExperimentResults, ExperimentResultsOutput SET \
             status=?, resultCode=?, resultTime=?, solverOutput=?, watcherOutput=?, \
             launcherOutput=?, verifierOutput=?, solverExitCode=?, watcherExitCode=?, \
             verifierExitCode=? WHERE idJob=? AND ExperimentResults_idJob=?",
        )
        .bind(job.status.0)
        .bind(job.result_code.0)
        .bind(job.result_time)
        .bind(solver_output)
        .bind(&job.watcher_output)
        .bind(&job.launcher_output)
        .bind(&job.verifier_output)
        .bind(job.solver_exit_code)
        .bind(job.watcher_exit_code)
        .bind(job.verifier_exit_code)
        .bind(job.id_job)
        .bind(job.id_job)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;
        Ok(())
    }

    /// Transactional read-and-clear of the worker's message column.
    pub async fn get_message(
        &self,
        client_id: i32,
        jobs_wait_time: i32,
        current_wait_time: i32,
    ) -> Result<String, GatewayError> {
        let mut tx = self.pool.begin().await.map_err(GatewayError::from_sqlx)?;
        let message: Option<String> = sqlx::query_scalar(
            "SELECT message FROM Client WHERE idClient = ? FOR UPDATE",
        )
        .bind(client_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        sqlx::query(
            "UPDATE Client SET message = '', lastReport=NOW(), jobs_wait_time = ?, \
             current_wait_time = ? WHERE idClient = ?",
        )
        .bind(jobs_wait_time)
        .bind(current_wait_time)
        .bind(client_id)
        .execute(&mut *tx)
        .await
        .map_err(GatewayError::from_sqlx)?;

        tx.commit().await.map_err(GatewayError::from_sqlx)?;
        Ok(message.unwrap_or_default())
    }

    pub async fn get_solver(&self, id_solver_config: i32) -> Result<SolverBinary, GatewayError> {
        let row = sqlx::query(
            "SELECT SolverBinaries.idSolverBinary, Solver.name, SolverBinaries.binaryName, \
             SolverBinaries.md5, SolverBinaries.runCommand, SolverBinaries.runPath \
             FROM SolverBinaries \
             LEFT JOIN SolverConfig ON (SolverBinaries.idSolverBinary = SolverConfig.SolverBinaries_idSolverBinary) \
             LEFT JOIN Solver ON (Solver.idSolver = SolverBinaries.idSolver) \
             WHERE idSolverConfig=?",
        )
        .bind(id_solver_config)
        .fetch_one(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        Ok(SolverBinary {
            id_solver_binary: row.try_get("idSolverBinary").unwrap_or_default(),
            solver_name: row.try_get("name").unwrap_or_default(),
            binary_name: row.try_get("binaryName").unwrap_or_default(),
            md5: row.try_get("md5").unwrap_or_default(),
            run_command: row.try_get("runCommand").unwrap_or_default(),
            run_path: row.try_get("runPath").unwrap_or_default(),
        })
    }

    pub async fn get_instance(&self, id_instance: i32) -> Result<Instance, GatewayError> {
        let row = sqlx::query("SELECT name, md5 FROM Instances WHERE idInstance = ?")
            .bind(id_instance)
            .fetch_one(&self.pool)
            .await
            .map_err(GatewayError::from_sqlx)?;

        Ok(Instance {
            id_instance,
            name: row.try_get("name").unwrap_or_default(),
            md5: row.try_get("md5").unwrap_or_default(),
        })
    }

    pub async fn get_instance_binary(&self, id_instance: i32) -> Result<Vec<u8>, GatewayError> {
        sqlx::query_scalar("SELECT instance FROM Instances WHERE idInstance = ?")
            .bind(id_instance)
            .fetch_one(&self.pool)
            .await
            .map_err(GatewayError::from_sqlx)
    }

    pub async fn get_solver_binary(&self, id_solver_binary: i32) -> Result<Vec<u8>, GatewayError> {
        sqlx::query_scalar("SELECT binaryArchive FROM SolverBinaries WHERE idSolverBinary = ?")
            .bind(id_solver_binary)
            .fetch_one(&self.pool)
            .await
            .map_err(GatewayError::from_sqlx)
    }

    pub async fn get_solver_config_params(
        &self,
        id_solver_config: i32,
    ) -> Result<Vec<Parameter>, GatewayError> {
        let rows = sqlx::query(
            "SELECT idParameter, name, prefix, hasValue, defaultValue, `order`, space, \
             attachToPrevious, value \
             FROM Parameters JOIN SolverConfig_has_Parameters ON idParameter = Parameters_idParameter \
             WHERE SolverConfig_idSolverConfig=? ORDER BY `order`",
        )
        .bind(id_solver_config)
        .fetch_all(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| Parameter {
                id_parameter: row.try_get("idParameter").unwrap_or_default(),
                name: row.try_get("name").unwrap_or_default(),
                prefix: row.try_get("prefix").unwrap_or_default(),
                has_value: row.try_get("hasValue").unwrap_or_default(),
                default_value: row.try_get("defaultValue").unwrap_or_default(),
                order: row.try_get("order").unwrap_or_default(),
                space: row.try_get("space").unwrap_or_default(),
                attach_to_previous: row.try_get("attachToPrevious").unwrap_or_default(),
                value: row.try_get("value").unwrap_or_default(),
            })
            .collect())
    }

    /// Fetches every unprocessed, first-run job for experiments linked to
    /// `grid_queue_id`, for simulation mode — a single snapshot query, no
    /// ongoing claim traffic (see `gridworker-engine::simulate`).
    pub async fn fetch_jobs_for_simulation(
        &self,
        grid_queue_id: i32,
    ) -> Result<Vec<Job>, GatewayError> {
        let rows = sqlx::query(
            "SELECT idJob, SolverConfig_idSolverConfig, Experiment_idExperiment, \
             Instances_idInstance, run, seed, ExperimentResults.priority, CPUTimeLimit, \
             wallClockTimeLimit, memoryLimit, stackSizeLimit, outputSizeLimitFirst, \
             outputSizeLimitLast \
             FROM ExperimentResults JOIN Experiment ON (idExperiment = Experiment_idExperiment) \
             WHERE Experiment_idExperiment IN \
               (SELECT Experiment_idExperiment FROM Experiment_has_gridQueue \
                WHERE gridQueue_idgridQueue = ?) \
             AND status = -1 AND run = 0 AND active = 1",
        )
        .bind(grid_queue_id)
        .fetch_all(&self.pool)
        .await
        .map_err(GatewayError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| Job {
                id_job: row.try_get("idJob").unwrap_or_default(),
                id_solver_config: row.try_get("SolverConfig_idSolverConfig").unwrap_or_default(),
                id_experiment: row.try_get("Experiment_idExperiment").unwrap_or_default(),
                id_instance: row.try_get("Instances_idInstance").unwrap_or_default(),
                run: row.try_get("run").unwrap_or_default(),
                seed: row.try_get("seed").unwrap_or_default(),
                status: JobStatus::NOT_STARTED,
                result_time: 0.0,
                result_code: ResultCode::UNKNOWN,
                priority: row.try_get("priority").unwrap_or_default(),
                compute_queue: 0,
                compute_node: String::new(),
                compute_node_ip: String::new(),
                cpu_time_limit: row.try_get("CPUTimeLimit").unwrap_or(-1),
                wall_clock_time_limit: row.try_get("wallClockTimeLimit").unwrap_or(-1),
                memory_limit: row.try_get("memoryLimit").unwrap_or(-1),
                stack_size_limit: row.try_get("stackSizeLimit").unwrap_or(-1),
                output_size_limit_first: row.try_get("outputSizeLimitFirst").unwrap_or(-1),
                output_size_limit_last: row.try_get("outputSizeLimitLast").unwrap_or(-1),
                watcher_output: String::new(),
                launcher_output: String::new(),
                verifier_output: String::new(),
                solver_output: Vec::new(),
                solver_exit_code: 0,
                watcher_exit_code: 0,
                verifier_exit_code: 0,
                instance_file_name: String::new(),
            })
            .collect())
    }
}
