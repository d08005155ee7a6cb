//! Simulation mode (`-s`): runs the scheduler against a single snapshot of
//! unprocessed jobs instead of the live claim transaction, and never writes
//! job results back. Grounded in `original_source/src/client.cc`'s
//! `simulate` branches and the `QUERY_FETCH_JOBS_SIMULATION` query.
//!
//! Modeled as an enum rather than a trait object (design notes §9.1): the
//! Main Loop picks one variant at startup from the `-s` flag and never
//! switches at runtime, so dynamic dispatch buys nothing here.

use std::collections::HashMap;

use gridworker_core::model::{Experiment, Job};
use gridworker_db::{Gateway, GatewayError};

use crate::scheduler;

/// What the Main Loop claims jobs through. `Live` issues real claim
/// transactions; `Simulated` deals jobs out of an in-memory snapshot taken
/// once at startup and tallies a summary instead of touching the database
/// again.
pub enum JobSource {
    Live(Gateway),
    Simulated(SimulatedSource),
}

/// Per-experiment tally printed when simulation mode exits.
#[derive(Debug, Clone, Default)]
pub struct SimulationSummary {
    pub jobs_run: HashMap<i32, i32>,
}

impl SimulationSummary {
    pub fn record(&mut self, experiment_id: i32) {
        *self.jobs_run.entry(experiment_id).or_insert(0) += 1;
    }

    pub fn report(&self) -> String {
        let mut lines: Vec<String> = self
            .jobs_run
            .iter()
            .map(|(id, n)| format!("experiment {id}: {n} job(s) would have run"))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

pub struct SimulatedSource {
    pending: Vec<Job>,
    cpu_by_experiment: HashMap<i32, i32>,
    pub summary: SimulationSummary,
}

impl SimulatedSource {
    /// Takes one snapshot via `fetch_jobs_for_simulation` and starts every
    /// experiment's simulated CPU count at zero — there is no live
    /// `Experiment_has_Client` bookkeeping to read from in this mode.
    pub async fn snapshot(gateway: &Gateway, grid_queue_id: i32) -> Result<SimulatedSource, GatewayError> {
        let pending = gateway.fetch_jobs_for_simulation(grid_queue_id).await?;
        Ok(SimulatedSource {
            pending,
            cpu_by_experiment: HashMap::new(),
            summary: SimulationSummary::default(),
        })
    }

    fn experiments(&self) -> Vec<Experiment> {
        let mut seen = HashMap::new();
        for job in &self.pending {
            seen.entry(job.id_experiment).or_insert(job.priority);
        }
        seen.into_iter()
            .map(|(id, priority)| Experiment {
                id,
                name: String::new(),
                priority,
            })
            .collect()
    }

    /// Picks an experiment with `choose_experiment`, then removes and
    /// returns one of its still-pending jobs, or `None` if the experiment's
    /// queue in the snapshot is already exhausted.
    fn claim_next(&mut self) -> Option<Job> {
        let experiments = self.experiments();
        let chosen_id = scheduler::choose_experiment(&experiments, &self.cpu_by_experiment)?.id;
        let idx = self.pending.iter().position(|j| j.id_experiment == chosen_id)?;
        let job = self.pending.remove(idx);
        *self.cpu_by_experiment.entry(chosen_id).or_insert(0) += 1;
        self.summary.record(chosen_id);
        Some(job)
    }
}

impl JobSource {
    pub async fn fetch_job(
        &mut self,
        client_id: i32,
        grid_queue_id: i32,
        compute_node: &str,
        compute_node_ip: &str,
    ) -> Result<Option<Job>, GatewayError> {
        match self {
            JobSource::Live(gateway) => {
                let experiments = gateway.get_possible_experiments(grid_queue_id, None).await?;
                let cpu_counts = gateway.get_experiment_cpu_count().await?;
                let mut cpu_by_experiment = HashMap::new();
                for c in cpu_counts {
                    cpu_by_experiment.insert(c.experiment_id, c.num_cores);
                }
                let Some(experiment) = scheduler::choose_experiment(&experiments, &cpu_by_experiment) else {
                    return Ok(None);
                };
                scheduler::claim_job(
                    gateway,
                    client_id,
                    grid_queue_id,
                    experiment.id,
                    compute_node,
                    compute_node_ip,
                )
                .await
            }
            JobSource::Simulated(sim) => Ok(sim.claim_next()),
        }
    }

    /// No-op in simulation mode: nothing was ever claimed in the database,
    /// so there is nothing to release.
    pub async fn update_job(&self, job: &Job, write_solver_output: bool) -> Result<(), GatewayError> {
        match self {
            JobSource::Live(gateway) => gateway.update_job(job, write_solver_output).await,
            JobSource::Simulated(_) => Ok(()),
        }
    }

    pub fn summary(&self) -> Option<&SimulationSummary> {
        match self {
            JobSource::Live(_) => None,
            JobSource::Simulated(sim) => Some(&sim.summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridworker_core::model::JobStatus;
    use gridworker_core::model::ResultCode;

    fn job(id_job: i32, id_experiment: i32, priority: i32) -> Job {
        Job {
            id_job,
            id_solver_config: 1,
            id_experiment,
            id_instance: 1,
            run: 0,
            seed: 1,
            status: JobStatus::NOT_STARTED,
            result_time: 0.0,
            result_code: ResultCode::UNKNOWN,
            priority,
            compute_queue: 0,
            compute_node: String::new(),
            compute_node_ip: String::new(),
            cpu_time_limit: -1,
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
    fn drains_snapshot_and_tallies_summary() {
        let mut sim = SimulatedSource {
            pending: vec![job(1, 10, 5), job(2, 10, 5), job(3, 20, 1)],
            cpu_by_experiment: HashMap::new(),
            summary: SimulationSummary::default(),
        };
        let mut claimed = 0;
        while sim.claim_next().is_some() {
            claimed += 1;
        }
        assert_eq!(claimed, 3);
        assert_eq!(sim.summary.jobs_run.get(&10), Some(&2));
        assert_eq!(sim.summary.jobs_run.get(&20), Some(&1));
    }

    #[test]
    fn empty_snapshot_yields_no_jobs() {
        let mut sim = SimulatedSource {
            pending: Vec::new(),
            cpu_by_experiment: HashMap::new(),
            summary: SimulationSummary::default(),
        };
        assert!(sim.claim_next().is_none());
    }
}
