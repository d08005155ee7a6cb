//! Fair-share experiment selection and the job-claim transaction.
//!
//! `choose_experiment` is ported from `original_source/src/client.cc`; the
//! tie-break direction (last-iterated element wins, via `>=` rather than
//! `>`) is a deliberate, easy-to-invert detail preserved from the original
//! and called out in DESIGN.md.

use std::collections::HashMap;

use gridworker_core::model::{Experiment, Job};
use gridworker_db::{Gateway, GatewayError};

/// Step A: picks the experiment maximizing `diff(e)`. Returns `None` only
/// when `experiments` is empty.
pub fn choose_experiment<'a>(
    experiments: &'a [Experiment],
    cpu_by_experiment: &HashMap<i32, i32>,
) -> Option<&'a Experiment> {
    let priority_sum: i64 = experiments.iter().map(|e| e.priority.max(0) as i64).sum();
    let cpu_sum: i64 = experiments
        .iter()
        .map(|e| *cpu_by_experiment.get(&e.id).unwrap_or(&0) as i64)
        .sum();

    let mut best: Option<(&Experiment, f64)> = None;
    for e in experiments {
        let cpu = *cpu_by_experiment.get(&e.id).unwrap_or(&0) as i64;
        let d = diff(e.priority, cpu, priority_sum, cpu_sum);
        // `>=`, not `>`: later entries in iteration order win ties,
        // matching the original's running-max comparison exactly.
        let replace = match &best {
            None => true,
            Some((_, best_d)) => d >= *best_d,
        };
        if replace {
            best = Some((e, d));
        }
    }
    best.map(|(e, _)| e)
}

/// `diff(e)` from spec.md §4.3: the gap between an experiment's
/// priority-weighted target CPU share and its current share.
fn diff(priority: i32, cpu: i64, priority_sum: i64, cpu_sum: i64) -> f64 {
    let priority = priority.max(0) as f64;
    let cpu = cpu as f64;
    match (priority_sum > 0, cpu_sum > 0) {
        (true, true) => priority / priority_sum as f64 - cpu / cpu_sum as f64,
        // `cpu` can be `0.0` here: IEEE-754 division yields `+inf`, which is
        // the point — an experiment running zero cores must outrank every
        // other candidate so it can never starve. Do not clamp the divisor.
        (false, true) => cpu_sum as f64 / cpu,
        (true, false) => priority / priority_sum as f64,
        (false, false) => 0.0,
    }
}

/// Step B + Step C's core-count bump. Returns `Ok(None)` on a lost claim
/// race (spec.md §7 `ClaimRace`): the caller should back off, not treat
/// this as a failure.
pub async fn claim_job(
    gateway: &Gateway,
    client_id: i32,
    grid_queue_id: i32,
    experiment_id: i32,
    compute_node: &str,
    compute_node_ip: &str,
) -> Result<Option<Job>, GatewayError> {
    let job = gateway
        .fetch_and_lock_job(
            client_id,
            grid_queue_id,
            experiment_id,
            compute_node,
            compute_node_ip,
        )
        .await?;
    if job.is_some() {
        gateway.increment_core_count(client_id, experiment_id).await?;
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(id: i32, priority: i32) -> Experiment {
        Experiment {
            id,
            name: format!("e{id}"),
            priority,
        }
    }

    #[test]
    fn both_zero_is_zero() {
        assert_eq!(diff(0, 0, 0, 0), 0.0);
    }

    #[test]
    fn priority_only_branch() {
        // P>0, C=0: diff = priority/P
        assert_eq!(diff(3, 0, 10, 0), 0.3);
    }

    #[test]
    fn cpu_only_branch() {
        // P=0, C>0: diff = C/cpu[e]
        assert_eq!(diff(0, 2, 0, 8), 4.0);
    }

    #[test]
    fn both_positive_branch() {
        // P>0, C>0: diff = priority/P - cpu/C
        assert_eq!(diff(5, 2, 10, 8), 0.5 - 0.25);
    }

    #[test]
    fn tie_break_favors_last_iterated() {
        let experiments = vec![exp(1, 5), exp(2, 5)];
        let mut cpu = HashMap::new();
        cpu.insert(1, 0);
        cpu.insert(2, 0);
        let chosen = choose_experiment(&experiments, &cpu).unwrap();
        assert_eq!(chosen.id, 2, "equal diff() should pick the later experiment");
    }

    #[test]
    fn picks_maximum_diff() {
        let experiments = vec![exp(1, 1), exp(2, 9)];
        let mut cpu = HashMap::new();
        cpu.insert(1, 5);
        cpu.insert(2, 5);
        let chosen = choose_experiment(&experiments, &cpu).unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn empty_set_returns_none() {
        assert!(choose_experiment(&[], &HashMap::new()).is_none());
    }
}
