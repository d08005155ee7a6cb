//! Entry point: load config, parse flags, set up logging and signals, sign
//! on, run the Main Loop, sign off. Ported from `original_source/src/client.cc`'s
//! `main`.

mod cli;
mod logging;
mod signals;

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use cli::Cli;
use gridworker_core::{config::Config, hostinfo};
use gridworker_db::Gateway;
use gridworker_engine::control::{self, ControlCommand};
use gridworker_engine::lifecycle::ShutdownFlag;
use gridworker_engine::mainloop::{check_homogeneity, run_main_loop, MainLoopConfig};
use gridworker_engine::simulate::{JobSource, SimulatedSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(std::path::Path::new("./config")).context("loading ./config")?;

    let host_info = hostinfo::capture();
    let pid = std::process::id();
    let _log_guard = logging::init(cli.verbosity, cli.log_to_file, &host_info.hostname, &host_info.ip_address, pid);

    tracing::info!(host = %host_info.hostname, "gridworker starting");

    let gateway = Gateway::connect(&config.host, config.port, &config.username, &config.password, &config.database)
        .await
        .context("connecting to database")?;

    let grid_queue = gateway
        .get_grid_queue_info(config.gridqueue)
        .await
        .context("loading grid queue record")?;

    if let Err(msg) = check_homogeneity(&host_info, &grid_queue, cli.allow_inhomogeneous) {
        bail!("host/grid queue mismatch: {msg} (pass -h to override)");
    }

    let wait_jobs_time = Duration::from_secs(cli.wait_jobs_time.unwrap_or(600));
    let initial_check_interval = Duration::from_millis(cli.check_interval_ms.unwrap_or(100));

    let job_source = if cli.simulate {
        JobSource::Simulated(
            SimulatedSource::snapshot(&gateway, config.gridqueue)
                .await
                .context("snapshotting jobs for simulation")?,
        )
    } else {
        JobSource::Live(gateway.clone())
    };

    let client_id = if cli.simulate {
        0
    } else {
        gateway
            .insert_client(&host_info, config.gridqueue, wait_jobs_time.as_secs() as i32)
            .await
            .context("signing on")?
    };

    let shutdown = ShutdownFlag::new();
    signals::install(shutdown.clone());

    let (control_tx, control_rx) = tokio::sync::mpsc::channel::<ControlCommand>(16);
    if !cli.simulate {
        let control_gateway = gateway.clone();
        tokio::spawn(async move {
            control::run(control_gateway, client_id, wait_jobs_time.as_secs() as i32, 0, control_tx).await;
        });
    }

    let main_loop_cfg = MainLoopConfig {
        client_id,
        grid_queue_id: config.gridqueue,
        compute_node: host_info.hostname.clone(),
        compute_node_ip: host_info.ip_address.clone(),
        base_path: cli.base_path.clone(),
        num_slots: host_info.num_cores.max(1) as usize,
        initial_check_interval,
        upper_check_interval: Duration::from_millis(10_000),
        wait_jobs_time,
        keep_output: cli.keep_output,
        verifier_command: config.verifier.clone(),
    };

    let result = run_main_loop(gateway.clone(), job_source, control_rx, shutdown, main_loop_cfg).await;

    if !cli.simulate {
        if let Err(err) = gateway.delete_client(client_id).await {
            tracing::warn!(%err, "failed to delete client row on exit");
        }
    }

    match result {
        Ok(Some(summary)) => {
            println!("{summary}");
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            tracing::error!(%err, "main loop exited with an error");
            Err(err.into())
        }
    }
}
