//! Modbus TCP device simulator
//!
//! Usage: `modbus_simulator [CONFIG_FILE]`
//!
//! Without a file the simulator serves nine devices on 172.16.1.201 to
//! 172.16.1.209, port 502. `MODBUS_SIM_CONFIG` names a config file and
//! `MODBUS_SIM_ADDRESSES` overrides the address list.

use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::signal;

use voltage_modbus_sim::{init_logging, Simulator, SimulatorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("{}", voltage_modbus_sim::info());

    let path = std::env::args().nth(1);
    let config = SimulatorConfig::load(path.as_deref()).context("failed to load simulator configuration")?;

    println!("Launching Modbus servers, please wait...");

    let mut simulator = Simulator::new(config);
    let failures = simulator.start().await;

    if simulator.devices().is_empty() {
        bail!("no Modbus server could be started ({} addresses failed)", failures.len());
    }

    println!("All servers running. Press Ctrl+C to stop.");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt signal, stopping servers..."),
        Err(err) => error!("Failed to listen for interrupt signal: {}", err),
    }

    for device in simulator.devices() {
        let stats = device.stats();
        info!(
            "{}: {} connections, {} requests, {} exceptions, up {}s",
            device.local_addr(),
            stats.connections_count,
            stats.total_requests,
            stats.exception_responses,
            stats.uptime_seconds
        );
    }

    simulator.stop().await;
    info!("Simulator stopped");
    Ok(())
}
