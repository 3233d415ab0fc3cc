//! Multi-endpoint simulator
//!
//! Starts one [`ModbusTcpServer`] per configured address, each with its own
//! device and telemetry driver. Addresses start concurrently and a bind
//! failure on one of them doesn't keep the others from serving.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SimulatorConfig;
use crate::context::{DeviceContext, ServerContext};
use crate::error::{ModbusError, ModbusResult};
use crate::server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
use crate::telemetry::TelemetryDriver;

/// One running address: listener, device and telemetry loop
pub struct SimulatedDevice {
    index: usize,
    server: ModbusTcpServer,
    device: Arc<DeviceContext>,
    telemetry: Option<(broadcast::Sender<()>, JoinHandle<()>)>,
}

impl SimulatedDevice {
    /// 1-based position of this address in the configuration
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> Arc<DeviceContext> {
        self.device.clone()
    }

    /// Bound address; the configured one unless port 0 was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.server
            .local_addr()
            .unwrap_or_else(|| self.server.bind_address())
    }

    pub fn stats(&self) -> ServerStats {
        self.server.get_stats()
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    /// Stop the telemetry loop and the listener of this address only
    pub async fn stop(&mut self) -> ModbusResult<()> {
        if let Some((shutdown_tx, handle)) = self.telemetry.take() {
            let _ = shutdown_tx.send(());
            handle
                .await
                .map_err(|e| ModbusError::internal(format!("Telemetry task failed: {}", e)))?;
        }
        self.server.stop().await
    }
}

/// An address that could not be started
#[derive(Debug, Clone)]
pub struct StartupFailure {
    pub address: SocketAddr,
    pub error: ModbusError,
}

/// All simulated devices of one process
pub struct Simulator {
    config: SimulatorConfig,
    devices: Vec<SimulatedDevice>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            devices: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Start every configured address
    ///
    /// Returns the addresses that failed; the rest are running afterwards.
    pub async fn start(&mut self) -> Vec<StartupFailure> {
        let starts = self
            .config
            .socket_addresses()
            .into_iter()
            .enumerate()
            .map(|(i, address)| start_device(&self.config, i + 1, address));

        let mut failures = Vec::new();
        for result in join_all(starts).await {
            match result {
                Ok(device) => self.devices.push(device),
                Err(failure) => {
                    error!("Failed to start server at {}: {}", failure.address, failure.error);
                    failures.push(failure);
                }
            }
        }

        info!(
            "{} of {} servers running",
            self.devices.len(),
            self.devices.len() + failures.len()
        );
        failures
    }

    /// Running devices, in configuration order
    pub fn devices(&self) -> &[SimulatedDevice] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [SimulatedDevice] {
        &mut self.devices
    }

    /// Stop every device
    pub async fn stop(&mut self) {
        for device in &mut self.devices {
            if let Err(e) = device.stop().await {
                warn!("Error stopping server at {}: {}", device.local_addr(), e);
            }
        }
        self.devices.clear();
    }
}

async fn start_device(
    config: &SimulatorConfig,
    index: usize,
    address: SocketAddr,
) -> Result<SimulatedDevice, StartupFailure> {
    info!("[OK] Starting Modbus TCP server at {} ...", address);

    let device = Arc::new(DeviceContext::new(config.block_size, config.identity.clone()));
    let context = Arc::new(ServerContext::single(config.unit_id, device.clone()));

    let mut server = ModbusTcpServer::with_config(ModbusTcpServerConfig {
        bind_address: address,
        max_connections: config.max_connections,
        request_timeout: config.idle_timeout(),
        context: Some(context),
    });

    server
        .start()
        .await
        .map_err(|error| StartupFailure { address, error })?;

    let telemetry = if config.telemetry.enabled {
        let label = format!("[Server {}][{}][Unit {}]", index, address.ip(), config.unit_id);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = TelemetryDriver::new(label, device.clone(), &config.telemetry).spawn(shutdown_rx);
        Some((shutdown_tx, handle))
    } else {
        None
    };

    Ok(SimulatedDevice {
        index,
        server,
        device,
        telemetry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config(count: u8) -> SimulatorConfig {
        SimulatorConfig {
            addresses: (1..=count)
                .map(|host| IpAddr::V4(Ipv4Addr::new(127, 0, 0, host)))
                .collect(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let mut simulator = Simulator::new(loopback_config(2));
        let failures = simulator.start().await;
        assert!(failures.is_empty());
        assert_eq!(simulator.devices().len(), 2);
        assert_eq!(simulator.devices()[0].index(), 1);
        assert!(simulator.devices().iter().all(|d| d.is_running()));

        // every address gets its own store
        let first = simulator.devices()[0].device();
        let second = simulator.devices()[1].device();
        first.registers().write_holding_registers(5, &[7]).unwrap();
        assert_eq!(second.registers().read_holding_registers(5, 1).unwrap(), vec![0]);

        simulator.stop().await;
        assert!(simulator.devices().is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_isolated() {
        let mut config = loopback_config(1);
        // TEST-NET-3, never assigned to a local interface
        config.addresses.push(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));

        let mut simulator = Simulator::new(config);
        let failures = simulator.start().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].address.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert!(failures[0].error.is_transport_error());
        assert_eq!(simulator.devices().len(), 1);

        simulator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_single_device() {
        let mut simulator = Simulator::new(loopback_config(2));
        assert!(simulator.start().await.is_empty());

        simulator.devices_mut()[0].stop().await.unwrap();
        assert!(!simulator.devices()[0].is_running());
        assert!(simulator.devices()[1].is_running());

        simulator.stop().await;
    }
}
