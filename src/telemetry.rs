//! Telemetry driver
//!
//! Keeps a simulated device "alive" by bumping one holding register on a
//! fixed period, the way a real meter's counter would move.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::context::DeviceContext;
use crate::error::ModbusResult;

/// Telemetry settings shared by every simulated device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Holding register that is incremented
    pub register: u16,
    /// The counter wraps back to 0 when it reaches this value
    pub modulus: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            register: 0,
            modulus: 10000,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Counter value following `current`
pub fn next_value(current: u16, modulus: u16) -> u16 {
    if modulus == 0 {
        return current.wrapping_add(1);
    }
    ((u32::from(current) + 1) % u32::from(modulus)) as u16
}

/// Periodic incrementer for one device
pub struct TelemetryDriver {
    label: String,
    device: Arc<DeviceContext>,
    register: u16,
    modulus: u16,
    period: Duration,
}

impl TelemetryDriver {
    /// `label` prefixes every log line, e.g. `[Server 1][172.16.1.201][Unit 1]`
    pub fn new(label: impl Into<String>, device: Arc<DeviceContext>, config: &TelemetryConfig) -> Self {
        Self {
            label: label.into(),
            device,
            register: config.register,
            modulus: config.modulus,
            period: config.interval(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Increment the register once
    ///
    /// The read and the write happen under one store lock, so a client
    /// write can't be lost in between. Returns the value written.
    pub fn tick(&self) -> ModbusResult<u16> {
        let modulus = self.modulus;
        self.device
            .registers()
            .update_holding_register(self.register, |current| next_value(current, modulus))
    }

    /// Run [`TelemetryDriver::tick`] every period until `shutdown_rx` fires
    ///
    /// The first tick happens one period after spawning. Failed ticks are
    /// logged and the loop keeps going.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.tick() {
                            Ok(value) => info!("{} HR[{}] = {}", self.label, self.register, value),
                            Err(e) => warn!("{} telemetry update failed: {}", self.label, e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceIdentification;
    use crate::error::ModbusError;

    fn driver(device: Arc<DeviceContext>, register: u16, interval_ms: u64) -> TelemetryDriver {
        let config = TelemetryConfig {
            register,
            interval_ms,
            ..Default::default()
        };
        TelemetryDriver::new("[Server 1][127.0.0.1][Unit 1]", device, &config)
    }

    #[test]
    fn test_next_value() {
        assert_eq!(next_value(0, 10000), 1);
        assert_eq!(next_value(9999, 10000), 0);
        assert_eq!(next_value(u16::MAX, 0), 0);
        assert_eq!(next_value(u16::MAX, u16::MAX), 0);
    }

    #[test]
    fn test_tick_wraps() {
        let device = Arc::new(DeviceContext::default());
        device.registers().write_holding_registers(0, &[9999]).unwrap();

        let driver = driver(device.clone(), 0, 1000);
        assert_eq!(driver.tick().unwrap(), 0);
        assert_eq!(device.registers().read_holding_registers(0, 1).unwrap(), vec![0]);
        assert_eq!(driver.tick().unwrap(), 1);
    }

    #[test]
    fn test_tick_out_of_range_register() {
        let device = Arc::new(DeviceContext::new(10, DeviceIdentification::default()));
        let driver = driver(device, 10, 1000);
        assert!(matches!(driver.tick(), Err(ModbusError::InvalidAddress { .. })));
    }

    #[test]
    fn test_concurrent_ticks_never_lose_increments() {
        let device = Arc::new(DeviceContext::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ticker = driver(device.clone(), 0, 1000);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ticker.tick().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(device.registers().read_holding_registers(0, 1).unwrap(), vec![4000]);
    }

    #[tokio::test]
    async fn test_spawned_driver_counts_and_stops() {
        let device = Arc::new(DeviceContext::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = driver(device.clone(), 3, 10).spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        let value = device.registers().read_holding_registers(3, 1).unwrap()[0];
        assert!(value >= 1);
        assert_eq!(device.registers().read_holding_registers(0, 1).unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_failing_driver_keeps_running() {
        let device = Arc::new(DeviceContext::new(1, DeviceIdentification::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = driver(device, 5, 10).spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
