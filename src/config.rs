//! Simulator configuration
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. built-in defaults (nine devices on `172.16.1.201` to `172.16.1.209`, port 502)
//! 2. a YAML or JSON file, picked by extension
//! 3. the `MODBUS_SIM_ADDRESSES` environment variable, a comma separated IP list
//!
//! ```yaml
//! addresses: [127.0.0.1]
//! port: 5020
//! telemetry:
//!   interval_ms: 500
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::context::DeviceIdentification;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::UnitId;
use crate::telemetry::TelemetryConfig;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_TCP_PORT};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "MODBUS_SIM_CONFIG";

/// Environment variable overriding the address list
pub const ADDRESSES_ENV: &str = "MODBUS_SIM_ADDRESSES";

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// One simulated device is started per address, in this order
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Unit id reported for each device; every unit id is answered
    pub unit_id: UnitId,
    /// Cells per register block
    pub block_size: usize,
    pub max_connections: usize,
    pub idle_timeout_secs: Option<u64>,
    pub telemetry: TelemetryConfig,
    pub identity: DeviceIdentification,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            port: DEFAULT_TCP_PORT,
            unit_id: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            max_connections: 100,
            idle_timeout_secs: None,
            telemetry: TelemetryConfig::default(),
            identity: DeviceIdentification::default(),
        }
    }
}

/// `172.16.1.201` through `172.16.1.209`
pub fn default_addresses() -> Vec<IpAddr> {
    (201..=209)
        .map(|host| IpAddr::V4(Ipv4Addr::new(172, 16, 1, host)))
        .collect()
}

/// Parse a comma separated address list, ignoring blanks around entries
pub fn parse_address_list(list: &str) -> ModbusResult<Vec<IpAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .map_err(|e| ModbusError::configuration(format!("Invalid address '{}': {}", entry, e)))
        })
        .collect()
}

impl SimulatorConfig {
    /// Read a configuration file; `.yaml`/`.yml` as YAML, anything else as JSON
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );

        let config = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Load defaults, the file at `path` (or `MODBUS_SIM_CONFIG`) and the
    /// `MODBUS_SIM_ADDRESSES` override, then validate
    pub fn load(path: Option<&str>) -> ModbusResult<Self> {
        let path = path.map(str::to_string).or_else(|| env::var(CONFIG_PATH_ENV).ok());
        let addresses = env::var(ADDRESSES_ENV).ok();
        Self::load_from(path.as_deref(), addresses.as_deref())
    }

    /// [`SimulatorConfig::load`] with the environment lookups already done
    pub fn load_from(path: Option<&str>, address_override: Option<&str>) -> ModbusResult<Self> {
        let mut config = match path {
            Some(path) => {
                debug!("Loading configuration from {}", path);
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        if let Some(list) = address_override {
            config.apply_address_override(list)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Replace the address list with a comma separated one
    ///
    /// A blank list leaves the current addresses untouched.
    pub fn apply_address_override(&mut self, list: &str) -> ModbusResult<()> {
        let addresses = parse_address_list(list)?;
        if !addresses.is_empty() {
            debug!("Address list overridden: {:?}", addresses);
            self.addresses = addresses;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ModbusResult<()> {
        if self.addresses.is_empty() {
            return Err(ModbusError::configuration("No addresses configured"));
        }

        let mut seen = HashSet::with_capacity(self.addresses.len());
        for address in &self.addresses {
            if !seen.insert(address) {
                return Err(ModbusError::configuration(format!("Duplicate address {}", address)));
            }
        }

        if self.block_size == 0 {
            return Err(ModbusError::configuration("Block size must be greater than 0"));
        }
        if self.block_size > usize::from(u16::MAX) + 1 {
            return Err(ModbusError::configuration(format!(
                "Block size {} exceeds the Modbus address space",
                self.block_size
            )));
        }

        if self.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be greater than 0"));
        }

        if self.telemetry.enabled {
            if self.telemetry.interval_ms == 0 {
                return Err(ModbusError::configuration("Telemetry interval must be greater than 0"));
            }
            if self.telemetry.modulus == 0 {
                return Err(ModbusError::configuration("Telemetry modulus must be greater than 0"));
            }
            if usize::from(self.telemetry.register) >= self.block_size {
                return Err(ModbusError::configuration(format!(
                    "Telemetry register {} is outside a block of {} registers",
                    self.telemetry.register, self.block_size
                )));
            }
        }

        Ok(())
    }

    /// Listening socket address for every configured IP
    pub fn socket_addresses(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
