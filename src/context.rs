/// Device and server contexts
///
/// A [`DeviceContext`] is one simulated Modbus unit: its register bank and its
/// identification record. A [`ServerContext`] maps unit identifiers to devices
/// for one listening address.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::protocol::UnitId;
use crate::register_bank::ModbusRegisterBank;

/// Identification strings served through Read Device Identification (0x2B / 0x0E)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceIdentification {
    pub vendor_name: String,
    pub product_code: String,
    pub product_name: String,
    pub model_name: String,
    pub revision: String,
}

impl Default for DeviceIdentification {
    fn default() -> Self {
        Self {
            vendor_name: "Voltage".to_string(),
            product_code: "VMS".to_string(),
            product_name: "Voltage Modbus Simulator".to_string(),
            model_name: "Simulated TCP Device".to_string(),
            revision: crate::VERSION.to_string(),
        }
    }
}

impl DeviceIdentification {
    /// Object value by Modbus object id, if this record defines it
    pub fn object(&self, object_id: u8) -> Option<&str> {
        match object_id {
            0x00 => Some(&self.vendor_name),
            0x01 => Some(&self.product_code),
            0x02 => Some(&self.revision),
            0x04 => Some(&self.product_name),
            0x05 => Some(&self.model_name),
            _ => None,
        }
    }
}

/// One simulated device: four register blocks plus identification
#[derive(Debug)]
pub struct DeviceContext {
    registers: ModbusRegisterBank,
    identification: DeviceIdentification,
}

impl DeviceContext {
    /// Create a device with zeroed blocks of `block_size` cells
    pub fn new(block_size: usize, identification: DeviceIdentification) -> Self {
        Self {
            registers: ModbusRegisterBank::new(block_size),
            identification,
        }
    }

    /// Register bank of this device
    pub fn registers(&self) -> &ModbusRegisterBank {
        &self.registers
    }

    /// Identification record of this device
    pub fn identification(&self) -> &DeviceIdentification {
        &self.identification
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BLOCK_SIZE, DeviceIdentification::default())
    }
}

/// Unit-id to device mapping for one listening address
///
/// The key set is fixed at construction. In single mode every unit id
/// resolves to the one device.
#[derive(Debug, Clone)]
pub struct ServerContext {
    devices: HashMap<UnitId, Arc<DeviceContext>>,
    single: bool,
}

impl ServerContext {
    /// Context answering every unit id with `device`
    ///
    /// The device is stored under `unit_id`, which is what [`ServerContext::unit_ids`] reports.
    pub fn single(unit_id: UnitId, device: Arc<DeviceContext>) -> Self {
        let mut devices = HashMap::with_capacity(1);
        devices.insert(unit_id, device);
        Self {
            devices,
            single: true,
        }
    }

    /// Context keyed by unit id; unknown unit ids resolve to nothing
    pub fn with_devices(devices: HashMap<UnitId, Arc<DeviceContext>>) -> Self {
        Self {
            devices,
            single: false,
        }
    }

    /// Device serving `unit_id`
    pub fn resolve(&self, unit_id: UnitId) -> Option<Arc<DeviceContext>> {
        if self.single {
            return self.devices.values().next().cloned();
        }
        self.devices.get(&unit_id).cloned()
    }

    /// Whether every unit id resolves to the same device
    pub fn is_single(&self) -> bool {
        self.single
    }

    /// Configured unit ids, sorted
    pub fn unit_ids(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
