//! # Voltage Modbus Simulator - Multi-Endpoint Modbus TCP Device Simulator
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! Simulates a fleet of Modbus TCP devices, one per IP address, for testing
//! SCADA and data acquisition software without real hardware. Every device
//! has its own register store and a telemetry counter that keeps moving.
//!
//! ## Features
//!
//! - **Many Endpoints**: one listener per configured address, started concurrently
//! - **Failure Isolation**: an address that can't be bound doesn't stop the others
//! - **From-Scratch Codec**: MBAP framing with partial and pipelined frame handling
//! - **Live Data**: a holding register incremented on a fixed period
//! - **Device Identification**: function 0x2B / MEI 0x0E for discovery tools
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x2B | Read Device Identification (MEI 0x0E) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_sim::{Simulator, SimulatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = SimulatorConfig::default();
//!     config.addresses = vec!["127.0.0.1".parse()?];
//!     config.port = 5020;
//!
//!     let mut simulator = Simulator::new(config);
//!     let failures = simulator.start().await;
//!     assert!(failures.is_empty());
//!
//!     tokio::signal::ctrl_c().await?;
//!     simulator.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  Simulator                   │
//! └──────────────────────────────────────────────┘
//!          │ one per address         │
//! ┌─────────────────┐    ┌─────────────────────┐
//! │  TCP Server     │    │  Telemetry Driver   │
//! │  (accept loop)  │    │  (periodic ticks)   │
//! └─────────────────┘    └─────────────────────┘
//!          │ one task per connection │
//! ┌─────────────────┐                │
//! │  Frame Codec    │                │
//! │  (MBAP)         │                │
//! └─────────────────┘                │
//!          │                         │
//! ┌─────────────────┐    ┌─────────────────────┐
//! │  Dispatcher     │───►│  Register Bank      │
//! │  (FC handlers)  │    │  (per device)       │
//! └─────────────────┘    └─────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Function codes, exception codes and bit/register packing
pub mod protocol;

/// MBAP frame encoding and decoding
pub mod frame;

/// Thread-safe register storage for one device
pub mod register_bank;

/// Devices and unit-id mapping
pub mod context;

/// Request execution against a device
pub mod dispatcher;

/// Modbus TCP server
pub mod server;

/// Periodic register updates
pub mod telemetry;

/// Simulator configuration
pub mod config;

/// One server per configured address
pub mod simulator;

/// Logging setup and packet tracing
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusException, ModbusFunction, UnitId};
pub use frame::{encode_exception, encode_frame, Frame, MbapHeader};
pub use register_bank::{BlockType, CellValues, ModbusRegisterBank, RegisterBankStats};
pub use context::{DeviceContext, DeviceIdentification, ServerContext};
pub use dispatcher::dispatch;
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use telemetry::{TelemetryConfig, TelemetryDriver};
pub use config::SimulatorConfig;
pub use simulator::{SimulatedDevice, Simulator, StartupFailure};
pub use logging::init_logging;

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in one Write Multiple Coils request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers in one Write Multiple Registers request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum PDU size (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// MBAP header size, unit id included
pub const MBAP_HEADER_SIZE: usize = 7;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Cells per register block of a simulated device
pub const DEFAULT_BLOCK_SIZE: usize = 100;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Simulator v{} - multi-endpoint Modbus TCP device simulator", VERSION)
}
