//! # Error Handling
//!
//! Error types shared by the codec, the register store, the connection server
//! and the simulator glue.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket failures while reading or writing a connection
//! - **Connection Errors**: bind and accept failures
//! - **Timeout Errors**: idle client connections
//!
//! ### Protocol Errors
//! - **Frame Errors**: malformed MBAP headers
//! - **Frame Too Short**: not enough bytes buffered yet; the caller keeps reading
//! - **Invalid Protocol Id**: MBAP protocol identifier other than 0
//!
//! ### Data Errors
//! - **Invalid Function**: unsupported function codes
//! - **Invalid Address**: accesses outside a register block
//! - **Invalid Data**: malformed request payloads
//!
//! ### System Errors
//! - **Configuration Errors**: bad simulator configuration
//! - **Internal Errors**: poisoned locks and similar conditions
//!
//! Store and dispatcher failures are turned into the exception code sent back
//! to the client with [`ModbusError::to_exception`]:
//!
//! ```rust
//! use voltage_modbus_sim::{ModbusError, ModbusException};
//!
//! let err = ModbusError::invalid_address(90, 20);
//! assert_eq!(err.to_exception(), ModbusException::IllegalDataAddress);
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus error types
///
/// Covers every failure the simulator can hit, from socket-level problems to
/// protocol violations and register addressing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// I/O related errors
    ///
    /// # Examples
    /// - Connection reset by peer
    /// - Broken pipe while writing a response
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection errors
    ///
    /// # Examples
    /// - Address not available when binding
    /// - Permission denied on port 502
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// # Examples
    /// - Client idle for longer than the configured idle timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors that don't fit a more specific variant
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Fewer bytes are buffered than the MBAP header declares
    ///
    /// Not fatal: the connection keeps reading and decodes again once more
    /// bytes have arrived.
    #[error("Frame too short: need {needed} bytes, have {available}")]
    FrameTooShort { needed: usize, available: usize },

    /// MBAP protocol identifier is not 0 (Modbus)
    #[error("Invalid protocol id: {protocol_id}")]
    InvalidProtocolId { protocol_id: u16 },

    /// Unsupported function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Access outside the bounds of a register block
    ///
    /// # Examples
    /// - Reading 60 coils starting at 50 from a 100-coil block
    /// - Zero quantity
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value in a request
    ///
    /// # Examples
    /// - Coil value not 0x0000 or 0xFF00
    /// - Byte count disagreeing with the quantity
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Malformed frame (bad MBAP length and similar)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    ///
    /// # Examples
    /// - Empty address list
    /// - Unparseable YAML file
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a frame-too-short error
    pub fn frame_too_short(needed: usize, available: usize) -> Self {
        Self::FrameTooShort { needed, available }
    }

    /// Create an invalid protocol id error
    pub fn invalid_protocol_id(protocol_id: u16) -> Self {
        Self::InvalidProtocolId { protocol_id }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    ///
    /// # Arguments
    ///
    /// * `start` - Starting address
    /// * `count` - Number of cells
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the codec needs more bytes before it can decode
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::FrameTooShort { .. })
    }

    /// Check if the error is a network/transport issue
    ///
    /// ```rust
    /// use voltage_modbus_sim::ModbusError;
    ///
    /// assert!(ModbusError::connection("Address in use").is_transport_error());
    /// assert!(!ModbusError::invalid_address(0, 200).is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::FrameTooShort { .. }
                | Self::InvalidProtocolId { .. }
                | Self::InvalidFunction { .. }
                | Self::Frame { .. }
        )
    }

    /// Exception code reported to the client for this error
    ///
    /// Anything that isn't a function, address or value problem is reported
    /// as a device failure.
    pub fn to_exception(&self) -> ModbusException {
        match self {
            Self::InvalidFunction { .. } => ModbusException::IllegalFunction,
            Self::InvalidAddress { .. } => ModbusException::IllegalDataAddress,
            Self::InvalidData { .. } => ModbusException::IllegalDataValue,
            _ => ModbusException::SlaveDeviceFailure,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::frame_too_short(12, 7);
        assert!(err.is_incomplete());
        assert!(err.is_protocol_error());
        assert!(!err.is_transport_error());

        let err = ModbusError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_transport_error());
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_exception_mapping() {
        assert_eq!(
            ModbusError::invalid_function(0x08).to_exception(),
            ModbusException::IllegalFunction
        );
        assert_eq!(
            ModbusError::invalid_address(50, 60).to_exception(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(
            ModbusError::invalid_data("bad coil value").to_exception(),
            ModbusException::IllegalDataValue
        );
        assert_eq!(
            ModbusError::internal("lock poisoned").to_exception(),
            ModbusException::SlaveDeviceFailure
        );
    }

    #[test]
    fn test_error_display() {
        let msg = ModbusError::invalid_protocol_id(0x1234).to_string();
        assert!(msg.contains("4660"));

        let msg = ModbusError::invalid_address(90, 20).to_string();
        assert!(msg.contains("start=90"));
    }
}
