//! Logging setup and packet tracing
//!
//! The library logs through the `log` facade. Binaries call [`init_logging`]
//! once to install `env_logger` with a timestamped line format; `RUST_LOG`
//! overrides the default level as usual.

use std::io::Write;

use log::{log_enabled, trace, Level, LevelFilter};

/// Direction of a traced packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    /// Request bytes read from a client
    Received,
    /// Response bytes written to a client
    Sent,
}

impl PacketDirection {
    fn arrow(self) -> &'static str {
        match self {
            PacketDirection::Received => "->",
            PacketDirection::Sent => "<-",
        }
    }
}

/// Install the console logger with an `info` default level
pub fn init_logging() {
    init_logging_with_level(LevelFilter::Info);
}

/// Install the console logger with the given default level
///
/// Calling it more than once is harmless; later calls are ignored.
pub fn init_logging_with_level(default_level: LevelFilter) {
    let env = env_logger::Env::default().default_filter_or(default_level.to_string());
    let _ = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Format bytes as space separated upper-case hex, e.g. `00 01 00 00`
pub fn format_packet(data: &[u8]) -> String {
    data.iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trace a raw Modbus TCP frame exchanged with `peer`
pub fn log_packet(peer: &str, direction: PacketDirection, data: &[u8]) {
    if log_enabled!(Level::Trace) {
        trace!(
            "{} {} {} bytes: {}",
            peer,
            direction.arrow(),
            data.len(),
            format_packet(data)
        );
    }
}
