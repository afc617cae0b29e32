//! Hardware-in-loop simulator of a grid-connected battery storage plant.

/// Timestamp-gated setpoint command channel.
pub mod command;
pub mod config;
pub mod io;
/// Modbus TCP register adapter (feature `modbus`).
#[cfg(feature = "modbus")]
pub mod modbus;
/// The plant core: capability table and discrete-time inverter model.
pub mod plant;
pub mod runner;
