//! Telemetry persistence.

pub mod export;
