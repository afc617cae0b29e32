//! The plant core: capability table and discrete-time inverter model.

/// Voltage-indexed reactive-power capability table.
pub mod capability;
/// First-order lag + transport delay plant model.
pub mod model;

// Re-export the main types for convenience
pub use capability::CapabilityCurve;
pub use capability::CurveConfig;
pub use capability::CurveError;
pub use capability::ReactiveLimits;
pub use model::PlantModel;
pub use model::StepInput;
pub use model::StepOutput;
