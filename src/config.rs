//! TOML-based scenario configuration and preset definitions.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::plant::CurveConfig;

/// Top-level scenario configuration parsed from TOML.
///
/// All fields have defaults matching the baseline scenario. Load from
/// TOML with [`ScenarioConfig::from_toml_file`] or use
/// [`ScenarioConfig::baseline`] for the built-in default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Run length and pacing parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Plant timing constants and rating.
    #[serde(default)]
    pub plant: PlantConfig,
    /// Reactive-power capability table.
    #[serde(default)]
    pub capability: CurveConfig,
    /// Grid disturbance profile.
    #[serde(default)]
    pub grid: GridConfig,
    /// Scripted setpoint commands, replayed in batch runs.
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
}

/// Run length and pacing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Total simulated time (s, must be > 0).
    pub duration_s: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { duration_s: 120.0 }
    }
}

/// Plant timing constants and rating.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlantConfig {
    /// Simulation tick period (s, must be > 0).
    pub tick_s: f64,
    /// Active-power lag time constant (s, must be > 0).
    pub tau_p_s: f64,
    /// Reactive-power lag time constant (s, must be > 0).
    pub tau_q_s: f64,
    /// Total measurement transport delay (s, must be >= 0).
    pub delay_s: f64,
    /// Rated apparent power (MVA, must be > 0).
    pub rated_mva: f64,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            tick_s: 0.1,
            tau_p_s: 0.2,
            tau_q_s: 0.1,
            delay_s: 0.5,
            rated_mva: 0.21,
        }
    }
}

/// Grid disturbance profile: nominal values plus timed excursions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Nominal grid voltage (pu).
    pub voltage_pu: f64,
    /// Nominal grid frequency (Hz).
    pub frequency_hz: f64,
    /// Timed excursion windows; later entries win on overlap.
    pub events: Vec<GridEvent>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            voltage_pu: 1.0,
            frequency_hz: 50.0,
            events: Vec::new(),
        }
    }
}

/// One disturbance window, active for `start_s <= t < end_s`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridEvent {
    /// Window start (s, inclusive).
    pub start_s: f64,
    /// Window end (s, exclusive).
    pub end_s: f64,
    /// Voltage during the window (pu), nominal if omitted.
    pub voltage_pu: Option<f64>,
    /// Frequency during the window (Hz), nominal if omitted.
    pub frequency_hz: Option<f64>,
}

impl GridConfig {
    /// Grid voltage and frequency at the given simulation time.
    pub fn at(&self, time_s: f64) -> (f64, f64) {
        let mut v = self.voltage_pu;
        let mut f = self.frequency_hz;
        for event in &self.events {
            if time_s >= event.start_s && time_s < event.end_s {
                if let Some(ev) = event.voltage_pu {
                    v = ev;
                }
                if let Some(ef) = event.frequency_hz {
                    f = ef;
                }
            }
        }
        (v, f)
    }
}

/// One scripted setpoint command for batch runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEntry {
    /// Simulation time at which the command is issued (s).
    pub time_s: f64,
    /// Requested active power (MW).
    pub p_mw: f64,
    /// Requested reactive power (MVAr).
    pub q_mvar: f64,
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"plant.tick_s"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl ScenarioConfig {
    /// Returns the baseline scenario: the original simulator's
    /// parameters, including its two scripted voltage excursions.
    pub fn baseline() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            plant: PlantConfig::default(),
            capability: CurveConfig::default(),
            grid: GridConfig {
                events: vec![
                    GridEvent {
                        start_s: 30.0,
                        end_s: 40.0,
                        voltage_pu: Some(0.95),
                        frequency_hz: None,
                    },
                    GridEvent {
                        start_s: 60.0,
                        end_s: 70.0,
                        voltage_pu: Some(1.05),
                        frequency_hz: None,
                    },
                ],
                ..GridConfig::default()
            },
            commands: vec![
                CommandEntry {
                    time_s: 5.0,
                    p_mw: 0.15,
                    q_mvar: 0.05,
                },
                CommandEntry {
                    time_s: 50.0,
                    p_mw: -0.10,
                    q_mvar: 0.02,
                },
            ],
        }
    }

    /// Returns the weak-grid preset: deeper voltage excursions, a
    /// slower plant, and longer telemetry latency.
    pub fn weak_grid() -> Self {
        Self {
            simulation: SimulationConfig { duration_s: 180.0 },
            plant: PlantConfig {
                tau_p_s: 0.5,
                tau_q_s: 0.3,
                delay_s: 1.0,
                ..PlantConfig::default()
            },
            capability: CurveConfig::default(),
            grid: GridConfig {
                events: vec![
                    GridEvent {
                        start_s: 20.0,
                        end_s: 45.0,
                        voltage_pu: Some(0.92),
                        frequency_hz: Some(49.8),
                    },
                    GridEvent {
                        start_s: 90.0,
                        end_s: 110.0,
                        voltage_pu: Some(1.08),
                        frequency_hz: Some(50.2),
                    },
                ],
                ..GridConfig::default()
            },
            commands: vec![
                CommandEntry {
                    time_s: 5.0,
                    p_mw: 0.18,
                    q_mvar: 0.08,
                },
                CommandEntry {
                    time_s: 60.0,
                    p_mw: 0.05,
                    q_mvar: -0.10,
                },
                CommandEntry {
                    time_s: 120.0,
                    p_mw: -0.15,
                    q_mvar: 0.0,
                },
            ],
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "weak_grid"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "weak_grid" => Ok(Self::weak_grid()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML
    /// is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new(
                "scenario",
                format!("cannot read \"{}\": {e}", path.display()),
            )
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains
    /// unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if the configuration is valid. Deep
    /// capability-table validation happens again at curve construction;
    /// this pass reports the same problems with field paths attached.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        // NaN compares false against every bound, so each numeric
        // field is checked for finiteness explicitly; TOML accepts
        // `nan` and `inf` literals.
        if !(self.simulation.duration_s.is_finite() && self.simulation.duration_s > 0.0) {
            errors.push(ConfigError::new(
                "simulation.duration_s",
                "must be a finite number > 0",
            ));
        }

        let p = &self.plant;
        if !(p.tick_s.is_finite() && p.tick_s > 0.0) {
            errors.push(ConfigError::new("plant.tick_s", "must be a finite number > 0"));
        }
        if !(p.tau_p_s.is_finite() && p.tau_p_s > 0.0) {
            errors.push(ConfigError::new("plant.tau_p_s", "must be a finite number > 0"));
        }
        if !(p.tau_q_s.is_finite() && p.tau_q_s > 0.0) {
            errors.push(ConfigError::new("plant.tau_q_s", "must be a finite number > 0"));
        }
        if !(p.delay_s.is_finite() && p.delay_s >= 0.0) {
            errors.push(ConfigError::new("plant.delay_s", "must be a finite number >= 0"));
        }
        if !(p.rated_mva.is_finite() && p.rated_mva > 0.0) {
            errors.push(ConfigError::new(
                "plant.rated_mva",
                "must be a finite number > 0",
            ));
        }

        if !self.grid.voltage_pu.is_finite() || self.grid.voltage_pu < 0.0 {
            errors.push(ConfigError::new(
                "grid.voltage_pu",
                "must be a finite number >= 0",
            ));
        }
        if !self.grid.frequency_hz.is_finite() {
            errors.push(ConfigError::new("grid.frequency_hz", "must be a finite number"));
        }

        let cap = &self.capability;
        if cap.voltages_pu.is_empty() {
            errors.push(ConfigError::new(
                "capability.voltages_pu",
                "must contain at least one voltage level",
            ));
        }
        if cap.voltages_pu.iter().any(|v| !v.is_finite()) {
            errors.push(ConfigError::new(
                "capability.voltages_pu",
                "every voltage level must be finite",
            ));
        }
        if !cap.voltages_pu.windows(2).all(|w| w[0] < w[1]) {
            errors.push(ConfigError::new(
                "capability.voltages_pu",
                "must be strictly ascending",
            ));
        }
        if cap.p_axis.iter().any(|p| !p.is_finite()) {
            errors.push(ConfigError::new(
                "capability.p_axis",
                "every axis entry must be finite",
            ));
        }
        if cap
            .q_max_rows
            .iter()
            .any(|row| row.iter().any(|q| !q.is_finite()))
        {
            errors.push(ConfigError::new(
                "capability.q_max_rows",
                "every max-Q ratio must be finite",
            ));
        }
        if cap.q_max_rows.len() != cap.voltages_pu.len() {
            errors.push(ConfigError::new(
                "capability.q_max_rows",
                format!(
                    "must have one row per voltage level ({} levels, {} rows)",
                    cap.voltages_pu.len(),
                    cap.q_max_rows.len()
                ),
            ));
        }
        if cap
            .q_max_rows
            .iter()
            .any(|row| row.len() != cap.p_axis.len())
        {
            errors.push(ConfigError::new(
                "capability.q_max_rows",
                "every row must match the p_axis length",
            ));
        }

        for (i, event) in self.grid.events.iter().enumerate() {
            if !(event.start_s.is_finite() && event.end_s.is_finite() && event.start_s < event.end_s)
            {
                errors.push(ConfigError::new(
                    format!("grid.events[{i}].start_s"),
                    "window bounds must be finite with start_s < end_s",
                ));
            }
            if let Some(v) = event.voltage_pu
                && !(v.is_finite() && v >= 0.0)
            {
                errors.push(ConfigError::new(
                    format!("grid.events[{i}].voltage_pu"),
                    "must be a finite number >= 0",
                ));
            }
            if let Some(f) = event.frequency_hz
                && !f.is_finite()
            {
                errors.push(ConfigError::new(
                    format!("grid.events[{i}].frequency_hz"),
                    "must be a finite number",
                ));
            }
        }

        let mut last_time = f64::NEG_INFINITY;
        for (i, cmd) in self.commands.iter().enumerate() {
            if !(cmd.time_s.is_finite() && cmd.time_s >= 0.0) {
                errors.push(ConfigError::new(
                    format!("commands[{i}].time_s"),
                    "must be a finite number >= 0",
                ));
            }
            if cmd.time_s < last_time {
                errors.push(ConfigError::new(
                    format!("commands[{i}].time_s"),
                    "scripted commands must be in ascending time order",
                ));
            }
            last_time = cmd.time_s;
        }

        errors
    }
}
