//! Batch scenario driver: builds the plant from configuration and runs
//! the tick loop without real-time pacing.

use crate::command::{CommandQueue, SetpointCommand, command_channel};
use crate::config::ScenarioConfig;
use crate::plant::{CapabilityCurve, CurveError, PlantModel, StepInput, StepOutput};

/// Complete record of a batch run.
pub struct SimulationResult {
    /// One output record per tick, in order.
    pub records: Vec<StepOutput>,
}

/// Builds a plant model from scenario configuration.
///
/// # Errors
///
/// Returns a `CurveError` if the capability table is malformed; the
/// simulator refuses to run with undefined reactive limits.
pub fn build_plant(cfg: &ScenarioConfig) -> Result<PlantModel, CurveError> {
    let curve = CapabilityCurve::from_config(&cfg.capability)?;
    let p = &cfg.plant;
    Ok(PlantModel::new(
        p.tick_s,
        p.tau_p_s,
        p.tau_q_s,
        p.delay_s,
        p.rated_mva,
        curve,
    ))
}

/// Runs a scenario to completion and returns every tick's record.
///
/// Scripted commands are preloaded into the same timestamp-gated
/// channel the interactive loop uses, so batch runs exercise identical
/// dispatch semantics: at most one due command is applied per tick,
/// always before the plant step. Fully deterministic for a given
/// configuration.
///
/// # Errors
///
/// Returns a `CurveError` if the capability table is malformed.
pub fn run_scenario(cfg: &ScenarioConfig) -> Result<SimulationResult, CurveError> {
    let mut plant = build_plant(cfg)?;

    let (tx, mut queue) = command_channel(cfg.commands.len().max(1));
    for entry in &cfg.commands {
        // Channel capacity covers the whole script; a send can only
        // fail if the script length changed underneath us.
        let _ = tx.send(SetpointCommand {
            p_mw: entry.p_mw,
            q_mvar: entry.q_mvar,
            time_s: entry.time_s,
        });
    }

    let tick_s = cfg.plant.tick_s;
    let steps = (cfg.simulation.duration_s / tick_s).round() as usize;
    let records = drive(&mut plant, &mut queue, cfg, tick_s, steps);

    Ok(SimulationResult { records })
}

/// The shared tick loop: command poll, grid profile, plant step.
fn drive(
    plant: &mut PlantModel,
    queue: &mut CommandQueue,
    cfg: &ScenarioConfig,
    tick_s: f64,
    steps: usize,
) -> Vec<StepOutput> {
    let mut set_p_mw = 0.0;
    let mut set_q_mvar = 0.0;
    let mut records = Vec::with_capacity(steps);

    for k in 0..steps {
        let time_s = k as f64 * tick_s;

        // Command application is atomic with respect to the step: one
        // poll, then the step, never interleaved.
        if let Some(cmd) = queue.next_due(time_s) {
            set_p_mw = cmd.p_mw;
            set_q_mvar = cmd.q_mvar;
        }

        let (grid_v_pu, grid_f_hz) = cfg.grid.at(time_s);
        let input = StepInput {
            set_p_mw,
            set_q_mvar,
            grid_v_pu,
            grid_f_hz,
            time_s,
        };
        records.push(plant.step(&input));
    }

    records
}
