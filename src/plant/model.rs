//! Discrete-time inverter plant: first-order lag, transport delay, and
//! capability saturation.

use std::collections::VecDeque;
use std::fmt;

use crate::plant::capability::{CapabilityCurve, ReactiveLimits};

/// Voltage magnitude below which the current calculation is forced to
/// zero instead of dividing by a near-zero value.
const VOLTAGE_EPS_PU: f64 = 0.001;

/// Apparent power below which the power factor is defined as 1.0.
const APPARENT_EPS_MVA: f64 = 0.001;

/// Steady-state grid voltage used to seed the delay lines (pu).
const SEED_VOLTAGE_PU: f64 = 1.0;

/// Steady-state grid frequency used to seed the delay lines (Hz).
const SEED_FREQUENCY_HZ: f64 = 50.0;

/// Commanded setpoints and grid disturbance values for one tick.
///
/// Transient input, consumed by [`PlantModel::step`] and never stored.
#[derive(Debug, Clone, Copy)]
pub struct StepInput {
    /// Commanded active power (MW).
    pub set_p_mw: f64,
    /// Commanded reactive power (MVAr).
    pub set_q_mvar: f64,
    /// Grid voltage disturbance (pu).
    pub grid_v_pu: f64,
    /// Grid frequency disturbance (Hz).
    pub grid_f_hz: f64,
    /// Simulation timestamp (s).
    pub time_s: f64,
}

/// Immutable snapshot of one simulation tick.
///
/// Carries the applied (post-saturation) setpoints, the instantaneous
/// physical view of the plant, the delayed view a meter would report,
/// and the capability bounds used that tick.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    /// Simulation timestamp (s).
    pub time_s: f64,
    /// Active-power setpoint actually applied after saturation (MW).
    pub set_p_mw: f64,
    /// Reactive-power setpoint actually applied after saturation (MVAr).
    pub set_q_mvar: f64,
    /// Physical active power before this tick's state update (MW).
    pub phys_p_mw: f64,
    /// Physical reactive power before this tick's state update (MVAr).
    pub phys_q_mvar: f64,
    /// Physical power factor, negative when generating (P < 0).
    pub phys_pf: f64,
    /// Grid voltage seen by the plant this tick (pu).
    pub phys_v_pu: f64,
    /// Grid frequency seen by the plant this tick (Hz).
    pub phys_f_hz: f64,
    /// Physical current magnitude (kA).
    pub phys_i_ka: f64,
    /// Measured (delayed) active power (MW).
    pub meas_p_mw: f64,
    /// Measured (delayed) reactive power (MVAr).
    pub meas_q_mvar: f64,
    /// Measured power factor.
    pub meas_pf: f64,
    /// Measured voltage (pu).
    pub meas_v_pu: f64,
    /// Measured frequency (Hz).
    pub meas_f_hz: f64,
    /// Measured current magnitude (kA).
    pub meas_i_ka: f64,
    /// Upper reactive-power bound used this tick (MVAr).
    pub max_q_mvar: f64,
    /// Lower reactive-power bound used this tick (MVAr).
    pub min_q_mvar: f64,
}

impl fmt::Display for StepOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t={:>7.1}s | set P={:>6.2} Q={:>6.2} | phys P={:>6.3} Q={:>6.3} \
             PF={:>5.2} V={:>4.2} F={:>4.1} I={:>6.3} | meas P={:>6.3} Q={:>6.3} \
             PF={:>5.2} V={:>4.2} F={:>4.1} I={:>6.3} | Qlim=[{:>6.3}, {:>6.3}]",
            self.time_s,
            self.set_p_mw,
            self.set_q_mvar,
            self.phys_p_mw,
            self.phys_q_mvar,
            self.phys_pf,
            self.phys_v_pu,
            self.phys_f_hz,
            self.phys_i_ka,
            self.meas_p_mw,
            self.meas_q_mvar,
            self.meas_pf,
            self.meas_v_pu,
            self.meas_f_hz,
            self.meas_i_ka,
            self.min_q_mvar,
            self.max_q_mvar,
        )
    }
}

/// Stateful discrete-time model of a grid-connected inverter plant.
///
/// Each channel follows a zero-order-hold discretized first-order lag
/// `y[k] = a*y[k-1] + b*u[k]` with `a = exp(-T/tau)`, and the telemetry
/// view lags the physical signal by a fixed-depth FIFO modeling the
/// sensing/transport latency. Setpoints are saturated against the
/// capability curve and the rated apparent power before they drive the
/// lag state.
///
/// `step` is not re-entrant; exactly one driving loop must own an
/// instance. The model holds no process-wide state, so independent
/// instances can coexist in one process.
#[derive(Debug, Clone)]
pub struct PlantModel {
    // Lag recursion coefficients per channel.
    a_p: f64,
    b_p: f64,
    a_q: f64,
    b_q: f64,
    rated_mva: f64,
    curve: CapabilityCurve,
    // Lag filter outputs y[k-1].
    p_physical_mw: f64,
    q_physical_mvar: f64,
    // Transport-delay FIFOs, always holding `delay_steps` samples.
    delay_p: VecDeque<f64>,
    delay_q: VecDeque<f64>,
    delay_v: VecDeque<f64>,
    delay_f: VecDeque<f64>,
}

impl PlantModel {
    /// Creates a plant model with the given timing constants.
    ///
    /// # Arguments
    ///
    /// * `tick_s` - Fixed simulation tick period (s, must be > 0)
    /// * `tau_p_s` - Active-power lag time constant (s, must be > 0)
    /// * `tau_q_s` - Reactive-power lag time constant (s, must be > 0)
    /// * `delay_s` - Total measurement transport delay (s, >= 0)
    /// * `rated_mva` - Rated apparent power (MVA, must be > 0)
    /// * `curve` - Capability curve, built and validated beforehand
    ///
    /// # Panics
    ///
    /// Panics if any timing constant or the rating is out of range.
    pub fn new(
        tick_s: f64,
        tau_p_s: f64,
        tau_q_s: f64,
        delay_s: f64,
        rated_mva: f64,
        curve: CapabilityCurve,
    ) -> Self {
        assert!(tick_s > 0.0, "tick_s must be > 0");
        assert!(tau_p_s > 0.0, "tau_p_s must be > 0");
        assert!(tau_q_s > 0.0, "tau_q_s must be > 0");
        assert!(delay_s >= 0.0, "delay_s must be >= 0");
        assert!(rated_mva > 0.0, "rated_mva must be > 0");

        let a_p = (-tick_s / tau_p_s).exp();
        let a_q = (-tick_s / tau_q_s).exp();
        let delay_steps = (delay_s / tick_s).round() as usize;

        Self {
            a_p,
            b_p: 1.0 - a_p,
            a_q,
            b_q: 1.0 - a_q,
            rated_mva,
            curve,
            p_physical_mw: 0.0,
            q_physical_mvar: 0.0,
            delay_p: seeded_line(delay_steps, 0.0),
            delay_q: seeded_line(delay_steps, 0.0),
            delay_v: seeded_line(delay_steps, SEED_VOLTAGE_PU),
            delay_f: seeded_line(delay_steps, SEED_FREQUENCY_HZ),
        }
    }

    /// Measurement latency in ticks, `round(delay_s / tick_s)`.
    pub fn delay_steps(&self) -> usize {
        self.delay_p.len()
    }

    /// Rated apparent power (MVA).
    pub fn rated_mva(&self) -> f64 {
        self.rated_mva
    }

    /// Advances the plant by one tick.
    ///
    /// The commanded reactive power is clamped into the capability
    /// envelope first, then both setpoints are scaled back radially if
    /// their combined apparent power exceeds the rating; the order
    /// preserves the Q envelope exactly. Out-of-envelope commands are
    /// corrected, never rejected, and the applied values are part of
    /// the returned record.
    pub fn step(&mut self, input: &StepInput) -> StepOutput {
        // Snapshot the pre-update state: the physical view at t=k.
        let phys_p = self.p_physical_mw;
        let phys_q = self.q_physical_mvar;
        let phys_v = input.grid_v_pu;
        let phys_f = input.grid_f_hz;

        let phys_s = apparent_mva(phys_p, phys_q);
        let phys_i = current_ka(phys_s, phys_v);
        let phys_pf = power_factor(phys_p, phys_s);

        // Saturate the command: Q envelope, then apparent-power ceiling.
        let limits = self
            .curve
            .interpolated_limits(phys_v, input.set_p_mw, self.rated_mva);
        let mut set_p = input.set_p_mw;
        let mut set_q = input.set_q_mvar.clamp(limits.min_q_mvar, limits.max_q_mvar);

        let set_s = apparent_mva(set_p, set_q);
        if set_s > self.rated_mva {
            // Radial scale-back, preserving the commanded angle.
            let ratio = self.rated_mva / set_s;
            set_p *= ratio;
            set_q *= ratio;
        }

        // Lag state evolution, quantized to 6 decimals to pin down
        // long-run floating drift in the telemetry stream.
        self.p_physical_mw = round6(self.a_p * self.p_physical_mw + self.b_p * set_p);
        self.q_physical_mvar = round6(self.a_q * self.q_physical_mvar + self.b_q * set_q);

        // Rotate the transport-delay FIFOs.
        let meas_p = push_pop(&mut self.delay_p, phys_p);
        let meas_q = push_pop(&mut self.delay_q, phys_q);
        let meas_v = push_pop(&mut self.delay_v, phys_v);
        let meas_f = push_pop(&mut self.delay_f, phys_f);

        let meas_s = apparent_mva(meas_p, meas_q);
        let meas_i = current_ka(meas_s, meas_v);
        let meas_pf = power_factor(meas_p, meas_s);

        StepOutput {
            time_s: input.time_s,
            set_p_mw: set_p,
            set_q_mvar: set_q,
            phys_p_mw: phys_p,
            phys_q_mvar: phys_q,
            phys_pf,
            phys_v_pu: phys_v,
            phys_f_hz: phys_f,
            phys_i_ka: phys_i,
            meas_p_mw: meas_p,
            meas_q_mvar: meas_q,
            meas_pf,
            meas_v_pu: meas_v,
            meas_f_hz: meas_f,
            meas_i_ka: meas_i,
            max_q_mvar: limits.max_q_mvar,
            min_q_mvar: limits.min_q_mvar,
        }
    }

    /// Capability bounds the model would apply at the given operating
    /// point, without advancing state.
    pub fn reactive_limits(&self, voltage_pu: f64, set_p_mw: f64) -> ReactiveLimits {
        self.curve
            .interpolated_limits(voltage_pu, set_p_mw, self.rated_mva)
    }
}

fn seeded_line(len: usize, value: f64) -> VecDeque<f64> {
    std::iter::repeat_n(value, len).collect()
}

/// Enqueues the newest sample and returns the oldest. A zero-depth
/// line passes the sample straight through.
fn push_pop(line: &mut VecDeque<f64>, sample: f64) -> f64 {
    line.push_back(sample);
    // Always Some: push_back above guarantees at least one element.
    line.pop_front().unwrap_or(sample)
}

fn apparent_mva(p_mw: f64, q_mvar: f64) -> f64 {
    (p_mw * p_mw + q_mvar * q_mvar).sqrt()
}

fn current_ka(apparent_mva: f64, voltage_pu: f64) -> f64 {
    if voltage_pu > VOLTAGE_EPS_PU {
        apparent_mva / voltage_pu
    } else {
        0.0
    }
}

/// Signed power factor: |P|/S, 1.0 at negligible apparent power, and
/// negated when P < 0 to mark generation versus absorption.
fn power_factor(p_mw: f64, apparent_mva: f64) -> f64 {
    let pf = if apparent_mva > APPARENT_EPS_MVA {
        p_mw.abs() / apparent_mva
    } else {
        1.0
    };
    if p_mw < 0.0 { -pf } else { pf }
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::capability::CapabilityCurve;

    /// Wide-open single-level curve so lag tests are not saturated.
    fn open_curve() -> CapabilityCurve {
        CapabilityCurve::new(vec![1.0], vec![-1.0, 0.0, 1.0], vec![vec![1.0, 1.0, 1.0]])
            .expect("table should build")
    }

    fn nominal_input(set_p: f64, set_q: f64, time_s: f64) -> StepInput {
        StepInput {
            set_p_mw: set_p,
            set_q_mvar: set_q,
            grid_v_pu: 1.0,
            grid_f_hz: 50.0,
            time_s,
        }
    }

    /// Plant with a large rating, no delay, used for pure lag checks.
    fn lag_plant(tau_p_s: f64) -> PlantModel {
        PlantModel::new(0.1, tau_p_s, 0.1, 0.0, 10.0, open_curve())
    }

    #[test]
    fn first_tick_matches_discretized_lag() {
        // T=0.1, tau=0.2: a=exp(-0.5), b=1-a, so one tick from rest
        // with u=1 lands on b rounded to 6 decimals.
        let mut plant = lag_plant(0.2);
        let out0 = plant.step(&nominal_input(1.0, 0.0, 0.0));
        // The output reports the pre-update state.
        assert_eq!(out0.phys_p_mw, 0.0);
        let out1 = plant.step(&nominal_input(1.0, 0.0, 0.1));
        assert!((out1.phys_p_mw - 0.393469).abs() < 1e-9);
    }

    #[test]
    fn two_ticks_reach_one_minus_exp_minus_one() {
        let mut plant = lag_plant(0.2);
        for k in 0..2 {
            plant.step(&nominal_input(1.0, 0.0, k as f64 * 0.1));
        }
        let out = plant.step(&nominal_input(1.0, 0.0, 0.2));
        assert!((out.phys_p_mw - (1.0 - (-1.0_f64).exp())).abs() < 5e-4);
    }

    #[test]
    fn ten_ticks_reach_one_minus_exp_minus_five() {
        let mut plant = lag_plant(0.2);
        for k in 0..10 {
            plant.step(&nominal_input(1.0, 0.0, k as f64 * 0.1));
        }
        let out = plant.step(&nominal_input(1.0, 0.0, 1.0));
        assert!((out.phys_p_mw - (1.0 - (-5.0_f64).exp())).abs() < 5e-4);
    }

    #[test]
    fn constant_setpoint_settles_within_five_tau() {
        // 5*tau/T = 10 ticks at tau=0.2, T=0.1; allow the full window
        // plus the snapshot lag before asserting convergence.
        let mut plant = lag_plant(0.2);
        let mut last = 0.0;
        for k in 0..60 {
            last = plant.step(&nominal_input(2.0, 0.0, k as f64 * 0.1)).phys_p_mw;
        }
        assert!((last - 2.0).abs() < 1e-4);
    }

    #[test]
    fn delay_line_serves_seed_values_first() {
        // D=0.5, T=0.1: N=5 ticks of seeded defaults before any
        // commanded response shows up in the measured view.
        let curve = open_curve();
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.5, 10.0, curve);
        assert_eq!(plant.delay_steps(), 5);
        for k in 0..5 {
            let out = plant.step(&nominal_input(1.0, 0.5, k as f64 * 0.1));
            assert_eq!(out.meas_p_mw, 0.0);
            assert_eq!(out.meas_q_mvar, 0.0);
            assert_eq!(out.meas_v_pu, 1.0);
            assert_eq!(out.meas_f_hz, 50.0);
        }
        // Tick 5 drains the last seed and reports the tick-0 snapshot.
        let out = plant.step(&nominal_input(1.0, 0.5, 0.5));
        assert_eq!(out.meas_p_mw, 0.0);
        assert_eq!(out.meas_v_pu, 1.0);
    }

    #[test]
    fn measured_equals_physical_n_ticks_earlier() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.5, 10.0, open_curve());
        let n = plant.delay_steps();
        // Uniquely identifiable voltage ramp alongside the P response.
        let mut outputs = Vec::new();
        for k in 0..40 {
            let input = StepInput {
                set_p_mw: 1.0,
                set_q_mvar: 0.0,
                grid_v_pu: 1.0 + 0.001 * k as f64,
                grid_f_hz: 50.0,
                time_s: k as f64 * 0.1,
            };
            outputs.push(plant.step(&input));
        }
        for k in n..outputs.len() {
            assert_eq!(outputs[k].meas_p_mw, outputs[k - n].phys_p_mw);
            assert_eq!(outputs[k].meas_v_pu, outputs[k - n].phys_v_pu);
            assert_eq!(outputs[k].meas_f_hz, outputs[k - n].phys_f_hz);
        }
    }

    #[test]
    fn zero_delay_measures_instantaneously() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 10.0, open_curve());
        assert_eq!(plant.delay_steps(), 0);
        let out = plant.step(&nominal_input(1.0, 0.0, 0.0));
        assert_eq!(out.meas_p_mw, out.phys_p_mw);
        assert_eq!(out.meas_v_pu, 1.0);
    }

    #[test]
    fn reactive_command_clamps_to_envelope_exactly() {
        // Curve caps |Q| at 0.4 * rating; command far beyond it.
        let curve = CapabilityCurve::new(vec![1.0], vec![0.0], vec![vec![0.4]])
            .expect("table should build");
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 1.0, curve);
        let out = plant.step(&nominal_input(0.0, 3.0, 0.0));
        assert_eq!(out.set_q_mvar, out.max_q_mvar);
        assert_eq!(out.max_q_mvar, 0.4);

        let out = plant.step(&nominal_input(0.0, -3.0, 0.1));
        assert_eq!(out.set_q_mvar, out.min_q_mvar);
        assert_eq!(out.min_q_mvar, -0.4);
    }

    #[test]
    fn apparent_power_never_exceeds_rating() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 0.21, open_curve());
        for k in 0..50 {
            let out = plant.step(&nominal_input(5.0, 4.0, k as f64 * 0.1));
            let s = (out.set_p_mw.powi(2) + out.set_q_mvar.powi(2)).sqrt();
            assert!(s <= 0.21 + 1e-6, "tick {k}: applied S={s}");
        }
    }

    #[test]
    fn radial_scale_back_preserves_commanded_angle() {
        // Envelope far above the rating so only the ceiling acts.
        let curve = CapabilityCurve::new(vec![1.0], vec![0.0], vec![vec![5.0]])
            .expect("table should build");
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 1.0, curve);
        let out = plant.step(&nominal_input(3.0, 4.0, 0.0));
        // 3-4-5 triangle scaled onto the unit circle.
        assert!((out.set_p_mw - 0.6).abs() < 1e-12);
        assert!((out.set_q_mvar - 0.8).abs() < 1e-12);
    }

    #[test]
    fn envelope_clamp_happens_before_scale_back() {
        // Q clamps from 2.0 to 0.2 first, so P does not need scaling:
        // sqrt(0.9^2 + 0.2^2) < 1.0. Scaling first would shrink P too.
        let curve = CapabilityCurve::new(vec![1.0], vec![0.0, 1.0], vec![vec![0.2, 0.2]])
            .expect("table should build");
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 1.0, curve);
        let out = plant.step(&nominal_input(0.9, 2.0, 0.0));
        assert_eq!(out.set_p_mw, 0.9);
        assert_eq!(out.set_q_mvar, 0.2);
    }

    #[test]
    fn near_zero_voltage_forces_zero_current() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 10.0, open_curve());
        plant.step(&nominal_input(1.0, 0.0, 0.0));
        let input = StepInput {
            set_p_mw: 1.0,
            set_q_mvar: 0.0,
            grid_v_pu: 0.0005,
            grid_f_hz: 50.0,
            time_s: 0.1,
        };
        let out = plant.step(&input);
        assert!(out.phys_p_mw > 0.0);
        assert_eq!(out.phys_i_ka, 0.0);
    }

    #[test]
    fn near_zero_apparent_power_forces_unity_power_factor() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 10.0, open_curve());
        let out = plant.step(&nominal_input(0.0, 0.0, 0.0));
        assert_eq!(out.phys_pf, 1.0);
        assert_eq!(out.meas_pf, 1.0);
    }

    #[test]
    fn power_factor_negative_when_generating() {
        let mut plant = PlantModel::new(0.1, 0.2, 0.1, 0.0, 10.0, open_curve());
        for k in 0..5 {
            plant.step(&nominal_input(-1.0, 0.5, k as f64 * 0.1));
        }
        let out = plant.step(&nominal_input(-1.0, 0.5, 0.5));
        assert!(out.phys_p_mw < 0.0);
        assert!(out.phys_pf < 0.0);
    }

    #[test]
    fn lag_state_quantized_to_six_decimals() {
        let mut plant = lag_plant(0.2);
        plant.step(&nominal_input(1.0, 0.0, 0.0));
        let out = plant.step(&nominal_input(1.0, 0.0, 0.1));
        let scaled = out.phys_p_mw * 1e6;
        assert_eq!(scaled, scaled.round());
    }

    #[test]
    fn independent_instances_do_not_interact() {
        let mut a = lag_plant(0.2);
        let mut b = lag_plant(0.2);
        a.step(&nominal_input(1.0, 0.0, 0.0));
        let out_a = a.step(&nominal_input(1.0, 0.0, 0.1));
        let out_b = b.step(&nominal_input(0.0, 0.0, 0.0));
        assert!(out_a.phys_p_mw > 0.0);
        assert_eq!(out_b.phys_p_mw, 0.0);
    }

    #[test]
    fn display_row_does_not_panic() {
        let mut plant = lag_plant(0.2);
        let out = plant.step(&nominal_input(1.0, 0.5, 0.0));
        let row = format!("{out}");
        assert!(!row.is_empty());
    }
}
