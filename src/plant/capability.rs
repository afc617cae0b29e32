//! Voltage-dependent P-Q capability curve for the inverter.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Reactive-power bounds returned by a capability lookup, in the same
/// unit as the apparent-power limit passed in (MVAr here).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReactiveLimits {
    /// Upper bound on reactive power (injection).
    pub max_q_mvar: f64,
    /// Lower bound on reactive power (absorption), the negation of the
    /// stored max-Q ratio.
    pub min_q_mvar: f64,
}

/// Fatal capability-table construction or load error.
///
/// The simulator must refuse to run with undefined reactive limits, so
/// none of these are recoverable.
#[derive(Debug, Error)]
pub enum CurveError {
    #[error("capability table has no voltage levels")]
    Empty,
    #[error("capability power axis is empty")]
    EmptyAxis,
    #[error("voltage levels must be strictly ascending (index {0})")]
    NotAscending(usize),
    #[error("expected {expected} max-Q rows (one per voltage level), got {got}")]
    RowCountMismatch { expected: usize, got: usize },
    #[error("max-Q row {row} has {got} entries, power axis has {expected}")]
    RowLengthMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("voltage level {0} is not finite")]
    NonFiniteVoltage(usize),
    #[error("cannot read curve file \"{path}\": {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse curve file \"{path}\": {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialized form of a capability table.
///
/// Deserializes both from the `[capability]` section of a TOML scenario
/// and from a standalone JSON curve file; the aliases match the
/// PascalCase keys used by legacy `pq-curves.json` files.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurveConfig {
    /// Ascending grid voltage levels (pu).
    #[serde(alias = "Voltages")]
    pub voltages_pu: Vec<f64>,
    /// Shared normalized active-power axis, P / S_max in [-1, 1].
    #[serde(alias = "CosTheta")]
    pub p_axis: Vec<f64>,
    /// One row of max-Q ratios (Q / S_max) per voltage level.
    #[serde(alias = "QMaxData")]
    pub q_max_rows: Vec<Vec<f64>>,
}

impl Default for CurveConfig {
    /// Symmetric five-level table: a unit semicircle at nominal voltage,
    /// derated toward both voltage extremes.
    fn default() -> Self {
        let semicircle = [
            0.000, 0.600, 0.800, 0.917, 0.980, 1.000, 0.980, 0.917, 0.800, 0.600, 0.000,
        ];
        let scaled = |k: f64| semicircle.iter().map(|q| q * k).collect::<Vec<f64>>();
        Self {
            voltages_pu: vec![0.90, 0.95, 1.00, 1.05, 1.10],
            p_axis: vec![-1.0, -0.8, -0.6, -0.4, -0.2, 0.0, 0.2, 0.4, 0.6, 0.8, 1.0],
            q_max_rows: vec![
                scaled(0.70),
                scaled(0.85),
                semicircle.to_vec(),
                scaled(0.85),
                scaled(0.70),
            ],
        }
    }
}

/// Immutable, voltage-indexed lookup table of reactive-power limits.
///
/// Each voltage level carries max-Q ratios over a shared normalized
/// active-power axis; min-Q is the elementwise negation. Lookups are
/// nearest-neighbor on both axes, so limits are piecewise constant
/// along the power axis.
#[derive(Debug, Clone)]
pub struct CapabilityCurve {
    voltages_pu: Vec<f64>,
    p_axis: Vec<f64>,
    q_max: Vec<Vec<f64>>,
    q_min: Vec<Vec<f64>>,
}

impl CapabilityCurve {
    /// Builds a capability table from raw level/axis/row data.
    ///
    /// # Errors
    ///
    /// Returns a `CurveError` if the table is empty, the voltage levels
    /// are not strictly ascending and finite, or any row is misaligned
    /// with the power axis. The table is never partially initialized.
    pub fn new(
        voltages_pu: Vec<f64>,
        p_axis: Vec<f64>,
        q_max: Vec<Vec<f64>>,
    ) -> Result<Self, CurveError> {
        if voltages_pu.is_empty() {
            return Err(CurveError::Empty);
        }
        if p_axis.is_empty() {
            return Err(CurveError::EmptyAxis);
        }
        for (i, v) in voltages_pu.iter().enumerate() {
            if !v.is_finite() {
                return Err(CurveError::NonFiniteVoltage(i));
            }
            if i > 0 && *v <= voltages_pu[i - 1] {
                return Err(CurveError::NotAscending(i));
            }
        }
        if q_max.len() != voltages_pu.len() {
            return Err(CurveError::RowCountMismatch {
                expected: voltages_pu.len(),
                got: q_max.len(),
            });
        }
        for (row, data) in q_max.iter().enumerate() {
            if data.len() != p_axis.len() {
                return Err(CurveError::RowLengthMismatch {
                    row,
                    expected: p_axis.len(),
                    got: data.len(),
                });
            }
        }

        let q_min = q_max
            .iter()
            .map(|row| row.iter().map(|q| -q).collect())
            .collect();

        Ok(Self {
            voltages_pu,
            p_axis,
            q_max,
            q_min,
        })
    }

    /// Builds a capability table from its serialized form.
    ///
    /// # Errors
    ///
    /// Same fatal conditions as [`CapabilityCurve::new`].
    pub fn from_config(cfg: &CurveConfig) -> Result<Self, CurveError> {
        Self::new(
            cfg.voltages_pu.clone(),
            cfg.p_axis.clone(),
            cfg.q_max_rows.clone(),
        )
    }

    /// Loads a capability table from a JSON curve file.
    ///
    /// Accepts both the snake_case field names and the legacy
    /// PascalCase `pq-curves.json` keys.
    ///
    /// # Errors
    ///
    /// Returns a `CurveError` if the file cannot be read, parsed, or
    /// fails table validation.
    pub fn from_json_file(path: &Path) -> Result<Self, CurveError> {
        let text = fs::read_to_string(path).map_err(|source| CurveError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: CurveConfig = serde_json::from_str(&text).map_err(|source| CurveError::Json {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_config(&cfg)
    }

    /// Stored voltage levels, ascending (pu).
    pub fn voltage_levels(&self) -> &[f64] {
        &self.voltages_pu
    }

    /// Nearest-neighbor reactive limits at the given grid voltage and
    /// active-power setpoint.
    ///
    /// The active power is normalized by `apparent_limit` and clamped
    /// to [-1, 1], then the nearest voltage level and nearest axis
    /// entry are selected (ties resolve to the lower level and the
    /// first axis entry). Returned limits are scaled back to the
    /// `apparent_limit` unit.
    pub fn limits(&self, voltage_pu: f64, active_power: f64, apparent_limit: f64) -> ReactiveLimits {
        let row = self.nearest_level_index(voltage_pu);
        self.limits_at_row(row, active_power, apparent_limit)
    }

    /// Reactive limits with linear interpolation between the two
    /// voltage levels bracketing `voltage_pu`.
    ///
    /// At or beyond the table edges this clamps to the edge level's
    /// [`CapabilityCurve::limits`] result; no extrapolation. Each
    /// bracketing lookup is still nearest-neighbor on the power axis.
    pub fn interpolated_limits(
        &self,
        voltage_pu: f64,
        active_power: f64,
        apparent_limit: f64,
    ) -> ReactiveLimits {
        let first = self.voltages_pu[0];
        let last = self.voltages_pu[self.voltages_pu.len() - 1];
        if voltage_pu <= first {
            return self.limits_at_row(0, active_power, apparent_limit);
        }
        if voltage_pu >= last {
            return self.limits_at_row(self.voltages_pu.len() - 1, active_power, apparent_limit);
        }

        // Strictly inside the table: upper is the first level at or
        // above the voltage, lower its predecessor.
        let upper = self.voltages_pu.partition_point(|v| *v < voltage_pu);
        if self.voltages_pu[upper] == voltage_pu {
            // Exactly on a stored level, no interpolation.
            return self.limits_at_row(upper, active_power, apparent_limit);
        }
        let lower = upper - 1;
        let v_lo = self.voltages_pu[lower];
        let v_hi = self.voltages_pu[upper];
        let lo = self.limits_at_row(lower, active_power, apparent_limit);
        let hi = self.limits_at_row(upper, active_power, apparent_limit);
        let ratio = (voltage_pu - v_lo) / (v_hi - v_lo);
        ReactiveLimits {
            max_q_mvar: lo.max_q_mvar + (hi.max_q_mvar - lo.max_q_mvar) * ratio,
            min_q_mvar: lo.min_q_mvar + (hi.min_q_mvar - lo.min_q_mvar) * ratio,
        }
    }

    fn limits_at_row(&self, row: usize, active_power: f64, apparent_limit: f64) -> ReactiveLimits {
        let p_ratio = (active_power / apparent_limit).clamp(-1.0, 1.0);
        let idx = nearest_first(&self.p_axis, p_ratio);
        ReactiveLimits {
            max_q_mvar: self.q_max[row][idx] * apparent_limit,
            min_q_mvar: self.q_min[row][idx] * apparent_limit,
        }
    }

    /// Index of the stored level nearest to `voltage_pu`; ties between
    /// two adjacent levels go to the lower one. Binary search over the
    /// ascending levels, validated at construction.
    fn nearest_level_index(&self, voltage_pu: f64) -> usize {
        let levels = &self.voltages_pu;
        let insert = levels.partition_point(|v| *v < voltage_pu);
        if insert == 0 {
            return 0;
        }
        if insert == levels.len() {
            return levels.len() - 1;
        }
        let below = voltage_pu - levels[insert - 1];
        let above = levels[insert] - voltage_pu;
        if below <= above { insert - 1 } else { insert }
    }
}

/// First index whose value is nearest to `x`; earlier entries win ties.
/// The power axis is caller-ordered, so this stays a linear scan.
fn nearest_first(values: &[f64], x: f64) -> usize {
    let mut best = 0;
    let mut best_diff = f64::MAX;
    for (i, v) in values.iter().enumerate() {
        let diff = (v - x).abs();
        if diff < best_diff {
            best_diff = diff;
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_curve() -> CapabilityCurve {
        CapabilityCurve::new(
            vec![0.9, 1.1],
            vec![-1.0, 0.0, 1.0],
            vec![vec![0.2, 0.4, 0.2], vec![0.4, 0.8, 0.4]],
        )
        .expect("table should build")
    }

    #[test]
    fn min_q_is_negated_max_q() {
        let curve = two_level_curve();
        let lim = curve.limits(1.1, 0.0, 1.0);
        assert_eq!(lim.max_q_mvar, 0.8);
        assert_eq!(lim.min_q_mvar, -0.8);
    }

    #[test]
    fn limits_scale_by_apparent_limit() {
        let curve = two_level_curve();
        let lim = curve.limits(0.9, 0.0, 0.21);
        assert!((lim.max_q_mvar - 0.4 * 0.21).abs() < 1e-12);
        assert!((lim.min_q_mvar + 0.4 * 0.21).abs() < 1e-12);
    }

    #[test]
    fn active_power_normalization_clamps() {
        let curve = two_level_curve();
        // P far beyond the rating still lands on the axis edge.
        let lim = curve.limits(0.9, 50.0, 1.0);
        assert_eq!(lim.max_q_mvar, 0.2);
    }

    #[test]
    fn nearest_voltage_tie_goes_to_lower_level() {
        let curve = two_level_curve();
        // 1.0 is equidistant from 0.9 and 1.1.
        let lim = curve.limits(1.0, 0.0, 1.0);
        assert_eq!(lim.max_q_mvar, 0.4);
    }

    #[test]
    fn nearest_axis_tie_goes_to_first_entry() {
        let curve = CapabilityCurve::new(
            vec![1.0],
            vec![0.0, 1.0],
            vec![vec![0.3, 0.7]],
        )
        .expect("table should build");
        // 0.5 is equidistant from both axis entries.
        let lim = curve.limits(1.0, 0.5, 1.0);
        assert_eq!(lim.max_q_mvar, 0.3);
    }

    #[test]
    fn interpolation_matches_lookup_at_stored_level() {
        let curve = two_level_curve();
        for v in [0.9, 1.1] {
            let direct = curve.limits(v, 0.0, 1.0);
            let interp = curve.interpolated_limits(v, 0.0, 1.0);
            assert_eq!(direct.max_q_mvar, interp.max_q_mvar);
            assert_eq!(direct.min_q_mvar, interp.min_q_mvar);
        }
    }

    #[test]
    fn interpolation_exact_at_interior_level() {
        let curve = CapabilityCurve::new(
            vec![0.9, 1.0, 1.1],
            vec![0.0],
            vec![vec![0.1], vec![0.3], vec![0.5]],
        )
        .expect("table should build");
        let direct = curve.limits(1.0, 0.0, 1.0);
        let interp = curve.interpolated_limits(1.0, 0.0, 1.0);
        assert_eq!(direct.max_q_mvar, interp.max_q_mvar);
        assert_eq!(direct.min_q_mvar, interp.min_q_mvar);
    }

    #[test]
    fn interpolation_is_convex_combination() {
        let curve = two_level_curve();
        let lo = curve.limits(0.9, 0.0, 1.0);
        let hi = curve.limits(1.1, 0.0, 1.0);
        // Quarter of the way between the levels.
        let lim = curve.interpolated_limits(0.95, 0.0, 1.0);
        let expected = lo.max_q_mvar + (hi.max_q_mvar - lo.max_q_mvar) * 0.25;
        assert!((lim.max_q_mvar - expected).abs() < 1e-12);
        assert!((lim.min_q_mvar + expected).abs() < 1e-12);
    }

    #[test]
    fn voltage_below_table_clamps_to_lowest_level() {
        let curve = two_level_curve();
        let edge = curve.limits(0.9, 0.0, 1.0);
        let lim = curve.interpolated_limits(0.5, 0.0, 1.0);
        assert_eq!(lim, edge);
    }

    #[test]
    fn voltage_above_table_clamps_to_highest_level() {
        let curve = two_level_curve();
        let edge = curve.limits(1.1, 0.0, 1.0);
        let lim = curve.interpolated_limits(1.4, 0.0, 1.0);
        assert_eq!(lim, edge);
    }

    #[test]
    fn single_level_table_always_uses_that_level() {
        let curve = CapabilityCurve::new(vec![1.0], vec![0.0], vec![vec![0.5]])
            .expect("table should build");
        for v in [0.2, 1.0, 5.0] {
            assert_eq!(curve.interpolated_limits(v, 0.0, 1.0).max_q_mvar, 0.5);
        }
    }

    #[test]
    fn empty_voltages_rejected() {
        let err = CapabilityCurve::new(vec![], vec![0.0], vec![]);
        assert!(matches!(err, Err(CurveError::Empty)));
    }

    #[test]
    fn empty_axis_rejected() {
        let err = CapabilityCurve::new(vec![1.0], vec![], vec![vec![]]);
        assert!(matches!(err, Err(CurveError::EmptyAxis)));
    }

    #[test]
    fn non_ascending_voltages_rejected() {
        let err = CapabilityCurve::new(
            vec![1.0, 1.0],
            vec![0.0],
            vec![vec![0.5], vec![0.5]],
        );
        assert!(matches!(err, Err(CurveError::NotAscending(1))));
    }

    #[test]
    fn misaligned_row_rejected() {
        let err = CapabilityCurve::new(vec![1.0], vec![0.0, 1.0], vec![vec![0.5]]);
        assert!(matches!(err, Err(CurveError::RowLengthMismatch { row: 0, .. })));
    }

    #[test]
    fn row_count_mismatch_rejected() {
        let err = CapabilityCurve::new(vec![0.9, 1.1], vec![0.0], vec![vec![0.5]]);
        assert!(matches!(
            err,
            Err(CurveError::RowCountMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn default_config_builds() {
        let curve = CapabilityCurve::from_config(&CurveConfig::default());
        assert!(curve.is_ok());
        let curve = curve.expect("default table should build");
        assert_eq!(curve.voltage_levels().len(), 5);
        // Full reactive range available at nominal voltage and zero P.
        let lim = curve.limits(1.0, 0.0, 0.21);
        assert!((lim.max_q_mvar - 0.21).abs() < 1e-12);
    }

    #[test]
    fn json_curve_file_loads() {
        let path = std::env::temp_dir().join("bess-hil-sim-curve-test.json");
        std::fs::write(
            &path,
            r#"{
                "voltages_pu": [0.9, 1.1],
                "p_axis": [-1.0, 0.0, 1.0],
                "q_max_rows": [[0.2, 0.4, 0.2], [0.4, 0.8, 0.4]]
            }"#,
        )
        .expect("fixture should write");
        let curve = CapabilityCurve::from_json_file(&path);
        std::fs::remove_file(&path).ok();
        let curve = curve.expect("curve file should load");
        assert_eq!(curve.voltage_levels(), &[0.9, 1.1]);
    }

    #[test]
    fn missing_curve_file_is_io_error() {
        let err = CapabilityCurve::from_json_file(Path::new("/nonexistent/curve.json"));
        assert!(matches!(err, Err(CurveError::Io { .. })));
    }

    #[test]
    fn legacy_json_keys_accepted() {
        let json = r#"{
            "Voltages": [0.95, 1.05],
            "CosTheta": [-1.0, 0.0, 1.0],
            "QMaxData": [[0.1, 0.9, 0.1], [0.1, 0.9, 0.1]]
        }"#;
        let cfg: CurveConfig = serde_json::from_str(json).expect("legacy keys should parse");
        let curve = CapabilityCurve::from_config(&cfg).expect("table should build");
        assert_eq!(curve.limits(1.0, 0.0, 1.0).max_q_mvar, 0.9);
    }
}
