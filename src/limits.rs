use serde::{Deserialize, Serialize};

use crate::errors::{CommandError, ConfigError};
use crate::params::CommandParams;

pub const MAX_ACCEL_COMPENSATION: f64 = 0.005;
pub const RINGING_REDUCTION_FACTOR: f64 = 10.0;

/// Raw configuration of the toolhead's kinematic limits, as read from
/// the printer configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_velocity: f64,
    pub max_accel: f64,
    /// Defaults to `max_accel / 2` when absent.
    pub max_accel_to_decel: Option<f64>,
    pub square_corner_velocity: f64,
    pub min_jerk_limit_time: f64,
    /// Defaults to a multiple of `max_accel`, see `max_jerk_default`.
    pub max_jerk: Option<f64>,
    pub acceleration_order: u8,
    pub accel_compensation: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_velocity: 100.0,
            max_accel: 100.0,
            max_accel_to_decel: None,
            square_corner_velocity: 5.0,
            min_jerk_limit_time: 0.0,
            max_jerk: None,
            acceleration_order: 2,
            accel_compensation: 0.0,
        }
    }
}

impl LimitsConfig {
    pub fn build(&self) -> Result<ToolheadLimits, ConfigError> {
        ToolheadLimits::from_config(self)
    }
}

/// Live kinematic limits. Runtime changes are clamped against the
/// configured maxima, and the junction deviation is re-derived whenever
/// its inputs change.
#[derive(Debug, Clone, Serialize)]
pub struct ToolheadLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_jerk: f64,
    pub min_jerk_limit_time: f64,
    pub requested_accel_to_decel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    pub junction_deviation: f64,
    pub accel_order: u8,
    pub accel_compensation: f64,
    config_max_velocity: f64,
    config_max_accel: f64,
    config_square_corner_velocity: f64,
}

impl ToolheadLimits {
    pub fn from_config(config: &LimitsConfig) -> Result<ToolheadLimits, ConfigError> {
        if config.max_velocity <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "max_velocity",
                limit: 0.0,
            });
        }
        if config.max_accel <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "max_accel",
                limit: 0.0,
            });
        }
        if config.min_jerk_limit_time < 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "min_jerk_limit_time",
                limit: 0.0,
            });
        }
        if config.square_corner_velocity < 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "square_corner_velocity",
                limit: 0.0,
            });
        }
        if !matches!(config.acceleration_order, 2 | 4 | 6) {
            return Err(ConfigError::InvalidAccelOrder(config.acceleration_order));
        }
        if !(0.0..=MAX_ACCEL_COMPENSATION).contains(&config.accel_compensation) {
            return Err(ConfigError::AboveMaximum {
                option: "accel_compensation",
                limit: MAX_ACCEL_COMPENSATION,
            });
        }
        let max_jerk = config
            .max_jerk
            .unwrap_or_else(|| max_jerk_default(config.max_accel, config.min_jerk_limit_time));
        if max_jerk <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "max_jerk",
                limit: 0.0,
            });
        }
        let requested_accel_to_decel = config
            .max_accel_to_decel
            .unwrap_or(config.max_accel * 0.5);
        if requested_accel_to_decel <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "max_accel_to_decel",
                limit: 0.0,
            });
        }
        let mut limits = ToolheadLimits {
            max_velocity: config.max_velocity,
            max_accel: config.max_accel,
            max_jerk,
            min_jerk_limit_time: config.min_jerk_limit_time,
            requested_accel_to_decel,
            max_accel_to_decel: requested_accel_to_decel,
            square_corner_velocity: config.square_corner_velocity,
            junction_deviation: 0.0,
            accel_order: config.acceleration_order,
            accel_compensation: config.accel_compensation,
            config_max_velocity: config.max_velocity,
            config_max_accel: config.max_accel,
            config_square_corner_velocity: config.square_corner_velocity,
        };
        limits.calc_junction_deviation();
        Ok(limits)
    }

    pub fn calc_junction_deviation(&mut self) {
        let scv2 = self.square_corner_velocity * self.square_corner_velocity;
        self.junction_deviation = scv2 * (2f64.sqrt() - 1.0) / self.max_accel;
        self.max_accel_to_decel = self.requested_accel_to_decel.min(self.max_accel);
    }

    /// Maximum velocity a cartesian axis could halt at due to the
    /// junction deviation setting. The 8.0 was determined
    /// experimentally.
    pub fn max_axis_halt(&self) -> f64 {
        self.max_velocity
            .min((8.0 * self.junction_deviation * self.max_accel).sqrt())
    }

    /// SET_VELOCITY_LIMIT handler. Returns the response message.
    pub fn set_velocity_limit(&mut self, params: &CommandParams) -> Result<String, CommandError> {
        let max_velocity =
            params.get_float("velocity", self.max_velocity, Some(0.0), None, None)?;
        let max_accel = params.get_float("accel", self.max_accel, Some(0.0), None, None)?;
        self.max_jerk = params.get_float("jerk", self.max_jerk, Some(0.0), None, None)?;
        let square_corner_velocity = params.get_float(
            "square_corner_velocity",
            self.square_corner_velocity,
            None,
            Some(0.0),
            None,
        )?;
        self.requested_accel_to_decel = params.get_float(
            "accel_to_decel",
            self.requested_accel_to_decel,
            Some(0.0),
            None,
            None,
        )?;
        let accel_order = params.get_int("accel_order", self.accel_order as i64, None, None)?;
        if !matches!(accel_order, 2 | 4 | 6) {
            return Err(CommandError::InvalidChoice(format!(
                "ACCEL_ORDER = {}",
                accel_order
            )));
        }
        self.accel_order = accel_order as u8;
        self.accel_compensation = params.get_float(
            "accel_compensation",
            self.accel_compensation,
            None,
            Some(0.0),
            Some(MAX_ACCEL_COMPENSATION),
        )?;
        self.max_velocity = max_velocity.min(self.config_max_velocity);
        self.max_accel = max_accel.min(self.config_max_accel);
        self.square_corner_velocity =
            square_corner_velocity.min(self.config_square_corner_velocity);
        self.calc_junction_deviation();
        let msg = format!(
            "max_velocity: {:.6} max_accel: {:.6} max_accel_to_decel: {:.6}\n\
             max_jerk: {:.6} accel_order: {} square_corner_velocity: {:.6}\n\
             accel_compensation: {:.8}",
            self.max_velocity,
            self.max_accel,
            self.max_accel_to_decel,
            self.max_jerk,
            self.accel_order,
            self.square_corner_velocity,
            self.accel_compensation
        );
        log::info!("{}", msg);
        Ok(msg)
    }

    /// M204 handler: `S` sets accel directly, else `min(P, T)`.
    pub fn set_accel_m204(&mut self, params: &CommandParams) -> Result<(), CommandError> {
        let accel = if params.contains("s") {
            params.get_float("s", 0.0, Some(0.0), None, None)?
        } else if params.contains("p") && params.contains("t") {
            let p = params.get_float("p", 0.0, Some(0.0), None, None)?;
            let t = params.get_float("t", 0.0, Some(0.0), None, None)?;
            p.min(t)
        } else {
            return Err(CommandError::MissingParameter("S"));
        };
        self.max_accel = accel.min(self.config_max_accel);
        self.calc_junction_deviation();
        Ok(())
    }

    /// SET_SCURVE handler. Returns the response message.
    pub fn set_scurve(&mut self, params: &CommandParams) -> Result<String, CommandError> {
        let accel_order = params.get_int("accel_order", self.accel_order as i64, None, None)?;
        if !matches!(accel_order, 2 | 4 | 6) {
            return Err(CommandError::InvalidChoice(format!(
                "ACCEL_ORDER = {}",
                accel_order
            )));
        }
        self.accel_order = accel_order as u8;
        self.max_jerk = params.get_float("jerk", self.max_jerk, Some(0.0), None, None)?;
        let msg = format!(
            "accel_order: {} max_jerk: {:.6}",
            self.accel_order, self.max_jerk
        );
        log::info!("{}", msg);
        Ok(msg)
    }
}

/// Default jerk limit derived from the acceleration limit; with a
/// nonzero minimum jerk limit time the default keeps the jerk phase at
/// least that long.
pub fn max_jerk_default(max_accel: f64, min_jerk_limit_time: f64) -> f64 {
    if min_jerk_limit_time > 0.0 {
        max_accel * 6.0 / (min_jerk_limit_time * RINGING_REDUCTION_FACTOR)
    } else {
        max_accel * 30.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ToolheadLimits {
        LimitsConfig {
            max_velocity: 300.0,
            max_accel: 3000.0,
            square_corner_velocity: 5.0,
            ..LimitsConfig::default()
        }
        .build()
        .unwrap()
    }

    #[test]
    fn junction_deviation_from_square_corner_velocity() {
        let limits = limits();
        let expected = 25.0 * (2f64.sqrt() - 1.0) / 3000.0;
        assert!((limits.junction_deviation - expected).abs() < 1e-12);
        assert_eq!(limits.max_accel_to_decel, 1500.0);
        assert_eq!(limits.max_jerk, 3000.0 * 30.0);
    }

    #[test]
    fn jerk_default_with_min_jerk_limit_time() {
        assert_eq!(max_jerk_default(3000.0, 0.02), 3000.0 * 6.0 / 0.2);
    }

    #[test]
    fn velocity_limit_clamps_to_config_maxima() {
        let mut limits = limits();
        let params = CommandParams::from_pairs(vec![("velocity", "500"), ("accel", "9000")]);
        limits.set_velocity_limit(&params).unwrap();
        assert_eq!(limits.max_velocity, 300.0);
        assert_eq!(limits.max_accel, 3000.0);
    }

    #[test]
    fn velocity_limit_rejects_bad_accel_order() {
        let mut limits = limits();
        let params = CommandParams::from_pairs(vec![("accel_order", "3")]);
        assert!(matches!(
            limits.set_velocity_limit(&params),
            Err(CommandError::InvalidChoice(_))
        ));
    }

    #[test]
    fn m204_takes_min_of_p_and_t() {
        let mut limits = limits();
        let params = CommandParams::from_pairs(vec![("p", "1200"), ("t", "800")]);
        limits.set_accel_m204(&params).unwrap();
        assert_eq!(limits.max_accel, 800.0);
        assert!(matches!(
            limits.set_accel_m204(&CommandParams::new()),
            Err(CommandError::MissingParameter("S"))
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: LimitsConfig = serde_json::from_str(
            r#"{"max_velocity": 250.0, "max_accel": 4000.0, "acceleration_order": 4}"#,
        )
        .unwrap();
        let limits = config.build().unwrap();
        assert_eq!(limits.max_velocity, 250.0);
        assert_eq!(limits.accel_order, 4);
        assert_eq!(limits.max_accel_to_decel, 2000.0);
        assert_eq!(limits.square_corner_velocity, 5.0);
    }

    #[test]
    fn config_validation() {
        let bad = LimitsConfig {
            max_velocity: 0.0,
            ..LimitsConfig::default()
        };
        assert!(bad.build().is_err());
        let bad = LimitsConfig {
            acceleration_order: 3,
            ..LimitsConfig::default()
        };
        assert!(matches!(
            bad.build(),
            Err(ConfigError::InvalidAccelOrder(3))
        ));
    }
}
