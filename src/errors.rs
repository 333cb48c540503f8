use glam::DVec4;
use thiserror::Error;

/// User-visible errors, reported back over the command channel. The
/// toolhead stays usable after any of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Move out of range: {:.3} {:.3} {:.3} [{:.3}]", .0.x, .0.y, .0.z, .0.w)]
    MoveOutOfRange(DVec4),
    #[error("Must home axis first: {:.3} {:.3} {:.3} [{:.3}]", .0.x, .0.y, .0.z, .0.w)]
    MustHomeFirst(DVec4),
    #[error("Parameter {0} must be specified")]
    MissingParameter(&'static str),
    #[error("Unable to parse {name} = '{value}'")]
    InvalidParameter { name: &'static str, value: String },
    #[error("Parameter {name} = {value} out of range")]
    ParameterOutOfRange { name: &'static str, value: f64 },
    #[error("{0} is not a valid choice")]
    InvalidChoice(String),
    #[error(transparent)]
    Endstop(#[from] EndstopError),
    #[error("Printer is shutdown: {0}")]
    Shutdown(String),
    #[error("{0}")]
    Other(String),
}

/// Errors raised while validating the toolhead configuration; these
/// abort startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Option '{option}' must be above {limit}")]
    BelowMinimum { option: &'static str, limit: f64 },
    #[error("Option '{option}' must be at most {limit}")]
    AboveMaximum { option: &'static str, limit: f64 },
    #[error("acceleration_order = {0} is not a valid choice (must be 2, 4 or 6)")]
    InvalidAccelOrder(u8),
    #[error("Choice '{value}' for option '{option}' is not valid")]
    InvalidChoice {
        option: &'static str,
        value: String,
    },
}

/// Endstop coordination failures during homing and probing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndstopError {
    #[error("Failed to home {0}: timeout during homing move")]
    TriggerTimeout(String),
    #[error("Endstop {0} still triggered after retract")]
    StillTriggered(String),
    #[error("Probe triggered prior to movement")]
    ProbeWithoutMovement,
    #[error("Error during homing move: {0}")]
    HomingMoveFailed(String),
}

/// Internal look-ahead planner invariant violations. These are fatal:
/// the toolhead invokes shutdown and clears the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Internal error in look-ahead planner: negative flush count")]
    NegativeFlushCount,
    #[error(
        "Internal error in look-ahead planner: accel_d {accel_d:.6} + decel_d {decel_d:.6} \
         exceeds move_d {move_d:.6}"
    )]
    DistanceOverrun {
        accel_d: f64,
        decel_d: f64,
        move_d: f64,
    },
    #[error("Internal error in look-ahead planner: negative cruise time {0:.9}")]
    NegativeCruiseTime(f64),
    #[error(
        "Internal error in look-ahead planner: velocity jump {jump:.6} between adjacent moves"
    )]
    VelocityDiscontinuity { jump: f64 },
}

impl From<PlannerError> for CommandError {
    fn from(e: PlannerError) -> CommandError {
        CommandError::Shutdown(e.to_string())
    }
}
