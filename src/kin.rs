use std::cell::RefCell;
use std::rc::Rc;

use glam::{DVec3, DVec4, Vec4Swizzles};

use crate::errors::CommandError;
use crate::moves::Move;
use crate::profile::AccelDecel;
use crate::stepgen::{CartesianKernel, Stepper, StepperRef};
use crate::trapq::TrapQueue;

/// Per-kinematic forward map and range checking. Implementations own
/// the stepper objects; everything else holds lookup references.
pub trait Kinematics {
    /// Validate (and possibly slow down) a move before it enters the
    /// look-ahead queue.
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError>;
    fn get_steppers(&self) -> Vec<StepperRef>;
    fn set_position(&mut self, newpos: DVec4, homing_axes: &[usize]);
    /// Toolhead coordinate derived from the steppers' tag positions.
    fn calc_tag_position(&self) -> DVec3;
}

/// Cartesian XYZ kinematics with per-axis range limits and the usual
/// slower Z axis.
pub struct CartesianKinematics {
    steppers: Vec<StepperRef>,
    axes_min: DVec3,
    axes_max: DVec3,
    max_z_velocity: f64,
    max_z_accel: f64,
    homed: [bool; 3],
}

impl CartesianKinematics {
    pub fn new(
        trapq: Rc<RefCell<TrapQueue>>,
        step_dist: f64,
        axes_min: DVec3,
        axes_max: DVec3,
        max_z_velocity: f64,
        max_z_accel: f64,
    ) -> CartesianKinematics {
        let steppers = ["stepper_x", "stepper_y", "stepper_z"]
            .iter()
            .enumerate()
            .map(|(axis, name)| {
                Rc::new(RefCell::new(Stepper::new(
                    name,
                    step_dist,
                    Box::new(CartesianKernel::new(axis)),
                    trapq.clone(),
                )))
            })
            .collect();
        CartesianKinematics {
            steppers,
            axes_min,
            axes_max,
            max_z_velocity,
            max_z_accel,
            homed: [false; 3],
        }
    }

    pub fn stepper(&self, axis: usize) -> StepperRef {
        self.steppers[axis].clone()
    }

    fn check_endstops(&self, m: &Move) -> Result<(), CommandError> {
        let end = m.end_pos;
        for axis in 0..3 {
            if m.axes_d[axis] == 0.0 {
                continue;
            }
            if end[axis] < self.axes_min[axis] || end[axis] > self.axes_max[axis] {
                if !self.homed[axis] {
                    return Err(CommandError::MustHomeFirst(end));
                }
                return Err(CommandError::MoveOutOfRange(end));
            }
        }
        Ok(())
    }
}

impl Kinematics for CartesianKinematics {
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError> {
        self.check_endstops(m)?;
        if m.axes_d.z != 0.0 {
            // Moves with a Z component are limited by the Z axis caps,
            // scaled by the axis ratio.
            let z_ratio = m.move_d / m.axes_d.z.abs();
            m.limit_speed(self.max_z_velocity * z_ratio, self.max_z_accel * z_ratio, None);
        }
        Ok(())
    }

    fn get_steppers(&self) -> Vec<StepperRef> {
        self.steppers.clone()
    }

    fn set_position(&mut self, newpos: DVec4, homing_axes: &[usize]) {
        for s in self.steppers.iter() {
            s.borrow_mut().set_position_coord(newpos.xyz());
        }
        for &axis in homing_axes {
            if axis < 3 {
                self.homed[axis] = true;
            }
        }
    }

    fn calc_tag_position(&self) -> DVec3 {
        DVec3::new(
            self.steppers[0].borrow().get_tag_position(),
            self.steppers[1].borrow().get_tag_position(),
            self.steppers[2].borrow().get_tag_position(),
        )
    }
}

/// The slice of the extruder the planner core talks to.
pub trait Extruder {
    /// Advisory junction cap between two moves, in velocity squared.
    fn calc_junction(&self, prev_move: &Move, m: &Move) -> f64;
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError>;
    /// Hand an extruding move's finalized profile to the extruder's
    /// own motion queue.
    fn process_move(&mut self, print_time: f64, m: &Move, profile: &AccelDecel);
    /// Release extruder motion up to `free_time`.
    fn update_move_time(&mut self, _free_time: f64) {}
    fn name(&self) -> &str {
        "extruder"
    }
}

/// Stand-in extruder: enforces the instant corner velocity advisory
/// and tracks dispatched motion, but drives no hardware.
pub struct DummyExtruder {
    instant_corner_velocity: f64,
    max_e_velocity: f64,
    max_e_accel: f64,
    last_move_time: f64,
}

impl DummyExtruder {
    pub fn new(instant_corner_velocity: f64) -> DummyExtruder {
        DummyExtruder {
            instant_corner_velocity,
            max_e_velocity: f64::MAX,
            max_e_accel: f64::MAX,
            last_move_time: 0.0,
        }
    }

    pub fn with_limits(mut self, max_e_velocity: f64, max_e_accel: f64) -> DummyExtruder {
        self.max_e_velocity = max_e_velocity;
        self.max_e_accel = max_e_accel;
        self
    }

    pub fn last_move_time(&self) -> f64 {
        self.last_move_time
    }
}

impl Extruder for DummyExtruder {
    fn calc_junction(&self, prev_move: &Move, m: &Move) -> f64 {
        let diff_r = (m.axes_r.w - prev_move.axes_r.w).abs();
        if diff_r > 0.0 {
            let v = self.instant_corner_velocity / diff_r;
            v * v
        } else {
            m.max_cruise_v2
        }
    }

    fn check_move(&self, m: &mut Move) -> Result<(), CommandError> {
        if !m.is_kinematic_move && m.move_d > 0.0 {
            // Extrude-only move: the extruder caps are the only limits.
            let inv_extrude_r = 1.0 / m.axes_r.w.abs();
            m.limit_speed(
                self.max_e_velocity * inv_extrude_r,
                self.max_e_accel * inv_extrude_r,
                None,
            );
        }
        Ok(())
    }

    fn process_move(&mut self, print_time: f64, _m: &Move, profile: &AccelDecel) {
        self.last_move_time = print_time + profile.total_time();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitsConfig;

    fn limits() -> crate::limits::ToolheadLimits {
        LimitsConfig {
            max_velocity: 300.0,
            max_accel: 3000.0,
            ..LimitsConfig::default()
        }
        .build()
        .unwrap()
    }

    fn kin() -> CartesianKinematics {
        CartesianKinematics::new(
            Rc::new(RefCell::new(TrapQueue::new())),
            0.01,
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(200.0, 200.0, 180.0),
            5.0,
            100.0,
        )
    }

    #[test]
    fn unhomed_moves_are_rejected() {
        let limits = limits();
        let kin = kin();
        let mut m = Move::new(
            &limits,
            DVec4::ZERO,
            DVec4::new(250.0, 0.0, 0.0, 0.0),
            100.0,
        );
        assert!(matches!(
            kin.check_move(&mut m),
            Err(CommandError::MustHomeFirst(_))
        ));
    }

    #[test]
    fn out_of_range_after_homing() {
        let limits = limits();
        let mut kin = kin();
        kin.set_position(DVec4::new(100.0, 100.0, 0.0, 0.0), &[0, 1, 2]);
        let mut m = Move::new(
            &limits,
            DVec4::new(100.0, 100.0, 0.0, 0.0),
            DVec4::new(250.0, 100.0, 0.0, 0.0),
            100.0,
        );
        assert!(matches!(
            kin.check_move(&mut m),
            Err(CommandError::MoveOutOfRange(_))
        ));
    }

    #[test]
    fn z_moves_are_slowed_by_axis_ratio() {
        let limits = limits();
        let mut kin = kin();
        kin.set_position(DVec4::ZERO, &[0, 1, 2]);
        let mut m = Move::new(
            &limits,
            DVec4::ZERO,
            DVec4::new(0.0, 0.0, 10.0, 0.0),
            100.0,
        );
        kin.check_move(&mut m).unwrap();
        assert_eq!(m.velocity, 5.0);
        assert_eq!(m.accel, 100.0);
    }

    #[test]
    fn extruder_junction_advisory() {
        let limits = limits();
        let e = DummyExtruder::new(1.0);
        let prev = Move::new(&limits, DVec4::ZERO, DVec4::new(10.0, 0.0, 0.0, 1.0), 100.0);
        let m = Move::new(
            &limits,
            DVec4::new(10.0, 0.0, 0.0, 1.0),
            DVec4::new(20.0, 0.0, 0.0, 1.5),
            100.0,
        );
        let v2 = e.calc_junction(&prev, &m);
        let diff_r = (m.axes_r.w - prev.axes_r.w).abs();
        assert!((v2 - (1.0 / diff_r).powi(2)).abs() < 1e-9);
        // Equal extrude ratios impose no extra cap.
        let m2 = Move::new(
            &limits,
            DVec4::new(10.0, 0.0, 0.0, 1.0),
            DVec4::new(20.0, 0.0, 0.0, 2.0),
            100.0,
        );
        assert_eq!(e.calc_junction(&prev, &m2), m2.max_cruise_v2);
    }
}
