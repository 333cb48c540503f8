use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec3;

use crate::trapq::TrapQueue;

/// Maps the commanded toolhead trajectory to one stepper's scalar
/// coordinate. Kernels are swappable at runtime: shaping front-ends
/// wrap the original kernel and read the trajectory over a window of
/// nearby times instead of a single instant.
pub trait StepperKernel {
    fn calc_position_from_coord(&self, coord: DVec3) -> f64;

    fn calc_position(&self, trapq: &TrapQueue, time: f64) -> f64 {
        self.calc_position_from_coord(trapq.position(time))
    }
}

/// Plain cartesian axis kernel.
pub struct CartesianKernel {
    axis: usize,
}

impl CartesianKernel {
    pub fn new(axis: usize) -> CartesianKernel {
        CartesianKernel { axis }
    }
}

impl StepperKernel for CartesianKernel {
    fn calc_position_from_coord(&self, coord: DVec3) -> f64 {
        coord[self.axis]
    }
}

/// Anything the toolhead flushes to a time barrier during
/// `_update_move_time`.
pub trait StepGenerator {
    fn generate_steps(&mut self, flush_time: f64);
}

/// One stepper motor: owns its kinematics kernel slot and tracks the
/// commanded, tag and MCU positions. The actual pulse timing solver is
/// a downstream consumer; here steps are accounted as the rounded
/// kernel position.
pub struct Stepper {
    name: String,
    step_dist: f64,
    kernel: Box<dyn StepperKernel>,
    trapq: Rc<RefCell<TrapQueue>>,
    commanded_pos: f64,
    tag_pos: f64,
    /// commanded_pos minus the MCU's step counter times step_dist.
    mcu_position_offset: f64,
    last_flush_time: f64,
}

impl Stepper {
    pub fn new(
        name: &str,
        step_dist: f64,
        kernel: Box<dyn StepperKernel>,
        trapq: Rc<RefCell<TrapQueue>>,
    ) -> Stepper {
        Stepper {
            name: name.into(),
            step_dist,
            kernel,
            trapq,
            commanded_pos: 0.0,
            tag_pos: 0.0,
            mcu_position_offset: 0.0,
            last_flush_time: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_step_dist(&self) -> f64 {
        self.step_dist
    }

    /// Swap in a new kinematics kernel, returning the previous one so
    /// wrapping front-ends can delegate to it (and restore it if the
    /// wrap fails).
    pub fn set_stepper_kinematics(&mut self, kernel: Box<dyn StepperKernel>) -> Box<dyn StepperKernel> {
        std::mem::replace(&mut self.kernel, kernel)
    }

    pub fn set_trapq(&mut self, trapq: Rc<RefCell<TrapQueue>>) -> Rc<RefCell<TrapQueue>> {
        std::mem::replace(&mut self.trapq, trapq)
    }

    pub fn get_commanded_position(&self) -> f64 {
        self.commanded_pos
    }

    /// MCU-side step counter; unaffected by position redefinitions.
    pub fn get_mcu_position(&self) -> i64 {
        ((self.commanded_pos - self.mcu_position_offset) / self.step_dist).round() as i64
    }

    pub fn set_tag_position(&mut self, pos: f64) {
        self.tag_pos = pos;
    }

    pub fn get_tag_position(&self) -> f64 {
        self.tag_pos
    }

    /// Redefine the commanded position without emitting steps.
    pub fn set_commanded_position(&mut self, pos: f64) {
        self.mcu_position_offset += pos - self.commanded_pos;
        self.commanded_pos = pos;
    }

    /// Redefine the commanded position from a toolhead coordinate.
    pub fn set_position_coord(&mut self, coord: DVec3) {
        let pos = self.kernel.calc_position_from_coord(coord);
        self.set_commanded_position(pos);
    }

    pub fn calc_position_from_coord(&self, coord: DVec3) -> f64 {
        self.kernel.calc_position_from_coord(coord)
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush_time
    }
}

impl StepGenerator for Stepper {
    fn generate_steps(&mut self, flush_time: f64) {
        if flush_time <= self.last_flush_time {
            return;
        }
        let trapq = self.trapq.borrow();
        if !trapq.is_empty() {
            self.commanded_pos = self.kernel.calc_position(&trapq, flush_time);
        }
        self.last_flush_time = flush_time;
    }
}

pub type StepperRef = Rc<RefCell<Stepper>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitsConfig;
    use crate::moves::Move;
    use crate::profile::AccelDecel;
    use glam::DVec4;

    fn stepper_with_move() -> (StepperRef, f64) {
        let limits = LimitsConfig {
            max_velocity: 100.0,
            max_accel: 2000.0,
            ..LimitsConfig::default()
        }
        .build()
        .unwrap();
        let trapq = Rc::new(RefCell::new(TrapQueue::new()));
        let m = Move::new(
            &limits,
            DVec4::ZERO,
            DVec4::new(10.0, 0.0, 0.0, 0.0),
            100.0,
        );
        let profile = AccelDecel::trapezoid(0.0, 10000.0, 0.0, 2000.0, 10.0);
        trapq.borrow_mut().append(0.0, &m, &profile);
        let total = profile.total_time();
        let s = Rc::new(RefCell::new(Stepper::new(
            "stepper_x",
            0.01,
            Box::new(CartesianKernel::new(0)),
            trapq,
        )));
        (s, total)
    }

    #[test]
    fn steps_accumulate_with_flushes() {
        let (s, total) = stepper_with_move();
        s.borrow_mut().generate_steps(total * 0.5);
        let mid_pos = s.borrow().get_commanded_position();
        assert!(mid_pos > 0.0 && mid_pos < 10.0);
        s.borrow_mut().generate_steps(total);
        assert!((s.borrow().get_commanded_position() - 10.0).abs() < 1e-6);
        assert_eq!(s.borrow().get_mcu_position(), 1000);
        // Flushing backwards is a no-op.
        s.borrow_mut().generate_steps(total * 0.5);
        assert!((s.borrow().get_commanded_position() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn set_position_preserves_mcu_counter() {
        let (s, total) = stepper_with_move();
        s.borrow_mut().generate_steps(total);
        let mcu = s.borrow().get_mcu_position();
        s.borrow_mut().set_commanded_position(0.0);
        assert_eq!(s.borrow().get_mcu_position(), mcu);
        assert_eq!(s.borrow().get_commanded_position(), 0.0);
    }

    #[test]
    fn kernel_swap_returns_the_original() {
        let (s, _) = stepper_with_move();
        let orig = s
            .borrow_mut()
            .set_stepper_kinematics(Box::new(CartesianKernel::new(1)));
        assert_eq!(orig.calc_position_from_coord(DVec3::new(3.0, 4.0, 5.0)), 3.0);
        assert_eq!(
            s.borrow().calc_position_from_coord(DVec3::new(3.0, 4.0, 5.0)),
            4.0
        );
    }
}
