use std::cell::{Cell, RefCell};
use std::rc::Rc;

use glam::{DVec4, Vec4Swizzles};

use crate::errors::{CommandError, EndstopError};
use crate::events::PrinterEvent;
use crate::reactor::Completion;
use crate::stepgen::StepperRef;
use crate::toolhead::Toolhead;

pub const HOMING_START_DELAY: f64 = 0.001;
pub const ENDSTOP_SAMPLE_TIME: f64 = 0.000015;
pub const ENDSTOP_SAMPLE_COUNT: u32 = 4;

/// Counts outstanding endstops of a homing move; when the last one
/// triggers, the drip move is released.
#[derive(Clone)]
pub struct TriggerNotify {
    remaining: Rc<Cell<usize>>,
    drip_completion: Completion,
}

impl TriggerNotify {
    pub fn new(endstop_count: usize, drip_completion: Completion) -> TriggerNotify {
        TriggerNotify {
            remaining: Rc::new(Cell::new(endstop_count)),
            drip_completion,
        }
    }

    pub fn notify(&self) {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            self.drip_completion.complete(true);
        }
    }
}

/// An MCU endstop able to coordinate a homing move.
pub trait Endstop {
    fn name(&self) -> String;
    fn steppers(&self) -> Vec<StepperRef>;
    /// Arm trigger detection. `rest_time` paces the MCU-side sampling
    /// between steps; `notify` must be called once on trigger.
    fn home_start(
        &mut self,
        print_time: f64,
        sample_time: f64,
        sample_count: u32,
        rest_time: f64,
        notify: TriggerNotify,
    );
    /// Wait for the trigger; `home_end_time` is the timeout horizon.
    /// Returns the trigger time.
    fn home_wait(&mut self, home_end_time: f64) -> Result<f64, EndstopError>;
}

pub type EndstopRef = Rc<RefCell<dyn Endstop>>;

#[derive(Debug, Clone, Copy)]
pub struct HomingInfo {
    pub speed: f64,
    pub second_homing_speed: f64,
    pub retract_speed: f64,
    pub retract_dist: f64,
}

/// One homed rail: its endstops plus the configured homing behavior.
pub struct HomingRail {
    pub name: String,
    pub endstops: Vec<EndstopRef>,
    pub homing_info: HomingInfo,
}

/// Fill unset entries of a target coordinate with the current
/// commanded position.
pub fn fill_coord(toolhead: &Toolhead, coord: [Option<f64>; 4]) -> DVec4 {
    let cur = toolhead.get_position();
    DVec4::new(
        coord[0].unwrap_or(cur.x),
        coord[1].unwrap_or(cur.y),
        coord[2].unwrap_or(cur.z),
        coord[3].unwrap_or(cur.w),
    )
}

/// State tracking for one homing session.
pub struct Homing {
    changed_axes: Vec<usize>,
    verify_retract: bool,
}

impl Homing {
    pub fn new() -> Homing {
        Homing {
            changed_axes: Vec::new(),
            verify_retract: true,
        }
    }

    pub fn set_no_verify_retract(&mut self) {
        self.verify_retract = false;
    }

    pub fn set_axes(&mut self, axes: Vec<usize>) {
        self.changed_axes = axes;
    }

    pub fn get_axes(&self) -> &[usize] {
        &self.changed_axes
    }

    pub fn set_homed_position(&mut self, toolhead: &mut Toolhead, pos: [Option<f64>; 4]) {
        let filled = fill_coord(toolhead, pos);
        toolhead.set_position(filled, &[]);
    }

    /// MCU sampling rest time for an endstop: the time per step of the
    /// fastest stepper involved.
    fn calc_endstop_rate(
        &self,
        toolhead: &Toolhead,
        endstop: &EndstopRef,
        movepos: DVec4,
        speed: f64,
    ) -> f64 {
        let startpos = toolhead.get_position();
        let move_d = (movepos.xyz() - startpos.xyz()).length();
        let move_t = move_d / speed;
        let max_steps = endstop
            .borrow()
            .steppers()
            .iter()
            .map(|s| {
                let s = s.borrow();
                let delta = s.calc_position_from_coord(startpos.xyz())
                    - s.calc_position_from_coord(movepos.xyz());
                (delta.abs() / s.get_step_dist()).round()
            })
            .fold(0.0, f64::max);
        if max_steps <= 0.0 {
            return move_t;
        }
        move_t / max_steps
    }

    /// Drive an endstop-coordinated move through the toolhead's drip
    /// path. With `probe_pos` the halt position is taken from the
    /// observed MCU step counts instead of the target.
    pub fn homing_move(
        &mut self,
        toolhead: &mut Toolhead,
        movepos: DVec4,
        endstops: &[EndstopRef],
        speed: f64,
        probe_pos: bool,
        verify_movement: bool,
    ) -> Result<(), CommandError> {
        let events = toolhead.events();
        let endstop_names: Vec<String> = endstops.iter().map(|es| es.borrow().name()).collect();
        events.send(&PrinterEvent::HomingMoveBegin(endstop_names.clone()));
        // Note the start location.
        toolhead.flush_step_generation();
        for s in toolhead.kin().get_steppers() {
            let pos = s.borrow().get_commanded_position();
            s.borrow_mut().set_tag_position(pos);
        }
        let start_mcu_pos: Vec<(StepperRef, String, i64)> = endstops
            .iter()
            .flat_map(|es| {
                let name = es.borrow().name();
                es.borrow()
                    .steppers()
                    .into_iter()
                    .map(move |s| {
                        let mcu_pos = s.borrow().get_mcu_position();
                        (s, name.clone(), mcu_pos)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        // Start endstop checking.
        let print_time = toolhead.get_last_move_time();
        let drip_completion = Completion::new();
        let notify = TriggerNotify::new(endstops.len(), drip_completion.clone());
        for es in endstops {
            let rest_time = self.calc_endstop_rate(toolhead, es, movepos, speed);
            es.borrow_mut().home_start(
                print_time,
                ENDSTOP_SAMPLE_TIME,
                ENDSTOP_SAMPLE_COUNT,
                rest_time,
                notify.clone(),
            );
        }
        toolhead.dwell(HOMING_START_DELAY);
        // Issue the move.
        let mut error: Option<CommandError> = None;
        if let Err(e) = toolhead.drip_move(movepos, speed, drip_completion) {
            error = Some(CommandError::Endstop(EndstopError::HomingMoveFailed(
                e.to_string(),
            )));
        }
        // Wait for the endstops to trigger.
        let move_end_print_time = toolhead.get_last_move_time();
        for es in endstops {
            if let Err(e) = es.borrow_mut().home_wait(move_end_print_time) {
                if error.is_none() {
                    error = Some(CommandError::Endstop(e));
                }
            }
        }
        // Determine the stepper halt positions.
        toolhead.flush_step_generation();
        let end_mcu_pos: Vec<(StepperRef, String, i64, i64)> = start_mcu_pos
            .into_iter()
            .map(|(s, name, spos)| {
                let epos = s.borrow().get_mcu_position();
                (s, name, spos, epos)
            })
            .collect();
        if probe_pos {
            for (s, _, spos, epos) in end_mcu_pos.iter() {
                let md = (epos - spos) as f64 * s.borrow().get_step_dist();
                let tag = s.borrow().get_tag_position();
                s.borrow_mut().set_tag_position(tag + md);
            }
            let tag = toolhead.kin().calc_tag_position();
            self.set_homed_position(
                toolhead,
                [Some(tag.x), Some(tag.y), Some(tag.z), None],
            );
        } else {
            toolhead.set_position(movepos, &[]);
        }
        // Signal the homing/probing move complete.
        events.send(&PrinterEvent::HomingMoveEnd(endstop_names));
        if let Some(error) = error {
            return Err(error);
        }
        // Check that some movement occurred.
        if verify_movement {
            for (_, name, spos, epos) in end_mcu_pos.iter() {
                if spos == epos {
                    if probe_pos {
                        return Err(EndstopError::ProbeWithoutMovement.into());
                    }
                    return Err(EndstopError::StillTriggered(name.clone()).into());
                }
            }
        }
        Ok(())
    }

    /// Home a set of rails: force-set the start position, run the
    /// homing move, then optionally retract and re-home slowly.
    pub fn home_rails(
        &mut self,
        toolhead: &mut Toolhead,
        rails: &[HomingRail],
        forcepos: [Option<f64>; 4],
        movepos: [Option<f64>; 4],
    ) -> Result<(), CommandError> {
        let events = toolhead.events();
        let rail_names: Vec<String> = rails.iter().map(|r| r.name.clone()).collect();
        events.send(&PrinterEvent::HomeRailsBegin(rail_names.clone()));
        // Alter the kinematics to think the printer is at forcepos.
        let homing_axes: Vec<usize> = (0..3).filter(|&axis| forcepos[axis].is_some()).collect();
        let forcepos = fill_coord(toolhead, forcepos);
        let mut movepos = fill_coord(toolhead, movepos);
        toolhead.set_position(forcepos, &homing_axes);
        // Perform the first home.
        let endstops: Vec<EndstopRef> = rails
            .iter()
            .flat_map(|r| r.endstops.iter().cloned())
            .collect();
        let hi = rails[0].homing_info;
        self.homing_move(toolhead, movepos, &endstops, hi.speed, false, false)?;
        // Perform the second home.
        if hi.retract_dist > 0.0 {
            // Retract.
            let axes_d = movepos - forcepos;
            let move_d = axes_d.xyz().length();
            let retract_r = (hi.retract_dist / move_d).min(1.0);
            let retractpos = movepos - axes_d * retract_r;
            toolhead.move_to(retractpos, hi.retract_speed)?;
            // Home again.
            let second_forcepos = retractpos - axes_d * retract_r;
            toolhead.set_position(second_forcepos, &[]);
            self.homing_move(
                toolhead,
                movepos,
                &endstops,
                hi.second_homing_speed,
                false,
                self.verify_retract,
            )?;
        }
        // Signal the home operation complete.
        toolhead.flush_step_generation();
        for s in toolhead.kin().get_steppers() {
            let pos = s.borrow().get_commanded_position();
            s.borrow_mut().set_tag_position(pos);
        }
        events.send(&PrinterEvent::HomeRailsEnd(rail_names));
        // Event handlers may adjust the stepper tag positions to apply
        // homing offsets; re-seat the commanded position if they did.
        let adjustpos = toolhead.kin().calc_tag_position();
        let mut adjusted = false;
        for &axis in homing_axes.iter() {
            if (adjustpos[axis] - movepos[axis]).abs() > 1e-9 {
                movepos[axis] = adjustpos[axis];
                adjusted = true;
            }
        }
        if adjusted {
            toolhead.set_position(movepos, &[]);
        }
        Ok(())
    }

    /// Home the given axes, turning the motors off on failure.
    pub fn home_axes(
        &mut self,
        toolhead: &mut Toolhead,
        rails: &[HomingRail],
        axes: Vec<usize>,
        forcepos: [Option<f64>; 4],
        movepos: [Option<f64>; 4],
    ) -> Result<(), CommandError> {
        self.changed_axes = axes;
        match self.home_rails(toolhead, rails, forcepos, movepos) {
            Ok(()) => Ok(()),
            Err(e) => {
                let time = toolhead.get_last_move_time();
                toolhead.events().send(&PrinterEvent::MotorOff(time));
                Err(e)
            }
        }
    }
}

impl Default for Homing {
    fn default() -> Self {
        Homing::new()
    }
}
