use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec4;
use serde::{Deserialize, Serialize};

use crate::errors::{CommandError, ConfigError, PlannerError};
use crate::events::{EventBus, PrinterEvent};
use crate::kin::{Extruder, Kinematics};
use crate::limits::{LimitsConfig, ToolheadLimits};
use crate::lookahead::{MoveQueue, PlannedMove};
use crate::mcu::Mcu;
use crate::moves::{JunctionPolicy, Move};
use crate::params::CommandParams;
use crate::reactor::{Completion, Reactor, NEVER, NOW};
use crate::stepgen::StepGenerator;
use crate::trapq::TrapQueue;

pub const MIN_KIN_TIME: f64 = 0.100;
pub const MOVE_BATCH_TIME: f64 = 0.500;
pub const DRIP_SEGMENT_TIME: f64 = 0.050;
pub const DRIP_TIME: f64 = 0.100;

/// How the print-time clock is advanced while the look-ahead buffer
/// drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingState {
    /// Moves are streaming; print time tracks the dispatched motion.
    Main,
    /// Everything flushed; print time resyncs on the next move.
    Flushed,
    /// Flushed, with the periodic flush timer armed.
    Priming,
    /// Homing: motion is released one small segment at a time.
    Drip,
}

/// Early-return signal from the move-dispatch path; `DripEnded`
/// replaces the unwound exception of the drip mode design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    DripEnded,
}

/// Print-time buffering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolheadConfig {
    pub limits: LimitsConfig,
    pub buffer_time_low: f64,
    pub buffer_time_high: f64,
    pub buffer_time_start: f64,
    pub move_flush_time: f64,
}

impl Default for ToolheadConfig {
    fn default() -> Self {
        ToolheadConfig {
            limits: LimitsConfig::default(),
            buffer_time_low: 1.0,
            buffer_time_high: 2.0,
            buffer_time_start: 0.250,
            move_flush_time: 0.050,
        }
    }
}

impl ToolheadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_time_low <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "buffer_time_low",
                limit: 0.0,
            });
        }
        if self.buffer_time_high <= self.buffer_time_low {
            return Err(ConfigError::BelowMinimum {
                option: "buffer_time_high",
                limit: self.buffer_time_low,
            });
        }
        if self.buffer_time_start <= 0.0 || self.move_flush_time <= 0.0 {
            return Err(ConfigError::BelowMinimum {
                option: "buffer_time_start",
                limit: 0.0,
            });
        }
        Ok(())
    }
}

/// Status snapshot for the command channel.
#[derive(Debug, Clone, Serialize)]
pub struct ToolheadStatus {
    pub status: &'static str,
    pub print_time: f64,
    pub estimated_print_time: f64,
    pub extruder: String,
    pub position: [f64; 4],
    pub printing_time: f64,
}

/// Owner of the look-ahead queue, the trapezoid motion queue, the step
/// generators and the print-time clock.
pub struct Toolhead {
    reactor: Rc<dyn Reactor>,
    all_mcus: Vec<Rc<dyn Mcu>>,
    mcu: Rc<dyn Mcu>,
    events: EventBus,
    limits: ToolheadLimits,
    buffer_time_low: f64,
    buffer_time_high: f64,
    buffer_time_start: f64,
    move_flush_time: f64,
    kin: Box<dyn Kinematics>,
    extruder: Box<dyn Extruder>,
    junction_policy: JunctionPolicy,
    move_queue: MoveQueue,
    trapq: Rc<RefCell<TrapQueue>>,
    step_generators: Vec<Rc<RefCell<dyn StepGenerator>>>,
    commanded_pos: DVec4,
    can_pause: bool,
    print_time: f64,
    special_queuing_state: QueuingState,
    need_check_stall: f64,
    flush_timer_waketime: f64,
    last_print_start_time: f64,
    idle_flush_print_time: f64,
    print_stall: u32,
    drip_completion: Option<Completion>,
    kin_flush_delay: f64,
    kin_flush_times: Vec<f64>,
    last_kin_flush_time: f64,
    last_kin_move_time: f64,
    shutdown_reason: Option<String>,
}

impl Toolhead {
    /// Build a toolhead. The kinematics is constructed through
    /// `kin_builder` so it can share the trapezoid queue handle; its
    /// steppers are registered as step generators.
    pub fn new<F>(
        reactor: Rc<dyn Reactor>,
        all_mcus: Vec<Rc<dyn Mcu>>,
        extruder: Box<dyn Extruder>,
        config: &ToolheadConfig,
        kin_builder: F,
    ) -> Result<Toolhead, ConfigError>
    where
        F: FnOnce(Rc<RefCell<TrapQueue>>) -> Box<dyn Kinematics>,
    {
        config.validate()?;
        let limits = config.limits.build()?;
        let trapq = Rc::new(RefCell::new(TrapQueue::new()));
        let kin = kin_builder(trapq.clone());
        let mcu = all_mcus
            .first()
            .cloned()
            .ok_or(ConfigError::BelowMinimum {
                option: "mcus",
                limit: 1.0,
            })?;
        let can_pause = !mcu.is_fileoutput();
        let mut toolhead = Toolhead {
            reactor,
            all_mcus,
            mcu,
            events: EventBus::new(),
            limits,
            buffer_time_low: config.buffer_time_low,
            buffer_time_high: config.buffer_time_high,
            buffer_time_start: config.buffer_time_start,
            move_flush_time: config.move_flush_time,
            kin,
            extruder,
            junction_policy: JunctionPolicy::Default,
            move_queue: MoveQueue::new(),
            trapq,
            step_generators: Vec::new(),
            commanded_pos: DVec4::ZERO,
            can_pause,
            print_time: 0.0,
            special_queuing_state: QueuingState::Flushed,
            need_check_stall: -1.0,
            flush_timer_waketime: NEVER,
            last_print_start_time: 0.0,
            idle_flush_print_time: 0.0,
            print_stall: 0,
            drip_completion: None,
            kin_flush_delay: 0.0,
            kin_flush_times: Vec::new(),
            last_kin_flush_time: 0.0,
            last_kin_move_time: 0.0,
            shutdown_reason: None,
        };
        toolhead
            .move_queue
            .set_flush_time(toolhead.buffer_time_high);
        for s in toolhead.kin.get_steppers() {
            toolhead.step_generators.push(s);
        }
        Ok(toolhead)
    }

    // Accessors for collaborators.

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn limits(&self) -> &ToolheadLimits {
        &self.limits
    }

    pub fn kin(&self) -> &dyn Kinematics {
        self.kin.as_ref()
    }

    pub fn kin_mut(&mut self) -> &mut dyn Kinematics {
        self.kin.as_mut()
    }

    pub fn get_trapq(&self) -> Rc<RefCell<TrapQueue>> {
        self.trapq.clone()
    }

    pub fn get_extruder(&self) -> &dyn Extruder {
        self.extruder.as_ref()
    }

    pub fn set_extruder(&mut self, extruder: Box<dyn Extruder>, extrude_pos: f64) {
        self.extruder = extruder;
        self.commanded_pos.w = extrude_pos;
    }

    pub fn queuing_state(&self) -> QueuingState {
        self.special_queuing_state
    }

    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn print_stall_count(&self) -> u32 {
        self.print_stall
    }

    pub fn kin_flush_delay(&self) -> f64 {
        self.kin_flush_delay
    }

    pub fn set_junction_policy(&mut self, policy: JunctionPolicy) {
        self.junction_policy = policy;
    }

    pub fn junction_policy(&self) -> JunctionPolicy {
        self.junction_policy
    }

    pub fn register_step_generator(&mut self, sg: Rc<RefCell<dyn StepGenerator>>) {
        self.step_generators.push(sg);
    }

    pub fn get_max_velocity(&self) -> (f64, f64) {
        (self.limits.max_velocity, self.limits.max_accel)
    }

    pub fn drip_completion(&self) -> Option<Completion> {
        self.drip_completion.clone()
    }

    // Print time tracking.

    /// Advance the print-time clock in batches, keeping the layered
    /// flush ordering: step generators first, then the trapezoid queue
    /// reclaim, then the MCU flush barrier.
    fn update_move_time(&mut self, next_print_time: f64) {
        let kin_flush_delay = self.kin_flush_delay;
        let lkft = self.last_kin_flush_time;
        loop {
            self.print_time = (self.print_time + MOVE_BATCH_TIME).min(next_print_time);
            let sg_flush_time = lkft.max(self.print_time - kin_flush_delay);
            for sg in self.step_generators.iter() {
                sg.borrow_mut().generate_steps(sg_flush_time);
            }
            let free_time = lkft.max(sg_flush_time - kin_flush_delay);
            self.trapq.borrow_mut().free_moves(free_time);
            self.extruder.update_move_time(free_time);
            let mcu_flush_time = lkft.max(sg_flush_time - self.move_flush_time);
            for m in self.all_mcus.iter() {
                m.flush_moves(mcu_flush_time);
            }
            if self.print_time >= next_print_time {
                break;
            }
        }
    }

    fn calc_print_time(&mut self) {
        let curtime = self.reactor.monotonic();
        let est_print_time = self.mcu.estimated_print_time(curtime);
        let mut kin_time = (est_print_time + MIN_KIN_TIME).max(self.last_kin_flush_time);
        kin_time += self.kin_flush_delay;
        let min_print_time = (est_print_time + self.buffer_time_start).max(kin_time);
        if min_print_time > self.print_time {
            self.print_time = min_print_time;
            self.last_print_start_time = min_print_time;
            self.events.send(&PrinterEvent::SyncPrintTime {
                eventtime: curtime,
                est_print_time,
                print_time: self.print_time,
            });
        }
    }

    fn process_moves(&mut self, moves: Vec<PlannedMove>) -> DispatchOutcome {
        if moves.is_empty() {
            return DispatchOutcome::Continue;
        }
        if self.special_queuing_state != QueuingState::Main {
            if self.special_queuing_state != QueuingState::Drip {
                // Transition from "Flushed"/"Priming" state to main state.
                self.special_queuing_state = QueuingState::Main;
                self.need_check_stall = -1.0;
                self.flush_timer_waketime = NOW;
            }
            self.calc_print_time();
        }
        // Queue moves into the trapezoid motion queue.
        let mut next_move_time = self.print_time;
        for (m, profile) in moves.iter() {
            if m.is_kinematic_move {
                self.trapq.borrow_mut().append(next_move_time, m, profile);
            }
            if m.axes_d.w != 0.0 {
                self.extruder.process_move(next_move_time, m, profile);
            }
            next_move_time += profile.total_time();
        }
        // Generate steps for the queued motion.
        if self.special_queuing_state == QueuingState::Drip {
            if self.update_drip_move_time(next_move_time) == DispatchOutcome::DripEnded {
                return DispatchOutcome::DripEnded;
            }
        }
        self.update_move_time(next_move_time);
        self.last_kin_move_time = next_move_time;
        DispatchOutcome::Continue
    }

    fn dispatch_flush(&mut self, lazy: bool) -> DispatchOutcome {
        match self.move_queue.flush(lazy) {
            Ok(planned) => self.process_moves(planned),
            Err(e) => {
                self.planner_fault(e);
                DispatchOutcome::Continue
            }
        }
    }

    fn planner_fault(&mut self, e: PlannerError) {
        log::error!("{}", e);
        self.invoke_shutdown(&e.to_string());
    }

    /// Fatal-error path: clear the queue and refuse further motion.
    pub fn invoke_shutdown(&mut self, reason: &str) {
        if self.shutdown_reason.is_some() {
            return;
        }
        self.shutdown_reason = Some(reason.to_string());
        self.can_pause = false;
        self.move_queue.reset();
        self.events.send(&PrinterEvent::Shutdown(reason.to_string()));
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_reason.is_some()
    }

    /// Drain the look-ahead queue and force all step generation up to
    /// the present; transition to the "Flushed" state.
    pub fn flush_step_generation(&mut self) {
        self.dispatch_flush(false);
        self.special_queuing_state = QueuingState::Flushed;
        self.need_check_stall = -1.0;
        self.flush_timer_waketime = NEVER;
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        let flush_time = self.last_kin_move_time + self.kin_flush_delay;
        self.last_kin_flush_time = self.last_kin_flush_time.max(flush_time);
        self.update_move_time(self.print_time.max(self.last_kin_flush_time));
    }

    fn flush_lookahead(&mut self) {
        if self.special_queuing_state != QueuingState::Main {
            return self.flush_step_generation();
        }
        self.dispatch_flush(false);
    }

    pub fn get_last_move_time(&mut self) -> f64 {
        self.flush_lookahead();
        if self.special_queuing_state != QueuingState::Main {
            self.calc_print_time();
        }
        self.print_time
    }

    fn check_stall(&mut self) {
        let mut eventtime = self.reactor.monotonic();
        if self.special_queuing_state != QueuingState::Main {
            if self.idle_flush_print_time != 0.0 {
                // Was in "Flushed" state and got there from idle input.
                let est_print_time = self.mcu.estimated_print_time(eventtime);
                if est_print_time < self.idle_flush_print_time {
                    self.print_stall += 1;
                }
                self.idle_flush_print_time = 0.0;
            }
            self.special_queuing_state = QueuingState::Priming;
            self.need_check_stall = -1.0;
            self.flush_timer_waketime = eventtime + 0.100;
        }
        // Pause while the buffer holds more than buffer_time_high of
        // motion.
        let est_print_time = loop {
            let est_print_time = self.mcu.estimated_print_time(eventtime);
            let buffer_time = self.print_time - est_print_time;
            let stall_time = buffer_time - self.buffer_time_high;
            if stall_time <= 0.0 {
                break est_print_time;
            }
            if !self.can_pause {
                self.need_check_stall = NEVER;
                return;
            }
            eventtime = self.reactor.pause(eventtime + stall_time.min(1.0));
        };
        if self.special_queuing_state == QueuingState::Main {
            // In main state: defer stall checking until needed.
            self.need_check_stall = est_print_time + self.buffer_time_high + 0.100;
        }
    }

    /// Periodic flush check; the host event loop calls this at
    /// `flush_timer_waketime` and reschedules at the returned time.
    pub fn flush_handler(&mut self, eventtime: f64) -> f64 {
        let print_time = self.print_time;
        let buffer_time = print_time - self.mcu.estimated_print_time(eventtime);
        if buffer_time > self.buffer_time_low {
            // Running normally; reschedule the check.
            self.flush_timer_waketime = eventtime + buffer_time - self.buffer_time_low;
            return self.flush_timer_waketime;
        }
        // Under the low buffer mark: flush the look-ahead queue.
        self.flush_step_generation();
        if print_time != self.print_time {
            self.idle_flush_print_time = self.print_time;
        }
        self.flush_timer_waketime = NEVER;
        NEVER
    }

    pub fn flush_timer_waketime(&self) -> f64 {
        self.flush_timer_waketime
    }

    // Movement commands.

    pub fn get_position(&self) -> DVec4 {
        self.commanded_pos
    }

    pub fn set_position(&mut self, newpos: DVec4, homing_axes: &[usize]) {
        self.flush_step_generation();
        self.trapq.borrow_mut().free_moves(NEVER);
        self.commanded_pos = newpos;
        self.kin.set_position(newpos, homing_axes);
    }

    /// Enqueue a linear move to `newpos` at the requested speed. Does
    /// not suspend unless the look-ahead buffer is saturated. The
    /// returned outcome is only ever `DripEnded` when a lazy flush
    /// inside the call dispatched in drip mode.
    pub fn move_to(
        &mut self,
        newpos: DVec4,
        speed: f64,
    ) -> Result<DispatchOutcome, CommandError> {
        if let Some(reason) = &self.shutdown_reason {
            return Err(CommandError::Shutdown(reason.clone()));
        }
        if speed <= 0.0 {
            return Err(CommandError::ParameterOutOfRange {
                name: "speed",
                value: speed,
            });
        }
        let mut m = Move::new(&self.limits, self.commanded_pos, newpos, speed);
        if m.move_d == 0.0 {
            return Ok(DispatchOutcome::Continue);
        }
        if m.is_kinematic_move {
            self.kin.check_move(&mut m)?;
        }
        if m.axes_d.w != 0.0 {
            self.extruder.check_move(&mut m)?;
        }
        self.commanded_pos = m.end_pos;
        let extruder_v2 = match self.move_queue.last() {
            Some(prev) => self.extruder.calc_junction(prev, &m),
            None => m.max_cruise_v2,
        };
        let needs_flush = self.move_queue.add_move(
            m,
            self.limits.junction_deviation,
            &self.junction_policy,
            extruder_v2,
        );
        let mut outcome = DispatchOutcome::Continue;
        if needs_flush {
            // Enough moves queued to reach the target flush time.
            outcome = self.dispatch_flush(true);
        }
        if self.print_time > self.need_check_stall {
            self.check_stall();
        }
        Ok(outcome)
    }

    pub fn dwell(&mut self, delay: f64) {
        let next_print_time = self.get_last_move_time() + delay.max(0.0);
        self.update_move_time(next_print_time);
        self.check_stall();
    }

    pub fn wait_moves(&mut self) {
        self.flush_lookahead();
        let mut eventtime = self.reactor.monotonic();
        while self.special_queuing_state == QueuingState::Main
            || self.print_time >= self.mcu.estimated_print_time(eventtime)
        {
            if !self.can_pause {
                break;
            }
            eventtime = self.reactor.pause(eventtime + 0.100);
            if eventtime >= self.flush_timer_waketime {
                self.flush_handler(eventtime);
            }
        }
    }

    // Homing "drip move" handling.

    fn update_drip_move_time(&mut self, next_print_time: f64) -> DispatchOutcome {
        let flush_delay = DRIP_TIME + self.move_flush_time + self.kin_flush_delay;
        while self.print_time < next_print_time {
            let completion = match &self.drip_completion {
                Some(c) => c.clone(),
                None => return DispatchOutcome::Continue,
            };
            if completion.test() {
                return DispatchOutcome::DripEnded;
            }
            let curtime = self.reactor.monotonic();
            let est_print_time = self.mcu.estimated_print_time(curtime);
            let wait_time = self.print_time - est_print_time - flush_delay;
            if wait_time > 0.0 && self.can_pause {
                // Pause before sending more steps.
                self.reactor.pause(curtime + wait_time);
                continue;
            }
            let npt = (self.print_time + DRIP_SEGMENT_TIME).min(next_print_time);
            self.update_move_time(npt);
        }
        DispatchOutcome::Continue
    }

    /// Transmit a move in "drip" mode: motion is released one segment
    /// at a time so an endstop trigger can interrupt it. The caller
    /// owns `drip_completion` and completes it (typically from an
    /// endstop notification) to end the mode early.
    pub fn drip_move(
        &mut self,
        newpos: DVec4,
        speed: f64,
        drip_completion: Completion,
    ) -> Result<(), CommandError> {
        self.dispatch_flush(false);
        self.special_queuing_state = QueuingState::Drip;
        self.need_check_stall = NEVER;
        self.flush_timer_waketime = NEVER;
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        self.drip_completion = Some(drip_completion);
        // Submit the move.
        let outcome = match self.move_to(newpos, speed) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.drip_completion = None;
                self.flush_step_generation();
                return Err(e);
            }
        };
        // Transmit, dripping; an endstop may end the mode early. The
        // queue reset on early end happens here and only here.
        let outcome = match outcome {
            DispatchOutcome::Continue => self.dispatch_flush(false),
            DispatchOutcome::DripEnded => outcome,
        };
        if outcome == DispatchOutcome::DripEnded {
            self.move_queue.reset();
            self.trapq.borrow_mut().free_moves(NEVER);
        }
        // Exit "Drip" state.
        self.drip_completion = None;
        self.flush_step_generation();
        Ok(())
    }

    pub fn signal_drip_mode_end(&mut self) {
        if let Some(c) = &self.drip_completion {
            c.complete(true);
        }
    }

    // Misc commands.

    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        let mut buffer_time = self.print_time - self.mcu.estimated_print_time(eventtime);
        let is_active =
            buffer_time > -60.0 || self.special_queuing_state == QueuingState::Main;
        if self.special_queuing_state == QueuingState::Drip {
            buffer_time = 0.0;
        }
        (
            is_active,
            format!(
                "print_time={:.3} buffer_time={:.3} print_stall={}",
                self.print_time,
                buffer_time.max(0.0),
                self.print_stall
            ),
        )
    }

    pub fn check_busy(&self, eventtime: f64) -> (f64, f64, bool) {
        let est_print_time = self.mcu.estimated_print_time(eventtime);
        (self.print_time, est_print_time, self.move_queue.is_empty())
    }

    pub fn get_status(&self, eventtime: f64) -> ToolheadStatus {
        let estimated_print_time = self.mcu.estimated_print_time(eventtime);
        let buffer_time = self.print_time - estimated_print_time;
        let status = if buffer_time > -1.0 || self.special_queuing_state == QueuingState::Main {
            "Printing"
        } else {
            "Ready"
        };
        ToolheadStatus {
            status,
            print_time: self.print_time,
            estimated_print_time,
            extruder: self.extruder.name().to_string(),
            position: self.commanded_pos.to_array(),
            printing_time: self.print_time - self.last_print_start_time,
        }
    }

    // Kinematic step generation scan window tracking.

    /// Declare (or update) a step-generation scan window. Forces a full
    /// flush so past motion is not re-generated under the new kernel
    /// behavior.
    pub fn note_step_generation_scan_time(&mut self, delay: f64, old_delay: f64) {
        self.flush_step_generation();
        if old_delay != 0.0 {
            if let Some(pos) = self
                .kin_flush_times
                .iter()
                .position(|t| (t - old_delay).abs() < 1e-12)
            {
                self.kin_flush_times.remove(pos);
            }
        }
        if delay != 0.0 {
            self.kin_flush_times.push(delay);
        }
        self.kin_flush_delay = self.kin_flush_times.iter().cloned().fold(0.0, f64::max);
    }

    pub fn note_kinematic_activity(&mut self, kin_time: f64) {
        if kin_time > self.last_kin_move_time {
            self.last_kin_move_time = kin_time;
        }
    }

    // Command handlers.

    pub fn cmd_set_velocity_limit(
        &mut self,
        params: &CommandParams,
    ) -> Result<String, CommandError> {
        self.get_last_move_time();
        self.limits.set_velocity_limit(params)
    }

    pub fn cmd_m204(&mut self, params: &CommandParams) -> Result<(), CommandError> {
        self.limits.set_accel_m204(params)
    }

    pub fn cmd_set_scurve(&mut self, params: &CommandParams) -> Result<String, CommandError> {
        self.get_last_move_time();
        self.limits.set_scurve(params)
    }
}
