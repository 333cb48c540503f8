use std::collections::VecDeque;

use crate::errors::PlannerError;
use crate::moves::{JunctionPolicy, Move};
use crate::profile::AccelDecel;
use crate::scurve::{self, SCurveMove};

pub const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

const EPSILON: f64 = 1e-9;
/// Maximum velocity jump tolerated between adjacent planned moves.
const JUNCTION_VELOCITY_TOLERANCE: f64 = 1e-4;

/// Per-move planning record kept by the planning queue.
#[derive(Debug, Clone)]
struct PlanMove {
    move_d: f64,
    max_cruise_v2: f64,
    accel: f64,
    jerk: f64,
    min_accel: f64,
    accel_order: u8,
    max_dv2: f64,
    smoothed_dv2: f64,
    /// Raw junction limit at this move's entry.
    junction_max_v2: f64,
    /// Entry cap: junction limit chained with what the previous moves
    /// can actually reach.
    max_start_v2: f64,
    /// Entry cap under the virtual accel_to_decel profile.
    max_smoothed_v2: f64,
    profile: Option<AccelDecel>,
}

impl PlanMove {
    fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        self.profile = Some(AccelDecel::trapezoid(
            start_v2,
            cruise_v2,
            end_v2,
            self.accel,
            self.move_d,
        ));
    }
}

/// The look-ahead planning queue: accumulates kinematic parameters for
/// pending moves and assigns each a finalized velocity profile on
/// flush. Owns no references to the `Move` objects themselves;
/// profiles are copied out.
#[derive(Debug, Default)]
pub struct PlanningQueue {
    queue: VecDeque<PlanMove>,
    /// Forward-reachability chain of the most recently added move.
    chain_start_v2: f64,
    chain_smoothed_v2: f64,
    /// Planned exit velocity (squared) of the last flushed move.
    committed_v2: f64,
}

impl PlanningQueue {
    pub fn new() -> PlanningQueue {
        PlanningQueue::default()
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.chain_start_v2 = 0.0;
        self.chain_smoothed_v2 = 0.0;
        self.committed_v2 = 0.0;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn add(&mut self, m: &Move) {
        let max_dv2 = 2.0 * m.move_d * m.accel;
        let smoothed_dv2 = 2.0 * m.move_d * m.accel_to_decel;
        let max_start_v2 = m.junction_max_v2.min(self.chain_start_v2);
        let max_smoothed_v2 = max_start_v2.min(self.chain_smoothed_v2);
        self.chain_start_v2 = max_start_v2 + max_dv2;
        self.chain_smoothed_v2 = max_smoothed_v2 + smoothed_dv2;
        self.queue.push_back(PlanMove {
            move_d: m.move_d,
            max_cruise_v2: m.max_cruise_v2,
            accel: m.accel,
            jerk: m.jerk,
            min_accel: scurve::min_accel_limit(m.accel, m.jerk, m.min_jerk_limit_time),
            accel_order: m.accel_order,
            max_dv2,
            smoothed_dv2,
            junction_max_v2: m.junction_max_v2,
            max_start_v2,
            max_smoothed_v2,
            profile: None,
        });
    }

    /// Run the look-ahead passes. With `lazy` only moves whose profile
    /// can no longer change are finalized. Returns the finalized
    /// profiles in queue order and drops their records.
    pub fn plan(&mut self, lazy: bool) -> Result<Vec<AccelDecel>, PlannerError> {
        if self.queue.is_empty() {
            return Ok(Vec::new());
        }
        let scurve_path = self.queue.iter().any(|m| m.accel_order > 2);
        let flush_count = if scurve_path {
            self.plan_scurve(lazy)
        } else {
            self.plan_order2(lazy)
        };
        let mut out = Vec::with_capacity(flush_count);
        for _ in 0..flush_count {
            match self.queue.pop_front().and_then(|m| m.profile) {
                Some(profile) => out.push(profile),
                None => return Err(PlannerError::NegativeFlushCount),
            }
        }
        self.validate(&out)?;
        if let Some(last) = out.last() {
            self.committed_v2 = last.end_v() * last.end_v();
        }
        Ok(out)
    }

    /// Classic two-pass trapezoid look-ahead for constant-acceleration
    /// moves. The backward pass walks from an assumed stop at the tail;
    /// a move whose entry saturates below its smoothed reachability
    /// marks a peak-cruise boundary, and in lazy mode only moves before
    /// the last such boundary are committed.
    fn plan_order2(&mut self, lazy: bool) -> usize {
        let queue_len = self.queue.len();
        let mut delayed: Vec<(&mut PlanMove, f64, f64)> = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;
        let mut update_flush_count = lazy;
        let mut flush_count = queue_len;

        for (idx, m) in self.queue.iter_mut().enumerate().rev() {
            let reachable_start_v2 = next_end_v2 + m.max_dv2;
            let start_v2 = m.max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + m.smoothed_dv2;
            let smoothed_v2 = m.max_smoothed_v2.min(reachable_smoothed_v2);
            if smoothed_v2 < reachable_smoothed_v2 {
                // The junction is the binding limit here; a peak cruise
                // forms behind it.
                if smoothed_v2 + m.smoothed_dv2 > next_smoothed_v2 || !delayed.is_empty() {
                    if update_flush_count && peak_cruise_v2 != 0.0 {
                        flush_count = idx;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 = m
                        .max_cruise_v2
                        .min((smoothed_v2 + reachable_smoothed_v2) * 0.5);
                    if !delayed.is_empty() {
                        if !update_flush_count && idx < flush_count {
                            let mut mc_v2 = peak_cruise_v2;
                            for (d, ms_v2, me_v2) in delayed.iter_mut().rev() {
                                mc_v2 = mc_v2.min(*ms_v2);
                                d.set_junction(ms_v2.min(mc_v2), mc_v2, me_v2.min(mc_v2));
                            }
                        }
                        delayed.clear();
                    }
                }
                if !update_flush_count && idx < flush_count {
                    let cruise_v2 = ((start_v2 + reachable_start_v2) * 0.5)
                        .min(m.max_cruise_v2)
                        .min(peak_cruise_v2);
                    m.set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                // Fully accelerating or decelerating; its profile
                // depends on the peak cruise found further back.
                delayed.push((m, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }
        if update_flush_count {
            return 0;
        }
        flush_count
    }

    /// Jerk-limited planning: combiner passes fix the junction
    /// velocities, per-group trapezoids share their peaks. Lazy flushes
    /// cut at the last junction pinned by a cap from both directions.
    fn plan_scurve(&mut self, lazy: bool) -> usize {
        let scurve_moves: Vec<SCurveMove> = self
            .queue
            .iter()
            .map(|m| SCurveMove {
                move_d: m.move_d,
                junction_max_v2: m.junction_max_v2,
                max_cruise_v2: m.max_cruise_v2,
                accel: m.accel,
                jerk: m.jerk,
                min_accel: m.min_accel,
                accel_order: m.accel_order.max(2),
            })
            .collect();
        let plan = scurve::plan(&scurve_moves, self.committed_v2);
        let flush_count = if lazy {
            *plan
                .group_bounds
                .iter()
                .filter(|&&b| b < self.queue.len())
                .last()
                .unwrap_or(&0)
        } else {
            self.queue.len()
        };
        for (m, profile) in self.queue.iter_mut().zip(plan.profiles.iter()) {
            m.profile = Some(*profile);
        }
        flush_count
    }

    /// Invariant checks on the finalized profiles; a violation is fatal.
    fn validate(&self, profiles: &[AccelDecel]) -> Result<(), PlannerError> {
        let mut prev_end_v = self.committed_v2.sqrt();
        for p in profiles {
            if p.cruise_t < -EPSILON {
                return Err(PlannerError::NegativeCruiseTime(p.cruise_t));
            }
            let accel_d = p.accel_distance();
            let decel_d = p.decel_distance();
            let move_d = p.move_distance();
            if accel_d + decel_d > move_d + 1e-6 {
                return Err(PlannerError::DistanceOverrun {
                    accel_d,
                    decel_d,
                    move_d,
                });
            }
            let jump = (p.start_v() - prev_end_v).abs();
            if jump > JUNCTION_VELOCITY_TOLERANCE {
                return Err(PlannerError::VelocityDiscontinuity { jump });
            }
            prev_end_v = p.end_v();
        }
        Ok(())
    }
}

/// A finalized move together with its velocity profile.
pub type PlannedMove = (Move, AccelDecel);

/// User-facing look-ahead queue: accumulates pending `Move`s, performs
/// junction calculations on add, and commits profiles on flush.
#[derive(Debug, Default)]
pub struct MoveQueue {
    queue: VecDeque<Move>,
    planner: PlanningQueue,
    junction_flush: f64,
}

impl MoveQueue {
    pub fn new() -> MoveQueue {
        MoveQueue {
            queue: VecDeque::new(),
            planner: PlanningQueue::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.planner.reset();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    pub fn set_flush_time(&mut self, flush_time: f64) {
        self.junction_flush = flush_time;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn last(&self) -> Option<&Move> {
        self.queue.back()
    }

    /// Append a move, computing its junction limit against the current
    /// queue tail. Returns true once enough motion is buffered that the
    /// caller should issue a lazy flush.
    pub fn add_move(
        &mut self,
        mut m: Move,
        junction_deviation: f64,
        policy: &JunctionPolicy,
        extruder_v2: f64,
    ) -> bool {
        if let Some(prev) = self.queue.back() {
            m.calc_junction(prev, junction_deviation, policy, extruder_v2);
        }
        self.planner.add(&m);
        self.junction_flush -= m.min_move_t;
        self.queue.push_back(m);
        self.junction_flush <= 0.0
    }

    /// Plan and drain the committable prefix of the queue.
    pub fn flush(&mut self, lazy: bool) -> Result<Vec<PlannedMove>, PlannerError> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let queue_len = self.queue.len();
        let profiles = self.planner.plan(lazy)?;
        log::debug!(
            "lookahead flush: lazy={} qsize={} flush_count={}",
            lazy,
            queue_len,
            profiles.len()
        );
        let mut out = Vec::with_capacity(profiles.len());
        for profile in profiles {
            match self.queue.pop_front() {
                Some(m) => out.push((m, profile)),
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitsConfig;
    use crate::limits::ToolheadLimits;
    use glam::DVec4;

    fn limits(accel_order: u8) -> ToolheadLimits {
        LimitsConfig {
            max_velocity: 100.0,
            max_accel: 3000.0,
            square_corner_velocity: 5.0,
            acceleration_order: accel_order,
            ..LimitsConfig::default()
        }
        .build()
        .unwrap()
    }

    fn queue_moves(
        limits: &ToolheadLimits,
        points: &[[f64; 4]],
        speed: f64,
    ) -> (MoveQueue, Vec<PlannedMove>) {
        let mut mq = MoveQueue::new();
        let mut pos = DVec4::new(points[0][0], points[0][1], points[0][2], points[0][3]);
        for p in &points[1..] {
            let end = DVec4::new(p[0], p[1], p[2], p[3]);
            let m = Move::new(limits, pos, end, speed);
            pos = m.end_pos;
            mq.add_move(
                m,
                limits.junction_deviation,
                &JunctionPolicy::Default,
                f64::MAX,
            );
        }
        let planned = mq.flush(false).unwrap();
        (mq, planned)
    }

    #[test]
    fn single_short_move_is_triangular() {
        // 0.1mm at 100mm/s with accel 1000: the move cannot reach the
        // requested speed, so accel and decel meet at the peak.
        let limits = LimitsConfig {
            max_velocity: 100.0,
            max_accel: 1000.0,
            max_accel_to_decel: Some(1000.0),
            ..LimitsConfig::default()
        }
        .build()
        .unwrap();
        let (_, planned) = queue_moves(
            &limits,
            &[[0.0, 0.0, 0.0, 0.0], [0.1, 0.0, 0.0, 0.0]],
            100.0,
        );
        assert_eq!(planned.len(), 1);
        let p = &planned[0].1;
        let peak_v = (2.0 * 1000.0 * 0.05f64).sqrt();
        assert!((p.cruise_v - peak_v).abs() < 1e-9);
        assert!(p.cruise_t < 1e-9);
        assert!((p.accel_t - p.decel_t).abs() < 1e-12);
    }

    #[test]
    fn collinear_moves_merge_into_one_ramp() {
        let limits = limits(2);
        let (_, planned) = queue_moves(
            &limits,
            &[
                [0.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
                [20.0, 0.0, 0.0, 0.0],
            ],
            100.0,
        );
        assert_eq!(planned.len(), 2);
        let (first, second) = (&planned[0].1, &planned[1].1);
        assert!((first.end_v() - second.start_v()).abs() < 1e-4);
        assert!((first.end_v() - first.cruise_v).abs() < 1e-9);
        assert!((first.cruise_v - 100.0).abs() < 1e-9);
        assert!(second.end_v() < 1e-9);
    }

    #[test]
    fn square_corner_slows_to_corner_velocity() {
        let limits = limits(2);
        let (_, planned) = queue_moves(
            &limits,
            &[
                [0.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
                [10.0, 10.0, 0.0, 0.0],
            ],
            100.0,
        );
        let (first, second) = (&planned[0].1, &planned[1].1);
        assert!((first.end_v() - 5.0).abs() < 0.01);
        assert!((second.start_v() - 5.0).abs() < 0.01);
    }

    #[test]
    fn extrude_only_move_forces_a_stop() {
        let limits = limits(2);
        let (_, planned) = queue_moves(
            &limits,
            &[
                [0.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 5.0],
                [20.0, 0.0, 0.0, 5.0],
            ],
            100.0,
        );
        assert_eq!(planned.len(), 3);
        // The kinematic move before the extrude-only move ends at rest.
        assert!(planned[0].1.end_v() < 1e-9);
        // The extrude-only move runs on the extruder's own caps.
        let p = &planned[1].1;
        assert!((p.move_distance() - 5.0).abs() < 1e-6);
        assert!(!planned[1].0.is_kinematic_move);
    }

    #[test]
    fn lazy_flush_holds_back_the_tail() {
        let limits = limits(2);
        let mut mq = MoveQueue::new();
        let mut pos = DVec4::ZERO;
        // A long run of collinear moves: the tail can still speed up,
        // so a lazy flush must keep it.
        for i in 1..=20 {
            let end = DVec4::new(i as f64 * 5.0, 0.0, 0.0, 0.0);
            let m = Move::new(&limits, pos, end, 100.0);
            pos = m.end_pos;
            mq.add_move(
                m,
                limits.junction_deviation,
                &JunctionPolicy::Default,
                f64::MAX,
            );
        }
        let planned = mq.flush(true).unwrap();
        assert!(planned.len() < 20);
        // The rest commits on a forced flush, with continuity across
        // the boundary.
        let boundary_v = planned.last().map(|p| p.1.end_v()).unwrap_or(0.0);
        let rest = mq.flush(false).unwrap();
        assert_eq!(planned.len() + rest.len(), 20);
        if let Some(first) = rest.first() {
            assert!((first.1.start_v() - boundary_v).abs() < 1e-4);
        }
    }

    #[test]
    fn junction_flush_countdown_requests_flush() {
        let limits = limits(2);
        let mut mq = MoveQueue::new();
        mq.set_flush_time(0.050);
        let mut pos = DVec4::ZERO;
        let mut requested = false;
        for i in 1..=10 {
            let end = DVec4::new(i as f64 * 10.0, 0.0, 0.0, 0.0);
            let m = Move::new(&limits, pos, end, 100.0);
            pos = m.end_pos;
            requested = mq.add_move(
                m,
                limits.junction_deviation,
                &JunctionPolicy::Default,
                f64::MAX,
            );
            if requested {
                break;
            }
        }
        // 10mm at 100mm/s is 0.1s of motion per move.
        assert!(requested);
    }

    #[test]
    fn scurve_queue_plans_with_combined_ramps() {
        let limits = limits(4);
        let (_, planned) = queue_moves(
            &limits,
            &[
                [0.0, 0.0, 0.0, 0.0],
                [0.5, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [31.0, 0.0, 0.0, 0.0],
            ],
            100.0,
        );
        assert_eq!(planned.len(), 3);
        for w in planned.windows(2) {
            assert!((w[0].1.end_v() - w[1].1.start_v()).abs() < 1e-4);
        }
        // The first two short moves share one acceleration phase.
        assert_eq!(planned[0].1.total_accel_t, planned[1].1.total_accel_t);
        for (m, p) in &planned {
            assert!(p.accel_distance() + p.decel_distance() <= m.move_d + 1e-6);
        }
    }

    #[test]
    fn velocity_continuity_across_many_random_corners() {
        let limits = limits(2);
        let pts: Vec<[f64; 4]> = (0..15)
            .map(|i| {
                let f = i as f64;
                [10.0 * f, if i % 2 == 0 { 0.0 } else { 7.0 }, 0.0, 0.1 * f]
            })
            .collect();
        let (_, planned) = queue_moves(&limits, &pts, 80.0);
        assert_eq!(planned.len(), 14);
        for w in planned.windows(2) {
            assert!((w[0].1.end_v() - w[1].1.start_v()).abs() < 1e-4);
        }
        for (m, p) in &planned {
            assert!((p.move_distance() - m.move_d).abs() < 1e-6);
            // Junction bound at every move entry.
            assert!(p.start_v() * p.start_v() <= m.junction_max_v2 + 1e-6);
        }
    }
}
