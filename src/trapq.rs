use std::collections::VecDeque;

use glam::{DVec3, Vec4Swizzles};

use crate::moves::Move;
use crate::profile::AccelDecel;
use crate::reactor::NEVER;

/// One time-paced motion segment: start position, axis direction and
/// the velocity profile to run over it.
#[derive(Debug, Clone, Copy)]
pub struct TrapMove {
    pub print_time: f64,
    pub move_t: f64,
    pub start_pos: DVec3,
    pub axes_r: DVec3,
    pub profile: AccelDecel,
}

impl TrapMove {
    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    pub fn position(&self, time: f64) -> DVec3 {
        let move_time = (time - self.print_time).max(0.0).min(self.move_t);
        self.start_pos + self.axes_r * self.profile.distance_at(move_time)
    }

    pub fn velocity(&self, time: f64) -> f64 {
        self.profile.velocity_at((time - self.print_time).max(0.0).min(self.move_t))
    }
}

/// The trapezoid motion queue: finalized segments keyed by print time,
/// written by the scheduler and read by the step generators. Readers
/// only look at times at or before the scheduler's flush barrier, so
/// the temporal discipline replaces locking.
#[derive(Debug, Default)]
pub struct TrapQueue {
    moves: VecDeque<TrapMove>,
    last_pos: DVec3,
}

impl TrapQueue {
    pub fn new() -> TrapQueue {
        TrapQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// Append a finalized kinematic move. The profile is copied; the
    /// queue holds no reference to the `Move`.
    pub fn append(&mut self, print_time: f64, m: &Move, profile: &AccelDecel) {
        self.moves.push_back(TrapMove {
            print_time,
            move_t: profile.total_time(),
            start_pos: m.start_pos.xyz(),
            axes_r: m.axes_r.xyz(),
            profile: *profile,
        });
    }

    /// Release moves that complete before `free_time`. Passing `NEVER`
    /// empties the queue.
    pub fn free_moves(&mut self, free_time: f64) {
        while let Some(front) = self.moves.front() {
            if front.end_time() > free_time && free_time < NEVER {
                break;
            }
            self.last_pos = front.position(front.end_time());
            self.moves.pop_front();
        }
    }

    /// Commanded position at `time`. Before the first retained move
    /// this is that move's start; past the last it is the final
    /// position.
    pub fn position(&self, time: f64) -> DVec3 {
        for m in self.moves.iter() {
            if time < m.end_time() {
                return m.position(time);
            }
        }
        self.moves
            .back()
            .map(|m| m.position(m.end_time()))
            .unwrap_or(self.last_pos)
    }

    /// Toolhead speed at `time`; zero in gaps and past the end.
    pub fn velocity(&self, time: f64) -> f64 {
        for m in self.moves.iter() {
            if time >= m.print_time && time < m.end_time() {
                return m.velocity(time);
            }
        }
        0.0
    }

    pub fn next_free_time(&self) -> Option<f64> {
        self.moves.front().map(|m| m.end_time())
    }
}
