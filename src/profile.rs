/// Position reached `rel_t` seconds into an acceleration phase that
/// ramps from `start_v` with average acceleration `accel` over
/// `total_t` seconds. Orders 4 and 6 use the Bezier polynomial forms;
/// order 2 is the classic constant-acceleration ramp.
pub fn accel_position(order: u8, rel_t: f64, start_v: f64, accel: f64, total_t: f64) -> f64 {
    if total_t <= 0.0 {
        return 0.0;
    }
    match order {
        4 => {
            let inv_accel_t = 1.0 / total_t;
            let accel_div_accel_t = accel * inv_accel_t;
            let accel_div_accel_t2 = accel_div_accel_t * inv_accel_t;
            let c4 = -0.5 * accel_div_accel_t2;
            let c3 = accel_div_accel_t;
            let c1 = start_v;
            ((c4 * rel_t + c3) * rel_t * rel_t + c1) * rel_t
        }
        6 => {
            let inv_accel_t = 1.0 / total_t;
            let accel_div_accel_t = accel * inv_accel_t;
            let accel_div_accel_t2 = accel_div_accel_t * inv_accel_t;
            let accel_div_accel_t3 = accel_div_accel_t2 * inv_accel_t;
            let accel_div_accel_t4 = accel_div_accel_t3 * inv_accel_t;
            let c6 = accel_div_accel_t4;
            let c5 = -3.0 * accel_div_accel_t3;
            let c4 = 2.5 * accel_div_accel_t2;
            let c1 = start_v;
            (((c6 * rel_t + c5) * rel_t + c4) * rel_t * rel_t * rel_t + c1) * rel_t
        }
        _ => (start_v + 0.5 * accel * rel_t) * rel_t,
    }
}

/// Velocity `rel_t` seconds into the same acceleration phase.
pub fn accel_velocity(order: u8, rel_t: f64, start_v: f64, accel: f64, total_t: f64) -> f64 {
    if total_t <= 0.0 {
        return start_v;
    }
    let inv_t = 1.0 / total_t;
    let r = rel_t * inv_t;
    match order {
        4 => start_v + accel * total_t * (3.0 - 2.0 * r) * r * r,
        6 => start_v + accel * total_t * ((6.0 * r - 15.0) * r + 10.0) * r * r * r,
        _ => start_v + accel * rel_t,
    }
}

/// Finalized velocity profile of one move. Acceleration and
/// deceleration phases may be slices of a phase shared with adjacent
/// moves: the slice covers `[offset_t, offset_t + t)` of a combined
/// ramp lasting `total_t` that starts at `start_accel_v` (or ends the
/// deceleration at `cruise_v`, mirrored).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccelDecel {
    pub accel_order: u8,
    pub accel_t: f64,
    pub accel_offset_t: f64,
    pub total_accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    pub decel_offset_t: f64,
    pub total_decel_t: f64,
    pub start_accel_v: f64,
    pub cruise_v: f64,
    pub effective_accel: f64,
    pub effective_decel: f64,
}

impl AccelDecel {
    /// Plain (uncombined) constant-acceleration trapezoid between the
    /// given junction velocities.
    pub fn trapezoid(start_v2: f64, cruise_v2: f64, end_v2: f64, accel: f64, move_d: f64) -> Self {
        let start_v = start_v2.sqrt();
        let cruise_v = cruise_v2.sqrt();
        let end_v = end_v2.sqrt();
        let inv_accel = if accel > 0.0 { 1.0 / accel } else { 0.0 };
        let accel_t = (cruise_v - start_v) * inv_accel;
        let decel_t = (cruise_v - end_v) * inv_accel;
        let accel_d = (cruise_v2 - start_v2) * 0.5 * inv_accel;
        let decel_d = (cruise_v2 - end_v2) * 0.5 * inv_accel;
        let cruise_t = ((move_d - accel_d - decel_d) / cruise_v).max(0.0);
        AccelDecel {
            accel_order: 2,
            accel_t,
            accel_offset_t: 0.0,
            total_accel_t: accel_t,
            cruise_t,
            decel_t,
            decel_offset_t: 0.0,
            total_decel_t: decel_t,
            start_accel_v: start_v,
            cruise_v,
            effective_accel: accel,
            effective_decel: accel,
        }
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub fn start_v(&self) -> f64 {
        if self.accel_t > 0.0 {
            accel_velocity(
                self.accel_order,
                self.accel_offset_t,
                self.start_accel_v,
                self.effective_accel,
                self.total_accel_t,
            )
        } else if self.cruise_t > 0.0 {
            self.cruise_v
        } else {
            self.decel_velocity(self.decel_offset_t)
        }
    }

    pub fn end_v(&self) -> f64 {
        if self.decel_t > 0.0 {
            self.decel_velocity(self.decel_offset_t + self.decel_t)
        } else if self.cruise_t > 0.0 {
            self.cruise_v
        } else {
            accel_velocity(
                self.accel_order,
                self.accel_offset_t + self.accel_t,
                self.start_accel_v,
                self.effective_accel,
                self.total_accel_t,
            )
        }
    }

    fn decel_velocity(&self, rel_t: f64) -> f64 {
        accel_velocity(
            self.accel_order,
            rel_t,
            self.cruise_v,
            -self.effective_decel,
            self.total_decel_t,
        )
    }

    fn accel_pos(&self, rel_t: f64) -> f64 {
        accel_position(
            self.accel_order,
            rel_t,
            self.start_accel_v,
            self.effective_accel,
            self.total_accel_t,
        )
    }

    fn decel_pos(&self, rel_t: f64) -> f64 {
        accel_position(
            self.accel_order,
            rel_t,
            self.cruise_v,
            -self.effective_decel,
            self.total_decel_t,
        )
    }

    pub fn accel_distance(&self) -> f64 {
        self.accel_pos(self.accel_offset_t + self.accel_t) - self.accel_pos(self.accel_offset_t)
    }

    pub fn decel_distance(&self) -> f64 {
        self.decel_pos(self.decel_offset_t + self.decel_t) - self.decel_pos(self.decel_offset_t)
    }

    pub fn move_distance(&self) -> f64 {
        self.accel_distance() + self.cruise_t * self.cruise_v + self.decel_distance()
    }

    /// Velocity `move_time` seconds into this move.
    pub fn velocity_at(&self, move_time: f64) -> f64 {
        let t = move_time.max(0.0).min(self.total_time());
        if t < self.accel_t {
            accel_velocity(
                self.accel_order,
                self.accel_offset_t + t,
                self.start_accel_v,
                self.effective_accel,
                self.total_accel_t,
            )
        } else if t < self.accel_t + self.cruise_t {
            self.cruise_v
        } else {
            self.decel_velocity(self.decel_offset_t + (t - self.accel_t - self.cruise_t))
        }
    }

    /// Distance travelled `move_time` seconds into this move.
    pub fn distance_at(&self, move_time: f64) -> f64 {
        let t = move_time.max(0.0).min(self.total_time());
        if t < self.accel_t {
            self.accel_pos(self.accel_offset_t + t) - self.accel_pos(self.accel_offset_t)
        } else if t < self.accel_t + self.cruise_t {
            self.accel_distance() + self.cruise_v * (t - self.accel_t)
        } else {
            let rel_t = self.decel_offset_t + (t - self.accel_t - self.cruise_t);
            self.accel_distance()
                + self.cruise_v * self.cruise_t
                + (self.decel_pos(rel_t) - self.decel_pos(self.decel_offset_t))
        }
    }
}
