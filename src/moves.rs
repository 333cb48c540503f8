use glam::{DVec4, Vec4Swizzles};

use crate::limits::ToolheadLimits;

// Common suffixes: _d is distance (in mm), _v is velocity (in
// mm/second), _v2 is velocity squared (mm^2/s^2), _t is time (in
// seconds), _r is ratio (scalar between 0.0 and 1.0).

const EXTRUDE_ONLY_THRESHOLD: f64 = 0.000000001;
pub const EXTRUDE_ONLY_ACCEL: f64 = 99999999.9;

/// Corner-velocity form used by the smoothing policy; which of the two
/// is the intended one is unsettled, so both are selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothCornerForm {
    TanSinMinusOne,
    TanSin,
}

/// How the geometric junction speed limit is computed. The smoothing
/// front-end swaps in its own variant on connect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JunctionPolicy {
    Default,
    SmoothAxis {
        smooth_t: f64,
        form: SmoothCornerForm,
    },
}

impl JunctionPolicy {
    fn geometry_max_v2(
        &self,
        prev_move: &Move,
        cur_move: &Move,
        junction_deviation: f64,
        sin_theta_d2: f64,
        tan_theta_d2: f64,
    ) -> f64 {
        match *self {
            JunctionPolicy::Default => {
                let r = junction_deviation * sin_theta_d2 / (1.0 - sin_theta_d2);
                let move_centripetal_v2 = 0.5 * cur_move.move_d * tan_theta_d2 * cur_move.accel;
                let prev_move_centripetal_v2 =
                    0.5 * prev_move.move_d * tan_theta_d2 * prev_move.accel;
                (r * cur_move.accel)
                    .min(r * prev_move.accel)
                    .min(move_centripetal_v2)
                    .min(prev_move_centripetal_v2)
            }
            JunctionPolicy::SmoothAxis { smooth_t, form } => {
                let ratio = match form {
                    SmoothCornerForm::TanSinMinusOne => tan_theta_d2 / sin_theta_d2 - 1.0,
                    SmoothCornerForm::TanSin => tan_theta_d2 / sin_theta_d2,
                };
                let x = 0.25 * smooth_t * ratio;
                let v = (x * cur_move.accel).min(x * prev_move.accel);
                v * v
            }
        }
    }
}

/// A single commanded linear segment in (x, y, z, e) space.
#[derive(Debug, Clone)]
pub struct Move {
    pub start_pos: DVec4,
    pub end_pos: DVec4,
    pub velocity: f64,
    pub accel: f64,
    pub accel_to_decel: f64,
    pub jerk: f64,
    pub accel_order: u8,
    pub min_jerk_limit_time: f64,
    pub accel_compensation: f64,
    pub is_kinematic_move: bool,
    pub axes_d: DVec4,
    pub axes_r: DVec4,
    pub move_d: f64,
    pub min_move_t: f64,
    pub max_cruise_v2: f64,
    pub junction_max_v2: f64,
}

impl Move {
    pub fn new(limits: &ToolheadLimits, start_pos: DVec4, end_pos: DVec4, speed: f64) -> Move {
        let mut velocity = speed.min(limits.max_velocity);
        let mut end_pos = end_pos;
        let mut axes_d = end_pos - start_pos;
        let mut move_d = axes_d.xyz().length();
        let mut accel = limits.max_accel;
        let mut accel_to_decel = limits.max_accel_to_decel;
        let mut jerk = limits.max_jerk;
        let mut is_kinematic_move = true;
        if move_d < EXTRUDE_ONLY_THRESHOLD {
            // Extrude only move
            end_pos = DVec4::new(start_pos.x, start_pos.y, start_pos.z, end_pos.w);
            axes_d.x = 0.0;
            axes_d.y = 0.0;
            axes_d.z = 0.0;
            move_d = axes_d.w.abs();
            accel = EXTRUDE_ONLY_ACCEL;
            accel_to_decel = EXTRUDE_ONLY_ACCEL;
            jerk = EXTRUDE_ONLY_ACCEL;
            velocity = speed;
            is_kinematic_move = false;
        }
        let inv_move_d = if move_d > 0.0 { 1.0 / move_d } else { 0.0 };
        let min_move_t = if move_d > 0.0 { move_d / velocity } else { 0.0 };
        Move {
            start_pos,
            end_pos,
            velocity,
            accel,
            accel_to_decel,
            jerk,
            accel_order: limits.accel_order,
            min_jerk_limit_time: limits.min_jerk_limit_time,
            accel_compensation: limits.accel_compensation,
            is_kinematic_move,
            axes_d,
            axes_r: axes_d * inv_move_d,
            move_d,
            min_move_t,
            // Junction speeds are tracked in velocity squared.
            max_cruise_v2: velocity * velocity,
            junction_max_v2: 0.0,
        }
    }

    /// Lower this move's velocity, acceleration and (optionally) jerk
    /// caps. Used by kinematics and extruder range checking.
    pub fn limit_speed(&mut self, speed: f64, accel: f64, jerk: Option<f64>) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.velocity = speed;
            self.max_cruise_v2 = speed2;
            self.min_move_t = self.move_d / speed;
        }
        self.accel = self.accel.min(accel);
        if let Some(jerk) = jerk {
            if jerk < self.jerk {
                self.jerk = jerk;
            }
        }
    }

    /// Maximum entry speed at the junction with `prev_move`, using the
    /// "approximated centripetal velocity" model. `extruder_v2` is the
    /// extruder's advisory cap for this junction.
    pub fn calc_junction(
        &mut self,
        prev_move: &Move,
        junction_deviation: f64,
        policy: &JunctionPolicy,
        extruder_v2: f64,
    ) {
        if !self.is_kinematic_move || !prev_move.is_kinematic_move {
            return;
        }
        let mut junction_cos_theta = -self.axes_r.xyz().dot(prev_move.axes_r.xyz());
        if junction_cos_theta > 0.999999 {
            // Collinear moves: no geometric limit at the junction.
            self.junction_max_v2 = extruder_v2
                .min(self.max_cruise_v2)
                .min(prev_move.max_cruise_v2);
            return;
        }
        junction_cos_theta = junction_cos_theta.max(-0.999999);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
        let tan_theta_d2 = sin_theta_d2 / (0.5 * (1.0 + junction_cos_theta)).sqrt();
        let geometry_v2 =
            policy.geometry_max_v2(prev_move, self, junction_deviation, sin_theta_d2, tan_theta_d2);
        self.junction_max_v2 = geometry_v2
            .min(extruder_v2)
            .min(self.max_cruise_v2)
            .min(prev_move.max_cruise_v2);
    }

    pub fn is_extrude_move(&self) -> bool {
        self.axes_d.w != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitsConfig;

    fn limits(max_accel: f64, scv: f64) -> ToolheadLimits {
        LimitsConfig {
            max_velocity: 300.0,
            max_accel,
            square_corner_velocity: scv,
            ..LimitsConfig::default()
        }
        .build()
        .unwrap()
    }

    fn kin_move(limits: &ToolheadLimits, from: [f64; 3], to: [f64; 3], speed: f64) -> Move {
        Move::new(
            limits,
            DVec4::new(from[0], from[1], from[2], 0.0),
            DVec4::new(to[0], to[1], to[2], 0.0),
            speed,
        )
    }

    #[test]
    fn extrude_only_reclassification() {
        let limits = limits(3000.0, 5.0);
        let m = Move::new(
            &limits,
            DVec4::new(0.0, 0.0, 0.0, 0.0),
            DVec4::new(0.0, 0.0, 0.0, 5.0),
            20.0,
        );
        assert!(!m.is_kinematic_move);
        assert!(m.is_extrude_move());
        assert_eq!(m.move_d, 5.0);
        assert_eq!(m.axes_d.xyz(), glam::DVec3::ZERO);
        assert_eq!(m.accel, EXTRUDE_ONLY_ACCEL);
        assert!((m.min_move_t - 0.25).abs() < 1e-12);
    }

    #[test]
    fn square_corner_junction_speed_matches_configured_scv() {
        // A 90 degree corner is the defining case for junction
        // deviation: the junction speed equals square_corner_velocity.
        let limits = limits(3000.0, 5.0);
        let prev = kin_move(&limits, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0], 100.0);
        let mut cur = kin_move(&limits, [10.0, 0.0, 0.0], [10.0, 10.0, 0.0], 100.0);
        cur.calc_junction(
            &prev,
            limits.junction_deviation,
            &JunctionPolicy::Default,
            f64::MAX,
        );
        assert!((cur.junction_max_v2.sqrt() - 5.0).abs() < 1e-3);
    }

    #[test]
    fn collinear_junction_is_geometry_unlimited() {
        let limits = limits(3000.0, 5.0);
        let prev = kin_move(&limits, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0], 100.0);
        let mut cur = kin_move(&limits, [10.0, 0.0, 0.0], [20.0, 0.0, 0.0], 100.0);
        cur.calc_junction(
            &prev,
            limits.junction_deviation,
            &JunctionPolicy::Default,
            f64::MAX,
        );
        assert_eq!(cur.junction_max_v2, cur.max_cruise_v2);
    }

    #[test]
    fn reversal_clamps_cos_theta() {
        let limits = limits(3000.0, 5.0);
        let prev = kin_move(&limits, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0], 100.0);
        let mut cur = kin_move(&limits, [10.0, 0.0, 0.0], [0.0, 0.0, 0.0], 100.0);
        cur.calc_junction(
            &prev,
            limits.junction_deviation,
            &JunctionPolicy::Default,
            f64::MAX,
        );
        // A full reversal still yields a tiny positive junction speed
        // from the clamped angle.
        assert!(cur.junction_max_v2 > 0.0);
        assert!(cur.junction_max_v2 < 1.0);
    }

    #[test]
    fn limit_speed_lowers_caps_only() {
        let limits = limits(3000.0, 5.0);
        let mut m = kin_move(&limits, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0], 100.0);
        m.limit_speed(50.0, 10000.0, None);
        assert_eq!(m.velocity, 50.0);
        assert_eq!(m.accel, 3000.0);
        assert!((m.min_move_t - 0.2).abs() < 1e-12);
        m.limit_speed(80.0, 1000.0, Some(20000.0));
        assert_eq!(m.velocity, 50.0);
        assert_eq!(m.accel, 1000.0);
        assert_eq!(m.jerk, 20000.0);
    }

    #[test]
    fn smooth_axis_policy_forms_differ() {
        let limits = limits(3000.0, 5.0);
        let prev = kin_move(&limits, [0.0, 0.0, 0.0], [10.0, 0.0, 0.0], 100.0);
        let mut a = kin_move(&limits, [10.0, 0.0, 0.0], [10.0, 10.0, 0.0], 100.0);
        let mut b = a.clone();
        let smooth_t = 0.01;
        a.calc_junction(
            &prev,
            limits.junction_deviation,
            &JunctionPolicy::SmoothAxis {
                smooth_t,
                form: SmoothCornerForm::TanSinMinusOne,
            },
            f64::MAX,
        );
        b.calc_junction(
            &prev,
            limits.junction_deviation,
            &JunctionPolicy::SmoothAxis {
                smooth_t,
                form: SmoothCornerForm::TanSin,
            },
            f64::MAX,
        );
        // tan/sin == sqrt(2) at 90 degrees, so the two forms give
        // (sqrt(2)-1)^2 vs 2 as relative factors.
        assert!(a.junction_max_v2 < b.junction_max_v2);
        let x_a = 0.25 * smooth_t * (2f64.sqrt() - 1.0) * 3000.0;
        assert!((a.junction_max_v2 - x_a * x_a).abs() < 1e-9);
    }
}
