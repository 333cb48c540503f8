use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use glam::DVec3;

use crate::errors::{CommandError, ConfigError};
use crate::limits::MAX_ACCEL_COMPENSATION;
use crate::moves::{JunctionPolicy, SmoothCornerForm};
use crate::params::CommandParams;
use crate::stepgen::{StepperKernel, StepperRef};
use crate::toolhead::Toolhead;
use crate::trapq::TrapQueue;

/// Resonance-cancelling convolution filters. The step generation scan
/// window each one needs is a fixed fraction of the damped spring
/// period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperType {
    Zv,
    Zvd,
    Zvdd,
    Zvddd,
    Ei,
    TwoHumpEi,
}

impl ShaperType {
    pub fn from_name(name: &str) -> Option<ShaperType> {
        match name.to_lowercase().as_str() {
            "zv" => Some(ShaperType::Zv),
            "zvd" => Some(ShaperType::Zvd),
            "zvdd" => Some(ShaperType::Zvdd),
            "zvddd" => Some(ShaperType::Zvddd),
            "ei" => Some(ShaperType::Ei),
            "2hump_ei" => Some(ShaperType::TwoHumpEi),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShaperType::Zv => "zv",
            ShaperType::Zvd => "zvd",
            ShaperType::Zvdd => "zvdd",
            ShaperType::Zvddd => "zvddd",
            ShaperType::Ei => "ei",
            ShaperType::TwoHumpEi => "2hump_ei",
        }
    }

    /// Fraction of the damped spring period the step generator must be
    /// able to scan ahead of (and behind) the commanded time.
    pub fn scan_window_factor(&self) -> f64 {
        match self {
            ShaperType::Zv => 0.25,
            ShaperType::Zvd => 0.5,
            ShaperType::Zvdd => 0.75,
            ShaperType::Zvddd => 1.0,
            ShaperType::Ei => 0.5,
            ShaperType::TwoHumpEi => 0.75,
        }
    }
}

/// One convolution tap: read the trajectory `time_offset` seconds away
/// and weigh it by `amplitude`. Amplitudes sum to one.
#[derive(Debug, Clone, Copy)]
pub struct Impulse {
    pub time_offset: f64,
    pub amplitude: f64,
}

/// Build the impulse train for one axis.
pub fn calc_impulses(shaper_type: ShaperType, damped_period: f64, damping_ratio: f64) -> Vec<Impulse> {
    let df = (1.0 - damping_ratio * damping_ratio).sqrt();
    let k = (-damping_ratio * PI / df).exp();
    let td = damped_period;
    let raw: Vec<(f64, f64)> = match shaper_type {
        ShaperType::Zv => vec![(0.25 * td, 1.0), (-0.25 * td, k)],
        ShaperType::Zvd => vec![(0.5 * td, 1.0), (0.0, 2.0 * k), (-0.5 * td, k * k)],
        ShaperType::Zvdd => vec![
            (0.75 * td, 1.0),
            (0.25 * td, 3.0 * k),
            (-0.25 * td, 3.0 * k * k),
            (-0.75 * td, k * k * k),
        ],
        ShaperType::Zvddd => vec![
            (td, 1.0),
            (0.5 * td, 4.0 * k),
            (0.0, 6.0 * k * k),
            (-0.5 * td, 4.0 * k * k * k),
            (-td, k * k * k * k),
        ],
        ShaperType::Ei => {
            let v_tol = 0.05;
            let a2 = 2.0 * (1.0 - v_tol) / (1.0 + v_tol) * (-PI * damping_ratio).exp();
            let a3 = (-2.0 * PI * damping_ratio).exp();
            vec![(0.5 * td, 1.0), (0.0, a2), (-0.5 * td, a3)]
        }
        ShaperType::TwoHumpEi => {
            // Coefficients calculated for 5% vibration tolerance.
            let d = damping_ratio;
            let t2 = 0.49890 + 0.16270 * d - 0.54262 * d * d + 6.16180 * d * d * d;
            let t3 = 0.99748 + 0.18382 * d - 1.58270 * d * d + 8.17120 * d * d * d;
            let t4 = 1.49920 - 0.09297 * d - 0.28338 * d * d + 1.85710 * d * d * d;
            let a1 = 0.16054 + 0.76699 * d + 2.26560 * d * d - 1.22750 * d * d * d;
            let a2 = 0.33911 + 0.45081 * d - 2.58080 * d * d + 1.73650 * d * d * d;
            let a3 = 0.34089 - 0.61533 * d - 0.68765 * d * d + 0.42261 * d * d * d;
            let a4 = 0.15997 - 0.60246 * d + 1.00280 * d * d - 0.93145 * d * d * d;
            vec![
                (0.75 * td, a1),
                ((0.75 - t2) * td, a2),
                ((0.75 - t3) * td, a3),
                ((0.75 - t4) * td, a4),
            ]
        }
    };
    let total: f64 = raw.iter().map(|(_, a)| a).sum();
    raw.iter()
        .map(|&(time_offset, amplitude)| Impulse {
            time_offset,
            amplitude: amplitude / total,
        })
        .collect()
}

pub fn damped_spring_period(spring_period: f64, damping_ratio: f64) -> f64 {
    spring_period / (1.0 - damping_ratio * damping_ratio).sqrt()
}

#[derive(Debug, Default)]
struct ShaperParams {
    x: Option<Vec<Impulse>>,
    y: Option<Vec<Impulse>>,
}

/// Kernel wrapping a stepper's original kinematics: reads the
/// commanded trajectory at the impulse offsets and feeds the shaped
/// coordinate to the wrapped kernel.
struct ShaperKernel {
    inner: Box<dyn StepperKernel>,
    params: Rc<RefCell<ShaperParams>>,
}

impl ShaperKernel {
    fn convolve(
        impulses: &Option<Vec<Impulse>>,
        trapq: &TrapQueue,
        time: f64,
        axis: usize,
    ) -> Option<f64> {
        impulses.as_ref().map(|imp| {
            imp.iter()
                .map(|i| i.amplitude * trapq.position(time + i.time_offset)[axis])
                .sum()
        })
    }
}

impl StepperKernel for ShaperKernel {
    fn calc_position_from_coord(&self, coord: DVec3) -> f64 {
        self.inner.calc_position_from_coord(coord)
    }

    fn calc_position(&self, trapq: &TrapQueue, time: f64) -> f64 {
        let base = trapq.position(time);
        let params = self.params.borrow();
        let coord = DVec3::new(
            Self::convolve(&params.x, trapq, time, 0).unwrap_or(base.x),
            Self::convolve(&params.y, trapq, time, 1).unwrap_or(base.y),
            base.z,
        );
        self.inner.calc_position_from_coord(coord)
    }
}

/// Input shaper configuration, as read from the printer configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct InputShaperConfig {
    pub damping_ratio_x: f64,
    pub damping_ratio_y: f64,
    pub spring_period_x: f64,
    pub spring_period_y: f64,
    pub shaper_type: String,
}

impl Default for InputShaperConfig {
    fn default() -> Self {
        InputShaperConfig {
            damping_ratio_x: 0.0,
            damping_ratio_y: 0.0,
            spring_period_x: 0.0,
            spring_period_y: 0.0,
            shaper_type: "zvd".into(),
        }
    }
}

/// Kinematic input shaper front-end: wraps every stepper's kernel on
/// connect and keeps the toolhead's scan window in sync with the
/// configured spring periods.
pub struct InputShaper {
    damping_ratio_x: f64,
    damping_ratio_y: f64,
    spring_period_x: f64,
    spring_period_y: f64,
    shaper_type: ShaperType,
    old_delay: f64,
    params: Rc<RefCell<ShaperParams>>,
    attached: Vec<StepperRef>,
}

impl InputShaper {
    pub fn new(config: &InputShaperConfig) -> Result<InputShaper, ConfigError> {
        for (option, v) in [
            ("damping_ratio_x", config.damping_ratio_x),
            ("damping_ratio_y", config.damping_ratio_y),
        ] {
            if !(0.0..1.0).contains(&v) {
                return Err(ConfigError::AboveMaximum { option, limit: 1.0 });
            }
        }
        for (option, v) in [
            ("spring_period_x", config.spring_period_x),
            ("spring_period_y", config.spring_period_y),
        ] {
            if v < 0.0 {
                return Err(ConfigError::BelowMinimum { option, limit: 0.0 });
            }
        }
        let shaper_type =
            ShaperType::from_name(&config.shaper_type).ok_or_else(|| ConfigError::InvalidChoice {
                option: "shaper_type",
                value: config.shaper_type.clone(),
            })?;
        Ok(InputShaper {
            damping_ratio_x: config.damping_ratio_x,
            damping_ratio_y: config.damping_ratio_y,
            spring_period_x: config.spring_period_x,
            spring_period_y: config.spring_period_y,
            shaper_type,
            old_delay: 0.0,
            params: Rc::new(RefCell::new(ShaperParams::default())),
            attached: Vec::new(),
        })
    }

    /// Wrap each stepper's kernel and declare the initial scan window.
    pub fn connect(&mut self, toolhead: &mut Toolhead) {
        for s in toolhead.kin().get_steppers() {
            let orig = s
                .borrow_mut()
                .set_stepper_kinematics(Box::new(NullKernel));
            let wrapped = ShaperKernel {
                inner: orig,
                params: self.params.clone(),
            };
            s.borrow_mut().set_stepper_kinematics(Box::new(wrapped));
            s.borrow_mut().set_trapq(toolhead.get_trapq());
            self.attached.push(s.clone());
        }
        self.apply(
            toolhead,
            self.damping_ratio_x,
            self.damping_ratio_y,
            self.spring_period_x,
            self.spring_period_y,
            self.shaper_type,
        );
    }

    pub fn scan_window(&self) -> f64 {
        self.old_delay
    }

    pub fn attached_steppers(&self) -> &[StepperRef] {
        &self.attached
    }

    fn apply(
        &mut self,
        toolhead: &mut Toolhead,
        damping_ratio_x: f64,
        damping_ratio_y: f64,
        spring_period_x: f64,
        spring_period_y: f64,
        shaper_type: ShaperType,
    ) {
        if shaper_type != self.shaper_type {
            // Past motion must not be re-shaped under the new filter.
            toolhead.flush_step_generation();
        }
        let damped_x = damped_spring_period(spring_period_x, damping_ratio_x);
        let damped_y = damped_spring_period(spring_period_y, damping_ratio_y);
        let new_delay = shaper_type.scan_window_factor() * damped_x.max(damped_y);
        toolhead.note_step_generation_scan_time(new_delay, self.old_delay);
        self.old_delay = new_delay;
        self.damping_ratio_x = damping_ratio_x;
        self.damping_ratio_y = damping_ratio_y;
        self.spring_period_x = spring_period_x;
        self.spring_period_y = spring_period_y;
        self.shaper_type = shaper_type;
        let mut params = self.params.borrow_mut();
        params.x = if spring_period_x > 0.0 {
            Some(calc_impulses(shaper_type, damped_x, damping_ratio_x))
        } else {
            None
        };
        params.y = if spring_period_y > 0.0 {
            Some(calc_impulses(shaper_type, damped_y, damping_ratio_y))
        } else {
            None
        };
        log::info!(
            "input shaper: type={} window={:.6}",
            shaper_type.name(),
            new_delay
        );
    }

    /// SET_INPUT_SHAPER handler. Returns the response message.
    pub fn cmd_set_input_shaper(
        &mut self,
        toolhead: &mut Toolhead,
        params: &CommandParams,
    ) -> Result<String, CommandError> {
        let damping_ratio_x = params.get_float(
            "damping_ratio_x",
            self.damping_ratio_x,
            None,
            Some(0.0),
            Some(1.0),
        )?;
        let damping_ratio_y = params.get_float(
            "damping_ratio_y",
            self.damping_ratio_y,
            None,
            Some(0.0),
            Some(1.0),
        )?;
        let spring_period_x = params.get_float(
            "spring_period_x",
            self.spring_period_x,
            None,
            Some(0.0),
            None,
        )?;
        let spring_period_y = params.get_float(
            "spring_period_y",
            self.spring_period_y,
            None,
            Some(0.0),
            None,
        )?;
        // A bare SPRING_PERIOD / DAMPING_RATIO applies to both axes.
        let spring_period_x =
            params.get_float("spring_period", spring_period_x, None, Some(0.0), None)?;
        let spring_period_y =
            params.get_float("spring_period", spring_period_y, None, Some(0.0), None)?;
        let damping_ratio_x = params.get_float(
            "damping_ratio",
            damping_ratio_x,
            None,
            Some(0.0),
            Some(1.0),
        )?;
        let damping_ratio_y = params.get_float(
            "damping_ratio",
            damping_ratio_y,
            None,
            Some(0.0),
            Some(1.0),
        )?;
        let shaper_type = match params.get_string("type") {
            Some(name) => ShaperType::from_name(name)
                .ok_or_else(|| CommandError::InvalidChoice(name.to_string()))?,
            None => self.shaper_type,
        };
        self.apply(
            toolhead,
            damping_ratio_x,
            damping_ratio_y,
            spring_period_x,
            spring_period_y,
            shaper_type,
        );
        Ok(format!(
            "damping_ratio_x:{:.9} damping_ratio_y:{:.9} spring_period_x:{:.9} \
             spring_period_y:{:.9} shaper_type: {}",
            self.damping_ratio_x,
            self.damping_ratio_y,
            self.spring_period_x,
            self.spring_period_y,
            self.shaper_type.name()
        ))
    }
}

struct NullKernel;

impl StepperKernel for NullKernel {
    fn calc_position_from_coord(&self, _coord: DVec3) -> f64 {
        0.0
    }
}

#[derive(Debug, Default)]
struct SmoothParams {
    smooth_x: f64,
    smooth_y: f64,
}

/// Kernel applying a time average over the smoothing window to the X
/// and Y trajectory (Simpson's rule over the window endpoints and
/// midpoint).
struct SmoothKernel {
    inner: Box<dyn StepperKernel>,
    params: Rc<RefCell<SmoothParams>>,
}

impl SmoothKernel {
    fn smooth(trapq: &TrapQueue, time: f64, smooth_t: f64, axis: usize) -> f64 {
        if smooth_t <= 0.0 {
            return trapq.position(time)[axis];
        }
        let h = 0.5 * smooth_t;
        (trapq.position(time - h)[axis]
            + 4.0 * trapq.position(time)[axis]
            + trapq.position(time + h)[axis])
            / 6.0
    }
}

impl StepperKernel for SmoothKernel {
    fn calc_position_from_coord(&self, coord: DVec3) -> f64 {
        self.inner.calc_position_from_coord(coord)
    }

    fn calc_position(&self, trapq: &TrapQueue, time: f64) -> f64 {
        let params = self.params.borrow();
        let coord = DVec3::new(
            Self::smooth(trapq, time, params.smooth_x, 0),
            Self::smooth(trapq, time, params.smooth_y, 1),
            trapq.position(time).z,
        );
        self.inner.calc_position_from_coord(coord)
    }
}

/// Default smoothing time from the corner velocity settings.
pub fn calc_smooth_t(square_corner_velocity: f64, max_accel: f64) -> f64 {
    8f64.sqrt() * square_corner_velocity / max_accel
}

/// Positional smoother on the cartesian XY axes. Declares half the
/// smoothing window as its scan window and swaps the toolhead's
/// junction policy for the smoothing-aware one.
pub struct SmoothAxis {
    accel_comp_x: f64,
    accel_comp_y: f64,
    corner_form: SmoothCornerForm,
    smooth_t: f64,
    params: Rc<RefCell<SmoothParams>>,
    attached: Vec<StepperRef>,
}

impl SmoothAxis {
    pub fn new(corner_form: SmoothCornerForm) -> SmoothAxis {
        SmoothAxis {
            accel_comp_x: 0.0,
            accel_comp_y: 0.0,
            corner_form,
            smooth_t: 0.0,
            params: Rc::new(RefCell::new(SmoothParams::default())),
            attached: Vec::new(),
        }
    }

    pub fn connect(&mut self, toolhead: &mut Toolhead) {
        for s in toolhead.kin().get_steppers() {
            let orig = s
                .borrow_mut()
                .set_stepper_kinematics(Box::new(NullKernel));
            let wrapped = SmoothKernel {
                inner: orig,
                params: self.params.clone(),
            };
            s.borrow_mut().set_stepper_kinematics(Box::new(wrapped));
            s.borrow_mut().set_trapq(toolhead.get_trapq());
            self.attached.push(s.clone());
        }
        let smooth_t = calc_smooth_t(
            toolhead.limits().square_corner_velocity,
            toolhead.limits().max_accel,
        );
        self.set_smooth_time(toolhead, smooth_t, smooth_t);
    }

    pub fn smooth_t(&self) -> f64 {
        self.smooth_t
    }

    pub fn attached_steppers(&self) -> &[StepperRef] {
        &self.attached
    }

    fn set_smooth_time(&mut self, toolhead: &mut Toolhead, smooth_x: f64, smooth_y: f64) {
        let old_smooth_time = self.smooth_t * 0.5;
        let smooth_t = smooth_x.max(smooth_y);
        toolhead.note_step_generation_scan_time(smooth_t * 0.5, old_smooth_time);
        self.smooth_t = smooth_t;
        toolhead.set_junction_policy(JunctionPolicy::SmoothAxis {
            smooth_t,
            form: self.corner_form,
        });
        let mut params = self.params.borrow_mut();
        params.smooth_x = smooth_x;
        params.smooth_y = smooth_y;
    }

    /// SET_SMOOTH_AXIS handler: per-axis acceleration compensation,
    /// converted to the equivalent smoothing window.
    pub fn cmd_set_smooth_axis(
        &mut self,
        toolhead: &mut Toolhead,
        params: &CommandParams,
    ) -> Result<String, CommandError> {
        self.accel_comp_x = params.get_float(
            "accel_comp_x",
            self.accel_comp_x,
            None,
            Some(0.0),
            Some(MAX_ACCEL_COMPENSATION),
        )?;
        self.accel_comp_y = params.get_float(
            "accel_comp_y",
            self.accel_comp_y,
            None,
            Some(0.0),
            Some(MAX_ACCEL_COMPENSATION),
        )?;
        // A uniform window of length T shifts positions by
        // accel * T^2 / 24, so the window matching a compensation c is
        // sqrt(24 c).
        let smooth_x = (24.0 * self.accel_comp_x).sqrt();
        let smooth_y = (24.0 * self.accel_comp_y).sqrt();
        self.set_smooth_time(toolhead, smooth_x, smooth_y);
        Ok(format!(
            "accel_comp_x:{:.6} accel_comp_y:{:.6} smooth_t:{:.6}",
            self.accel_comp_x, self.accel_comp_y, self.smooth_t
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CommandParams;
    use crate::toolhead::tests::build_toolhead;
    use crate::toolhead::ToolheadConfig;
    use glam::DVec4;

    fn shaper_config() -> InputShaperConfig {
        InputShaperConfig {
            damping_ratio_x: 0.1,
            damping_ratio_y: 0.1,
            spring_period_x: 0.04,
            spring_period_y: 0.04,
            shaper_type: "zvd".into(),
        }
    }

    #[test]
    fn connect_declares_scan_window_and_keeps_positions() {
        let (mut toolhead, _, _) = build_toolhead(ToolheadConfig::default(), false);
        assert_eq!(toolhead.kin_flush_delay(), 0.0);
        let mut shaper = InputShaper::new(&shaper_config()).unwrap();
        shaper.connect(&mut toolhead);
        // ZVD with a 0.04s spring period at 0.1 damping needs half the
        // damped period of future trajectory.
        let expected = 0.5 * damped_spring_period(0.04, 0.1);
        assert!((toolhead.kin_flush_delay() - expected).abs() < 1e-12);
        assert!((expected - 0.0201).abs() < 1e-4);
        assert_eq!(shaper.attached_steppers().len(), 3);
        // Shaped step generation still lands on the commanded target.
        toolhead
            .move_to(DVec4::new(20.0, 0.0, 0.0, 0.0), 50.0)
            .unwrap();
        toolhead.wait_moves();
        let steppers = toolhead.kin().get_steppers();
        assert!((steppers[0].borrow().get_commanded_position() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn set_input_shaper_command_swaps_the_window() {
        let (mut toolhead, _, _) = build_toolhead(ToolheadConfig::default(), false);
        let mut shaper = InputShaper::new(&shaper_config()).unwrap();
        shaper.connect(&mut toolhead);
        let params = CommandParams::from_pairs(vec![("type", "zv")]);
        let msg = shaper.cmd_set_input_shaper(&mut toolhead, &params).unwrap();
        assert!(msg.contains("shaper_type: zv"));
        let expected = 0.25 * damped_spring_period(0.04, 0.1);
        assert!((toolhead.kin_flush_delay() - expected).abs() < 1e-12);
        // The replaced window is fully forgotten.
        assert!((shaper.scan_window() - expected).abs() < 1e-12);
    }

    #[test]
    fn smooth_axis_swaps_junction_policy_and_window() {
        let (mut toolhead, _, _) = build_toolhead(ToolheadConfig::default(), false);
        let mut smooth = SmoothAxis::new(SmoothCornerForm::TanSinMinusOne);
        smooth.connect(&mut toolhead);
        let expected_t = calc_smooth_t(
            toolhead.limits().square_corner_velocity,
            toolhead.limits().max_accel,
        );
        assert!((smooth.smooth_t() - expected_t).abs() < 1e-12);
        assert!((toolhead.kin_flush_delay() - expected_t * 0.5).abs() < 1e-12);
        assert!(matches!(
            toolhead.junction_policy(),
            JunctionPolicy::SmoothAxis { .. }
        ));
        // Changing the compensation re-derives the window.
        let params = CommandParams::from_pairs(vec![("accel_comp_x", "0.001")]);
        smooth.cmd_set_smooth_axis(&mut toolhead, &params).unwrap();
        let smooth_x = (24.0f64 * 0.001).sqrt();
        assert!((smooth.smooth_t() - smooth_x).abs() < 1e-12);
        assert!((toolhead.kin_flush_delay() - smooth_x * 0.5).abs() < 1e-12);
        let params = CommandParams::from_pairs(vec![("accel_comp_x", "0.1")]);
        assert!(smooth.cmd_set_smooth_axis(&mut toolhead, &params).is_err());
    }

    #[test]
    fn impulse_amplitudes_are_normalized() {
        for shaper_type in [
            ShaperType::Zv,
            ShaperType::Zvd,
            ShaperType::Zvdd,
            ShaperType::Zvddd,
            ShaperType::Ei,
            ShaperType::TwoHumpEi,
        ] {
            let imp = calc_impulses(shaper_type, 0.04, 0.1);
            let total: f64 = imp.iter().map(|i| i.amplitude).sum();
            assert!((total - 1.0).abs() < 1e-9, "{:?}", shaper_type);
            // No impulse reads further ahead than the declared window.
            let max_offset = imp
                .iter()
                .map(|i| i.time_offset)
                .fold(f64::MIN, f64::max);
            assert!(max_offset <= shaper_type.scan_window_factor() * 0.04 + 1e-9);
        }
    }

    #[test]
    fn damped_period_grows_with_damping() {
        let d = damped_spring_period(0.04, 0.1);
        assert!((d - 0.04 / 0.99f64.sqrt()).abs() < 1e-12);
        assert!(d > 0.04);
    }

    #[test]
    fn zvd_window_matches_half_damped_period() {
        // SET_INPUT_SHAPER TYPE=ZVD SPRING_PERIOD=0.04 DAMPING_RATIO=0.1
        let damped = damped_spring_period(0.04, 0.1);
        let window = ShaperType::Zvd.scan_window_factor() * damped;
        assert!((window - 0.0201).abs() < 1e-4);
    }

    #[test]
    fn shaper_names_round_trip() {
        for name in ["zv", "zvd", "zvdd", "zvddd", "ei", "2hump_ei"] {
            assert_eq!(ShaperType::from_name(name).unwrap().name(), name);
        }
        assert!(ShaperType::from_name("mzv").is_none());
    }

    #[test]
    fn smooth_t_default_from_corner_velocity() {
        let t = calc_smooth_t(5.0, 3000.0);
        assert!((t - 8f64.sqrt() * 5.0 / 3000.0).abs() < 1e-12);
    }
}
