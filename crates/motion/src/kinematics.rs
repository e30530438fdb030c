//! Kinematics contract and the bundled implementations.
//!
//! A kinematics implementation translates between tool space and joint
//! (stepper) space. The planner only ever sees this trait: it borrows an
//! implementation for the duration of a planning pass and owns nothing.

use crate::errors::MotionError;
use crate::planner::Move;
use crate::Pos;

/// Declared travel and acceleration limits of one tool-space axis.
#[derive(Debug, Clone, Copy)]
pub struct AxisLimits {
    pub position_min: f64,
    pub position_max: f64,
    pub max_accel: f64,
}

/// A closed-form stepper trajectory for one move.
///
/// `step_at` is the continuous stepper position in steps, monotonic over
/// `0..=duration()`. The derivative accessors exist so step compression can
/// seed its interval search from the endpoint speeds.
pub trait StepCurve: Send {
    /// Continuous step index at `t` seconds into the move.
    fn step_at(&self, t: f64) -> f64;
    /// First derivative, steps per second.
    fn rate_at(&self, t: f64) -> f64;
    /// Second derivative, steps per second squared.
    fn accel_at(&self, t: f64) -> f64;
    /// The move's time span.
    fn duration(&self) -> f64;
}

/// One stepper's share of a move.
pub struct StepperContribution {
    /// Index into the toolhead's stepper list.
    pub stepper: usize,
    pub curve: Box<dyn StepCurve>,
}

/// The abstract contract a kinematics plug-in presents to the planner.
pub trait Kinematics: Send {
    /// Number of tool-space axes this model constrains (excludes the
    /// extruder, which the toolhead handles directly).
    fn axis_count(&self) -> usize;

    /// Travel and acceleration limits per tool-space axis.
    fn limits(&self) -> &[AxisLimits];

    /// Tool position for a set of joint (stepper) positions, in mm.
    fn forward(&self, joints: &[f64]) -> Pos;

    /// Joint positions for a tool position; fails when the position has no
    /// solution under this geometry.
    fn inverse(&self, tool: &Pos) -> Result<Vec<f64>, MotionError>;

    /// The per-stepper trajectories realizing `mv`.
    fn steps_for(&self, mv: &Move) -> Vec<StepperContribution>;
}

/// A stepper trajectory that is a fixed linear map of move displacement.
/// Covers every geometry whose joint positions are linear in tool position
/// (cartesian, corexy); nonlinear geometries implement [`StepCurve`]
/// themselves.
pub struct LinearStepCurve {
    mv: Move,
    start_steps: f64,
    /// Signed steps per mm of travel along the move.
    steps_per_mm: f64,
}

impl LinearStepCurve {
    pub fn new(mv: &Move, start_steps: f64, steps_per_mm: f64) -> Self {
        LinearStepCurve {
            mv: *mv,
            start_steps,
            steps_per_mm,
        }
    }
}

impl StepCurve for LinearStepCurve {
    fn step_at(&self, t: f64) -> f64 {
        self.start_steps + self.steps_per_mm * self.mv.displacement_at(t)
    }

    fn rate_at(&self, t: f64) -> f64 {
        self.steps_per_mm * self.mv.velocity_at(t)
    }

    fn accel_at(&self, t: f64) -> f64 {
        // The trapezoid's acceleration is piecewise constant.
        let t_a = self.mv.accel_time();
        let t_c = self.mv.cruise_time();
        if t < t_a {
            self.steps_per_mm * self.mv.acceleration
        } else if t < t_a + t_c {
            0.0
        } else {
            -self.steps_per_mm * self.mv.acceleration
        }
    }

    fn duration(&self) -> f64 {
        self.mv.total_time()
    }
}

// --- Cartesian ---

/// Standard Cartesian geometry: steppers 0..3 map directly to x, y, z.
#[derive(Debug, Clone)]
pub struct CartesianKinematics {
    steps_per_mm: [f64; 3],
    limits: Vec<AxisLimits>,
}

impl CartesianKinematics {
    pub fn new(steps_per_mm: [f64; 3], limits: Vec<AxisLimits>) -> Self {
        assert_eq!(limits.len(), 3);
        CartesianKinematics {
            steps_per_mm,
            limits,
        }
    }
}

impl Kinematics for CartesianKinematics {
    fn axis_count(&self) -> usize {
        3
    }

    fn limits(&self) -> &[AxisLimits] {
        &self.limits
    }

    fn forward(&self, joints: &[f64]) -> Pos {
        [joints[0], joints[1], joints[2], 0.0]
    }

    fn inverse(&self, tool: &Pos) -> Result<Vec<f64>, MotionError> {
        Ok(vec![tool[0], tool[1], tool[2]])
    }

    fn steps_for(&self, mv: &Move) -> Vec<StepperContribution> {
        (0..3)
            .filter(|&axis| mv.rate[axis] != 0.0)
            .map(|axis| StepperContribution {
                stepper: axis,
                curve: Box::new(LinearStepCurve::new(
                    mv,
                    mv.start[axis] * self.steps_per_mm[axis],
                    mv.rate[axis] * self.steps_per_mm[axis],
                )),
            })
            .collect()
    }
}

// --- CoreXY ---

/// CoreXY geometry: steppers a/b drive x+y and x−y, z is independent.
#[derive(Debug, Clone)]
pub struct CoreXyKinematics {
    steps_per_mm: [f64; 3], // a, b, z
    limits: Vec<AxisLimits>,
}

impl CoreXyKinematics {
    pub fn new(steps_per_mm: [f64; 3], limits: Vec<AxisLimits>) -> Self {
        assert_eq!(limits.len(), 3);
        CoreXyKinematics {
            steps_per_mm,
            limits,
        }
    }
}

impl Kinematics for CoreXyKinematics {
    fn axis_count(&self) -> usize {
        3
    }

    fn limits(&self) -> &[AxisLimits] {
        &self.limits
    }

    fn forward(&self, joints: &[f64]) -> Pos {
        [
            0.5 * (joints[0] + joints[1]),
            0.5 * (joints[0] - joints[1]),
            joints[2],
            0.0,
        ]
    }

    fn inverse(&self, tool: &Pos) -> Result<Vec<f64>, MotionError> {
        Ok(vec![tool[0] + tool[1], tool[0] - tool[1], tool[2]])
    }

    fn steps_for(&self, mv: &Move) -> Vec<StepperContribution> {
        let joint_rates = [
            mv.rate[0] + mv.rate[1],
            mv.rate[0] - mv.rate[1],
            mv.rate[2],
        ];
        let joint_starts = [
            mv.start[0] + mv.start[1],
            mv.start[0] - mv.start[1],
            mv.start[2],
        ];
        (0..3)
            .filter(|&joint| joint_rates[joint] != 0.0)
            .map(|joint| StepperContribution {
                stepper: joint,
                curve: Box::new(LinearStepCurve::new(
                    mv,
                    joint_starts[joint] * self.steps_per_mm[joint],
                    joint_rates[joint] * self.steps_per_mm[joint],
                )),
            })
            .collect()
    }
}
