//! The toolhead: move intake, limit checks, and stepper ownership.
//!
//! The toolhead is the single entry point for motion. It validates each
//! request, applies the machine's velocity/acceleration limits and the
//! kinematics' per-axis bounds, and feeds the look-ahead queue. It owns the
//! steppers outright; kinematics implementations are borrowed per call and
//! never hold state between passes.

use crate::errors::MotionError;
use crate::kinematics::{Kinematics, LinearStepCurve, StepperContribution};
use crate::planner::{LookAheadQueue, Move, MoveLimits};
use crate::stepcompress::StepCompress;
use crate::{Pos, AXES};

/// Queue length that forces a full flush regardless of peak detection.
const FORCE_FLUSH_MOVES: usize = 128;
/// Buffered-time estimate (seconds) that forces a full flush.
const FORCE_FLUSH_TIME: f64 = 2.0;

/// One physical stepper motor.
#[derive(Debug)]
pub struct Stepper {
    pub name: String,
    /// Millimeters of carriage travel per full step; sign encodes the
    /// motor's wiring direction.
    pub step_distance: f64,
    /// Index of the session whose MCU drives this motor.
    pub mcu: usize,
    /// Object handle minted by that MCU during configuration.
    pub oid: u8,
    /// Commanded position in steps.
    pub position: i64,
    /// Last commanded step direction.
    pub dir: bool,
    /// Pending compressed step queue.
    pub compress: StepCompress,
}

impl Stepper {
    pub fn new(name: &str, step_distance: f64, mcu: usize, max_error_ticks: u32) -> Self {
        Stepper {
            name: name.to_string(),
            step_distance,
            mcu,
            oid: 0,
            position: 0,
            dir: true,
            compress: StepCompress::new(max_error_ticks),
        }
    }
}

/// Intake state: a toolhead that hit a bounds error refuses further moves
/// until an operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntakeState {
    Ready,
    Drained,
}

/// The toolhead assembly: limits, look-ahead queue, and steppers.
pub struct Toolhead {
    limits: MoveLimits,
    queue: LookAheadQueue,
    commanded_pos: Pos,
    steppers: Vec<Stepper>,
    state: IntakeState,
    /// Absolute start time of the next finalized move.
    print_time: f64,
}

impl Toolhead {
    pub fn new(limits: MoveLimits, steppers: Vec<Stepper>) -> Self {
        Toolhead {
            limits,
            queue: LookAheadQueue::new(),
            commanded_pos: [0.0; AXES],
            steppers,
            state: IntakeState::Ready,
            print_time: 0.0,
        }
    }

    pub fn limits(&self) -> &MoveLimits {
        &self.limits
    }

    pub fn position(&self) -> Pos {
        self.commanded_pos
    }

    pub fn steppers(&self) -> &[Stepper] {
        &self.steppers
    }

    pub fn steppers_mut(&mut self) -> &mut [Stepper] {
        &mut self.steppers
    }

    pub fn pending_moves(&self) -> usize {
        self.queue.len()
    }

    /// Absolute time at which the next finalized move will start.
    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    /// Re-bases the motion timeline; only legal while nothing is queued.
    pub fn set_print_time(&mut self, t: f64) {
        debug_assert!(self.queue.is_empty());
        self.print_time = t;
    }

    /// Accepts one move request in tool coordinates.
    ///
    /// On success the move is queued but not finalized; call
    /// [`Self::pull_moves`] or [`Self::flush`] to obtain finalized moves.
    /// Bounds violations drain the queue and latch the toolhead until
    /// [`Self::reset`].
    pub fn move_to(
        &mut self,
        kin: &dyn Kinematics,
        end: Pos,
        speed: f64,
    ) -> Result<(), MotionError> {
        if self.state == IntakeState::Drained {
            return Err(MotionError::InvalidMove(
                "toolhead drained; reset required".into(),
            ));
        }
        if end.iter().any(|v| !v.is_finite()) || !speed.is_finite() {
            return Err(MotionError::InvalidMove("non-finite move request".into()));
        }

        let mv = Move::new(self.commanded_pos, end, speed, &self.limits);
        if mv.distance == 0.0 {
            // Nothing to do; not an error.
            return Ok(());
        }
        if speed <= 0.0 {
            return Err(MotionError::InvalidMove(format!(
                "speed {speed} must be positive"
            )));
        }

        if mv.is_kinematic_move() {
            self.check_bounds(kin, &end)?;
        }
        let mv = self.apply_axis_limits(kin, mv);

        self.queue.add_move(mv, &self.limits);
        self.commanded_pos = end;
        Ok(())
    }

    /// Rejecting a target outside the declared travel drains all pending
    /// moves: their positions may depend on state the failed move was
    /// supposed to establish.
    fn check_bounds(&mut self, kin: &dyn Kinematics, end: &Pos) -> Result<(), MotionError> {
        if let Err(e) = kin.inverse(end) {
            self.drain();
            return Err(e);
        }
        for (axis, limit) in kin.limits().iter().enumerate() {
            let position = end[axis];
            if position < limit.position_min || position > limit.position_max {
                self.drain();
                return Err(MotionError::OutOfBounds {
                    axis,
                    position,
                    min: limit.position_min,
                    max: limit.position_max,
                });
            }
        }
        Ok(())
    }

    /// Projects each axis's acceleration limit onto the move direction.
    fn apply_axis_limits(&self, kin: &dyn Kinematics, mut mv: Move) -> Move {
        for (axis, limit) in kin.limits().iter().enumerate() {
            let component = mv.rate[axis].abs();
            if component > 0.0 {
                mv.limit_speed(f64::INFINITY, limit.max_accel / component);
            }
        }
        mv
    }

    /// Pulls finalized moves, stamped with absolute start times.
    ///
    /// Finalization is lazy: moves come out only once their velocities are
    /// final, unless the queue has grown past its size or buffered-time
    /// threshold, in which case everything pending is finalized to bound
    /// planner latency.
    pub fn pull_moves(&mut self) -> Vec<Move> {
        if self.queue.len() >= FORCE_FLUSH_MOVES || self.queue.pending_time() >= FORCE_FLUSH_TIME {
            self.queue.flush();
        }
        self.collect_finalized()
    }

    /// Finalizes and returns everything pending.
    pub fn flush(&mut self) -> Vec<Move> {
        self.queue.flush();
        self.collect_finalized()
    }

    fn collect_finalized(&mut self) -> Vec<Move> {
        let mut out = Vec::new();
        while let Some(mut mv) = self.queue.next_move() {
            mv.print_time = self.print_time;
            self.print_time += mv.total_time();
            out.push(mv);
        }
        out
    }

    /// The stepper trajectories realizing one finalized move: the
    /// kinematics' joint contributions plus the extruder's, which is linear
    /// in move displacement and independent of geometry.
    pub fn contributions(&self, kin: &dyn Kinematics, mv: &Move) -> Vec<StepperContribution> {
        let mut out = kin.steps_for(mv);
        let extruder = kin.axis_count();
        if mv.rate[3] != 0.0 && extruder < self.steppers.len() {
            let steps_per_mm = 1.0 / self.steppers[extruder].step_distance;
            out.push(StepperContribution {
                stepper: extruder,
                curve: Box::new(LinearStepCurve::new(
                    mv,
                    mv.start[3] * steps_per_mm,
                    mv.rate[3] * steps_per_mm,
                )),
            });
        }
        out
    }

    /// Discards all pending moves and latches the intake shut.
    pub fn drain(&mut self) {
        self.queue.clear();
        self.state = IntakeState::Drained;
    }

    pub fn is_drained(&self) -> bool {
        self.state == IntakeState::Drained
    }

    /// Operator reset after a drain: re-establishes the commanded position.
    pub fn reset(&mut self, position: Pos) {
        self.queue.clear();
        self.commanded_pos = position;
        self.state = IntakeState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{AxisLimits, CartesianKinematics};

    fn kin() -> CartesianKinematics {
        CartesianKinematics::new(
            [80.0, 80.0, 400.0],
            vec![
                AxisLimits {
                    position_min: 0.0,
                    position_max: 200.0,
                    max_accel: 3000.0,
                },
                AxisLimits {
                    position_min: 0.0,
                    position_max: 200.0,
                    max_accel: 3000.0,
                },
                AxisLimits {
                    position_min: 0.0,
                    position_max: 180.0,
                    max_accel: 100.0,
                },
            ],
        )
    }

    fn toolhead() -> Toolhead {
        let steppers = vec![
            Stepper::new("stepper_x", 0.0125, 0, 400),
            Stepper::new("stepper_y", 0.0125, 0, 400),
            Stepper::new("stepper_z", 0.0025, 0, 400),
            Stepper::new("extruder", 0.002, 0, 400),
        ];
        Toolhead::new(MoveLimits::new(300.0, 3000.0), steppers)
    }

    #[test]
    fn rejects_nan_requests_without_touching_queue() {
        let mut th = toolhead();
        let err = th
            .move_to(&kin(), [f64::NAN, 0.0, 0.0, 0.0], 100.0)
            .unwrap_err();
        assert!(matches!(err, MotionError::InvalidMove(_)));
        assert_eq!(th.pending_moves(), 0);
        // Queue still usable.
        th.move_to(&kin(), [10.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        assert_eq!(th.pending_moves(), 1);
    }

    #[test]
    fn rejects_zero_speed_with_travel() {
        let mut th = toolhead();
        let err = th.move_to(&kin(), [10.0, 0.0, 0.0, 0.0], 0.0).unwrap_err();
        assert!(matches!(err, MotionError::InvalidMove(_)));
    }

    #[test]
    fn out_of_bounds_drains_and_latches() {
        let mut th = toolhead();
        th.move_to(&kin(), [10.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        let err = th
            .move_to(&kin(), [10.0, 500.0, 0.0, 0.0], 100.0)
            .unwrap_err();
        assert!(matches!(err, MotionError::OutOfBounds { axis: 1, .. }));
        assert_eq!(th.pending_moves(), 0);
        // Further moves rejected until reset.
        assert!(th.move_to(&kin(), [5.0, 0.0, 0.0, 0.0], 50.0).is_err());
        th.reset([0.0; 4]);
        th.move_to(&kin(), [5.0, 0.0, 0.0, 0.0], 50.0).unwrap();
    }

    #[test]
    fn finalized_moves_carry_contiguous_times() {
        let mut th = toolhead();
        let k = kin();
        th.move_to(&k, [20.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        th.move_to(&k, [40.0, 0.0, 0.0, 0.0], 100.0).unwrap();
        th.move_to(&k, [40.0, 20.0, 0.0, 0.0], 100.0).unwrap();
        let moves = th.flush();
        assert_eq!(moves.len(), 3);
        let mut expected = 0.0;
        for m in &moves {
            assert!((m.print_time - expected).abs() < 1e-12);
            expected += m.total_time();
        }
        assert!((th.print_time() - expected).abs() < 1e-12);
    }

    #[test]
    fn z_acceleration_projects_onto_move_direction() {
        let mut th = toolhead();
        let k = kin();
        // Pure z move: acceleration capped by the z axis's 100 mm/s².
        th.move_to(&k, [0.0, 0.0, 10.0, 0.0], 50.0).unwrap();
        let moves = th.flush();
        assert!((moves[0].acceleration - 100.0).abs() < 1e-9);
    }

    #[test]
    fn extruder_contribution_is_included() {
        let mut th = toolhead();
        let k = kin();
        th.move_to(&k, [10.0, 0.0, 0.0, 1.0], 60.0).unwrap();
        let moves = th.flush();
        let contributions = th.contributions(&k, &moves[0]);
        // x plus extruder.
        assert_eq!(contributions.len(), 2);
        assert!(contributions.iter().any(|c| c.stepper == 3));
    }
}
