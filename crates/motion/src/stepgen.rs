//! Ideal step time generation.
//!
//! Inverts a move's continuous stepper trajectory: given `step_at(t)` from a
//! [`StepCurve`], finds the times at which the motor must physically step.
//! A step fires when the continuous position crosses half a step past the
//! last commanded position, which centers each commanded step on the ideal
//! trajectory.
//!
//! The inversion uses a bracketed secant search with bisection fallback.
//! The curves are piecewise quadratics, so the secant step converges in a
//! handful of iterations, and the bracket keeps pathological profiles from
//! diverging.

use crate::kinematics::StepCurve;

/// Convergence bound on the position residual, in steps.
const POS_EPSILON: f64 = 1e-9;
/// Convergence bound on the time bracket, in seconds.
const TIME_EPSILON: f64 = 1e-12;

/// One ideal step: the absolute time it must fire and its direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedStep {
    pub time: f64,
    /// `true` steps toward increasing stepper position.
    pub dir: bool,
}

/// Per-stepper step generation state, persistent across moves.
#[derive(Debug)]
pub struct StepGenerator {
    /// Continuous stepper coordinate of the last commanded step, in steps.
    position: f64,
}

impl StepGenerator {
    pub fn new(start_steps: f64) -> Self {
        StepGenerator {
            position: start_steps,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Re-seats the generator after homing or an operator reset.
    pub fn set_position(&mut self, steps: f64) {
        self.position = steps;
    }

    /// Appends the ideal steps for one move's contribution to `out`.
    ///
    /// `base_time` is the move's absolute start time; emitted step times are
    /// absolute. The curve must be monotonic over its span, which the
    /// kinematics contract guarantees; a curve that travels less than half a
    /// step emits nothing and leaves the generator ready for the next move.
    pub fn generate(&mut self, curve: &dyn StepCurve, base_time: f64, out: &mut Vec<PlannedStep>) {
        let duration = curve.duration();
        let end_pos = curve.step_at(duration);
        let dir = end_pos >= self.position;
        let sign = if dir { 1.0 } else { -1.0 };

        let mut lo_t = 0.0;
        let mut lo_pos = curve.step_at(0.0);
        loop {
            let target = self.position + sign * 0.5;
            // No more crossings in this move.
            if sign * (end_pos - target) < 0.0 {
                break;
            }
            let t = solve_crossing(curve, target, sign, lo_t, lo_pos, duration);
            out.push(PlannedStep {
                time: base_time + t,
                dir,
            });
            self.position += sign;
            lo_t = t;
            lo_pos = target;
        }
    }
}

/// Finds `t` in `[lo_t, duration]` with `step_at(t) == target`.
///
/// `sign` orients the curve so the residual is increasing; `lo_pos` is the
/// known position at `lo_t`, strictly before the crossing.
fn solve_crossing(
    curve: &dyn StepCurve,
    target: f64,
    sign: f64,
    lo_t: f64,
    lo_pos: f64,
    duration: f64,
) -> f64 {
    let mut a_t = lo_t;
    let mut a_res = sign * (lo_pos - target); // <= 0
    let mut b_t = duration;
    let mut b_res = sign * (curve.step_at(duration) - target); // >= 0

    loop {
        if b_t - a_t <= TIME_EPSILON {
            return b_t;
        }
        // Secant guess from the bracket endpoints; fall back to bisection
        // when the guess escapes or the bracket is degenerate.
        let mut t = if b_res > a_res {
            a_t - a_res * (b_t - a_t) / (b_res - a_res)
        } else {
            0.5 * (a_t + b_t)
        };
        if !(t > a_t && t < b_t) {
            t = 0.5 * (a_t + b_t);
        }
        let res = sign * (curve.step_at(t) - target);
        if res.abs() <= POS_EPSILON {
            return t;
        }
        if res < 0.0 {
            a_t = t;
            a_res = res;
        } else {
            b_t = t;
            b_res = res;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::LinearStepCurve;
    use crate::planner::{LookAheadQueue, Move, MoveLimits};

    fn planned(distance: f64, speed: f64, accel: f64) -> Move {
        let mut limits = MoveLimits::new(speed, accel);
        limits.max_accel_to_decel = accel;
        let mut q = LookAheadQueue::new();
        q.add_move(
            Move::new([0.0; 4], [distance, 0.0, 0.0, 0.0], speed, &limits),
            &limits,
        );
        q.flush();
        q.next_move().unwrap()
    }

    #[test]
    fn cruise_phase_steps_are_uniform() {
        // 25 mm/s at 100 steps/mm: 2500 steps/s through the cruise phase.
        let mv = planned(100.0, 25.0, 100_000.0);
        let curve = LinearStepCurve::new(&mv, 0.0, 100.0);
        let mut gen = StepGenerator::new(0.0);
        let mut steps = Vec::new();
        gen.generate(&curve, 0.0, &mut steps);
        assert_eq!(steps.len(), 10_000);

        // Intervals deep inside the cruise phase are 1/2500 s.
        let mid = &steps[4000..6000];
        for pair in mid.windows(2) {
            let dt = pair[1].time - pair[0].time;
            assert!((dt - 4e-4).abs() < 1e-7, "cruise interval {dt}");
        }
    }

    #[test]
    fn step_times_are_strictly_increasing_through_accel() {
        let mv = planned(50.0, 200.0, 2000.0);
        let curve = LinearStepCurve::new(&mv, 0.0, 80.0);
        let mut gen = StepGenerator::new(0.0);
        let mut steps = Vec::new();
        gen.generate(&curve, 10.0, &mut steps);
        assert_eq!(steps.len(), 4000);
        for pair in steps.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
        // During acceleration the intervals shrink.
        assert!(steps[1].time - steps[0].time > steps[100].time - steps[99].time);
    }

    #[test]
    fn reverse_travel_steps_negative() {
        let limits = MoveLimits::new(100.0, 1000.0);
        let mut q = LookAheadQueue::new();
        q.add_move(
            Move::new(
                [10.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                50.0,
                &limits,
            ),
            &limits,
        );
        q.flush();
        let mv = q.next_move().unwrap();
        let curve = LinearStepCurve::new(&mv, 10.0 * 80.0, -80.0);
        let mut gen = StepGenerator::new(800.0);
        let mut steps = Vec::new();
        gen.generate(&curve, 0.0, &mut steps);
        assert_eq!(steps.len(), 800);
        assert!(steps.iter().all(|s| !s.dir));
        assert!((gen.position() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn generator_state_spans_moves() {
        // Two consecutive 1 mm moves at 10 steps/mm: 10 steps each, and the
        // half-step boundary does not double-fire at the seam.
        let limits = MoveLimits::new(100.0, 1000.0);
        let mut q = LookAheadQueue::new();
        let a = Move::new([0.0; 4], [1.0, 0.0, 0.0, 0.0], 50.0, &limits);
        q.add_move(a, &limits);
        let b = Move::new(
            [1.0, 0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0, 0.0],
            50.0,
            &limits,
        );
        q.add_move(b, &limits);
        q.flush();
        let a = q.next_move().unwrap();
        let b = q.next_move().unwrap();

        let mut gen = StepGenerator::new(0.0);
        let mut steps = Vec::new();
        gen.generate(&LinearStepCurve::new(&a, 0.0, 10.0), a.print_time, &mut steps);
        gen.generate(
            &LinearStepCurve::new(&b, 10.0, 10.0),
            a.total_time(),
            &mut steps,
        );
        assert_eq!(steps.len(), 20);
        for pair in steps.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
    }
}
