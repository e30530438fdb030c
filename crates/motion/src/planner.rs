//! Look-ahead planning over pending moves.
//!
//! Each move enters the queue with only its *bounds* known: the fastest it
//! could ever start (junction bound against its predecessor), the fastest it
//! could cruise, and the most speed it can gain over its distance. The
//! backward pass then picks actual `start/cruise/end` velocities so that
//! every junction is crossed at the exact speed its neighbor expects and no
//! move asks for more acceleration than it has distance for.
//!
//! A move becomes *flushable* once a velocity peak has been observed behind
//! it: later arrivals can only lower speeds in front of the peak, never
//! behind it, so the solved profile is final. `next_move` only returns
//! flushable moves; `flush` finalizes everything (used on an explicit flush
//! request or planner shutdown).

use crate::{xyz_distance, xyz_dot, Pos, AXES};
use std::collections::VecDeque;

/// Relative tolerance for treating two candidate speeds as equal.
const SPEED_TIE_REL: f64 = 1e-9;

/// Global velocity and acceleration limits for planning.
#[derive(Debug, Clone)]
pub struct MoveLimits {
    pub max_velocity: f64,
    pub max_acceleration: f64,
    /// Virtual deceleration bound used to smooth cruise-speed oscillation
    /// between short moves. At most `max_acceleration`.
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    /// Derived from `square_corner_velocity`, or set directly.
    pub junction_deviation: f64,
    /// Velocity step the extruder tolerates instantaneously at a junction.
    pub instant_corner_velocity: f64,
}

impl Default for MoveLimits {
    fn default() -> Self {
        let mut limits = MoveLimits {
            max_velocity: 100.0,
            max_acceleration: 1000.0,
            max_accel_to_decel: 500.0,
            square_corner_velocity: 5.0,
            junction_deviation: 0.0,
            instant_corner_velocity: 1.0,
        };
        limits.update_junction_deviation();
        limits
    }
}

impl MoveLimits {
    pub fn new(max_velocity: f64, max_acceleration: f64) -> Self {
        let mut limits = MoveLimits {
            max_velocity,
            max_acceleration,
            max_accel_to_decel: max_acceleration * 0.5,
            ..Default::default()
        };
        limits.update_junction_deviation();
        limits
    }

    /// Recomputes the junction deviation from the configured square-corner
    /// velocity, using the standard relation: a 90° corner taken at `scv`
    /// deviates by `scv²·(√2−1)/a`.
    pub fn update_junction_deviation(&mut self) {
        self.junction_deviation =
            Self::scv_to_deviation(self.square_corner_velocity, self.max_acceleration);
    }

    pub fn set_max_velocity(&mut self, v: f64) {
        self.max_velocity = v;
    }

    pub fn set_max_acceleration(&mut self, a: f64) {
        self.max_acceleration = a;
        self.update_junction_deviation();
    }

    pub fn set_square_corner_velocity(&mut self, scv: f64) {
        self.square_corner_velocity = scv;
        self.update_junction_deviation();
    }

    /// Sets the cornering bound directly as a deviation distance in mm.
    pub fn set_junction_deviation(&mut self, deviation: f64) {
        self.junction_deviation = deviation;
    }

    fn scv_to_deviation(scv: f64, acceleration: f64) -> f64 {
        let scv2 = scv * scv;
        scv2 * (2.0f64.sqrt() - 1.0) / acceleration
    }
}

/// One planned straight-line segment.
///
/// Velocity fields are in two groups: the `max_*`/`*_dv2` bounds are fixed
/// when the move enters the queue (junction geometry and per-axis limits);
/// `start_v`/`cruise_v`/`end_v` are written by the look-ahead pass and are
/// meaningless until the move is finalized.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(
    feature = "serde-support",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Move {
    pub start: Pos,
    pub end: Pos,
    /// Length of the move: spatial distance, or extruder travel for
    /// extrude-only moves.
    pub distance: f64,
    /// Unit direction of travel, per axis (`delta / distance`).
    pub rate: Pos,
    pub requested_velocity: f64,
    pub acceleration: f64,
    pub junction_deviation: f64,

    pub max_start_v2: f64,
    pub max_cruise_v2: f64,
    /// Speed-squared gained over the full distance at full acceleration.
    pub max_dv2: f64,
    pub max_smoothed_v2: f64,
    pub smoothed_dv2: f64,

    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,

    /// Absolute time this move begins, stamped when it is finalized.
    pub print_time: f64,
}

impl Move {
    /// Creates a new move between `start` and `end` under `limits`.
    pub fn new(start: Pos, end: Pos, speed: f64, limits: &MoveLimits) -> Move {
        if start[0] == end[0] && start[1] == end[1] && start[2] == end[2] {
            Self::new_extrude_move(start, end, speed)
        } else {
            Self::new_kinematic_move(start, end, speed, limits)
        }
    }

    fn new_extrude_move(start: Pos, end: Pos, speed: f64) -> Move {
        let distance = (end[3] - start[3]).abs();
        let inv_d = if distance > 0.0 { 1.0 / distance } else { 0.0 };
        let mut rate = [0.0; AXES];
        rate[3] = (end[3] - start[3]) * inv_d;
        Move {
            start,
            end,
            distance,
            rate,
            requested_velocity: speed,
            acceleration: f64::MAX,
            junction_deviation: 0.0,
            max_start_v2: 0.0,
            max_cruise_v2: speed * speed,
            max_dv2: f64::MAX,
            max_smoothed_v2: 0.0,
            smoothed_dv2: f64::MAX,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            print_time: 0.0,
        }
    }

    fn new_kinematic_move(start: Pos, end: Pos, speed: f64, limits: &MoveLimits) -> Move {
        let distance = xyz_distance(&start, &end); // Can't be zero
        let velocity = speed.min(limits.max_velocity);
        let mut rate = [0.0; AXES];
        for axis in 0..AXES {
            rate[axis] = (end[axis] - start[axis]) / distance;
        }
        Move {
            start,
            end,
            distance,
            rate,
            requested_velocity: velocity,
            acceleration: limits.max_acceleration,
            junction_deviation: limits.junction_deviation,
            max_start_v2: 0.0,
            max_cruise_v2: velocity * velocity,
            max_dv2: 2.0 * distance * limits.max_acceleration,
            max_smoothed_v2: 0.0,
            smoothed_dv2: 2.0 * distance * limits.max_accel_to_decel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            print_time: 0.0,
        }
    }

    pub fn is_kinematic_move(&self) -> bool {
        self.start[0] != self.end[0] || self.start[1] != self.end[1] || self.start[2] != self.end[2]
    }

    pub fn delta(&self) -> Pos {
        let mut d = [0.0; AXES];
        for axis in 0..AXES {
            d[axis] = self.end[axis] - self.start[axis];
        }
        d
    }

    /// Caps the cruise speed and acceleration of this move, tightening the
    /// derived bounds accordingly. Used for per-axis projected limits.
    pub fn limit_speed(&mut self, velocity: f64, acceleration: f64) {
        let v2 = velocity * velocity;
        if v2 < self.max_cruise_v2 {
            self.max_cruise_v2 = v2;
        }
        self.acceleration = self.acceleration.min(acceleration);
        self.max_dv2 = 2.0 * self.distance * self.acceleration;
        self.smoothed_dv2 = self.smoothed_dv2.min(self.max_dv2);
    }

    /// Applies the cornering bound against the previous move.
    ///
    /// The junction speed obeys the deviation model: a corner of angle θ is
    /// treated as an arc of radius `R = d·sin(θ/2)/(1−sin(θ/2))` through the
    /// configured deviation distance `d`, and the centripetal limit
    /// `v² ≤ R·a` applies. Both moves' centripetal half-bounds and cruise
    /// bounds cap it further, as does the speed reachable through the
    /// previous move.
    fn apply_junction(&mut self, previous: &Move, limits: &MoveLimits) {
        if !self.is_kinematic_move() || !previous.is_kinematic_move() {
            return;
        }

        let mut junction_cos_theta = -xyz_dot(&self.rate, &previous.rate);
        if junction_cos_theta > 0.999999 {
            // Move was not at an angle, skip all this
            return;
        }
        junction_cos_theta = junction_cos_theta.max(-0.999999);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
        let r = sin_theta_d2 / (1.0 - sin_theta_d2);
        let tan_theta_d2 = sin_theta_d2 / (0.5 * (1.0 + junction_cos_theta)).sqrt();
        let move_centripetal_v2 = 0.5 * self.distance * tan_theta_d2 * self.acceleration;
        let prev_centripetal_v2 = 0.5 * previous.distance * tan_theta_d2 * previous.acceleration;

        let extruder_v2 = self.extruder_junction_v2(previous, limits);

        self.max_start_v2 = extruder_v2
            .min(r * self.junction_deviation * self.acceleration)
            .min(r * previous.junction_deviation * previous.acceleration)
            .min(move_centripetal_v2)
            .min(prev_centripetal_v2)
            .min(self.max_cruise_v2)
            .min(previous.max_cruise_v2)
            .min(previous.max_start_v2 + previous.max_dv2);
        self.max_smoothed_v2 = self
            .max_start_v2
            .min(previous.max_smoothed_v2 + previous.smoothed_dv2);
    }

    /// The junction speed the extruder tolerates: its flow rate may only
    /// step by `instant_corner_velocity` across the junction.
    fn extruder_junction_v2(&self, previous: &Move, limits: &MoveLimits) -> f64 {
        let diff_rate = (self.rate[3] - previous.rate[3]).abs();
        if diff_rate > 0.0 {
            let v = limits.instant_corner_velocity / diff_rate;
            v * v
        } else {
            self.max_cruise_v2
        }
    }

    fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        self.start_v = start_v2.sqrt();
        self.cruise_v = cruise_v2.sqrt();
        self.end_v = end_v2.sqrt();
    }

    pub fn accel_distance(&self) -> f64 {
        (self.cruise_v * self.cruise_v - self.start_v * self.start_v) * 0.5 / self.acceleration
    }

    pub fn accel_time(&self) -> f64 {
        let d = self.accel_distance();
        if d == 0.0 {
            return 0.0;
        }
        d / ((self.start_v + self.cruise_v) * 0.5)
    }

    pub fn cruise_distance(&self) -> f64 {
        (self.distance - self.accel_distance() - self.decel_distance()).max(0.0)
    }

    pub fn cruise_time(&self) -> f64 {
        self.cruise_distance() / self.cruise_v
    }

    pub fn decel_distance(&self) -> f64 {
        (self.cruise_v * self.cruise_v - self.end_v * self.end_v) * 0.5 / self.acceleration
    }

    pub fn decel_time(&self) -> f64 {
        let d = self.decel_distance();
        if d == 0.0 {
            return 0.0;
        }
        d / ((self.end_v + self.cruise_v) * 0.5)
    }

    pub fn total_time(&self) -> f64 {
        self.accel_time() + self.cruise_time() + self.decel_time()
    }

    /// Distance traveled along the move `t` seconds after it begins.
    ///
    /// Only valid on a finalized move. Monotonic over `0..=total_time()`.
    pub fn displacement_at(&self, t: f64) -> f64 {
        let t_a = self.accel_time();
        let t_c = self.cruise_time();
        if t <= 0.0 {
            return 0.0;
        }
        if t < t_a {
            return (self.start_v + 0.5 * self.acceleration * t) * t;
        }
        let mut d = self.accel_distance();
        let t = t - t_a;
        if t < t_c {
            return d + self.cruise_v * t;
        }
        d += self.cruise_distance();
        let t = (t - t_c).min(self.decel_time());
        d + (self.cruise_v - 0.5 * self.acceleration * t) * t
    }

    /// Speed along the move `t` seconds after it begins.
    pub fn velocity_at(&self, t: f64) -> f64 {
        let t_a = self.accel_time();
        let t_c = self.cruise_time();
        if t <= 0.0 {
            return self.start_v;
        }
        if t < t_a {
            return self.start_v + self.acceleration * t;
        }
        let t = t - t_a;
        if t < t_c {
            return self.cruise_v;
        }
        let t = (t - t_c).min(self.decel_time());
        self.cruise_v - self.acceleration * t
    }
}

/// `min` that prefers the larger operand when the two are equal within a
/// relative tolerance, so throughput never loses a coin flip to rounding.
fn min_speed_v2(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    if hi - lo <= SPEED_TIE_REL * hi {
        hi
    } else {
        lo
    }
}

/// The pending-move queue and its junction-velocity solver.
#[derive(Debug, Default)]
pub struct LookAheadQueue {
    moves: VecDeque<Move>,
    /// Moves before this index have final velocities.
    flush_count: usize,
}

impl LookAheadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Discards all pending moves (shutdown or error drain).
    pub fn clear(&mut self) {
        self.moves.clear();
        self.flush_count = 0;
    }

    /// Appends a move, bounding its junction speed against its predecessor.
    pub fn add_move(&mut self, mut mv: Move, limits: &MoveLimits) {
        if let Some(previous) = self.moves.back() {
            mv.apply_junction(previous, limits);
        }
        self.moves.push_back(mv);
    }

    /// The backward look-ahead pass.
    ///
    /// Walks newest to oldest, bounding each move's start speed by what the
    /// moves behind it can decelerate from ("reachable from behind"). When
    /// `partial`, only decides velocities for moves behind the most recent
    /// smoothed-velocity peak and leaves the rest pending; a full pass
    /// finalizes everything. The pass is a fixed point: re-running it does
    /// not change already-finalized moves.
    fn process(&mut self, partial: bool) {
        if self.flush_count == self.moves.len() {
            return;
        }

        let mut delayed: Vec<(&mut Move, f64, f64)> = Vec::new();

        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;

        let mut update_flush_count = partial;
        let skip = if partial { self.flush_count } else { 0 };
        if !partial {
            self.flush_count = self.moves.len();
        }

        for (idx, m) in self.moves.iter_mut().enumerate().skip(skip).rev() {
            let reachable_start_v2 = next_end_v2 + m.max_dv2;
            let start_v2 = m.max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + m.smoothed_dv2;
            let smoothed_v2 = m.max_smoothed_v2.min(reachable_smoothed_v2);
            if smoothed_v2 < reachable_smoothed_v2 {
                // This move decelerates into its junction: a peak lies here
                // or among the delayed moves accumulated behind it.
                if (smoothed_v2 + m.smoothed_dv2 > next_smoothed_v2) || !delayed.is_empty() {
                    if update_flush_count && peak_cruise_v2 != 0.0 {
                        self.flush_count = idx;
                        update_flush_count = false;
                    }

                    peak_cruise_v2 = m
                        .max_cruise_v2
                        .min((smoothed_v2 + reachable_smoothed_v2) * 0.5);

                    if !delayed.is_empty() {
                        if !update_flush_count && idx < self.flush_count {
                            let mut mc_v2 = peak_cruise_v2;
                            for (dm, ms_v2, me_v2) in delayed.iter_mut().rev() {
                                mc_v2 = mc_v2.min(*ms_v2);
                                dm.set_junction(ms_v2.min(mc_v2), mc_v2, me_v2.min(mc_v2));
                            }
                        }
                        delayed.clear();
                    }
                }

                if !update_flush_count && idx < self.flush_count {
                    let cruise_v2 = min_speed_v2(
                        min_speed_v2((start_v2 + reachable_start_v2) * 0.5, m.max_cruise_v2),
                        peak_cruise_v2,
                    );
                    m.set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                // Accelerating through: final speeds depend on a peak not
                // yet seen, so defer until the pass finds it.
                delayed.push((m, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }

        if update_flush_count {
            self.flush_count = 0;
        }
    }

    /// Finalizes every pending move.
    pub fn flush(&mut self) {
        self.process(false);
    }

    /// Runs a lazy pass and pops the oldest move if it is final.
    ///
    /// The returned move still needs its `print_time` stamped by the
    /// toolhead.
    pub fn next_move(&mut self) -> Option<Move> {
        self.process(true);
        if self.flush_count == 0 {
            return None;
        }
        let mv = self.moves.pop_front()?;
        self.flush_count -= 1;
        Some(mv)
    }

    /// Peeks at the last queued move (used for junction chaining).
    pub fn last(&self) -> Option<&Move> {
        self.moves.back()
    }

    /// Lower bound on the time the pending moves will take to execute,
    /// assuming every move cruises at its requested speed.
    pub fn pending_time(&self) -> f64 {
        self.moves
            .iter()
            .map(|m| m.distance / m.requested_velocity.max(1e-12))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MoveLimits {
        let mut l = MoveLimits::new(100.0, 1000.0);
        l.max_accel_to_decel = 1000.0;
        l
    }

    fn queue_moves(points: &[(Pos, f64)]) -> Vec<Move> {
        let l = limits();
        let mut q = LookAheadQueue::new();
        let mut start = [0.0; AXES];
        for (end, speed) in points {
            let mv = Move::new(start, *end, *speed, &l);
            q.add_move(mv, &l);
            start = *end;
        }
        q.flush();
        let mut out = Vec::new();
        while let Some(m) = q.next_move() {
            out.push(m);
        }
        out
    }

    #[test]
    fn lone_move_is_a_symmetric_trapezoid() {
        let moves = queue_moves(&[([100.0, 0.0, 0.0, 0.0], 100.0)]);
        assert_eq!(moves.len(), 1);
        let m = &moves[0];
        assert_eq!(m.start_v, 0.0);
        assert_eq!(m.end_v, 0.0);
        assert!((m.cruise_v - 100.0).abs() < 1e-9);
        assert!((m.accel_distance() - 5.0).abs() < 1e-9);
        assert!((m.decel_distance() - 5.0).abs() < 1e-9);
        assert!((m.cruise_distance() - 90.0).abs() < 1e-9);
        assert!((m.total_time() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn short_move_is_a_triangle() {
        let moves = queue_moves(&[([4.0, 0.0, 0.0, 0.0], 100.0)]);
        let m = &moves[0];
        // Cannot reach 100 mm/s in 2 mm: peak is sqrt(2·a·d/2).
        let peak = (1000.0f64 * 4.0).sqrt();
        assert!((m.cruise_v - peak).abs() < 1e-6);
        assert!(m.cruise_distance() < 1e-9);
    }

    #[test]
    fn junction_speeds_agree_between_neighbors() {
        let moves = queue_moves(&[
            ([10.0, 0.0, 0.0, 0.0], 100.0),
            ([20.0, 5.0, 0.0, 0.0], 80.0),
            ([20.0, 25.0, 0.0, 0.0], 100.0),
        ]);
        assert_eq!(moves.len(), 3);
        for pair in moves.windows(2) {
            let diff = (pair[0].end_v - pair[1].start_v).abs();
            assert!(
                diff <= 1e-9 * pair[0].end_v.max(1.0),
                "junction mismatch: {} vs {}",
                pair[0].end_v,
                pair[1].start_v
            );
        }
        // Segments always account for the whole distance.
        for m in &moves {
            let sum = m.accel_distance() + m.cruise_distance() + m.decel_distance();
            assert!((sum - m.distance).abs() <= 1e-9 * m.distance);
        }
    }

    #[test]
    fn lazy_pass_is_idempotent() {
        let l = limits();
        let mut q = LookAheadQueue::new();
        let mut start = [0.0; AXES];
        for i in 1..=6 {
            let end = [i as f64 * 10.0, (i % 2) as f64, 0.0, 0.0];
            let mv = Move::new(start, end, 100.0, &l);
            q.add_move(mv, &l);
            start = end;
        }
        q.process(true);
        let first = q.flush_count;
        q.process(true);
        assert_eq!(q.flush_count, first);
    }

    #[test]
    fn displacement_covers_full_distance() {
        let moves = queue_moves(&[([30.0, 0.0, 0.0, 0.0], 60.0)]);
        let m = &moves[0];
        let total = m.total_time();
        assert!((m.displacement_at(total) - m.distance).abs() < 1e-9);
        assert_eq!(m.displacement_at(0.0), 0.0);
        // Monotonic.
        let mut last = 0.0;
        for i in 0..=100 {
            let d = m.displacement_at(total * i as f64 / 100.0);
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn speed_ties_prefer_the_larger_cruise() {
        assert_eq!(min_speed_v2(100.0, 100.0 + 1e-8), 100.0 + 1e-8);
        assert_eq!(min_speed_v2(100.0, 200.0), 100.0);
    }
}
