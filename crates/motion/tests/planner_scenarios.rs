//! End-to-end planner scenarios through the toolhead API.

use motion::kinematics::{AxisLimits, CartesianKinematics};
use motion::planner::MoveLimits;
use motion::toolhead::{Stepper, Toolhead};
use motion::{Move, Pos};

fn kin(max_accel: f64) -> CartesianKinematics {
    CartesianKinematics::new(
        [80.0, 80.0, 400.0],
        vec![
            AxisLimits {
                position_min: -500.0,
                position_max: 500.0,
                max_accel,
            };
            3
        ],
    )
}

fn toolhead(max_velocity: f64, max_accel: f64, junction_deviation: f64) -> Toolhead {
    let mut limits = MoveLimits::new(max_velocity, max_accel);
    // Plain trapezoids: no virtual decel smoothing in these scenarios.
    limits.max_accel_to_decel = max_accel;
    limits.set_junction_deviation(junction_deviation);
    let steppers = vec![
        Stepper::new("stepper_x", 0.0125, 0, 400),
        Stepper::new("stepper_y", 0.0125, 0, 400),
        Stepper::new("stepper_z", 0.0025, 0, 400),
    ];
    Toolhead::new(limits, steppers)
}

fn plan(th: &mut Toolhead, max_accel: f64, path: &[(Pos, f64)]) -> Vec<Move> {
    let k = kin(max_accel);
    for (end, speed) in path {
        th.move_to(&k, *end, *speed).unwrap();
    }
    th.flush()
}

fn assert_profile_invariants(moves: &[Move]) {
    for pair in moves.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            (a.end_v - b.start_v).abs() <= 1e-9 * a.end_v.max(1.0),
            "junction speeds disagree: {} vs {}",
            a.end_v,
            b.start_v
        );
    }
    for m in moves {
        let d_accel = m.accel_distance();
        let d_cruise = m.cruise_distance();
        let d_decel = m.decel_distance();
        assert!(d_accel >= -1e-12 && d_cruise >= -1e-12 && d_decel >= -1e-12);
        let sum = d_accel + d_cruise + d_decel;
        assert!(
            (sum - m.distance).abs() <= 1e-9 * m.distance,
            "segments {sum} != distance {}",
            m.distance
        );
        assert!(m.start_v <= m.cruise_v + 1e-12);
        assert!(m.end_v <= m.cruise_v + 1e-12);
    }
}

/// A single straight move from rest to rest: symmetric trapezoid with a
/// 90 mm cruise and 1.1 s total.
#[test]
fn single_straight_move() {
    let mut th = toolhead(100.0, 1000.0, 0.0);
    let moves = plan(&mut th, 3000.0, &[([100.0, 0.0, 0.0, 0.0], 100.0)]);
    assert_eq!(moves.len(), 1);
    let m = &moves[0];
    assert_eq!(m.start_v, 0.0);
    assert_eq!(m.end_v, 0.0);
    assert!((m.cruise_v - 100.0).abs() < 1e-9);
    assert!((m.accel_distance() - 5.0).abs() < 1e-9);
    assert!((m.cruise_distance() - 90.0).abs() < 1e-9);
    assert!((m.decel_distance() - 5.0).abs() < 1e-9);
    assert!((m.total_time() - 1.1).abs() < 1e-9);
    assert_profile_invariants(&moves);
}

/// A square corner with zero allowed deviation must come to a full stop.
#[test]
fn square_corner_with_zero_deviation_stops() {
    let mut th = toolhead(100.0, 1000.0, 0.0);
    let moves = plan(
        &mut th,
        3000.0,
        &[
            ([10.0, 0.0, 0.0, 0.0], 100.0),
            ([10.0, 10.0, 0.0, 0.0], 100.0),
        ],
    );
    assert_eq!(moves.len(), 2);
    assert!(moves[0].end_v.abs() < 1e-9, "corner speed {}", moves[0].end_v);
    assert!(moves[1].start_v.abs() < 1e-9);
    assert_profile_invariants(&moves);
}

/// A nearly collinear corner with a little allowed deviation keeps almost
/// full speed through the junction.
#[test]
fn shallow_corner_keeps_speed() {
    let mut th = toolhead(100.0, 1000.0, 0.01);
    let moves = plan(
        &mut th,
        3000.0,
        &[
            ([10.0, 0.0, 0.0, 0.0], 100.0),
            ([20.0, 0.1, 0.0, 0.0], 100.0),
        ],
    );
    assert_eq!(moves.len(), 2);
    assert!(
        moves[0].end_v > 99.0,
        "shallow corner slowed to {}",
        moves[0].end_v
    );
    assert_profile_invariants(&moves);
}

/// A long zig-zag respects every invariant and never exceeds the requested
/// speed anywhere.
#[test]
fn zigzag_path_invariants() {
    let mut th = toolhead(300.0, 3000.0, 0.02);
    let mut path = Vec::new();
    for i in 1..=40 {
        let x = i as f64 * 5.0;
        let y = if i % 2 == 0 { 0.0 } else { 3.0 };
        let speed = if i % 5 == 0 { 60.0 } else { 150.0 };
        path.push(([x, y, 0.0, 0.0], speed));
    }
    let moves = plan(&mut th, 3000.0, &path);
    assert_eq!(moves.len(), 40);
    assert_profile_invariants(&moves);
    for m in &moves {
        assert!(m.cruise_v <= m.requested_velocity + 1e-9);
    }
    // The path starts and ends at rest.
    assert_eq!(moves[0].start_v, 0.0);
    assert!(moves.last().unwrap().end_v.abs() < 1e-9);
}

/// Lazy pulls hand out moves in order with the same invariants as a full
/// flush, and the boundary junctions still agree.
#[test]
fn lazy_and_full_flush_agree_on_junctions() {
    let mut th = toolhead(200.0, 2000.0, 0.05);
    let k = kin(3000.0);
    let mut collected = Vec::new();
    for i in 1..=30 {
        let x = i as f64 * 4.0;
        let y = ((i % 3) as f64) * 2.0;
        th.move_to(&k, [x, y, 0.0, 0.0], 120.0).unwrap();
        collected.extend(th.pull_moves());
    }
    collected.extend(th.flush());
    assert_eq!(collected.len(), 30);
    assert_profile_invariants(&collected);
}
