//! Error types for the motion planning crate.

/// Errors raised while planning or scheduling motion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MotionError {
    /// The requested move cannot be planned; the queue is left unchanged.
    #[error("invalid move: {0}")]
    InvalidMove(String),
    /// A target position lies outside the kinematics' declared limits. The
    /// toolhead drains its queue and waits for an operator reset.
    #[error("axis {axis} position {position} outside limits {min}..{max}")]
    OutOfBounds {
        axis: usize,
        position: f64,
        min: f64,
        max: f64,
    },
    /// The inverse kinematics have no solution for the target position.
    #[error("tool position unreachable")]
    Unreachable,
    /// Ideal step times were not strictly increasing. Always fatal: it means
    /// planning produced a schedule no stepper can execute.
    #[error("step time {clock} not after previous step {last}")]
    StepOrderViolation { clock: u64, last: u64 },
    /// The step queue is at capacity; the planner flush path must back off.
    #[error("step queue at capacity")]
    Backpressure,
}
