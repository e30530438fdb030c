//! Host error types and the structured fatal event record.

use motion::MotionError;
use std::time::SystemTime;
use stride_proto::ProtocolError;

/// Errors surfaced by the host's session and control layers.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The MCU reported its own shutdown; the host mirrors it.
    #[error("mcu shutdown: {0}")]
    McuShutdown(String),
    /// Clock estimator residuals exceeded tolerance for too long.
    #[error("clock drift beyond {ppm} ppm sustained for {seconds:.1}s")]
    ClockDrift { ppm: f64, seconds: f64 },
    /// Too many consecutive protocol errors on one session.
    #[error("session gave up after {retries} protocol errors: {last}")]
    SessionFailed { retries: u32, last: String },
    /// The session's transport closed underneath it.
    #[error("transport closed")]
    TransportClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Classification of a fatal event for operators and front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    OutOfBounds,
    StepOrderViolation,
    ProtocolError,
    McuShutdown,
    ClockDrift,
    Internal,
}

/// The single structured record every fatal error produces.
#[derive(Debug, Clone)]
pub struct FatalEvent {
    pub kind: FatalKind,
    pub timestamp: SystemTime,
    /// Index of the affected session, if the failure is session-scoped.
    pub session: Option<usize>,
    pub cause: String,
}

impl FatalEvent {
    pub fn new(kind: FatalKind, session: Option<usize>, cause: impl Into<String>) -> Self {
        FatalEvent {
            kind,
            timestamp: SystemTime::now(),
            session,
            cause: cause.into(),
        }
    }

    pub fn from_error(err: &HostError, session: Option<usize>) -> Self {
        let kind = match err {
            HostError::Motion(MotionError::OutOfBounds { .. }) => FatalKind::OutOfBounds,
            HostError::Motion(MotionError::StepOrderViolation { .. }) => {
                FatalKind::StepOrderViolation
            }
            HostError::Protocol(_) | HostError::SessionFailed { .. } => FatalKind::ProtocolError,
            HostError::McuShutdown(_) => FatalKind::McuShutdown,
            HostError::ClockDrift { .. } => FatalKind::ClockDrift,
            _ => FatalKind::Internal,
        };
        FatalEvent::new(kind, session, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_event_classifies_errors() {
        let err = HostError::McuShutdown("thermal".into());
        let event = FatalEvent::from_error(&err, Some(1));
        assert_eq!(event.kind, FatalKind::McuShutdown);
        assert_eq!(event.session, Some(1));
        assert!(event.cause.contains("thermal"));
    }

    #[test]
    fn step_order_maps_to_its_own_kind() {
        let err = HostError::Motion(MotionError::StepOrderViolation { clock: 5, last: 9 });
        assert_eq!(
            FatalEvent::from_error(&err, None).kind,
            FatalKind::StepOrderViolation
        );
    }
}
