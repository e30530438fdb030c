//! Shared printer status block.
//!
//! Observability only: tasks report here and front-ends read from here, but
//! no control decision flows through this state. It is the one piece of
//! mutable state shared across tasks besides the channels and the shutdown
//! latch.

use crate::error::FatalEvent;

/// Connection and readiness status of the printer as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterStatus {
    Initializing,
    Ready,
    Printing,
    Error,
    Disconnected,
}

/// Dynamic printer state shared behind a mutex.
#[derive(Debug)]
pub struct PrinterState {
    pub status: PrinterStatus,
    pub status_message: String,
    /// The first fatal event observed, latched until restart.
    pub fatal: Option<FatalEvent>,
}

impl PrinterState {
    pub fn new() -> Self {
        PrinterState {
            status: PrinterStatus::Initializing,
            status_message: "host is starting".to_string(),
            fatal: None,
        }
    }

    /// Records a fatal event; the first one wins, later ones only log.
    pub fn latch_fatal(&mut self, event: FatalEvent) {
        self.status = PrinterStatus::Error;
        self.status_message = event.cause.clone();
        if self.fatal.is_none() {
            self.fatal = Some(event);
        }
    }
}

impl Default for PrinterState {
    fn default() -> Self {
        Self::new()
    }
}
