//! # Stride Host
//!
//! Library side of the stride host process: session management, clock
//! synchronization, and the control loop that turns planned motion into
//! timed MCU commands. The `stride-host` binary wires these pieces to a
//! configuration file and real transports; integration tests wire them to
//! the MCU simulator instead.

pub mod clocksync;
pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod plan;
pub mod session;
pub mod setup;
pub mod state;
