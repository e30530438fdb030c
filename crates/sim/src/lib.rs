//! MCU simulator for host development and testing.
//!
//! Listens on a unix socket and speaks the real wire protocol: framing,
//! sequencing and acknowledgments, dictionary transfer, clock queries
//! against a simulated free-running counter, and step queue bookkeeping
//! with the same validity checks real firmware applies. The stride host
//! connects to it exactly as it would to hardware.

pub mod fake_mcu;

pub use fake_mcu::{SimMcu, SimState};
