//! Standalone simulator binary.
//!
//! Serves a simulated MCU on a unix socket so a host process can be run
//! against it by hand:
//!
//! ```text
//! sim_mcu /tmp/strider-mcu.sock &
//! stride-host run --config printer.cfg
//! ```

use anyhow::Result;
use sim::SimMcu;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/strider-mcu.sock".to_string());

    // Serve connections forever; each run handles one host session.
    loop {
        let mcu = SimMcu::new(&socket_path);
        if let Err(e) = mcu.run().await {
            tracing::error!(error = %e, "simulator connection failed");
        }
    }
}
