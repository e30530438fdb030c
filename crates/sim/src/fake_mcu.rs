//! Simulated MCU behavior.
//!
//! Implements the slice of firmware the host core exercises: identify and
//! dictionary transfer, configuration, clock queries, and the timed step
//! queue. Step commands are validated the way firmware validates them
//! (unknown oids, non-monotonic schedules, and deadlines in the past are
//! shutdown conditions) so host bugs surface as protocol-visible failures.

use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use stride_proto::command::{decode_batch, encode_batch, Command, Value};
use stride_proto::dictionary::{Dictionary, DictionaryBuilder, FieldType, IDENTIFY_ID};
use stride_proto::frame::{Frame, SEQ_MASK};
use stride_proto::FrameCodec;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// One simulated stepper object.
#[derive(Debug, Default, Clone)]
pub struct SimStepper {
    pub last_clock: u64,
    pub dir: bool,
    pub position: i64,
    pub steps_queued: u64,
    /// Reconstructed clock of every queued step, for test inspection.
    pub step_clocks: Vec<u64>,
}

/// Shared, inspectable simulator state.
#[derive(Debug, Default)]
pub struct SimState {
    pub steppers: HashMap<u8, SimStepper>,
    pub allocated_oids: u8,
    pub configured: bool,
    pub config_crc: u32,
    pub shutdown: Option<String>,
    pub frames_received: u64,
}

impl SimState {
    pub fn total_steps(&self) -> u64 {
        self.steppers.values().map(|s| s.steps_queued).sum()
    }
}

/// A simulated MCU serving one host connection on a unix socket.
pub struct SimMcu {
    socket_path: String,
    freq: f64,
    dict: Dictionary,
    state: Arc<Mutex<SimState>>,
}

impl SimMcu {
    pub fn new(socket_path: &str) -> Self {
        SimMcu {
            socket_path: socket_path.to_string(),
            freq: 16_000_000.0,
            dict: Self::dictionary(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Simulated tick rate; `drift_ppm` offsets it from nominal to give
    /// the host's estimator something to chase.
    pub fn with_freq(mut self, nominal: f64, drift_ppm: f64) -> Self {
        self.freq = nominal * (1.0 + drift_ppm * 1e-6);
        self
    }

    /// Handle for inspecting simulator state from tests.
    pub fn state(&self) -> Arc<Mutex<SimState>> {
        self.state.clone()
    }

    /// The command set this MCU build exposes.
    pub fn dictionary() -> Dictionary {
        DictionaryBuilder::new("sim-mcu-1")
            .command(
                "identify",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("count", FieldType::U8)],
            )
            .command("get_config", 1, &[])
            .command("finalize_config", 2, &[("crc", FieldType::U32)])
            .command("allocate_oids", 3, &[("count", FieldType::U8)])
            .command(
                "config_stepper",
                4,
                &[
                    ("oid", FieldType::U8),
                    ("step_pin", FieldType::U8),
                    ("dir_pin", FieldType::U8),
                    ("min_stop_interval", FieldType::U32),
                ],
            )
            .command(
                "queue_step",
                11,
                &[
                    ("oid", FieldType::U8),
                    ("interval", FieldType::U32),
                    ("count", FieldType::U16),
                    ("add", FieldType::I16),
                ],
            )
            .command(
                "set_next_step_dir",
                12,
                &[("oid", FieldType::U8), ("dir", FieldType::U8)],
            )
            .command(
                "reset_step_clock",
                13,
                &[("oid", FieldType::U8), ("clock", FieldType::U32)],
            )
            .command("get_clock", 14, &[])
            .command("emergency_stop", 15, &[])
            .command("shutdown", 16, &[("reason", FieldType::String)])
            .command("clear_queue", 17, &[])
            .response(
                "identify_response",
                IDENTIFY_ID,
                &[("offset", FieldType::U32), ("data", FieldType::Buffer)],
            )
            .response("clock", 72, &[("clock", FieldType::U32)])
            .response(
                "config",
                73,
                &[("is_config", FieldType::U8), ("crc", FieldType::U32)],
            )
            .response("shutdown", 74, &[("reason", FieldType::String)])
            .response("is_shutdown", 75, &[("reason", FieldType::String)])
            .response(
                "stats",
                76,
                &[("count", FieldType::U32), ("sum", FieldType::U32)],
            )
            .build()
    }

    /// Runs the simulator: accepts one host connection and serves it until
    /// the host disconnects.
    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path, "simulated MCU listening");
        let (stream, _) = listener.accept().await?;
        info!("host connected");
        self.serve(stream).await
    }

    async fn serve(&self, stream: UnixStream) -> Result<()> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let dict_blob = Bytes::from(self.dict.to_zlib());
        let clock_origin = Instant::now();
        // Host→MCU and MCU→host sequence spaces are independent.
        let mut next_seq: u64 = 0;
        let mut tx_seq: u64 = 0;

        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "frame error");
                    continue;
                }
            };
            self.state.lock().frames_received += 1;
            if frame.is_ack() {
                // The host never retransmits to us in-session unless its
                // window stalls; nothing to do with its acks here.
                continue;
            }
            if frame.seq != (next_seq & SEQ_MASK as u64) as u8 {
                // Out of order: re-ack what we actually expect.
                framed.send(Frame::ack(next_seq)).await?;
                continue;
            }
            next_seq += 1;
            framed.send(Frame::ack(next_seq)).await?;

            let commands = match decode_batch(&frame.payload, &self.dict.commands) {
                Ok(commands) => commands,
                Err(e) => {
                    warn!(error = %e, "undecodable payload");
                    continue;
                }
            };
            for command in commands {
                let clock = (clock_origin.elapsed().as_secs_f64() * self.freq) as u64;
                if let Some(response) = self.execute(&command, clock, &dict_blob) {
                    let payload = encode_batch(&[response], &self.dict.responses)?;
                    framed.send(Frame::new(tx_seq, payload.freeze())).await?;
                    tx_seq += 1;
                }
            }
        }
        info!("host disconnected");
        Ok(())
    }

    /// Executes one command against simulator state, producing at most one
    /// response.
    fn execute(&self, command: &Command, clock: u64, dict_blob: &Bytes) -> Option<Command> {
        let mut state = self.state.lock();
        if state.shutdown.is_some() && command.name != "get_clock" && command.name != "identify" {
            return Some(Command::new(
                "is_shutdown",
                vec![Value::Str(state.shutdown.clone().unwrap_or_default())],
            ));
        }
        match command.name.as_str() {
            "identify" => {
                let offset = command.args[0].as_u32().unwrap_or(0) as usize;
                let count = command.args[1].as_u32().unwrap_or(0) as usize;
                let end = (offset + count).min(dict_blob.len());
                let chunk = dict_blob
                    .get(offset.min(dict_blob.len())..end)
                    .unwrap_or(&[]);
                Some(Command::new(
                    "identify_response",
                    vec![
                        Value::U32(offset as u32),
                        Value::Bytes(chunk.to_vec()),
                    ],
                ))
            }
            "get_clock" => Some(Command::new("clock", vec![Value::U32(clock as u32)])),
            "get_config" => Some(Command::new(
                "config",
                vec![
                    Value::U8(state.configured as u8),
                    Value::U32(state.config_crc),
                ],
            )),
            "allocate_oids" => {
                state.allocated_oids = match command.args[0] {
                    Value::U8(n) => n,
                    _ => 0,
                };
                None
            }
            "config_stepper" => {
                let oid = match command.args[0] {
                    Value::U8(oid) => oid,
                    _ => return self.shutdown_now(&mut state, "bad config_stepper"),
                };
                if oid >= state.allocated_oids {
                    return self.shutdown_now(&mut state, "oid not allocated");
                }
                state.steppers.insert(oid, SimStepper::default());
                None
            }
            "finalize_config" => {
                state.configured = true;
                state.config_crc = command.args[0].as_u32().unwrap_or(0);
                debug!(crc = state.config_crc, "configuration finalized");
                Some(Command::new(
                    "config",
                    vec![Value::U8(1), Value::U32(state.config_crc)],
                ))
            }
            "reset_step_clock" => {
                let oid = command.args[0].as_u32().unwrap_or(255) as u8;
                let wire_clock = command.args[1].as_u32().unwrap_or(0);
                if !state.steppers.contains_key(&oid) {
                    return self.shutdown_now(&mut state, "unknown oid");
                }
                if let Some(stepper) = state.steppers.get_mut(&oid) {
                    stepper.last_clock = extend_clock(wire_clock, clock);
                }
                None
            }
            "set_next_step_dir" => {
                let oid = command.args[0].as_u32().unwrap_or(255) as u8;
                let dir = command.args[1].as_u32().unwrap_or(0) != 0;
                if !state.steppers.contains_key(&oid) {
                    return self.shutdown_now(&mut state, "unknown oid");
                }
                if let Some(stepper) = state.steppers.get_mut(&oid) {
                    stepper.dir = dir;
                }
                None
            }
            "queue_step" => {
                let oid = command.args[0].as_u32().unwrap_or(255) as u8;
                let interval = command.args[1].as_u32().unwrap_or(0) as i64;
                let count = command.args[2].as_u32().unwrap_or(0) as i64;
                let add = command.args[3].as_i32().unwrap_or(0) as i64;
                if count == 0 {
                    return self.shutdown_now(&mut state, "zero count queue_step");
                }
                if !state.steppers.contains_key(&oid) {
                    return self.shutdown_now(&mut state, "unknown oid");
                }
                // Reconstruct the run and apply firmware validity rules.
                let mut failure = None;
                if let Some(stepper) = state.steppers.get_mut(&oid) {
                    let mut t = stepper.last_clock as i64;
                    let mut step_interval = interval;
                    let step = if stepper.dir { 1 } else { -1 };
                    for _ in 0..count {
                        if step_interval <= 0 {
                            failure = Some("non-positive step interval");
                            break;
                        }
                        t += step_interval;
                        step_interval += add;
                        stepper.step_clocks.push(t as u64);
                        stepper.position += step;
                    }
                    if failure.is_none() {
                        if (t as u64) < clock {
                            // The run ended in the past: the host's
                            // schedule missed its deadline.
                            failure = Some("timer in the past");
                        } else {
                            stepper.last_clock = t as u64;
                            stepper.steps_queued += count as u64;
                        }
                    }
                }
                match failure {
                    Some(reason) => self.shutdown_now(&mut state, reason),
                    None => None,
                }
            }
            "clear_queue" => {
                for stepper in state.steppers.values_mut() {
                    stepper.step_clocks.clear();
                }
                None
            }
            "emergency_stop" => {
                state.shutdown = Some("emergency_stop".to_string());
                Some(Command::new(
                    "shutdown",
                    vec![Value::Str("emergency_stop".to_string())],
                ))
            }
            "shutdown" => {
                let reason = match &command.args[0] {
                    Value::Str(s) => s.clone(),
                    _ => "host request".to_string(),
                };
                state.shutdown = Some(reason.clone());
                Some(Command::new("shutdown", vec![Value::Str(reason)]))
            }
            other => {
                warn!(name = other, "unhandled command");
                None
            }
        }
    }

    fn shutdown_now(&self, state: &mut SimState, reason: &str) -> Option<Command> {
        warn!(reason, "simulated MCU shutdown");
        state.shutdown = Some(reason.to_string());
        Some(Command::new(
            "shutdown",
            vec![Value::Str(reason.to_string())],
        ))
    }
}

/// Extends a 32-bit wire clock to 64 bits near the reference clock.
fn extend_clock(wire: u32, reference: u64) -> u64 {
    let diff = (wire as i64 - reference as i64) & 0xffff_ffff;
    let diff = diff - ((diff & 0x8000_0000) << 1);
    (reference as i64 + diff).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_pins_identify() {
        let dict = SimMcu::dictionary();
        assert_eq!(dict.commands.by_name("identify").unwrap().id, IDENTIFY_ID);
        assert!(dict.commands.by_name("queue_step").is_some());
        // The blob round-trips through its compressed transfer form.
        let parsed = Dictionary::from_zlib(&dict.to_zlib()).unwrap();
        assert_eq!(parsed.version, "sim-mcu-1");
    }

    #[test]
    fn queue_step_reconstructs_and_validates() {
        let sim = SimMcu::new("/tmp/unused-sim.sock");
        let blob = Bytes::from(sim.dict.to_zlib());
        {
            let mut state = sim.state.lock();
            state.allocated_oids = 1;
            state.steppers.insert(0, SimStepper::default());
            state.steppers.get_mut(&0).unwrap().last_clock = 1000;
        }
        let cmd = Command::new(
            "queue_step",
            vec![
                Value::U8(0),
                Value::U32(100),
                Value::U16(3),
                Value::I16(10),
            ],
        );
        // Current clock well behind the run's end.
        assert!(sim.execute(&cmd, 0, &blob).is_none());
        let state = sim.state.lock();
        let stepper = &state.steppers[&0];
        assert_eq!(stepper.step_clocks, vec![1100, 1210, 1330]);
        assert_eq!(stepper.position, 3);
        assert_eq!(stepper.last_clock, 1330);
    }

    #[test]
    fn late_run_is_a_shutdown() {
        let sim = SimMcu::new("/tmp/unused-sim2.sock");
        let blob = Bytes::from(sim.dict.to_zlib());
        {
            let mut state = sim.state.lock();
            state.allocated_oids = 1;
            state.steppers.insert(0, SimStepper::default());
        }
        let cmd = Command::new(
            "queue_step",
            vec![Value::U8(0), Value::U32(10), Value::U16(1), Value::I16(0)],
        );
        // Clock far past the step time.
        let response = sim.execute(&cmd, 1_000_000, &blob).unwrap();
        assert_eq!(response.name, "shutdown");
        assert!(sim.state.lock().shutdown.is_some());
    }

    #[test]
    fn clock_extension_follows_reference() {
        assert_eq!(extend_clock(100, 0), 100);
        assert_eq!(extend_clock(0x10, 0x2_0000_0000), 0x2_0000_0010);
        assert_eq!(extend_clock(0xffff_fff0, 0x2_0000_0000), 0x1_ffff_fff0);
    }
}
