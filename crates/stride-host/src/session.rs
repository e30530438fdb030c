//! One MCU session: connection, negotiation, and the I/O worker.
//!
//! A session owns its transport exclusively. The control task talks to it
//! through a pair of bounded channels: commands in, events out. Inside, the
//! worker multiplexes four sources: commands from the controller, frames
//! from the MCU, the retransmission deadline, and the clock-query timer.
//!
//! Session start is sequential: fetch and pin the command dictionary
//! (`identify` chunks of zlib JSON), then run the clock warm-up, then hand
//! the session to the worker loop. Any failure during start is fatal for
//! the session.

use crate::clocksync::{ClockSync, HostClock, QUERY_INTERVAL, WARMUP_INTERVAL, WARMUP_SAMPLES};
use crate::error::{FatalEvent, HostError};
use crate::link::{AckOutcome, Link, ReceiveWindow};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stride_proto::command::{decode_batch, encode_batch, Command, Value};
use stride_proto::dictionary::Dictionary;
use stride_proto::frame::{Frame, PAYLOAD_MAX};
use stride_proto::FrameCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Dictionary bytes requested per identify exchange.
const IDENTIFY_CHUNK: u8 = 40;
/// Consecutive protocol errors before the session gives up.
const MAX_PROTOCOL_ERRORS: u32 = 5;
/// Timeout on each step of session start.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Instructions from the control task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Encode and reliably deliver a command batch, in order.
    Send(Vec<Command>),
    /// Flush outstanding traffic and stop the worker.
    Close,
}

/// Notifications to the control task.
#[derive(Debug)]
pub enum SessionEvent {
    /// Dictionary pinned and clock warmed up; the session is usable.
    Ready {
        session: usize,
        dict_version: String,
    },
    /// A refreshed clock estimate.
    Clock {
        session: usize,
        estimate: crate::clocksync::ClockEstimate,
    },
    /// A response not consumed by the session itself (stats, oid data…).
    Response { session: usize, command: Command },
    /// The session died; the controller must halt the printer.
    Fatal(FatalEvent),
}

/// Controller-side handle to a running session worker.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub index: usize,
    pub name: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Queues a batch without blocking; `false` means the session's queue
    /// is full and the caller should back off (backpressure).
    pub fn try_send(&self, commands: Vec<Command>) -> bool {
        self.tx.try_send(SessionCommand::Send(commands)).is_ok()
    }

    pub async fn send(&self, commands: Vec<Command>) -> Result<(), HostError> {
        self.tx
            .send(SessionCommand::Send(commands))
            .await
            .map_err(|_| HostError::TransportClosed)
    }

    pub async fn close(&self) {
        let _ = self.tx.send(SessionCommand::Close).await;
    }
}

/// A connected, negotiated session ready to run.
pub struct Session<T> {
    index: usize,
    framed: Framed<T, FrameCodec>,
    link: Link,
    rx_win: ReceiveWindow,
    dict: Dictionary,
    sync: ClockSync,
    host_clock: HostClock,
    /// Encoded payloads waiting for window room.
    backlog: VecDeque<Bytes>,
    /// Acks and retransmissions: sequenced already, sent ahead of backlog.
    control_frames: VecDeque<Frame>,
    protocol_errors: u32,
    /// Send time of the outstanding get_clock query, if any.
    clock_query_sent: Option<f64>,
    next_clock_query: f64,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Connects over `transport`: pins the dictionary and warms up the
    /// clock estimator.
    pub async fn connect(
        index: usize,
        transport: T,
        nominal_freq: f64,
        host_clock: HostClock,
    ) -> Result<Self, HostError> {
        let mut session = Session {
            index,
            framed: Framed::new(transport, FrameCodec::new()),
            link: Link::new(),
            rx_win: ReceiveWindow::new(),
            dict: Dictionary::bootstrap(),
            sync: ClockSync::new(nominal_freq),
            host_clock,
            backlog: VecDeque::new(),
            control_frames: VecDeque::new(),
            protocol_errors: 0,
            clock_query_sent: None,
            next_clock_query: 0.0,
        };
        session.fetch_dictionary().await?;
        session.warm_up_clock().await?;
        Ok(session)
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn dict_version(&self) -> &str {
        &self.dict.version
    }

    async fn fetch_dictionary(&mut self) -> Result<(), HostError> {
        let mut blob = Vec::new();
        loop {
            let identify = Command::new(
                "identify",
                vec![
                    Value::U32(blob.len() as u32),
                    Value::U8(IDENTIFY_CHUNK),
                ],
            );
            let response = tokio::time::timeout(
                START_TIMEOUT,
                self.request(identify, "identify_response"),
            )
            .await
            .map_err(|_| HostError::SessionFailed {
                retries: 0,
                last: "identify timed out".into(),
            })??;

            let offset = response.args[0].as_u32().unwrap_or(u32::MAX) as usize;
            let data = response.args[1].as_bytes().unwrap_or_default();
            if offset != blob.len() {
                // Stale response from a retransmitted identify; re-request.
                continue;
            }
            blob.extend_from_slice(data);
            if data.len() < IDENTIFY_CHUNK as usize {
                break;
            }
        }
        self.dict = Dictionary::from_zlib(&blob)?;
        info!(
            session = self.index,
            version = %self.dict.version,
            commands = self.dict.commands.names().count(),
            "dictionary pinned"
        );
        Ok(())
    }

    async fn warm_up_clock(&mut self) -> Result<(), HostError> {
        for _ in 0..WARMUP_SAMPLES {
            let sent = self.host_clock.now();
            let response = tokio::time::timeout(
                START_TIMEOUT,
                self.request(Command::new("get_clock", vec![]), "clock"),
            )
            .await
            .map_err(|_| HostError::SessionFailed {
                retries: 0,
                last: "clock warm-up timed out".into(),
            })??;
            let clock32 = response.args[0].as_u32().unwrap_or(0);
            self.sync.update(sent, self.host_clock.now(), clock32);
            tokio::time::sleep(Duration::from_secs_f64(WARMUP_INTERVAL)).await;
        }
        self.next_clock_query = self.host_clock.now() + QUERY_INTERVAL;
        debug!(
            session = self.index,
            freq = self.sync.estimated_freq(),
            "clock warm-up complete"
        );
        Ok(())
    }

    /// Sends one command and reads frames until the named response arrives.
    /// Used only during sequential session start.
    async fn request(&mut self, command: Command, response: &str) -> Result<Command, HostError> {
        self.enqueue_batch(&[command])?;
        self.pump_backlog().await?;
        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or(HostError::TransportClosed)??;
            if let Some(found) = self.take_frame(&frame, response)? {
                return Ok(found);
            }
            self.pump_backlog().await?;
        }
    }

    /// Handles one inbound frame; returns a response matching `wanted`.
    fn take_frame(
        &mut self,
        frame: &Frame,
        wanted: &str,
    ) -> Result<Option<Command>, HostError> {
        if frame.is_ack() {
            if let AckOutcome::Retransmit(frames) = self.link.on_ack(frame.seq, self.host_clock.now())
            {
                for f in frames {
                    self.queue_frame(f);
                }
            }
            return Ok(None);
        }
        if !self.rx_win.accept(frame.seq) {
            self.queue_frame(self.rx_win.ack_frame());
            return Ok(None);
        }
        self.queue_frame(self.rx_win.ack_frame());
        let commands = decode_batch(&frame.payload, &self.dict.responses)?;
        for command in commands {
            if command.name == wanted {
                return Ok(Some(command));
            }
            debug!(session = self.index, name = %command.name, "response during start ignored");
        }
        Ok(None)
    }

    fn enqueue_batch(&mut self, commands: &[Command]) -> Result<(), HostError> {
        // Pack commands greedily into frame-sized payloads, preserving
        // order.
        let mut current = bytes::BytesMut::new();
        for command in commands {
            let one = encode_batch(std::slice::from_ref(command), &self.dict.commands)?;
            if !current.is_empty() && current.len() + one.len() > PAYLOAD_MAX {
                self.backlog.push_back(current.split().freeze());
            }
            current.extend_from_slice(&one);
        }
        if !current.is_empty() {
            self.backlog.push_back(current.freeze());
        }
        Ok(())
    }

    fn queue_frame(&mut self, frame: Frame) {
        // Control frames (acks, retransmissions) bypass the window and the
        // backlog; they already carry their sequence.
        self.control_frames.push_back(frame);
    }

    /// Writes control frames and as much backlog as the window allows.
    async fn pump_backlog(&mut self) -> Result<(), HostError> {
        while let Some(frame) = self.control_frames.pop_front() {
            self.framed.send(frame).await?;
        }
        while self.link.can_send() {
            let Some(payload) = self.backlog.pop_front() else {
                break;
            };
            let frame = self.link.send(payload, self.host_clock.now());
            self.framed.send(frame).await?;
        }
        Ok(())
    }

    /// The worker loop. Consumes the session; exits on `Close`, transport
    /// loss, or a fatal error (reported through `events`).
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
        shutdown: Arc<AtomicBool>,
    ) {
        let _ = events
            .send(SessionEvent::Ready {
                session: self.index,
                dict_version: self.dict.version.clone(),
            })
            .await;
        // The warm-up estimate is usable immediately; publish it so the
        // controller can schedule before the first periodic query lands.
        let _ = events
            .send(SessionEvent::Clock {
                session: self.index,
                estimate: self.sync.estimate(),
            })
            .await;

        let fatal = loop {
            if shutdown.load(Ordering::SeqCst) {
                // Drain the command queue before exiting so the coordinated
                // halt (clear_queue, emergency_stop) still goes out.
                while let Ok(SessionCommand::Send(commands)) = rx.try_recv() {
                    let _ = self.enqueue_batch(&commands);
                }
                break None;
            }
            if let Err(e) = self.pump_backlog().await {
                break Some(e);
            }
            let now = self.host_clock.now();
            let deadline = self
                .link
                .next_deadline()
                .unwrap_or(f64::MAX)
                .min(self.next_clock_query);
            let sleep = Duration::from_secs_f64((deadline - now).clamp(0.0, 1.0));

            tokio::select! {
                command = rx.recv() => match command {
                    Some(SessionCommand::Send(commands)) => {
                        if let Err(e) = self.enqueue_batch(&commands) {
                            break Some(e);
                        }
                    }
                    Some(SessionCommand::Close) | None => break None,
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(frame, &events).await {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(e.into()),
                    None => break Some(HostError::TransportClosed),
                },
                _ = tokio::time::sleep(sleep) => {
                    if let Err(e) = self.on_tick() {
                        break Some(e);
                    }
                }
            }
        };

        if let Some(error) = fatal {
            warn!(session = self.index, %error, "session failed");
            let _ = events
                .send(SessionEvent::Fatal(FatalEvent::from_error(
                    &error,
                    Some(self.index),
                )))
                .await;
        }
        // Flush whatever the window allows before exiting.
        let _ = self.pump_backlog().await;
        let _ = self.framed.flush().await;
        info!(session = self.index, "session worker exited");
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), HostError> {
        if frame.is_ack() {
            match self.link.on_ack(frame.seq, self.host_clock.now()) {
                AckOutcome::Retransmit(frames) => {
                    self.note_protocol_error("duplicate acks")?;
                    for f in frames {
                        self.queue_frame(f);
                    }
                }
                AckOutcome::Advanced(_) | AckOutcome::Duplicate => {}
            }
            return Ok(());
        }
        if !self.rx_win.accept(frame.seq) {
            self.queue_frame(self.rx_win.ack_frame());
            return Ok(());
        }
        self.queue_frame(self.rx_win.ack_frame());

        let commands = match decode_batch(&frame.payload, &self.dict.responses) {
            Ok(commands) => {
                self.protocol_errors = 0;
                commands
            }
            Err(e) => {
                self.note_protocol_error(&e.to_string())?;
                return Ok(());
            }
        };
        for command in commands {
            self.route_response(command, events).await?;
        }
        Ok(())
    }

    async fn route_response(
        &mut self,
        command: Command,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<(), HostError> {
        match command.name.as_str() {
            "clock" => {
                let clock32 = command.args[0].as_u32().unwrap_or(0);
                let receive_time = self.host_clock.now();
                if let Some(sent) = self.clock_query_sent.take() {
                    self.sync.update(sent, receive_time, clock32);
                    if self.sync.drift_exceeded(receive_time) {
                        return Err(HostError::ClockDrift {
                            ppm: 25.0,
                            seconds: self.sync.drift_duration(receive_time).unwrap_or(0.0),
                        });
                    }
                    let _ = events
                        .send(SessionEvent::Clock {
                            session: self.index,
                            estimate: self.sync.estimate(),
                        })
                        .await;
                }
            }
            "shutdown" | "is_shutdown" => {
                let reason = match command.args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    Some(Value::U16(id)) => format!("static string {id}"),
                    _ => "unknown".to_string(),
                };
                return Err(HostError::McuShutdown(reason));
            }
            _ => {
                let _ = events
                    .send(SessionEvent::Response {
                        session: self.index,
                        command,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Timer tick: retransmission timeout and the periodic clock query.
    fn on_tick(&mut self) -> Result<(), HostError> {
        let now = self.host_clock.now();
        let expired = self.link.on_timeout(now);
        if !expired.is_empty() {
            self.note_protocol_error("retransmission timeout")?;
            for f in expired {
                self.queue_frame(f);
            }
        }
        if now >= self.next_clock_query {
            self.next_clock_query = now + QUERY_INTERVAL;
            if self.clock_query_sent.is_none() {
                self.clock_query_sent = Some(now);
                self.enqueue_batch(&[Command::new("get_clock", vec![])])?;
            }
        }
        Ok(())
    }

    fn note_protocol_error(&mut self, cause: &str) -> Result<(), HostError> {
        self.protocol_errors += 1;
        warn!(
            session = self.index,
            count = self.protocol_errors,
            cause,
            "protocol error"
        );
        if self.protocol_errors >= MAX_PROTOCOL_ERRORS {
            return Err(HostError::SessionFailed {
                retries: self.protocol_errors,
                last: cause.to_string(),
            });
        }
        Ok(())
    }
}

/// Depth of the controller→session command queue; when full, the planner
/// flush path backs off rather than buffering unboundedly.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Moves a connected session onto its worker task and returns the
/// controller-side handle.
pub fn spawn<T>(
    session: Session<T>,
    name: String,
    events: mpsc::Sender<SessionEvent>,
    shutdown: Arc<AtomicBool>,
) -> SessionHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let index = session.index;
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    tokio::spawn(session.run(rx, events, shutdown));
    SessionHandle { index, name, tx }
}
