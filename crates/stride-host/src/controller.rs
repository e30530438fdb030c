//! The control task: planner, step scheduling, and dispatch.
//!
//! One task owns the toolhead, the kinematics handle, the per-stepper step
//! generators and compressors, and the session handles. It never blocks:
//! work happens on a fixed-period tick, and everything else arrives over
//! channels. Motion requests flow in from the front-end boundary; session
//! events (clock estimates, responses, fatal errors) flow in from the
//! session workers.
//!
//! Every tick the controller pulls finalized moves out of the look-ahead
//! queue, integrates each stepper's trajectory into ideal step times,
//! converts them to MCU clocks through the session's current estimate, and
//! flushes compressed triples whose deadlines fall inside the transmit
//! window. Backpressure from a session leaves triples queued for the next
//! tick.

use crate::clocksync::{ClockEstimate, HostClock};
use crate::error::{FatalEvent, FatalKind, HostError};
use crate::session::{SessionEvent, SessionHandle};
use crate::state::{PrinterState, PrinterStatus};
use motion::kinematics::Kinematics;
use motion::planner::Move;
use motion::stepgen::{PlannedStep, StepGenerator};
use motion::toolhead::Toolhead;
use motion::{MotionError, Pos};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stride_proto::command::{Command, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Control loop period.
const TICK: Duration = Duration::from_millis(50);
/// Triples are not transmitted further ahead than this (bounds what a
/// retransmission can lose).
const MAX_LEAD: f64 = 0.500;
/// Freshly started timelines begin this far in the future, giving the
/// schedule room to stream ahead of execution.
const SCHEDULE_AHEAD: f64 = 0.300;

/// Requests from the host's front-end boundary.
#[derive(Debug)]
pub enum MotionRequest {
    MoveTo {
        end: Pos,
        speed: f64,
        reply: oneshot::Sender<Result<(), MotionError>>,
    },
    /// Finalize everything pending.
    Flush,
    /// Operator reset after a fault: re-establish position, reopen intake.
    Reset { position: Pos },
    EmergencyStop,
}

/// Cloneable entry point for submitting motion requests.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<MotionRequest>,
}

impl ControllerHandle {
    pub async fn move_to(&self, end: Pos, speed: f64) -> Result<(), MotionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MotionRequest::MoveTo { end, speed, reply })
            .await
            .map_err(|_| MotionError::InvalidMove("controller gone".into()))?;
        rx.await
            .map_err(|_| MotionError::InvalidMove("controller gone".into()))?
    }

    pub async fn flush(&self) {
        let _ = self.tx.send(MotionRequest::Flush).await;
    }

    pub async fn reset(&self, position: Pos) {
        let _ = self.tx.send(MotionRequest::Reset { position }).await;
    }

    pub async fn emergency_stop(&self) {
        let _ = self.tx.send(MotionRequest::EmergencyStop).await;
    }
}

/// Per-stepper scheduling state alongside the motion-crate stepper.
struct StepperSchedule {
    generator: StepGenerator,
    /// Needs a reset_step_clock before its next queue_step.
    needs_reset: bool,
    /// queue_step commands awaiting session window room.
    outbox: VecDeque<Command>,
}

pub struct Controller {
    toolhead: Toolhead,
    kinematics: Box<dyn Kinematics>,
    sessions: Vec<SessionHandle>,
    estimates: Vec<Option<ClockEstimate>>,
    schedules: Vec<StepperSchedule>,
    host_clock: HostClock,
    state: Arc<Mutex<PrinterState>>,
    shutdown: Arc<AtomicBool>,
    events: mpsc::Receiver<SessionEvent>,
    requests: mpsc::Receiver<MotionRequest>,
    /// Configuration batches sent to each session once every session has
    /// negotiated (oid allocation, stepper config, finalize).
    config_batches: Vec<Vec<Command>>,
    ready_sessions: usize,
    fatal: bool,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        toolhead: Toolhead,
        kinematics: Box<dyn Kinematics>,
        sessions: Vec<SessionHandle>,
        events: mpsc::Receiver<SessionEvent>,
        host_clock: HostClock,
        state: Arc<Mutex<PrinterState>>,
        shutdown: Arc<AtomicBool>,
        config_batches: Vec<Vec<Command>>,
    ) -> (Self, ControllerHandle) {
        let (tx, requests) = mpsc::channel(64);
        let schedules = toolhead
            .steppers()
            .iter()
            .map(|_| StepperSchedule {
                generator: StepGenerator::new(0.0),
                needs_reset: true,
                outbox: VecDeque::new(),
            })
            .collect();
        let estimates = vec![None; sessions.len()];
        let controller = Controller {
            toolhead,
            kinematics,
            sessions,
            estimates,
            schedules,
            host_clock,
            state,
            shutdown,
            events,
            requests,
            config_batches,
            ready_sessions: 0,
            fatal: false,
        };
        (controller, ControllerHandle { tx })
    }

    /// The control loop. Runs until shutdown is latched and traffic has
    /// drained.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tick.tick() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    self.on_tick();
                }
            }
        }
        info!("controller exited");
    }

    async fn handle_request(&mut self, request: MotionRequest) {
        match request {
            MotionRequest::MoveTo { end, speed, reply } => {
                let result = self.accept_move(end, speed);
                if let Err(MotionError::OutOfBounds { .. }) = &result {
                    // The toolhead has already drained; mirror it as a
                    // fatal print-abort event.
                    self.report_fatal(FatalEvent::new(
                        FatalKind::OutOfBounds,
                        None,
                        result.as_ref().unwrap_err().to_string(),
                    ))
                    .await;
                }
                let _ = reply.send(result);
            }
            MotionRequest::Flush => {
                let moves = self.toolhead.flush();
                self.schedule_moves(moves);
            }
            MotionRequest::Reset { position } => {
                self.toolhead.reset(position);
                self.fatal = false;
                for schedule in &mut self.schedules {
                    schedule.needs_reset = true;
                    schedule.outbox.clear();
                }
                self.state.lock().status = PrinterStatus::Ready;
            }
            MotionRequest::EmergencyStop => {
                self.report_fatal(FatalEvent::new(
                    FatalKind::Internal,
                    None,
                    "operator emergency stop",
                ))
                .await;
            }
        }
    }

    fn accept_move(&mut self, end: Pos, speed: f64) -> Result<(), MotionError> {
        if self.fatal {
            return Err(MotionError::InvalidMove("printer is halted".into()));
        }
        if !self.all_ready() {
            return Err(MotionError::InvalidMove("sessions not ready".into()));
        }
        // A fresh burst starts its timeline a little in the future so the
        // schedule can stream ahead of the MCU.
        if self.toolhead.pending_moves() == 0 && self.all_steppers_idle() {
            self.toolhead
                .set_print_time(self.host_clock.now() + SCHEDULE_AHEAD);
        }
        self.toolhead.move_to(self.kinematics.as_ref(), end, speed)?;
        if self.compressors_have_room() {
            let moves = self.toolhead.pull_moves();
            self.schedule_moves(moves);
        }
        Ok(())
    }

    /// Backpressure gate: while any compressor is running full, finalized
    /// moves stay in the look-ahead queue instead of being scheduled. The
    /// condition never reaches the caller; it only slows the flush path.
    fn compressors_have_room(&self) -> bool {
        const HIGH_WATER: usize = 32_768;
        self.toolhead
            .steppers()
            .iter()
            .all(|s| s.compress.pending() < HIGH_WATER)
    }

    /// Every session has negotiated and produced a clock estimate.
    fn all_ready(&self) -> bool {
        self.ready_sessions == self.sessions.len() && self.estimates.iter().all(Option::is_some)
    }

    fn all_steppers_idle(&self) -> bool {
        self.toolhead
            .steppers()
            .iter()
            .zip(&self.schedules)
            .all(|(s, sched)| s.compress.pending() == 0 && sched.outbox.is_empty())
    }

    /// Turns finalized moves into per-stepper ideal step times and queues
    /// them on the compressors.
    fn schedule_moves(&mut self, moves: Vec<Move>) {
        if moves.is_empty() {
            return;
        }
        self.state.lock().status = PrinterStatus::Printing;
        let mut steps: Vec<PlannedStep> = Vec::new();
        for mv in &moves {
            for contribution in self.toolhead.contributions(self.kinematics.as_ref(), mv) {
                let index = contribution.stepper;
                steps.clear();
                self.schedules[index]
                    .generator
                    .generate(contribution.curve.as_ref(), mv.print_time, &mut steps);
                if steps.is_empty() {
                    continue;
                }
                if let Err(e) = self.queue_steps(index, &steps) {
                    let event =
                        FatalEvent::from_error(&HostError::Motion(e), None);
                    // queue_steps failures are step-order violations or
                    // backpressure overflow; both halt motion.
                    self.spawn_fatal(event);
                    return;
                }
            }
        }
    }

    /// Feeds one stepper's planned steps into its compressor, handling
    /// clock reset and direction changes.
    fn queue_steps(&mut self, index: usize, steps: &[PlannedStep]) -> Result<(), MotionError> {
        let session_index = self.toolhead.steppers()[index].mcu;
        let Some(estimate) = self.estimates[session_index] else {
            return Err(MotionError::InvalidMove(
                "no clock estimate for session".into(),
            ));
        };
        let oid = self.toolhead.steppers()[index].oid;

        if self.schedules[index].needs_reset {
            let clock = estimate.clock_at(steps[0].time).saturating_sub(1);
            self.toolhead.steppers_mut()[index].compress.reset_clock(clock);
            self.schedules[index].needs_reset = false;
            self.schedules[index].outbox.push_back(Command::new(
                "reset_step_clock",
                vec![Value::U8(oid), Value::U32(clock as u32)],
            ));
            let dir = steps[0].dir;
            self.toolhead.steppers_mut()[index].dir = dir;
            self.schedules[index].outbox.push_back(Command::new(
                "set_next_step_dir",
                vec![Value::U8(oid), Value::U8(dir as u8)],
            ));
        }

        // All steps of one contribution share a direction; a flip relative
        // to the stepper's last commanded direction must drain the pending
        // window first so the dir command lands between runs.
        let dir = steps[0].dir;
        if dir != self.toolhead.steppers()[index].dir {
            self.drain_compressor(index, oid)?;
            self.toolhead.steppers_mut()[index].dir = dir;
            self.schedules[index].outbox.push_back(Command::new(
                "set_next_step_dir",
                vec![Value::U8(oid), Value::U8(dir as u8)],
            ));
        }

        let stepper = &mut self.toolhead.steppers_mut()[index];
        for step in steps {
            stepper.compress.append(estimate.clock_at(step.time))?;
        }
        stepper.position += if dir {
            steps.len() as i64
        } else {
            -(steps.len() as i64)
        };
        Ok(())
    }

    fn drain_compressor(&mut self, index: usize, oid: u8) -> Result<(), MotionError> {
        let triples = self.toolhead.steppers_mut()[index].compress.flush_all()?;
        for t in triples {
            self.schedules[index].outbox.push_back(Command::new(
                "queue_step",
                vec![
                    Value::U8(oid),
                    Value::U32(t.interval),
                    Value::U16(t.count),
                    Value::I16(t.add),
                ],
            ));
        }
        Ok(())
    }

    /// The periodic flush: compress up to the transmit horizon and push
    /// whatever the sessions will take.
    fn on_tick(&mut self) {
        if self.fatal {
            return;
        }
        if self.compressors_have_room() {
            let moves = self.toolhead.pull_moves();
            self.schedule_moves(moves);
        }

        let now = self.host_clock.now();
        for index in 0..self.schedules.len() {
            let session_index = self.toolhead.steppers()[index].mcu;
            let Some(estimate) = self.estimates[session_index] else {
                continue;
            };
            let oid = self.toolhead.steppers()[index].oid;
            let horizon = estimate.clock_at(now + MAX_LEAD);
            let triples = match self.toolhead.steppers_mut()[index].compress.flush(horizon) {
                Ok(triples) => triples,
                Err(e) => {
                    let event = FatalEvent::from_error(&HostError::Motion(e), None);
                    self.spawn_fatal(event);
                    return;
                }
            };
            for t in triples {
                self.schedules[index].outbox.push_back(Command::new(
                    "queue_step",
                    vec![
                        Value::U8(oid),
                        Value::U32(t.interval),
                        Value::U16(t.count),
                        Value::I16(t.add),
                    ],
                ));
            }
            self.push_outbox(index, session_index);
        }

        if self.toolhead.pending_moves() == 0 && self.all_steppers_idle() {
            // Idle: the next burst re-bases each stepper's clock, so an
            // arbitrarily long pause never has to fit in a step interval.
            for schedule in &mut self.schedules {
                schedule.needs_reset = true;
            }
            let mut state = self.state.lock();
            if state.status == PrinterStatus::Printing {
                state.status = PrinterStatus::Ready;
            }
        }
    }

    /// Sends queued commands to the session, a frame's worth at a time,
    /// stopping at backpressure.
    fn push_outbox(&mut self, index: usize, session_index: usize) {
        const BATCH: usize = 4;
        while !self.schedules[index].outbox.is_empty() {
            let take = BATCH.min(self.schedules[index].outbox.len());
            let batch: Vec<Command> = self.schedules[index]
                .outbox
                .iter()
                .take(take)
                .cloned()
                .collect();
            if self.sessions[session_index].try_send(batch) {
                self.schedules[index].outbox.drain(..take);
            } else {
                debug!(stepper = index, "session backpressure; deferring");
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Ready {
                session,
                dict_version,
            } => {
                info!(session, version = %dict_version, "session ready");
                self.ready_sessions += 1;
                self.maybe_mark_ready().await;
            }
            SessionEvent::Clock { session, estimate } => {
                self.estimates[session] = Some(estimate);
                self.maybe_mark_ready().await;
            }
            SessionEvent::Response { session, command } => {
                debug!(session, name = %command.name, "unrouted response");
            }
            SessionEvent::Fatal(event) => {
                self.report_fatal(event).await;
            }
        }
    }

    /// On the first moment every session is negotiated with a usable clock
    /// estimate: push the MCU configuration batches and mark Ready.
    async fn maybe_mark_ready(&mut self) {
        if !self.all_ready() || self.config_batches.is_empty() {
            return;
        }
        for (session, batch) in self
            .sessions
            .iter()
            .zip(std::mem::take(&mut self.config_batches))
        {
            if !batch.is_empty() {
                let _ = session.send(batch).await;
            }
        }
        let mut state = self.state.lock();
        state.status = PrinterStatus::Ready;
        state.status_message = "printer is ready".to_string();
    }

    /// Coordinated halt: one failure stops every session of the printer.
    async fn report_fatal(&mut self, event: FatalEvent) {
        if self.fatal {
            return;
        }
        self.fatal = true;
        error!(
            kind = ?event.kind,
            session = ?event.session,
            cause = %event.cause,
            "fatal event; halting all sessions"
        );
        self.toolhead.drain();
        for schedule in &mut self.schedules {
            schedule.outbox.clear();
        }
        for stepper in self.toolhead.steppers_mut() {
            stepper.compress.discard();
        }
        for session in &self.sessions {
            let _ = session
                .send(vec![
                    Command::new("clear_queue", vec![]),
                    Command::new("emergency_stop", vec![]),
                ])
                .await;
        }
        self.state.lock().latch_fatal(event);
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// report_fatal for non-async call sites on the tick path.
    fn spawn_fatal(&mut self, event: FatalEvent) {
        // The tick path cannot await; latch immediately and let the next
        // loop iteration do the session notification.
        error!(kind = ?event.kind, cause = %event.cause, "fatal event; halting all sessions");
        self.toolhead.drain();
        self.state.lock().latch_fatal(event);
        self.fatal = true;
        for stepper in self.toolhead.steppers_mut() {
            stepper.compress.discard();
        }
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            for session in &sessions {
                let _ = session
                    .send(vec![
                        Command::new("clear_queue", vec![]),
                        Command::new("emergency_stop", vec![]),
                    ])
                    .await;
            }
        });
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
