//! Reliable delivery over the framed link.
//!
//! Frames carry 4-bit sequence numbers; the MCU acknowledges by sending an
//! empty frame whose sequence is the next one it expects. The host keeps a
//! window of unacknowledged frames and retransmits go-back-N style on a
//! duplicate acknowledgment or on retransmission timeout. The MCU executes
//! idempotently up to sequence number, so retransmitted frames are safe.
//!
//! The retransmission timeout follows the usual smoothed estimate
//! `srtt + 4·rttvar` with a floor; retransmitted frames do not feed the
//! estimator (their acknowledgment is ambiguous).

use bytes::Bytes;
use stride_proto::frame::{Frame, SEQ_MASK};

/// Maximum unacknowledged frames in flight.
pub const WINDOW: usize = 16;
/// Lower bound on the retransmission timeout, seconds.
const RTO_FLOOR: f64 = 0.025;
/// Initial timeout before any round-trip measurement exists.
const RTO_INITIAL: f64 = 0.250;
/// Duplicate acknowledgments that trigger an immediate retransmit.
const DUP_ACK_LIMIT: u32 = 2;

#[derive(Debug)]
struct InFlight {
    seq: u64,
    payload: Bytes,
    sent_at: f64,
    retransmitted: bool,
}

/// What an incoming acknowledgment did to the window.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Some frames were confirmed; the window advanced.
    Advanced(usize),
    /// Nothing confirmed. After [`DUP_ACK_LIMIT`] of these in a row the
    /// caller receives the frames to retransmit.
    Duplicate,
    /// Duplicate threshold hit: retransmit these now.
    Retransmit(Vec<Frame>),
}

/// Send-side reliability state for one session.
#[derive(Debug)]
pub struct Link {
    next_seq: u64,
    in_flight: Vec<InFlight>,
    dup_acks: u32,
    srtt: f64,
    rttvar: f64,
    rto: f64,
}

impl Link {
    pub fn new() -> Self {
        Link {
            next_seq: 0,
            in_flight: Vec::new(),
            dup_acks: 0,
            srtt: 0.0,
            rttvar: 0.0,
            rto: RTO_INITIAL,
        }
    }

    /// True when the window has room for another frame.
    pub fn can_send(&self) -> bool {
        self.in_flight.len() < WINDOW
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    /// Assigns the next sequence number to `payload` and records it for
    /// retransmission. Callers must check [`Self::can_send`] first.
    pub fn send(&mut self, payload: Bytes, now: f64) -> Frame {
        debug_assert!(self.can_send());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.push(InFlight {
            seq,
            payload: payload.clone(),
            sent_at: now,
            retransmitted: false,
        });
        Frame::new(seq, payload)
    }

    /// Processes an acknowledgment frame's sequence number.
    pub fn on_ack(&mut self, ack_seq: u8, now: f64) -> AckOutcome {
        let Some(front) = self.in_flight.first() else {
            return AckOutcome::Duplicate;
        };
        let confirmed = (ack_seq
            .wrapping_sub((front.seq & SEQ_MASK as u64) as u8)
            & SEQ_MASK) as usize;
        let confirmed = confirmed.min(self.in_flight.len());
        if confirmed == 0 {
            self.dup_acks += 1;
            if self.dup_acks >= DUP_ACK_LIMIT {
                self.dup_acks = 0;
                return AckOutcome::Retransmit(self.retransmit_all(now));
            }
            return AckOutcome::Duplicate;
        }
        self.dup_acks = 0;
        // Round-trip sample from the newest confirmed frame, unless it was
        // ever retransmitted (Karn's rule).
        let newest = &self.in_flight[confirmed - 1];
        if !newest.retransmitted {
            self.update_rtt(now - newest.sent_at);
        }
        self.in_flight.drain(..confirmed);
        AckOutcome::Advanced(confirmed)
    }

    /// Frames whose timeout expired, refreshed for retransmission. Backs
    /// the RTO off by doubling, as the loss signal says the estimate was
    /// optimistic.
    pub fn on_timeout(&mut self, now: f64) -> Vec<Frame> {
        let expired = self
            .in_flight
            .first()
            .is_some_and(|f| now - f.sent_at >= self.rto);
        if !expired {
            return Vec::new();
        }
        self.rto = (self.rto * 2.0).min(1.0);
        self.retransmit_all(now)
    }

    /// Deadline of the oldest unacknowledged frame, if any.
    pub fn next_deadline(&self) -> Option<f64> {
        self.in_flight.first().map(|f| f.sent_at + self.rto)
    }

    fn retransmit_all(&mut self, now: f64) -> Vec<Frame> {
        self.in_flight
            .iter_mut()
            .map(|f| {
                f.sent_at = now;
                f.retransmitted = true;
                Frame::new(f.seq, f.payload.clone())
            })
            .collect()
    }

    fn update_rtt(&mut self, rtt: f64) {
        if self.srtt == 0.0 {
            self.srtt = rtt;
            self.rttvar = rtt * 0.5;
        } else {
            self.rttvar = 0.75 * self.rttvar + 0.25 * (self.srtt - rtt).abs();
            self.srtt = 0.875 * self.srtt + 0.125 * rtt;
        }
        self.rto = (self.srtt + 4.0 * self.rttvar).max(RTO_FLOOR);
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side sequence tracking: which frame we expect next and what to
/// acknowledge.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    next_seq: u64,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts or rejects an incoming data frame by sequence.
    ///
    /// In-order frames advance the window; anything else is dropped (the
    /// sender will retransmit) but still acknowledged with the sequence we
    /// actually expect.
    pub fn accept(&mut self, seq: u8) -> bool {
        if seq == (self.next_seq & SEQ_MASK as u64) as u8 {
            self.next_seq += 1;
            true
        } else {
            false
        }
    }

    /// The acknowledgment frame to send right now.
    pub fn ack_frame(&self) -> Frame {
        Frame::ack(self.next_seq)
    }
}
