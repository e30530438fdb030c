//! Step compression.
//!
//! Collapses a queue of ideal step clocks into `(interval, count, add)`
//! triples: `count` steps whose inter-step intervals form an arithmetic
//! progression starting at `interval` with common difference `add`. The MCU
//! reconstructs step `j` of a triple at `j·interval + add·j·(j−1)/2` ticks
//! after the previous step.
//!
//! ## Fitting
//!
//! For a candidate prefix of `n` queued steps, the reconstructed time of
//! step `j` is linear in `(interval, add)`, so each step's tolerance band
//! admits a slab of acceptable `(interval, add)` pairs and the prefix is
//! representable iff the slabs intersect. For a fixed `add` the
//! intersection collapses to an integer interval range, and the range's
//! width is a concave function of `add`; a ternary search over `add`
//! therefore finds the widest feasible column. Feasibility can only shrink
//! as the prefix grows, so the longest representable prefix is found by
//! binary search, and the emitted pair is the center of the widest column
//! (the numerically stable choice).
//!
//! A step may be reconstructed *early* by up to half its preceding
//! interval, clamped to the configured `max_error`, but never late. The
//! one-sided band keeps the reconstruction strictly monotonic and keeps the
//! emitted clock from drifting past ideal steps still in the queue.

use crate::errors::MotionError;
use std::collections::VecDeque;

/// Hard cap on queued, uncompressed steps; hitting it backpressures the
/// planner flush path.
const MAX_PENDING: usize = 65_536;
/// Queued step clocks this far out of order are treated as quantization
/// ties and nudged forward a tick; anything worse is fatal.
const ORDER_SLACK: u64 = 2;

const ADD_MIN: i64 = i16::MIN as i64;
const ADD_MAX: i64 = i16::MAX as i64;

/// One compressed run of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triple {
    /// First inter-step interval, MCU ticks.
    pub interval: u32,
    /// Number of steps.
    pub count: u16,
    /// Per-step interval increment.
    pub add: i16,
}

impl Triple {
    /// Total ticks the run occupies.
    pub fn duration(&self) -> u64 {
        let n = self.count as i64;
        (n * self.interval as i64 + self.add as i64 * n * (n - 1) / 2) as u64
    }
}

/// Per-stepper compression state.
#[derive(Debug)]
pub struct StepCompress {
    max_error: u32,
    /// Ideal step times, absolute MCU clocks, strictly increasing.
    queue: VecDeque<u64>,
    /// Clock of the last step already emitted (or the reset origin).
    last_step_clock: u64,
}

impl StepCompress {
    pub fn new(max_error: u32) -> Self {
        StepCompress {
            max_error,
            queue: VecDeque::new(),
            last_step_clock: 0,
        }
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Clock of the oldest un-emitted step, if any.
    pub fn first_pending_clock(&self) -> Option<u64> {
        self.queue.front().copied()
    }

    /// Re-bases the step clock; legal only with nothing queued.
    pub fn reset_clock(&mut self, clock: u64) {
        debug_assert!(self.queue.is_empty());
        self.last_step_clock = clock;
    }

    /// Discards queued steps without emitting (shutdown path).
    pub fn discard(&mut self) {
        self.queue.clear();
    }

    /// Queues one ideal step clock.
    ///
    /// Clocks must be strictly increasing; an equal or marginally earlier
    /// clock (a quantization tie) is nudged one tick forward.
    pub fn append(&mut self, clock: u64) -> Result<(), MotionError> {
        if self.queue.len() >= MAX_PENDING {
            return Err(MotionError::Backpressure);
        }
        let last = self
            .queue
            .back()
            .copied()
            .unwrap_or(self.last_step_clock);
        let clock = if clock <= last {
            if last - clock <= ORDER_SLACK {
                last + 1
            } else {
                return Err(MotionError::StepOrderViolation { clock, last });
            }
        } else {
            clock
        };
        self.queue.push_back(clock);
        Ok(())
    }

    /// Emits triples covering every queued step at or before `flush_clock`.
    pub fn flush(&mut self, flush_clock: u64) -> Result<Vec<Triple>, MotionError> {
        let mut out = Vec::new();
        loop {
            let avail = self.queue.partition_point(|&c| c <= flush_clock);
            if avail == 0 {
                return Ok(out);
            }
            let triple = self.compress_prefix(avail.min(u16::MAX as usize))?;
            self.last_step_clock += triple.duration();
            self.queue.drain(..triple.count as usize);
            out.push(triple);
        }
    }

    /// Emits everything queued.
    pub fn flush_all(&mut self) -> Result<Vec<Triple>, MotionError> {
        self.flush(u64::MAX)
    }

    /// Finds the longest representable prefix within `limit` and its best
    /// `(interval, add)`.
    fn compress_prefix(&self, limit: usize) -> Result<Triple, MotionError> {
        // Tolerance bands relative to the last emitted step: each step may
        // fire early by at most half its preceding interval (so order is
        // preserved) and never more than max_error.
        let mut lo = Vec::with_capacity(limit);
        let mut hi = Vec::with_capacity(limit);
        let mut prev = 0i64;
        for k in 0..limit {
            let t = (self.queue[k] - self.last_step_clock) as i64;
            let err = ((t - prev) / 2).min(self.max_error as i64);
            lo.push(t - err);
            hi.push(t);
            prev = t;
        }

        // Longest feasible prefix by binary search; n = 1 is always
        // representable (its band contains the exact clock).
        let mut best_n = 1;
        let mut best = column_at(&lo, &hi, 1, 0).expect("single step is always representable");
        let mut lo_n = 2;
        let mut hi_n = limit;
        while lo_n <= hi_n {
            let mid = lo_n + (hi_n - lo_n) / 2;
            match widest_column(&lo, &hi, mid) {
                Some(column) => {
                    best_n = mid;
                    best = column;
                    lo_n = mid + 1;
                }
                None => hi_n = mid - 1,
            }
        }

        let (add, int_lo, int_hi) = best;
        let interval = (int_lo + int_hi) / 2;
        if interval > u32::MAX as i64 {
            // A gap this large must be bridged with reset_step_clock, not a
            // step interval.
            return Err(MotionError::StepOrderViolation {
                clock: self.queue[0],
                last: self.last_step_clock,
            });
        }
        Ok(Triple {
            interval: interval as u32,
            count: best_n as u16,
            add: add as i16,
        })
    }
}

/// The feasible interval range for a prefix of `n` steps at a fixed `add`,
/// or `None` when empty.
fn column_at(lo: &[i64], hi: &[i64], n: usize, add: i64) -> Option<(i64, i64, i64)> {
    let (int_lo, int_hi) = column_range(lo, hi, n, add);
    (int_lo <= int_hi).then_some((add, int_lo, int_hi))
}

fn column_range(lo: &[i64], hi: &[i64], n: usize, add: i64) -> (i64, i64) {
    // Every interval of the progression stays at least one tick, keeping
    // reconstructed clocks strictly increasing.
    let mut int_lo = (1 - add * (n as i64 - 1)).max(1);
    let mut int_hi = i64::MAX;
    for k in 0..n {
        let j = k as i64 + 1;
        let s = j * (j - 1) / 2;
        int_lo = int_lo.max(ceil_div(lo[k] - add * s, j));
        int_hi = int_hi.min(floor_div(hi[k] - add * s, j));
        if int_lo > int_hi {
            break;
        }
    }
    (int_lo, int_hi)
}

/// Searches `add` for the column with the widest feasible interval range.
///
/// The width is concave in `add` (an intersection of half-planes projected
/// onto the interval axis), so a ternary search closes in on the optimum;
/// the final short scan absorbs the ±1 noise integer division introduces.
fn widest_column(lo: &[i64], hi: &[i64], n: usize) -> Option<(i64, i64, i64)> {
    if n == 1 {
        return column_at(lo, hi, 1, 0);
    }
    let width = |add: i64| -> i64 {
        let (int_lo, int_hi) = column_range(lo, hi, n, add);
        int_hi.saturating_sub(int_lo)
    };

    let (mut a, mut b) = (ADD_MIN, ADD_MAX);
    while b - a > 2 {
        let m1 = a + (b - a) / 3;
        let m2 = b - (b - a) / 3;
        if width(m1) < width(m2) {
            a = m1 + 1;
        } else {
            b = m2;
        }
    }
    let best = (a..=b).max_by_key(|&add| width(add))?;
    // Prefer zero add among equally wide columns: it reads as a uniform
    // run and avoids i16 extremes.
    let add = if width(0) >= width(best) { 0 } else { best };
    column_at(lo, hi, n, add)
}

fn floor_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b)
}

fn ceil_div(a: i64, b: i64) -> i64 {
    a.div_euclid(b) + if a.rem_euclid(b) != 0 { 1 } else { 0 }
}
