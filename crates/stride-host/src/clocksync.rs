//! Host↔MCU clock synchronization.
//!
//! Each session keeps an affine estimate `mcu_clock ≈ freq·(host_time −
//! origin_time) + origin_clock`, refined by periodic `get_clock` exchanges.
//! A sample gives the host send/receive interval bracketing the MCU's
//! reading; the estimator is a decaying least-squares regression of clock
//! against send time, weighted against samples whose round trip was
//! inflated. Spike samples are skipped outright rather than polluting the
//! regression.

use std::time::Instant;

/// Regression decay per accepted sample.
const DECAY: f64 = 1.0 / 30.0;
/// Allowed aging of the minimum-RTT reference, seconds of drift per second.
const RTT_AGE: f64 = 0.000010 / (60.0 * 60.0);
/// Interval between get_clock queries once warmed up.
pub const QUERY_INTERVAL: f64 = 0.9839;
/// Number of rapid exchanges during warm-up.
pub const WARMUP_SAMPLES: u32 = 8;
/// Spacing of warm-up exchanges.
pub const WARMUP_INTERVAL: f64 = 0.050;
/// Residual bound for drift detection, parts per million.
const DRIFT_PPM: f64 = 25.0;
/// Sustained-drift window before the session is declared fatal.
const DRIFT_WINDOW: f64 = 5.0;

/// Monotonic host time as f64 seconds, anchored at process start.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        HostClock {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of the affine mapping, cheap to copy across channels.
///
/// The controller converts planned print times with this; only the session
/// worker owns the full estimator state.
#[derive(Debug, Clone, Copy)]
pub struct ClockEstimate {
    pub origin_time: f64,
    pub origin_clock: f64,
    pub freq: f64,
}

impl ClockEstimate {
    pub fn clock_at(&self, host_time: f64) -> u64 {
        let clock = self.origin_clock + (host_time - self.origin_time) * self.freq;
        if clock < 0.0 {
            0
        } else {
            clock as u64
        }
    }

    pub fn time_at(&self, clock: u64) -> f64 {
        self.origin_time + (clock as f64 - self.origin_clock) / self.freq
    }
}

/// Per-session clock estimator.
#[derive(Debug)]
pub struct ClockSync {
    mcu_freq: f64,
    last_clock: u64,

    time_avg: f64,
    time_variance: f64,
    clock_avg: f64,
    clock_covariance: f64,
    prediction_variance: f64,
    last_prediction_time: f64,

    min_half_rtt: f64,
    min_rtt_time: f64,

    est_freq: f64,
    samples: u32,
    drift_since: Option<f64>,
}

impl ClockSync {
    /// `nominal_freq` is the MCU's declared tick rate; the estimator
    /// converges on the true rate from there.
    pub fn new(nominal_freq: f64) -> Self {
        ClockSync {
            mcu_freq: nominal_freq,
            last_clock: 0,
            time_avg: 0.0,
            time_variance: 0.0,
            clock_avg: 0.0,
            clock_covariance: 0.0,
            prediction_variance: (0.001 * nominal_freq) * (0.001 * nominal_freq),
            last_prediction_time: 0.0,
            min_half_rtt: f64::MAX,
            min_rtt_time: 0.0,
            est_freq: nominal_freq,
            samples: 0,
            drift_since: None,
        }
    }

    /// Extends a 32-bit MCU clock reading to 64 bits against the last seen
    /// value.
    pub fn clock32_to_clock64(&self, clock32: u32) -> u64 {
        let diff = (clock32 as i64 - self.last_clock as i64) & 0xffff_ffff;
        // Interpret the wrapped difference as signed.
        let diff = diff - ((diff & 0x8000_0000) << 1);
        (self.last_clock as i64 + diff) as u64
    }

    /// Folds in one `get_clock` exchange.
    pub fn update(&mut self, sent_time: f64, receive_time: f64, clock32: u32) {
        let clock = self.clock32_to_clock64(clock32);
        self.last_clock = clock;

        if self.samples == 0 {
            // First sample seeds the regression at the nominal frequency.
            self.time_avg = sent_time;
            self.clock_avg = clock as f64;
            self.est_freq = self.mcu_freq;
            self.min_half_rtt = 0.5 * (receive_time - sent_time);
            self.min_rtt_time = sent_time;
            self.last_prediction_time = sent_time;
            self.samples = 1;
            return;
        }

        let half_rtt = 0.5 * (receive_time - sent_time);
        let aged_rtt = (sent_time - self.min_rtt_time) * RTT_AGE;
        if half_rtt < self.min_half_rtt + aged_rtt {
            self.min_half_rtt = half_rtt;
            self.min_rtt_time = sent_time;
        }

        // Filter out samples that are extreme outliers. Drift tracking sees
        // every sample, including ones the regression will skip: a skipped
        // spike and a drifting clock look identical at first.
        let exp_clock = (sent_time - self.time_avg) * self.est_freq + self.clock_avg;
        self.track_drift(sent_time, clock as f64, exp_clock);
        let clock_diff2 = (clock as f64 - exp_clock) * (clock as f64 - exp_clock);
        if clock_diff2 > 25.0 * self.prediction_variance
            && clock_diff2 > (0.000500 * self.mcu_freq) * (0.000500 * self.mcu_freq)
        {
            if clock as f64 > exp_clock && sent_time < self.last_prediction_time + 10.0 {
                // A spike, not a shift: skip the sample.
                return;
            }
            // Sustained deviation: reset the variance and relearn.
            self.prediction_variance = (0.001 * self.mcu_freq) * (0.001 * self.mcu_freq);
        } else {
            self.last_prediction_time = sent_time;
            self.prediction_variance =
                (1.0 - DECAY) * (self.prediction_variance + clock_diff2 * DECAY);
        }

        // Decaying linear regression of clock against send time.
        let diff_time = sent_time - self.time_avg;
        self.time_avg += DECAY * diff_time;
        self.time_variance = (1.0 - DECAY) * (self.time_variance + diff_time * diff_time * DECAY);
        let diff_clock = clock as f64 - self.clock_avg;
        self.clock_avg += DECAY * diff_clock;
        self.clock_covariance =
            (1.0 - DECAY) * (self.clock_covariance + diff_time * diff_clock * DECAY);

        if self.time_variance > 0.0 {
            let freq = self.clock_covariance / self.time_variance;
            if freq > 0.0 {
                self.est_freq = freq;
            }
        }
        self.samples += 1;
    }

    /// Current affine estimate. The origin is offset by the minimum half
    /// round trip so the mapping aims at the middle of the send window.
    pub fn estimate(&self) -> ClockEstimate {
        ClockEstimate {
            origin_time: self.time_avg + self.min_half_rtt.min(1.0),
            origin_clock: self.clock_avg,
            freq: self.est_freq,
        }
    }

    pub fn estimated_freq(&self) -> f64 {
        self.est_freq
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// True once warm-up has gathered enough samples to trust predictions.
    pub fn is_ready(&self) -> bool {
        self.samples >= WARMUP_SAMPLES
    }

    fn track_drift(&mut self, sent_time: f64, clock: f64, exp_clock: f64) {
        let elapsed = sent_time - self.min_rtt_time.min(sent_time - 1.0);
        let residual_ppm = ((clock - exp_clock) / self.mcu_freq / elapsed).abs() * 1e6;
        if self.is_ready() && residual_ppm > DRIFT_PPM {
            self.drift_since.get_or_insert(sent_time);
        } else {
            self.drift_since = None;
        }
    }

    /// Seconds the estimator has been continuously outside its drift
    /// tolerance, if it currently is.
    pub fn drift_duration(&self, now: f64) -> Option<f64> {
        let since = self.drift_since?;
        let sustained = now - since;
        (sustained > 0.0).then_some(sustained)
    }

    /// True when drift has been sustained long enough to be fatal.
    pub fn drift_exceeded(&self, now: f64) -> bool {
        self.drift_duration(now)
            .is_some_and(|sustained| sustained >= DRIFT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulated MCU: true mapping clock = freq·(t − t0), with the host
    /// observing through symmetric RTT.
    struct FakeMcu {
        freq: f64,
        t0: f64,
    }

    impl FakeMcu {
        fn clock_at(&self, t: f64) -> u64 {
            ((t - self.t0) * self.freq) as u64
        }
    }

    fn converge(sync: &mut ClockSync, mcu: &FakeMcu, start: f64, samples: u32, rtt: f64) -> f64 {
        let mut t = start;
        for i in 0..samples {
            let interval = if i < WARMUP_SAMPLES {
                WARMUP_INTERVAL
            } else {
                QUERY_INTERVAL
            };
            let mid = t + rtt * 0.5;
            sync.update(t, t + rtt, mcu.clock_at(mid) as u32);
            t += interval;
        }
        t
    }

    #[test]
    fn converges_on_a_drifting_clock() {
        // 16 MHz nominal, 10 ppm fast.
        let true_freq = 16e6 * (1.0 + 10e-6);
        let mcu = FakeMcu {
            freq: true_freq,
            t0: 0.0,
        };
        let mut sync = ClockSync::new(16e6);
        let end = converge(&mut sync, &mcu, 1.0, 40, 0.002);

        // After warm-up, a one-second-ahead prediction lands within 10
        // ticks of truth (1 tick × factor 10).
        let est = sync.estimate();
        let horizon = end + 1.0;
        let predicted = est.clock_at(horizon) as i64;
        let truth = mcu.clock_at(horizon) as i64;
        let err = (predicted - truth).abs();
        assert!(err <= 10, "prediction error {err} ticks");
        // The estimated frequency is within 25 ppm of truth.
        let ppm = ((sync.estimated_freq() - true_freq) / true_freq).abs() * 1e6;
        assert!(ppm < 25.0, "frequency error {ppm} ppm");
    }

    #[test]
    fn prediction_stays_tight_under_sampling_noise() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        // 10 ppm drift with jittered readings: each sample's MCU reading is
        // perturbed by ±0.5 µs (tick quantization plus interrupt latency).
        let true_freq = 16e6 * (1.0 + 10e-6);
        let mcu = FakeMcu {
            freq: true_freq,
            t0: 0.0,
        };
        let mut sync = ClockSync::new(16e6);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut t = 1.0;
        for i in 0..60u32 {
            let rtt = 0.002;
            let noise = rng.gen_range(-0.5e-6..0.5e-6);
            let reading = mcu.clock_at(t + rtt * 0.5 + noise) as u32;
            sync.update(t, t + rtt, reading);
            t += if i < WARMUP_SAMPLES {
                WARMUP_INTERVAL
            } else {
                QUERY_INTERVAL
            };
        }

        let est = sync.estimate();
        let horizon = t + 1.0;
        let err = (est.clock_at(horizon) as i64 - mcu.clock_at(horizon) as i64).abs();
        assert!(err <= 10, "noisy prediction error {err} ticks");
    }

    #[test]
    fn spike_samples_are_skipped() {
        let mcu = FakeMcu { freq: 16e6, t0: 0.0 };
        let mut sync = ClockSync::new(16e6);
        let end = converge(&mut sync, &mcu, 1.0, 20, 0.002);
        let freq_before = sync.estimated_freq();

        // One wild sample: clock far ahead of expectation.
        sync.update(end, end + 0.002, (mcu.clock_at(end) + 1_000_000) as u32);
        let drift = (sync.estimated_freq() - freq_before).abs() / freq_before;
        assert!(drift < 1e-6, "spike shifted frequency by {drift}");
    }

    #[test]
    fn clock_extension_handles_wraparound() {
        let mut sync = ClockSync::new(16e6);
        sync.last_clock = 0xffff_ff00;
        // A reading just past the 32-bit wrap.
        let extended = sync.clock32_to_clock64(0x0000_0100);
        assert_eq!(extended, 0x1_0000_0100);
        // A reading just behind stays behind.
        let behind = sync.clock32_to_clock64(0xffff_fe00);
        assert_eq!(behind, 0xffff_fe00);
    }

    #[test]
    fn forward_and_inverse_mapping_agree() {
        let est = ClockEstimate {
            origin_time: 100.0,
            origin_clock: 1.6e9,
            freq: 16e6,
        };
        let t = 123.456;
        let clock = est.clock_at(t);
        assert!((est.time_at(clock) - t).abs() < 1e-6);
    }

    #[test]
    fn sustained_drift_is_detected() {
        let mcu = FakeMcu { freq: 16e6, t0: 0.0 };
        let mut sync = ClockSync::new(16e6);
        let end = converge(&mut sync, &mcu, 1.0, 20, 0.002);
        assert!(!sync.drift_exceeded(end));

        // The MCU clock jumps ahead and keeps running 500 ppm fast; the
        // residuals stay far outside tolerance for the whole window.
        let fast = FakeMcu {
            freq: 16e6 * 1.0005,
            t0: -end * 0.0005 / 1.0005,
        };
        let mut t = end;
        for _ in 0..8 {
            let mid = t + 0.001;
            sync.update(t, t + 0.002, fast.clock_at(mid) as u32);
            t += QUERY_INTERVAL;
        }
        assert!(sync.drift_duration(t).is_some());
        assert!(sync.drift_exceeded(t));
    }
}
