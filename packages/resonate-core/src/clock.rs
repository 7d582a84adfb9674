//! Clock synchronization filter.
//!
//! Estimates `(offset, drift)` between the local and the remote monotonic
//! clock from `client/time` / `server/time` round-trips, so that
//! `t_remote ≈ t_local + offset + drift·(t_local − basis)`.
//!
//! The filter is a pure value object. Updates run under an update-side lock
//! and publish an immutable [`ClockSnapshot`]; readers swap the snapshot
//! pointer out and never contend with an in-flight update.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::protocol_constants::{
    CLOCK_EXCURSION_MICROS, CLOCK_FATAL_COVARIANCE, CLOCK_POLL_FAST, CLOCK_POLL_SLOW,
    CLOCK_SETTLE_COVARIANCE,
};

/// Rolling window used for the round-trip outlier threshold.
const DELAY_WINDOW: usize = 8;

/// Samples required before outlier rejection kicks in.
const DELAY_WINDOW_MIN: usize = 5;

/// Measurement noise floor (µs²) for a zero-delay round-trip.
const MEASUREMENT_NOISE_FLOOR: f64 = 100.0;

/// Offset random-walk density, µs² per µs of elapsed time.
const PROCESS_NOISE_OFFSET: f64 = 1.0e-5;

/// Drift random-walk density per µs of elapsed time.
const PROCESS_NOISE_DRIFT: f64 = 1.0e-18;

/// Returns the process-wide monotonic clock in microseconds.
///
/// All wire timestamps originating from this process use this basis.
pub fn now_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

/// Immutable published estimate. Readers always observe a consistent
/// `(offset, drift, basis)` triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    /// Estimated remote-minus-local offset at `basis`, microseconds.
    pub offset: f64,
    /// Estimated relative frequency error, dimensionless (µs per µs).
    pub drift: f64,
    /// Local-clock microseconds the estimate is anchored to.
    pub basis: i64,
    /// Offset error covariance, µs².
    pub covariance: f64,
}

impl ClockSnapshot {
    /// Drift expressed in parts per million.
    pub fn drift_ppm(&self) -> f64 {
        self.drift * 1.0e6
    }

    /// Maps a local-clock time to the remote clock.
    pub fn to_remote(&self, local: i64) -> i64 {
        let elapsed = (local - self.basis) as f64;
        (local as f64 + self.offset + self.drift * elapsed).round() as i64
    }

    /// Maps a remote-clock time to the local clock.
    pub fn to_local(&self, remote: i64) -> i64 {
        // Inverse of to_remote: t_r = t_l + o + d(t_l - basis).
        let numerator = remote as f64 - self.offset + self.drift * self.basis as f64;
        (numerator / (1.0 + self.drift)).round() as i64
    }
}

/// Outcome of feeding one round-trip into the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// Round-trip delay exceeded the rolling outlier threshold.
    RejectedDelay,
}

/// Update-side state: Kalman estimate plus the delay window.
struct FilterState {
    offset: f64,
    drift: f64,
    /// 2x2 covariance of (offset, drift).
    p: [[f64; 2]; 2],
    basis: i64,
    delays: VecDeque<f64>,
    samples: u64,
    /// Forces fast polling after a drift excursion until settled again.
    excursion: bool,
}

impl FilterState {
    fn new() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            p: [[1.0e12, 0.0], [0.0, 1.0e-8]],
            basis: 0,
            delays: VecDeque::with_capacity(DELAY_WINDOW),
            samples: 0,
            excursion: false,
        }
    }

    /// Advances the estimate to local time `now`.
    fn predict(&mut self, now: i64) {
        let dt = (now - self.basis).max(0) as f64;
        if self.samples > 0 && dt > 0.0 {
            self.offset += self.drift * dt;
            let [[p00, p01], [p10, p11]] = self.p;
            self.p = [
                [
                    p00 + dt * (p01 + p10) + dt * dt * p11 + PROCESS_NOISE_OFFSET * dt,
                    p01 + dt * p11,
                ],
                [p10 + dt * p11, p11 + PROCESS_NOISE_DRIFT * dt],
            ];
        }
        self.basis = now;
    }

    fn delay_median(&self) -> Option<f64> {
        if self.delays.len() < DELAY_WINDOW_MIN {
            return None;
        }
        let mut sorted: Vec<f64> = self.delays.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[sorted.len() / 2])
    }

    fn push_delay(&mut self, delay: f64) {
        if self.delays.len() == DELAY_WINDOW {
            self.delays.pop_front();
        }
        self.delays.push_back(delay);
    }

    /// Folds one offset measurement in. Returns the innovation.
    fn correct(&mut self, measured_offset: f64, delay: f64) -> f64 {
        let r = MEASUREMENT_NOISE_FLOOR + (delay / 2.0) * (delay / 2.0);
        let [[p00, p01], [p10, p11]] = self.p;
        let s = p00 + r;
        let k0 = p00 / s;
        let k1 = p10 / s;
        let innovation = measured_offset - self.offset;

        self.offset += k0 * innovation;
        self.drift += k1 * innovation;
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
        self.samples += 1;
        innovation
    }

    fn settled(&self) -> bool {
        self.samples >= DELAY_WINDOW_MIN as u64 && self.p[0][0] < CLOCK_SETTLE_COVARIANCE
    }

    fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            offset: self.offset,
            drift: self.drift,
            basis: self.basis,
            covariance: self.p[0][0],
        }
    }
}

/// Per-endpoint clock filter with atomic snapshot publication.
pub struct ClockFilter {
    state: Mutex<FilterState>,
    published: RwLock<Arc<ClockSnapshot>>,
}

impl ClockFilter {
    pub fn new() -> Self {
        let state = FilterState::new();
        let snapshot = Arc::new(state.snapshot());
        Self {
            state: Mutex::new(state),
            published: RwLock::new(snapshot),
        }
    }

    /// Feeds one round-trip: `t0` local transmit, `t1` remote receive,
    /// `t2` remote transmit, `t3` local receive.
    pub fn update(&self, t0: i64, t1: i64, t2: i64, t3: i64) -> SampleOutcome {
        let delay = ((t3 - t0) - (t2 - t1)) as f64;
        let measured_offset = ((t1 - t0) as f64 + (t2 - t3) as f64) / 2.0;

        let mut state = self.state.lock();
        state.predict(t3);

        let outlier = state
            .delay_median()
            .is_some_and(|median| delay > 2.0 * median.max(1.0));
        state.push_delay(delay.max(0.0));
        if outlier {
            // Prediction already inflated the covariance for the elapsed
            // time, so a run of rejects degrades toward divergence.
            self.publish(&state);
            return SampleOutcome::RejectedDelay;
        }

        let was_settled = state.settled();
        let innovation = state.correct(measured_offset, delay.max(0.0));
        if was_settled && innovation.abs() > CLOCK_EXCURSION_MICROS {
            log::debug!(
                "[Clock] Drift excursion: innovation {:.0}µs, resuming fast polling",
                innovation
            );
            state.excursion = true;
        } else if state.settled() {
            state.excursion = false;
        }

        self.publish(&state);
        SampleOutcome::Accepted
    }

    fn publish(&self, state: &FilterState) {
        let snapshot = Arc::new(state.snapshot());
        *self.published.write() = snapshot;
    }

    /// Current estimate. Cheap pointer clone; never blocks on an update.
    pub fn snapshot(&self) -> Arc<ClockSnapshot> {
        Arc::clone(&self.published.read())
    }

    /// Adaptive polling cadence: 1 Hz until the covariance settles, then
    /// decayed to 0.1 Hz; fast again after a drift excursion.
    pub fn poll_interval(&self) -> std::time::Duration {
        let state = self.state.lock();
        if state.settled() && !state.excursion {
            CLOCK_POLL_SLOW
        } else {
            CLOCK_POLL_FAST
        }
    }

    /// True when the covariance exceeds the fatal threshold and the player
    /// should report `state: error`.
    pub fn is_diverged(&self) -> bool {
        self.snapshot().covariance > CLOCK_FATAL_COVARIANCE
    }

    /// Discards all state, as required on reconnect.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = FilterState::new();
        self.publish(&state);
    }
}

impl Default for ClockFilter {
    fn default() -> Self {
        Self::new()
    }
}
