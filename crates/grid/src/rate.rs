//! Broadcast rate control.
//!
//! Discovery broadcasters wait `current() + jitter` between sends. The base
//! interval follows a slow sine wave between two bounds so that nodes on a
//! segment drift out of phase instead of flooding it in lockstep.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

pub const SAMPLE_EVERY: Duration = Duration::from_secs(1);
/// Sampling slows by this factor after `down_throttle`.
pub const THROTTLE_SAMPLE_FACTOR: u32 = 4;
pub const JITTER_MIN: Duration = Duration::from_millis(100);
pub const JITTER_MAX: Duration = Duration::from_millis(300);

const PERIOD_MIN_SECS: u64 = 120;
const PERIOD_MAX_SECS: u64 = 240;

/// Interval bounds, named by value: `min_interval` is the fast end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBounds {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RateBounds {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
        }
    }
}

/// `lo + (hi - lo) * (1 + sin(2πt / period)) / 2`
pub fn interval_at(bounds: RateBounds, period: Duration, elapsed: Duration) -> Duration {
    let lo = bounds.min_interval.as_secs_f64();
    let hi = bounds.max_interval.as_secs_f64().max(lo);
    let period = period.as_secs_f64().max(f64::EPSILON);
    let phase = 2.0 * PI * elapsed.as_secs_f64() / period;
    Duration::from_secs_f64(lo + (hi - lo) * (1.0 + phase.sin()) / 2.0)
}

#[derive(Debug)]
struct RateState {
    bounds: RateBounds,
    period: Duration,
    sample_every: Duration,
    current: Duration,
    throttled: bool,
}

pub struct BroadcastRate {
    state: Arc<RwLock<RateState>>,
    origin: Instant,
    sampler: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BroadcastRate {
    pub fn new(bounds: RateBounds) -> Self {
        let period = Duration::from_secs(rand::thread_rng().gen_range(PERIOD_MIN_SECS..=PERIOD_MAX_SECS));
        Self::with_period(bounds, period)
    }

    pub fn with_period(bounds: RateBounds, period: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(RateState {
                bounds,
                period,
                sample_every: SAMPLE_EVERY,
                current: interval_at(bounds, period, Duration::ZERO),
                throttled: false,
            })),
            origin: Instant::now(),
            sampler: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin resampling the interval on its own task. Idempotent.
    pub fn start(&self) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            return;
        }

        let rate = self.clone();
        *sampler = Some(tokio::spawn(async move {
            loop {
                let wait = rate.state.read().sample_every;
                tokio::time::sleep(wait).await;
                rate.sample();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.abort();
        }
    }

    /// Recompute the base interval from the monotonic clock.
    pub fn sample(&self) {
        let elapsed = self.origin.elapsed();
        let mut state = self.state.write();
        if state.throttled {
            return;
        }
        state.current = interval_at(state.bounds, state.period, elapsed);
    }

    pub fn current(&self) -> Duration {
        self.state.read().current
    }

    /// Base interval plus a fresh random jitter.
    pub fn next_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.current() + jitter
    }

    /// Pin the interval to the slow bound and stretch the sampling period.
    /// Repeated calls have no further effect.
    pub fn down_throttle(&self) {
        let mut state = self.state.write();
        if state.throttled {
            return;
        }
        state.throttled = true;
        state.current = state.bounds.max_interval;
        state.sample_every *= THROTTLE_SAMPLE_FACTOR;
        debug!(
            "Broadcast rate throttled to {:?} (sampling every {:?})",
            state.current, state.sample_every
        );
    }

    pub fn is_throttled(&self) -> bool {
        self.state.read().throttled
    }

    pub fn sample_every(&self) -> Duration {
        self.state.read().sample_every
    }

    pub fn bounds(&self) -> RateBounds {
        self.state.read().bounds
    }
}

impl Clone for BroadcastRate {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            origin: self.origin,
            sampler: Arc::clone(&self.sampler),
        }
    }
}

impl Default for BroadcastRate {
    fn default() -> Self {
        Self::new(RateBounds::default())
    }
}
