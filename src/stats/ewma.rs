//! Exponentially weighted moving-average throughput rate
//!
//! Events are accumulated on record and folded into the rate in 5-second
//! ticks; the decay is applied lazily on read against wall-clock, so idle
//! meters converge to zero without a background timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tick interval the alphas are derived from.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// One exponentially weighted moving average.
pub struct Ewma {
    alpha: f64,
    uncounted: AtomicU64,
    inner: Mutex<EwmaInner>,
}

struct EwmaInner {
    rate: f64,
    initialized: bool,
    last_tick: Instant,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Self {
            alpha,
            uncounted: AtomicU64::new(0),
            inner: Mutex::new(EwmaInner {
                rate: 0.0,
                initialized: false,
                last_tick: Instant::now(),
            }),
        }
    }

    /// One-minute moving average.
    pub fn one_minute() -> Self {
        Self::new(1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0).exp())
    }

    /// Five-minute moving average.
    pub fn five_minutes() -> Self {
        Self::new(1.0 - (-TICK_INTERVAL.as_secs_f64() / 300.0).exp())
    }

    /// Fifteen-minute moving average.
    pub fn fifteen_minutes() -> Self {
        Self::new(1.0 - (-TICK_INTERVAL.as_secs_f64() / 900.0).exp())
    }

    /// Record `n` events.
    pub fn update(&self, n: u64) {
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Current rate in events per second, decayed to now.
    pub fn rate(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.tick_to_now(&mut inner);
        inner.rate
    }

    fn tick_to_now(&self, inner: &mut EwmaInner) {
        let elapsed = inner.last_tick.elapsed();
        let ticks = (elapsed.as_nanos() / TICK_INTERVAL.as_nanos()) as u32;
        if ticks == 0 {
            return;
        }

        // The first elapsed tick consumes the accumulated events; the rest
        // decay against an idle interval.
        let count = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = count as f64 / TICK_INTERVAL.as_secs_f64();
        if inner.initialized {
            inner.rate += self.alpha * (instant_rate - inner.rate);
        } else {
            inner.rate = instant_rate;
            inner.initialized = true;
        }
        for _ in 1..ticks {
            inner.rate += self.alpha * (0.0 - inner.rate);
        }

        inner.last_tick += TICK_INTERVAL * ticks;
    }

    /// Shift the tick origin into the past, simulating elapsed time.
    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        self.inner.lock().last_tick -= by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_zero_before_first_tick() {
        let ewma = Ewma::one_minute();
        ewma.update(100);
        assert_eq!(ewma.rate(), 0.0);
    }

    #[test]
    fn test_first_tick_sets_instant_rate() {
        let ewma = Ewma::one_minute();
        ewma.update(50);
        ewma.backdate(TICK_INTERVAL);

        // 50 events over one 5s tick.
        assert!((ewma.rate() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_ticks_decay_rate() {
        let ewma = Ewma::one_minute();
        ewma.update(50);
        ewma.backdate(TICK_INTERVAL);
        let first = ewma.rate();

        ewma.backdate(TICK_INTERVAL * 12);
        let decayed = ewma.rate();
        assert!(decayed < first);
        assert!(decayed > 0.0);
    }

    #[test]
    fn test_longer_windows_decay_slower() {
        let m1 = Ewma::one_minute();
        let m15 = Ewma::fifteen_minutes();
        for ewma in [&m1, &m15] {
            ewma.update(50);
            ewma.backdate(TICK_INTERVAL);
            ewma.rate();
            ewma.backdate(TICK_INTERVAL * 6);
        }
        assert!(m15.rate() > m1.rate());
    }
}
