//! Meter - one statistic target
//!
//! A meter tracks the execution counter, three decayed throughput rates and
//! the latency reservoir for one scope (a pipeline, a plugin kind, or the
//! task stream).

use std::sync::atomic::{AtomicU64, Ordering};

use super::ewma::Ewma;
use super::sample::UniformSample;

pub struct Meter {
    count: AtomicU64,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
    sample: UniformSample,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            m1: Ewma::one_minute(),
            m5: Ewma::five_minutes(),
            m15: Ewma::fifteen_minutes(),
            sample: UniformSample::default(),
        }
    }

    /// Record one execution with its wall-clock duration in nanoseconds.
    pub fn update(&self, elapsed_ns: i64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.m1.update(1);
        self.m5.update(1);
        self.m15.update(1);
        self.sample.update(elapsed_ns);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn rate1(&self) -> f64 {
        self.m1.rate()
    }

    pub fn rate5(&self) -> f64 {
        self.m5.rate()
    }

    pub fn rate15(&self) -> f64 {
        self.m15.rate()
    }

    /// The latency reservoir backing min/max/percentile queries.
    pub fn sample(&self) -> &UniformSample {
        &self.sample
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_counts_and_samples() {
        let meter = Meter::new();
        meter.update(100);
        meter.update(300);

        assert_eq!(meter.count(), 2);
        assert_eq!(meter.sample().min().unwrap(), 100);
        assert_eq!(meter.sample().max().unwrap(), 300);
    }
}
