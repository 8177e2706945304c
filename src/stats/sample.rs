//! Bounded uniform reservoir of execution-time samples
//!
//! Keeps a fixed-size random sample of all recorded values (Vitter's
//! algorithm R), from which latency aggregates and percentiles are derived.

use parking_lot::Mutex;
use rand::Rng;

use crate::error::{Error, Result};

/// Reservoir capacity; enough resolution for the supported percentiles.
pub const DEFAULT_RESERVOIR_SIZE: usize = 1024;

/// Uniform reservoir sample over `i64` values (execution nanoseconds).
pub struct UniformSample {
    size: usize,
    inner: Mutex<SampleInner>,
}

struct SampleInner {
    count: u64,
    values: Vec<i64>,
}

impl UniformSample {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            inner: Mutex::new(SampleInner {
                count: 0,
                values: Vec::with_capacity(size),
            }),
        }
    }

    /// Record one value.
    pub fn update(&self, value: i64) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        if inner.values.len() < self.size {
            inner.values.push(value);
        } else {
            let slot = rand::thread_rng().gen_range(0..inner.count);
            if (slot as usize) < self.size {
                inner.values[slot as usize] = value;
            }
        }
    }

    /// Total number of values recorded (not the reservoir occupancy).
    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Copy of the current reservoir contents.
    pub fn snapshot(&self) -> Vec<i64> {
        self.inner.lock().values.clone()
    }

    pub fn min(&self) -> Result<i64> {
        let inner = self.inner.lock();
        inner.values.iter().min().copied().ok_or(Error::NoDataAvailable)
    }

    pub fn max(&self) -> Result<i64> {
        let inner = self.inner.lock();
        inner.values.iter().max().copied().ok_or(Error::NoDataAvailable)
    }

    pub fn sum(&self) -> Result<i64> {
        let inner = self.inner.lock();
        if inner.values.is_empty() {
            return Err(Error::NoDataAvailable);
        }
        Ok(inner.values.iter().sum())
    }

    pub fn mean(&self) -> Result<f64> {
        let inner = self.inner.lock();
        if inner.values.is_empty() {
            return Err(Error::NoDataAvailable);
        }
        Ok(inner.values.iter().sum::<i64>() as f64 / inner.values.len() as f64)
    }

    /// Population variance of the reservoir.
    pub fn variance(&self) -> Result<f64> {
        let inner = self.inner.lock();
        if inner.values.is_empty() {
            return Err(Error::NoDataAvailable);
        }
        let mean = inner.values.iter().sum::<i64>() as f64 / inner.values.len() as f64;
        let sq_sum: f64 = inner
            .values
            .iter()
            .map(|v| {
                let d = *v as f64 - mean;
                d * d
            })
            .sum();
        Ok(sq_sum / inner.values.len() as f64)
    }

    pub fn std_dev(&self) -> Result<f64> {
        Ok(self.variance()?.sqrt())
    }

    /// Percentile (`0.0..=1.0`) with linear interpolation between the two
    /// neighboring reservoir samples.
    pub fn percentile(&self, p: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidArgument(format!(
                "percentile {} out of range [0, 1]",
                p
            )));
        }

        let mut values = self.snapshot();
        if values.len() < 2 {
            return Err(Error::NoDataAvailable);
        }
        values.sort_unstable();

        let rank = p * (values.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Ok(values[lower] as f64);
        }
        let weight = rank - lower as f64;
        Ok(values[lower] as f64 * (1.0 - weight) + values[upper] as f64 * weight)
    }
}

impl Default for UniformSample {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample_has_no_data() {
        let sample = UniformSample::default();
        assert!(matches!(sample.min(), Err(Error::NoDataAvailable)));
        assert!(matches!(sample.max(), Err(Error::NoDataAvailable)));
        assert!(matches!(sample.sum(), Err(Error::NoDataAvailable)));
        assert!(matches!(sample.variance(), Err(Error::NoDataAvailable)));
    }

    #[test]
    fn test_percentile_needs_two_samples() {
        let sample = UniformSample::default();
        sample.update(10);
        assert!(matches!(sample.percentile(0.5), Err(Error::NoDataAvailable)));

        sample.update(20);
        assert!((sample.percentile(0.5).unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_rejects_out_of_range() {
        let sample = UniformSample::default();
        sample.update(1);
        sample.update(2);
        assert!(matches!(
            sample.percentile(1.5),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_aggregates() {
        let sample = UniformSample::default();
        for v in [2i64, 4, 4, 4, 5, 5, 7, 9] {
            sample.update(v);
        }

        assert_eq!(sample.count(), 8);
        assert_eq!(sample.min().unwrap(), 2);
        assert_eq!(sample.max().unwrap(), 9);
        assert_eq!(sample.sum().unwrap(), 40);
        assert!((sample.mean().unwrap() - 5.0).abs() < 1e-9);
        assert!((sample.variance().unwrap() - 4.0).abs() < 1e-9);
        assert!((sample.std_dev().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_interpolates() {
        let sample = UniformSample::default();
        for v in 1..=100i64 {
            sample.update(v);
        }

        assert!((sample.percentile(0.0).unwrap() - 1.0).abs() < 1e-9);
        assert!((sample.percentile(1.0).unwrap() - 100.0).abs() < 1e-9);
        assert!((sample.percentile(0.9).unwrap() - 90.1).abs() < 1e-9);
    }

    #[test]
    fn test_reservoir_stays_bounded() {
        let sample = UniformSample::new(16);
        for v in 0..10_000i64 {
            sample.update(v);
        }
        assert_eq!(sample.count(), 10_000);
        assert_eq!(sample.snapshot().len(), 16);
    }
}
