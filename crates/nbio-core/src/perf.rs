//! Performance counters
//!
//! Small accumulators used by the benchmark driver to report
//! per-channel throughput and latency distributions.

use std::fmt;
use std::time::Instant;

/// Named min/max/total/count accumulator.
#[derive(Debug, Clone)]
pub struct PerfCounter {
    name: String,
    unit: &'static str,
    count: u64,
    total: u64,
    min: u64,
    max: u64,
}

impl PerfCounter {
    pub fn new(name: &str, unit: &'static str) -> Self {
        Self {
            name: name.to_string(),
            unit,
            count: 0,
            total: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Record one sample.
    pub fn record(&mut self, val: u64) {
        self.count += 1;
        self.total += val;
        self.min = self.min.min(val);
        self.max = self.max.max(val);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total as f64 / self.count as f64
        }
    }
}

impl fmt::Display for PerfCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: n={} total={} {} min={} max={} mean={:.1}",
            self.name,
            self.count,
            self.total,
            self.unit,
            self.min(),
            self.max,
            self.mean()
        )
    }
}

/// Elapsed-time helper around `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs_f64(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let mut c = PerfCounter::new("lat", "us");
        c.record(10);
        c.record(30);
        c.record(20);

        assert_eq!(c.count(), 3);
        assert_eq!(c.total(), 60);
        assert_eq!(c.min(), 10);
        assert_eq!(c.max(), 30);
        assert!((c.mean() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_counter() {
        let c = PerfCounter::new("empty", "B");
        assert_eq!(c.count(), 0);
        assert_eq!(c.min(), 0);
        assert_eq!(c.max(), 0);
        assert_eq!(c.mean(), 0.0);
    }

    #[test]
    fn test_stopwatch_monotone() {
        let sw = Stopwatch::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(sw.elapsed_ms() >= 5);
    }
}
