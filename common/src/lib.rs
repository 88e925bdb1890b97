use std::fmt;

mod pinger;
mod probe;
mod socket;

pub use logging_macro::Logging;
pub use pinger::Pinger;
pub use probe::{
    Destination, EventStream, InitError, ProbeEvent, ProbeKind,
    RunningStatistics, SessionConfig, Transport,
};
pub use socket::{bind_to_device, interface_to_ipaddr, AsyncICMPSocket, ICMPSocket};

/// A record that can be written as one CSV row. Usually derived with
/// `#[derive(Logging)]`, which also provides the matching `Display` row.
pub trait Logging: fmt::Display {
    /// Column names, comma separated and newline terminated.
    fn header(&self) -> String;
}

/// Running mean, variance, min and max over a stream of samples
/// (Welford's online algorithm).
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
    samples: usize,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            mean: f64::NAN,
            variance: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            samples: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }
    /// Population variance. NaN until the first sample.
    pub fn variance(&self) -> f64 {
        self.variance / ((self.samples) as f64)
    }
    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn update(&mut self, value: f64) {
        self.samples += 1;
        if self.samples == 1 {
            self.mean = value;
            self.variance = 0.0;
            self.min = value;
            self.max = value;
        } else {
            let old_mean = self.mean;
            self.mean = old_mean + (value - old_mean) / self.samples as f64;
            self.variance =
                self.variance + (value - old_mean) * (value - self.mean);
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stats_test() {
        let mut stats = Statistics::new();
        for value in 1..=10 {
            stats.update(value as f64);
        }

        assert_eq!(stats.mean(), 5.5);
        assert_eq!(stats.variance(), 8.25);
        assert_eq!(stats.standard_deviation().round(), 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.samples, 10);
    }

    #[test]
    fn empty_stats_are_nan() {
        let stats = Statistics::new();
        assert_eq!(stats.samples(), 0);
        assert!(stats.mean().is_nan());
        assert!(stats.standard_deviation().is_nan());
    }

    #[test]
    fn single_sample_has_zero_deviation() {
        let mut stats = Statistics::new();
        stats.update(0.042);
        assert_eq!(stats.mean(), 0.042);
        assert_eq!(stats.standard_deviation(), 0.0);
        assert_eq!(stats.min(), stats.max());
    }

    #[derive(Logging)]
    struct Row {
        seq: u16,
        addr: String,
        rtt_ms: f64,
    }

    #[test]
    fn derived_row_matches_header() {
        let row = Row {
            seq: 7,
            addr: "10.0.0.1".to_string(),
            rtt_ms: 1.5,
        };
        assert_eq!(row.header(), "seq,addr,rtt_ms\n");
        assert_eq!(row.to_string(), "7,10.0.0.1,1.5\n");
    }
}
