//! Small numeric helpers used by the adaptive file input.

use std::collections::VecDeque;

/// Incremental arithmetic mean over every value ever added.
#[derive(Debug, Default)]
pub struct GradualAverage {
    avg: f64,
    len: u64,
}

impl GradualAverage {
    pub fn new() -> GradualAverage {
        GradualAverage::default()
    }

    pub fn add_value(&mut self, value: f64) {
        self.len += 1;
        self.avg += (value - self.avg) / self.len as f64;
    }

    /// The current average; zero before any value has been added.
    pub fn avg(&self) -> f64 {
        self.avg
    }
}

/// Arithmetic mean over a sliding window of the most recent samples.
#[derive(Debug)]
pub struct LimitedAverage {
    samples: VecDeque<f64>,
    cap: usize,
}

impl LimitedAverage {
    /// `samples` must be non-zero.
    pub fn new(samples: usize) -> LimitedAverage {
        assert!(samples > 0, "window must hold at least one sample");
        LimitedAverage {
            samples: VecDeque::with_capacity(samples),
            cap: samples,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradual_average_tracks_mean() {
        let mut avg = GradualAverage::new();
        for v in [2.0, 4.0, 6.0] {
            avg.add_value(v);
        }
        assert!((avg.avg() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn limited_average_forgets_old_samples() {
        let mut avg = LimitedAverage::new(2);
        avg.add_value(100.0);
        avg.add_value(2.0);
        avg.add_value(4.0);
        assert!((avg.avg() - 3.0).abs() < f64::EPSILON);
    }
}
