//! Simple moving average used to damp sensor noise

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    /// A window of 0 behaves like 1
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Add a sample and return the average of the current window
    pub fn push(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.sum / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One moving average per property name
#[derive(Debug)]
pub struct Smoother {
    window: usize,
    series: HashMap<String, MovingAverage>,
}

impl Smoother {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            series: HashMap::new(),
        }
    }

    pub fn apply(&mut self, name: &str, value: f64) -> f64 {
        if self.window <= 1 || !value.is_finite() {
            return value;
        }
        self.series
            .entry(name.to_string())
            .or_insert_with(|| MovingAverage::new(self.window))
            .push(value)
    }
}
