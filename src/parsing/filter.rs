use std::collections::VecDeque;

/// Window size used for the pressure average on the rig.
pub const DEFAULT_WINDOW: usize = 10;

/// Trailing arithmetic mean over the last `capacity` values.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<f64>,
    capacity: usize,
}

impl MovingAverage {
    /// A zero capacity is treated as 1 so `push` always has a value to average.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Appends `value`, evicts the oldest entry past capacity, returns the mean.
    pub fn push(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        if self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.mean()
    }

    /// Mean of the retained values, 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub(crate) fn len(&self) -> usize {
        self.window.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
