//! One time slice of a rolling window

/// Running statistics for every sample recorded in one bucket-width
#[derive(Debug, Clone)]
pub(crate) struct Bucket {
    /// Number of samples
    pub(crate) count: u64,
    /// Sum of samples
    pub(crate) sum: f64,
    /// Raw samples, only kept when the window computes percentiles
    pub(crate) values: Vec<f64>,
    keep_values: bool,
}

impl Bucket {
    pub(crate) fn new(keep_values: bool, capacity: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            values: if keep_values {
                Vec::with_capacity(capacity)
            } else {
                Vec::new()
            },
            keep_values,
        }
    }

    pub(crate) fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.keep_values {
            self.values.push(value);
        }
    }

    /// Empty the bucket for reuse. Keeps the allocation.
    pub(crate) fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
        self.values.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }
}
