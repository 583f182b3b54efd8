use std::collections::VecDeque;

/// Fixed-capacity queue of readings; pushing onto a full queue evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct Fifo {
    values: VecDeque<f32>,
    capacity: usize,
}

impl Fifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.capacity == 0 {
            return;
        }
        while self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }

    /// Zero when empty.
    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.sum() / self.values.len() as f32
    }

    /// Most recent value, zero when empty.
    pub fn last(&self) -> f32 {
        self.values.back().copied().unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut fifo = Fifo::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            fifo.push(v);
        }
        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.sum(), 9.0);
        assert_eq!(fifo.average(), 3.0);
        assert_eq!(fifo.last(), 4.0);
    }

    #[test]
    fn empty_queue_reads_as_zero() {
        let mut fifo = Fifo::new(5);
        assert_eq!(fifo.average(), 0.0);
        assert_eq!(fifo.last(), 0.0);
        fifo.push(7.0);
        fifo.clear();
        assert!(fifo.is_empty());
        assert_eq!(fifo.sum(), 0.0);
    }
}
