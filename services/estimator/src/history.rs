//! Per-cycle measured capacity history.
//!
//! `len()` counts every completed discharge cycle and never decreases.
//! Storage is a ring buffer holding only the most recent `retention`
//! capacities, which is all the predictor window ever reads.

#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    buffer: Vec<Option<T>>,
    capacity: usize,
    head: usize, // Next write position
    len: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: vec![None; capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.buffer[self.head] = Some(item);
        self.head = (self.head + 1) % self.capacity;

        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Index 0 is the oldest retained item.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        let actual_index = (self.head + self.capacity - self.len + index) % self.capacity;
        self.buffer[actual_index].as_ref()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityHistory {
    retained: RingBuffer<f64>,
    total: usize,
}

impl CapacityHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            retained: RingBuffer::new(retention),
            total: 0,
        }
    }

    /// Records the capacity (Ah) measured over one completed discharge cycle.
    pub fn push(&mut self, capacity_ah: f64) {
        self.retained.push(capacity_ah);
        self.total += 1;
    }

    /// Number of completed cycles recorded so far.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn latest(&self) -> Option<f64> {
        self.retained.len().checked_sub(1).and_then(|i| self.retained.get(i)).copied()
    }

    /// The last `length` capacities in chronological order, or `None` until
    /// that many cycles are retained.
    pub fn window(&self, length: usize) -> Option<Vec<f64>> {
        if length == 0 || self.retained.len() < length {
            return None;
        }
        let skip = self.retained.len() - length;
        Some(self.retained.iter().skip(skip).copied().collect())
    }

    pub fn retained(&self) -> impl Iterator<Item = &f64> {
        self.retained.iter()
    }
}
