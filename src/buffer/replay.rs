//! Bounded FIFO replay buffer
//!
//! Stores the most recent `capacity` items; pushing into a full buffer evicts
//! the oldest item first. Sampling draws uniformly at random *with*
//! replacement and refuses (returns `None`) until at least `batch_size`
//! items are stored.
//!
//! # Example
//!
//! ```rust
//! use pbt_racing::buffer::ReplayBuffer;
//!
//! let mut buffer = ReplayBuffer::new(2);
//! buffer.push(1);
//! buffer.push(2);
//! buffer.push(3);
//!
//! assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
//! ```

use std::collections::VecDeque;

use rand::Rng;

/// Fixed-capacity FIFO store
#[derive(Debug)]
pub struct ReplayBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> ReplayBuffer<T> {
    /// Create an empty buffer holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append an item, evicting the oldest one if the buffer is full
    ///
    /// Returns the evicted item, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() == self.capacity { self.items.pop_front() } else { None };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a batch of `batch_size` can be sampled
    pub fn can_sample(&self, batch_size: usize) -> bool {
        batch_size > 0 && self.items.len() >= batch_size
    }

    /// Sample `batch_size` items uniformly with replacement
    ///
    /// Returns `None` while fewer than `batch_size` items are stored.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Option<Vec<&T>> {
        if !self.can_sample(batch_size) {
            return None;
        }
        let len = self.items.len();
        Some((0..batch_size).map(|_| &self.items[rng.gen_range(0..len)]).collect())
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
