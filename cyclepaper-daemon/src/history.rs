use crate::candidate::Candidate;
use std::collections::VecDeque;
use std::sync::Arc;

const MIN_CAPACITY: usize = 3;

/// Recently applied wallpapers, oldest first.
#[derive(Debug, Clone)]
pub struct RecencyWindow {
    entries: VecDeque<Arc<Candidate>>,
    capacity: usize,
}

impl Default for RecencyWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RecencyWindow {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: MIN_CAPACITY,
        }
    }

    /// `max(3, floor(eligible * percent / 100))`
    pub fn capacity_for(eligible: usize, percent: u8) -> usize {
        (eligible * percent as usize / 100).max(MIN_CAPACITY)
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Recompute capacity for this cycle, evicting oldest entries when it shrinks.
    pub fn resize(&mut self, eligible: usize, percent: u8) {
        self.capacity = Self::capacity_for(eligible, percent);
        self.evict();
    }

    pub fn contains(&self, candidate: &Candidate) -> bool {
        self.entries.iter().any(|c| c.same_image(candidate))
    }

    /// Record an applied image. Re-adding moves it to the newest position.
    pub fn push(&mut self, candidate: Arc<Candidate>) {
        self.entries.retain(|c| !c.same_image(&candidate));
        self.entries.push_back(candidate);
        self.evict();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Candidate>> {
        self.entries.iter()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}
