// =============================================================================
// Marker Ring & Cooldown Cursor
// =============================================================================

use std::collections::VecDeque;

use crate::types::Marker;

/// Bounded FIFO of markers of one kind. The oldest marker is evicted once the
/// capacity is exceeded.
#[derive(Debug, Clone)]
pub struct MarkerRing {
    items: VecDeque<Marker>,
    capacity: usize,
}

impl MarkerRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024) + 1),
            capacity,
        }
    }

    pub fn push(&mut self, marker: Marker) {
        self.items.push_back(marker);
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest-first copy of the retained markers.
    pub fn to_vec(&self) -> Vec<Marker> {
        self.items.iter().copied().collect()
    }
}

/// Bar index of the last marker of a kind, enforcing a minimum spacing.
#[derive(Debug, Clone, Copy)]
pub struct CooldownCursor {
    last: Option<usize>,
    min_gap: usize,
}

impl CooldownCursor {
    pub fn new(min_gap: usize) -> Self {
        Self { last: None, min_gap }
    }

    /// True when a marker may fire at bar `index`.
    pub fn ready(&self, index: usize) -> bool {
        match self.last {
            None => true,
            Some(last) => index > last && index - last >= self.min_gap,
        }
    }

    pub fn mark(&mut self, index: usize) {
        self.last = Some(index);
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    #[cfg(test)]
    pub fn last(&self) -> Option<usize> {
        self.last
    }
}
