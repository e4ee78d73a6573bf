// =============================================================================
// First-Load Buffer — one-shot accumulation of the initial view
// =============================================================================
//
// Until the first flush, history and early bars are held back.  The buffer
// flushes once, as a single batch, when either
//   (a) the held bar count reaches `min_bars`, or
//   (b) the armed deadline passes,
// whichever happens first.  From then on every offer passes straight through
// for the rest of the session.
//
// Held bars stay a valid series: a bar with the same time as the last held
// bar replaces it, an older one is dropped.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::Bar;

/// What the caller should do with an offered item.
#[derive(Debug, Clone, PartialEq)]
pub enum Release<T> {
    /// Kept in the buffer; nothing to emit.
    Held,
    /// The buffer just flushed; emit this combined batch.
    Batch(Vec<Bar>),
    /// Already flushed; emit the item as is.
    Direct(T),
}

#[derive(Debug, Clone)]
enum FirstLoadState {
    Buffering {
        bars: Vec<Bar>,
        deadline: Option<Instant>,
    },
    Flushed,
}

#[derive(Debug, Clone)]
pub struct FirstLoadBuffer {
    min_bars: usize,
    timeout: Duration,
    state: FirstLoadState,
}

impl FirstLoadBuffer {
    /// A zero `timeout` means no deadline.
    pub fn new(min_bars: usize, timeout: Duration) -> Self {
        Self {
            min_bars,
            timeout,
            state: FirstLoadState::Buffering {
                bars: Vec::new(),
                deadline: None,
            },
        }
    }

    /// Start the timeout clock. No effect once flushed or already armed.
    pub fn arm(&mut self, now: Instant) {
        if let FirstLoadState::Buffering { deadline, .. } = &mut self.state {
            if deadline.is_none() && !self.timeout.is_zero() {
                *deadline = Some(now + self.timeout);
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            FirstLoadState::Buffering { deadline, .. } => *deadline,
            FirstLoadState::Flushed => None,
        }
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self.state, FirstLoadState::Flushed)
    }

    pub fn pending(&self) -> usize {
        match &self.state {
            FirstLoadState::Buffering { bars, .. } => bars.len(),
            FirstLoadState::Flushed => 0,
        }
    }

    /// Drop held bars without leaving the buffering state (symbol change).
    pub fn clear_pending(&mut self) {
        if let FirstLoadState::Buffering { bars, .. } = &mut self.state {
            bars.clear();
        }
    }

    /// Offer a full history batch. Held bars newer than the batch are kept
    /// after it.
    pub fn offer_history(&mut self, history: Vec<Bar>) -> Release<Vec<Bar>> {
        match &mut self.state {
            FirstLoadState::Flushed => Release::Direct(history),
            FirstLoadState::Buffering { bars, .. } => {
                let pending = std::mem::replace(bars, history);
                for bar in pending {
                    push_coalesced(bars, bar);
                }
                self.flush_if_full()
            }
        }
    }

    /// Offer one live bar.
    pub fn offer_bar(&mut self, bar: Bar) -> Release<Bar> {
        match &mut self.state {
            FirstLoadState::Flushed => Release::Direct(bar),
            FirstLoadState::Buffering { bars, .. } => {
                push_coalesced(bars, bar);
                self.flush_if_full()
            }
        }
    }

    /// Deadline reached. Returns the batch to emit, if any; an empty buffer
    /// just switches to pass-through. A no-op once flushed.
    pub fn expire(&mut self) -> Option<Vec<Bar>> {
        if self.is_flushed() {
            return None;
        }
        let bars = self.flush();
        (!bars.is_empty()).then_some(bars)
    }

    fn flush_if_full<T>(&mut self) -> Release<T> {
        if self.pending() >= self.min_bars {
            Release::Batch(self.flush())
        } else {
            Release::Held
        }
    }

    fn flush(&mut self) -> Vec<Bar> {
        match std::mem::replace(&mut self.state, FirstLoadState::Flushed) {
            FirstLoadState::Buffering { bars, .. } => bars,
            FirstLoadState::Flushed => Vec::new(),
        }
    }
}

fn push_coalesced(bars: &mut Vec<Bar>, bar: Bar) {
    match bars.last_mut() {
        Some(last) if last.time == bar.time => *last = bar,
        Some(last) if last.time > bar.time => {}
        _ => bars.push(bar),
    }
}
