//! Per-channel notification debouncing.
//!
//! Change-feed channels are bursty: one externally-visible event often
//! produces dozens of row-level notifications. Each channel accumulates a
//! count and fires its scan either when the count reaches `max_count` or
//! when `wait_time` has elapsed since the channel first became dirty.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Debounce thresholds for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceParams {
    pub max_count: u32,
    pub wait_time: Duration,
}

#[derive(Debug)]
struct CounterState {
    count: u32,
    dirty_since: Option<Instant>,
}

/// Debounce counter for a single channel.
///
/// `record_event` is called per notification and reports whether either
/// threshold tripped (the burst count, or the window aging past
/// `wait_time`); `flush_if_stale` is called on every poll timeout to catch
/// a dirty channel that went quiet. Both reset the counter when they fire.
#[derive(Debug)]
pub struct NotifyCount {
    params: DebounceParams,
    state: Mutex<CounterState>,
}

impl NotifyCount {
    pub fn new(params: DebounceParams) -> Self {
        Self {
            params,
            state: Mutex::new(CounterState {
                count: 0,
                dirty_since: None,
            }),
        }
    }

    pub fn params(&self) -> DebounceParams {
        self.params
    }

    /// Record one notification. Returns true (and resets) when the count
    /// threshold is reached or the window is older than `wait_time`.
    pub fn record_event(&self) -> bool {
        self.record_event_at(Instant::now())
    }

    /// Flush a channel that has been dirty longer than `wait_time`.
    /// Returns true (and resets) when the scan should run.
    pub fn flush_if_stale(&self) -> bool {
        self.flush_if_stale_at(Instant::now())
    }

    fn record_event_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.count += 1;
        let since = *state.dirty_since.get_or_insert(now);
        if state.count >= self.params.max_count
            || now.duration_since(since) >= self.params.wait_time
        {
            state.count = 0;
            state.dirty_since = None;
            true
        } else {
            false
        }
    }

    fn flush_if_stale_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        match state.dirty_since {
            Some(since) if now.duration_since(since) >= self.params.wait_time => {
                state.count = 0;
                state.dirty_since = None;
                true
            }
            _ => false,
        }
    }
}
