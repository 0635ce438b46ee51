//! Burst-then-suppress log rate limiting, shared by the USB and protocol
//! error channels of the monitor.

/// Book-keeping for one rate-limited channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitState {
    count: u32,
    suppressed: u32,
    last_event_ms: u64,
}

/// Admits the first `MAX_BURST` events, then suppresses until
/// `RATE_LIMIT_MS` has passed since the most recent event. The caller logs
/// a one-line suppression summary on the next admission.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    max_burst: u32,
    window_ms: u64,
}

pub const MAX_BURST: u32 = 3;
pub const RATE_LIMIT_MS: u64 = 5000;

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            max_burst: MAX_BURST,
            window_ms: RATE_LIMIT_MS,
        }
    }
}

impl RateLimiter {
    pub fn new(max_burst: u32, window_ms: u64) -> Self {
        Self {
            max_burst,
            window_ms,
        }
    }

    /// Whether the event at `now_ms` should be logged. Suppressed events
    /// are counted; a re-admission resets the burst window.
    pub fn should_log(&self, state: &mut RateLimitState, now_ms: u64) -> bool {
        if state.count < self.max_burst {
            state.count += 1;
            state.last_event_ms = now_ms;
            return true;
        }

        if now_ms.saturating_sub(state.last_event_ms) > self.window_ms {
            state.count = 1;
            state.last_event_ms = now_ms;
            return true;
        }

        state.suppressed += 1;
        state.last_event_ms = now_ms;
        false
    }

    /// Number of events suppressed since the last admission, clearing the
    /// counter. Non-zero return means "log the summary line now".
    pub fn take_suppressed(&self, state: &mut RateLimitState) -> u32 {
        std::mem::take(&mut state.suppressed)
    }

    /// Forgets all history, e.g. after a successful read.
    pub fn reset(&self, state: &mut RateLimitState) {
        *state = RateLimitState::default();
    }
}
