//! Send window management
//!
//! An additive-increase multiplicative-decrease window caps how many
//! reliable commands may be in flight to one peer. Slow start doubles the
//! window per acknowledged round until the threshold, after which growth is
//! linear; a retransmission halves it, rate-limited so one burst of loss is
//! a single congestion event.
//!
//! Time is the host clock in wrapping milliseconds, matching the rest of the
//! engine, so the window is fully deterministic under test.

/// Initial window size in commands
const INITIAL_WINDOW: u32 = 16;

/// Smallest window the decrease can reach
const MIN_WINDOW: u32 = 2;

/// Minimum spacing between multiplicative decreases in milliseconds
const CONGESTION_INTERVAL_MS: u32 = 1_000;

/// AIMD window over reliable commands in flight
#[derive(Debug, Clone)]
pub struct SendWindow {
    window: u32,
    max_window: u32,
    ssthresh: u32,
    slow_start: bool,
    in_flight: u32,
    last_decrease: Option<u32>,
}

impl SendWindow {
    pub fn new(max_window: u32) -> Self {
        SendWindow {
            window: INITIAL_WINDOW.min(max_window),
            max_window,
            ssthresh: max_window / 2,
            slow_start: true,
            in_flight: 0,
            last_decrease: None,
        }
    }

    /// Current window size in commands
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Commands currently unacknowledged
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Check whether another reliable command may be sent
    pub fn can_send(&self) -> bool {
        self.in_flight < self.window
    }

    /// Record a reliable command leaving the host
    pub fn on_send(&mut self) {
        self.in_flight += 1;
    }

    /// Record acknowledged commands and grow the window
    pub fn on_ack(&mut self, acked: u32) {
        self.in_flight = self.in_flight.saturating_sub(acked);

        if self.slow_start {
            self.window += acked;
            if self.window >= self.ssthresh {
                self.slow_start = false;
            }
        } else {
            let increment = (acked as f64 / self.window as f64).ceil() as u32;
            self.window += increment.max(1);
        }

        self.window = self.window.min(self.max_window);
    }

    /// Record a retransmission; halves the window at most once per
    /// congestion interval
    pub fn on_retransmit(&mut self, now_ms: u32) {
        let should_reduce = match self.last_decrease {
            None => true,
            Some(last) => now_ms.wrapping_sub(last) >= CONGESTION_INTERVAL_MS,
        };

        if should_reduce {
            self.ssthresh = (self.window / 2).max(MIN_WINDOW);
            self.window = self.ssthresh;
            self.slow_start = false;
            self.last_decrease = Some(now_ms);
        }
    }

    /// Forget in-flight accounting, used when a peer is torn down
    pub fn reset(&mut self) {
        self.window = INITIAL_WINDOW.min(self.max_window);
        self.ssthresh = self.max_window / 2;
        self.slow_start = true;
        self.in_flight = 0;
        self.last_decrease = None;
    }
}
