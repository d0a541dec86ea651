//! Adaptive retransmission timing for the sending side of a transfer.
//!
//! The round-trip estimate is an exponentially weighted moving average fed
//! only by first acknowledgements; any ACK that arrives after the current
//! block has been retransmitted is excluded from timing (Karn's algorithm in
//! spirit). The receive deadline is twice the estimate, clamped, and doubles
//! on every timeout.

use std::time::Duration;

/// Round-trip estimate before any sample has been taken.
pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(50);
/// Lower clamp on the receive deadline. Constraining the low end guards
/// against short spikes on fast networks.
pub const TIMEOUT_MIN: Duration = Duration::from_millis(50);
/// Upper clamp on the receive deadline.
pub const TIMEOUT_MAX: Duration = Duration::from_secs(10);
/// Re-sends of a single block before the transfer is abandoned.
pub const MAX_RETRANSMISSIONS: u8 = 8;

/// Retransmission state for the block currently in flight.
#[derive(Debug)]
pub struct RetransmitTimer {
    /// Smoothed round-trip estimate.
    rtt: Duration,
    /// Deadline for the next receive, `2 × rtt` until back-off kicks in.
    current_timeout: Duration,
    /// Re-sends of the current block so far.
    retransmissions: u8,
    /// Set once the current block has been re-sent; the eventual ACK can no
    /// longer be matched to a single transmission, so its timing is noise.
    ignore_time: bool,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetransmitTimer {
    pub fn new() -> RetransmitTimer {
        RetransmitTimer {
            rtt: INITIAL_TIMEOUT,
            current_timeout: clamp(2 * INITIAL_TIMEOUT),
            retransmissions: 0,
            ignore_time: false,
        }
    }

    /// The deadline to apply to the next receive for the block in flight.
    pub fn timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Arms the timer for a freshly sent block.
    pub fn start_block(&mut self) {
        self.retransmissions = 0;
        self.ignore_time = false;
    }

    /// Feeds the measured round trip of the first ACK for the block in
    /// flight. Ignored entirely if the block was retransmitted.
    pub fn record_sample(&mut self, sample: Duration) {
        if self.ignore_time {
            return;
        }
        self.rtt = self.rtt.mul_f64(0.9) + sample.mul_f64(0.1);
        self.current_timeout = clamp(2 * self.rtt);
    }

    /// Registers a re-send of the block in flight: the deadline doubles and
    /// subsequent ACK timing for this block is discarded.
    pub fn back_off(&mut self) {
        self.retransmissions += 1;
        self.ignore_time = true;
        self.current_timeout = clamp(2 * self.current_timeout);
    }

    /// True once the retransmission budget for the block in flight is spent.
    pub fn exhausted(&self) -> bool {
        self.retransmissions >= MAX_RETRANSMISSIONS
    }

    /// Re-sends of the block in flight so far.
    pub fn retransmissions(&self) -> u8 {
        self.retransmissions
    }
}

fn clamp(d: Duration) -> Duration {
    d.clamp(TIMEOUT_MIN, TIMEOUT_MAX)
}
