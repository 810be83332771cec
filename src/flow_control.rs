//! HTTP/2 flow control
//!
//! Flow control as defined in RFC 7540 Section 5.2: a signed window counter
//! per direction, one pair per stream plus one pair for the connection.
//!
//! A window never goes negative through sending: `consume` grants at most
//! what is available. It can go negative when SETTINGS_INITIAL_WINDOW_SIZE
//! shrinks mid-stream, which simply blocks further sends until the peer
//! replenishes the window.

use crate::error::{Error, Result};
use crate::DEFAULT_INITIAL_WINDOW_SIZE;

/// Maximum window size (2^31 - 1)
pub const MAX_WINDOW_SIZE: i64 = 0x7FFFFFFF;

/// Flow control window
///
/// Tracks the byte budget for one direction of one scope (stream or
/// connection).
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size (negative after an initial-size decrease)
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Check if window has available capacity
    pub fn has_capacity(&self) -> bool {
        self.current_size > 0
    }

    /// Check if window can send the full specified amount
    pub fn can_send(&self, amount: usize) -> bool {
        self.current_size >= amount as i64
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the granted amount, which is `min(amount, available)` and
    /// never overdraws; 0 when the window is empty or negative.
    pub fn consume(&mut self, amount: usize) -> usize {
        if amount == 0 || self.current_size <= 0 {
            return 0;
        }

        let granted = std::cmp::min(amount as i64, self.current_size) as usize;
        self.current_size -= granted as i64;
        granted
    }

    /// Give back capacity taken by `consume` that was not used
    pub fn release(&mut self, amount: usize) {
        self.current_size += amount as i64;
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size. A zero increment and an increment that
    /// pushes the window past 2^31-1 are both flow-control violations
    /// (RFC 7540 Sections 6.9 and 6.9.1); the caller decides stream vs
    /// connection scope from the frame's stream id.
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::FlowControl(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    pub fn decrease(&mut self, amount: usize) {
        self.current_size -= amount as i64;
    }

    /// Update initial window size from SETTINGS
    ///
    /// The old/new delta is applied to the current window; a decrease may
    /// drive the window negative, which blocks sends but is not an error.
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Paired send/receive windows for one scope (a stream, or the connection)
#[derive(Debug)]
pub struct FlowControlPair {
    /// Outbound budget, consumed by DATA we send, replenished by the
    /// peer's WINDOW_UPDATE
    pub send: FlowControlWindow,
    /// Inbound budget, consumed by DATA we receive, replenished by the
    /// WINDOW_UPDATE we send
    pub recv: FlowControlWindow,
}

impl FlowControlPair {
    /// Create a pair with default window sizes
    pub fn new() -> Self {
        FlowControlPair {
            send: FlowControlWindow::new(),
            recv: FlowControlWindow::new(),
        }
    }

    /// Create a pair with specified initial window sizes
    pub fn with_initial_sizes(send_size: u32, recv_size: u32) -> Self {
        FlowControlPair {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Account for received data
    pub fn consume_recv(&mut self, amount: usize) {
        self.recv.decrease(amount);
    }

    /// Check if the receive side should be replenished
    ///
    /// Returns the suggested increment once the window has dropped below
    /// half of its initial size.
    pub fn pending_recv_update(&self) -> Option<u32> {
        let recv_size = self.recv.size();
        let initial_size = self.recv.initial_size() as i64;

        if recv_size < initial_size / 2 {
            Some((initial_size - recv_size) as u32)
        } else {
            None
        }
    }

    /// Apply a WINDOW_UPDATE we are sending (replenishes the receive side)
    pub fn apply_recv_update(&mut self, increment: u32) -> Result<i64> {
        self.recv.increase(increment)
    }
}

impl Default for FlowControlPair {
    fn default() -> Self {
        Self::new()
    }
}
