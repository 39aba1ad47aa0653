//! Packet pump configuration
//!
//! All tunables of the pump live here so tests can shorten intervals
//! instead of depending on the production timings.

use std::time::Duration;

use crate::error::PumpError;

/// Size of every pooled buffer (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Sleep between iterations when neither direction moved any data.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for a single read on the interface while the inbound queue is
/// empty. Reads never wait when inbound packets are queued.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// Smallest buffer that can still hold an IPv4 header.
pub const MIN_BUFFER_SIZE: usize = 20;

/// Configuration for a [`PacketPump`](crate::pump::PacketPump).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Capacity of each buffer handed out by the pool
    pub buffer_size: usize,
    /// Back-off applied to idle iterations
    pub idle_interval: Duration,
    /// Read timeout for fd-backed interfaces
    pub io_timeout: Duration,
}

impl PumpConfig {
    pub fn new() -> Self {
        PumpConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Set the pooled buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the idle back-off interval.
    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Set the per-read timeout.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), PumpError> {
        validate_buffer_size(self.buffer_size)
    }
}

/// Reject buffers too small to hold an IPv4 header.
pub fn validate_buffer_size(buffer_size: usize) -> Result<(), PumpError> {
    if buffer_size < MIN_BUFFER_SIZE {
        return Err(PumpError::InvalidConfig(format!(
            "buffer size {buffer_size} is smaller than {MIN_BUFFER_SIZE} bytes"
        )));
    }
    Ok(())
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::new()
    }
}
