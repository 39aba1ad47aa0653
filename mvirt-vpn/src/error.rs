//! Error types for the packet pump.

use std::fmt;
use std::io;

use nix::libc;
use thiserror::Error;

/// Errors that stop the pump or prevent it from starting.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open interface channels: {0}")]
    OpenChannels(#[source] io::Error),

    #[error("Interface read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Interface write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Pump thread panicked")]
    Panicked,
}

/// Why a pump stopped running.
#[derive(Debug)]
pub enum ExitReason {
    /// Cancellation was requested by the supervisor
    Cancelled,
    /// The interface became unusable
    Fatal(PumpError),
}

impl ExitReason {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExitReason::Cancelled)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Cancelled => write!(f, "cancelled"),
            ExitReason::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Returns true if the error means the interface itself is gone.
///
/// Anything else is treated as transient and retried on the next iteration.
pub fn is_fatal(err: &io::Error) -> bool {
    if let Some(code) = err.raw_os_error() {
        return matches!(
            code,
            libc::EBADF | libc::EBADFD | libc::EIO | libc::ENODEV | libc::ENXIO | libc::EPIPE
        );
    }
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    )
}
