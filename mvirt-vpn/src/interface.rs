//! Virtual interface abstraction
//!
//! The pump sees the TUN device as a pair of byte channels: a reader that
//! yields one IP packet per call and a writer that accepts packet bytes.
//! Channels are closed when dropped, so the pump's scope owns them.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Receive side of a virtual interface.
pub trait InterfaceReader: Send {
    /// Read one packet into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when no packet arrived in time. A zero timeout only
    /// picks up a packet that is already queued.
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Transmit side of a virtual interface.
pub trait InterfaceWriter: Send {
    /// Write some of `buf`; may accept fewer bytes than offered.
    fn write_packet(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A virtual interface handle supplied by the host platform.
pub trait VirtualInterface: Send {
    type Reader: InterfaceReader;
    type Writer: InterfaceWriter;

    /// Derive the input and output channels used by one pump run.
    fn open_channels(&mut self) -> io::Result<(Self::Reader, Self::Writer)>;
}

/// Interface backed by an open file descriptor (e.g. a TUN fd).
pub struct FdInterface {
    fd: OwnedFd,
}

impl FdInterface {
    pub fn new(fd: OwnedFd) -> Self {
        FdInterface { fd }
    }

    /// Get the raw file descriptor
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<File> for FdInterface {
    fn from(file: File) -> Self {
        FdInterface::new(OwnedFd::from(file))
    }
}

impl VirtualInterface for FdInterface {
    type Reader = FdReader;
    type Writer = FdWriter;

    fn open_channels(&mut self) -> io::Result<(FdReader, FdWriter)> {
        let reader = FdReader {
            file: File::from(self.fd.try_clone()?),
        };
        let writer = FdWriter {
            file: File::from(self.fd.try_clone()?),
        };
        Ok((reader, writer))
    }
}

fn timeout_millis(timeout: Duration) -> u16 {
    u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX)
}

/// Read channel of an [`FdInterface`]; reads are bounded by `poll(2)`.
pub struct FdReader {
    file: File,
}

impl InterfaceReader for FdReader {
    fn read_packet(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let revents = {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeout_millis(timeout))) {
                Ok(0) | Err(Errno::EINTR) => return Ok(0),
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(e) => return Err(io::Error::from(e)),
            }
        };

        if revents.contains(PollFlags::POLLNVAL) {
            return Err(io::Error::from_raw_os_error(nix::libc::EBADF));
        }
        if !revents.contains(PollFlags::POLLIN) {
            if revents.contains(PollFlags::POLLHUP) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            // A detached TUN device only ever reports POLLERR
            if revents.contains(PollFlags::POLLERR) {
                return Err(io::Error::from_raw_os_error(nix::libc::EIO));
            }
        }

        match self.file.read(buf) {
            // Readable but nothing to read: the other end is gone
            Ok(0) if revents.contains(PollFlags::POLLHUP) => {
                Err(io::Error::from(io::ErrorKind::UnexpectedEof))
            }
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

/// Write channel of an [`FdInterface`].
pub struct FdWriter {
    file: File,
}

impl InterfaceWriter for FdWriter {
    fn write_packet(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }
}
