//! TUN device creation for the VPN packet pump
//!
//! Creates a Layer 3 TUN device (raw IP packets, no Ethernet header) and
//! hands its file descriptor to the pump as an [`FdInterface`].

use nix::libc;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::info;

use crate::interface::FdInterface;

/// Default TUN device name
pub const DEFAULT_TUN_NAME: &str = "mvirt-vpn0";

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device configuration and interface flags
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TUN device name must be 1-15 bytes",
            ));
        }

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }
}

/// A TUN device owned by the VPN.
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Create (or attach to) the TUN device `name`.
    ///
    /// Requires CAP_NET_ADMIN. The device is created with IFF_NO_PI, so reads
    /// and writes carry bare IP packets.
    pub fn create(name: &str) -> io::Result<Self> {
        let ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TUN device created");

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Get the device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the raw file descriptor
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Set IFF_UP on the interface.
    ///
    /// Addresses and routes are left to the host.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name = %self.name, "Interface set UP");
        Ok(())
    }

    /// Hand the device over to the pump.
    pub fn into_interface(self) -> FdInterface {
        FdInterface::from(self.file)
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
