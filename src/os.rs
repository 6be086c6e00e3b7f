//! OS-level interface and bridge control.
//!
//! The mode state machine needs to take interfaces down and up and move
//! them in and out of bridges. [`IfaceControl`] is the seam; the real
//! implementation issues the classic `SIOC*` ioctls on a datagram socket.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};

/// Interface and bridge operations consumed by the session layer.
///
/// Every failure is reported as [`Error::Os`] carrying a negative errno.
pub trait IfaceControl {
    /// Resolve an interface name to its index.
    fn ifindex(&self, ifname: &str) -> Result<u32>;

    /// Set the administrative state of an interface.
    fn set_up(&mut self, ifname: &str, up: bool) -> Result<()>;

    /// Read the administrative state of an interface.
    fn is_up(&self, ifname: &str) -> Result<bool>;

    /// Add `ifname` to `bridge`.
    fn bridge_add(&mut self, bridge: &str, ifname: &str) -> Result<()>;

    /// Remove `ifname` from `bridge`.
    fn bridge_remove(&mut self, bridge: &str, ifname: &str) -> Result<()>;

    /// Bridge `ifname` is currently enslaved to, if any.
    fn master_bridge(&self, ifname: &str) -> Option<String>;
}

const SIOCGIFFLAGS: u64 = 0x8913;
const SIOCSIFFLAGS: u64 = 0x8914;
const SIOCBRADDIF: u64 = 0x89a2;
const SIOCBRDELIF: u64 = 0x89a3;

#[repr(C)]
#[derive(Clone, Copy)]
union IfReqData {
    flags: libc::c_short,
    ifindex: libc::c_int,
    pad: [u8; 24],
}

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

impl IfReq {
    fn new(ifname: &str) -> Result<Self> {
        let bytes = ifname.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(os_error(ifname, libc::EINVAL));
        }
        let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, &src) in name.iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }
        Ok(Self {
            name,
            data: IfReqData { pad: [0; 24] },
        })
    }
}

fn os_error(ifname: &str, errno: i32) -> Error {
    Error::Os {
        ifname: ifname.to_string(),
        errno: -errno,
    }
}

fn last_os_error(ifname: &str) -> Error {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    os_error(ifname, errno)
}

/// [`IfaceControl`] over ioctls on an `AF_INET` datagram socket.
#[derive(Debug)]
pub struct IoctlIfaceControl {
    sock: OwnedFd,
}

impl IoctlIfaceControl {
    /// Open the control socket.
    pub fn new() -> Result<Self> {
        // SAFETY: socket(2) with constant arguments; the result is checked.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fd is a fresh descriptor owned by nobody else.
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { sock })
    }

    fn ioctl(&self, ifname: &str, request: u64, req: &mut IfReq) -> Result<()> {
        // SAFETY: req is a live, correctly sized ifreq for these requests.
        let ret = unsafe { libc::ioctl(self.sock.as_raw_fd(), request as _, req as *mut IfReq) };
        if ret < 0 {
            return Err(last_os_error(ifname));
        }
        Ok(())
    }

    fn flags(&self, ifname: &str) -> Result<libc::c_short> {
        let mut req = IfReq::new(ifname)?;
        self.ioctl(ifname, SIOCGIFFLAGS, &mut req)?;
        // SAFETY: SIOCGIFFLAGS filled the flags member.
        Ok(unsafe { req.data.flags })
    }

    fn bridge_ioctl(&mut self, bridge: &str, ifname: &str, request: u64) -> Result<()> {
        let ifindex = self.ifindex(ifname)?;
        let mut req = IfReq::new(bridge)?;
        req.data = IfReqData {
            ifindex: ifindex as libc::c_int,
        };
        self.ioctl(bridge, request, &mut req)
    }
}

impl IfaceControl for IoctlIfaceControl {
    fn ifindex(&self, ifname: &str) -> Result<u32> {
        let name = CString::new(ifname).map_err(|_| os_error(ifname, libc::EINVAL))?;
        // SAFETY: name is a valid NUL-terminated string.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(last_os_error(ifname));
        }
        Ok(index)
    }

    fn set_up(&mut self, ifname: &str, up: bool) -> Result<()> {
        let current = self.flags(ifname)?;
        let iff_up = libc::IFF_UP as libc::c_short;
        let wanted = if up { current | iff_up } else { current & !iff_up };
        if wanted == current {
            return Ok(());
        }
        let mut req = IfReq::new(ifname)?;
        req.data = IfReqData { flags: wanted };
        self.ioctl(ifname, SIOCSIFFLAGS, &mut req)?;
        log::debug!("[Iface] {} set {}", ifname, if up { "UP" } else { "DOWN" });
        Ok(())
    }

    fn is_up(&self, ifname: &str) -> Result<bool> {
        Ok(self.flags(ifname)? & libc::IFF_UP as libc::c_short != 0)
    }

    fn bridge_add(&mut self, bridge: &str, ifname: &str) -> Result<()> {
        self.bridge_ioctl(bridge, ifname, SIOCBRADDIF)?;
        log::info!("[Iface] Added {} to bridge {}", ifname, bridge);
        Ok(())
    }

    fn bridge_remove(&mut self, bridge: &str, ifname: &str) -> Result<()> {
        self.bridge_ioctl(bridge, ifname, SIOCBRDELIF)?;
        log::info!("[Iface] Removed {} from bridge {}", ifname, bridge);
        Ok(())
    }

    fn master_bridge(&self, ifname: &str) -> Option<String> {
        let link = std::fs::read_link(format!("/sys/class/net/{ifname}/brport/bridge")).ok()?;
        link.file_name()?.to_str().map(str::to_string)
    }
}
