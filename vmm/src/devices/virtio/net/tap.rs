use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

// TUN/TAP ioctls from linux/if_tun.h.
const TUNTAP: ::std::os::raw::c_uint = 84; // 'T'
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, ::std::os::raw::c_int);
ioctl_iow_nr!(TUNSETOFFLOAD, TUNTAP, 208, ::std::os::raw::c_uint);
ioctl_iow_nr!(TUNSETVNETHDRSZ, TUNTAP, 216, ::std::os::raw::c_int);

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

/// The flags half of `struct ifreq`: 16 bytes of interface name followed by
/// a 24-byte union, of which TUNSETIFF only reads the leading `c_short`.
#[repr(C)]
#[derive(Copy, Clone)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _union_pad: [u8; 22],
}

/// A host TAP interface carrying the guest's ethernet frames.
///
/// The fd is opened non-blocking so the queue handler can drain it from an
/// edge-triggered epoll loop.
pub struct Tap {
    tap_file: File,
}

impl Tap {
    /// Attach to the TAP interface with the given name. The interface must
    /// already exist and the process must be allowed to open `/dev/net/tun`.
    pub fn open_named(if_name: &str) -> io::Result<Tap> {
        let bytes = if_name.as_bytes();
        // Leave room for the trailing NUL.
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TAP interface name: {if_name:?}"),
            ));
        }

        let tap_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifreq = IfReq {
            ifr_name: [0u8; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI | IFF_VNET_HDR,
            _union_pad: [0u8; 22],
        };
        ifreq.ifr_name[..bytes.len()].copy_from_slice(bytes);

        // Safe: the fd is valid and the kernel only reads `ifreq`'s name and
        // flags for TUNSETIFF.
        let ret = unsafe { ioctl_with_mut_ref(&tap_file, TUNSETIFF(), &mut ifreq) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Tap { tap_file })
    }

    /// Enable segmentation/checksum offloads on the tap, matching the virtio
    /// features advertised to the guest.
    pub fn set_offload(&self, flags: ::std::os::raw::c_uint) -> io::Result<()> {
        let ret =
            unsafe { ioctl_with_val(&self.tap_file, TUNSETOFFLOAD(), libc::c_ulong::from(flags)) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Tell the kernel how long the vnet header in front of each frame is.
    pub fn set_vnet_hdr_size(&self, size: i32) -> io::Result<()> {
        let mut size = size;
        let ret = unsafe { ioctl_with_mut_ref(&self.tap_file, TUNSETVNETHDRSZ(), &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.tap_file.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tap_file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.tap_file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_interface_name() {
        let err = Tap::open_named("a-name-way-past-ifnamsiz").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_empty_interface_name() {
        let err = Tap::open_named("").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
