// Linux capture implementation: raw IP sockets for protocol UDP.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bpf::filter::RawInstruction;
use crate::error::DiscoError;

use super::{AddressFamily, PacketSource, ReadError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const IPV4_MIN_HLEN: usize = 20;

// Mark used to probe SO_MARK support; the value itself is never routed on.
const PROBE_SOCKET_MARK: u32 = 0x80000;

#[allow(non_camel_case_types)]
#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *const RawInstruction,
}

// ---------------------------------------------------------------------------
// Raw socket
// ---------------------------------------------------------------------------

/// Raw IP socket receiving UDP packets that pass an attached BPF filter.
///
/// Reads return bytes from the UDP header onward for both families: the
/// kernel hands IPv6 raw sockets the transport header directly, while the
/// IPv4 header is stripped here.
pub struct RawSocket {
    fd: OwnedFd,
    family: AddressFamily,
    closed: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl RawSocket {
    /// Open a raw socket for UDP on `family`. No filter is attached yet, so
    /// until [`install_filter`](Self::install_filter) it sees every UDP packet.
    pub fn open(family: AddressFamily) -> Result<Self, DiscoError> {
        let domain = match family {
            AddressFamily::V4 => libc::AF_INET,
            AddressFamily::V6 => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_UDP,
            )
        };
        if fd < 0 {
            return Err(DiscoError::CreateSocket(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            fd,
            family,
            closed: AtomicBool::new(false),
            deadline: Mutex::new(None),
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Attach `filter` with `SO_ATTACH_FILTER`.
    ///
    /// On failure the socket is unchanged; dropping it releases the fd.
    pub fn install_filter(&self, filter: &[RawInstruction]) -> Result<(), DiscoError> {
        let len = u16::try_from(filter.len()).map_err(|_| {
            DiscoError::InstallFilter(io::Error::new(
                io::ErrorKind::InvalidInput,
                "filter program too long",
            ))
        })?;
        let prog = sock_fprog {
            len,
            filter: filter.as_ptr(),
        };

        // The kernel copies the program during the call, so `filter` only
        // has to outlive this setsockopt.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const sock_fprog as *const libc::c_void,
                mem::size_of::<sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(DiscoError::InstallFilter(io::Error::last_os_error()));
        }

        let dropped = self.drain();
        if dropped > 0 {
            log::debug!("raw {} socket: discarded {dropped} unfiltered packets", self.family);
        }
        Ok(())
    }

    /// Discard packets queued between socket creation and filter attach.
    fn drain(&self) -> usize {
        let mut scratch = [0u8; 64];
        let mut dropped = 0;
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n < 0 {
                return dropped;
            }
            dropped += 1;
        }
    }

    /// Set `SO_RCVTIMEO`; `None` blocks forever.
    fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            // A zero timeval means "no timeout", so round tiny values up.
            Some(d) => {
                let d = d.max(Duration::from_micros(1));
                libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                }
            }
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn current_deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PacketSource for RawSocket {
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>), ReadError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }

            // SO_RCVTIMEO is relative, so re-arm it with what is left of the
            // deadline before every read.
            if let Some(deadline) = self.current_deadline() {
                let now = Instant::now();
                if now >= deadline {
                    return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                }
                self.set_recv_timeout(Some(deadline - now))?;
            }

            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };

            // shutdown() in close() wakes the reader with a zero-length read.
            if self.closed.load(Ordering::Acquire) {
                return Err(ReadError::Closed);
            }

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            let n = n as usize;
            let src = sockaddr_to_ip(&storage, addr_len);
            let len = match self.family {
                AddressFamily::V4 => strip_ipv4_header(&mut buf[..n]),
                AddressFamily::V6 => n,
            };
            return Ok((len, src));
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
        if deadline.is_none() {
            self.set_recv_timeout(None)?;
        }
        Ok(())
    }

    fn read_deadline(&self) -> Option<Instant> {
        self.current_deadline()
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "raw socket already closed",
            ));
        }
        // The fd stays open until the last reference drops, so a blocked
        // reader never sees it reused. Unconnected sockets report ENOTCONN
        // here but blocked readers are still woken.
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open a raw socket for `family` and attach `filter` to it.
pub fn open_raw_capture(
    family: AddressFamily,
    filter: &[RawInstruction],
) -> Result<Arc<dyn PacketSource>, DiscoError> {
    let socket = RawSocket::open(family)?;
    socket.install_filter(filter)?;
    log::debug!(
        "raw {} socket open with {}-instruction filter",
        family,
        filter.len()
    );
    Ok(Arc::new(socket))
}

/// Whether this process may set `SO_MARK` on its sockets.
///
/// Raw capture is only used when outgoing sockets can be marked for policy
/// routing; without CAP_NET_ADMIN the endpoint sticks to plain UDP.
pub fn socket_mark_available() -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        log::debug!("SO_MARK probe socket failed: {}", io::Error::last_os_error());
        return false;
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mark = PROBE_SOCKET_MARK;
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        log::debug!("SO_MARK unavailable: {}", io::Error::last_os_error());
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Move the UDP header and payload of an IPv4 packet to the front of `buf`.
///
/// Returns the remaining length, or 0 for a packet whose IP header is
/// garbled, so the caller drops it as too short.
fn strip_ipv4_header(buf: &mut [u8]) -> usize {
    match ipv4_header_len(buf) {
        Some(hlen) => {
            buf.copy_within(hlen.., 0);
            buf.len() - hlen
        }
        None => 0,
    }
}

fn ipv4_header_len(packet: &[u8]) -> Option<usize> {
    let first = *packet.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let hlen = usize::from(first & 0x0f) * 4;
    if hlen < IPV4_MIN_HLEN || hlen > packet.len() {
        return None;
    }
    Some(hlen)
}

fn sockaddr_to_ip(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<IpAddr> {
    let len = len as usize;
    match i32::from(storage.ss_family) {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
