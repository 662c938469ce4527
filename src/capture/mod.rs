// Raw-socket discovery capture.
//
// On Linux: raw IP sockets (protocol UDP) with a classic BPF filter.
// Elsewhere: raw capture is reported unavailable.
//
// Both platforms export:
//   - socket_mark_available() -> bool
//   - open_raw_capture(family, filter) -> Result<Arc<dyn PacketSource>, DiscoError>

pub mod receiver;
pub mod selftest;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;

use crate::bpf::filter::{self, Instruction};
use crate::disco::NodePublic;
use crate::error::DiscoError;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use unsupported::*;

/// Address family a raw capture listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressFamily::V4 => "ip4",
            AddressFamily::V6 => "ip6",
        }
    }

    pub fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    /// The discovery filter matching what a raw socket of this family sees.
    pub fn filter_program(self) -> Vec<Instruction> {
        match self {
            AddressFamily::V4 => filter::discovery_filter_v4(),
            AddressFamily::V6 => filter::discovery_filter_v6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = DiscoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip4" => Ok(AddressFamily::V4),
            "ip6" => Ok(AddressFamily::V6),
            _ => Err(DiscoError::UnsupportedFamily(s.to_string())),
        }
    }
}

/// Failure to read from a [`PacketSource`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The source was closed; the normal way a receive loop ends.
    #[error("use of closed packet source")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A socket-like source of filtered packets.
///
/// Each read yields bytes starting at the UDP header, plus the sender's IP
/// address when the platform reported a usable one.
pub trait PacketSource: Send + Sync + 'static {
    /// Blocking read of one packet into `buf`.
    ///
    /// Fails with a timeout `io::Error` (`WouldBlock` or `TimedOut`) once the
    /// read deadline has passed, and with [`ReadError::Closed`] after
    /// [`close`](Self::close).
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>), ReadError>;

    /// Bound all subsequent reads by `deadline`; `None` makes reads block
    /// indefinitely.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn read_deadline(&self) -> Option<Instant>;

    /// Stop the source, waking any blocked reader. Closing twice reports an
    /// error and changes nothing.
    fn close(&self) -> io::Result<()>;
}

/// The endpoint side of raw capture.
pub trait DiscoHandler: Send + Sync + 'static {
    /// UDP port currently bound for `family`; zero when that family is
    /// disabled. Read once per packet, so it may change at any time.
    fn bound_port(&self, family: AddressFamily) -> u16;

    /// Handle one discovery payload (the bytes after the UDP header).
    ///
    /// `sender` is always `None` for raw capture; the payload's own sealed
    /// framing identifies the peer. Runs on the receive thread, so slow
    /// handlers stall capture for that family.
    fn handle_disco_message(&self, payload: &[u8], src: SocketAddr, sender: Option<NodePublic>);
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;
    use std::io;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Instant;

    use crossbeam_channel::{Receiver, Sender, unbounded};

    use super::{AddressFamily, DiscoHandler, PacketSource, ReadError};
    use crate::disco::{NodePublic, UDP_HEADER_SIZE, test_packet};

    pub(crate) enum FakeRead {
        Packet(Vec<u8>, Option<IpAddr>),
        Fail(io::ErrorKind),
    }

    #[derive(Default)]
    struct FakeState {
        queue: VecDeque<FakeRead>,
        deadline: Option<Instant>,
        closed: bool,
    }

    /// In-memory packet source standing in for a raw socket.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        state: Mutex<FakeState>,
        cond: Condvar,
    }

    impl FakeSource {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push(&self, read: FakeRead) {
            self.state.lock().unwrap().queue.push_back(read);
            self.cond.notify_all();
        }

        pub(crate) fn push_packet(&self, packet: Vec<u8>, src: IpAddr) {
            self.push(FakeRead::Packet(packet, Some(src)));
        }

        /// Queue the self-test probe as the raw socket would deliver it.
        pub(crate) fn push_probe(&self, src: IpAddr) {
            let mut pkt = udp(50000, 1, &[]);
            pkt.extend_from_slice(&test_packet());
            self.push_packet(pkt, src);
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.state.lock().unwrap().closed
        }
    }

    impl PacketSource for FakeSource {
        fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<IpAddr>), ReadError> {
            let mut state = self.state.lock().unwrap();
            loop {
                if state.closed {
                    return Err(ReadError::Closed);
                }
                match state.queue.pop_front() {
                    Some(FakeRead::Packet(pkt, src)) => {
                        let n = pkt.len().min(buf.len());
                        buf[..n].copy_from_slice(&pkt[..n]);
                        return Ok((n, src));
                    }
                    Some(FakeRead::Fail(kind)) => return Err(io::Error::from(kind).into()),
                    None => {}
                }
                match state.deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
                        }
                        state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
                    }
                    None => state = self.cond.wait(state).unwrap(),
                }
            }
        }

        fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
            self.state.lock().unwrap().deadline = deadline;
            self.cond.notify_all();
            Ok(())
        }

        fn read_deadline(&self) -> Option<Instant> {
            self.state.lock().unwrap().deadline
        }

        fn close(&self) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "already closed"));
            }
            state.closed = true;
            self.cond.notify_all();
            Ok(())
        }
    }

    /// Build a UDP header followed by `payload`.
    pub(crate) fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(UDP_HEADER_SIZE + payload.len());
        pkt.extend_from_slice(&src_port.to_be_bytes());
        pkt.extend_from_slice(&dst_port.to_be_bytes());
        pkt.extend_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct Dispatch {
        pub payload: Vec<u8>,
        pub src: SocketAddr,
        pub sender: Option<NodePublic>,
    }

    /// Handler that records every dispatch and exposes settable ports.
    pub(crate) struct RecordingHandler {
        port4: AtomicU16,
        port6: AtomicU16,
        tx: Sender<Dispatch>,
        pub rx: Receiver<Dispatch>,
    }

    impl RecordingHandler {
        pub(crate) fn new() -> Self {
            let (tx, rx) = unbounded();
            Self {
                port4: AtomicU16::new(0),
                port6: AtomicU16::new(0),
                tx,
                rx,
            }
        }

        pub(crate) fn set_port(&self, family: AddressFamily, port: u16) {
            match family {
                AddressFamily::V4 => self.port4.store(port, Ordering::SeqCst),
                AddressFamily::V6 => self.port6.store(port, Ordering::SeqCst),
            }
        }

        pub(crate) fn dispatched(&self) -> Vec<Dispatch> {
            self.rx.try_iter().collect()
        }
    }

    impl DiscoHandler for RecordingHandler {
        fn bound_port(&self, family: AddressFamily) -> u16 {
            match family {
                AddressFamily::V4 => self.port4.load(Ordering::SeqCst),
                AddressFamily::V6 => self.port6.load(Ordering::SeqCst),
            }
        }

        fn handle_disco_message(&self, payload: &[u8], src: SocketAddr, sender: Option<NodePublic>) {
            let _ = self.tx.send(Dispatch {
                payload: payload.to_vec(),
                src,
                sender,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_parse() {
        assert_eq!("ip4".parse::<AddressFamily>().unwrap(), AddressFamily::V4);
        assert_eq!("ip6".parse::<AddressFamily>().unwrap(), AddressFamily::V6);
    }

    #[test]
    fn family_parse_rejects_other_values() {
        for s in ["ip", "IP4", "udp4", "ip4:17", ""] {
            match s.parse::<AddressFamily>() {
                Err(DiscoError::UnsupportedFamily(got)) => assert_eq!(got, s),
                other => panic!("{s:?}: expected UnsupportedFamily, got {other:?}"),
            }
        }
    }

    #[test]
    fn family_display_round_trips() {
        for f in [AddressFamily::V4, AddressFamily::V6] {
            assert_eq!(f.to_string().parse::<AddressFamily>().unwrap(), f);
        }
    }

    #[test]
    fn family_loopback() {
        assert!(AddressFamily::V4.loopback().is_ipv4());
        assert!(AddressFamily::V6.loopback().is_ipv6());
        assert!(AddressFamily::V6.loopback().is_loopback());
    }

    #[test]
    fn family_selects_program() {
        assert_eq!(
            AddressFamily::V4.filter_program(),
            filter::discovery_filter_v4()
        );
        assert_eq!(
            AddressFamily::V6.filter_program(),
            filter::discovery_filter_v6()
        );
    }
}
