//! Startup proof that a filtered raw socket really delivers discovery packets.
//!
//! A throwaway UDP socket sends the synthetic test packet to loopback port 1;
//! the raw socket must observe it before a single deadline expires. This
//! catches wrong offset math, a family mix-up, or a filter the kernel
//! silently ignored, none of which the setup calls themselves report.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::disco::{UDP_HEADER_SIZE, test_packet};

use super::receiver::MAX_PACKET_SIZE;
use super::{AddressFamily, PacketSource, ReadError};

/// Destination port of the probe. Nothing needs to listen there; the raw
/// socket sees the packet on its way in either way.
pub const PROBE_PORT: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SelfTestError {
    #[error("creating disco test socket: {0}")]
    Socket(#[source] io::Error),
    #[error("writing disco test packet: {0}")]
    Write(#[source] io::Error),
    #[error("reading during raw disco self-test: {0}")]
    Read(#[source] io::Error),
    #[error("raw socket closed during self-test")]
    Closed,
    #[error("raw disco self-test packet not seen within {0:?}")]
    Timeout(Duration),
}

/// Send the probe over loopback and wait for `source` to observe it.
///
/// On success the read deadline is cleared again. On failure the deadline is
/// left in place; the caller is expected to close `source`.
pub fn run(
    source: &dyn PacketSource,
    family: AddressFamily,
    timeout: Duration,
) -> Result<(), SelfTestError> {
    let loopback = family.loopback();
    let sender =
        UdpSocket::bind(SocketAddr::new(loopback, 0)).map_err(SelfTestError::Socket)?;
    sender
        .send_to(&test_packet(), SocketAddr::new(loopback, PROBE_PORT))
        .map_err(SelfTestError::Write)?;

    // `sender` stays bound until the probe has been seen.
    await_probe(source, timeout)
}

/// Read from `source` until the test packet shows up or `timeout` elapses.
///
/// The deadline is set once, so retries after unrelated packets share the
/// same time budget.
pub fn await_probe(source: &dyn PacketSource, timeout: Duration) -> Result<(), SelfTestError> {
    source
        .set_read_deadline(Some(Instant::now() + timeout))
        .map_err(SelfTestError::Read)?;

    let expected = test_packet();
    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        let n = match source.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(ReadError::Closed) => return Err(SelfTestError::Closed),
            Err(ReadError::Io(e)) if is_timeout(&e) => {
                return Err(SelfTestError::Timeout(timeout));
            }
            Err(ReadError::Io(e)) => return Err(SelfTestError::Read(e)),
        };
        if n < UDP_HEADER_SIZE {
            continue;
        }
        if buf[UDP_HEADER_SIZE..n] != expected[..] {
            continue;
        }
        break;
    }

    source.set_read_deadline(None).map_err(SelfTestError::Read)?;
    Ok(())
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::capture::testutil::{FakeRead, FakeSource, udp};
    use crate::disco::MAGIC;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn probe_observed_clears_deadline() {
        let src = FakeSource::new();
        src.push_probe(LOCALHOST);
        await_probe(&src, TIMEOUT).unwrap();
        assert_eq!(src.read_deadline(), None);
    }

    #[test]
    fn unrelated_reads_are_skipped() {
        let src = FakeSource::new();
        // Too short to hold a UDP header.
        src.push_packet(vec![1, 2, 3], LOCALHOST);
        // Marker but not the all-zero test packet.
        let mut other = test_packet();
        other[10] = 0xff;
        src.push_packet(udp(4000, 1, &other), LOCALHOST);
        // Test packet with trailing bytes.
        let mut long = test_packet().to_vec();
        long.push(0);
        src.push_packet(udp(4000, 1, &long), LOCALHOST);
        src.push_packet(udp(4000, 1, &MAGIC), LOCALHOST);
        src.push_probe(LOCALHOST);

        await_probe(&src, TIMEOUT).unwrap();
        assert_eq!(src.read_deadline(), None);
    }

    #[test]
    fn missing_probe_times_out() {
        let src = FakeSource::new();
        let start = Instant::now();
        match await_probe(&src, TIMEOUT) {
            Err(SelfTestError::Timeout(d)) => assert_eq!(d, TIMEOUT),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() >= TIMEOUT);
        // Deadline left for the caller, who closes the source.
        assert!(src.read_deadline().is_some());
    }

    #[test]
    fn deadline_is_shared_across_retries() {
        let src = FakeSource::new();
        for _ in 0..50 {
            src.push_packet(udp(4000, 1, &[0xAA]), LOCALHOST);
        }
        let start = Instant::now();
        assert!(matches!(
            await_probe(&src, TIMEOUT),
            Err(SelfTestError::Timeout(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn read_error_reported() {
        let src = FakeSource::new();
        src.push(FakeRead::Fail(io::ErrorKind::PermissionDenied));
        match await_probe(&src, TIMEOUT) {
            Err(SelfTestError::Read(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn closed_source_reported() {
        let src = FakeSource::new();
        src.close().unwrap();
        assert!(matches!(
            await_probe(&src, TIMEOUT),
            Err(SelfTestError::Closed)
        ));
    }

    #[test]
    fn run_sends_probe_over_loopback() {
        // The fake never sees the real probe; this checks the sending half
        // and that a source without the probe fails the test.
        let src = FakeSource::new();
        assert!(matches!(
            run(&src, AddressFamily::V4, TIMEOUT),
            Err(SelfTestError::Timeout(_))
        ));
    }
}
