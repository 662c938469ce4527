//! Steady-state consumer of filtered raw packets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::disco::UDP_HEADER_SIZE;
use crate::metrics::Metrics;

use super::{AddressFamily, DiscoHandler, PacketSource, ReadError};

/// Largest packet read from a raw socket.
pub const MAX_PACKET_SIZE: usize = 1500;

/// What happened to one packet read from the raw socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Passed to the handler.
    Dispatched,
    /// Shorter than a UDP header.
    Truncated,
    /// No port is bound for this family right now.
    FamilyDisabled,
    /// Addressed to a port other than the bound one.
    PortMismatch,
    /// The read did not report a usable source address.
    InvalidSource,
}

/// Why a receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The source was closed.
    Closed,
    /// A read failed; the failure has been logged.
    Fault,
}

/// Validates raw packets for one address family and dispatches them.
pub struct Receiver {
    family: AddressFamily,
    handler: Arc<dyn DiscoHandler>,
    metrics: Arc<Metrics>,
}

impl Receiver {
    pub fn new(family: AddressFamily, handler: Arc<dyn DiscoHandler>, metrics: Arc<Metrics>) -> Self {
        Self {
            family,
            handler,
            metrics,
        }
    }

    /// Read and dispatch packets until `source` is closed or fails.
    ///
    /// Packets are handled one at a time in delivery order.
    pub fn run(&self, source: &dyn PacketSource) -> Stop {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (n, src) = match source.recv_from(&mut buf) {
                Ok(read) => read,
                Err(ReadError::Closed) => {
                    log::debug!("disco raw reader ({}) closed", self.family);
                    return Stop::Closed;
                }
                Err(ReadError::Io(e)) => {
                    log::warn!("disco raw reader ({}) failed: {e}", self.family);
                    return Stop::Fault;
                }
            };
            self.process(&buf[..n], src);
        }
    }

    /// Decide what to do with one packet that starts at its UDP header.
    pub fn process(&self, packet: &[u8], src: Option<IpAddr>) -> Verdict {
        if packet.len() < UDP_HEADER_SIZE {
            return Verdict::Truncated;
        }

        let src_port = u16::from_be_bytes([packet[0], packet[1]]);
        let dst_port = u16::from_be_bytes([packet[2], packet[3]]);
        if dst_port == 0 {
            log::warn!("[unexpected] disco raw: received packet for port 0");
        }

        let accept_port = self.handler.bound_port(self.family);
        if accept_port == 0 {
            // Typically the family's UDP socket was just disabled.
            log::debug!("disco raw: dropping packet for port {dst_port} as acceptPort=0");
            return Verdict::FamilyDisabled;
        }
        if dst_port != accept_port {
            log::debug!("disco raw: dropping packet for port {dst_port}");
            return Verdict::PortMismatch;
        }

        let Some(src_ip) = src else {
            log::warn!("[unexpected] disco raw: read returned no source address");
            return Verdict::InvalidSource;
        };
        if src_ip.is_ipv4() != (self.family == AddressFamily::V4) {
            log::debug!(
                "disco raw: {} packet on {} socket from {src_ip}",
                if src_ip.is_ipv4() { "ip4" } else { "ip6" },
                self.family
            );
        }

        self.metrics.record_receive(src_ip);
        self.handler.handle_disco_message(
            &packet[UDP_HEADER_SIZE..],
            SocketAddr::new(src_ip, src_port),
            None,
        );
        Verdict::Dispatched
    }
}
