use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of discovery packets accepted through raw capture.
///
/// Shared by the per-family receive threads; increments are independent
/// so `Relaxed` ordering is enough.
#[derive(Debug, Default)]
pub struct Metrics {
    recv_raw_ipv4: AtomicU64,
    recv_raw_ipv6: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub recv_raw_ipv4: u64,
    pub recv_raw_ipv6: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one accepted packet against the family of its source address.
    pub fn record_receive(&self, src: IpAddr) {
        let counter = match src {
            IpAddr::V4(_) => &self.recv_raw_ipv4,
            IpAddr::V6(_) => &self.recv_raw_ipv6,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recv_raw_ipv4(&self) -> u64 {
        self.recv_raw_ipv4.load(Ordering::Relaxed)
    }

    pub fn recv_raw_ipv6(&self) -> u64 {
        self.recv_raw_ipv6.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recv_raw_ipv4: self.recv_raw_ipv4(),
            recv_raw_ipv6: self.recv_raw_ipv6(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_by_source_family() {
        let m = Metrics::new();
        m.record_receive(IpAddr::V4(Ipv4Addr::LOCALHOST));
        m.record_receive(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        m.record_receive(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                recv_raw_ipv4: 2,
                recv_raw_ipv6: 1
            }
        );
    }

    #[test]
    fn concurrent_increments() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_receive(IpAddr::V6(Ipv6Addr::LOCALHOST));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.recv_raw_ipv6(), 4000);
        assert_eq!(m.recv_raw_ipv4(), 0);
    }
}
