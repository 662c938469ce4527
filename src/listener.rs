//! Entry point for raw discovery capture.
//!
//! [`RawDisco::start_capture`] takes a family from nothing to a validated,
//! running capture: configuration and capability checks, filter assembly,
//! raw socket setup, the loopback self-test, and finally a named receive
//! thread. Any failure releases what was opened so far; the endpoint's
//! ordinary UDP path is unaffected either way.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::bpf::filter;
use crate::capture::receiver::{Receiver, Stop};
use crate::capture::{self, AddressFamily, DiscoHandler, PacketSource, selftest};
use crate::config::Config;
use crate::error::DiscoError;
use crate::metrics::Metrics;

/// Starts raw captures that feed one [`DiscoHandler`].
pub struct RawDisco {
    handler: Arc<dyn DiscoHandler>,
    metrics: Arc<Metrics>,
    config: Config,
    capability: fn() -> bool,
}

impl RawDisco {
    pub fn new(handler: Arc<dyn DiscoHandler>, config: Config) -> Self {
        Self {
            handler,
            metrics: Arc::new(Metrics::new()),
            config,
            capability: capture::socket_mark_available,
        }
    }

    /// Replace the platform capability probe.
    pub fn with_capability_check(mut self, check: fn() -> bool) -> Self {
        self.capability = check;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open, validate and start a raw capture for `family` (`"ip4"` or `"ip6"`).
    pub fn start_capture(&self, family: &str) -> Result<RawCapture, DiscoError> {
        if self.config.disabled {
            return Err(DiscoError::ConfigurationDisabled);
        }
        let family: AddressFamily = family.parse()?;
        if !(self.capability)() {
            return Err(DiscoError::CapabilityUnavailable(
                "socket marks not supported on this system".to_string(),
            ));
        }

        let program = filter::assemble(&family.filter_program())?;
        log::debug!(
            "disco raw {family}: attaching {} instruction filter",
            program.len()
        );
        let source = capture::open_raw_capture(family, &program)?;
        self.launch(family, source)
    }

    /// Self-test `source` and, once it is proven, start the receive thread.
    ///
    /// `source` is closed again if either step fails.
    pub fn launch(
        &self,
        family: AddressFamily,
        source: Arc<dyn PacketSource>,
    ) -> Result<RawCapture, DiscoError> {
        let started = Instant::now();
        if let Err(e) = selftest::run(source.as_ref(), family, self.config.self_test_timeout) {
            if let Err(close_err) = source.close() {
                log::debug!("disco raw {family}: close after failed self-test: {close_err}");
            }
            return Err(e.into());
        }
        log::debug!(
            "disco raw {family}: self-test passed in {:?}",
            started.elapsed()
        );

        let receiver = Receiver::new(family, Arc::clone(&self.handler), Arc::clone(&self.metrics));
        let reader = Arc::clone(&source);
        let worker = thread::Builder::new()
            .name(format!("rawdisco-{family}"))
            .spawn(move || receiver.run(reader.as_ref()));
        let worker = match worker {
            Ok(h) => h,
            Err(e) => {
                let _ = source.close();
                return Err(DiscoError::Spawn(e));
            }
        };

        log::info!("disco raw {family}: listening");
        Ok(RawCapture {
            family,
            source,
            worker: Some(worker),
        })
    }
}

/// A running raw capture. Dropping it stops the capture.
pub struct RawCapture {
    family: AddressFamily,
    source: Arc<dyn PacketSource>,
    worker: Option<JoinHandle<Stop>>,
}

impl RawCapture {
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.source.read_deadline()
    }

    /// Whether the receive thread is still reading.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop capturing and wait for the receive thread.
    ///
    /// Returns how the thread ended. A second call fails with
    /// [`DiscoError::Closed`] and does nothing else.
    pub fn close(&mut self) -> Result<Stop, DiscoError> {
        let Some(worker) = self.worker.take() else {
            return Err(DiscoError::Closed);
        };
        if let Err(e) = self.source.close() {
            log::debug!("disco raw {}: close: {e}", self.family);
        }
        let stop = worker.join().unwrap_or_else(|_| {
            log::warn!("disco raw {}: receive thread panicked", self.family);
            Stop::Fault
        });
        log::debug!("disco raw {}: stopped ({stop:?})", self.family);
        Ok(stop)
    }
}

impl Drop for RawCapture {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.close();
        }
    }
}
