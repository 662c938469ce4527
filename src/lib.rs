pub mod bpf;
pub mod capture;
pub mod cli;
pub mod config;
pub mod disco;
pub mod error;
pub mod listener;
pub mod metrics;

pub use capture::receiver::Stop;
pub use capture::{AddressFamily, DiscoHandler, PacketSource, ReadError};
pub use config::Config;
pub use disco::NodePublic;
pub use error::DiscoError;
pub use listener::{RawCapture, RawDisco};
pub use metrics::{Metrics, MetricsSnapshot};
