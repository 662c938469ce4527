use std::io;

use crate::bpf::filter::AssemblyError;
use crate::capture::selftest::SelfTestError;

/// Setup failures of raw discovery capture.
///
/// None of these are fatal to the endpoint; the conventional UDP receive
/// path keeps working without raw capture.
#[derive(Debug, thiserror::Error)]
pub enum DiscoError {
    #[error("raw disco listening disabled by configuration")]
    ConfigurationDisabled,
    #[error("raw disco listening unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("unsupported address family {0:?}")]
    UnsupportedFamily(String),
    #[error("assembling filter: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("creating packet conn: {0}")]
    CreateSocket(#[source] io::Error),
    #[error("installing BPF filter: {0}")]
    InstallFilter(#[source] io::Error),
    #[error(transparent)]
    SelfTest(#[from] SelfTestError),
    #[error("spawning raw disco receiver: {0}")]
    Spawn(#[source] io::Error),
    #[error("raw disco capture already closed")]
    Closed,
    #[error("writing output: {0}")]
    Output(#[source] io::Error),
}
