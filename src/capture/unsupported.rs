// Raw discovery capture relies on Linux raw-socket filter semantics; other
// platforms report it unavailable and keep using the plain UDP path.

use std::sync::Arc;

use crate::bpf::filter::RawInstruction;
use crate::error::DiscoError;

use super::{AddressFamily, PacketSource};

pub fn open_raw_capture(
    family: AddressFamily,
    _filter: &[RawInstruction],
) -> Result<Arc<dyn PacketSource>, DiscoError> {
    Err(DiscoError::CapabilityUnavailable(format!(
        "raw {family} capture is only supported on Linux"
    )))
}

pub fn socket_mark_available() -> bool {
    false
}
