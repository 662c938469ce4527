//! Discovery packet framing.
//!
//! A discovery packet is a UDP payload that starts with a fixed 6-byte
//! marker, followed by the sender's 32-byte public key and a 24-byte nonce.
//! Only the framing is known here; the sealed body is interpreted by the
//! discovery protocol handler.

use std::fmt;

/// Size of the UDP header preceding every payload seen on a raw socket.
pub const UDP_HEADER_SIZE: usize = 8;

/// Marker every discovery packet starts with ("TS" followed by U+1F4AC).
pub const MAGIC: [u8; 6] = [0x54, 0x53, 0xf0, 0x9f, 0x92, 0xac];

/// First four marker bytes as a big-endian word, for the kernel filter.
pub const DISCO_MAGIC1: u32 = 0x5453_f09f;

/// Last two marker bytes as a big-endian half-word, for the kernel filter.
pub const DISCO_MAGIC2: u16 = 0x92ac;

const _: () = assert!(u32::from_be_bytes([MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3]]) == DISCO_MAGIC1);
const _: () = assert!(u16::from_be_bytes([MAGIC[4], MAGIC[5]]) == DISCO_MAGIC2);

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Marker + sender key + nonce.
pub const HEADER_LEN: usize = MAGIC.len() + KEY_LEN + NONCE_LEN;

/// The synthetic packet sent over loopback during the raw socket self-test:
/// the marker followed by an all-zero sender key and nonce.
///
/// It is consumed by the self-test and never reaches a handler.
pub const fn test_packet() -> [u8; HEADER_LEN] {
    let mut pkt = [0u8; HEADER_LEN];
    let mut i = 0;
    while i < MAGIC.len() {
        pkt[i] = MAGIC[i];
        i += 1;
    }
    pkt
}

/// A peer's 32-byte public discovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodePublic([u8; KEY_LEN]);

impl NodePublic {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("nodekey:")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Whether `payload` carries the discovery marker and a full header.
pub fn looks_like_disco(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload.starts_with(&MAGIC)
}

/// The sender key claimed in a discovery header.
///
/// The claim is unauthenticated until the sealed body is opened.
pub fn sender_key(payload: &[u8]) -> Option<NodePublic> {
    if !looks_like_disco(payload) {
        return None;
    }
    let start = MAGIC.len();
    let key: [u8; KEY_LEN] = payload[start..start + KEY_LEN].try_into().ok()?;
    Some(NodePublic(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        let pkt = test_packet();
        assert_eq!(pkt.len(), 62);
        assert_eq!(&pkt[..6], &MAGIC);
        assert!(pkt[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_packet_is_disco_with_zero_sender() {
        let pkt = test_packet();
        assert!(looks_like_disco(&pkt));
        let key = sender_key(&pkt).unwrap();
        assert!(key.is_zero());
    }

    #[test]
    fn sender_key_extracted() {
        let mut pkt = test_packet().to_vec();
        pkt[6] = 0xab;
        pkt[37] = 0xcd;
        pkt.extend_from_slice(b"sealed box");
        let key = sender_key(&pkt).unwrap();
        assert_eq!(key.as_bytes()[0], 0xab);
        assert_eq!(key.as_bytes()[31], 0xcd);
        assert!(!key.is_zero());
    }

    #[test]
    fn short_or_unmarked_payload_is_not_disco() {
        assert!(!looks_like_disco(&MAGIC));
        assert!(!looks_like_disco(&[0xAA, 0xBB]));
        let mut pkt = test_packet();
        pkt[0] = b'X';
        assert!(!looks_like_disco(&pkt));
        assert_eq!(sender_key(&pkt), None);
    }

    #[test]
    fn node_public_display() {
        let mut bytes = [0u8; KEY_LEN];
        bytes[0] = 0x01;
        bytes[31] = 0xff;
        let s = NodePublic::from_bytes(bytes).to_string();
        assert!(s.starts_with("nodekey:01"));
        assert!(s.ends_with("ff"));
        assert_eq!(s.len(), "nodekey:".len() + 64);
    }
}
