//! Connectivity check wire format
//!
//! Checks are small bincode packets behind a fixed magic prefix so they can
//! share the session socket with tunnel payload. A request proves the sender
//! learned the receiver's short-lived credentials through signaling; the
//! response proves the reverse path works.
//!
//! The magic never collides with WireGuard datagrams, whose first byte is a
//! message type in 0x01..=0x04.

use serde::{Deserialize, Serialize};

use crate::error::{IceError, IceResult};

/// Prefix distinguishing check packets from tunnel payload.
pub const CHECK_MAGIC: [u8; 4] = *b"MWCK";

/// A connectivity check packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckPacket {
    /// "Can you hear me?" — authenticated with the receiver's credentials.
    Request {
        to_ufrag: String,
        to_pwd: String,
        from_ufrag: String,
        seq: u32,
    },
    /// "Loud and clear" — authenticated with the original requester's
    /// credentials, echoing the request sequence number.
    Response {
        to_ufrag: String,
        to_pwd: String,
        ack_seq: u32,
    },
}

/// Serialize a check packet with the magic prefix.
pub fn encode(packet: &CheckPacket) -> IceResult<Vec<u8>> {
    let body =
        bincode::serialize(packet).map_err(|e| IceError::Protocol(e.to_string()))?;
    let mut out = Vec::with_capacity(CHECK_MAGIC.len() + body.len());
    out.extend_from_slice(&CHECK_MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Try to decode a datagram as a check packet.
///
/// Returns `None` for anything that is not a well-formed check; such
/// datagrams are tunnel payload (or noise) and handled elsewhere.
pub fn decode(data: &[u8]) -> Option<CheckPacket> {
    let body = data.strip_prefix(&CHECK_MAGIC[..])?;
    bincode::deserialize(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = CheckPacket::Request {
            to_ufrag: "abcd1234".into(),
            to_pwd: "p".repeat(24),
            from_ufrag: "wxyz0987".into(),
            seq: 7,
        };
        let bytes = encode(&packet).unwrap();
        assert_eq!(decode(&bytes), Some(packet));
    }

    #[test]
    fn test_decode_rejects_payload() {
        assert_eq!(decode(&[0x01, 0x00, 0x00, 0x00]), None);
        assert_eq!(decode(b"MWCK"), None); // magic with no body
        assert_eq!(decode(b""), None);
    }
}
