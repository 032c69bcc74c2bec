//! Minimal STUN binding (RFC 5389)
//!
//! Candidate gathering needs exactly one thing from STUN: the reflexive
//! transport address of the session socket as seen from the outside. The
//! request is sent on the same socket the connectivity checks will use, so
//! the discovered mapping stays valid for the checks.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{IceError, IceResult};

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

/// Public STUN servers used when the agent configuration names none.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Discover the reflexive address of `socket` via a STUN server.
pub async fn mapped_address(
    socket: &UdpSocket,
    server: &str,
    wait: Duration,
) -> IceResult<SocketAddr> {
    let server_addr: SocketAddr = if let Ok(addr) = server.parse() {
        addr
    } else {
        tokio::net::lookup_host(server)
            .await
            .map_err(|e| IceError::Stun(format!("resolving '{server}': {e}")))?
            .next()
            .ok_or_else(|| IceError::Stun(format!("no addresses for '{server}'")))?
    };

    let mut transaction_id = [0u8; 12];
    getrandom::getrandom(&mut transaction_id)
        .map_err(|e| IceError::Stun(e.to_string()))?;

    let request = build_binding_request(&transaction_id);
    socket.send_to(&request, server_addr).await?;
    debug!("sent STUN binding request to {server_addr}");

    // STUN responses fit in a single small datagram.
    let mut buf = [0u8; 576];
    let (len, from) = tokio::time::timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| IceError::Stun("binding request timed out".into()))??;
    debug!("STUN response from {from} ({len} bytes)");

    parse_binding_response(&buf[..len], &transaction_id)
}

/// Build a STUN binding request packet.
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20);
    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // no attributes
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

/// Parse a binding response, returning the (XOR-)mapped address.
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> IceResult<SocketAddr> {
    if data.len() < 20 {
        return Err(IceError::Stun("response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if magic != MAGIC_COOKIE {
        return Err(IceError::Stun("bad magic cookie".into()));
    }
    if &data[8..20] != expected_txn_id {
        return Err(IceError::Stun("transaction id mismatch".into()));
    }
    if msg_type == STUN_BINDING_ERROR {
        return Err(IceError::Stun("binding error response".into()));
    }
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(IceError::Stun(format!("unexpected message type 0x{msg_type:04x}")));
    }
    if data.len() < 20 + msg_len {
        return Err(IceError::Stun("message truncated".into()));
    }

    let mut mapped: Option<SocketAddr> = None;
    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > data.len() {
            break;
        }
        let attr_data = &data[pos..pos + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                mapped = parse_address(attr_data, true, &data[4..8]).or(mapped);
            }
            ATTR_MAPPED_ADDRESS => {
                // Only used when the server sent no XOR variant.
                if mapped.is_none() {
                    mapped = parse_address(attr_data, false, &data[4..8]);
                }
            }
            _ => {}
        }

        // Attributes are 4-byte aligned.
        pos += (attr_len + 3) & !3;
    }

    mapped.ok_or_else(|| IceError::Stun("no mapped address in response".into()))
}

/// Parse MAPPED-ADDRESS / XOR-MAPPED-ADDRESS.
fn parse_address(data: &[u8], xor: bool, magic_cookie: &[u8]) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor {
        port ^= u16::from_be_bytes([magic_cookie[0], magic_cookie[1]]);
    }

    match family {
        0x01 => {
            let mut ip_bytes = [data[4], data[5], data[6], data[7]];
            if xor {
                for (b, m) in ip_bytes.iter_mut().zip(magic_cookie) {
                    *b ^= m;
                }
            }
            Some(SocketAddr::new(std::net::Ipv4Addr::from(ip_bytes).into(), port))
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&data[4..20]);
            if xor {
                for (b, m) in ip_bytes.iter_mut().zip(magic_cookie) {
                    *b ^= m;
                }
            }
            Some(SocketAddr::new(std::net::Ipv6Addr::from(ip_bytes).into(), port))
        }
        _ => None,
    }
}
