//! Candidate addresses
//!
//! A candidate is one address a peer offers for connectivity checks: the
//! socket's own address (host) or the NAT mapping discovered via STUN
//! (server-reflexive). Candidates travel through the signaling relay in a
//! compact text form.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{IceError, IceResult};

/// Component id; we only ever negotiate a single data component.
const COMPONENT: u8 = 1;

/// How a candidate address was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// The socket's local address.
    Host,
    /// The public mapping reported by a STUN server.
    ServerReflexive,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::ServerReflexive => 100,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            _ => None,
        }
    }

    // Foundation groups candidates of the same kind; with one socket per
    // session a per-kind constant is sufficient.
    fn foundation(self) -> u8 {
        match self {
            CandidateKind::Host => 1,
            CandidateKind::ServerReflexive => 2,
        }
    }
}

/// One address offered for connectivity checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
    pub priority: u32,
}

impl Candidate {
    /// Host candidate for a local socket address.
    pub fn host(addr: SocketAddr) -> Self {
        Self::with_kind(CandidateKind::Host, addr)
    }

    /// Server-reflexive candidate for a STUN-discovered mapping.
    pub fn server_reflexive(addr: SocketAddr) -> Self {
        Self::with_kind(CandidateKind::ServerReflexive, addr)
    }

    fn with_kind(kind: CandidateKind, addr: SocketAddr) -> Self {
        Self {
            kind,
            addr,
            priority: priority_for(kind),
        }
    }

    /// Wire text form: `<foundation> <component> udp <priority> <ip> <port> typ <kind>`.
    pub fn marshal(&self) -> String {
        format!(
            "{} {} udp {} {} {} typ {}",
            self.kind.foundation(),
            COMPONENT,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.kind.label(),
        )
    }

    /// Parse the wire text form produced by [`Candidate::marshal`].
    pub fn unmarshal(text: &str) -> IceResult<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 8 || fields[2] != "udp" || fields[6] != "typ" {
            return Err(IceError::InvalidCandidate(text.to_string()));
        }

        let priority: u32 = fields[3]
            .parse()
            .map_err(|_| IceError::InvalidCandidate(text.to_string()))?;
        let ip: std::net::IpAddr = fields[4]
            .parse()
            .map_err(|_| IceError::InvalidCandidate(text.to_string()))?;
        let port: u16 = fields[5]
            .parse()
            .map_err(|_| IceError::InvalidCandidate(text.to_string()))?;
        let kind = CandidateKind::from_label(fields[7])
            .ok_or_else(|| IceError::InvalidCandidate(text.to_string()))?;

        Ok(Self {
            kind,
            addr: SocketAddr::new(ip, port),
            priority,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.addr)
    }
}

/// RFC 8445 priority formula with a fixed local preference.
fn priority_for(kind: CandidateKind) -> u32 {
    (kind.type_preference() << 24) | (65535 << 8) | (256 - COMPONENT as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_round_trip() {
        let candidate = Candidate::host("192.168.1.10:51820".parse().unwrap());
        let text = candidate.marshal();
        let back = Candidate::unmarshal(&text).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_host_outranks_reflexive() {
        let host = Candidate::host("10.0.0.1:1000".parse().unwrap());
        let srflx = Candidate::server_reflexive("203.0.113.9:31000".parse().unwrap());
        assert!(host.priority > srflx.priority);
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        assert!(Candidate::unmarshal("").is_err());
        assert!(Candidate::unmarshal("1 1 tcp 1 1.2.3.4 80 typ host").is_err());
        assert!(Candidate::unmarshal("1 1 udp x 1.2.3.4 80 typ host").is_err());
        assert!(Candidate::unmarshal("1 1 udp 1 nothost 80 typ host").is_err());
        assert!(Candidate::unmarshal("1 1 udp 1 1.2.3.4 80 typ relay").is_err());
    }
}
