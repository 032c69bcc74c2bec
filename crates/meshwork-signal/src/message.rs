//! Signaling messages and channel identifiers

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Key under which the implicit timestamp is carried.
const TIME_KEY: &str = "time";

/// A small key/value handshake message exchanged through the relay.
///
/// Values are plain strings so the wire format stays a flat JSON object.
/// The `time` key is stamped on push if absent and drives the client-side
/// freshness check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalMessage {
    values: BTreeMap<String, String>,
}

impl SignalMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Number of entries, including the timestamp once stamped.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the message has no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stamp the current time, unless the sender already provided one.
    pub fn stamp(&mut self) {
        if !self.values.contains_key(TIME_KEY) {
            self.values
                .insert(TIME_KEY.to_string(), Utc::now().to_rfc3339());
        }
    }

    /// Parse the embedded timestamp, if present and well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.values.get(TIME_KEY)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Age of the message relative to now.
    ///
    /// A missing or unparseable timestamp reports as infinitely old, so the
    /// freshness filter drops it.
    pub fn age(&self) -> Duration {
        match self.timestamp() {
            Some(t) => Utc::now().signed_duration_since(t),
            None => Duration::MAX,
        }
    }
}

/// A typed signaling channel.
///
/// The negotiation protocol uses two sub-channels per peer name: the auth
/// channel carries short-lived credentials, the candidate channel carries
/// gathered addresses. Keeping them as distinct variants (rather than
/// string-concatenated ids at the call sites) makes the ordering contract
/// between them visible in the types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Credential exchange for `peer`: wire id `<peer>_auth`.
    Auth(String),
    /// Candidate exchange for `peer`: wire id `<peer>`.
    Candidates(String),
}

impl Channel {
    /// Auth sub-channel for a peer name.
    pub fn auth(peer: impl Into<String>) -> Self {
        Self::Auth(peer.into())
    }

    /// Candidate sub-channel for a peer name.
    pub fn candidates(peer: impl Into<String>) -> Self {
        Self::Candidates(peer.into())
    }

    /// The relay-side channel id.
    pub fn id(&self) -> String {
        match self {
            Self::Auth(peer) => format!("{peer}_auth"),
            Self::Candidates(peer) => peer.clone(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}
