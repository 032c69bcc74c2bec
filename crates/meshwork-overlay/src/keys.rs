//! Overlay key derivation
//!
//! The agent never generates overlay keys on its own: key custody hands it a
//! 32-byte seed, and the x25519 keypair is derived from that deterministically
//! so a device keeps its overlay identity across restarts.
//!
//! Keys appear in two encodings: hex inside the device configuration
//! protocol, base64 wherever a human reads them (the wg-quick convention).

use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};

/// Derive the overlay keypair from a key-custody seed.
///
/// Returns `(private, public)` raw key bytes. The seed is clamped by the
/// x25519 implementation, so any 32 bytes are acceptable input.
pub fn derive_keypair(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::from(*seed);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Hex encoding used by the configuration protocol.
pub fn encode_key(key: &[u8; 32]) -> String {
    hex::encode(key)
}

/// Decode a configuration-protocol hex key.
pub fn decode_key(text: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(text).ok()?;
    bytes.try_into().ok()
}

/// Base64 display form.
pub fn display_key(key: &[u8; 32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}
