//! Identifiers used as matching keys.
//!
//! - [`WalletAddress`]: 20-byte identity derived from an Ed25519 public key
//! - [`ResourceId`]: `(protocol, address)` pair both Rendezvous and Relay match on
//! - [`PeerId`]: ephemeral handle for a single pending request

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Identity of a peer in the network.
///
/// The address is the first 20 bytes of the BLAKE3 digest of the peer's
/// Ed25519 public key and is rendered as `0x`-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress {
    bytes: [u8; WalletAddress::LEN],
}

impl WalletAddress {
    /// Length of an address in bytes.
    pub const LEN: usize = 20;

    /// Derives the address owned by the given public key.
    #[must_use]
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..Self::LEN]);
        Self { bytes }
    }

    /// Creates an address from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self { bytes }
    }

    /// Creates an address from a byte slice received over the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 20 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ProtoError> {
        let bytes: [u8; Self::LEN] = slice.try_into().map_err(|_| {
            ProtoError::InvalidAddress(format!(
                "wallet address must be {} bytes, got {}",
                Self::LEN,
                slice.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw bytes of the address.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.bytes
    }

    /// Returns the address as a byte vector for wire messages.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl AsRef<[u8]> for WalletAddress {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletAddress({self})")
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.bytes))
    }
}

impl FromStr for WalletAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(digits)
            .map_err(|e| ProtoError::InvalidAddress(format!("invalid hex address '{s}': {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WalletAddress> for String {
    fn from(addr: WalletAddress) -> Self {
        addr.to_string()
    }
}

/// Composite key shared by a publisher and a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Application protocol carried over the punched connection.
    pub protocol: String,
    /// Identity of the publishing peer.
    pub addr: WalletAddress,
}

impl ResourceId {
    /// Creates a new resource identifier.
    #[must_use]
    pub fn new(protocol: impl Into<String>, addr: WalletAddress) -> Self {
        Self {
            protocol: protocol.into(),
            addr,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr)
    }
}

/// Process-local handle for one pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Creates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtoError::InvalidAddress(format!("invalid peer id '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use test_case::test_case;

    fn random_address() -> WalletAddress {
        let key = SigningKey::generate(&mut OsRng);
        WalletAddress::from_verifying_key(&key.verifying_key())
    }

    // ===== WalletAddress =====

    #[test]
    fn debug_renders_hex_form() {
        let addr = WalletAddress::from_bytes([0xab; WalletAddress::LEN]);
        assert_eq!(format!("{addr:?}"), format!("WalletAddress({addr})"));
        assert!(format!("{addr:?}").contains("0xabab"));
    }

    #[test]
    fn address_is_derived_deterministically() {
        let key = SigningKey::generate(&mut OsRng);
        let a = WalletAddress::from_verifying_key(&key.verifying_key());
        let b = WalletAddress::from_verifying_key(&key.verifying_key());
        assert_eq!(a, b);
    }

    #[test]
    fn different_keys_give_different_addresses() {
        assert_ne!(random_address(), random_address());
    }

    #[test]
    fn address_displays_as_prefixed_hex() {
        let addr = WalletAddress::from_bytes([0xab; 20]);
        assert_eq!(addr.to_string(), format!("0x{}", "ab".repeat(20)));
    }

    #[test]
    fn address_parses_its_own_display() {
        let addr = random_address();
        let parsed: WalletAddress = addr.to_string().parse().expect("parse");
        assert_eq!(addr, parsed);
    }

    #[test_case("0xABABABABABABABABABABABABABABABABABABABAB" ; "upper case with prefix")]
    #[test_case("abababababababababababababababababababab" ; "no prefix")]
    #[test_case("0Xabababababababababababababababababababab" ; "capital prefix")]
    fn address_parse_accepts_variants(input: &str) {
        let parsed: WalletAddress = input.parse().expect("parse");
        assert_eq!(parsed, WalletAddress::from_bytes([0xab; 20]));
    }

    #[test_case("0x1234" ; "too short")]
    #[test_case("0xzz" ; "not hex")]
    #[test_case("" ; "empty")]
    fn address_parse_rejects_garbage(input: &str) {
        assert!(input.parse::<WalletAddress>().is_err());
    }

    #[test]
    fn address_from_slice_checks_length() {
        assert!(WalletAddress::from_slice(&[0u8; 19]).is_err());
        assert!(WalletAddress::from_slice(&[0u8; 20]).is_ok());
    }

    #[test]
    fn address_serde_uses_hex_string() {
        let addr = WalletAddress::from_bytes([1; 20]);
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, format!("\"0x{}\"", "01".repeat(20)));
        let back: WalletAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }

    // ===== ResourceId =====

    #[test]
    fn resource_id_display() {
        let id = ResourceId::new("grpc", WalletAddress::from_bytes([0; 20]));
        assert_eq!(id.to_string(), format!("grpc://0x{}", "00".repeat(20)));
    }

    #[test]
    fn resource_ids_differ_by_protocol() {
        let addr = random_address();
        assert_ne!(ResourceId::new("grpc", addr), ResourceId::new("quic+grpc", addr));
    }

    // ===== PeerId =====

    #[test]
    fn peer_ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
    }

    #[test]
    fn peer_id_parses_display() {
        let id = PeerId::new();
        let parsed: PeerId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
    }
}
