//! Authenticated encryption of gossip datagrams.
//!
//! The ChaCha20-Poly1305 key is derived from the shared cluster secret with
//! BLAKE3 in key-derivation mode. Every datagram carries its own random
//! 96-bit nonce in front of the ciphertext.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{RelayError, RelayResult};

const KEY_CONTEXT: &str = "npp relay gossip 2024-01-01 datagram key";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals and opens gossip datagrams.
pub(crate) struct GossipCipher {
    cipher: ChaCha20Poly1305,
}

impl GossipCipher {
    /// Derives the datagram key from the shared secret.
    pub(crate) fn new(secret: &[u8]) -> Self {
        let key = blake3::derive_key(KEY_CONTEXT, secret);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Encrypts `plaintext` into `nonce || ciphertext || tag`.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> RelayResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| RelayError::Gossip(format!("encryption failed: {e}")))?;
        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Authenticates and decrypts a datagram produced by [`Self::seal`].
    pub(crate) fn open(&self, packet: &[u8]) -> RelayResult<Vec<u8>> {
        if packet.len() < NONCE_LEN + TAG_LEN {
            return Err(RelayError::Gossip(format!(
                "datagram of {} bytes is too short",
                packet.len()
            )));
        }
        let (nonce, ciphertext) = packet.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| RelayError::Gossip("datagram failed authentication".to_string()))
    }
}

impl fmt::Debug for GossipCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_datagram_opens() {
        let cipher = GossipCipher::new(b"cluster secret");
        let packet = cipher.seal(b"members").expect("seal");
        assert_eq!(packet.len(), NONCE_LEN + 7 + TAG_LEN);
        assert_eq!(cipher.open(&packet).expect("open"), b"members");
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = GossipCipher::new(b"cluster secret");
        let a = cipher.seal(b"same").expect("seal");
        let b = cipher.seal(b"same").expect("seal");
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn other_secret_cannot_open() {
        let packet = GossipCipher::new(b"one").seal(b"members").expect("seal");
        assert!(GossipCipher::new(b"two").open(&packet).is_err());
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = GossipCipher::new(b"cluster secret");
        let mut packet = cipher.seal(b"members").expect("seal");
        let last = packet.len() - 1;
        packet[last] ^= 1;
        assert!(cipher.open(&packet).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        let cipher = GossipCipher::new(b"cluster secret");
        assert!(cipher.open(&[0u8; 10]).is_err());
    }
}
