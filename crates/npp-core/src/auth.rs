//! Challenge-response session authentication.
//!
//! Right after a transport opens, the accepting side sends a random nonce.
//! The connecting side answers with its Ed25519 public key and a signature
//! over a domain-separated digest of that nonce and the [`ChannelBinding`]
//! of the TLS session both ends share. The accepting side derives the
//! caller's [`WalletAddress`] from the verified key and reports the outcome
//! back, so both ends agree on the bound identity.
//!
//! Certificates are never verified, so the binding is what keeps a proof
//! from being relayed: a man in the middle runs two TLS sessions, and the
//! keying material exported from them differs.

use std::fmt;
use std::time::Duration;

use ed25519_dalek::{Signature, Verifier};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::codec::{MAX_RPC_FRAME, read_message, write_message};
use crate::credentials::{TransportCredentials, parse_verifying_key};
use crate::error::{ProtoError, ProtoResult};
use crate::id::WalletAddress;
use crate::wire::{AuthChallenge, AuthProof, AuthResult};

/// Length of the server nonce.
pub const NONCE_LEN: usize = 32;

/// Time allowed for the whole exchange.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of the keying material mixed into every proof.
pub const CHANNEL_BINDING_LEN: usize = 32;

const AUTH_CONTEXT: &[u8] = b"npp-session-auth-v2";
const EXPORTER_LABEL: &[u8] = b"EXPORTER-npp-session-auth";

/// Keying material exported from the TLS session a proof travels on.
///
/// Both ends derive the same value only when they terminate the same TLS
/// session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding([u8; CHANNEL_BINDING_LEN]);

impl ChannelBinding {
    /// Wraps keying material derived by other means.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CHANNEL_BINDING_LEN]) -> Self {
        Self(bytes)
    }

    /// Exports the binding from the client end of a TLS session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Tls`] if the handshake has not completed.
    pub fn from_tls_client(connection: &rustls::ClientConnection) -> ProtoResult<Self> {
        Ok(Self(connection.export_keying_material(
            [0u8; CHANNEL_BINDING_LEN],
            EXPORTER_LABEL,
            None,
        )?))
    }

    /// Exports the binding from the server end of a TLS session.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Tls`] if the handshake has not completed.
    pub fn from_tls_server(connection: &rustls::ServerConnection) -> ProtoResult<Self> {
        Ok(Self(connection.export_keying_material(
            [0u8; CHANNEL_BINDING_LEN],
            EXPORTER_LABEL,
            None,
        )?))
    }

    /// Exports the binding from an established QUIC connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Tls`] if the connection refuses the export.
    pub fn from_quic(connection: &quinn::Connection) -> ProtoResult<Self> {
        let mut out = [0u8; CHANNEL_BINDING_LEN];
        connection
            .export_keying_material(&mut out, EXPORTER_LABEL, &[])
            .map_err(|_| ProtoError::Tls("keying material export failed".to_string()))?;
        Ok(Self(out))
    }
}

impl fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBinding").finish_non_exhaustive()
    }
}

fn challenge_digest(binding: &ChannelBinding, nonce: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(AUTH_CONTEXT);
    hasher.update(&binding.0);
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

fn timed_out(_: tokio::time::error::Elapsed) -> ProtoError {
    ProtoError::Auth("authentication timed out".to_string())
}

/// Proves the identity in `credentials` to the accepting side.
///
/// Returns the address the remote side bound to this session.
pub async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    credentials: &TransportCredentials,
    binding: &ChannelBinding,
) -> ProtoResult<WalletAddress>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(AUTH_TIMEOUT, async {
        let challenge: AuthChallenge = read_message(reader, MAX_RPC_FRAME).await?;
        if challenge.nonce.len() != NONCE_LEN {
            return Err(ProtoError::Auth(format!(
                "challenge nonce must be {NONCE_LEN} bytes"
            )));
        }

        let proof = AuthProof {
            public_key: credentials.verifying_key().as_bytes().to_vec(),
            signature: credentials
                .sign(&challenge_digest(binding, &challenge.nonce))
                .to_bytes()
                .to_vec(),
        };
        write_message(writer, &proof, MAX_RPC_FRAME).await?;

        let result: AuthResult = read_message(reader, MAX_RPC_FRAME).await?;
        if !result.ok {
            return Err(ProtoError::Auth(result.message));
        }
        WalletAddress::from_slice(&result.addr)
    })
    .await
    .map_err(timed_out)?
}

/// Challenges the connecting side and returns its proven address.
pub async fn verify_peer<R, W>(
    reader: &mut R,
    writer: &mut W,
    binding: &ChannelBinding,
) -> ProtoResult<WalletAddress>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(AUTH_TIMEOUT, async {
        let mut nonce = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        write_message(writer, &AuthChallenge { nonce: nonce.clone() }, MAX_RPC_FRAME).await?;

        let proof: AuthProof = read_message(reader, MAX_RPC_FRAME).await?;
        match check_proof(binding, &nonce, &proof) {
            Ok(addr) => {
                let result = AuthResult {
                    ok: true,
                    addr: addr.to_vec(),
                    message: String::new(),
                };
                write_message(writer, &result, MAX_RPC_FRAME).await?;
                debug!(addr = %addr, "session authenticated");
                Ok(addr)
            }
            Err(err) => {
                let result = AuthResult {
                    ok: false,
                    addr: Vec::new(),
                    message: err.to_string(),
                };
                // The peer is dropped regardless of whether it hears the reason.
                let _ = write_message(writer, &result, MAX_RPC_FRAME).await;
                Err(err)
            }
        }
    })
    .await
    .map_err(timed_out)?
}

fn check_proof(
    binding: &ChannelBinding,
    nonce: &[u8],
    proof: &AuthProof,
) -> ProtoResult<WalletAddress> {
    let key = parse_verifying_key(&proof.public_key).map_err(|e| ProtoError::Auth(e.to_string()))?;
    let signature =
        Signature::from_slice(&proof.signature).map_err(|e| ProtoError::Auth(e.to_string()))?;
    key.verify(&challenge_digest(binding, nonce), &signature)
        .map_err(|_| ProtoError::Auth("challenge signature does not verify".to_string()))?;
    Ok(WalletAddress::from_verifying_key(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn credentials() -> TransportCredentials {
        TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
    }

    fn binding(byte: u8) -> ChannelBinding {
        ChannelBinding::from_bytes([byte; CHANNEL_BINDING_LEN])
    }

    #[tokio::test]
    async fn both_sides_agree_on_identity() {
        let creds = credentials();
        let expected = creds.wallet_address();
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (mut server_rx, mut server_tx) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            verify_peer(&mut server_rx, &mut server_tx, &binding(7)).await
        });
        let bound = authenticate(&mut client_rx, &mut client_tx, &creds, &binding(7))
            .await
            .expect("client auth");
        let verified = server_task.await.expect("join").expect("server auth");

        assert_eq!(bound, expected);
        assert_eq!(verified, expected);
    }

    #[tokio::test]
    async fn forged_proof_is_rejected_and_reported() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (mut server_rx, mut server_tx) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            verify_peer(&mut server_rx, &mut server_tx, &binding(1)).await
        });

        let _: AuthChallenge = read_message(&mut client_rx, MAX_RPC_FRAME).await.expect("challenge");
        let key = SigningKey::generate(&mut OsRng);
        let proof = AuthProof {
            public_key: key.verifying_key().as_bytes().to_vec(),
            signature: key.sign(b"something else").to_bytes().to_vec(),
        };
        write_message(&mut client_tx, &proof, MAX_RPC_FRAME).await.expect("proof");
        let result: AuthResult = read_message(&mut client_rx, MAX_RPC_FRAME).await.expect("result");

        assert!(!result.ok);
        assert!(matches!(
            server_task.await.expect("join"),
            Err(ProtoError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn proof_forwarded_between_channels_is_rejected() {
        // The victim talks to a forwarder over one channel; the forwarder
        // replays everything to the verifier over another.
        let victim = credentials();
        let (victim_end, forwarder_near) = tokio::io::duplex(4096);
        let (forwarder_far, verifier_end) = tokio::io::duplex(4096);

        let verifier = tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(verifier_end);
            verify_peer(&mut rx, &mut tx, &binding(2)).await
        });
        let forwarder = tokio::spawn(async move {
            let mut near = forwarder_near;
            let mut far = forwarder_far;
            let _ = tokio::io::copy_bidirectional(&mut near, &mut far).await;
        });

        let (mut rx, mut tx) = tokio::io::split(victim_end);
        let err = authenticate(&mut rx, &mut tx, &victim, &binding(1))
            .await
            .expect_err("relayed proof");

        assert!(matches!(err, ProtoError::Auth(_)));
        assert!(matches!(
            verifier.await.expect("join"),
            Err(ProtoError::Auth(_))
        ));
        forwarder.abort();
    }

    #[tokio::test]
    async fn short_nonce_is_refused_by_client() {
        let creds = credentials();
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let (_server_rx, mut server_tx) = tokio::io::split(server);

        write_message(&mut server_tx, &AuthChallenge { nonce: vec![1, 2, 3] }, MAX_RPC_FRAME)
            .await
            .expect("challenge");
        let err = authenticate(&mut client_rx, &mut client_tx, &creds, &binding(0))
            .await
            .expect_err("short nonce");
        assert!(matches!(err, ProtoError::Auth(_)));
    }

    #[test]
    fn binding_debug_hides_keying_material() {
        assert_eq!(format!("{:?}", binding(9)), "ChannelBinding { .. }");
    }
}
