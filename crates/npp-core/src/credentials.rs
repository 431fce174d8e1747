//! Transport credentials binding a TLS configuration to a wallet address.
//!
//! The credentials are built from an Ed25519 signing key supplied by the
//! caller. The certificate is self-signed and only encrypts the channel,
//! for QUIC and for TLS over TCP alike; the peer's identity is established
//! by the channel-bound challenge-response exchange in [`crate::auth`] and
//! by address self-signatures.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{ProtoError, ProtoResult};
use crate::id::WalletAddress;

/// Server name presented in TLS and QUIC handshakes.
pub const QUIC_SERVER_NAME: &str = "npp";

/// ALPN protocol identifier for NPP over QUIC.
pub const QUIC_ALPN: &[u8] = b"npp/1";

/// Keep-alive interval for QUIC connections.
pub const QUIC_KEEPALIVE: Duration = Duration::from_secs(15);

/// Length of an address self-signature: public key followed by signature.
pub const ADDRESS_SIGNATURE_LEN: usize = 32 + 64;

/// Identity material handed to every client and server constructor.
#[derive(Clone)]
pub struct TransportCredentials {
    signing_key: SigningKey,
    wallet: WalletAddress,
    certificate: CertificateDer<'static>,
    private_key: Vec<u8>,
}

impl TransportCredentials {
    /// Builds credentials from a signing key, generating the QUIC certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the self-signed certificate cannot be generated.
    pub fn new(signing_key: SigningKey) -> ProtoResult<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![QUIC_SERVER_NAME.to_string()])?;
        let wallet = WalletAddress::from_verifying_key(&signing_key.verifying_key());
        Ok(Self {
            signing_key,
            wallet,
            certificate: certified.cert.der().clone(),
            private_key: certified.key_pair.serialize_der(),
        })
    }

    /// Returns the wallet address these credentials prove.
    #[must_use]
    pub const fn wallet_address(&self) -> WalletAddress {
        self.wallet
    }

    /// Returns the public half of the signing key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signs an arbitrary message.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Produces a self-signature over this identity's own address.
    ///
    /// The layout is `public key (32) || signature (64)`, so a verifier can
    /// check both the signature and that the key owns the address.
    #[must_use]
    pub fn sign_address(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADDRESS_SIGNATURE_LEN);
        out.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        out.extend_from_slice(&self.signing_key.sign(self.wallet.as_bytes()).to_bytes());
        out
    }

    /// Builds a quinn server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the certificate or key.
    pub fn quic_server_config(&self) -> ProtoResult<quinn::ServerConfig> {
        let mut tls = self.rustls_server()?;
        tls.alpn_protocols = vec![QUIC_ALPN.to_vec()];

        let crypto = QuicServerConfig::try_from(tls).map_err(|e| ProtoError::Tls(e.to_string()))?;
        let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        config.transport_config(Arc::new(transport_config()));
        Ok(config)
    }

    /// Builds a quinn client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the configuration.
    pub fn quic_client_config(&self) -> ProtoResult<quinn::ClientConfig> {
        let mut tls = rustls_client()?;
        tls.alpn_protocols = vec![QUIC_ALPN.to_vec()];

        let crypto = QuicClientConfig::try_from(tls).map_err(|e| ProtoError::Tls(e.to_string()))?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(transport_config()));
        Ok(config)
    }

    /// Builds a TLS server configuration for sessions carried over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the certificate or key.
    pub fn tls_server_config(&self) -> ProtoResult<Arc<rustls::ServerConfig>> {
        Ok(Arc::new(self.rustls_server()?))
    }

    /// Builds a TLS client configuration for sessions carried over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if rustls rejects the configuration.
    pub fn tls_client_config(&self) -> ProtoResult<Arc<rustls::ClientConfig>> {
        Ok(Arc::new(rustls_client()?))
    }

    fn rustls_server(&self) -> ProtoResult<rustls::ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.clone()));
        Ok(rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(vec![self.certificate.clone()], key)?)
    }

    /// Binds a QUIC endpoint that can both accept and initiate connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the UDP socket
    /// cannot be bound.
    pub fn quic_endpoint(&self, bind: SocketAddr) -> ProtoResult<quinn::Endpoint> {
        let mut endpoint = quinn::Endpoint::server(self.quic_server_config()?, bind)?;
        endpoint.set_default_client_config(self.quic_client_config()?);
        Ok(endpoint)
    }
}

impl fmt::Debug for TransportCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCredentials")
            .field("wallet", &self.wallet)
            .finish_non_exhaustive()
    }
}

/// Verifies that `sign` proves ownership of `addr`.
///
/// # Errors
///
/// Returns [`ProtoError::InvalidSignature`] if the layout is wrong, the key
/// does not own the address, or the signature does not verify.
pub fn verify_address_signature(addr: &WalletAddress, sign: &[u8]) -> ProtoResult<()> {
    if sign.len() != ADDRESS_SIGNATURE_LEN {
        return Err(ProtoError::InvalidSignature(format!(
            "expected {ADDRESS_SIGNATURE_LEN} bytes, got {}",
            sign.len()
        )));
    }
    let (key_bytes, sig_bytes) = sign.split_at(32);
    let key = parse_verifying_key(key_bytes)?;
    if WalletAddress::from_verifying_key(&key) != *addr {
        return Err(ProtoError::InvalidSignature(format!(
            "key does not own address {addr}"
        )));
    }
    let signature = Signature::from_slice(sig_bytes)
        .map_err(|e| ProtoError::InvalidSignature(e.to_string()))?;
    key.verify(addr.as_bytes(), &signature)
        .map_err(|e| ProtoError::InvalidSignature(e.to_string()))
}

pub(crate) fn parse_verifying_key(bytes: &[u8]) -> ProtoResult<VerifyingKey> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtoError::InvalidSignature("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array).map_err(|e| ProtoError::InvalidSignature(e.to_string()))
}

// Certificates are not verified, so every session proof must be bound to
// the channel through exported keying material (see `crate::auth`).
fn rustls_client() -> ProtoResult<rustls::ClientConfig> {
    let provider = crypto_provider();
    Ok(rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth())
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(QUIC_KEEPALIVE));
    transport
}

/// Accepts any server certificate; identity is checked above TLS.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn credentials() -> TransportCredentials {
        TransportCredentials::new(SigningKey::generate(&mut OsRng)).expect("credentials")
    }

    // ===== Address signatures =====

    #[test]
    fn own_address_signature_verifies() {
        let creds = credentials();
        let sign = creds.sign_address();
        assert_eq!(sign.len(), ADDRESS_SIGNATURE_LEN);
        verify_address_signature(&creds.wallet_address(), &sign).expect("valid");
    }

    #[test]
    fn signature_for_other_address_is_rejected() {
        let alice = credentials();
        let bob = credentials();
        let err = verify_address_signature(&bob.wallet_address(), &alice.sign_address())
            .expect_err("foreign signature");
        assert!(matches!(err, ProtoError::InvalidSignature(_)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let creds = credentials();
        let mut sign = creds.sign_address();
        sign[40] ^= 0xff;
        assert!(verify_address_signature(&creds.wallet_address(), &sign).is_err());
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let creds = credentials();
        let sign = creds.sign_address();
        assert!(verify_address_signature(&creds.wallet_address(), &sign[..50]).is_err());
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let creds = credentials();
        let debug = format!("{creds:?}");
        assert!(debug.contains(&creds.wallet_address().to_string()));
        assert!(!debug.contains("signing_key"));
    }

    // ===== QUIC =====

    #[test]
    fn quic_configs_build() {
        let creds = credentials();
        creds.quic_server_config().expect("server config");
        creds.quic_client_config().expect("client config");
    }

    #[test]
    fn tls_configs_carry_no_quic_alpn() {
        let creds = credentials();
        assert!(creds.tls_server_config().expect("server config").alpn_protocols.is_empty());
        assert!(creds.tls_client_config().expect("client config").alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn quic_endpoints_connect_to_each_other() {
        let server = credentials()
            .quic_endpoint("127.0.0.1:0".parse().expect("addr"))
            .expect("server endpoint");
        let client = credentials()
            .quic_endpoint("127.0.0.1:0".parse().expect("addr"))
            .expect("client endpoint");
        let server_addr = server.local_addr().expect("local addr");

        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.expect("incoming");
            incoming.await.expect("server side connection")
        });

        let conn = client
            .connect(server_addr, QUIC_SERVER_NAME)
            .expect("connect")
            .await
            .expect("client side connection");
        let server_conn = accept.await.expect("join");
        assert_eq!(server_conn.remote_address(), client.local_addr().expect("addr"));
        drop(conn);
    }
}
