//! The key broker: both asymmetric relationships of one session.
//!
//! The gateway never relays the upstream's public key. It keeps the key the
//! server announced (for wrapping material back toward the server and for
//! the join digest) and hands the client a freshly generated keypair, so the
//! client-side handshake verifies against material the gateway can open.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::error::{ProtoError, Result};

pub const SHARED_SECRET_LEN: usize = 16;
pub const VERIFY_TOKEN_LEN: usize = 4;

const PROXY_KEY_BITS: usize = 1024;

pub struct KeyBroker {
    server_pub: RsaPublicKey,
    server_pub_der: Vec<u8>,
    proxy_key: RsaPrivateKey,
    proxy_pub_der: Vec<u8>,
    upstream_token: Vec<u8>,
    upstream_secret: [u8; SHARED_SECRET_LEN],
    client_token: [u8; VERIFY_TOKEN_LEN],
}

impl KeyBroker {
    /// Builds the broker from the upstream's EncryptionRequest material:
    /// parses the announced SubjectPublicKeyInfo, generates the proxy
    /// keypair, and draws the upstream shared secret and the client-facing
    /// verification token from the system RNG.
    pub fn from_server_key(server_pub_der: &[u8], upstream_token: &[u8]) -> Result<Self> {
        let server_pub = RsaPublicKey::from_public_key_der(server_pub_der)
            .map_err(|err| ProtoError::HandshakeFailed(format!("decode server public key: {err}")))?;

        let mut rng = OsRng;
        let proxy_key = RsaPrivateKey::new(&mut rng, PROXY_KEY_BITS)
            .map_err(|err| ProtoError::HandshakeFailed(format!("generate proxy keypair: {err}")))?;
        let proxy_pub_der = proxy_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|err| ProtoError::HandshakeFailed(format!("encode proxy public key: {err}")))?
            .as_bytes()
            .to_vec();

        let mut upstream_secret = [0u8; SHARED_SECRET_LEN];
        rng.try_fill_bytes(&mut upstream_secret)
            .map_err(|err| ProtoError::HandshakeFailed(format!("rng: {err}")))?;
        let mut client_token = [0u8; VERIFY_TOKEN_LEN];
        rng.try_fill_bytes(&mut client_token)
            .map_err(|err| ProtoError::HandshakeFailed(format!("rng: {err}")))?;

        Ok(Self {
            server_pub,
            server_pub_der: server_pub_der.to_vec(),
            proxy_key,
            proxy_pub_der,
            upstream_token: upstream_token.to_vec(),
            upstream_secret,
            client_token,
        })
    }

    /// The DER form of the upstream key, exactly as received.
    pub fn server_public_der(&self) -> &[u8] {
        &self.server_pub_der
    }

    /// The DER form of the generated keypair, handed to the client.
    pub fn proxy_public_der(&self) -> &[u8] {
        &self.proxy_pub_der
    }

    pub fn client_token(&self) -> &[u8; VERIFY_TOKEN_LEN] {
        &self.client_token
    }

    pub fn upstream_secret(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.upstream_secret
    }

    /// Encrypts the proxy-generated shared secret and the upstream's own
    /// verification token under the upstream public key.
    pub fn wrap_for_upstream(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut rng = OsRng;
        let wrapped_secret = self
            .server_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, &self.upstream_secret)
            .map_err(|err| ProtoError::HandshakeFailed(format!("wrap shared secret: {err}")))?;
        let wrapped_token = self
            .server_pub
            .encrypt(&mut rng, Pkcs1v15Encrypt, &self.upstream_token)
            .map_err(|err| ProtoError::HandshakeFailed(format!("wrap verify token: {err}")))?;
        Ok((wrapped_secret, wrapped_token))
    }

    /// Opens the client's wrapped shared secret with the proxy private key.
    pub fn unwrap_client_secret(&self, ciphertext: &[u8]) -> Result<[u8; SHARED_SECRET_LEN]> {
        let plain = self
            .proxy_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|err| ProtoError::HandshakeFailed(format!("unwrap client secret: {err}")))?;
        plain.as_slice().try_into().map_err(|_| {
            ProtoError::HandshakeFailed(format!(
                "client shared secret is {} bytes, expected {SHARED_SECRET_LEN}",
                plain.len()
            ))
        })
    }

    /// Opens the client's wrapped verification token and byte-compares it
    /// against the token issued in the rewritten EncryptionRequest.
    pub fn verify_client_token(&self, ciphertext: &[u8]) -> Result<()> {
        let plain = self
            .proxy_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|err| ProtoError::HandshakeFailed(format!("unwrap client token: {err}")))?;
        if plain != self.client_token {
            return Err(ProtoError::HandshakeFailed(
                "client verification token does not match the issued token".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBroker")
            .field("server_pub_der_len", &self.server_pub_der.len())
            .field("proxy_pub_der_len", &self.proxy_pub_der.len())
            .finish()
    }
}

/// The session-join digest: SHA-1 over `server_id || secret || pub_der`,
/// rendered as a signed two's-complement hex string with leading zeros
/// stripped, the way the session service expects it.
pub fn join_digest(server_id: &str, shared_secret: &[u8], server_pub_der: &[u8]) -> String {
    let digest = Sha1::new()
        .chain_update(server_id.as_bytes())
        .chain_update(shared_secret)
        .chain_update(server_pub_der)
        .finalize();
    num_bigint::BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors for the signed hex rendering.
    #[test]
    fn join_digest_reference_vectors() {
        assert_eq!(
            join_digest("Notch", b"", b""),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            join_digest("jeb_", b"", b""),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
        assert_eq!(
            join_digest("simon", b"", b""),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }

    fn upstream_keypair() -> (RsaPrivateKey, Vec<u8>) {
        let key = RsaPrivateKey::new(&mut OsRng, PROXY_KEY_BITS).unwrap();
        let der = key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        (key, der)
    }

    #[test]
    fn upstream_can_open_wrapped_material() {
        let (server_key, server_der) = upstream_keypair();
        let broker = KeyBroker::from_server_key(&server_der, &[1, 2, 3, 4]).unwrap();

        let (wrapped_secret, wrapped_token) = broker.wrap_for_upstream().unwrap();
        let secret = server_key.decrypt(Pkcs1v15Encrypt, &wrapped_secret).unwrap();
        let token = server_key.decrypt(Pkcs1v15Encrypt, &wrapped_token).unwrap();
        assert_eq!(secret, broker.upstream_secret());
        assert_eq!(token, [1, 2, 3, 4]);
    }

    #[test]
    fn client_material_roundtrips_through_proxy_key() {
        let (_, server_der) = upstream_keypair();
        let broker = KeyBroker::from_server_key(&server_der, &[1, 2, 3, 4]).unwrap();

        let proxy_pub = RsaPublicKey::from_public_key_der(broker.proxy_public_der()).unwrap();
        let secret = [0xabu8; SHARED_SECRET_LEN];
        let wrapped = proxy_pub
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret)
            .unwrap();
        assert_eq!(broker.unwrap_client_secret(&wrapped).unwrap(), secret);

        let wrapped_token = proxy_pub
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, broker.client_token())
            .unwrap();
        broker.verify_client_token(&wrapped_token).unwrap();
    }

    #[test]
    fn token_mismatch_fails_the_handshake() {
        let (_, server_der) = upstream_keypair();
        let broker = KeyBroker::from_server_key(&server_der, &[1, 2, 3, 4]).unwrap();

        let proxy_pub = RsaPublicKey::from_public_key_der(broker.proxy_public_der()).unwrap();
        let mut token = *broker.client_token();
        token[0] ^= 0x01;
        let wrapped = proxy_pub
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &token)
            .unwrap();
        assert!(matches!(
            broker.verify_client_token(&wrapped),
            Err(ProtoError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn garbage_ciphertext_fails_the_handshake() {
        let (_, server_der) = upstream_keypair();
        let broker = KeyBroker::from_server_key(&server_der, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            broker.unwrap_client_secret(&[0u8; 128]),
            Err(ProtoError::HandshakeFailed(_))
        ));
    }
}
