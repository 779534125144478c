use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::sessions::User;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid Ed25519 key material: {0}")]
    InvalidKey(String),
    #[error("user is missing sub or email")]
    InvalidUser,
}

/// Deterministic proof-of-read signer. The canonical payload is hashed with
/// SHA-256 and the digest is signed with Ed25519; both outputs are stored
/// standard-base64 encoded (with padding).
pub struct CanonicalSigner {
    key: SigningKey,
}

impl CanonicalSigner {
    /// Load the keypair from a 64-byte base64 value, or generate an
    /// ephemeral one. The ephemeral secret is logged exactly once so an
    /// operator can pin it before signatures must survive a restart.
    pub fn from_env_value(value: Option<&str>) -> Result<Self, SigningError> {
        match value {
            Some(encoded) => {
                let bytes = BASE64_STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| SigningError::InvalidKey(err.to_string()))?;
                let keypair: [u8; 64] = bytes
                    .try_into()
                    .map_err(|_| SigningError::InvalidKey("expected 64 bytes".to_string()))?;
                let key = SigningKey::from_keypair_bytes(&keypair)
                    .map_err(|err| SigningError::InvalidKey(err.to_string()))?;
                Ok(Self { key })
            }
            None => {
                let key = SigningKey::generate(&mut OsRng);
                tracing::warn!(
                    ephemeral_key = %BASE64_STANDARD.encode(key.to_keypair_bytes()),
                    "ACKIFY_ED25519_PRIVATE_KEY not set; generated an ephemeral signing key. \
                     Signatures will not verify across restarts unless this key is pinned."
                );
                Ok(Self { key })
            }
        }
    }

    /// Sign a document acknowledgement. Returns `(payload_hash, signature)`,
    /// both standard base64.
    pub fn create_signature(
        &self,
        doc_id: &str,
        user: &User,
        signed_at: DateTime<Utc>,
        nonce: &str,
    ) -> Result<(String, String), SigningError> {
        if !user.is_valid() {
            return Err(SigningError::InvalidUser);
        }
        let payload = canonical_payload(doc_id, &user.sub, &user.normalized_email(), signed_at, nonce);
        let hash = Sha256::digest(&payload);
        let signature = self.key.sign(&hash);
        Ok((
            BASE64_STANDARD.encode(hash),
            BASE64_STANDARD.encode(signature.to_bytes()),
        ))
    }

    /// 16 random bytes, URL-safe base64 without padding.
    pub fn generate_nonce() -> String {
        URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<16>())
    }

    pub fn public_key_b64(&self) -> String {
        BASE64_STANDARD.encode(self.key.verifying_key().to_bytes())
    }
}

/// The exact signing preimage. Field order and the trailing newline are part
/// of the wire format; any change invalidates previously stored proofs.
pub fn canonical_payload(
    doc_id: &str,
    user_sub: &str,
    normalized_email: &str,
    signed_at: DateTime<Utc>,
    nonce: &str,
) -> Vec<u8> {
    format!(
        "doc_id={doc_id}\nuser_sub={user_sub}\nuser_email={normalized_email}\nsigned_at={}\nnonce={nonce}\n",
        rfc3339_nano(signed_at)
    )
    .into_bytes()
}

/// RFC3339 with nanosecond precision in UTC, the timestamp encoding used in
/// both the signing payload and the record-hash projection.
pub fn rfc3339_nano(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_user() -> User {
        User::new("provider|12345", "Reader@Example.COM", Some("Reader".into()))
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn payload_bytes_are_exact() {
        let payload = canonical_payload("doc-1", "u1", "a@x.example", test_time(), "bm9uY2U");
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "doc_id=doc-1\nuser_sub=u1\nuser_email=a@x.example\nsigned_at=2025-06-01T12:30:45.000000000Z\nnonce=bm9uY2U\n"
        );
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = CanonicalSigner::from_env_value(None).expect("signer");
        let (h1, s1) = signer
            .create_signature("doc-1", &test_user(), test_time(), "n1")
            .expect("sign");
        let (h2, s2) = signer
            .create_signature("doc-1", &test_user(), test_time(), "n1")
            .expect("sign");
        assert_eq!(h1, h2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn different_nonces_change_hash_and_signature() {
        let signer = CanonicalSigner::from_env_value(None).expect("signer");
        let (h1, s1) = signer
            .create_signature("doc-1", &test_user(), test_time(), "n1")
            .expect("sign");
        let (h2, s2) = signer
            .create_signature("doc-1", &test_user(), test_time(), "n2")
            .expect("sign");
        assert_ne!(h1, h2);
        assert_ne!(s1, s2);
    }

    #[test]
    fn email_case_does_not_change_output() {
        let signer = CanonicalSigner::from_env_value(None).expect("signer");
        let upper = User::new("u1", "Reader@Example.COM", None);
        let lower = User::new("u1", "reader@example.com", None);
        let (h1, s1) = signer
            .create_signature("doc-1", &upper, test_time(), "n1")
            .expect("sign");
        let (h2, s2) = signer
            .create_signature("doc-1", &lower, test_time(), "n1")
            .expect("sign");
        assert_eq!(h1, h2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn env_key_round_trips() {
        let original = CanonicalSigner::from_env_value(None).expect("signer");
        let exported = BASE64_STANDARD.encode(original.key.to_keypair_bytes());
        let reloaded = CanonicalSigner::from_env_value(Some(&exported)).expect("reload");
        assert_eq!(original.public_key_b64(), reloaded.public_key_b64());
    }

    #[test]
    fn rejects_invalid_key_material() {
        assert!(CanonicalSigner::from_env_value(Some("not-base64!!!")).is_err());
        let short = BASE64_STANDARD.encode([0u8; 16]);
        assert!(CanonicalSigner::from_env_value(Some(&short)).is_err());
    }

    #[test]
    fn nonce_is_urlsafe_16_bytes() {
        let nonce = CanonicalSigner::generate_nonce();
        assert_eq!(nonce.len(), 22);
        assert!(!nonce.contains('='));
        assert!(!nonce.contains('+'));
        assert!(!nonce.contains('/'));
    }

    #[test]
    fn blank_user_is_rejected() {
        let signer = CanonicalSigner::from_env_value(None).expect("signer");
        let user = User::new("", "a@x", None);
        assert!(matches!(
            signer.create_signature("doc-1", &user, test_time(), "n1"),
            Err(SigningError::InvalidUser)
        ));
    }
}
