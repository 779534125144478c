use aes_gcm::{aead::Aead, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret must decode to 32 or 64 bytes, not {0}")]
    BadSecretLength(usize),
    #[error("sealed blob is shorter than nonce plus tag")]
    Truncated,
    #[error("AEAD rejected the plaintext")]
    SealRejected,
    #[error("AEAD authentication failed")]
    OpenRejected,
    #[error("stored blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("MAC key rejected")]
    MacKey,
}

/// Key under which session cookies and vaulted refresh tokens are sealed.
/// A sealed blob is `nonce(12B) || ciphertext || tag(16B)`; AES-256-GCM
/// supplies both secrecy and tamper evidence, so no separate MAC rides
/// along with the cookie.
#[derive(Clone)]
pub struct SealingKey(Zeroizing<[u8; KEY_LEN]>);

impl SealingKey {
    /// Accept the operator cookie secret: base64 or raw text, 32 or 64
    /// bytes. The effective key is SHA-256 over the decoded secret, so both
    /// accepted lengths collapse to exactly one AES-256 key.
    pub fn from_secret(value: &str) -> Result<Self, CryptoError> {
        let raw = decode_secret(value);
        if raw.len() != 32 && raw.len() != 64 {
            return Err(CryptoError::BadSecretLength(raw.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&Sha256::digest(&raw));
        Ok(Self(key))
    }

    /// Wrap exactly 32 raw key bytes.
    pub fn from_bytes<B>(bytes: B) -> Result<Self, CryptoError>
    where
        B: AsRef<[u8]>,
    {
        let slice = bytes.as_ref();
        if slice.len() != KEY_LEN {
            return Err(CryptoError::BadSecretLength(slice.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0[..]))
    }

    /// Seal a plaintext under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let nonce = Nonce::from(nonce_bytes);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::SealRejected)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob produced by [`SealingKey::seal`]. Anything too short to
    /// hold a nonce and a tag is rejected before touching the cipher.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::OpenRejected)
    }

    /// Seal and base64-encode, the column format of the refresh-token vault.
    pub fn seal_to_base64(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(BASE64_STANDARD.encode(self.seal(plaintext)?))
    }

    /// Decode a vault column and open it.
    pub fn open_from_base64(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = BASE64_STANDARD.decode(encoded.trim())?;
        self.open(&blob)
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

// A secret is only treated as base64 when decoding yields one of the two
// accepted key lengths; everything else is taken as raw bytes.
fn decode_secret(value: &str) -> Vec<u8> {
    let trimmed = value.trim();
    if let Ok(decoded) = BASE64_STANDARD.decode(trimmed) {
        if decoded.len() == 32 || decoded.len() == 64 {
            return decoded;
        }
    }
    trimmed.as_bytes().to_vec()
}

/// HMAC-SHA256 of `message` keyed by `secret`, rendered hex-lower. This is
/// the webhook delivery signature (`X-Ackify-Signature: sha256=<hex>`).
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> Result<String, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| CryptoError::MacKey)?;
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// `N` bytes from the OS RNG, used for nonces, tokens, and PKCE material.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_sealing() {
        let key = SealingKey::from_bytes([1u8; KEY_LEN]).expect("key");
        let plaintext = b"refresh-token-material";
        let blob = key.seal(plaintext).expect("seal");
        assert_ne!(&blob[NONCE_LEN..], plaintext.as_slice());
        let opened = key.open(&blob).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_blob_fails_to_open() {
        let key = SealingKey::from_bytes([2u8; KEY_LEN]).expect("key");
        let mut blob = key.seal(b"payload").expect("seal");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(key.open(&blob), Err(CryptoError::OpenRejected)));
    }

    #[test]
    fn short_blob_is_rejected_before_decryption() {
        let key = SealingKey::from_bytes([2u8; KEY_LEN]).expect("key");
        assert!(matches!(key.open(&[0u8; NONCE_LEN]), Err(CryptoError::Truncated)));
        assert!(matches!(key.open(b""), Err(CryptoError::Truncated)));
    }

    #[test]
    fn base64_storage_round_trip() {
        let key = SealingKey::from_bytes([3u8; KEY_LEN]).expect("key");
        let encoded = key.seal_to_base64(b"vault-entry").expect("seal");
        let opened = key.open_from_base64(&encoded).expect("open");
        assert_eq!(opened, b"vault-entry");
    }

    #[test]
    fn secret_parsing_accepts_base64_and_raw() {
        let raw32 = "0123456789abcdef0123456789abcdef";
        let from_raw = SealingKey::from_secret(raw32).expect("raw secret");
        let encoded = BASE64_STANDARD.encode(raw32);
        let from_b64 = SealingKey::from_secret(&encoded).expect("base64 secret");
        let blob = from_raw.seal(b"x").expect("seal");
        assert_eq!(from_b64.open(&blob).expect("open"), b"x");
    }

    #[test]
    fn secret_of_wrong_length_is_rejected() {
        assert!(matches!(
            SealingKey::from_secret("short"),
            Err(CryptoError::BadSecretLength(5))
        ));
    }

    #[test]
    fn hmac_matches_known_vector() {
        // RFC 4231 test case 2.
        let digest = hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").expect("hmac");
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn different_seals_use_distinct_nonces() {
        let key = SealingKey::from_bytes([4u8; KEY_LEN]).expect("key");
        let a = key.seal(b"same").expect("seal");
        let b = key.seal(b"same").expect("seal");
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = SealingKey::from_bytes([5u8; KEY_LEN]).expect("key");
        assert_eq!(format!("{key:?}"), "SealingKey(..)");
    }
}
