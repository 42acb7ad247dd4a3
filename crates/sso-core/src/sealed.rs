use aes_gcm::aead::generic_array::{GenericArray, typenum::U12, typenum::U16};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Error surface for the sealed codec. Callers treat every variant as
/// "no session"; none of them may escape as a 5xx.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("cryptographic error")]
    Crypto,
    #[error("envelope version mismatch")]
    VersionMismatch,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<base64::DecodeError> for SealError {
    fn from(err: base64::DecodeError) -> Self {
        SealError::Encoding(err.to_string())
    }
}

impl From<aes_gcm::Error> for SealError {
    fn from(_: aes_gcm::Error) -> Self {
        SealError::Crypto
    }
}

#[derive(Serialize, serde::Deserialize)]
struct Envelope<T> {
    v: u8,
    created_at: u64,
    payload: T,
}

/// Authenticated encryption codec for cookie values and auth codes.
///
/// The sealed value is `base64(nonce(12) || ciphertext || tag(16))`. Secrets
/// must decode to 32 or 64 bytes; a 64-byte secret uses its first half as the
/// AES-256-GCM key. A fallback secret may be accepted for `open` during
/// rotation; only the primary seals.
pub struct SealedStore {
    primary: Aes256Gcm,
    fallback: Option<Aes256Gcm>,
}

impl SealedStore {
    pub fn new(secret: &[u8], fallback: Option<&[u8]>) -> Result<Self, SealError> {
        let primary = cipher_from_secret(secret)?;
        let fallback = match fallback {
            Some(bytes) => Some(cipher_from_secret(bytes)?),
            None => None,
        };
        Ok(Self { primary, fallback })
    }

    pub fn seal<T: Serialize>(&self, payload: &T, now: u64) -> Result<String, SealError> {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            created_at: now,
            payload,
        };
        let mut buffer = serde_json::to_vec(&envelope)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce: GenericArray<u8, U12> = GenericArray::clone_from_slice(&nonce_bytes);

        let tag = self
            .primary
            .encrypt_in_place_detached(&nonce, &[], &mut buffer)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + buffer.len() + TAG_LEN);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&buffer);
        sealed.extend_from_slice(&tag);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn open<T: DeserializeOwned>(&self, value: &str) -> Result<T, SealError> {
        let raw = URL_SAFE_NO_PAD.decode(value.as_bytes())?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(SealError::Encoding("sealed value too short".to_string()));
        }

        let (nonce_bytes, rest) = raw.split_at(NONCE_LEN);
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_LEN);
        let nonce: GenericArray<u8, U12> = GenericArray::clone_from_slice(nonce_bytes);
        let tag: GenericArray<u8, U16> = GenericArray::clone_from_slice(tag_bytes);

        let plaintext = self
            .try_open(&self.primary, &nonce, ciphertext, &tag)
            .or_else(|_| match &self.fallback {
                Some(cipher) => self.try_open(cipher, &nonce, ciphertext, &tag),
                None => Err(SealError::Crypto),
            })?;

        let envelope: Envelope<T> = serde_json::from_slice(&plaintext)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(SealError::VersionMismatch);
        }
        Ok(envelope.payload)
    }

    fn try_open(
        &self,
        cipher: &Aes256Gcm,
        nonce: &GenericArray<u8, U12>,
        ciphertext: &[u8],
        tag: &GenericArray<u8, U16>,
    ) -> Result<Vec<u8>, SealError> {
        let mut buffer = ciphertext.to_vec();
        cipher.decrypt_in_place_detached(nonce, &[], &mut buffer, tag)?;
        Ok(buffer)
    }
}

fn cipher_from_secret(secret: &[u8]) -> Result<Aes256Gcm, SealError> {
    let key = match secret.len() {
        32 => secret,
        64 => &secret[..32],
        _ => {
            return Err(SealError::InvalidKey(
                "cookie secret must decode to 32 or 64 bytes",
            ));
        }
    };
    Aes256Gcm::new_from_slice(key).map_err(|_| SealError::InvalidKey("invalid AES-256 key"))
}
