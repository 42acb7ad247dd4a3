use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sso_core::sealed::{SealError, SealedStore};
use sso_core::session::SessionState;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const STATE_TTL_SECS: u64 = 900;
pub const AUTH_CODE_TTL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),
    #[error("malformed token: {0}")]
    Encoding(String),
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("token expired")]
    Expired,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Seal(#[from] SealError),
}

/// Claims bound into the OAuth `state` parameter between `/start` and
/// `/callback`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateClaims {
    pub redirect_uri: String,
    pub nonce: String,
    pub expires_at: u64,
}

impl StateClaims {
    pub fn new(redirect_uri: &str, now: u64) -> Self {
        let mut entropy = [0u8; 16];
        OsRng.fill_bytes(&mut entropy);
        Self {
            redirect_uri: redirect_uri.to_string(),
            nonce: URL_SAFE_NO_PAD.encode(entropy),
            expires_at: now + STATE_TTL_SECS,
        }
    }
}

/// HMAC-sealed token codec for short-lived claims, rendered as
/// `<prefix>.<base64 payload>.<base64 signature>`.
#[derive(Clone)]
pub struct StateCodec {
    key: Vec<u8>,
}

impl StateCodec {
    pub fn new(key: &[u8]) -> Result<Self, CodeError> {
        if key.len() < 32 {
            return Err(CodeError::InvalidKey("state key requires >= 32 bytes"));
        }
        Ok(Self { key: key.to_vec() })
    }

    pub fn seal<T: Serialize>(&self, prefix: &str, claims: &T) -> Result<String, CodeError> {
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = self.sign(prefix, &encoded);
        Ok(format!("{prefix}.{encoded}.{signature}"))
    }

    /// Verify and decode a token. `now` enforces the embedded expiry through
    /// the `expires_at` field every claim struct carries.
    pub fn open<T: DeserializeOwned>(
        &self,
        prefix: &str,
        token: &str,
        now: u64,
    ) -> Result<T, CodeError> {
        let mut segments = token.split('.');
        let (Some(seg_prefix), Some(payload), Some(sig), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(CodeError::Encoding("expected three segments".to_string()));
        };
        if seg_prefix != prefix {
            return Err(CodeError::Encoding("prefix mismatch".to_string()));
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(sig.as_bytes())
            .map_err(|_| CodeError::Encoding("signature is not valid base64".to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| CodeError::InvalidKey("HMAC key"))?;
        mac.update(prefix.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| CodeError::SignatureMismatch)?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|_| CodeError::Encoding("payload is not valid base64".to_string()))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        if let Some(expires_at) = value.get("expires_at").and_then(|v| v.as_u64())
            && now > expires_at
        {
            return Err(CodeError::Expired);
        }
        Ok(serde_json::from_value(value)?)
    }

    fn sign(&self, prefix: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(prefix.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// Payload the proxy redeems over the back channel: the full session plus
/// the redirect it was minted for.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthCodeClaims {
    pub session: SessionState,
    pub redirect_uri: String,
    pub expires_at: u64,
}

/// Mints and redeems the short-lived auth codes handed to proxies. The code
/// is sealed (encrypted and authenticated) under `AUTH_CODE_SECRET` so the
/// session never transits in the clear.
pub struct AuthCodeStore {
    store: SealedStore,
}

impl AuthCodeStore {
    pub fn new(secret: &[u8]) -> Result<Self, CodeError> {
        Ok(Self {
            store: SealedStore::new(secret, None)?,
        })
    }

    pub fn mint(
        &self,
        session: &SessionState,
        redirect_uri: &str,
        now: u64,
    ) -> Result<String, CodeError> {
        let claims = AuthCodeClaims {
            session: session.clone(),
            redirect_uri: redirect_uri.to_string(),
            expires_at: now + AUTH_CODE_TTL_SECS,
        };
        Ok(self.store.seal(&claims, now)?)
    }

    pub fn redeem(&self, code: &str, now: u64) -> Result<AuthCodeClaims, CodeError> {
        let claims: AuthCodeClaims = self.store.open(code)?;
        if now > claims.expires_at {
            return Err(CodeError::Expired);
        }
        Ok(claims)
    }
}
