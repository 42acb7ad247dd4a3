use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Headers folded into the canonical payload, in this exact order. A header
/// absent from the request contributes an empty line.
pub const SIGNED_HEADERS: [&str; 9] = [
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "authorization",
    "from",
    "x-forwarded-user",
    "x-forwarded-email",
    "x-forwarded-groups",
];

pub const SIGNATURE_HEADER: &str = "sso-signature";
pub const SIGNATURE_KID_HEADER: &str = "sso-signature-kid";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(&'static str),
    #[error("malformed signature header")]
    MalformedSignature,
}

/// Signs a canonical subset of each outbound request so upstreams can prove
/// proxy origin without shared secrets. The public half is published as a
/// JWK at the certs endpoint; `kid` identifies the key for rotation.
pub struct RequestSigner {
    kid: String,
    signing: SigningKey,
}

impl RequestSigner {
    /// Build from a 32-byte Ed25519 seed.
    pub fn new(kid: String, seed: &[u8]) -> Result<Self, SignerError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| SignerError::InvalidKey("REQUEST_SIGNING_KEY must be 32 bytes"))?;
        Ok(Self {
            kid,
            signing: SigningKey::from_bytes(&seed),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// `Sso-Signature` header value for the given outbound request parts.
    pub fn sign(&self, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) -> String {
        let payload = canonical_payload(method, path, headers, body);
        let digest = Sha256::digest(&payload);
        let signature: Signature = self.signing.sign(&digest);
        format!("v1 {}", BASE64_STANDARD.encode(signature.to_bytes()))
    }

    /// JWKS document upstreams fetch to verify signatures.
    pub fn jwks_document(&self) -> Value {
        let x = URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes());
        json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "x": x,
                "kid": self.kid,
                "alg": "EdDSA",
                "use": "sig",
            }]
        })
    }
}

/// The deterministic byte sequence covered by the signature: each signed
/// header's value newline-terminated, then the method, the URL path, and
/// the base64 SHA-256 of the body, each newline-terminated.
pub fn canonical_payload(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for name in SIGNED_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            payload.extend_from_slice(value.as_bytes());
        }
        payload.push(b'\n');
    }
    payload.extend_from_slice(method.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(path.as_bytes());
    payload.push(b'\n');
    payload.extend_from_slice(BASE64_STANDARD.encode(Sha256::digest(body)).as_bytes());
    payload.push(b'\n');
    payload
}

/// Verification half, as an upstream (or a test) would run it.
pub fn verify(
    key: &VerifyingKey,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    signature_header: &str,
) -> Result<bool, SignerError> {
    let encoded = signature_header
        .strip_prefix("v1 ")
        .ok_or(SignerError::MalformedSignature)?;
    let bytes = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|_| SignerError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&bytes).map_err(|_| SignerError::MalformedSignature)?;

    let payload = canonical_payload(method, path, headers, body);
    let digest = Sha256::digest(&payload);
    Ok(key.verify(&digest, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signer() -> RequestSigner {
        RequestSigner::new("test-key-1".into(), &[11u8; 32]).expect("signer")
    }

    fn headers() -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("content-type", HeaderValue::from_static("application/json"));
        map.insert("x-forwarded-user", HeaderValue::from_static("uid-1"));
        map.insert(
            "x-forwarded-email",
            HeaderValue::from_static("a@corp.example.com"),
        );
        map
    }

    #[test]
    fn signed_request_verifies() {
        let s = signer();
        let sig = s.sign("GET", "/resource", &headers(), b"");
        assert!(sig.starts_with("v1 "));
        assert!(
            verify(
                &s.verifying_key(),
                "GET",
                "/resource",
                &headers(),
                b"",
                &sig
            )
            .expect("verify")
        );
    }

    #[test]
    fn changing_a_signed_header_breaks_the_signature() {
        let s = signer();
        let sig = s.sign("GET", "/resource", &headers(), b"");

        let mut tampered = headers();
        tampered.insert(
            "x-forwarded-email",
            HeaderValue::from_static("b@corp.example.com"),
        );
        assert!(
            !verify(&s.verifying_key(), "GET", "/resource", &tampered, b"", &sig).expect("verify")
        );
    }

    #[test]
    fn changing_path_or_body_breaks_the_signature() {
        let s = signer();
        let sig = s.sign("POST", "/resource", &headers(), b"body");
        let key = s.verifying_key();
        assert!(!verify(&key, "POST", "/other", &headers(), b"body", &sig).expect("verify"));
        assert!(!verify(&key, "POST", "/resource", &headers(), b"tampered", &sig).expect("verify"));
        assert!(verify(&key, "POST", "/resource", &headers(), b"body", &sig).expect("verify"));
    }

    #[test]
    fn missing_headers_contribute_empty_lines() {
        let payload = canonical_payload("GET", "/x", &HeaderMap::new(), b"");
        let text = String::from_utf8(payload).expect("utf8");
        let lines: Vec<&str> = text.split('\n').collect();
        // 9 header lines + method + path + body hash + trailing empty split.
        assert_eq!(lines.len(), 13);
        assert!(lines[..9].iter().all(|line| line.is_empty()));
        assert_eq!(lines[9], "GET");
        assert_eq!(lines[10], "/x");
    }

    #[test]
    fn jwks_document_carries_kid_and_curve() {
        let doc = signer().jwks_document();
        assert_eq!(doc["keys"][0]["kid"], "test-key-1");
        assert_eq!(doc["keys"][0]["crv"], "Ed25519");
    }

    #[test]
    fn short_seed_is_rejected() {
        assert!(matches!(
            RequestSigner::new("k".into(), &[1u8; 16]),
            Err(SignerError::InvalidKey(_))
        ));
    }
}
