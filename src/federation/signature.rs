//! HTTP Signatures for ActivityPub
//!
//! Signing always emits the draft style (`Signature:` header with
//! `keyId`/`algorithm`/`headers`/`signature` fields). Verification
//! accepts both the draft style and the RFC style (`Signature-Input:`
//! paired with `Signature:`, `@`-prefixed components).
//!
//! Keys are RSA (rsa-sha256) or Ed25519 (hs2019). The canonical string
//! depends only on the declared header list, never on raw header order.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _};
use lazy_static::lazy_static;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256, Sha512};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use super::limiter::Limiter;

/// Signature verification failures
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The keyname is not resolvable; callers may drop the cached key
    /// and retry once
    #[error("unknown key: {keyname}")]
    UnknownKey { keyname: String },

    /// The cryptographic check failed
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// The Digest header does not match the body
    #[error("digest mismatch")]
    DigestMismatch,

    /// The Date header is outside the acceptance window
    #[error("date out of range")]
    DateOutOfRange,

    /// The covered header set is missing a required component
    #[error("missing required header: {0}")]
    MissingRequiredHeader(String),

    /// The signature header itself cannot be parsed
    #[error("malformed signature: {0}")]
    Malformed(String),
}

/// Public half of a signing key
#[derive(Clone)]
pub enum PublicKey {
    Rsa(rsa::RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// Private half of a signing key; read-only after load
#[derive(Clone)]
pub enum PrivateKey {
    Rsa(rsa::RsaPrivateKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(_) => write!(f, "PublicKey::Rsa"),
            Self::Ed25519(_) => write!(f, "PublicKey::Ed25519"),
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(_) => write!(f, "PrivateKey::Rsa"),
            Self::Ed25519(_) => write!(f, "PrivateKey::Ed25519"),
        }
    }
}

/// Parse a PEM public key, RSA (SPKI or PKCS#1) or Ed25519.
pub fn decode_public_key(pem: &str) -> Result<PublicKey, SignatureError> {
    if let Ok(key) = rsa::RsaPublicKey::from_public_key_pem(pem) {
        return Ok(PublicKey::Rsa(key));
    }
    if let Ok(key) = rsa::RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(PublicKey::Rsa(key));
    }
    if let Ok(key) = ed25519_dalek::VerifyingKey::from_public_key_pem(pem) {
        return Ok(PublicKey::Ed25519(key));
    }
    Err(SignatureError::Malformed("undecodable public key".into()))
}

/// Parse a PEM private key, RSA (PKCS#8 or PKCS#1) or Ed25519.
pub fn decode_private_key(pem: &str) -> Result<PrivateKey, SignatureError> {
    if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(PrivateKey::Rsa(key));
    }
    if let Ok(key) = rsa::RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(PrivateKey::Rsa(key));
    }
    if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
        return Ok(PrivateKey::Ed25519(key));
    }
    Err(SignatureError::Malformed("undecodable private key".into()))
}

impl PublicKey {
    fn verify_canonical(&self, canonical: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        match self {
            Self::Rsa(key) => {
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                let signature = rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|e| SignatureError::Malformed(format!("signature bytes: {e}")))?;
                verifier
                    .verify(canonical, &signature)
                    .map_err(|_| SignatureError::BadSignature("rsa verify failed".into()))
            }
            Self::Ed25519(key) => {
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|e| SignatureError::Malformed(format!("signature bytes: {e}")))?;
                key.verify(canonical, &signature)
                    .map_err(|_| SignatureError::BadSignature("ed25519 verify failed".into()))
            }
        }
    }
}

impl PrivateKey {
    fn sign_canonical(&self, canonical: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                signer
                    .sign_with_rng(&mut rand::thread_rng(), canonical)
                    .to_vec()
            }
            Self::Ed25519(key) => key.sign(canonical).to_vec(),
        }
    }

    fn algorithm(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "rsa-sha256",
            Self::Ed25519(_) => "hs2019",
        }
    }
}

/// Headers to set on a signed outbound request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// `Signature` header value
    pub signature: String,
    /// `Date` header value (IMF-fixdate, GMT)
    pub date: String,
    /// `Host` header value
    pub host: String,
    /// `Digest` header value; present for requests with a body
    pub digest: Option<String>,
}

/// `SHA-256=<base64>` digest of a body
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

fn request_target(method: &str, url: &url::Url) -> String {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    format!("{} {}", method.to_lowercase(), target)
}

lazy_static! {
    /// Process-wide bound on concurrent signings
    static ref SIGNING_GATE: Limiter = Limiter::new(
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    );
}

/// Sign an outbound request, draft style.
///
/// Covers `(request-target) host date` plus `content-type digest` when
/// a body is present. Returns the header values to attach; `Date`,
/// `Host`, and `Digest` are computed here so the signed values and the
/// sent values cannot diverge.
pub fn sign_request(
    keyname: &str,
    key: &PrivateKey,
    method: &str,
    url: &url::Url,
    body: Option<&[u8]>,
    content_type: Option<&str>,
) -> Result<SignedHeaders, SignatureError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignatureError::Malformed("url without host".into()))?
        .to_string();
    let date = httpdate::fmt_http_date(SystemTime::now());
    let digest = body.map(body_digest);

    let mut headers = vec!["(request-target)", "host", "date"];
    let mut lines = vec![
        format!("(request-target): {}", request_target(method, url)),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    if let Some(digest_value) = &digest {
        if let Some(ct) = content_type {
            headers.push("content-type");
            lines.push(format!("content-type: {}", ct));
        }
        headers.push("digest");
        lines.push(format!("digest: {}", digest_value));
    }

    let canonical = lines.join("\n");
    let signature = BASE64.encode(key.sign_canonical(canonical.as_bytes()));

    Ok(SignedHeaders {
        signature: format!(
            r#"keyId="{}",algorithm="{}",headers="{}",signature="{}""#,
            keyname,
            key.algorithm(),
            headers.join(" "),
            signature
        ),
        date,
        host,
        digest,
    })
}

/// Sign under the process-wide signing semaphore.
pub async fn sign_request_gated(
    keyname: &str,
    key: &PrivateKey,
    method: &str,
    url: &url::Url,
    body: Option<&[u8]>,
    content_type: Option<&str>,
) -> Result<SignedHeaders, SignatureError> {
    let _permit = SIGNING_GATE.start().await;
    sign_request(keyname, key, method, url, body, content_type)
}

/// Verification knobs
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Date acceptance window, plus or minus
    pub date_window: Duration,
    /// Enforce the window for RFC-style signatures too
    pub check_rfc_time: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            date_window: Duration::from_secs(30 * 60),
            check_rfc_time: false,
        }
    }
}

fn header_value<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or_else(|| SignatureError::MissingRequiredHeader(name.to_string()))?
        .to_str()
        .map_err(|_| SignatureError::Malformed(format!("non-ascii {name} header")))
}

fn check_date(raw: &str, window: Duration) -> Result<(), SignatureError> {
    let date = httpdate::parse_http_date(raw)
        .map_err(|_| SignatureError::Malformed(format!("unparsable date: {raw}")))?;
    let now = SystemTime::now();
    let skew = match now.duration_since(date) {
        Ok(past) => past,
        Err(err) => err.duration(),
    };
    if skew > window {
        return Err(SignatureError::DateOutOfRange);
    }
    Ok(())
}

/// Verify a request's signature, returning the keyname that signed it.
///
/// Picks RFC vs draft style by the presence of `Signature-Input`. After
/// the cryptographic check, the covered header set must include a
/// digest (non-GET only), a host authority, a date, and a
/// request-target component.
pub async fn verify_request<L, Fut>(
    method: &str,
    url: &url::Url,
    headers: &http::HeaderMap,
    body: &[u8],
    options: VerifyOptions,
    lookup: L,
) -> Result<String, SignatureError>
where
    L: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<PublicKey, SignatureError>>,
{
    let (keyname, covered) = if headers.contains_key("signature-input") {
        verify_rfc(method, url, headers, body, options, lookup).await?
    } else {
        verify_draft(method, url, headers, body, options, lookup).await?
    };

    let mut digest = method.eq_ignore_ascii_case("get");
    let mut host = false;
    let mut date = false;
    let mut target = false;
    for h in &covered {
        match h.as_str() {
            "date" => date = true,
            "host" | "@authority" => host = true,
            "digest" | "content-digest" => digest = true,
            "(request-target)" | "@target-uri" | "@request-target" | "@path" => target = true,
            _ => {}
        }
    }
    let mut missing = Vec::new();
    if !digest {
        missing.push("digest");
    }
    if !host {
        missing.push("host");
    }
    if !date {
        missing.push("date");
    }
    if !target {
        missing.push("(request-target)");
    }
    if !missing.is_empty() {
        return Err(SignatureError::MissingRequiredHeader(missing.join(",")));
    }

    Ok(keyname)
}

async fn verify_draft<L, Fut>(
    method: &str,
    url: &url::Url,
    headers: &http::HeaderMap,
    body: &[u8],
    options: VerifyOptions,
    lookup: L,
) -> Result<(String, Vec<String>), SignatureError>
where
    L: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<PublicKey, SignatureError>>,
{
    let sig_header = header_value(headers, "signature")
        .map_err(|_| SignatureError::Malformed("no signature header".into()))?;

    let mut keyname = None;
    let mut algorithm = None;
    let mut covered = None;
    let mut signature_b64 = None;
    for part in sig_header.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed(format!("bad field: {part}")));
        };
        let value = value.trim().trim_matches('"');
        match name.trim() {
            "keyId" => keyname = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                covered = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature_b64 = Some(value.to_string()),
            other => {
                return Err(SignatureError::Malformed(format!("bad field: {other}")));
            }
        }
    }
    let keyname = keyname.ok_or_else(|| SignatureError::Malformed("missing keyId".into()))?;
    let _algorithm =
        algorithm.ok_or_else(|| SignatureError::Malformed("missing algorithm".into()))?;
    let covered = covered.ok_or_else(|| SignatureError::Malformed("missing headers".into()))?;
    let signature_b64 =
        signature_b64.ok_or_else(|| SignatureError::Malformed("missing signature".into()))?;

    let key = lookup(keyname.clone()).await?;

    let mut lines = Vec::with_capacity(covered.len());
    for name in &covered {
        let value = match name.as_str() {
            "(request-target)" => request_target(method, url),
            "host" => {
                let fallback = url.host_str().unwrap_or_default();
                headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(fallback)
                    .to_string()
            }
            "digest" => {
                let value = header_value(headers, "digest")?;
                if value != body_digest(body) {
                    return Err(SignatureError::DigestMismatch);
                }
                value.to_string()
            }
            "date" => {
                let value = header_value(headers, "date")?;
                check_date(value, options.date_window)?;
                value.to_string()
            }
            other => header_value(headers, other)?.to_string(),
        };
        lines.push(format!("{}: {}", name, value));
    }
    let canonical = lines.join("\n");

    let signature = BASE64
        .decode(&signature_b64)
        .map_err(|_| SignatureError::Malformed("signature not base64".into()))?;
    key.verify_canonical(canonical.as_bytes(), &signature)?;

    Ok((keyname, covered))
}

async fn verify_rfc<L, Fut>(
    method: &str,
    url: &url::Url,
    headers: &http::HeaderMap,
    body: &[u8],
    options: VerifyOptions,
    lookup: L,
) -> Result<(String, Vec<String>), SignatureError>
where
    L: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Result<PublicKey, SignatureError>>,
{
    let sig_input = header_value(headers, "signature-input")
        .map_err(|_| SignatureError::Malformed("no signature-input header".into()))?;
    let sig_header = header_value(headers, "signature")
        .map_err(|_| SignatureError::Malformed("no signature header".into()))?;

    let mut signame = None;
    let mut components_raw = None;
    let mut keyname = None;
    let mut sig_params = Vec::new();
    for part in sig_input.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            return Err(SignatureError::Malformed(format!("bad field: {part}")));
        };
        let trimmed = value.trim_matches('"');
        match name {
            "keyid" => {
                keyname = Some(trimmed.to_string());
                sig_params.push(part.to_string());
            }
            "alg" | "created" | "expires" => sig_params.push(part.to_string()),
            _ => {
                signame = Some(name.to_string());
                components_raw = Some(trimmed.to_string());
                sig_params.push(trimmed.to_string());
            }
        }
    }
    let signame = signame.ok_or_else(|| SignatureError::Malformed("missing signature name".into()))?;
    let keyname = keyname.ok_or_else(|| SignatureError::Malformed("missing keyid".into()))?;
    let components_raw =
        components_raw.ok_or_else(|| SignatureError::Malformed("missing components".into()))?;

    if !sig_header.starts_with(&signame) {
        return Err(SignatureError::Malformed("signature name mismatch".into()));
    }
    let signature_b64 = sig_header
        .trim_start_matches(&signame)
        .trim_start_matches('=')
        .trim_start_matches(':')
        .trim_end_matches(':');

    let key = lookup(keyname.clone()).await?;

    let components: Vec<String> = components_raw
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split_whitespace()
        .map(|c| c.trim_matches('"').to_string())
        .collect();

    let mut lines = Vec::with_capacity(components.len() + 1);
    for name in &components {
        let value = match name.as_str() {
            "@method" => method.to_string(),
            "@target-uri" => url.to_string(),
            "@authority" => {
                let fallback = url.host_str().unwrap_or_default();
                headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(fallback)
                    .to_string()
            }
            "@scheme" => url.scheme().to_string(),
            "@request-target" => {
                let mut target = url.path().to_string();
                if let Some(query) = url.query() {
                    target.push('?');
                    target.push_str(query);
                }
                target
            }
            "@path" => url.path().to_string(),
            "@query" => url.query().unwrap_or_default().to_string(),
            "content-digest" => {
                let value = header_value(headers, "content-digest")?;
                let expected = if value.starts_with("sha-512") {
                    format!("sha-512=:{}:", BASE64.encode(Sha512::digest(body)))
                } else {
                    format!("sha-256=:{}:", BASE64.encode(Sha256::digest(body)))
                };
                if value != expected {
                    return Err(SignatureError::DigestMismatch);
                }
                value.to_string()
            }
            "digest" => {
                let value = header_value(headers, "digest")?;
                if value != body_digest(body) {
                    return Err(SignatureError::DigestMismatch);
                }
                value.to_string()
            }
            "date" => {
                let value = header_value(headers, "date")?;
                if options.check_rfc_time {
                    check_date(value, options.date_window)?;
                }
                value.to_string()
            }
            other => header_value(headers, other)?.to_string(),
        };
        lines.push(format!(r#""{}": {}"#, name, value));
    }
    lines.push(format!(
        r#""@signature-params": {}"#,
        sig_params.join(";")
    ));
    let canonical = lines.join("\n");

    let signature = BASE64
        .decode(signature_b64)
        .map_err(|_| SignatureError::Malformed("signature not base64".into()))?;
    key.verify_canonical(canonical.as_bytes(), &signature)?;

    Ok((keyname, components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn rsa_keypair() -> (PrivateKey, PublicKey, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        (
            PrivateKey::Rsa(private_key),
            PublicKey::Rsa(public_key),
            public_pem,
        )
    }

    fn signed_request(
        key: &PrivateKey,
        body: &[u8],
    ) -> (http::HeaderMap, url::Url) {
        let url = url::Url::parse("https://remote.example/u/alice/inbox").unwrap();
        let signed = sign_request(
            "https://local.example/u/bob#key",
            key,
            "POST",
            &url,
            Some(body),
            Some(crate::federation::AS2_CONTENT_TYPE),
        )
        .unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).unwrap());
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert(
            "content-type",
            HeaderValue::from_static(crate::federation::AS2_CONTENT_TYPE),
        );
        headers.insert(
            "digest",
            HeaderValue::from_str(signed.digest.as_deref().unwrap()).unwrap(),
        );
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());
        (headers, url)
    }

    async fn lookup_ok(
        key: PublicKey,
        keyname: String,
    ) -> Result<PublicKey, SignatureError> {
        let _ = keyname;
        Ok(key)
    }

    #[tokio::test]
    async fn draft_sign_verify_round_trip_rsa() {
        let (private_key, public_key, _) = rsa_keypair();
        let body = br#"{"type":"Create"}"#;
        let (headers, url) = signed_request(&private_key, body);

        let keyname = verify_request("POST", &url, &headers, body, VerifyOptions::default(), |k| {
            lookup_ok(public_key.clone(), k)
        })
        .await
        .expect("verification succeeds");
        assert_eq!(keyname, "https://local.example/u/bob#key");
    }

    #[tokio::test]
    async fn draft_sign_verify_round_trip_ed25519() {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let public_key = PublicKey::Ed25519(signing_key.verifying_key());
        let private_key = PrivateKey::Ed25519(signing_key);

        let body = br#"{"type":"Create"}"#;
        let (headers, url) = signed_request(&private_key, body);
        assert!(headers
            .get("signature")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("hs2019"));

        verify_request("POST", &url, &headers, body, VerifyOptions::default(), |k| {
            lookup_ok(public_key.clone(), k)
        })
        .await
        .expect("ed25519 verification succeeds");
    }

    #[tokio::test]
    async fn tampered_body_fails_digest() {
        let (private_key, public_key, _) = rsa_keypair();
        let body = br#"{"type":"Create"}"#;
        let (headers, url) = signed_request(&private_key, body);

        let error = verify_request(
            "POST",
            &url,
            &headers,
            br#"{"type":"Delete"}"#,
            VerifyOptions::default(),
            |k| lookup_ok(public_key.clone(), k),
        )
        .await
        .expect_err("tampered body must fail");
        assert!(matches!(error, SignatureError::DigestMismatch));
    }

    #[tokio::test]
    async fn stale_date_is_rejected() {
        let (private_key, public_key, _) = rsa_keypair();
        let body = br#"{}"#;
        let (mut headers, url) = signed_request(&private_key, body);
        headers.insert(
            "date",
            HeaderValue::from_static("Mon, 02 Jan 2006 15:04:05 GMT"),
        );

        let error = verify_request("POST", &url, &headers, body, VerifyOptions::default(), |k| {
            lookup_ok(public_key.clone(), k)
        })
        .await
        .expect_err("stale date must fail");
        assert!(matches!(error, SignatureError::DateOutOfRange));
    }

    #[tokio::test]
    async fn missing_digest_coverage_is_rejected_for_post() {
        let (private_key, public_key, _) = rsa_keypair();
        // Sign without a body so the digest never enters the header list.
        let url = url::Url::parse("https://remote.example/u/alice/inbox").unwrap();
        let signed = sign_request("k", &private_key, "POST", &url, None, None).unwrap();

        let mut headers = http::HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).unwrap());
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());

        let error = verify_request("POST", &url, &headers, b"body", VerifyOptions::default(), |k| {
            lookup_ok(public_key.clone(), k)
        })
        .await
        .expect_err("post without covered digest must fail");
        assert!(matches!(error, SignatureError::MissingRequiredHeader(_)));
    }

    #[tokio::test]
    async fn canonical_string_ignores_raw_header_order() {
        let (private_key, public_key, _) = rsa_keypair();
        let body = br#"{"a":1}"#;
        let (headers, url) = signed_request(&private_key, body);

        // Rebuild the header map in reverse insertion order.
        let mut reversed = http::HeaderMap::new();
        let mut entries: Vec<(http::header::HeaderName, HeaderValue)> = headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        entries.reverse();
        for (name, value) in entries {
            reversed.insert(name, value);
        }

        verify_request("POST", &url, &reversed, body, VerifyOptions::default(), |k| {
            lookup_ok(public_key.clone(), k)
        })
        .await
        .expect("order must not matter");
    }

    #[tokio::test]
    async fn rfc_style_signature_verifies() {
        let (private_key, public_key, _) = rsa_keypair();
        let body = br#"{"type":"Create"}"#;
        let url = url::Url::parse("https://remote.example/u/alice/inbox").unwrap();
        let date = httpdate::fmt_http_date(SystemTime::now());
        let digest = body_digest(body);

        let components = r#"("@method" "@authority" "@path" "digest" "date")"#;
        let params = format!(r#"{};keyid="https://local.example/u/bob#key""#, components);
        let canonical = format!(
            "\"@method\": POST\n\"@authority\": remote.example\n\"@path\": /u/alice/inbox\n\"digest\": {}\n\"date\": {}\n\"@signature-params\": {}",
            digest, date, params
        );
        let signature = BASE64.encode(private_key.sign_canonical(canonical.as_bytes()));

        let mut headers = http::HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("remote.example"));
        headers.insert("date", HeaderValue::from_str(&date).unwrap());
        headers.insert("digest", HeaderValue::from_str(&digest).unwrap());
        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format!("sig1={}", params)).unwrap(),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!("sig1=:{}:", signature)).unwrap(),
        );

        let keyname =
            verify_request("POST", &url, &headers, body, VerifyOptions::default(), |k| {
                lookup_ok(public_key.clone(), k)
            })
            .await
            .expect("rfc style verification succeeds");
        assert_eq!(keyname, "https://local.example/u/bob#key");
    }

    #[tokio::test]
    async fn unknown_key_error_carries_keyname() {
        let (private_key, _, _) = rsa_keypair();
        let body = b"{}";
        let (headers, url) = signed_request(&private_key, body);

        let error = verify_request("POST", &url, &headers, body, VerifyOptions::default(), |k| async move {
            Err::<PublicKey, _>(SignatureError::UnknownKey { keyname: k })
        })
        .await
        .expect_err("lookup failure propagates");
        assert!(
            matches!(error, SignatureError::UnknownKey { keyname } if keyname.contains("bob#key"))
        );
    }

    #[test]
    fn public_key_pem_round_trips_through_decoder() {
        let (_, _, public_pem) = rsa_keypair();
        let decoded = decode_public_key(&public_pem).expect("decodes");
        assert!(matches!(decoded, PublicKey::Rsa(_)));
    }
}
