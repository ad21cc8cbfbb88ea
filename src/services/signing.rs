//! Signed, expiring object URLs.
//!
//! A URL carries `AccessId`, `Expires` (unix seconds) and `Signature`, an
//! ECDSA P-256/SHA-256 signature over
//!
//! ```text
//! {METHOD}\n{expires}\n{access_id}\n/{bucket}/{key}
//! ```
//!
//! encoded as unpadded base64url. Anyone holding the URL may perform that
//! method on that object until `Expires`; nothing is stored server-side.

use axum::http::Method;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use p256::{
    ecdsa::{
        Signature, SigningKey, VerifyingKey,
        signature::{Signer, Verifier},
    },
    pkcs8::DecodePrivateKey,
};
use serde::Deserialize;
use std::{fmt, fs, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use url::Url;

/// Default lifetime of an issued URL.
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(300);

/// Path prefix under which the store serves signed object requests.
pub const STORAGE_PATH_PREFIX: &str = "storage";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing is misconfigured: {0}")]
    Configuration(String),
    #[error("failed to sign url: {0}")]
    Signing(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("missing query parameter `{0}`")]
    MissingParam(&'static str),
    #[error("unknown access id")]
    UnknownAccessId,
    #[error("url expired")]
    Expired,
    #[error("signature does not match")]
    BadSignature,
}

/// Methods a URL can be issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Head,
    Put,
    Delete,
}

impl SignedMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignedMethod::Get => "GET",
            SignedMethod::Head => "HEAD",
            SignedMethod::Put => "PUT",
            SignedMethod::Delete => "DELETE",
        }
    }
}

impl TryFrom<&Method> for SignedMethod {
    type Error = ();

    fn try_from(method: &Method) -> Result<Self, Self::Error> {
        if *method == Method::GET {
            Ok(SignedMethod::Get)
        } else if *method == Method::HEAD {
            Ok(SignedMethod::Head)
        } else if *method == Method::PUT {
            Ok(SignedMethod::Put)
        } else if *method == Method::DELETE {
            Ok(SignedMethod::Delete)
        } else {
            Err(())
        }
    }
}

impl fmt::Display for SignedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access identity plus the private key that vouches for it.
#[derive(Clone)]
pub struct SigningCredentials {
    access_id: String,
    signing_key: SigningKey,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_id", &self.access_id)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl SigningCredentials {
    pub fn new(access_id: impl Into<String>, signing_key: SigningKey) -> Result<Self, SigningError> {
        let access_id = access_id.into().trim().to_string();
        if access_id.is_empty() {
            return Err(SigningError::Configuration("access id is empty".into()));
        }
        Ok(Self {
            access_id,
            signing_key,
        })
    }

    /// Parse a PKCS#8 PEM encoded P-256 private key.
    pub fn from_pem(access_id: impl Into<String>, pem: &str) -> Result<Self, SigningError> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| SigningError::Configuration(format!("invalid private key: {err}")))?;
        Self::new(access_id, signing_key)
    }

    /// Read both halves from files. Either path missing or unreadable is a
    /// configuration error; nothing is signed with partial material.
    pub fn load(
        access_id_file: Option<&Path>,
        private_key_file: Option<&Path>,
    ) -> Result<Self, SigningError> {
        let access_id_file = access_id_file
            .ok_or_else(|| SigningError::Configuration("access id file is not configured".into()))?;
        let private_key_file = private_key_file.ok_or_else(|| {
            SigningError::Configuration("private key file is not configured".into())
        })?;

        let access_id = fs::read_to_string(access_id_file).map_err(|err| {
            SigningError::Configuration(format!(
                "cannot read access id from {}: {err}",
                access_id_file.display()
            ))
        })?;
        let pem = fs::read_to_string(private_key_file).map_err(|err| {
            SigningError::Configuration(format!(
                "cannot read private key from {}: {err}",
                private_key_file.display()
            ))
        })?;

        Self::from_pem(access_id, &pem)
    }

    pub fn access_id(&self) -> &str {
        &self.access_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }
}

/// Issued URL and what it grants.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: Url,
    pub method: SignedMethod,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters carried by a signed URL.
#[derive(Debug, Default, Deserialize)]
pub struct SignatureParams {
    #[serde(rename = "AccessId")]
    pub access_id: Option<String>,
    #[serde(rename = "Expires")]
    pub expires: Option<i64>,
    #[serde(rename = "Signature")]
    pub signature: Option<String>,
}

fn canonical_string(
    method: SignedMethod,
    expires: i64,
    access_id: &str,
    bucket: &str,
    key: &str,
) -> String {
    format!("{}\n{}\n{}\n/{}/{}", method, expires, access_id, bucket, key)
}

#[derive(Debug, Clone)]
pub struct UrlSigner {
    credentials: SigningCredentials,
    base_url: Url,
}

impl UrlSigner {
    pub fn new(credentials: SigningCredentials, base_url: &str) -> Result<Self, SigningError> {
        let base_url = Url::parse(base_url).map_err(|err| {
            SigningError::Configuration(format!("invalid public base url `{base_url}`: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SigningError::Configuration(format!(
                "public base url `{base_url}` cannot carry a path"
            )));
        }
        Ok(Self {
            credentials,
            base_url,
        })
    }

    pub fn access_id(&self) -> &str {
        self.credentials.access_id()
    }

    pub fn sign(
        &self,
        bucket: &str,
        key: &str,
        method: SignedMethod,
        ttl: Duration,
    ) -> Result<SignedUrl, SigningError> {
        self.sign_at(bucket, key, method, ttl, Utc::now())
    }

    /// Issue a URL as if the current time were `now`.
    pub fn sign_at(
        &self,
        bucket: &str,
        key: &str,
        method: SignedMethod,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<SignedUrl, SigningError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| SigningError::Signing(format!("ttl out of range: {err}")))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| SigningError::Signing("expiry overflows".into()))?;
        let expires = expires_at.timestamp();

        let payload = canonical_string(method, expires, self.access_id(), bucket, key);
        let signature: Signature = self
            .credentials
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|err| SigningError::Signing(err.to_string()))?;

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SigningError::Configuration("public base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(STORAGE_PATH_PREFIX)
            .push(bucket)
            .push(key);
        url.query_pairs_mut()
            .append_pair("AccessId", self.access_id())
            .append_pair("Expires", &expires.to_string())
            .append_pair("Signature", &URL_SAFE_NO_PAD.encode(signature.to_bytes()));

        Ok(SignedUrl {
            url,
            method,
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    pub fn verifier(&self) -> UrlVerifier {
        UrlVerifier::new(self.access_id(), self.credentials.verifying_key())
    }
}

/// Store-side check of a signed URL. Needs only the public key.
#[derive(Debug, Clone)]
pub struct UrlVerifier {
    access_id: String,
    verifying_key: VerifyingKey,
}

impl UrlVerifier {
    pub fn new(access_id: impl Into<String>, verifying_key: VerifyingKey) -> Self {
        Self {
            access_id: access_id.into(),
            verifying_key,
        }
    }

    pub fn verify(
        &self,
        method: SignedMethod,
        bucket: &str,
        key: &str,
        params: &SignatureParams,
    ) -> Result<(), VerifyError> {
        self.verify_at(method, bucket, key, params, Utc::now())
    }

    /// Valid while `now` is at or before `Expires`.
    pub fn verify_at(
        &self,
        method: SignedMethod,
        bucket: &str,
        key: &str,
        params: &SignatureParams,
        now: DateTime<Utc>,
    ) -> Result<(), VerifyError> {
        let access_id = params
            .access_id
            .as_deref()
            .ok_or(VerifyError::MissingParam("AccessId"))?;
        let expires = params.expires.ok_or(VerifyError::MissingParam("Expires"))?;
        let signature = params
            .signature
            .as_deref()
            .ok_or(VerifyError::MissingParam("Signature"))?;

        if access_id != self.access_id {
            return Err(VerifyError::UnknownAccessId);
        }
        if now.timestamp() > expires {
            return Err(VerifyError::Expired);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| VerifyError::BadSignature)?;
        let signature = Signature::from_slice(&raw).map_err(|_| VerifyError::BadSignature)?;
        let payload = canonical_string(method, expires, access_id, bucket, key);
        self.verifying_key
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| VerifyError::BadSignature)
    }
}

/// Outcome of loading credentials at startup, shared by every request.
#[derive(Clone)]
pub enum SignerState {
    Ready(Arc<UrlSigner>),
    Unavailable(Arc<str>),
}

impl SignerState {
    pub fn load(
        access_id_file: Option<&Path>,
        private_key_file: Option<&Path>,
        base_url: &str,
    ) -> Self {
        let signer = SigningCredentials::load(access_id_file, private_key_file)
            .and_then(|credentials| UrlSigner::new(credentials, base_url));
        match signer {
            Ok(signer) => {
                tracing::info!(access_id = %signer.access_id(), "signing credentials loaded");
                SignerState::Ready(Arc::new(signer))
            }
            Err(err) => {
                tracing::error!("signed downloads disabled: {}", err);
                SignerState::Unavailable(err.to_string().into())
            }
        }
    }

    pub fn signer(&self) -> Result<&UrlSigner, SigningError> {
        match self {
            SignerState::Ready(signer) => Ok(signer),
            SignerState::Unavailable(reason) => {
                Err(SigningError::Configuration(reason.to_string()))
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SignerState::Ready(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::{EncodePrivateKey, LineEnding};
    use tempfile::TempDir;

    const BASE: &str = "http://files.test";

    fn signer() -> UrlSigner {
        let key = SigningKey::random(&mut rand::thread_rng());
        let credentials = SigningCredentials::new("svc@test", key).unwrap();
        UrlSigner::new(credentials, BASE).unwrap()
    }

    fn params_of(url: &Url) -> SignatureParams {
        let mut params = SignatureParams::default();
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "AccessId" => params.access_id = Some(value.into_owned()),
                "Expires" => params.expires = value.parse().ok(),
                "Signature" => params.signature = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn url_points_at_storage_path_with_expiry() {
        let signer = signer();
        let signed = signer
            .sign_at("uploads", "abc_cat.jpg", SignedMethod::Get, DEFAULT_SIGNED_URL_TTL, at(1_000))
            .unwrap();

        assert_eq!(signed.url.path(), "/storage/uploads/abc_cat.jpg");
        assert_eq!(signed.expires_at.timestamp(), 1_300);
        assert_eq!(signed.method, SignedMethod::Get);
        let params = params_of(&signed.url);
        assert_eq!(params.access_id.as_deref(), Some("svc@test"));
        assert_eq!(params.expires, Some(1_300));
    }

    #[test]
    fn key_with_slash_is_one_path_segment() {
        let signed = signer()
            .sign_at("uploads", "abc_a/b c", SignedMethod::Get, DEFAULT_SIGNED_URL_TTL, at(0))
            .unwrap();
        assert_eq!(signed.url.path(), "/storage/uploads/abc_a%2Fb%20c");
    }

    #[test]
    fn valid_until_expiry_and_rejected_after() {
        let signer = signer();
        let verifier = signer.verifier();
        let signed = signer
            .sign_at("uploads", "k_x", SignedMethod::Get, DEFAULT_SIGNED_URL_TTL, at(10_000))
            .unwrap();
        let params = params_of(&signed.url);

        for now in [10_000, 10_150, 10_300] {
            verifier
                .verify_at(SignedMethod::Get, "uploads", "k_x", &params, at(now))
                .unwrap();
        }
        assert_eq!(
            verifier.verify_at(SignedMethod::Get, "uploads", "k_x", &params, at(10_301)),
            Err(VerifyError::Expired)
        );
    }

    #[test]
    fn signature_is_bound_to_method_bucket_key_and_expiry() {
        let signer = signer();
        let verifier = signer.verifier();
        let signed = signer
            .sign_at("uploads", "k_x", SignedMethod::Get, DEFAULT_SIGNED_URL_TTL, at(0))
            .unwrap();
        let params = params_of(&signed.url);

        let bad = |method, bucket, key| verifier.verify_at(method, bucket, key, &params, at(1));
        assert_eq!(bad(SignedMethod::Put, "uploads", "k_x"), Err(VerifyError::BadSignature));
        assert_eq!(bad(SignedMethod::Get, "other", "k_x"), Err(VerifyError::BadSignature));
        assert_eq!(bad(SignedMethod::Get, "uploads", "k_y"), Err(VerifyError::BadSignature));

        let stretched = SignatureParams {
            expires: Some(99_999),
            ..params_of(&signed.url)
        };
        assert_eq!(
            verifier.verify_at(SignedMethod::Get, "uploads", "k_x", &stretched, at(1)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn another_key_cannot_forge() {
        let issuer = signer();
        let other = signer();
        let signed = other
            .sign_at("uploads", "k_x", SignedMethod::Get, DEFAULT_SIGNED_URL_TTL, at(0))
            .unwrap();
        assert_eq!(
            issuer
                .verifier()
                .verify_at(SignedMethod::Get, "uploads", "k_x", &params_of(&signed.url), at(1)),
            Err(VerifyError::BadSignature)
        );
    }

    #[test]
    fn missing_params_are_reported() {
        let verifier = signer().verifier();
        assert_eq!(
            verifier.verify_at(SignedMethod::Get, "b", "k", &SignatureParams::default(), at(0)),
            Err(VerifyError::MissingParam("AccessId"))
        );
    }

    #[test]
    fn credentials_load_from_files() {
        let dir = TempDir::new().unwrap();
        let key = SigningKey::random(&mut rand::thread_rng());
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let id_path = dir.path().join("access_id");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&id_path, "svc@test\n").unwrap();
        std::fs::write(&key_path, pem.as_bytes()).unwrap();

        let credentials = SigningCredentials::load(Some(&id_path), Some(&key_path)).unwrap();
        assert_eq!(credentials.access_id(), "svc@test");
        assert_eq!(credentials.verifying_key(), *key.verifying_key());
    }

    #[test]
    fn missing_credentials_are_configuration_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        for (id, key) in [
            (None, None),
            (Some(missing.as_path()), None),
            (Some(missing.as_path()), Some(missing.as_path())),
        ] {
            let err = SigningCredentials::load(id, key).unwrap_err();
            assert!(matches!(err, SigningError::Configuration(_)));
        }

        let state = SignerState::load(None, None, BASE);
        assert!(!state.is_ready());
        assert!(matches!(state.signer(), Err(SigningError::Configuration(_))));
    }

    #[test]
    fn garbage_key_is_rejected() {
        let err = SigningCredentials::from_pem("svc", "not a pem").unwrap_err();
        assert!(matches!(err, SigningError::Configuration(_)));
    }
}
