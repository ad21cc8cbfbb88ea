//! Upload and download orchestration.
//!
//! `upload`: generate key → open writer → copy under deadline → commit.
//! `download`: confirm the object exists → issue a signed `GET` URL.
//! Both stop at the first failure; an upload that fails never commits.

use crate::{
    config::GatewayPolicy,
    models::object::{ObjectKey, StoredObject},
    services::{
        deadline_copy::{CopyError, TransferDeadline, copy_with_deadline},
        key_generator::{KeyGenError, KeyGenerator},
        signing::{
            SignatureParams, SignedMethod, SignedUrl, SignerState, SigningError, VerifyError,
        },
        storage_service::{StorageError, StorageService},
    },
};
use bytes::Bytes;
use futures::Stream;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::fs::File;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not generate object key: {0}")]
    Entropy(#[from] KeyGenError),
    #[error("upload exceeded its deadline after {bytes_copied} bytes")]
    Timeout { bytes_copied: u64 },
    #[error("upload failed after {bytes_copied} bytes: {source}")]
    Io {
        bytes_copied: u64,
        #[source]
        source: io::Error,
    },
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("access denied: {0}")]
    AccessDenied(#[from] VerifyError),
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { bucket, key } => GatewayError::NotFound { bucket, key },
            other => GatewayError::Storage(other),
        }
    }
}

impl From<CopyError> for GatewayError {
    fn from(err: CopyError) -> Self {
        match err {
            CopyError::Timeout { bytes_copied } => GatewayError::Timeout { bytes_copied },
            CopyError::Io {
                bytes_copied,
                source,
            } => GatewayError::Io {
                bytes_copied,
                source,
            },
        }
    }
}

impl From<SigningError> for GatewayError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::Configuration(msg) => GatewayError::Configuration(msg),
            SigningError::Signing(msg) => GatewayError::Signing(msg),
        }
    }
}

/// Result of a committed upload.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: ObjectKey,
    pub object: StoredObject,
}

/// Shared, read-only request state: storage handles, the target bucket,
/// policy and signing credentials.
#[derive(Clone)]
pub struct GatewayService {
    pub storage: StorageService,
    bucket: Arc<str>,
    policy: Arc<GatewayPolicy>,
    signer: SignerState,
    keys: KeyGenerator,
}

impl GatewayService {
    pub fn new(
        storage: StorageService,
        bucket: impl Into<Arc<str>>,
        policy: GatewayPolicy,
        signer: SignerState,
    ) -> Self {
        let keys = KeyGenerator::new(policy.key_random_bytes);
        Self {
            storage,
            bucket: bucket.into(),
            policy: Arc::new(policy),
            signer,
            keys,
        }
    }

    /// Replace the key source, e.g. with [`KeyGenerator::seeded`] to make
    /// generated keys known in advance.
    pub fn with_key_generator(mut self, keys: KeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn signer_state(&self) -> &SignerState {
        &self.signer
    }

    /// Store `body` under a fresh key ending in `filename`.
    pub async fn upload<S>(
        &self,
        filename: &str,
        content_type: Option<&str>,
        body: S,
    ) -> Result<UploadReceipt, GatewayError>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        info!("uploading file to bucket {}", self.bucket);
        info!("before filename = {}", filename);
        let key = self.keys.generate(filename)?;
        info!("after filename = {}", key);

        let content_type = content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or(self.policy.default_content_type.as_str());
        let mut writer = self
            .storage
            .open_writer(&self.bucket, key.as_str(), content_type, &self.policy.access_policy)
            .await?;

        let deadline = TransferDeadline::after(self.policy.transfer_deadline);
        match copy_with_deadline(&mut writer, body, deadline).await {
            Ok(bytes_copied) => info!(key = %key, bytes_copied, "body received"),
            Err(err) => {
                warn!(key = %key, bytes_copied = err.bytes_copied(), "upload abandoned: {}", err);
                writer.abort().await;
                return Err(err.into());
            }
        }

        let object = writer.commit().await?;
        info!(key = %key, size_bytes = object.size_bytes, etag = %object.etag, "object committed");
        Ok(UploadReceipt { key, object })
    }

    /// Issue a signed `GET` URL for an existing object.
    pub async fn download(&self, key: &str) -> Result<SignedUrl, GatewayError> {
        info!("download file {} from bucket {}", key, self.bucket);
        // Opening a reader is the existence check; the handle is dropped.
        let (_object, _file) = self.storage.get_object_reader(&self.bucket, key).await?;

        let signer = self.signer.signer()?;
        let signed = signer.sign(&self.bucket, key, SignedMethod::Get, self.policy.signed_url_ttl)?;
        Ok(signed)
    }

    /// Store-side access check for `/storage/{bucket}/{key}`.
    ///
    /// Requests carrying signature parameters must verify. Requests without
    /// any are allowed only for objects whose ACL grants public read.
    pub async fn open_for_read(
        &self,
        method: SignedMethod,
        bucket: &str,
        key: &str,
        params: &SignatureParams,
    ) -> Result<(StoredObject, File), GatewayError> {
        let unsigned =
            params.access_id.is_none() && params.expires.is_none() && params.signature.is_none();

        if !unsigned {
            let signer = self.signer.signer()?;
            signer.verifier().verify(method, bucket, key, params)?;
            return Ok(self.storage.get_object_reader(bucket, key).await?);
        }

        let (object, file) = self.storage.get_object_reader(bucket, key).await?;
        if !object.access_policy().is_public_read() {
            return Err(GatewayError::AccessDenied(VerifyError::MissingParam(
                "Signature",
            )));
        }
        Ok((object, file))
    }
}
