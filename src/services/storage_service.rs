//! src/services/storage_service.rs
//!
//! StorageService — the backing object store. Metadata lives in SQLite,
//! payloads on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{md5(bucket/key)}`.
//!
//! Writes go through [`ObjectWriter`]: bytes land in
//! `base_path/{bucket}/.staging/` and only become visible once `commit`
//! renames them into place and inserts the metadata row. An uncommitted
//! writer leaves nothing addressable; its staging file is deleted on abort or
//! drop, and whatever a crash leaves behind is removed by
//! [`StorageService::sweep_staging`].

use crate::models::object::{AccessPolicy, StoredObject};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MAX_LEN: usize = 222;
const STAGING_DIR: &str = ".staging";
const STAGING_PREFIX: &str = ".tmp-";
const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> StorageResult<()> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Keys are never used as file names, so only size limits apply.
    fn ensure_key_valid(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN || key.contains('\0') {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate that a bucket name is usable as a single directory name.
    ///
    /// Bucket names are otherwise opaque: `my_bucket`, `Uploads` and dotted
    /// names are all accepted.
    pub fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        if name.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be at most 222 bytes"));
        }
        if name.starts_with('.') {
            return Err(invalid("must not start with a dot"));
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(invalid("must not contain path separators or control characters"));
        }

        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    fn staging_root(&self, bucket_name: &str) -> PathBuf {
        self.bucket_root(bucket_name).join(STAGING_DIR)
    }

    /// Payload path for an object. The file name is the hex MD5 of
    /// `bucket/key` and the first two digest bytes pick the shard
    /// directories, so caller-controlled keys never touch the path.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        let mut path = self.bucket_root(bucket_name);
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}", digest));
        path
    }

    /// Create the bucket and staging directories if missing.
    pub async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        Self::ensure_bucket_name_safe(bucket)?;
        fs::create_dir_all(self.staging_root(bucket)).await?;
        Ok(())
    }

    /// Remove staging files left by writers that never committed or aborted
    /// (process crash, panic). Returns how many were removed.
    pub async fn sweep_staging(&self, bucket: &str) -> StorageResult<usize> {
        let staging = self.staging_root(bucket);
        let mut entries = match fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(_) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "failed to remove staging file {}: {}",
                    entry.path().display(),
                    err
                ),
            }
        }
        Ok(removed)
    }

    /// Open a writer for `bucket/key`. Nothing is visible at the key until
    /// [`ObjectWriter::commit`] returns successfully.
    pub async fn open_writer(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        access_policy: &AccessPolicy,
    ) -> StorageResult<ObjectWriter> {
        self.ensure_key_valid(key)?;
        Self::ensure_bucket_name_safe(bucket)?;

        let staging = self.staging_root(bucket);
        fs::create_dir_all(&staging).await?;
        let tmp_path = staging.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;

        Ok(ObjectWriter {
            file,
            digest: md5::Context::new(),
            size_bytes: 0,
            tmp_path: Some(tmp_path),
            final_path: self.object_path(bucket, key),
            db: self.db.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            acl: access_policy.to_column(),
        })
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT bucket, key, content_type, acl, size_bytes, etag, created_at
             FROM objects
             WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(StoredObject, File)> {
        self.ensure_key_valid(key)?;
        let object = self.fetch_object(bucket, key).await?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.ensure_key_valid(key)?;
        self.fetch_object(bucket, key).await
    }
}

/// Writable handle for one object.
///
/// Tracks size and MD5 as bytes pass through. Dropping it without calling
/// [`commit`](Self::commit) discards the staged bytes.
pub struct ObjectWriter {
    file: File,
    digest: md5::Context,
    size_bytes: u64,
    tmp_path: Option<PathBuf>,
    final_path: PathBuf,
    db: Arc<SqlitePool>,
    bucket: String,
    key: String,
    content_type: String,
    acl: String,
}

impl ObjectWriter {
    /// Make the object visible: fsync, move into place, upsert metadata.
    ///
    /// Concurrent commits to the same key resolve as last-writer-wins.
    pub async fn commit(mut self) -> StorageResult<StoredObject> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let tmp_path = self.tmp_path.clone().ok_or_else(|| {
            StorageError::Io(io::Error::other("object writer already finalized"))
        })?;
        let parent = self
            .final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        fs::rename(&tmp_path, &self.final_path).await?;
        self.tmp_path = None;

        let insert_result = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (
                bucket, key, content_type, acl, size_bytes, etag, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                acl = excluded.acl,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                created_at = excluded.created_at
            RETURNING bucket, key, content_type, acl, size_bytes, etag, created_at
            "#,
        )
        .bind(&self.bucket)
        .bind(&self.key)
        .bind(&self.content_type)
        .bind(&self.acl)
        .bind(self.size_bytes as i64)
        .bind(format!("{:x}", self.digest.clone().compute()))
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&self.final_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Discard everything written so far.
    pub async fn abort(mut self) {
        if let Some(path) = self.tmp_path.take() {
            match fs::remove_file(&path).await {
                Ok(_) => debug!(
                    key = %self.key,
                    bytes = self.size_bytes,
                    "discarded staged upload {}",
                    path.display()
                ),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("failed to discard {}: {}", path.display(), err),
            }
        }
    }
}

impl Drop for ObjectWriter {
    /// Fallback for writers dropped mid-upload (a cancelled request). This
    /// is a blocking unlink on the runtime thread; the normal failure path
    /// goes through the async [`abort`](ObjectWriter::abort).
    fn drop(&mut self) {
        if let Some(path) = self.tmp_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to discard {}: {}", path.display(), err);
                }
            }
        }
    }
}

impl AsyncWrite for ObjectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.digest.consume(&buf[..n]);
                this.size_bytes += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}
