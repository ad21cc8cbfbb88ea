//! Represents an object (file) committed to a bucket, plus the key and ACL
//! types it is addressed and shared by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Principal matching every caller, authenticated or not.
pub const ALL_USERS: &str = "allUsers";

/// Permission allowing the object payload to be read.
pub const ROLE_READER: &str = "READER";

/// Key under which an object is stored: `{random prefix}_{caller suffix}`.
///
/// The suffix is whatever the uploader sent; it is never sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub(crate) fn new(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single `(principal, permission)` grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub entity: String,
    pub role: String,
}

/// Grants attached to an object when it is created.
///
/// Stored in SQLite as `entity:role` pairs joined with `,`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub rules: Vec<AclRule>,
}

impl AccessPolicy {
    /// Readable by anyone holding the key or a signed URL.
    pub fn public_read() -> Self {
        Self {
            rules: vec![AclRule {
                entity: ALL_USERS.into(),
                role: ROLE_READER.into(),
            }],
        }
    }

    /// No grants beyond what the store gives the owner.
    pub fn private() -> Self {
        Self::default()
    }

    pub fn is_public_read(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.entity == ALL_USERS && rule.role == ROLE_READER)
    }

    pub fn to_column(&self) -> String {
        self.rules
            .iter()
            .map(|rule| format!("{}:{}", rule.entity, rule.role))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_column(value: &str) -> Self {
        let rules = value
            .split(',')
            .filter(|part| !part.is_empty())
            .filter_map(|part| {
                let (entity, role) = part.split_once(':')?;
                Some(AclRule {
                    entity: entity.to_string(),
                    role: role.to_string(),
                })
            })
            .collect();
        Self { rules }
    }
}

/// Metadata row for a committed object.
///
/// Rows are only ever inserted by a successful commit, so a row existing
/// means the payload on disk is complete.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Bucket the object lives in.
    pub bucket: String,

    /// Object key within the bucket.
    pub key: String,

    /// Content type (MIME type) recorded at upload.
    pub content_type: String,

    /// Serialized [`AccessPolicy`].
    pub acl: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// When the object was committed.
    pub created_at: DateTime<Utc>,
}

impl StoredObject {
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::from_column(&self.acl)
    }
}
