//! Data models for committed objects, their keys and access policies.
//!
//! `StoredObject` maps to the `objects` table via `sqlx::FromRow` and
//! serializes as JSON via `serde`.

pub mod object;
