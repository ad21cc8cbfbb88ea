//! Object key generation.
//!
//! Keys are `{base64url(random bytes)}_{suffix}`. Uniqueness rests entirely
//! on the random prefix; no lookup against existing keys is made.

use crate::models::object::ObjectKey;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{
    RngCore, SeedableRng,
    rngs::{OsRng, StdRng},
};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Separator between the random prefix and the caller-supplied suffix.
pub const KEY_SEPARATOR: char = '_';

/// 80 bits of entropy.
pub const DEFAULT_KEY_RANDOM_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum KeyGenError {
    #[error("random byte count must be at least 1")]
    ZeroLength,
    #[error("entropy source unavailable: {0}")]
    Entropy(#[from] rand::Error),
}

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    random_bytes: usize,
    source: EntropySource,
}

#[derive(Debug, Clone)]
enum EntropySource {
    Os,
    /// Shared across clones so two clones never hand out the same key.
    Seeded(Arc<Mutex<StdRng>>),
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_RANDOM_BYTES)
    }
}

impl KeyGenerator {
    pub fn new(random_bytes: usize) -> Self {
        Self {
            random_bytes,
            source: EntropySource::Os,
        }
    }

    /// Reproducible key sequence from `seed`. Not for production traffic:
    /// the keys are predictable by anyone who knows the seed.
    pub fn seeded(random_bytes: usize, seed: u64) -> Self {
        Self {
            random_bytes,
            source: EntropySource::Seeded(Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
        }
    }

    /// Draw fresh entropy and build a key ending in `suffix`.
    pub fn generate(&self, suffix: &str) -> Result<ObjectKey, KeyGenError> {
        match &self.source {
            EntropySource::Os => generate_with(&mut OsRng, self.random_bytes, suffix),
            EntropySource::Seeded(rng) => {
                let mut rng = rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                generate_with(&mut *rng, self.random_bytes, suffix)
            }
        }
    }
}

/// Build a key from `rng`. Failure of the source is returned, never papered
/// over with a weaker generator.
pub fn generate_with<R: RngCore + ?Sized>(
    rng: &mut R,
    random_bytes: usize,
    suffix: &str,
) -> Result<ObjectKey, KeyGenError> {
    if random_bytes == 0 {
        return Err(KeyGenError::ZeroLength);
    }
    let mut buf = vec![0u8; random_bytes];
    rng.try_fill_bytes(&mut buf)?;

    let prefix = URL_SAFE_NO_PAD.encode(&buf);
    let mut key = String::with_capacity(prefix.len() + 1 + suffix.len());
    key.push_str(&prefix);
    key.push(KEY_SEPARATOR);
    key.push_str(suffix);
    Ok(ObjectKey::new(key))
}
