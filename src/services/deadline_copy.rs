//! Streaming copy bounded by an absolute deadline.
//!
//! A per-read timeout does not bound a client that trickles one byte at a
//! time; the deadline here is fixed when the transfer starts and every read
//! and write races against it.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{io, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{Instant, timeout_at},
};

/// Default wall-clock budget for a whole upload.
pub const DEFAULT_TRANSFER_DEADLINE: Duration = Duration::from_secs(28);

/// Absolute cutoff for a transfer. Does not move once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDeadline(Instant);

impl TransferDeadline {
    /// `now + budget`.
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("transfer deadline exceeded after {bytes_copied} bytes")]
    Timeout { bytes_copied: u64 },
    #[error("i/o error after {bytes_copied} bytes: {source}")]
    Io {
        bytes_copied: u64,
        #[source]
        source: io::Error,
    },
}

impl CopyError {
    pub fn bytes_copied(&self) -> u64 {
        match self {
            CopyError::Timeout { bytes_copied } | CopyError::Io { bytes_copied, .. } => {
                *bytes_copied
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CopyError::Timeout { .. })
    }
}

/// Copy every chunk of `source` into `sink` before `deadline`.
///
/// Returns the number of bytes written. The sink is flushed but not
/// finalized; committing is the caller's decision.
pub async fn copy_with_deadline<W, S>(
    sink: &mut W,
    source: S,
    deadline: TransferDeadline,
) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
    S: Stream<Item = io::Result<Bytes>>,
{
    pin_mut!(source);
    let mut bytes_copied: u64 = 0;

    loop {
        if deadline.is_expired() {
            return Err(CopyError::Timeout { bytes_copied });
        }

        let chunk = match timeout_at(deadline.instant(), source.next()).await {
            Err(_) => return Err(CopyError::Timeout { bytes_copied }),
            Ok(None) => break,
            Ok(Some(Err(source))) => {
                return Err(CopyError::Io {
                    bytes_copied,
                    source,
                });
            }
            Ok(Some(Ok(chunk))) => chunk,
        };
        if chunk.is_empty() {
            continue;
        }

        match timeout_at(deadline.instant(), sink.write_all(&chunk)).await {
            Err(_) => return Err(CopyError::Timeout { bytes_copied }),
            Ok(Err(source)) => {
                return Err(CopyError::Io {
                    bytes_copied,
                    source,
                });
            }
            Ok(Ok(())) => bytes_copied += chunk.len() as u64,
        }
    }

    match timeout_at(deadline.instant(), sink.flush()).await {
        Err(_) => Err(CopyError::Timeout { bytes_copied }),
        Ok(Err(source)) => Err(CopyError::Io {
            bytes_copied,
            source,
        }),
        Ok(Ok(())) => Ok(bytes_copied),
    }
}
