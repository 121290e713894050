use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

/// Convenient result alias used across the crate.
pub type Result<T> = std::result::Result<T, PersistitError>;

/// Error taxonomy for the storage engine.
///
/// Corruption-class errors are fatal for the affected operation; the
/// resource-exhaustion kinds (`VolumeFull`, `BufferUnavailable`, `InUse`,
/// `Timeout`) are locally recoverable via bounded retry.
#[derive(Debug, Error)]
pub enum PersistitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corrupt(String),
    #[error("corrupt journal in {file} at address {address}: {detail}")]
    CorruptJournal {
        file: String,
        address: u64,
        detail: String,
    },
    #[error("volume {0} is full")]
    VolumeFull(String),
    #[error("no buffer available")]
    BufferUnavailable,
    #[error("resource in use: {0}")]
    InUse(&'static str),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("volume {0} is read-only")]
    ReadOnlyVolume(String),
    #[error("volume {0} is closed")]
    VolumeClosed(String),
    #[error("tree {0} not found")]
    TreeNotFound(String),
    #[error("volume {0} already exists")]
    VolumeAlreadyExists(String),
    #[error("invalid volume specification: {0}")]
    InvalidVolumeSpecification(String),
    #[error("under-specified volume: {0}")]
    UnderSpecifiedVolume(String),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("page full")]
    PageFull,
    #[error("invalid key filter at character {0}")]
    InvalidKeyFilter(usize),
    #[error("transaction rolled back")]
    Rollback,
}

impl PersistitError {
    /// Returns `true` for the locally recoverable, retry-worthy kinds.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistitError::InUse(_)
                | PersistitError::Timeout(_)
                | PersistitError::BufferUnavailable
        )
    }
}

/// Outcome of a single claim-acquisition attempt.
///
/// Contention is a value, never an unwinding exception; callers drive a
/// bounded retry loop via [`retry_with_deadline`].
pub enum Acquired<T> {
    Ok(T),
    Retry,
}

/// Runs `attempt` until it yields `Acquired::Ok`, an error, or the deadline
/// passes. Backoff doubles from 1ms up to 50ms between attempts.
pub fn retry_with_deadline<T, F>(deadline: Instant, what: &'static str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<Acquired<T>>,
{
    let mut backoff = Duration::from_millis(1);
    loop {
        match attempt()? {
            Acquired::Ok(value) => return Ok(value),
            Acquired::Retry => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(what, "claim retry deadline expired");
                    return Err(PersistitError::InUse(what));
                }
                let remaining = deadline - now;
                std::thread::sleep(backoff.min(remaining));
                backoff = (backoff * 2).min(Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_succeeds_after_contention() -> Result<()> {
        let mut attempts = 0;
        let value = retry_with_deadline(Instant::now() + Duration::from_secs(5), "test", || {
            attempts += 1;
            if attempts < 3 {
                Ok(Acquired::Retry)
            } else {
                Ok(Acquired::Ok(attempts))
            }
        })?;
        assert_eq!(value, 3);
        Ok(())
    }

    #[test]
    fn retry_respects_deadline() {
        let result: Result<()> =
            retry_with_deadline(Instant::now(), "deadline", || Ok(Acquired::Retry));
        match result {
            Err(PersistitError::InUse("deadline")) => {}
            other => panic!("expected InUse error, got {other:?}"),
        }
    }
}
