//! Advisory locks for preventing concurrent work on the same resource.
//!
//! Cooperative, database-scoped exclusion for non-transactional work, e.g.
//! installer blueprints gating `install:{env}:{pack_ref}` so duplicate schema
//! creation never starts, even when several runs are queued or retried.
//!
//! Postgres advisory locks are session-scoped, so a `LockSession` pins one
//! pool connection and issues lock and unlock on that same connection.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};

use crate::error::EngineError;

/// Convert a string key to a signed 64-bit advisory lock id.
///
/// Takes the first 8 bytes of SHA-256; values >= 2^63 map to negative by
/// two's complement (subtract 2^64), which is what the `as i64` cast does.
pub fn hash_lock_key(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as i64
}

/// Acquisition mode for `with_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Try once; raise `LockUnavailable` when another session holds the lock.
    FailFast,
    /// Block until the lock becomes available.
    Blocking,
}

/// One database session holding advisory locks.
pub struct LockSession {
    conn: PoolConnection<Postgres>,
}

impl LockSession {
    pub async fn open(pool: &PgPool) -> Result<Self> {
        Ok(Self {
            conn: pool.acquire().await?,
        })
    }

    /// Attempt to acquire an advisory lock (non-blocking).
    ///
    /// Returns `true` if acquired, `false` if held by another session.
    pub async fn try_lock(&mut self, key: &str) -> Result<bool> {
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(hash_lock_key(key))
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(acquired)
    }

    /// Acquire an advisory lock, waiting until it is available.
    pub async fn lock(&mut self, key: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(hash_lock_key(key))
            .execute(&mut *self.conn)
            .await?;

        Ok(())
    }

    /// Release an advisory lock.
    ///
    /// Returns `true` if the lock was held by this session and released.
    pub async fn unlock(&mut self, key: &str) -> Result<bool> {
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(hash_lock_key(key))
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(released)
    }

    /// Close the underlying connection instead of returning it to the pool.
    ///
    /// A session whose unlock failed still holds its locks until the backend
    /// session ends; handing that connection back to the pool would leak a
    /// held lock into unrelated future work.
    async fn close(self) {
        if let Err(e) = self.conn.detach().close().await {
            tracing::warn!(error = %e, "failed to close advisory lock connection");
        }
    }
}

/// Run `body` under an advisory lock, releasing it on all exit paths.
///
/// In `FailFast` mode an unavailable lock raises
/// `EngineError::LockUnavailable` before `body` runs.
pub async fn with_lock<F, Fut, T>(pool: &PgPool, key: &str, mode: LockMode, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut session = LockSession::open(pool).await?;

    match mode {
        LockMode::FailFast => {
            if !session.try_lock(key).await? {
                return Err(EngineError::LockUnavailable {
                    key: key.to_string(),
                }
                .into());
            }
        }
        LockMode::Blocking => session.lock(key).await?,
    }

    let result = body().await;

    if let Err(e) = session.unlock(key).await {
        // The lock is still held on this session; drop the connection so the
        // lock dies with it rather than riding back into the pool.
        tracing::warn!(key, error = %e, "failed to release advisory lock, discarding connection");
        session.close().await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let key = "pack.install:local-dev:core.domain@v1";
        assert_eq!(hash_lock_key(key), hash_lock_key(key));
    }

    #[test]
    fn distinct_keys_hash_differently() {
        assert_ne!(
            hash_lock_key("install:env-a:core.domain@v1"),
            hash_lock_key("install:env-b:core.domain@v1")
        );
    }

    #[test]
    fn high_bit_maps_to_negative() {
        // SHA-256("b") starts with 0x3e, SHA-256("a") with 0xca: one id per
        // sign, pinning the unsigned-to-signed wrap behavior.
        assert!(hash_lock_key("a") < 0);
        assert!(hash_lock_key("b") > 0);
    }
}
