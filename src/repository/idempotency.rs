//! Idempotency key repository
//!
//! Single-use request keys with cached responses. A key is bound to the
//! SHA-256 hash of its first request for the TTL; reuse with a different
//! hash fails fast, reuse with the same hash replays the cached response
//! byte-identically.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};

use crate::observability::Metrics;

use super::{timed, RepositoryError};

/// Compute the canonical SHA-256 hex hash of a request.
///
/// The request is serialized through `serde_json::Value`, whose object maps
/// iterate in sorted key order, so the hash is independent of field
/// declaration or map iteration order.
pub fn compute_request_hash<T: Serialize>(request: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(request)?;
    let canonical = serde_json::to_string(&value)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Clone)]
pub struct IdempotencyRepository {
    pool: PgPool,
    metrics: Arc<Metrics>,
}

impl IdempotencyRepository {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self { pool, metrics }
    }

    /// Look up a key. Expired rows are treated as absent.
    ///
    /// Returns `Ok(Some(response))` on a hit with matching hash,
    /// `Ok(None)` when no live record exists, and `IdempotencyMismatch`
    /// when the key is bound to a different request.
    pub async fn check(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>, RepositoryError> {
        let row: Option<(String, Option<serde_json::Value>)> =
            timed(&self.metrics, "check_idempotency", async {
                sqlx::query_as(
                    r#"
                    SELECT request_hash, response_data
                    FROM idempotency_keys
                    WHERE idempotency_key = $1 AND expires_at > NOW()
                    "#,
                )
                .bind(key)
                .fetch_optional(&self.pool)
                .await
            })
            .await?;

        match row {
            None => {
                tracing::debug!(key, "idempotency key not found");
                Ok(None)
            }
            Some((stored_hash, _)) if stored_hash != request_hash => {
                tracing::warn!(key, "idempotency key hash mismatch");
                Err(RepositoryError::IdempotencyMismatch)
            }
            Some((_, response_data)) => {
                tracing::debug!(key, "idempotency key found and validated");
                Ok(Some(response_data.unwrap_or(serde_json::Value::Null)))
            }
        }
    }

    /// Upsert the key with its canonical serialized response inside the
    /// caller's transaction.
    pub async fn store_in_transaction<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        request_hash: &str,
        response: &T,
        ttl: Duration,
    ) -> Result<(), RepositoryError> {
        let response_json = serde_json::to_value(response)?;
        let now = Utc::now();
        let expires_at = now + ttl;

        timed(&self.metrics, "store_idempotency", async {
            sqlx::query(
                r#"
                INSERT INTO idempotency_keys (idempotency_key, request_hash, response_data, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (idempotency_key) DO UPDATE
                SET request_hash = EXCLUDED.request_hash,
                    response_data = EXCLUDED.response_data,
                    expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(key)
            .bind(request_hash)
            .bind(&response_json)
            .bind(now)
            .bind(expires_at)
            .execute(&mut **tx)
            .await
        })
        .await?;

        tracing::debug!(key, ttl_secs = ttl.num_seconds(), "idempotency key stored");
        Ok(())
    }

    /// Delete expired rows; returns the number deleted
    pub async fn cleanup_expired(&self) -> Result<u64, RepositoryError> {
        let result = timed(&self.metrics, "cleanup_idempotency", async {
            sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < NOW()")
                .execute(&self.pool)
                .await
        })
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up expired idempotency keys");
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct SampleRequest {
        user_id: String,
        amount: String,
        tags: HashMap<String, String>,
    }

    #[test]
    fn test_hash_is_deterministic() {
        let mut tags = HashMap::new();
        tags.insert("b".to_string(), "2".to_string());
        tags.insert("a".to_string(), "1".to_string());

        let req = SampleRequest {
            user_id: "u1".to_string(),
            amount: "10".to_string(),
            tags,
        };

        let h1 = compute_request_hash(&req).unwrap();
        let h2 = compute_request_hash(&req).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_hash_changes_with_request() {
        let req1 = SampleRequest {
            user_id: "u1".to_string(),
            amount: "10".to_string(),
            tags: HashMap::new(),
        };
        let req2 = SampleRequest {
            user_id: "u1".to_string(),
            amount: "11".to_string(),
            tags: HashMap::new(),
        };

        assert_ne!(
            compute_request_hash(&req1).unwrap(),
            compute_request_hash(&req2).unwrap()
        );
    }

    #[test]
    fn test_hash_ignores_map_insertion_order() {
        let mut tags_ab = HashMap::new();
        tags_ab.insert("a".to_string(), "1".to_string());
        tags_ab.insert("b".to_string(), "2".to_string());

        let mut tags_ba = HashMap::new();
        tags_ba.insert("b".to_string(), "2".to_string());
        tags_ba.insert("a".to_string(), "1".to_string());

        let req_ab = SampleRequest {
            user_id: "u1".to_string(),
            amount: "10".to_string(),
            tags: tags_ab,
        };
        let req_ba = SampleRequest {
            user_id: "u1".to_string(),
            amount: "10".to_string(),
            tags: tags_ba,
        };

        assert_eq!(
            compute_request_hash(&req_ab).unwrap(),
            compute_request_hash(&req_ba).unwrap()
        );
    }
}
