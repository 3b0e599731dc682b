use crate::error::AppError;
use crate::market::clock::{now_unix_ms, TimerState};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

pub const TIMER_SCOPE: &str = "clock";
pub const TIMER_KEY: &str = "market-timer";

/// Scoped key-value storage that survives process restarts. A missing entry is
/// `Ok(None)`, not an error.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AppError>>;

    fn put<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<(), AppError>>;
}

#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AppError>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT value FROM kv_entries WHERE scope = ? AND key = ?")
                .bind(scope)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => Ok(Some(row.try_get("value")?)),
                None => Ok(None),
            }
        })
    }

    fn put<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO kv_entries (scope, key, value, updated_at_ms) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(scope, key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            )
            .bind(scope)
            .bind(key)
            .bind(value)
            .bind(now_unix_ms())
            .execute(&self.pool)
            .await?;

            Ok(())
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, AppError>> {
        let value = self
            .entries
            .lock()
            .get(&(scope.to_string(), key.to_string()))
            .cloned();
        Box::pin(async move { Ok(value) })
    }

    fn put<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        self.entries
            .lock()
            .insert((scope.to_string(), key.to_string()), value);
        Box::pin(async { Ok(()) })
    }
}

/// Reads the persisted timer. Undecodable snapshots are dropped with a warning so
/// startup falls back to the window calculator.
pub async fn load_timer_state(store: &dyn KeyValueStore) -> Result<Option<TimerState>, AppError> {
    let Some(raw) = store.get(TIMER_SCOPE, TIMER_KEY).await? else {
        return Ok(None);
    };

    let mut bytes = raw.into_bytes();
    match simd_json::serde::from_slice::<TimerState>(bytes.as_mut_slice()) {
        Ok(state) => Ok(Some(state)),
        Err(error) => {
            tracing::warn!(%error, "discarding undecodable timer snapshot");
            Ok(None)
        }
    }
}

pub async fn save_timer_state(store: &dyn KeyValueStore, state: &TimerState) -> Result<(), AppError> {
    let encoded = simd_json::serde::to_string(state)?;
    store.put(TIMER_SCOPE, TIMER_KEY, encoded).await
}
