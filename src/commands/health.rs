use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub session_running: bool,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    session_running: bool,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(error) => {
            tracing::warn!(%error, "database health check failed");
            "error"
        }
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        session_running,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let session_running = state
        .current_session()
        .await
        .is_some_and(|session| session.is_running());
    Ok(build_health_response(state.started_at, &state.db_pool, session_running).await)
}
