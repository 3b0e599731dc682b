use crate::market::session::DashboardSession;
use sqlx::SqlitePool;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub session: Mutex<Option<DashboardSession>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            session: Mutex::new(None),
        }
    }

    pub async fn current_session(&self) -> Option<DashboardSession> {
        self.session.lock().await.clone()
    }
}
