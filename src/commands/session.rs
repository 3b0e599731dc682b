use crate::error::AppError;
use crate::market::gate::AuthorizedStake;
use crate::market::persistence::SqliteKeyValueStore;
use crate::market::session::{DashboardSession, SessionDeps};
use crate::market::types::{DashboardView, SessionArgs, SessionConfig, SourceKind, StakeIntent};
use crate::state::AppState;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub asset: String,
    pub source: SourceKind,
    pub round_length_ms: i64,
    pub live_stream: bool,
}

impl SessionStarted {
    fn from_config(config: &SessionConfig) -> Self {
        Self {
            asset: config.asset.clone(),
            source: config.source,
            round_length_ms: config.clock.round_length_ms,
            live_stream: config.live_stream,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStopped {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSwitched {
    pub asset: String,
    pub changed: bool,
}

/// Starts a session against the configured remote sources, replacing any
/// session that is already running.
pub async fn start_session(
    state: &AppState,
    args: Option<SessionArgs>,
) -> Result<SessionStarted, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let store = Arc::new(SqliteKeyValueStore::new(state.db_pool.clone()));
    let deps = SessionDeps::for_config(&config, store)?;
    start_session_with(state, config, deps).await
}

pub async fn start_session_with(
    state: &AppState,
    config: SessionConfig,
    deps: SessionDeps,
) -> Result<SessionStarted, AppError> {
    let mut slot = state.session.lock().await;
    if let Some(existing) = slot.take() {
        existing.stop().await;
    }

    let started = SessionStarted::from_config(&config);
    *slot = Some(DashboardSession::start(config, deps).await?);
    Ok(started)
}

pub async fn stop_session(state: &AppState) -> Result<SessionStopped, AppError> {
    let existing = state.session.lock().await.take();
    let stopped = match existing {
        Some(session) => {
            session.stop().await;
            true
        }
        None => false,
    };
    Ok(SessionStopped { stopped })
}

async fn running_session(state: &AppState) -> Result<DashboardSession, AppError> {
    state
        .current_session()
        .await
        .ok_or(AppError::SessionNotRunning)
}

pub async fn switch_asset(state: &AppState, asset: String) -> Result<AssetSwitched, AppError> {
    let session = running_session(state).await?;
    let changed = session.switch_asset(&asset)?;
    Ok(AssetSwitched {
        asset: session.asset(),
        changed,
    })
}

pub async fn session_view(state: &AppState) -> Result<DashboardView, AppError> {
    Ok(running_session(state).await?.view())
}

pub async fn subscribe_view(state: &AppState) -> Result<watch::Receiver<DashboardView>, AppError> {
    Ok(running_session(state).await?.subscribe())
}

pub async fn place_stake(
    state: &AppState,
    intent: StakeIntent,
) -> Result<AuthorizedStake, AppError> {
    running_session(state).await?.authorize_stake(intent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::initialize_memory_pool;
    use crate::market::clock::{ManualWallClock, RemoteRoundSnapshot};
    use crate::market::gate::GateState;
    use crate::market::persistence::MemoryKeyValueStore;
    use crate::market::sources::fakes::{FakeCandleSource, FakeRoundSource};
    use crate::market::types::{StakeSide, ROUND_LENGTH_MS};
    use std::time::Duration;

    const NOW: i64 = 5 * ROUND_LENGTH_MS + 60_000;

    async fn app_state() -> AppState {
        AppState::new(
            initialize_memory_pool()
                .await
                .expect("in-memory pool should initialize"),
        )
    }

    fn fake_deps() -> SessionDeps {
        SessionDeps {
            round_source: Arc::new(FakeRoundSource::answering(RemoteRoundSnapshot {
                start_ms: Some(5 * ROUND_LENGTH_MS),
                end_ms: Some(6 * ROUND_LENGTH_MS),
                now_ms: None,
            })),
            candle_source: Arc::new(FakeCandleSource::default()),
            store: Arc::new(MemoryKeyValueStore::default()),
            wall_clock: Arc::new(ManualWallClock::new(NOW)),
            live_bars: None,
        }
    }

    fn config() -> SessionConfig {
        SessionArgs::default()
            .normalize()
            .expect("defaults should be valid")
    }

    #[tokio::test]
    async fn commands_require_a_running_session() {
        let state = app_state().await;

        assert!(matches!(
            session_view(&state).await,
            Err(AppError::SessionNotRunning)
        ));
        assert!(matches!(
            switch_asset(&state, "ETH/USDT".to_string()).await,
            Err(AppError::SessionNotRunning)
        ));
        let stopped = stop_session(&state).await.expect("stop never fails");
        assert!(!stopped.stopped);
    }

    #[tokio::test]
    async fn session_lifecycle_through_commands() {
        let state = app_state().await;
        let started = start_session_with(&state, config(), fake_deps())
            .await
            .expect("session should start");
        assert_eq!(started.asset, "BTC/USDT");
        assert_eq!(started.round_length_ms, ROUND_LENGTH_MS);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let view = session_view(&state).await.expect("session is running");
        assert_eq!(view.gate, GateState::Open);
        assert_eq!(view.time_left_ms, ROUND_LENGTH_MS - 60_000);

        let stake = place_stake(
            &state,
            StakeIntent {
                asset: "btc/usdt".to_string(),
                side: StakeSide::Green,
                amount: 10.0,
            },
        )
        .await
        .expect("open round should accept the stake");
        assert_eq!(stake.round_end_ms, 6 * ROUND_LENGTH_MS);

        let switched = switch_asset(&state, "sol/usdt".to_string())
            .await
            .expect("switch should succeed");
        assert_eq!(switched.asset, "SOL/USDT");
        assert!(switched.changed);

        let stopped = stop_session(&state).await.expect("stop never fails");
        assert!(stopped.stopped);
        assert!(state.current_session().await.is_none());
    }

    #[tokio::test]
    async fn starting_again_replaces_the_running_session() {
        let state = app_state().await;
        start_session_with(&state, config(), fake_deps())
            .await
            .expect("first session should start");
        let first = state.current_session().await.expect("first session stored");

        start_session_with(&state, config(), fake_deps())
            .await
            .expect("second session should start");
        assert!(!first.is_running());
        assert!(state
            .current_session()
            .await
            .is_some_and(|session| session.is_running()));

        stop_session(&state).await.expect("stop never fails");
    }
}
