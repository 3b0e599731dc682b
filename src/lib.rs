pub mod commands;
pub mod db;
pub mod error;
pub mod market;
pub mod state;

use commands::session::{start_session, stop_session, subscribe_view};
use db::initialize_pool;
use error::AppError;
use market::types::SessionArgs;
use state::AppState;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Runs a headless dashboard session configured from the environment until
/// ctrl-c, logging gate changes as they happen.
pub async fn run() -> Result<(), AppError> {
    init_tracing();

    let args = SessionArgs::from_env()?;
    let db_pool = initialize_pool().await?;
    let state = AppState::new(db_pool);

    let started = start_session(&state, Some(args)).await?;
    tracing::info!(
        asset = %started.asset,
        source = started.source.as_str(),
        live_stream = started.live_stream,
        "session running, press ctrl-c to stop"
    );

    let mut views = subscribe_view(&state).await?;
    let mut last_gate = views.borrow().gate;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if view.gate != last_gate {
                    tracing::info!(gate = ?view.gate, time_left_ms = view.time_left_ms, "gate changed");
                    last_gate = view.gate;
                }
                tracing::debug!(
                    time_left_ms = view.time_left_ms,
                    bars = view.bars.len(),
                    "dashboard view updated"
                );
            }
        }
    }

    stop_session(&state).await?;
    state.db_pool.close().await;
    Ok(())
}
