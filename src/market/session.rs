use crate::error::AppError;
use crate::market::backend::BackendClient;
use crate::market::binance::{asset_to_symbol, run_kline_stream, BinanceClient};
use crate::market::candles::{BatchOutcome, CandleReconciler, CurrentUpdateOutcome};
use crate::market::clock::{ClockSynchronizer, RehydrateOutcome, SystemWallClock, WallClock};
use crate::market::gate::{AuthorizedStake, GateTransition, RoundGate};
use crate::market::persistence::{load_timer_state, save_timer_state, KeyValueStore};
use crate::market::scheduler::{FirstRun, TaskScheduler};
use crate::market::sources::{CandleSource, RoundSource};
use crate::market::types::{
    normalize_asset, Bar, DashboardView, SessionConfig, SourceKind, StakeIntent,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const LIVE_BAR_CHANNEL_CAPACITY: usize = 64;

/// Everything a session talks to outside its own memory.
#[derive(Clone)]
pub struct SessionDeps {
    pub round_source: Arc<dyn RoundSource>,
    pub candle_source: Arc<dyn CandleSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub wall_clock: Arc<dyn WallClock>,
    pub live_bars: Option<LiveBarFeed>,
}

/// Exchange kline stream used to refresh the in-progress bar between polls.
#[derive(Debug, Clone, Copy)]
pub struct LiveBarFeed {
    pub interval: &'static str,
}

impl SessionDeps {
    pub fn for_config(config: &SessionConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, AppError> {
        let wall_clock: Arc<dyn WallClock> = Arc::new(SystemWallClock);
        match config.source {
            SourceKind::Backend => {
                if config.live_stream {
                    tracing::warn!("live stream requires the binance source, ignoring");
                }
                let backend = Arc::new(BackendClient::new(&config.backend_url)?);
                Ok(Self {
                    round_source: backend.clone(),
                    candle_source: backend,
                    store,
                    wall_clock,
                    live_bars: None,
                })
            }
            SourceKind::Binance => {
                let binance = Arc::new(BinanceClient::new(config.clock.round_length_ms)?);
                let live_bars = config.live_stream.then(|| LiveBarFeed {
                    interval: binance.interval(),
                });
                Ok(Self {
                    round_source: binance.clone(),
                    candle_source: binance,
                    store,
                    wall_clock,
                    live_bars,
                })
            }
        }
    }
}

/// Identifies the asset selection a fetch was issued for. Results carrying an
/// outdated ticket are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub asset: String,
    pub generation: u64,
}

struct EngineState {
    asset: String,
    generation: u64,
    clock: ClockSynchronizer,
    gate: RoundGate,
    candles: CandleReconciler,
}

impl EngineState {
    fn view(&self) -> DashboardView {
        DashboardView {
            time_left_ms: self.clock.time_left_ms(),
            gate: self.gate.state(),
            bars: self.candles.snapshot_vec(),
        }
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        self.generation == ticket.generation && self.asset == ticket.asset
    }
}

struct SessionCore {
    config: SessionConfig,
    deps: SessionDeps,
    engine: Mutex<EngineState>,
    view_tx: watch::Sender<DashboardView>,
    scheduler: TaskScheduler,
    asset_scope: Mutex<CancellationToken>,
}

/// A running dashboard: one tracked asset, its round clock, its bars and the
/// stake gate, kept current by background tasks until [`DashboardSession::stop`].
#[derive(Clone)]
pub struct DashboardSession {
    core: Arc<SessionCore>,
}

impl DashboardSession {
    pub async fn start(config: SessionConfig, deps: SessionDeps) -> Result<Self, AppError> {
        let persisted = match load_timer_state(deps.store.as_ref()).await {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(%error, "failed to read persisted timer, starting fresh");
                None
            }
        };

        let local_now_ms = deps.wall_clock.now_ms();
        let (clock, rehydrated) = ClockSynchronizer::rehydrate(config.clock, persisted, local_now_ms);
        match rehydrated {
            RehydrateOutcome::Resumed => {
                tracing::info!(time_left_ms = clock.time_left_ms(), "resumed persisted round timer")
            }
            RehydrateOutcome::Discarded => tracing::info!("persisted round timer is stale, discarded"),
            RehydrateOutcome::Fresh => tracing::debug!("no persisted round timer"),
        }

        let gate = RoundGate::new(clock.time_left_ms(), clock.aligned_round());
        let engine = EngineState {
            asset: config.asset.clone(),
            generation: 0,
            candles: CandleReconciler::new(clock.round_length_ms()),
            clock,
            gate,
        };
        let (view_tx, _) = watch::channel(engine.view());

        let scheduler = TaskScheduler::new();
        let asset_scope = scheduler.scope();
        let core = Arc::new(SessionCore {
            config,
            deps,
            engine: Mutex::new(engine),
            view_tx,
            scheduler,
            asset_scope: Mutex::new(asset_scope),
        });

        tracing::info!(
            asset = %core.config.asset,
            source = core.config.source.as_str(),
            "starting dashboard session"
        );
        core.start_clock_tasks();
        core.start_asset_tasks();

        Ok(Self { core })
    }

    pub async fn stop(&self) {
        self.core.scheduler.shutdown().await;
        let state = self.core.engine.lock().clock.state();
        if let Err(error) = save_timer_state(self.core.deps.store.as_ref(), &state).await {
            tracing::warn!(%error, "failed to persist round timer on stop");
        }
        tracing::info!("dashboard session stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.core.scheduler.is_shut_down()
    }

    pub fn asset(&self) -> String {
        self.core.engine.lock().asset.clone()
    }

    pub fn view(&self) -> DashboardView {
        self.core.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.core.view_tx.subscribe()
    }

    /// Switches the tracked asset. Bars and in-flight fetches of the previous asset
    /// are discarded; the round clock is kept and resynchronized.
    pub fn switch_asset(&self, asset: &str) -> Result<bool, AppError> {
        let asset = normalize_asset(asset)?;
        {
            let mut engine = self.core.engine.lock();
            if engine.asset == asset {
                return Ok(false);
            }
            tracing::info!(from = %engine.asset, to = %asset, "switching tracked asset");
            engine.asset = asset;
            engine.generation = engine.generation.wrapping_add(1);
            engine.candles.reset();
        }
        self.core.publish();
        self.core.start_asset_tasks();
        self.core.spawn_reconcile("reconcile-on-switch");
        Ok(true)
    }

    pub fn authorize_stake(&self, intent: StakeIntent) -> Result<AuthorizedStake, AppError> {
        let engine = self.core.engine.lock();
        let stake = engine
            .gate
            .authorize(intent, &engine.asset, engine.clock.round())?;
        tracing::info!(
            asset = %stake.asset,
            side = ?stake.side,
            amount = stake.amount,
            round_end_ms = stake.round_end_ms,
            "stake authorized"
        );
        Ok(stake)
    }
}

impl SessionCore {
    fn start_clock_tasks(self: &Arc<Self>) {
        let tick_core = Arc::clone(self);
        self.scheduler.every(
            "clock-tick",
            Duration::from_millis(self.config.tick_interval_ms),
            FirstRun::AfterPeriod,
            self.scheduler.scope(),
            move || {
                tick_core.on_tick();
                std::future::ready(())
            },
        );

        let reconcile_core = Arc::clone(self);
        self.scheduler.every(
            "clock-reconcile",
            Duration::from_millis(self.config.reconcile_interval_ms),
            FirstRun::Immediately,
            self.scheduler.scope(),
            move || {
                let core = Arc::clone(&reconcile_core);
                async move { core.reconcile().await }
            },
        );
    }

    /// Replaces the asset scope, cancelling fetches, polls and streams that belong
    /// to the previous asset.
    fn start_asset_tasks(self: &Arc<Self>) {
        let scope = self.scheduler.scope();
        let previous = std::mem::replace(&mut *self.asset_scope.lock(), scope.clone());
        previous.cancel();

        let ticket = self.ticket();
        self.spawn_history_fetch(ticket.clone(), scope.clone());

        let poll_core = Arc::clone(self);
        let poll_ticket = ticket.clone();
        self.scheduler.every(
            "current-bar-poll",
            Duration::from_millis(self.config.current_bar_poll_ms),
            FirstRun::AfterPeriod,
            scope.clone(),
            move || {
                let core = Arc::clone(&poll_core);
                let ticket = poll_ticket.clone();
                async move { core.poll_current(ticket).await }
            },
        );

        if let Some(feed) = self.deps.live_bars {
            let (sink, mut receiver) = mpsc::channel::<Bar>(LIVE_BAR_CHANNEL_CAPACITY);
            self.scheduler.once(
                "kline-stream",
                scope.clone(),
                run_kline_stream(asset_to_symbol(&ticket.asset), feed.interval, sink, scope.clone()),
            );

            let stream_core = Arc::clone(self);
            self.scheduler.once("kline-consumer", scope, async move {
                while let Some(bar) = receiver.recv().await {
                    stream_core.apply_current(&ticket, bar);
                }
            });
        }
    }

    fn ticket(&self) -> FetchTicket {
        let engine = self.engine.lock();
        FetchTicket {
            asset: engine.asset.clone(),
            generation: engine.generation,
        }
    }

    fn publish(&self) {
        let view = self.engine.lock().view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn spawn_reconcile(self: &Arc<Self>, label: &'static str) {
        let core = Arc::clone(self);
        self.scheduler
            .once(label, self.scheduler.scope(), async move { core.reconcile().await });
    }

    fn spawn_history_fetch(self: &Arc<Self>, ticket: FetchTicket, scope: CancellationToken) {
        let core = Arc::clone(self);
        self.scheduler.once("history-fetch", scope, async move {
            let result = core
                .deps
                .candle_source
                .historical(&ticket.asset, core.config.history_limit)
                .await;
            core.apply_batch(&ticket, result);
        });
    }

    /// Advances the countdown. A locked gate whose round local time has already
    /// left rolls over to the locally computed round instead of waiting for the
    /// next reconciliation.
    fn on_tick(self: &Arc<Self>) {
        let (transition, rolled_over) = {
            let mut engine = self.engine.lock();
            let local_now_ms = self.deps.wall_clock.now_ms();
            let was_locked = !engine.gate.is_open();
            let mut time_left_ms = engine.clock.tick(local_now_ms);
            let mut rolled_over = false;
            if was_locked && engine.clock.has_left_round(local_now_ms) {
                let outcome = engine.clock.fallback(local_now_ms);
                time_left_ms = outcome.time_left_ms;
                rolled_over = outcome.round_changed;
            }
            let round = engine.clock.aligned_round();
            (engine.gate.observe(time_left_ms, round), rolled_over)
        };
        self.publish();

        match transition {
            Some(GateTransition::Locked) => {
                tracing::info!("round ended, stakes locked");
                self.spawn_reconcile("reconcile-on-lock");
            }
            Some(GateTransition::Reopened) => tracing::info!("stakes reopened"),
            None => {}
        }
        if rolled_over {
            tracing::info!("local clock left the locked round, rolling over");
            let scope = self.asset_scope.lock().clone();
            self.spawn_history_fetch(self.ticket(), scope);
            self.spawn_reconcile("reconcile-on-rollover");
        }
    }

    async fn reconcile(self: &Arc<Self>) {
        let asset = self.engine.lock().asset.clone();
        let remote = self.deps.round_source.current_round(&asset).await;

        let (outcome, transition, state) = {
            let mut engine = self.engine.lock();
            let local_now_ms = self.deps.wall_clock.now_ms();
            let outcome = match remote {
                Ok(snapshot) => engine.clock.reconcile(snapshot, local_now_ms),
                Err(error) => {
                    tracing::warn!(%error, "round source unavailable, using local round window");
                    engine.clock.fallback(local_now_ms)
                }
            };
            let round = engine.clock.aligned_round();
            let transition = engine.gate.observe(outcome.time_left_ms, round);
            (outcome, transition, engine.clock.state())
        };

        if let Err(error) = save_timer_state(self.deps.store.as_ref(), &state).await {
            tracing::warn!(%error, "failed to persist round timer");
        }
        self.publish();

        if let Some(transition) = transition {
            tracing::info!(?transition, "gate changed on reconcile");
        }
        if outcome.round_changed {
            tracing::info!(
                start_ms = state.start_time_ms,
                end_ms = state.end_time_ms,
                "round changed, refetching bars"
            );
            let scope = self.asset_scope.lock().clone();
            self.spawn_history_fetch(self.ticket(), scope);
        }
    }

    async fn poll_current(self: &Arc<Self>, ticket: FetchTicket) {
        if !self.engine.lock().gate.is_open() {
            return;
        }
        match self.deps.candle_source.current(&ticket.asset).await {
            Ok(Some(bar)) => {
                self.apply_current(&ticket, bar);
            }
            Ok(None) => tracing::debug!(asset = %ticket.asset, "no current bar available"),
            Err(error) => tracing::warn!(asset = %ticket.asset, %error, "current bar poll failed"),
        }
    }

    fn apply_batch(&self, ticket: &FetchTicket, result: Result<Vec<Bar>, AppError>) -> bool {
        let outcome = {
            let mut engine = self.engine.lock();
            if !engine.is_current(ticket) {
                tracing::debug!(asset = %ticket.asset, "dropping history for a previous selection");
                return false;
            }
            let bars = match result {
                Ok(bars) => bars,
                Err(error) => {
                    tracing::warn!(asset = %ticket.asset, %error, "history fetch failed, keeping bars");
                    return false;
                }
            };
            let now_ms = engine.clock.corrected_now_ms();
            engine.candles.replace_all(bars, &ticket.asset, now_ms)
        };

        match outcome {
            BatchOutcome::Applied {
                historical,
                has_current,
                discarded,
            } => {
                tracing::debug!(asset = %ticket.asset, historical, has_current, discarded, "history applied");
                self.publish();
                true
            }
            BatchOutcome::Malformed { reason } => {
                tracing::warn!(asset = %ticket.asset, %reason, "rejected malformed history");
                self.publish();
                false
            }
        }
    }

    fn apply_current(&self, ticket: &FetchTicket, bar: Bar) -> bool {
        let outcome = {
            let mut engine = self.engine.lock();
            if !engine.is_current(ticket) {
                return false;
            }
            let round = engine.clock.aligned_round();
            engine.candles.apply_current_update(bar, &ticket.asset, round)
        };

        match outcome {
            CurrentUpdateOutcome::Applied => {
                self.publish();
                true
            }
            CurrentUpdateOutcome::Malformed { reason } => {
                tracing::warn!(asset = %ticket.asset, %reason, "rejected malformed current bar");
                false
            }
            other => {
                tracing::debug!(asset = %ticket.asset, outcome = ?other, "current bar ignored");
                false
            }
        }
    }
}
