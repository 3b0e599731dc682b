use crate::error::AppError;
use crate::market::clock::RemoteRoundSnapshot;
use crate::market::types::Bar;
use futures_util::future::BoxFuture;

/// Authoritative round timing. Implementations may return a partial snapshot;
/// missing pieces are filled in by the window calculator.
pub trait RoundSource: Send + Sync {
    fn current_round<'a>(
        &'a self,
        asset: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRoundSnapshot, AppError>>;
}

pub trait CandleSource: Send + Sync {
    /// Up to `limit` of the most recent bars, oldest first. The last one may still
    /// be in progress.
    fn historical<'a>(
        &'a self,
        asset: &'a str,
        limit: u16,
    ) -> BoxFuture<'a, Result<Vec<Bar>, AppError>>;

    /// The in-progress bar, or `None` when the source has nothing for this asset.
    fn current<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, Result<Option<Bar>, AppError>>;
}
