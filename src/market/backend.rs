use crate::error::AppError;
use crate::market::clock::RemoteRoundSnapshot;
use crate::market::sources::{CandleSource, RoundSource};
use crate::market::types::{Bar, CandleWire, WireInstant, DEFAULT_ASSET};
use futures_util::future::BoxFuture;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP client for the dashboard backend (`/market/active`, `/oracle/{asset}`).
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url)
            .map_err(|error| AppError::InvalidArgument(format!("invalid backend url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::InvalidArgument(
                "backend url cannot carry path segments".to_string(),
            ));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn active_markets_endpoint(&self) -> Url {
        self.endpoint(&["market", "active"])
    }

    fn current_candle_endpoint(&self, asset: &str) -> Url {
        self.endpoint(&["oracle", asset])
    }

    fn historical_candles_endpoint(&self, asset: &str, limit: u16) -> Url {
        let mut url = self.endpoint(&["oracle", asset, "historical"]);
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        url
    }

    pub async fn fetch_active_round(&self, asset: &str) -> Result<RemoteRoundSnapshot, AppError> {
        let endpoint = self.active_markets_endpoint();
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<ActiveMarketsWire>().await?;
        round_from_markets(payload, asset)
    }

    pub async fn fetch_historical(&self, asset: &str, limit: u16) -> Result<Vec<Bar>, AppError> {
        let endpoint = self.historical_candles_endpoint(asset, limit);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<HistoricalCandlesWire>().await?;
        bars_from_history(payload)
    }

    pub async fn fetch_current(&self, asset: &str) -> Result<Option<Bar>, AppError> {
        let endpoint = self.current_candle_endpoint(asset);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<CurrentCandleWire>().await?;
        bar_from_current(payload)
    }
}

impl RoundSource for BackendClient {
    fn current_round<'a>(
        &'a self,
        asset: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRoundSnapshot, AppError>> {
        Box::pin(self.fetch_active_round(asset))
    }
}

impl CandleSource for BackendClient {
    fn historical<'a>(
        &'a self,
        asset: &'a str,
        limit: u16,
    ) -> BoxFuture<'a, Result<Vec<Bar>, AppError>> {
        Box::pin(self.fetch_historical(asset, limit))
    }

    fn current<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, Result<Option<Bar>, AppError>> {
        Box::pin(self.fetch_current(asset))
    }
}

#[derive(Debug, Deserialize)]
struct MarketWire {
    asset: Option<String>,
    start_time: Option<WireInstant>,
    end_time: Option<WireInstant>,
    now: Option<WireInstant>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActiveMarketsWire {
    Many(Vec<MarketWire>),
    One(MarketWire),
}

#[derive(Debug, Deserialize)]
struct HistoricalCandlesWire {
    #[serde(default)]
    candles: Vec<CandleWire>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentCandleWire {
    #[serde(flatten)]
    candle: CandleWire,
    error: Option<String>,
}

fn instant_ms(value: Option<&WireInstant>) -> Result<Option<i64>, AppError> {
    value.map(WireInstant::to_epoch_ms).transpose()
}

/// Prefers the tracked asset, then the default asset, then whatever is listed
/// first. An empty listing yields an empty snapshot.
fn round_from_markets(payload: ActiveMarketsWire, asset: &str) -> Result<RemoteRoundSnapshot, AppError> {
    let markets = match payload {
        ActiveMarketsWire::One(market) => {
            if let Some(error) = market.error {
                return Err(AppError::RemoteUnavailable(error));
            }
            vec![market]
        }
        ActiveMarketsWire::Many(markets) => markets,
    };

    let position = markets
        .iter()
        .position(|market| market.asset.as_deref() == Some(asset))
        .or_else(|| {
            markets
                .iter()
                .position(|market| market.asset.as_deref() == Some(DEFAULT_ASSET))
        })
        .or(if markets.is_empty() { None } else { Some(0) });

    let Some(market) = position.and_then(|index| markets.into_iter().nth(index)) else {
        tracing::debug!(asset, "backend lists no active market");
        return Ok(RemoteRoundSnapshot::default());
    };

    Ok(RemoteRoundSnapshot {
        start_ms: instant_ms(market.start_time.as_ref())?,
        end_ms: instant_ms(market.end_time.as_ref())?,
        now_ms: instant_ms(market.now.as_ref())?,
    })
}

fn bars_from_history(payload: HistoricalCandlesWire) -> Result<Vec<Bar>, AppError> {
    if let Some(error) = payload.error {
        return Err(AppError::RemoteUnavailable(error));
    }

    let mut bars = payload
        .candles
        .into_iter()
        .map(Bar::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    bars.sort_unstable_by_key(|bar| bar.start_ms);
    Ok(bars)
}

fn bar_from_current(payload: CurrentCandleWire) -> Result<Option<Bar>, AppError> {
    if let Some(error) = payload.error {
        tracing::debug!(%error, "backend has no current bar");
        return Ok(None);
    }
    payload.candle.try_into().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BackendClient {
        BackendClient::new("http://127.0.0.1:3000/api").expect("valid base url")
    }

    #[test]
    fn endpoints_extend_base_path() {
        let client = client();
        assert_eq!(
            client.active_markets_endpoint().as_str(),
            "http://127.0.0.1:3000/api/market/active"
        );
        assert_eq!(
            client.historical_candles_endpoint("ETH/USDT", 200).as_str(),
            "http://127.0.0.1:3000/api/oracle/ETH%2FUSDT/historical?limit=200"
        );
        assert_eq!(
            client.current_candle_endpoint("BTC").as_str(),
            "http://127.0.0.1:3000/api/oracle/BTC"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(matches!(
            BackendClient::new("not a url"),
            Err(AppError::InvalidArgument(_))
        ));
    }

    fn markets(json: &str) -> ActiveMarketsWire {
        let mut bytes = json.as_bytes().to_vec();
        simd_json::serde::from_slice(bytes.as_mut_slice()).expect("fixture should decode")
    }

    #[test]
    fn picks_tracked_asset_market() {
        let payload = markets(
            r#"[
                {"asset":"BTC/USDT","start_time":"1970-01-01T00:00:00Z","end_time":"1970-01-01T04:00:00Z"},
                {"asset":"ETH/USDT","start_time":"1970-01-01T04:00:00Z","end_time":"1970-01-01T08:00:00Z"}
            ]"#,
        );

        let snapshot = round_from_markets(payload, "ETH/USDT").expect("market should parse");
        assert_eq!(snapshot.start_ms, Some(14_400_000));
        assert_eq!(snapshot.end_ms, Some(28_800_000));
        assert_eq!(snapshot.now_ms, None);
    }

    #[test]
    fn falls_back_to_default_then_first_market() {
        let payload = markets(
            r#"[
                {"asset":"SOL/USDT","start_time":0,"end_time":14400000},
                {"asset":"BTC/USDT","start_time":14400000,"end_time":28800000}
            ]"#,
        );
        let snapshot = round_from_markets(payload, "DOGE/USDT").expect("market should parse");
        assert_eq!(snapshot.start_ms, Some(14_400_000));

        let payload = markets(r#"[{"asset":"SOL/USDT","end_time":14400000}]"#);
        let snapshot = round_from_markets(payload, "DOGE/USDT").expect("market should parse");
        assert_eq!(snapshot.start_ms, None);
        assert_eq!(snapshot.end_ms, Some(14_400_000));
    }

    #[test]
    fn empty_listing_is_an_empty_snapshot() {
        let snapshot = round_from_markets(markets("[]"), "BTC/USDT").expect("empty list is valid");
        assert_eq!(snapshot, RemoteRoundSnapshot::default());
    }

    #[test]
    fn error_object_is_remote_unavailable() {
        let result = round_from_markets(markets(r#"{"error":"db down"}"#), "BTC/USDT");
        assert!(matches!(result, Err(AppError::RemoteUnavailable(message)) if message == "db down"));
    }

    #[test]
    fn history_converts_seconds_and_sorts() {
        let mut bytes = br#"{"candles":[
            {"timestamp":14400,"open":2.0,"high":3.0,"low":1.0,"close":2.5},
            {"timestamp":0,"open":1.0,"high":2.0,"low":0.5,"close":2.0}
        ]}"#
        .to_vec();
        let payload: HistoricalCandlesWire =
            simd_json::serde::from_slice(bytes.as_mut_slice()).expect("fixture should decode");

        let bars = bars_from_history(payload).expect("history should convert");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].start_ms, 0);
        assert_eq!(bars[1].start_ms, 14_400_000);
    }

    #[test]
    fn history_with_incomplete_candle_is_malformed() {
        let mut bytes = br#"{"candles":[{"timestamp":0,"open":1.0,"high":2.0,"close":2.0}]}"#.to_vec();
        let payload: HistoricalCandlesWire =
            simd_json::serde::from_slice(bytes.as_mut_slice()).expect("fixture should decode");

        assert!(matches!(
            bars_from_history(payload),
            Err(AppError::MalformedCandle(_))
        ));
    }

    #[test]
    fn current_bar_error_means_no_bar() {
        let mut bytes = br#"{"error":"All oracle sources failed"}"#.to_vec();
        let payload: CurrentCandleWire =
            simd_json::serde::from_slice(bytes.as_mut_slice()).expect("fixture should decode");
        assert_eq!(bar_from_current(payload).expect("error payload is not fatal"), None);

        let mut bytes =
            br#"{"symbol":"BTC","timestamp":14400,"open":1.0,"high":2.0,"low":0.5,"close":1.5}"#
                .to_vec();
        let payload: CurrentCandleWire =
            simd_json::serde::from_slice(bytes.as_mut_slice()).expect("fixture should decode");
        let bar = bar_from_current(payload)
            .expect("bar should convert")
            .expect("bar should be present");
        assert_eq!(bar.start_ms, 14_400_000);
        assert_eq!(bar.close, 1.5);
    }
}
