use crate::error::AppError;
use crate::market::gate::GateState;
use serde::{Deserialize, Serialize};

pub const DAY_MS: i64 = 86_400_000;
pub const ROUND_LENGTH_MS: i64 = 14_400_000;
pub const WINDOW_MISMATCH_TOLERANCE_MS: i64 = 1_000;
pub const REMOTE_TIME_DISTRUST_MS: i64 = 10_000;
pub const DEFAULT_ASSET: &str = "BTC/USDT";
pub const DEFAULT_SOURCE: SourceKind = SourceKind::Backend;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3000/api";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_CURRENT_BAR_POLL_MS: u64 = 10_000;
pub const DEFAULT_HISTORY_LIMIT: u16 = 200;
pub const DEFAULT_LIVE_STREAM: bool = false;
pub const MIN_TICK_INTERVAL_MS: u64 = 100;
pub const MAX_TICK_INTERVAL_MS: u64 = 5_000;
pub const MIN_RECONCILE_INTERVAL_MS: u64 = 5_000;
pub const MAX_RECONCILE_INTERVAL_MS: u64 = 300_000;
pub const MIN_CURRENT_BAR_POLL_MS: u64 = 1_000;
pub const MAX_CURRENT_BAR_POLL_MS: u64 = 120_000;
pub const MIN_HISTORY_LIMIT: u16 = 10;
pub const MAX_HISTORY_LIMIT: u16 = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Backend,
    Binance,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Binance => "binance",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backend" => Ok(Self::Backend),
            "binance" => Ok(Self::Binance),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported market source '{other}'"
            ))),
        }
    }
}

/// Thresholds governing how far the remote clock is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    pub round_length_ms: i64,
    pub window_tolerance_ms: i64,
    pub remote_time_distrust_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            round_length_ms: ROUND_LENGTH_MS,
            window_tolerance_ms: WINDOW_MISMATCH_TOLERANCE_MS,
            remote_time_distrust_ms: REMOTE_TIME_DISTRUST_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionArgs {
    pub asset: Option<String>,
    pub source: Option<SourceKind>,
    pub backend_url: Option<String>,
    pub tick_interval_ms: Option<u64>,
    pub reconcile_interval_ms: Option<u64>,
    pub current_bar_poll_ms: Option<u64>,
    pub history_limit: Option<u16>,
    pub live_stream: Option<bool>,
    pub round_length_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub asset: String,
    pub source: SourceKind,
    pub backend_url: String,
    pub tick_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub current_bar_poll_ms: u64,
    pub history_limit: u16,
    pub live_stream: bool,
    pub clock: ClockConfig,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env_value(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{name} has an invalid value '{raw}'"))),
        None => Ok(None),
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env_value(name).map(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn normalize_asset(raw: &str) -> Result<String, AppError> {
    let asset = raw.trim().to_ascii_uppercase();
    if asset.is_empty()
        || !asset
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '/' || ch == '-')
    {
        return Err(AppError::InvalidArgument(
            "asset must be non-empty ASCII (letters, digits, '/', '-')".to_string(),
        ));
    }
    Ok(asset)
}

impl SessionArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            asset: env_value("MARKET_ASSET"),
            source: env_value("MARKET_SOURCE")
                .map(|raw| SourceKind::parse_str(&raw))
                .transpose()?,
            backend_url: env_value("MARKET_BACKEND_URL"),
            tick_interval_ms: env_parsed("MARKET_TICK_MS")?,
            reconcile_interval_ms: env_parsed("MARKET_RECONCILE_MS")?,
            current_bar_poll_ms: env_parsed("MARKET_POLL_MS")?,
            history_limit: env_parsed("MARKET_HISTORY_LIMIT")?,
            live_stream: env_flag("MARKET_LIVE_STREAM"),
            round_length_ms: None,
        })
    }

    pub fn normalize(self) -> Result<SessionConfig, AppError> {
        let asset = normalize_asset(self.asset.as_deref().unwrap_or(DEFAULT_ASSET))?;
        let source = self.source.unwrap_or(DEFAULT_SOURCE);

        let backend_url = self
            .backend_url
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "backendUrl must be an http(s) URL".to_string(),
            ));
        }

        let tick_interval_ms = self.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS);
        if !(MIN_TICK_INTERVAL_MS..=MAX_TICK_INTERVAL_MS).contains(&tick_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "tickIntervalMs must be between {MIN_TICK_INTERVAL_MS} and {MAX_TICK_INTERVAL_MS}"
            )));
        }

        let reconcile_interval_ms = self
            .reconcile_interval_ms
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS);
        if !(MIN_RECONCILE_INTERVAL_MS..=MAX_RECONCILE_INTERVAL_MS).contains(&reconcile_interval_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconcileIntervalMs must be between {MIN_RECONCILE_INTERVAL_MS} and {MAX_RECONCILE_INTERVAL_MS}"
            )));
        }

        let current_bar_poll_ms = self
            .current_bar_poll_ms
            .unwrap_or(DEFAULT_CURRENT_BAR_POLL_MS);
        if !(MIN_CURRENT_BAR_POLL_MS..=MAX_CURRENT_BAR_POLL_MS).contains(&current_bar_poll_ms) {
            return Err(AppError::InvalidArgument(format!(
                "currentBarPollMs must be between {MIN_CURRENT_BAR_POLL_MS} and {MAX_CURRENT_BAR_POLL_MS}"
            )));
        }

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let round_length_ms = self.round_length_ms.unwrap_or(ROUND_LENGTH_MS);
        if round_length_ms <= 0 || DAY_MS % round_length_ms != 0 {
            return Err(AppError::InvalidArgument(
                "roundLengthMs must be positive and divide a day".to_string(),
            ));
        }

        Ok(SessionConfig {
            asset,
            source,
            backend_url,
            tick_interval_ms,
            reconcile_interval_ms,
            current_bar_poll_ms,
            history_limit,
            live_stream: self.live_stream.unwrap_or(DEFAULT_LIVE_STREAM),
            clock: ClockConfig {
                round_length_ms,
                ..ClockConfig::default()
            },
        })
    }
}

/// One OHLC observation covering a whole round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn end_ms(&self, round_length_ms: i64) -> i64 {
        self.start_ms.saturating_add(round_length_ms)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.open.is_finite()
            || !self.high.is_finite()
            || !self.low.is_finite()
            || !self.close.is_finite()
        {
            return Err(AppError::MalformedCandle(format!(
                "bar at {} has non-finite prices",
                self.start_ms
            )));
        }
        if self.low > self.high {
            return Err(AppError::MalformedCandle(format!(
                "bar at {} has low above high",
                self.start_ms
            )));
        }
        Ok(())
    }
}

/// Candle as served by the dashboard backend; timestamps are Unix seconds.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CandleWire {
    pub timestamp: Option<i64>,
    pub time: Option<i64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
}

fn required(value: Option<f64>, field: &str) -> Result<f64, AppError> {
    value.ok_or_else(|| AppError::MalformedCandle(format!("missing field '{field}'")))
}

impl TryFrom<CandleWire> for Bar {
    type Error = AppError;

    fn try_from(value: CandleWire) -> Result<Self, Self::Error> {
        let seconds = value
            .timestamp
            .or(value.time)
            .ok_or_else(|| AppError::MalformedCandle("missing field 'timestamp'".to_string()))?;
        let bar = Self {
            start_ms: seconds.saturating_mul(1_000),
            open: required(value.open, "open")?,
            high: required(value.high, "high")?,
            low: required(value.low, "low")?,
            close: required(value.close, "close")?,
        };
        bar.validate()?;
        Ok(bar)
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct KlineWire(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl TryFrom<KlineWire> for Bar {
    type Error = AppError;

    fn try_from(value: KlineWire) -> Result<Self, Self::Error> {
        let bar = Self {
            start_ms: value.0,
            open: value.1.parse::<f64>()?,
            high: value.2.parse::<f64>()?,
            low: value.3.parse::<f64>()?,
            close: value.4.parse::<f64>()?,
        };
        bar.validate()?;
        Ok(bar)
    }
}

#[derive(Debug, Deserialize)]
pub struct KlineEventWire {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "k")]
    pub kline: KlineBodyWire,
}

#[derive(Debug, Deserialize)]
pub struct KlineBodyWire {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl TryFrom<KlineEventWire> for Bar {
    type Error = AppError;

    fn try_from(value: KlineEventWire) -> Result<Self, Self::Error> {
        if value.event_type != "kline" {
            return Err(AppError::InvalidArgument(format!(
                "unexpected event type '{}' for kline stream",
                value.event_type
            )));
        }
        let body = value.kline;
        let bar = Self {
            start_ms: body.open_time,
            open: body.open.parse::<f64>()?,
            high: body.high.parse::<f64>()?,
            low: body.low.parse::<f64>()?,
            close: body.close.parse::<f64>()?,
        };
        bar.validate()?;
        Ok(bar)
    }
}

pub fn parse_kline_event_payload(payload: &mut [u8]) -> Result<Bar, AppError> {
    let wire: KlineEventWire = simd_json::serde::from_slice(payload)?;
    wire.try_into()
}

/// Remote instants arrive either as epoch milliseconds or as ISO-8601 text.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireInstant {
    Millis(i64),
    Text(String),
}

impl WireInstant {
    pub fn to_epoch_ms(&self) -> Result<i64, AppError> {
        match self {
            Self::Millis(value) => Ok(*value),
            Self::Text(raw) => {
                let trimmed = raw.trim();
                if let Ok(value) = trimmed.parse::<i64>() {
                    return Ok(value);
                }
                let parsed = chrono::DateTime::parse_from_rfc3339(trimmed)?;
                Ok(parsed.timestamp_millis())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StakeSide {
    Green,
    Red,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeIntent {
    pub asset: String,
    pub side: StakeSide,
    pub amount: f64,
}

impl StakeIntent {
    pub fn normalize(self) -> Result<Self, AppError> {
        let asset = normalize_asset(&self.asset)?;
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(AppError::InvalidArgument(
                "amount must be a finite positive number".to_string(),
            ));
        }
        Ok(Self {
            asset,
            side: self.side,
            amount: self.amount,
        })
    }
}

/// Everything the presentation layer is allowed to read.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub time_left_ms: i64,
    pub gate: GateState,
    pub bars: Vec<Bar>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_session_args_defaults() {
        let config = SessionArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.asset, DEFAULT_ASSET);
        assert_eq!(config.source, DEFAULT_SOURCE);
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.reconcile_interval_ms, DEFAULT_RECONCILE_INTERVAL_MS);
        assert_eq!(config.current_bar_poll_ms, DEFAULT_CURRENT_BAR_POLL_MS);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.live_stream, DEFAULT_LIVE_STREAM);
        assert_eq!(config.clock, ClockConfig::default());
    }

    #[test]
    fn normalizes_asset_case_and_whitespace() {
        let config = SessionArgs {
            asset: Some("  eth/usdt ".to_string()),
            backend_url: Some("https://example.org/api/".to_string()),
            ..SessionArgs::default()
        }
        .normalize()
        .expect("args should be valid");

        assert_eq!(config.asset, "ETH/USDT");
        assert_eq!(config.backend_url, "https://example.org/api");
    }

    #[test]
    fn validates_reconcile_interval_range() {
        let result = SessionArgs {
            reconcile_interval_ms: Some(100),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_history_limit_range() {
        let result = SessionArgs {
            history_limit: Some(5_000),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_round_length_not_dividing_a_day() {
        let result = SessionArgs {
            round_length_ms: Some(7 * 3_600_000),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_http_backend_url() {
        let result = SessionArgs {
            backend_url: Some("ftp://example.org".to_string()),
            ..SessionArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn converts_backend_candle_seconds_to_millis() {
        let wire = CandleWire {
            timestamp: Some(14_400),
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
            ..CandleWire::default()
        };
        let bar = Bar::try_from(wire).expect("complete candle should convert");
        assert_eq!(bar.start_ms, 14_400_000);
        assert_eq!(bar.close, 1.5);
    }

    #[test]
    fn rejects_candle_with_missing_field() {
        let wire = CandleWire {
            timestamp: Some(14_400),
            open: Some(1.0),
            high: Some(2.0),
            low: None,
            close: Some(1.5),
            ..CandleWire::default()
        };
        assert!(matches!(
            Bar::try_from(wire),
            Err(AppError::MalformedCandle(_))
        ));
    }

    #[test]
    fn parses_kline_stream_payload() {
        let mut payload = br#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":14400000,"T":28799999,"s":"BTCUSDT","i":"4h","o":"100.0","h":"110.5","l":"95.25","c":"101.0","v":"3.5","x":false}}"#
            .to_vec();
        let bar = parse_kline_event_payload(&mut payload).expect("kline payload should parse");

        assert_eq!(bar.start_ms, 14_400_000);
        assert_eq!(bar.high, 110.5);
        assert_eq!(bar.low, 95.25);
    }

    #[test]
    fn rejects_non_kline_stream_payload() {
        let mut payload = br#"{"e":"aggTrade","k":{"t":1,"o":"1","h":"1","l":"1","c":"1","x":true}}"#
            .to_vec();
        assert!(parse_kline_event_payload(&mut payload).is_err());
    }

    #[test]
    fn parses_wire_instants() {
        assert_eq!(
            WireInstant::Millis(14_400_000).to_epoch_ms().expect("millis"),
            14_400_000
        );
        assert_eq!(
            WireInstant::Text("1970-01-01T04:00:00Z".to_string())
                .to_epoch_ms()
                .expect("iso-8601"),
            14_400_000
        );
        assert_eq!(
            WireInstant::Text("14400000".to_string())
                .to_epoch_ms()
                .expect("numeric text"),
            14_400_000
        );
        assert!(WireInstant::Text("yesterday".to_string())
            .to_epoch_ms()
            .is_err());
    }

    #[test]
    fn validates_stake_intent() {
        let intent = StakeIntent {
            asset: "btc/usdt".to_string(),
            side: StakeSide::Green,
            amount: 2.5,
        }
        .normalize()
        .expect("intent should be valid");
        assert_eq!(intent.asset, "BTC/USDT");

        let zero = StakeIntent {
            asset: "BTC/USDT".to_string(),
            side: StakeSide::Red,
            amount: 0.0,
        }
        .normalize();
        assert!(zero.is_err());
    }
}
