use crate::error::AppError;
use crate::market::clock::{now_unix_ms, RemoteRoundSnapshot};
use crate::market::sources::{CandleSource, RoundSource};
use crate::market::types::{parse_kline_event_payload, Bar, KlineWire};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const BINANCE_STREAM_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
const BINANCE_REST_BASE_URL: &str = "https://api.binance.com";
const BINANCE_MAX_KLINES_PER_REQUEST: usize = 1_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub type BinanceWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maps a dashboard asset name onto a Binance spot symbol.
pub fn asset_to_symbol(asset: &str) -> String {
    let compact: String = asset
        .chars()
        .filter(|ch| *ch != '/' && *ch != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    match compact.as_str() {
        "GOLD" => "XAUUSD".to_string(),
        "SILVER" => "XAGUSD".to_string(),
        "OIL" => "OILUSDT".to_string(),
        _ => compact,
    }
}

/// Kline interval whose bars line up with rounds of the given length.
pub fn interval_for_round(round_length_ms: i64) -> Option<&'static str> {
    match round_length_ms {
        60_000 => Some("1m"),
        300_000 => Some("5m"),
        900_000 => Some("15m"),
        1_800_000 => Some("30m"),
        3_600_000 => Some("1h"),
        7_200_000 => Some("2h"),
        14_400_000 => Some("4h"),
        21_600_000 => Some("6h"),
        28_800_000 => Some("8h"),
        43_200_000 => Some("12h"),
        86_400_000 => Some("1d"),
        _ => None,
    }
}

fn ws_endpoint(symbol: &str, interval: &str) -> String {
    format!(
        "{BINANCE_STREAM_BASE_URL}/{}@kline_{interval}",
        symbol.to_ascii_lowercase()
    )
}

fn server_time_endpoint() -> String {
    format!("{BINANCE_REST_BASE_URL}/api/v3/time")
}

fn klines_endpoint(symbol: &str, interval: &str, limit: u16, end_time: Option<i64>) -> String {
    let mut endpoint = format!("{BINANCE_REST_BASE_URL}/api/v3/klines")
        + &format!(
            "?symbol={}&interval={interval}&limit={limit}",
            symbol.to_ascii_uppercase()
        );
    if let Some(value) = end_time {
        endpoint.push_str(&format!("&endTime={value}"));
    }
    endpoint
}

#[derive(Debug, Deserialize)]
struct BinanceServerTimeWire {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Exchange-backed round timing and bars. Rounds are not listed by the exchange,
/// so only the remote clock reading is supplied.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    interval: &'static str,
}

impl BinanceClient {
    pub fn new(round_length_ms: i64) -> Result<Self, AppError> {
        let interval = interval_for_round(round_length_ms).ok_or_else(|| {
            AppError::InvalidArgument(format!(
                "no exchange kline interval matches a {round_length_ms}ms round"
            ))
        })?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, interval })
    }

    pub fn interval(&self) -> &'static str {
        self.interval
    }

    pub async fn fetch_server_time_ms(&self) -> Result<i64, AppError> {
        let endpoint = server_time_endpoint();
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<BinanceServerTimeWire>().await?;
        Ok(payload.server_time)
    }

    /// Server time projected to the moment the response arrived, assuming a
    /// symmetric round trip.
    pub async fn sample_remote_now_ms(&self) -> Result<i64, AppError> {
        let request_started_ms = now_unix_ms();
        let server_time_ms = self.fetch_server_time_ms().await?;
        let rtt_ms = now_unix_ms().saturating_sub(request_started_ms).max(0);
        Ok(server_time_ms.saturating_add(rtt_ms / 2))
    }

    pub async fn fetch_klines(&self, symbol: &str, limit: u16) -> Result<Vec<Bar>, AppError> {
        let target_limit = usize::from(limit);
        let mut remaining = target_limit;
        let mut end_time: Option<i64> = None;
        let mut klines: Vec<KlineWire> = Vec::with_capacity(target_limit);

        while remaining > 0 {
            let request_limit = remaining.min(BINANCE_MAX_KLINES_PER_REQUEST) as u16;
            let endpoint = klines_endpoint(symbol, self.interval, request_limit, end_time);
            let response = self.client.get(endpoint).send().await?.error_for_status()?;
            let mut payload = response.json::<Vec<KlineWire>>().await?;
            if payload.is_empty() {
                break;
            }

            let oldest_open_time = payload.first().map(|kline| kline.0).unwrap_or_default();
            remaining = remaining.saturating_sub(payload.len());
            klines.append(&mut payload);

            if oldest_open_time <= 0 {
                break;
            }
            end_time = Some(oldest_open_time - 1);
        }

        klines.sort_unstable_by_key(|kline| kline.0);
        klines.dedup_by_key(|kline| kline.0);
        if klines.len() > target_limit {
            let overflow = klines.len() - target_limit;
            klines.drain(0..overflow);
        }

        klines.into_iter().map(Bar::try_from).collect()
    }
}

impl RoundSource for BinanceClient {
    fn current_round<'a>(
        &'a self,
        _asset: &'a str,
    ) -> BoxFuture<'a, Result<RemoteRoundSnapshot, AppError>> {
        Box::pin(async move {
            let now_ms = self.sample_remote_now_ms().await?;
            Ok(RemoteRoundSnapshot {
                start_ms: None,
                end_ms: None,
                now_ms: Some(now_ms),
            })
        })
    }
}

impl CandleSource for BinanceClient {
    fn historical<'a>(
        &'a self,
        asset: &'a str,
        limit: u16,
    ) -> BoxFuture<'a, Result<Vec<Bar>, AppError>> {
        Box::pin(async move { self.fetch_klines(&asset_to_symbol(asset), limit).await })
    }

    fn current<'a>(&'a self, asset: &'a str) -> BoxFuture<'a, Result<Option<Bar>, AppError>> {
        Box::pin(async move {
            let mut bars = self.fetch_klines(&asset_to_symbol(asset), 1).await?;
            Ok(bars.pop())
        })
    }
}

pub async fn connect_kline_stream(symbol: &str, interval: &str) -> Result<BinanceWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(1 << 20),
        max_frame_size: Some(1 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(symbol, interval);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

enum StreamDirective {
    Continue,
    Reconnect,
    SinkClosed,
}

async fn handle_message(message: Message, sink: &mpsc::Sender<Bar>) -> StreamDirective {
    let parsed = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            parse_kline_event_payload(owned_payload.as_mut_slice())
        }
        Message::Binary(mut binary_payload) => {
            parse_kline_event_payload(binary_payload.as_mut_slice())
        }
        Message::Close(_) => return StreamDirective::Reconnect,
        _ => return StreamDirective::Continue,
    };

    match parsed {
        Ok(bar) => {
            if sink.send(bar).await.is_err() {
                StreamDirective::SinkClosed
            } else {
                StreamDirective::Continue
            }
        }
        Err(error) => {
            tracing::warn!(%error, "failed to decode kline payload");
            StreamDirective::Continue
        }
    }
}

/// Forwards in-progress bars from the exchange kline stream into `sink` until
/// cancelled or the receiver is dropped. Reconnects with capped backoff.
pub async fn run_kline_stream(
    symbol: String,
    interval: &'static str,
    sink: mpsc::Sender<Bar>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        if reconnect_attempt == 0 {
            tracing::info!(%symbol, interval, "opening kline stream");
        } else {
            tracing::info!(%symbol, reconnect_attempt, "reconnecting kline stream");
        }

        match connect_kline_stream(&symbol, interval).await {
            Ok(mut websocket_stream) => {
                reconnect_attempt = 0;
                let mut immediate_reconnect = false;
                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next_message = websocket_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        break;
                    };

                    match frame_result {
                        Ok(message) => match handle_message(message, &sink).await {
                            StreamDirective::Continue => {}
                            StreamDirective::Reconnect => {
                                immediate_reconnect = true;
                                break;
                            }
                            StreamDirective::SinkClosed => {
                                tracing::debug!(%symbol, "kline receiver dropped");
                                return;
                            }
                        },
                        Err(error) => {
                            tracing::warn!(%symbol, %error, "kline stream frame error");
                            break;
                        }
                    }
                }

                if cancel_token.is_cancelled() {
                    break;
                }
                if immediate_reconnect {
                    continue;
                }
            }
            Err(error) => {
                tracing::warn!(%symbol, %error, "kline stream connect failed");
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(%symbol, "kline stream stopped");
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = now_unix_ms().unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}
