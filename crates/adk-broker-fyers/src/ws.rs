//! Data-socket feed task.
//!
//! One background task owns the websocket: it subscribes the requested
//! symbols, converts stream payloads to quotes, and reconnects with bounded
//! backoff until stopped. Control flows through an unbounded channel so the
//! broker methods never block on the socket.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use adk_broker::{MarketQuote, TickCallback};
use adk_schemas::micros_from_f64;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::types::WsTick;

enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Stop,
}

pub struct WsFeed {
    ws_url: String,
    control: Mutex<Option<mpsc::UnboundedSender<FeedCommand>>>,
}

impl WsFeed {
    pub fn new(ws_url: &str) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            control: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, auth: &str, symbols: Vec<String>, callback: TickCallback) {
        let mut control = self.control.lock().expect("ws control poisoned");
        if let Some(tx) = control.as_ref() {
            if tx.send(FeedCommand::Subscribe(symbols.clone())).is_ok() {
                return;
            }
            // Task is gone; fall through and restart it.
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *control = Some(tx);
        let url = format!("{}?access_token={}", self.ws_url, auth);
        tokio::spawn(feed_task(url, symbols.into_iter().collect(), callback, rx));
    }

    pub fn unsubscribe(&self, symbols: Vec<String>) {
        let control = self.control.lock().expect("ws control poisoned");
        if let Some(tx) = control.as_ref() {
            let _ = tx.send(FeedCommand::Unsubscribe(symbols));
        }
    }

    pub fn stop(&self) {
        let mut control = self.control.lock().expect("ws control poisoned");
        if let Some(tx) = control.take() {
            let _ = tx.send(FeedCommand::Stop);
        }
    }
}

fn subscribe_message(symbols: &BTreeSet<String>, subscribe: bool) -> Message {
    let payload = serde_json::json!({
        "T": if subscribe { "SUB_DATA" } else { "UNSUB_DATA" },
        "TLIST": symbols.iter().collect::<Vec<_>>(),
        "SUB_T": if subscribe { 1 } else { 0 },
    });
    Message::Text(payload.to_string())
}

fn tick_to_quote(tick: WsTick) -> MarketQuote {
    let (exchange, symbol) = match tick.symbol.split_once(':') {
        Some((e, rest)) => (
            e.to_string(),
            rest.strip_suffix("-EQ").unwrap_or(rest).to_string(),
        ),
        None => (String::new(), tick.symbol.clone()),
    };
    let ts = Utc
        .timestamp_opt(tick.exch_feed_time, 0)
        .single()
        .unwrap_or_else(Utc::now);
    MarketQuote {
        symbol,
        exchange,
        ltp_micros: micros_from_f64(tick.ltp),
        open_micros: micros_from_f64(tick.open_price),
        high_micros: micros_from_f64(tick.high_price),
        low_micros: micros_from_f64(tick.low_price),
        close_micros: micros_from_f64(tick.prev_close_price),
        volume: tick.vol_traded_today,
        bid_micros: micros_from_f64(tick.bid_price),
        ask_micros: micros_from_f64(tick.ask_price),
        bid_qty: tick.bid_size,
        ask_qty: tick.ask_size,
        ts,
    }
}

async fn feed_task(
    url: String,
    mut symbols: BTreeSet<String>,
    callback: TickCallback,
    mut control: mpsc::UnboundedReceiver<FeedCommand>,
) {
    let mut backoff = Duration::from_secs(1);

    'reconnect: loop {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                backoff = Duration::from_secs(1);
                stream
            }
            Err(err) => {
                warn!(%err, "fyers data socket connect failed");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    cmd = control.recv() => {
                        if apply_command(cmd, &mut symbols).is_stop() {
                            return;
                        }
                    }
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
                continue;
            }
        };

        let (mut sink, mut reader) = stream.split();
        if !symbols.is_empty() && sink.send(subscribe_message(&symbols, true)).await.is_err() {
            continue;
        }

        loop {
            tokio::select! {
                cmd = control.recv() => {
                    match apply_command(cmd, &mut symbols) {
                        Applied::Stop => {
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                        Applied::Subscribed(added) => {
                            let _ = sink.send(subscribe_message(&added, true)).await;
                        }
                        Applied::Unsubscribed(removed) => {
                            let _ = sink.send(subscribe_message(&removed, false)).await;
                        }
                        Applied::None => {}
                    }
                }
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<WsTick>(&text) {
                                Ok(tick) if !tick.symbol.is_empty() => callback(tick_to_quote(tick)),
                                Ok(_) => {}
                                Err(err) => debug!(%err, "non-tick data socket payload"),
                            }
                        }
                        Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("fyers data socket closed, reconnecting");
                            continue 'reconnect;
                        }
                        Some(Err(err)) => {
                            warn!(%err, "fyers data socket error, reconnecting");
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

enum Applied {
    None,
    Stop,
    Subscribed(BTreeSet<String>),
    Unsubscribed(BTreeSet<String>),
}

impl Applied {
    fn is_stop(&self) -> bool {
        matches!(self, Applied::Stop)
    }
}

fn apply_command(cmd: Option<FeedCommand>, symbols: &mut BTreeSet<String>) -> Applied {
    match cmd {
        None | Some(FeedCommand::Stop) => Applied::Stop,
        Some(FeedCommand::Subscribe(list)) => {
            let added: BTreeSet<String> = list
                .into_iter()
                .filter(|s| symbols.insert(s.clone()))
                .collect();
            if added.is_empty() {
                Applied::None
            } else {
                Applied::Subscribed(added)
            }
        }
        Some(FeedCommand::Unsubscribe(list)) => {
            let removed: BTreeSet<String> = list
                .into_iter()
                .filter(|s| symbols.remove(s))
                .collect();
            if removed.is_empty() {
                Applied::None
            } else {
                Applied::Unsubscribed(removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_shape() {
        let mut set = BTreeSet::new();
        set.insert("NSE:SBIN-EQ".to_string());
        let msg = subscribe_message(&set, true);
        let Message::Text(text) = msg else {
            panic!("expected text frame")
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["T"], "SUB_DATA");
        assert_eq!(v["SUB_T"], 1);
        assert_eq!(v["TLIST"][0], "NSE:SBIN-EQ");
    }

    #[test]
    fn ws_tick_converts_to_quote() {
        let tick: WsTick = serde_json::from_str(
            r#"{
                "symbol": "NSE:SBIN-EQ",
                "ltp": 782.5,
                "open_price": 780.0,
                "high_price": 785.0,
                "low_price": 779.0,
                "prev_close_price": 778.0,
                "vol_traded_today": 120000,
                "bid_price": 782.45,
                "ask_price": 782.55,
                "bid_size": 50,
                "ask_size": 75,
                "exch_feed_time": 1700000000
            }"#,
        )
        .unwrap();
        let quote = tick_to_quote(tick);
        assert_eq!(quote.symbol, "SBIN");
        assert_eq!(quote.exchange, "NSE");
        assert_eq!(quote.ltp_micros, 782_500_000);
        assert_eq!(quote.bid_qty, 50);
        assert_eq!(quote.ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn apply_command_tracks_symbol_set() {
        let mut set = BTreeSet::new();
        let applied = apply_command(
            Some(FeedCommand::Subscribe(vec!["A".into(), "B".into()])),
            &mut set,
        );
        assert!(matches!(applied, Applied::Subscribed(ref s) if s.len() == 2));

        // Re-subscribing an existing symbol is a no-op.
        let applied = apply_command(Some(FeedCommand::Subscribe(vec!["A".into()])), &mut set);
        assert!(matches!(applied, Applied::None));

        let applied = apply_command(Some(FeedCommand::Unsubscribe(vec!["A".into()])), &mut set);
        assert!(matches!(applied, Applied::Unsubscribed(ref s) if s.len() == 1));
        assert_eq!(set.len(), 1);

        assert!(apply_command(None, &mut set).is_stop());
    }
}
