use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Kolkata;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bar intervals
// ---------------------------------------------------------------------------

/// Supported bar intervals for historical data and backtests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1min")]
    Min1,
    #[serde(rename = "5min")]
    Min5,
    #[serde(rename = "15min")]
    Min15,
    #[serde(rename = "30min")]
    Min30,
    #[serde(rename = "1hour")]
    Hour1,
    #[serde(rename = "1day")]
    Day1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1min",
            Interval::Min5 => "5min",
            Interval::Min15 => "15min",
            Interval::Min30 => "30min",
            Interval::Hour1 => "1hour",
            Interval::Day1 => "1day",
        }
    }

    pub fn parse(s: &str) -> Option<Interval> {
        match s {
            "1min" => Some(Interval::Min1),
            "5min" => Some(Interval::Min5),
            "15min" => Some(Interval::Min15),
            "30min" => Some(Interval::Min30),
            "1hour" => Some(Interval::Hour1),
            "1day" => Some(Interval::Day1),
            _ => None,
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Interval::Min1 => 60,
            Interval::Min5 => 300,
            Interval::Min15 => 900,
            Interval::Min30 => 1_800,
            Interval::Hour1 => 3_600,
            Interval::Day1 => 86_400,
        }
    }

    /// Broker APIs bound the date span a single historical request may cover.
    /// Intraday intervals are capped at 100 days per request, daily at 365.
    pub fn max_days_per_request(&self) -> i64 {
        match self {
            Interval::Day1 => 365,
            _ => 100,
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Interval::Day1)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

/// A single market-data update delivered to a strategy's hot path.
///
/// Prices are micro-rupees. `bid`/`ask` may equal `ltp` when the feed does
/// not carry depth (e.g. candles replayed in a backtest use bid = ask = close).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub exchange: String,
    pub ts: DateTime<Utc>,
    pub ltp_micros: i64,
    pub open_micros: i64,
    pub high_micros: i64,
    pub low_micros: i64,
    pub close_micros: i64,
    pub volume: i64,
    pub bid_micros: i64,
    pub ask_micros: i64,
    pub bid_qty: i64,
    pub ask_qty: i64,
}

impl MarketTick {
    /// Fan-out key: `"exchange:symbol"`.
    pub fn feed_key(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

/// Fan-out key for an (exchange, symbol) pair.
pub fn feed_key(exchange: &str, symbol: &str) -> String {
    format!("{exchange}:{symbol}")
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A historical OHLCV bar. Prices are micro-rupees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open_micros: i64,
    pub high_micros: i64,
    pub low_micros: i64,
    pub close_micros: i64,
    pub volume: i64,
}

/// Candle validation failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CandleError {
    /// `low > min(open, close)` or `high < max(open, close)` or `low > high`.
    OhlcOutOfOrder { ts: DateTime<Utc> },
    /// Prices must be strictly positive.
    NonPositivePrice { ts: DateTime<Utc> },
    /// Series timestamps must be strictly increasing.
    NonMonotonicTimestamp { ts: DateTime<Utc> },
}

impl std::fmt::Display for CandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandleError::OhlcOutOfOrder { ts } => write!(f, "candle OHLC out of order at {ts}"),
            CandleError::NonPositivePrice { ts } => write!(f, "non-positive candle price at {ts}"),
            CandleError::NonMonotonicTimestamp { ts } => {
                write!(f, "non-monotonic candle timestamp at {ts}")
            }
        }
    }
}

impl std::error::Error for CandleError {}

impl Candle {
    /// Enforce `low <= open,close <= high` and `low > 0`.
    pub fn validate(&self) -> Result<(), CandleError> {
        if self.low_micros <= 0 {
            return Err(CandleError::NonPositivePrice { ts: self.ts });
        }
        let body_min = self.open_micros.min(self.close_micros);
        let body_max = self.open_micros.max(self.close_micros);
        if self.low_micros > body_min || body_max > self.high_micros {
            return Err(CandleError::OhlcOutOfOrder { ts: self.ts });
        }
        Ok(())
    }

    /// Build the tick a strategy sees when this candle closes
    /// (bid = ask = close).
    pub fn to_tick(&self, symbol: &str, exchange: &str) -> MarketTick {
        MarketTick {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            ts: self.ts,
            ltp_micros: self.close_micros,
            open_micros: self.open_micros,
            high_micros: self.high_micros,
            low_micros: self.low_micros,
            close_micros: self.close_micros,
            volume: self.volume,
            bid_micros: self.close_micros,
            ask_micros: self.close_micros,
            bid_qty: 0,
            ask_qty: 0,
        }
    }
}

/// Validate every candle plus strict timestamp monotonicity across the series.
pub fn validate_candle_series(candles: &[Candle]) -> Result<(), CandleError> {
    let mut prev_ts: Option<DateTime<Utc>> = None;
    for c in candles {
        c.validate()?;
        if let Some(prev) = prev_ts {
            if c.ts <= prev {
                return Err(CandleError::NonMonotonicTimestamp { ts: c.ts });
            }
        }
        prev_ts = Some(c.ts);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trading day
// ---------------------------------------------------------------------------

/// The Indian trading day a timestamp belongs to (Asia/Kolkata calendar
/// date). Daily counters (trade count, today's PnL) roll over on this.
pub fn trading_day_ist(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Kolkata).date_naive()
}
