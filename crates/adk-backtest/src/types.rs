use adk_schemas::{CandleError, Interval, MICROS_SCALE};
use adk_strategy::ConfigMap;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Minimum initial capital for a backtest job: 10,000 rupees.
pub const MIN_INITIAL_CAPITAL_MICROS: i64 = 10_000 * MICROS_SCALE;

/// Max persisted equity-curve points per job.
pub const EQUITY_CURVE_MAX_POINTS: usize = 500;

// ---------------------------------------------------------------------------
// Config and job state
// ---------------------------------------------------------------------------

/// Configuration for one backtest run.
#[derive(Clone, Debug, PartialEq)]
pub struct BacktestConfig {
    pub strategy_name: String,
    pub symbol: String,
    pub exchange: String,
    pub interval: Interval,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital_micros: i64,
    pub strategy_config: ConfigMap,
    /// Adverse slippage in basis points (default 5 = 0.05%).
    pub slippage_bps: i64,
    pub commission_micros: i64,
}

impl BacktestConfig {
    pub fn new(
        strategy_name: impl Into<String>,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        interval: Interval,
        start_date: NaiveDate,
        end_date: NaiveDate,
        initial_capital_micros: i64,
    ) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            symbol: symbol.into(),
            exchange: exchange.into(),
            interval,
            start_date,
            end_date,
            initial_capital_micros,
            strategy_config: ConfigMap::new(),
            slippage_bps: 5,
            commission_micros: 0,
        }
    }

    pub fn with_config(mut self, strategy_config: ConfigMap) -> Self {
        self.strategy_config = strategy_config;
        self
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.start_date > self.end_date {
            return Err(BacktestError::InvalidConfig(
                "start_date must not be after end_date".to_string(),
            ));
        }
        if self.initial_capital_micros < MIN_INITIAL_CAPITAL_MICROS {
            return Err(BacktestError::InvalidConfig(format!(
                "initial capital must be at least {MIN_INITIAL_CAPITAL_MICROS} micros"
            )));
        }
        if self.slippage_bps < 0 {
            return Err(BacktestError::InvalidConfig(
                "slippage must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Job life cycle: pending -> running -> (completed | failed | cancelled).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// A trade tracked during replay. Completed trades carry exit fields;
/// positions force-closed at the end are completed at the last close.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub entry_price_micros: i64,
    pub exit_price_micros: Option<i64>,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_micros: i64,
    pub pnl_percent: f64,
    pub is_open: bool,
}

impl TradeResult {
    pub fn is_winner(&self) -> bool {
        self.pnl_micros > 0
    }
}

/// One equity observation with drawdown from the running peak.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity_micros: i64,
    pub drawdown_percent: f64,
}

/// Downsample an equity curve to at most [`EQUITY_CURVE_MAX_POINTS`] by
/// striding `step = max(1, len / 500)`. The first and last timestamps are
/// preserved (the final sampled point is replaced by the true last point
/// when the stride would skip it).
pub fn downsample_equity(points: &[EquityPoint]) -> Vec<EquityPoint> {
    if points.len() <= EQUITY_CURVE_MAX_POINTS {
        return points.to_vec();
    }
    let step = (points.len() / EQUITY_CURVE_MAX_POINTS).max(1);
    let mut sampled: Vec<EquityPoint> = points.iter().step_by(step).cloned().collect();
    if let (Some(last_sampled), Some(last)) = (sampled.last(), points.last()) {
        if last_sampled.ts != last.ts {
            *sampled.last_mut().expect("sampled is non-empty") = last.clone();
        }
    }
    sampled
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Backtest failures.
#[derive(Clone, Debug, PartialEq)]
pub enum BacktestError {
    /// Input candles violated the OHLC/monotonicity invariants.
    InvalidCandles(CandleError),
    /// Strategy name not present in the registry.
    UnknownStrategy(String),
    /// Empty candle input.
    NoData,
    /// Bad configuration (dates, capital, slippage).
    InvalidConfig(String),
    /// A cancel signal was observed between candles or samples.
    Cancelled,
}

impl std::fmt::Display for BacktestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BacktestError::InvalidCandles(err) => write!(f, "invalid candles: {err}"),
            BacktestError::UnknownStrategy(name) => write!(f, "unknown strategy '{name}'"),
            BacktestError::NoData => write!(f, "no candle data"),
            BacktestError::InvalidConfig(msg) => write!(f, "invalid backtest config: {msg}"),
            BacktestError::Cancelled => write!(f, "backtest cancelled"),
        }
    }
}

impl std::error::Error for BacktestError {}

impl From<CandleError> for BacktestError {
    fn from(err: CandleError) -> Self {
        BacktestError::InvalidCandles(err)
    }
}
