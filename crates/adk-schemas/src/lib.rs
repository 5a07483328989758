//! adk-schemas
//!
//! Shared domain types for the algodesk execution core:
//! - fixed-point money helpers (micro-rupees, basis points)
//! - market data (ticks, candles, bar intervals)
//! - candidate orders emitted by strategies
//! - positions, strategy context, risk limits
//!
//! Pure data + deterministic helpers. No IO, no clocks beyond explicit
//! timestamp arguments.

mod context;
mod market;
mod money;
mod order;

pub use context::{Position, RiskLimits, StrategyContext};
pub use market::{
    feed_key, trading_day_ist, validate_candle_series, Candle, CandleError, Interval, MarketTick,
};
pub use money::{bps_of_micros, micros_from_f64, micros_to_f64, pct_to_bps, BPS_SCALE, MICROS_SCALE};
pub use order::{OrderRequest, OrderType, Signal};
