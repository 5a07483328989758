//! Reference strategies shipped with the platform.
//!
//! These double as test seeds for the runtime and the backtest engine. Their
//! indicator math goes through [`crate::indicators`], the same functions the
//! chart-preview path uses.

mod rsi_momentum;
mod sma_rsi_crossover;

pub use rsi_momentum::RsiMomentum;
pub use sma_rsi_crossover::SmaRsiCrossover;
