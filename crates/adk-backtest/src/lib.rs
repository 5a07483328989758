//! adk-backtest
//!
//! Deterministic historical replay and parameter search:
//! - [`BacktestEngine`]: steps a strategy through candles, simulates fills,
//!   tracks equity, computes metrics
//! - [`OrderSimulator`]: fill semantics with adverse slippage
//! - [`MonteCarloOptimizer`]: corner + random + exhaustive parameter
//!   sampling over shared candle data, ranking, heatmap aggregation
//!
//! Replay is deterministic: same candles + same config + same seed produce
//! identical reports.

mod engine;
mod metrics;
mod optimizer;
mod simulator;
mod types;

pub use engine::{BacktestEngine, BacktestRun};
pub use metrics::{calculate_metrics, PerformanceMetrics, PROFIT_FACTOR_CAP};
pub use optimizer::{
    generate_samples, heatmap, HeatmapCell, HeatmapData, MonteCarloOptimizer, ObjectiveMetric,
    OptimizationConfig, ParameterRange, SampleResult,
};
pub use simulator::{Fill, OrderSimulator, SimContext, SimPosition};
pub use types::{
    downsample_equity, BacktestConfig, BacktestError, EquityPoint, JobStatus, TradeResult,
};
