//! Monte-Carlo parameter optimizer.
//!
//! Sample generation order:
//! 1. exhaustive enumeration when the full product fits the budget
//! 2. otherwise corner cases (each parameter at min or max), truncated to a
//!    quarter of the budget, then uniform random samples with duplicate
//!    rejection until the budget or the attempt ceiling (10x budget)
//!
//! Every sample replays the same loaded candles. Ranking sorts by the
//! objective descending (max drawdown is negated: smaller is better); the
//! first non-errored sample after the sort is the single `is_best`. Errored
//! samples carry `-inf` and never win or contribute to heatmap cells.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;

use adk_schemas::Candle;
use adk_strategy::{ConfigMap, ParamType, StrategyRegistry};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::BacktestEngine;
use crate::metrics::PerformanceMetrics;
use crate::types::{BacktestConfig, BacktestError};

// ---------------------------------------------------------------------------
// Objective metrics
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMetric {
    TotalReturnPercent,
    SharpeRatio,
    SortinoRatio,
    ProfitFactor,
    WinRate,
    CalmarRatio,
    MaxDrawdown,
}

impl ObjectiveMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveMetric::TotalReturnPercent => "total_return_percent",
            ObjectiveMetric::SharpeRatio => "sharpe_ratio",
            ObjectiveMetric::SortinoRatio => "sortino_ratio",
            ObjectiveMetric::ProfitFactor => "profit_factor",
            ObjectiveMetric::WinRate => "win_rate",
            ObjectiveMetric::CalmarRatio => "calmar_ratio",
            ObjectiveMetric::MaxDrawdown => "max_drawdown",
        }
    }

    /// Raw metric value.
    pub fn extract(&self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            ObjectiveMetric::TotalReturnPercent => metrics.total_return_percent,
            ObjectiveMetric::SharpeRatio => metrics.sharpe_ratio,
            ObjectiveMetric::SortinoRatio => metrics.sortino_ratio,
            ObjectiveMetric::ProfitFactor => metrics.profit_factor,
            ObjectiveMetric::WinRate => metrics.win_rate,
            ObjectiveMetric::CalmarRatio => metrics.calmar_ratio,
            ObjectiveMetric::MaxDrawdown => metrics.max_drawdown,
        }
    }

    /// Ranking value: inverted for max drawdown, where smaller is better.
    pub fn objective_value(&self, metrics: &PerformanceMetrics) -> f64 {
        let raw = self.extract(metrics);
        match self {
            ObjectiveMetric::MaxDrawdown => -raw,
            _ => raw,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter ranges and sampling
// ---------------------------------------------------------------------------

/// A declared parameter range: `min, min+step, …, <= max + epsilon`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterRange {
    pub name: String,
    pub min_value: f64,
    pub max_value: f64,
    pub step: f64,
    pub param_type: ParamType,
}

impl ParameterRange {
    pub fn int(name: impl Into<String>, min_value: i64, max_value: i64, step: i64) -> Self {
        Self {
            name: name.into(),
            min_value: min_value as f64,
            max_value: max_value as f64,
            step: (step.max(1)) as f64,
            param_type: ParamType::Int,
        }
    }

    pub fn float(name: impl Into<String>, min_value: f64, max_value: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            min_value,
            max_value,
            step,
            param_type: ParamType::Float,
        }
    }

    /// Enumerate every value in the range.
    pub fn possible_values(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.min_value > self.max_value {
            return vec![self.round(self.min_value)];
        }
        let mut values = Vec::new();
        let mut current = self.min_value;
        // epsilon absorbs float accumulation at the top of the range
        while current <= self.max_value + 1e-4 {
            values.push(self.round(current));
            current += self.step;
        }
        values
    }

    fn round(&self, value: f64) -> f64 {
        match self.param_type {
            ParamType::Int => value.round(),
            ParamType::Float => (value * 10_000.0).round() / 10_000.0,
        }
    }
}

/// Configuration for one optimization run.
#[derive(Clone, Debug)]
pub struct OptimizationConfig {
    pub backtest: BacktestConfig,
    pub parameter_ranges: Vec<ParameterRange>,
    /// Sample budget (the platform accepts 50-200).
    pub num_samples: usize,
    pub objective_metric: ObjectiveMetric,
}

fn sample_key(sample: &ConfigMap) -> String {
    let mut key = String::new();
    for (name, value) in sample {
        key.push_str(name);
        key.push('=');
        key.push_str(&value.to_string());
        key.push(';');
    }
    key
}

/// Generate the parameter tuples to evaluate. Deterministic for a given rng
/// state: corner cases first, then random samples, with no duplicates.
pub fn generate_samples(
    ranges: &[ParameterRange],
    num_samples: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<ConfigMap> {
    let per_range_values: Vec<Vec<f64>> = ranges.iter().map(|r| r.possible_values()).collect();

    let mut total: usize = 1;
    for values in &per_range_values {
        total = total.saturating_mul(values.len());
    }

    if total <= num_samples {
        return exhaustive_samples(ranges, &per_range_values);
    }

    let mut samples: Vec<ConfigMap> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    // Corner cases, at most a quarter of the budget.
    let corner_budget = num_samples / 4;
    for corner in corner_samples(ranges) {
        if samples.len() >= corner_budget {
            break;
        }
        if seen.insert(sample_key(&corner)) {
            samples.push(corner);
        }
    }

    // Random fill with duplicate rejection.
    let max_attempts = num_samples.saturating_mul(10);
    let mut attempts = 0usize;
    while samples.len() < num_samples && attempts < max_attempts {
        let mut sample = ConfigMap::new();
        for (range, values) in ranges.iter().zip(&per_range_values) {
            let idx = rng.gen_range(0..values.len());
            sample.insert(range.name.clone(), values[idx]);
        }
        if seen.insert(sample_key(&sample)) {
            samples.push(sample);
        }
        attempts += 1;
    }

    samples
}

fn exhaustive_samples(ranges: &[ParameterRange], per_range_values: &[Vec<f64>]) -> Vec<ConfigMap> {
    let mut samples = Vec::new();
    if ranges.is_empty() {
        return samples;
    }
    let mut indices = vec![0usize; ranges.len()];
    loop {
        let mut sample = ConfigMap::new();
        for (i, range) in ranges.iter().enumerate() {
            sample.insert(range.name.clone(), per_range_values[i][indices[i]]);
        }
        samples.push(sample);

        // odometer increment
        let mut pos = ranges.len();
        loop {
            if pos == 0 {
                return samples;
            }
            pos -= 1;
            indices[pos] += 1;
            if indices[pos] < per_range_values[pos].len() {
                break;
            }
            indices[pos] = 0;
        }
    }
}

/// Every combination of each parameter at its min or max (2^K tuples).
fn corner_samples(ranges: &[ParameterRange]) -> Vec<ConfigMap> {
    let k = ranges.len();
    if k == 0 || k > 16 {
        return Vec::new();
    }
    let mut corners = Vec::with_capacity(1 << k);
    for mask in 0..(1u32 << k) {
        let mut sample = ConfigMap::new();
        for (i, range) in ranges.iter().enumerate() {
            let value = if mask & (1 << i) == 0 {
                range.min_value
            } else {
                range.max_value
            };
            sample.insert(range.name.clone(), range.round(value));
        }
        corners.push(sample);
    }
    corners
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Result of evaluating one parameter tuple.
#[derive(Clone, Debug)]
pub struct SampleResult {
    pub parameters: ConfigMap,
    pub metrics: Option<PerformanceMetrics>,
    pub objective_value: f64,
    pub trades_count: usize,
    pub error: Option<String>,
    pub is_best: bool,
}

/// Monte-Carlo optimizer. Candles are loaded once by the caller and shared
/// across samples.
pub struct MonteCarloOptimizer {
    seed: u64,
}

impl MonteCarloOptimizer {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Evaluate the sampled tuples and return results ranked by objective,
    /// best first, with exactly one `is_best` among non-errored samples.
    pub async fn run(
        &self,
        registry: &StrategyRegistry,
        config: &OptimizationConfig,
        candles: &[Candle],
        cancel: Option<&AtomicBool>,
        mut on_progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<Vec<SampleResult>, BacktestError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let samples = generate_samples(&config.parameter_ranges, config.num_samples, &mut rng);
        let total = samples.len();

        let mut results: Vec<SampleResult> = Vec::with_capacity(total);
        for (i, parameters) in samples.into_iter().enumerate() {
            if let Some(flag) = cancel {
                if flag.load(std::sync::atomic::Ordering::SeqCst) {
                    return Err(BacktestError::Cancelled);
                }
            }

            let bt_config = config.backtest.clone().with_config(parameters.clone());
            let engine = BacktestEngine::new(bt_config);
            let result = match engine.run(registry, candles, cancel, None) {
                Ok(run) => SampleResult {
                    objective_value: config.objective_metric.objective_value(&run.metrics),
                    trades_count: run.trades.len(),
                    metrics: Some(run.metrics),
                    parameters,
                    error: None,
                    is_best: false,
                },
                Err(BacktestError::Cancelled) => return Err(BacktestError::Cancelled),
                Err(err) => {
                    debug!(%err, "optimization sample failed");
                    SampleResult {
                        parameters,
                        metrics: None,
                        objective_value: f64::NEG_INFINITY,
                        trades_count: 0,
                        error: Some(err.to_string()),
                        is_best: false,
                    }
                }
            };
            results.push(result);

            if let Some(cb) = on_progress.as_mut() {
                cb(i + 1, total);
            }
            // Keep the host responsive between samples.
            tokio::task::yield_now().await;
        }

        results.sort_by(|a, b| {
            b.objective_value
                .partial_cmp(&a.objective_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(best) = results.iter_mut().find(|r| r.error.is_none()) {
            best.is_best = true;
        }

        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Heatmap aggregation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub x: f64,
    pub y: f64,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapData {
    pub param_x: String,
    pub param_y: String,
    pub x_values: Vec<f64>,
    pub y_values: Vec<f64>,
    pub cells: Vec<HeatmapCell>,
    pub best: Option<HeatmapCell>,
    pub metric: String,
}

/// Group completed samples by `(x, y)`; cell value is the mean of the chosen
/// metric. Errored samples never contribute.
pub fn heatmap(
    results: &[SampleResult],
    param_x: &str,
    param_y: &str,
    metric: ObjectiveMetric,
) -> HeatmapData {
    use std::collections::BTreeMap;

    // Keyed by display string so float cells group deterministically.
    let mut grouped: BTreeMap<(String, String), (f64, f64, f64, usize)> = BTreeMap::new();

    for result in results {
        if result.error.is_some() {
            continue;
        }
        let (Some(&x), Some(&y)) = (
            result.parameters.get(param_x),
            result.parameters.get(param_y),
        ) else {
            continue;
        };
        let Some(metrics) = &result.metrics else {
            continue;
        };
        let value = metric.extract(metrics);
        let entry = grouped
            .entry((x.to_string(), y.to_string()))
            .or_insert((x, y, 0.0, 0));
        entry.2 += value;
        entry.3 += 1;
    }

    let mut x_values: Vec<f64> = Vec::new();
    let mut y_values: Vec<f64> = Vec::new();
    let mut cells = Vec::with_capacity(grouped.len());
    let mut best: Option<HeatmapCell> = None;

    for (_, (x, y, sum, count)) in grouped {
        let value = sum / count as f64;
        if !x_values.contains(&x) {
            x_values.push(x);
        }
        if !y_values.contains(&y) {
            y_values.push(y);
        }
        let cell = HeatmapCell { x, y, value };
        if best.as_ref().map(|b| value > b.value).unwrap_or(true) {
            best = Some(cell.clone());
        }
        cells.push(cell);
    }

    x_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    y_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    HeatmapData {
        param_x: param_x.to_string(),
        param_y: param_y.to_string(),
        x_values,
        y_values,
        cells,
        best,
        metric: metric.as_str().to_string(),
    }
}
