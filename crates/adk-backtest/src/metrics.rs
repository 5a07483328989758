//! Performance metrics over completed trades and the equity curve.
//!
//! Money stays in micros until a ratio is needed; Sharpe/Sortino/CAGR use
//! floating statistics on per-point returns.

use adk_schemas::micros_to_f64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TradeResult;

/// Annual risk-free rate used by Sharpe/Sortino.
const RISK_FREE_RATE: f64 = 0.05;
/// Trading days per year for annualization.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;
/// Documented cap standing in for an infinite profit factor / Sortino.
pub const PROFIT_FACTOR_CAP: f64 = 999.0;

/// Complete metric set for one backtest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return_micros: i64,
    pub total_return_percent: f64,
    pub cagr: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub avg_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_trade_duration_secs: i64,
    pub final_capital_micros: i64,
    pub max_capital_micros: i64,
}

/// Compute every metric from completed trades and the raw equity series.
pub fn calculate_metrics(
    trades: &[TradeResult],
    equity_curve_micros: &[i64],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    initial_capital_micros: i64,
) -> PerformanceMetrics {
    let final_capital_micros = equity_curve_micros
        .last()
        .copied()
        .unwrap_or(initial_capital_micros);
    let max_capital_micros = equity_curve_micros
        .iter()
        .copied()
        .max()
        .unwrap_or(initial_capital_micros);

    let total_return_micros = final_capital_micros - initial_capital_micros;
    let total_return_percent = if initial_capital_micros != 0 {
        total_return_micros as f64 / initial_capital_micros as f64 * 100.0
    } else {
        0.0
    };

    let years = years_between(start, end);
    let cagr = calculate_cagr(initial_capital_micros, final_capital_micros, years);

    let returns = point_returns(equity_curve_micros);
    let sharpe_ratio = sharpe(&returns);
    let sortino_ratio = sortino(&returns);

    let (max_drawdown, avg_drawdown) = drawdowns(equity_curve_micros);
    let calmar_ratio = if max_drawdown == 0.0 {
        0.0
    } else {
        cagr / max_drawdown
    };

    let winners = trades.iter().filter(|t| t.is_winner()).count();
    let losers = trades.len() - winners;
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        winners as f64 / trades.len() as f64 * 100.0
    };

    PerformanceMetrics {
        total_return_micros,
        total_return_percent,
        cagr,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        max_drawdown,
        avg_drawdown,
        win_rate,
        profit_factor: profit_factor(trades),
        total_trades: trades.len(),
        winning_trades: winners,
        losing_trades: losers,
        avg_trade_duration_secs: avg_trade_duration(trades),
        final_capital_micros,
        max_capital_micros,
    }
}

fn years_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let days = (end - start).num_days() as f64;
    (days / 365.25).max(0.01)
}

/// CAGR% = ((final/initial)^(1/years) - 1) * 100.
fn calculate_cagr(initial_micros: i64, final_micros: i64, years: f64) -> f64 {
    if initial_micros <= 0 || years <= 0.0 {
        return 0.0;
    }
    let ratio = final_micros as f64 / initial_micros as f64;
    if ratio <= 0.0 {
        return -100.0;
    }
    (ratio.powf(1.0 / years) - 1.0) * 100.0
}

/// Successive relative returns across equity points.
fn point_returns(equity_micros: &[i64]) -> Vec<f64> {
    equity_micros
        .windows(2)
        .filter(|w| w[0] != 0)
        .map(|w| (w[1] - w[0]) as f64 / w[0] as f64)
        .collect()
}

/// Sharpe = (mean - rf_daily) / stdev * sqrt(252); 0 with < 2 samples or
/// zero deviation. Sample stdev (n - 1).
fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let rf_daily = RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    (mean - rf_daily) / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Sortino: same numerator, denominator is the root-mean-square of negative
/// returns only. No negative returns: 0 when mean <= rf, else the cap.
fn sortino(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let rf_daily = RISK_FREE_RATE / TRADING_DAYS_PER_YEAR;

    let negative: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if negative.is_empty() {
        return if mean <= rf_daily { 0.0 } else { PROFIT_FACTOR_CAP };
    }
    let downside_variance = negative.iter().map(|r| r * r).sum::<f64>() / negative.len() as f64;
    let downside_dev = downside_variance.sqrt();
    if downside_dev == 0.0 {
        return 0.0;
    }
    (mean - rf_daily) / downside_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Max and mean drawdown percent from the running peak.
fn drawdowns(equity_micros: &[i64]) -> (f64, f64) {
    if equity_micros.is_empty() {
        return (0.0, 0.0);
    }
    let mut peak = equity_micros[0];
    let mut dds = Vec::with_capacity(equity_micros.len());
    for &equity in equity_micros {
        if equity > peak {
            peak = equity;
        }
        if peak > 0 {
            dds.push((peak - equity) as f64 / peak as f64 * 100.0);
        }
    }
    if dds.is_empty() {
        return (0.0, 0.0);
    }
    let max = dds.iter().copied().fold(0.0f64, f64::max);
    let avg = dds.iter().sum::<f64>() / dds.len() as f64;
    (max, avg)
}

/// Gross profit / |gross loss|; cap when there are winners and no losers,
/// 0 otherwise.
fn profit_factor(trades: &[TradeResult]) -> f64 {
    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.is_winner())
        .map(|t| micros_to_f64(t.pnl_micros))
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| !t.is_winner())
        .map(|t| micros_to_f64(t.pnl_micros))
        .sum::<f64>()
        .abs();

    if gross_loss == 0.0 {
        return if gross_profit > 0.0 { PROFIT_FACTOR_CAP } else { 0.0 };
    }
    gross_profit / gross_loss
}

/// Mean (exit - entry) across completed trades, integer seconds.
fn avg_trade_duration(trades: &[TradeResult]) -> i64 {
    let durations: Vec<i64> = trades
        .iter()
        .filter_map(|t| t.exit_time.map(|exit| (exit - t.entry_time).num_seconds()))
        .collect();
    if durations.is_empty() {
        return 0;
    }
    durations.iter().sum::<i64>() / durations.len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_schemas::MICROS_SCALE;
    use chrono::TimeZone;

    fn trade(pnl_rupees: i64, duration_secs: i64) -> TradeResult {
        let entry = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        TradeResult {
            entry_price_micros: 100 * MICROS_SCALE,
            exit_price_micros: Some(100 * MICROS_SCALE + pnl_rupees * MICROS_SCALE),
            quantity: 1,
            entry_time: entry,
            exit_time: Some(entry + chrono::Duration::seconds(duration_secs)),
            pnl_micros: pnl_rupees * MICROS_SCALE,
            pnl_percent: pnl_rupees as f64,
            is_open: false,
        }
    }

    fn dt(days: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + days * 86_400, 0).unwrap()
    }

    #[test]
    fn total_return_and_final_capital() {
        let initial = 100_000 * MICROS_SCALE;
        let curve = vec![initial, initial + 5_000 * MICROS_SCALE];
        let m = calculate_metrics(&[], &curve, dt(0), dt(30), initial);
        assert_eq!(m.total_return_micros, 5_000 * MICROS_SCALE);
        assert!((m.total_return_percent - 5.0).abs() < 1e-9);
        assert_eq!(m.final_capital_micros, curve[1]);
        assert_eq!(m.max_capital_micros, curve[1]);
    }

    #[test]
    fn sharpe_zero_for_flat_or_short_series() {
        assert_eq!(sharpe(&[]), 0.0);
        assert_eq!(sharpe(&[0.01]), 0.0);
        assert_eq!(sharpe(&[0.01, 0.01, 0.01]), 0.0); // zero deviation
    }

    #[test]
    fn sortino_caps_when_no_negative_returns_and_mean_beats_rf() {
        let returns = vec![0.01, 0.02, 0.015];
        assert_eq!(sortino(&returns), PROFIT_FACTOR_CAP);
        // Mean below the daily risk-free rate: 0.
        let tiny = vec![0.00001, 0.00001];
        assert_eq!(sortino(&tiny), 0.0);
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        // 100 -> 120 -> 90 -> 110: max dd = (120-90)/120 = 25%.
        let curve = vec![100, 120, 90, 110];
        let (max, avg) = drawdowns(&curve);
        assert!((max - 25.0).abs() < 1e-9);
        assert!(avg > 0.0 && avg < max);
    }

    #[test]
    fn calmar_zero_when_no_drawdown() {
        let initial = 100_000 * MICROS_SCALE;
        let curve = vec![initial, initial + MICROS_SCALE];
        let m = calculate_metrics(&[], &curve, dt(0), dt(365), initial);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.calmar_ratio, 0.0);
    }

    #[test]
    fn win_rate_and_profit_factor() {
        let trades = vec![trade(10, 60), trade(-5, 120), trade(20, 180)];
        let initial = 100_000 * MICROS_SCALE;
        let m = calculate_metrics(&trades, &[initial], dt(0), dt(10), initial);
        assert!((m.win_rate - 200.0 / 3.0).abs() < 1e-9);
        assert!((m.profit_factor - 6.0).abs() < 1e-9);
        assert_eq!(m.total_trades, 3);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert_eq!(m.avg_trade_duration_secs, 120);
    }

    #[test]
    fn profit_factor_sentinels() {
        assert_eq!(profit_factor(&[trade(10, 1)]), PROFIT_FACTOR_CAP);
        assert_eq!(profit_factor(&[trade(-10, 1)]), 0.0);
        assert_eq!(profit_factor(&[]), 0.0);
    }

    #[test]
    fn cagr_doubling_in_one_year() {
        let initial = 100 * MICROS_SCALE;
        let cagr = calculate_cagr(initial, 2 * initial, 1.0);
        assert!((cagr - 100.0).abs() < 1e-9);
    }

    #[test]
    fn years_floor_avoids_division_blowup() {
        assert_eq!(years_between(dt(0), dt(0)), 0.01);
    }
}
