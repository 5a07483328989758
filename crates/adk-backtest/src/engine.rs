//! Deterministic replay engine.
//!
//! Pipeline per candle:
//! 1. try pending orders against this candle (market orders emitted on the
//!    previous bar fill at this bar's open)
//! 2. re-mark positions at the close, record the equity point
//! 3. sync the strategy context, invoke `on_market_data`
//! 4. queue any emitted order for the next candle
//!
//! A cancel flag is polled between candles; cancellation writes no partial
//! artifacts. At the end open positions are force-closed at the last close
//! and recorded as completed trades.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use adk_schemas::{
    validate_candle_series, Candle, OrderRequest, RiskLimits, Signal, StrategyContext,
};
use adk_strategy::StrategyRegistry;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::metrics::{calculate_metrics, PerformanceMetrics};
use crate::simulator::{OrderSimulator, SimContext};
use crate::types::{BacktestConfig, BacktestError, EquityPoint, TradeResult};

/// Output of one replay.
#[derive(Clone, Debug)]
pub struct BacktestRun {
    pub metrics: PerformanceMetrics,
    pub trades: Vec<TradeResult>,
    pub equity_curve: Vec<EquityPoint>,
}

struct OpenTrade {
    entry_price_micros: i64,
    quantity: i64,
    entry_time: DateTime<Utc>,
}

/// The backtest engine. One instance per run.
pub struct BacktestEngine {
    config: BacktestConfig,
    simulator: OrderSimulator,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        let simulator = OrderSimulator::new(config.slippage_bps, config.commission_micros);
        Self { config, simulator }
    }

    /// Replay the strategy over `candles`.
    pub fn run(
        &self,
        registry: &StrategyRegistry,
        candles: &[Candle],
        cancel: Option<&AtomicBool>,
        mut on_progress: Option<&mut dyn FnMut(u8)>,
    ) -> Result<BacktestRun, BacktestError> {
        self.config.validate()?;
        if candles.is_empty() {
            return Err(BacktestError::NoData);
        }
        validate_candle_series(candles)?;

        let mut strategy = registry
            .instantiate_configured(&self.config.strategy_name, &self.config.strategy_config)
            .map_err(|_| BacktestError::UnknownStrategy(self.config.strategy_name.clone()))?;

        // Permissive limits: the backtest measures the signal, not the gate.
        let limits = RiskLimits::permissive();
        let mut strategy_ctx = StrategyContext::new(
            self.config.strategy_name.clone(),
            "backtest",
            "backtest",
            self.config.initial_capital_micros,
            &limits,
            true,
        );

        let mut sim = SimContext::new(self.config.initial_capital_micros);
        strategy.on_start();

        let mut pending: Vec<OrderRequest> = Vec::new();
        let mut open_trades: BTreeMap<String, OpenTrade> = BTreeMap::new();
        let mut completed: Vec<TradeResult> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut equity_micros: Vec<i64> = Vec::new();
        let mut peak = self.config.initial_capital_micros;

        let total = candles.len();
        for (i, candle) in candles.iter().enumerate() {
            if let Some(flag) = cancel {
                if flag.load(Ordering::SeqCst) {
                    return Err(BacktestError::Cancelled);
                }
            }

            // 1. Pending orders meet this candle.
            let mut still_pending = Vec::new();
            for order in pending.drain(..) {
                match self.simulator.execute_order(&order, candle, &sim) {
                    Some(fill) => {
                        let realized = self.simulator.process_fill(&fill, &mut sim);
                        self.track_trade(&fill.order, fill.fill_price_micros, fill.fill_quantity,
                            fill.fill_time, realized, &mut open_trades, &mut completed);
                    }
                    // Market orders always fill; resting limit/stop orders
                    // wait for a triggering candle.
                    None if order.order_type != adk_schemas::OrderType::Market => {
                        still_pending.push(order);
                    }
                    None => {
                        debug!(symbol = %order.symbol, "market order dropped: unaffordable");
                    }
                }
            }
            pending = still_pending;

            // 2. Mark to the close, record equity.
            let mut marks = BTreeMap::new();
            marks.insert(self.config.symbol.clone(), candle.close_micros);
            sim.update_unrealized(&marks);
            let equity = sim.total_equity_micros();
            if equity > peak {
                peak = equity;
            }
            let drawdown_percent = if peak > 0 {
                (peak - equity) as f64 / peak as f64 * 100.0
            } else {
                0.0
            };
            equity_curve.push(EquityPoint {
                ts: candle.ts,
                equity_micros: equity,
                drawdown_percent,
            });
            equity_micros.push(equity);

            // 3. Let the strategy see the closed bar.
            self.sync_context(&mut strategy_ctx, &sim, candle.close_micros);
            let tick = candle.to_tick(&self.config.symbol, &self.config.exchange);
            if let Some(order) = strategy.on_market_data(&strategy_ctx, &tick) {
                pending.push(order);
            }

            if let Some(cb) = on_progress.as_mut() {
                cb((((i + 1) * 100) / total) as u8);
            }
        }

        // 5. Force-close at the last candle's close.
        let last = candles.last().expect("candles checked non-empty");
        let symbols: Vec<String> = sim.positions.keys().cloned().collect();
        for symbol in symbols {
            if let Some(pnl) = self
                .simulator
                .close_position(&symbol, last.close_micros, last.ts, &mut sim)
            {
                if let Some(open) = open_trades.remove(&symbol) {
                    completed.push(TradeResult {
                        entry_price_micros: open.entry_price_micros,
                        exit_price_micros: Some(last.close_micros),
                        quantity: open.quantity,
                        entry_time: open.entry_time,
                        exit_time: Some(last.ts),
                        pnl_micros: pnl,
                        pnl_percent: pnl_percent(open.entry_price_micros, last.close_micros),
                        is_open: false,
                    });
                }
            }
        }

        strategy.on_stop();

        let start = candles.first().map(|c| c.ts).unwrap_or_else(Utc::now);
        let metrics = calculate_metrics(
            &completed,
            &equity_micros,
            start,
            last.ts,
            self.config.initial_capital_micros,
        );

        Ok(BacktestRun {
            metrics,
            trades: completed,
            equity_curve,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn track_trade(
        &self,
        order: &OrderRequest,
        fill_price_micros: i64,
        fill_quantity: i64,
        fill_time: DateTime<Utc>,
        realized: Option<i64>,
        open_trades: &mut BTreeMap<String, OpenTrade>,
        completed: &mut Vec<TradeResult>,
    ) {
        match order.signal {
            Signal::Buy => {
                open_trades
                    .entry(order.symbol.clone())
                    .or_insert_with(|| OpenTrade {
                        entry_price_micros: fill_price_micros,
                        quantity: fill_quantity,
                        entry_time: fill_time,
                    });
            }
            Signal::Sell | Signal::ExitLong => {
                if let (Some(pnl), Some(open)) = (realized, open_trades.remove(&order.symbol)) {
                    completed.push(TradeResult {
                        entry_price_micros: open.entry_price_micros,
                        exit_price_micros: Some(fill_price_micros),
                        quantity: open.quantity,
                        entry_time: open.entry_time,
                        exit_time: Some(fill_time),
                        pnl_micros: pnl,
                        pnl_percent: pnl_percent(open.entry_price_micros, fill_price_micros),
                        is_open: false,
                    });
                }
            }
            Signal::ExitShort => {}
        }
    }

    fn sync_context(&self, ctx: &mut StrategyContext, sim: &SimContext, mark_micros: i64) {
        ctx.positions = sim
            .positions
            .values()
            .map(|p| adk_schemas::Position {
                symbol: p.symbol.clone(),
                exchange: p.exchange.clone(),
                quantity: p.quantity,
                avg_price_micros: p.avg_price_micros,
                last_price_micros: mark_micros,
                pnl_micros: p.unrealized_at(mark_micros),
            })
            .collect();
        ctx.realized_pnl_micros = sim.realized_pnl_micros;
        ctx.unrealized_pnl_micros = sim.unrealized_pnl_micros;
        ctx.total_pnl_micros = sim
            .realized_pnl_micros
            .saturating_add(sim.unrealized_pnl_micros);
        ctx.today_pnl_micros = ctx.total_pnl_micros;
    }
}

fn pnl_percent(entry_micros: i64, exit_micros: i64) -> f64 {
    if entry_micros == 0 {
        return 0.0;
    }
    (exit_micros - entry_micros) as f64 / entry_micros as f64 * 100.0
}
