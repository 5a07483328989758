use std::collections::{BTreeMap, VecDeque};

use adk_risk::position_size_from_risk;
use adk_schemas::{
    bps_of_micros, micros_to_f64, pct_to_bps, Interval, MarketTick, OrderRequest, Signal,
    StrategyContext, MICROS_SCALE,
};
use serde_json::{json, Value};

use crate::indicators::{last_rsi, last_sma};
use crate::types::{
    clamp_config, ConfigMap, ConfigurableParam, StateMap, Strategy, StrategyDescriptor,
};

/// SMA + RSI crossover.
///
/// Entry (BUY): fast SMA crosses above slow SMA and RSI is below the
/// overbought level (the RSI filter passes while the RSI window is still
/// warming up). Exit (EXIT_LONG): bearish crossover, or RSI above the
/// overbought level.
pub struct SmaRsiCrossover {
    fast_ma_period: usize,
    slow_ma_period: usize,
    rsi_period: usize,
    rsi_overbought: f64,
    rsi_oversold: f64,
    risk_per_trade_bps: i64,
    stop_loss_bps: i64,
    target_bps: i64,

    max_history: usize,
    price_history: BTreeMap<String, VecDeque<f64>>,
    prev_fast_ma: BTreeMap<String, f64>,
    prev_slow_ma: BTreeMap<String, f64>,
}

impl SmaRsiCrossover {
    pub fn new() -> Self {
        let mut s = Self {
            fast_ma_period: 9,
            slow_ma_period: 21,
            rsi_period: 14,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            risk_per_trade_bps: 200,
            stop_loss_bps: 200,
            target_bps: 400,
            max_history: 0,
            price_history: BTreeMap::new(),
            prev_fast_ma: BTreeMap::new(),
            prev_slow_ma: BTreeMap::new(),
        };
        s.recompute_max_history();
        s
    }

    pub fn default_descriptor() -> StrategyDescriptor {
        StrategyDescriptor {
            name: "sma_rsi_crossover",
            display_name: "SMA RSI Crossover",
            version: "1.0.0",
            description: "Combines SMA crossover with RSI confirmation for filtered entries",
            min_capital_micros: 10_000 * MICROS_SCALE,
            supported_symbols: &[
                "NIFTY50-INDEX",
                "NIFTYBANK-INDEX",
                "RELIANCE",
                "TCS",
                "INFY",
                "HDFCBANK",
                "SBIN",
                "ICICIBANK",
            ],
            interval: Interval::Min15,
        }
    }

    pub fn configurable_params() -> Vec<ConfigurableParam> {
        vec![
            ConfigurableParam::int(
                "fast_ma_period",
                "Fast MA Period",
                9,
                2,
                50,
                "Period for fast moving average",
            ),
            ConfigurableParam::int(
                "slow_ma_period",
                "Slow MA Period",
                21,
                5,
                200,
                "Period for slow moving average",
            ),
            ConfigurableParam::int(
                "rsi_period",
                "RSI Period",
                14,
                5,
                50,
                "Period for RSI calculation",
            ),
            ConfigurableParam::int(
                "rsi_overbought",
                "RSI Overbought",
                70,
                50,
                90,
                "RSI level considered overbought",
            ),
            ConfigurableParam::int(
                "rsi_oversold",
                "RSI Oversold",
                30,
                10,
                50,
                "RSI level considered oversold",
            ),
            ConfigurableParam::float(
                "stop_loss_percent",
                "Stop Loss %",
                2.0,
                0.5,
                10.0,
                "Stop loss percentage per trade",
            ),
            ConfigurableParam::float(
                "target_percent",
                "Target %",
                4.0,
                1.0,
                20.0,
                "Target profit percentage per trade",
            ),
        ]
    }

    fn recompute_max_history(&mut self) {
        self.max_history = self.slow_ma_period.max(self.rsi_period + 1) + 5;
    }

    fn history_mut(&mut self, symbol: &str) -> &mut VecDeque<f64> {
        self.price_history.entry(symbol.to_string()).or_default()
    }
}

impl Default for SmaRsiCrossover {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for SmaRsiCrossover {
    fn descriptor(&self) -> StrategyDescriptor {
        Self::default_descriptor()
    }

    fn on_market_data(
        &mut self,
        ctx: &StrategyContext,
        tick: &MarketTick,
    ) -> Option<OrderRequest> {
        let symbol = tick.symbol.clone();
        let close = micros_to_f64(tick.close_micros);

        let max_history = self.max_history;
        let slow_ma_period = self.slow_ma_period;
        let history = self.history_mut(&symbol);
        history.push_back(close);
        while history.len() > max_history {
            history.pop_front();
        }

        if history.len() < slow_ma_period {
            return None;
        }
        let closes: Vec<f64> = history.iter().copied().collect();

        let fast = last_sma(&closes, self.fast_ma_period)?;
        let slow = last_sma(&closes, self.slow_ma_period)?;
        // RSI may still be warming up; the filter passes until it exists.
        let rsi = last_rsi(&closes, self.rsi_period);

        let prev_fast = self.prev_fast_ma.insert(symbol.clone(), fast);
        let prev_slow = self.prev_slow_ma.insert(symbol.clone(), slow);
        let (prev_fast, prev_slow) = match (prev_fast, prev_slow) {
            (Some(f), Some(s)) => (f, s),
            _ => return None,
        };

        let bullish_crossover = prev_fast <= prev_slow && fast > slow;
        let bearish_crossover = prev_fast >= prev_slow && fast < slow;

        let position = ctx.get_position(&symbol);

        if bullish_crossover && rsi.map_or(true, |r| r < self.rsi_overbought) && position.is_none()
        {
            let entry = tick.ltp_micros;
            let stop_loss = entry - bps_of_micros(entry, self.stop_loss_bps);
            let target = entry + bps_of_micros(entry, self.target_bps);

            let quantity =
                position_size_from_risk(ctx.capital_micros, self.risk_per_trade_bps, entry, stop_loss);
            if quantity > 0 {
                return Some(
                    OrderRequest::market(symbol, tick.exchange.clone(), Signal::Buy, quantity)
                        .with_stop_loss(stop_loss)
                        .with_target(target)
                        .with_reason(format!(
                            "Bullish crossover + RSI confirmation: fast({fast:.2}) > slow({slow:.2}), RSI={}",
                            rsi.map_or_else(|| "warmup".to_string(), |r| format!("{r:.1}"))
                        )),
                );
            }
        } else if let Some(pos) = position {
            if pos.is_long() {
                let exit_reason = if bearish_crossover {
                    Some(format!(
                        "Bearish crossover: fast({fast:.2}) < slow({slow:.2})"
                    ))
                } else if rsi.is_some_and(|r| r > self.rsi_overbought) {
                    rsi.map(|r| format!("RSI overbought: {r:.1} > {}", self.rsi_overbought))
                } else {
                    None
                };

                if let Some(reason) = exit_reason {
                    return Some(
                        OrderRequest::market(
                            symbol,
                            tick.exchange.clone(),
                            Signal::ExitLong,
                            pos.quantity,
                        )
                        .with_reason(reason),
                    );
                }
            }
        }

        None
    }

    fn apply_config(&mut self, config: &ConfigMap) {
        let resolved = clamp_config(&Self::configurable_params(), config);
        if let Some(&v) = resolved.get("fast_ma_period") {
            self.fast_ma_period = v as usize;
        }
        if let Some(&v) = resolved.get("slow_ma_period") {
            self.slow_ma_period = v as usize;
        }
        if let Some(&v) = resolved.get("rsi_period") {
            self.rsi_period = v as usize;
        }
        if let Some(&v) = resolved.get("rsi_overbought") {
            self.rsi_overbought = v;
        }
        if let Some(&v) = resolved.get("rsi_oversold") {
            self.rsi_oversold = v;
        }
        if let Some(&v) = resolved.get("stop_loss_percent") {
            self.stop_loss_bps = pct_to_bps(v);
        }
        if let Some(&v) = resolved.get("target_percent") {
            self.target_bps = pct_to_bps(v);
        }
        self.recompute_max_history();
    }

    fn get_state(&self) -> StateMap {
        let history: serde_json::Map<String, Value> = self
            .price_history
            .iter()
            .map(|(sym, prices)| (sym.clone(), json!(prices.iter().copied().collect::<Vec<f64>>())))
            .collect();
        let prev_fast: serde_json::Map<String, Value> = self
            .prev_fast_ma
            .iter()
            .map(|(sym, v)| (sym.clone(), json!(v)))
            .collect();
        let prev_slow: serde_json::Map<String, Value> = self
            .prev_slow_ma
            .iter()
            .map(|(sym, v)| (sym.clone(), json!(v)))
            .collect();

        let mut state = StateMap::new();
        state.insert("price_history".to_string(), Value::Object(history));
        state.insert("prev_fast_ma".to_string(), Value::Object(prev_fast));
        state.insert("prev_slow_ma".to_string(), Value::Object(prev_slow));
        state
    }

    fn set_state(&mut self, state: &StateMap) {
        self.price_history.clear();
        self.prev_fast_ma.clear();
        self.prev_slow_ma.clear();

        if let Some(Value::Object(history)) = state.get("price_history") {
            for (sym, prices) in history {
                if let Value::Array(arr) = prices {
                    let deque: VecDeque<f64> =
                        arr.iter().filter_map(Value::as_f64).collect();
                    self.price_history.insert(sym.clone(), deque);
                }
            }
        }
        if let Some(Value::Object(prev)) = state.get("prev_fast_ma") {
            for (sym, v) in prev {
                if let Some(v) = v.as_f64() {
                    self.prev_fast_ma.insert(sym.clone(), v);
                }
            }
        }
        if let Some(Value::Object(prev)) = state.get("prev_slow_ma") {
            for (sym, v) in prev {
                if let Some(v) = v.as_f64() {
                    self.prev_slow_ma.insert(sym.clone(), v);
                }
            }
        }
    }
}
