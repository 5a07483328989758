//! Order execution simulation against historical candles.
//!
//! Fill rules:
//! - MARKET fills at the fill candle's open with adverse slippage (the
//!   engine hands orders the candle *after* the one that produced them)
//! - LIMIT BUY fills at the limit when `low <= limit`; LIMIT SELL when
//!   `high >= limit`
//! - STOP variants trigger when price crosses the trigger adversely and
//!   fill at the trigger (slippage applied for the market variant)
//! - a BUY the cash cannot cover is downscaled to the affordable integer
//!   quantity, or dropped when even one unit is unaffordable

use std::collections::BTreeMap;

use adk_schemas::{Candle, OrderRequest, OrderType, Signal, BPS_SCALE};
use chrono::{DateTime, Utc};

/// A position tracked during simulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimPosition {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price_micros: i64,
    pub entry_time: DateTime<Utc>,
}

impl SimPosition {
    pub fn unrealized_at(&self, price_micros: i64) -> i64 {
        ((price_micros as i128 - self.avg_price_micros as i128) * self.quantity as i128)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// Simulation accounting state.
#[derive(Clone, Debug)]
pub struct SimContext {
    pub initial_capital_micros: i64,
    /// Cash on hand.
    pub capital_micros: i64,
    pub positions: BTreeMap<String, SimPosition>,
    pub realized_pnl_micros: i64,
    pub unrealized_pnl_micros: i64,
    pub peak_equity_micros: i64,
    pub trades_count: u64,
}

impl SimContext {
    pub fn new(initial_capital_micros: i64) -> Self {
        Self {
            initial_capital_micros,
            capital_micros: initial_capital_micros,
            positions: BTreeMap::new(),
            realized_pnl_micros: 0,
            unrealized_pnl_micros: 0,
            peak_equity_micros: initial_capital_micros,
            trades_count: 0,
        }
    }

    /// Cash plus open unrealized PnL plus position cost basis.
    pub fn total_equity_micros(&self) -> i64 {
        let basis: i64 = self
            .positions
            .values()
            .map(|p| {
                ((p.avg_price_micros as i128 * p.quantity as i128)
                    .clamp(i64::MIN as i128, i64::MAX as i128)) as i64
            })
            .sum();
        self.capital_micros
            .saturating_add(basis)
            .saturating_add(self.unrealized_pnl_micros)
    }

    /// Cash available for new buys.
    pub fn available_capital_micros(&self) -> i64 {
        self.capital_micros
    }

    /// Re-mark every position and refresh the peak.
    pub fn update_unrealized(&mut self, marks: &BTreeMap<String, i64>) {
        let mut total = 0i64;
        for (symbol, position) in &self.positions {
            if let Some(&mark) = marks.get(symbol) {
                total = total.saturating_add(position.unrealized_at(mark));
            }
        }
        self.unrealized_pnl_micros = total;
        let equity = self.total_equity_micros();
        if equity > self.peak_equity_micros {
            self.peak_equity_micros = equity;
        }
    }
}

/// A simulated fill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fill {
    pub order: OrderRequest,
    pub fill_price_micros: i64,
    pub fill_quantity: i64,
    pub fill_time: DateTime<Utc>,
    pub commission_micros: i64,
}

/// Deterministic order simulator.
#[derive(Clone, Debug)]
pub struct OrderSimulator {
    slippage_bps: i64,
    commission_micros: i64,
}

impl OrderSimulator {
    pub fn new(slippage_bps: i64, commission_micros: i64) -> Self {
        Self {
            slippage_bps,
            commission_micros,
        }
    }

    /// Attempt to execute `order` against `candle`. Returns `None` when the
    /// order does not trigger on this candle or cannot be funded.
    pub fn execute_order(
        &self,
        order: &OrderRequest,
        candle: &Candle,
        ctx: &SimContext,
    ) -> Option<Fill> {
        if order.quantity <= 0 {
            return None;
        }
        let (raw_price, with_slippage) = self.determine_fill_price(order, candle)?;
        let fill_price = if with_slippage {
            self.apply_slippage(raw_price, order.signal)
        } else {
            raw_price
        };

        let mut quantity = order.quantity;
        if matches!(order.signal, Signal::Buy) {
            let required = fill_price as i128 * quantity as i128;
            let available = ctx.available_capital_micros() as i128;
            if required > available {
                let affordable = (available / fill_price.max(1) as i128) as i64;
                if affordable < 1 {
                    return None;
                }
                quantity = affordable;
            }
        }

        Some(Fill {
            order: order.clone(),
            fill_price_micros: fill_price,
            fill_quantity: quantity,
            fill_time: candle.ts,
            commission_micros: self.commission_micros,
        })
    }

    /// (price, apply_slippage) per order type, or None when not triggered.
    fn determine_fill_price(&self, order: &OrderRequest, candle: &Candle) -> Option<(i64, bool)> {
        match order.order_type {
            OrderType::Market => Some((candle.open_micros, true)),
            OrderType::Limit => {
                let limit = order.price_micros?;
                match order.signal {
                    Signal::Buy | Signal::ExitShort => {
                        (candle.low_micros <= limit).then_some((limit, false))
                    }
                    Signal::Sell | Signal::ExitLong => {
                        (candle.high_micros >= limit).then_some((limit, false))
                    }
                }
            }
            OrderType::StopLoss | OrderType::StopLossMarket => {
                let slip = order.order_type == OrderType::StopLossMarket;
                let Some(trigger) = order.price_micros else {
                    // Trigger-less stop degrades to a market fill.
                    return Some((candle.open_micros, true));
                };
                match order.signal {
                    // Long protection: sell once price falls to the trigger.
                    Signal::Sell | Signal::ExitLong => {
                        (candle.low_micros <= trigger).then_some((trigger, slip))
                    }
                    // Short protection: buy once price rises to the trigger.
                    Signal::Buy | Signal::ExitShort => {
                        (candle.high_micros >= trigger).then_some((trigger, slip))
                    }
                }
            }
        }
    }

    /// Adverse slippage: buys fill at `price * (1 + s)`, sells at
    /// `price / (1 + s)`.
    fn apply_slippage(&self, price_micros: i64, signal: Signal) -> i64 {
        if self.slippage_bps == 0 {
            return price_micros;
        }
        let scale = BPS_SCALE as i128;
        let slip = self.slippage_bps as i128;
        let price = price_micros as i128;
        let adjusted = match signal {
            Signal::Buy | Signal::ExitShort => price * (scale + slip) / scale,
            Signal::Sell | Signal::ExitLong => price * scale / (scale + slip),
        };
        adjusted.clamp(0, i64::MAX as i128) as i64
    }

    /// Apply a fill to the accounting state. Returns realized PnL when the
    /// fill reduced or closed a position.
    pub fn process_fill(&self, fill: &Fill, ctx: &mut SimContext) -> Option<i64> {
        let order = &fill.order;
        let symbol = order.symbol.clone();
        let notional = (fill.fill_price_micros as i128 * fill.fill_quantity as i128)
            .clamp(0, i64::MAX as i128) as i64;

        match order.signal {
            Signal::Buy => {
                match ctx.positions.get_mut(&symbol) {
                    Some(position) if position.quantity < 0 => {
                        // Covering a short.
                        let closing = fill.fill_quantity.min(-position.quantity);
                        let pnl = (position.avg_price_micros as i128
                            - fill.fill_price_micros as i128)
                            * closing as i128;
                        let realized = pnl.clamp(i64::MIN as i128, i64::MAX as i128) as i64
                            - fill.commission_micros;
                        position.quantity += fill.fill_quantity;
                        if position.quantity >= 0 {
                            ctx.positions.remove(&symbol);
                        }
                        ctx.capital_micros = ctx.capital_micros.saturating_sub(notional);
                        ctx.realized_pnl_micros = ctx.realized_pnl_micros.saturating_add(realized);
                        return Some(realized);
                    }
                    Some(position) => {
                        // Averaging up an existing long.
                        let total_cost = position.avg_price_micros as i128
                            * position.quantity as i128
                            + fill.fill_price_micros as i128 * fill.fill_quantity as i128;
                        let new_qty = position.quantity + fill.fill_quantity;
                        position.avg_price_micros = if new_qty > 0 {
                            (total_cost / new_qty as i128) as i64
                        } else {
                            0
                        };
                        position.quantity = new_qty;
                    }
                    None => {
                        ctx.positions.insert(
                            symbol.clone(),
                            SimPosition {
                                symbol,
                                exchange: order.exchange.clone(),
                                quantity: fill.fill_quantity,
                                avg_price_micros: fill.fill_price_micros,
                                entry_time: fill.fill_time,
                            },
                        );
                        ctx.trades_count += 1;
                    }
                }
                ctx.capital_micros = ctx
                    .capital_micros
                    .saturating_sub(notional)
                    .saturating_sub(fill.commission_micros);
                None
            }
            Signal::Sell | Signal::ExitLong => {
                let position = ctx.positions.get_mut(&symbol)?;
                if position.quantity <= 0 {
                    return None;
                }
                let closing = fill.fill_quantity.min(position.quantity);
                let pnl = (fill.fill_price_micros as i128 - position.avg_price_micros as i128)
                    * closing as i128;
                let realized = pnl.clamp(i64::MIN as i128, i64::MAX as i128) as i64
                    - fill.commission_micros;

                position.quantity -= fill.fill_quantity;
                if position.quantity <= 0 {
                    ctx.positions.remove(&symbol);
                }
                ctx.capital_micros = ctx
                    .capital_micros
                    .saturating_add(notional)
                    .saturating_sub(fill.commission_micros);
                ctx.realized_pnl_micros = ctx.realized_pnl_micros.saturating_add(realized);
                Some(realized)
            }
            Signal::ExitShort => {
                let position = ctx.positions.get_mut(&symbol)?;
                if position.quantity >= 0 {
                    return None;
                }
                let closing = fill.fill_quantity.min(-position.quantity);
                let pnl = (position.avg_price_micros as i128 - fill.fill_price_micros as i128)
                    * closing as i128;
                let realized = pnl.clamp(i64::MIN as i128, i64::MAX as i128) as i64
                    - fill.commission_micros;

                position.quantity += fill.fill_quantity;
                if position.quantity >= 0 {
                    ctx.positions.remove(&symbol);
                }
                ctx.capital_micros = ctx.capital_micros.saturating_sub(notional);
                ctx.realized_pnl_micros = ctx.realized_pnl_micros.saturating_add(realized);
                Some(realized)
            }
        }
    }

    /// Force-close one position at `price_micros`. Returns realized PnL.
    pub fn close_position(
        &self,
        symbol: &str,
        price_micros: i64,
        ts: DateTime<Utc>,
        ctx: &mut SimContext,
    ) -> Option<i64> {
        let position = ctx.positions.remove(symbol)?;
        let pnl = ((price_micros as i128 - position.avg_price_micros as i128)
            * position.quantity as i128)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        let notional = (price_micros as i128 * position.quantity.abs() as i128)
            .clamp(0, i64::MAX as i128) as i64;
        if position.quantity > 0 {
            ctx.capital_micros = ctx.capital_micros.saturating_add(notional);
        } else {
            ctx.capital_micros = ctx.capital_micros.saturating_sub(notional);
        }
        ctx.realized_pnl_micros = ctx.realized_pnl_micros.saturating_add(pnl);
        let _ = ts;
        Some(pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_schemas::{micros_from_f64, MICROS_SCALE};
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            open_micros: micros_from_f64(open),
            high_micros: micros_from_f64(high),
            low_micros: micros_from_f64(low),
            close_micros: micros_from_f64(close),
            volume: 1_000,
        }
    }

    fn buy(qty: i64) -> OrderRequest {
        OrderRequest::market("SBIN", "NSE", Signal::Buy, qty).with_stop_loss(micros_from_f64(95.0))
    }

    fn ctx() -> SimContext {
        SimContext::new(100_000 * MICROS_SCALE)
    }

    // --- fill pricing ---

    #[test]
    fn market_buy_fills_at_open_with_adverse_slippage() {
        let sim = OrderSimulator::new(5, 0); // 0.05%
        let fill = sim
            .execute_order(&buy(10), &candle(100.0, 101.0, 99.0, 100.5), &ctx())
            .unwrap();
        // 100 * 1.0005 = 100.05
        assert_eq!(fill.fill_price_micros, micros_from_f64(100.05));
        assert_eq!(fill.fill_quantity, 10);
    }

    #[test]
    fn market_sell_slips_downward() {
        let sim = OrderSimulator::new(5, 0);
        let mut ctx = ctx();
        // Seed a long so the sell realizes.
        let entry = sim
            .execute_order(&buy(10), &candle(100.0, 101.0, 99.0, 100.5), &ctx)
            .unwrap();
        sim.process_fill(&entry, &mut ctx);

        let sell = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 10);
        let fill = sim
            .execute_order(&sell, &candle(100.0, 101.0, 99.0, 100.5), &ctx)
            .unwrap();
        // 100 / 1.0005 ~= 99.95
        assert!(fill.fill_price_micros < micros_from_f64(100.0));
    }

    #[test]
    fn limit_buy_fills_only_when_low_reaches_limit() {
        let sim = OrderSimulator::new(5, 0);
        let order = OrderRequest::market("SBIN", "NSE", Signal::Buy, 10)
            .with_stop_loss(micros_from_f64(95.0))
            .with_limit_price(micros_from_f64(99.5));

        assert!(sim
            .execute_order(&order, &candle(100.0, 101.0, 99.8, 100.5), &ctx())
            .is_none());

        let fill = sim
            .execute_order(&order, &candle(100.0, 101.0, 99.0, 100.5), &ctx())
            .unwrap();
        // Limit fills carry no slippage.
        assert_eq!(fill.fill_price_micros, micros_from_f64(99.5));
    }

    #[test]
    fn limit_sell_fills_when_high_reaches_limit() {
        let sim = OrderSimulator::new(5, 0);
        let mut order = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 10);
        order.order_type = OrderType::Limit;
        order.price_micros = Some(micros_from_f64(102.0));

        assert!(sim
            .execute_order(&order, &candle(100.0, 101.0, 99.0, 100.5), &ctx())
            .is_none());
        let fill = sim
            .execute_order(&order, &candle(100.0, 102.5, 99.0, 100.5), &ctx())
            .unwrap();
        assert_eq!(fill.fill_price_micros, micros_from_f64(102.0));
    }

    #[test]
    fn stop_market_triggers_adversely_with_slippage() {
        let sim = OrderSimulator::new(10, 0);
        let mut order = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 10);
        order.order_type = OrderType::StopLossMarket;
        order.price_micros = Some(micros_from_f64(98.0));

        // Low stays above the trigger: no fill.
        assert!(sim
            .execute_order(&order, &candle(100.0, 101.0, 99.0, 100.5), &ctx())
            .is_none());

        let fill = sim
            .execute_order(&order, &candle(99.0, 99.5, 97.5, 98.0), &ctx())
            .unwrap();
        // Trigger price with sell-side slippage below it.
        assert!(fill.fill_price_micros < micros_from_f64(98.0));
    }

    #[test]
    fn stop_limit_fills_at_trigger_without_slippage() {
        let sim = OrderSimulator::new(10, 0);
        let mut order = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 10);
        order.order_type = OrderType::StopLoss;
        order.price_micros = Some(micros_from_f64(98.0));

        let fill = sim
            .execute_order(&order, &candle(99.0, 99.5, 97.5, 98.0), &ctx())
            .unwrap();
        assert_eq!(fill.fill_price_micros, micros_from_f64(98.0));
    }

    // --- funding ---

    #[test]
    fn unaffordable_buy_is_downscaled_to_integer_quantity() {
        let sim = OrderSimulator::new(0, 0);
        let mut ctx = ctx();
        ctx.capital_micros = 1_000 * MICROS_SCALE; // 1,000 rupees cash
        let fill = sim
            .execute_order(&buy(100), &candle(300.0, 301.0, 299.0, 300.0), &ctx)
            .unwrap();
        assert_eq!(fill.fill_quantity, 3);
    }

    #[test]
    fn buy_rejected_when_even_one_unit_unaffordable() {
        let sim = OrderSimulator::new(0, 0);
        let mut ctx = ctx();
        ctx.capital_micros = 100 * MICROS_SCALE;
        assert!(sim
            .execute_order(&buy(10), &candle(300.0, 301.0, 299.0, 300.0), &ctx)
            .is_none());
    }

    // --- position accounting ---

    #[test]
    fn buy_then_buy_averages_up() {
        let sim = OrderSimulator::new(0, 0);
        let mut ctx = ctx();
        let first = sim
            .execute_order(&buy(10), &candle(100.0, 101.0, 99.0, 100.0), &ctx)
            .unwrap();
        sim.process_fill(&first, &mut ctx);
        let second = sim
            .execute_order(&buy(10), &candle(110.0, 111.0, 109.0, 110.0), &ctx)
            .unwrap();
        sim.process_fill(&second, &mut ctx);

        let position = ctx.positions.get("SBIN").unwrap();
        assert_eq!(position.quantity, 20);
        assert_eq!(position.avg_price_micros, micros_from_f64(105.0));
        // Only the opening fill counts as a new trade.
        assert_eq!(ctx.trades_count, 1);
    }

    #[test]
    fn exit_realizes_pnl_and_removes_flat_position() {
        let sim = OrderSimulator::new(0, 0);
        let mut ctx = ctx();
        let entry = sim
            .execute_order(&buy(10), &candle(100.0, 101.0, 99.0, 100.0), &ctx)
            .unwrap();
        sim.process_fill(&entry, &mut ctx);

        let exit = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 10);
        let fill = sim
            .execute_order(&exit, &candle(110.0, 111.0, 109.0, 110.0), &ctx)
            .unwrap();
        let realized = sim.process_fill(&fill, &mut ctx).unwrap();

        assert_eq!(realized, 100 * MICROS_SCALE); // (110-100) * 10
        assert!(ctx.positions.is_empty());
        assert_eq!(ctx.realized_pnl_micros, 100 * MICROS_SCALE);
        // Cash round-trips: 100k - 1000 + 1100.
        assert_eq!(ctx.capital_micros, 100_100 * MICROS_SCALE);
    }

    #[test]
    fn equity_includes_unrealized() {
        let sim = OrderSimulator::new(0, 0);
        let mut ctx = ctx();
        let entry = sim
            .execute_order(&buy(10), &candle(100.0, 101.0, 99.0, 100.0), &ctx)
            .unwrap();
        sim.process_fill(&entry, &mut ctx);

        let mut marks = BTreeMap::new();
        marks.insert("SBIN".to_string(), micros_from_f64(105.0));
        ctx.update_unrealized(&marks);

        assert_eq!(ctx.unrealized_pnl_micros, 50 * MICROS_SCALE);
        assert_eq!(
            ctx.total_equity_micros(),
            100_050 * MICROS_SCALE
        );
        assert_eq!(ctx.peak_equity_micros, 100_050 * MICROS_SCALE);
    }
}
