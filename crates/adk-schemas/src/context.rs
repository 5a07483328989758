use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::money::bps_of_micros;

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// An open position held by one subscription.
///
/// Quantity is signed (positive = long). Invariant: `avg_price_micros > 0`
/// whenever `quantity != 0`. A position whose quantity reaches zero is
/// removed from the context immediately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price_micros: i64,
    pub last_price_micros: i64,
    pub pnl_micros: i64,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.quantity > 0
    }

    /// Unrealized PnL at `price_micros`: `(price - avg) * qty`.
    pub fn unrealized_at(&self, price_micros: i64) -> i64 {
        let v = (price_micros as i128 - self.avg_price_micros as i128) * self.quantity as i128;
        v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Notional value of the position at its average price.
    pub fn market_value_micros(&self) -> i64 {
        let v = self.quantity.unsigned_abs() as i128 * self.avg_price_micros as i128;
        v.min(i64::MAX as i128) as i64
    }
}

// ---------------------------------------------------------------------------
// Risk limits
// ---------------------------------------------------------------------------

/// Risk limits for a subscription run. Immutable after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_drawdown_bps: i64,
    pub daily_loss_limit_micros: i64,
    pub per_trade_sl_bps: i64,
    pub max_positions: usize,
    /// Max order notional as bps of capital. Default 2_000 (20%).
    pub max_order_value_bps: i64,
    /// Max orders allowed per trading day. Default 50.
    pub max_daily_trades: u32,
}

impl RiskLimits {
    /// Limits with platform defaults for the optional knobs.
    pub fn new(
        max_drawdown_bps: i64,
        daily_loss_limit_micros: i64,
        per_trade_sl_bps: i64,
        max_positions: usize,
    ) -> Self {
        Self {
            max_drawdown_bps,
            daily_loss_limit_micros,
            per_trade_sl_bps,
            max_positions,
            max_order_value_bps: 2_000,
            max_daily_trades: 50,
        }
    }

    /// Permissive limits for pure signal testing (backtests).
    /// Large enough not to interfere with strategy evaluation.
    pub fn permissive() -> Self {
        Self {
            max_drawdown_bps: 10_000,
            daily_loss_limit_micros: i64::MAX / 4,
            per_trade_sl_bps: 10_000,
            max_positions: usize::MAX / 2,
            max_order_value_bps: 10_000,
            max_daily_trades: u32::MAX,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy context
// ---------------------------------------------------------------------------

/// Mutable per-runner state shared by reference with the strategy.
///
/// The strategy may read positions and PnL; the runtime owns reconciliation.
/// Risk limits mirrored here are read-only after construction.
///
/// Invariant: `total_pnl_micros == realized_pnl_micros + unrealized_pnl_micros`
/// after every `refresh_unrealized` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyContext {
    pub strategy_id: String,
    pub user_id: String,
    pub subscription_id: String,
    pub capital_micros: i64,
    pub max_positions: usize,
    pub max_drawdown_bps: i64,
    pub daily_loss_limit_micros: i64,
    pub per_trade_sl_bps: i64,
    pub is_paper_trading: bool,
    pub positions: Vec<Position>,
    pub realized_pnl_micros: i64,
    pub unrealized_pnl_micros: i64,
    pub today_pnl_micros: i64,
    pub total_pnl_micros: i64,
}

impl StrategyContext {
    pub fn new(
        strategy_id: impl Into<String>,
        user_id: impl Into<String>,
        subscription_id: impl Into<String>,
        capital_micros: i64,
        limits: &RiskLimits,
        is_paper_trading: bool,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            user_id: user_id.into(),
            subscription_id: subscription_id.into(),
            capital_micros,
            max_positions: limits.max_positions,
            max_drawdown_bps: limits.max_drawdown_bps,
            daily_loss_limit_micros: limits.daily_loss_limit_micros,
            per_trade_sl_bps: limits.per_trade_sl_bps,
            is_paper_trading,
            positions: Vec::new(),
            realized_pnl_micros: 0,
            unrealized_pnl_micros: 0,
            today_pnl_micros: 0,
            total_pnl_micros: 0,
        }
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn get_position_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.symbol == symbol)
    }

    /// Insert or replace the position for `position.symbol`.
    /// A zero-quantity position is removed instead.
    pub fn upsert_position(&mut self, position: Position) {
        self.positions.retain(|p| p.symbol != position.symbol);
        if position.quantity != 0 {
            self.positions.push(position);
        }
    }

    pub fn remove_position(&mut self, symbol: &str) {
        self.positions.retain(|p| p.symbol != symbol);
    }

    /// Recompute per-position and aggregate unrealized PnL from the given
    /// marks, then restore `total = realized + unrealized`.
    pub fn refresh_unrealized(&mut self, marks: &BTreeMap<String, i64>) {
        let mut total_unrealized: i64 = 0;
        for pos in &mut self.positions {
            if let Some(&mark) = marks.get(&pos.symbol) {
                pos.last_price_micros = mark;
                pos.pnl_micros = pos.unrealized_at(mark);
            }
            total_unrealized = total_unrealized.saturating_add(pos.pnl_micros);
        }
        self.unrealized_pnl_micros = total_unrealized;
        self.total_pnl_micros = self.realized_pnl_micros.saturating_add(total_unrealized);
    }

    /// Record realized PnL (also counts toward today's PnL).
    pub fn add_realized(&mut self, pnl_micros: i64) {
        self.realized_pnl_micros = self.realized_pnl_micros.saturating_add(pnl_micros);
        self.today_pnl_micros = self.today_pnl_micros.saturating_add(pnl_micros);
        self.total_pnl_micros = self
            .realized_pnl_micros
            .saturating_add(self.unrealized_pnl_micros);
    }

    /// Max order notional allowed by `max_order_value_bps` of capital.
    pub fn max_order_value_micros(&self, limits: &RiskLimits) -> i64 {
        bps_of_micros(self.capital_micros, limits.max_order_value_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RiskLimits {
        RiskLimits::new(1_000, 5_000_000_000, 200, 5)
    }

    fn position(symbol: &str, qty: i64, avg: i64) -> Position {
        Position {
            symbol: symbol.to_string(),
            exchange: "NSE".to_string(),
            quantity: qty,
            avg_price_micros: avg,
            last_price_micros: avg,
            pnl_micros: 0,
        }
    }

    #[test]
    fn defaults_applied() {
        let l = limits();
        assert_eq!(l.max_order_value_bps, 2_000);
        assert_eq!(l.max_daily_trades, 50);
    }

    #[test]
    fn zero_quantity_position_is_removed_on_upsert() {
        let mut ctx = StrategyContext::new("s", "u", "sub", 1_000_000, &limits(), true);
        ctx.upsert_position(position("SBIN", 10, 500_000_000));
        assert!(ctx.get_position("SBIN").is_some());
        ctx.upsert_position(position("SBIN", 0, 500_000_000));
        assert!(ctx.get_position("SBIN").is_none());
    }

    #[test]
    fn refresh_unrealized_maintains_total_invariant() {
        let mut ctx = StrategyContext::new("s", "u", "sub", 1_000_000, &limits(), true);
        ctx.upsert_position(position("SBIN", 10, 500_000_000));
        ctx.add_realized(2_000_000);

        let mut marks = BTreeMap::new();
        marks.insert("SBIN".to_string(), 510_000_000);
        ctx.refresh_unrealized(&marks);

        assert_eq!(ctx.unrealized_pnl_micros, 100_000_000);
        assert_eq!(
            ctx.total_pnl_micros,
            ctx.realized_pnl_micros + ctx.unrealized_pnl_micros
        );
    }

    #[test]
    fn realized_counts_toward_today() {
        let mut ctx = StrategyContext::new("s", "u", "sub", 1_000_000, &limits(), true);
        ctx.add_realized(-3_000_000);
        assert_eq!(ctx.today_pnl_micros, -3_000_000);
        assert_eq!(ctx.total_pnl_micros, -3_000_000);
    }

    #[test]
    fn max_order_value_is_twenty_percent_by_default() {
        let ctx = StrategyContext::new("s", "u", "sub", 100_000_000_000, &limits(), true);
        // 20% of 1,00,000 rupees
        assert_eq!(ctx.max_order_value_micros(&limits()), 20_000_000_000);
    }
}
