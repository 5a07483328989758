use adk_schemas::{bps_of_micros, OrderRequest, RiskLimits, Signal, StrategyContext, BPS_SCALE};

use crate::{KillSwitchSnapshot, LimitType, RiskDecision};

/// Run every pre-trade check in fixed order; the first denial returns
/// immediately.
///
/// Check order:
/// 1. kill switch (cached snapshot fast path)
/// 2. daily loss limit
/// 3. max drawdown
/// 4. position count (BUY opening a new symbol only)
/// 5. position sizing (BUY with an explicit price only)
/// 6. daily trade limit
/// 7. stop loss required on entries
pub fn check_order(
    order: &OrderRequest,
    ctx: &StrategyContext,
    limits: &RiskLimits,
    today_trade_count: u32,
    kill_switch: Option<&KillSwitchSnapshot>,
) -> RiskDecision {
    // 1) Kill switch overrides everything.
    if let Some(ks) = kill_switch {
        if ks.active {
            return RiskDecision::deny(
                LimitType::KillSwitch,
                format!("Kill switch active: {}", ks.reason),
                None,
                None,
            );
        }
    }

    // 2) Daily loss limit.
    if limits.daily_loss_limit_micros > 0
        && ctx.today_pnl_micros <= -limits.daily_loss_limit_micros
    {
        return RiskDecision::deny(
            LimitType::DailyLoss,
            format!("Daily loss limit reached: {}", ctx.today_pnl_micros),
            Some(ctx.today_pnl_micros),
            Some(-limits.daily_loss_limit_micros),
        );
    }

    // 3) Max drawdown: dd_bps = total_pnl / capital in basis points.
    if ctx.capital_micros > 0 {
        let dd_bps = (ctx.total_pnl_micros as i128 * BPS_SCALE as i128
            / ctx.capital_micros as i128) as i64;
        if dd_bps <= -limits.max_drawdown_bps {
            return RiskDecision::deny(
                LimitType::MaxDrawdown,
                format!("Max drawdown reached: {:.2}%", dd_bps as f64 / 100.0),
                Some(dd_bps),
                Some(-limits.max_drawdown_bps),
            );
        }
    }

    // 4) Position count, only when a BUY opens a new symbol.
    if order.signal == Signal::Buy && ctx.get_position(&order.symbol).is_none() {
        let open = ctx.positions.len();
        if open >= limits.max_positions {
            return RiskDecision::deny(
                LimitType::MaxPositions,
                format!("Max positions ({}) reached", limits.max_positions),
                Some(open as i64),
                Some(limits.max_positions as i64),
            );
        }
    }

    // 5) Position sizing, only when a BUY carries an explicit price.
    if order.signal == Signal::Buy {
        if let Some(price) = order.price_micros.filter(|p| *p > 0) {
            let order_value = (order.quantity as i128 * price as i128)
                .min(i64::MAX as i128) as i64;
            let max_value = bps_of_micros(ctx.capital_micros, limits.max_order_value_bps);
            if order_value > max_value {
                return RiskDecision::deny(
                    LimitType::OrderValue,
                    format!("Order value ({order_value}) exceeds limit ({max_value})"),
                    Some(order_value),
                    Some(max_value),
                );
            }
        }
    }

    // 6) Daily trade limit.
    if today_trade_count >= limits.max_daily_trades {
        return RiskDecision::deny(
            LimitType::DailyTrades,
            format!("Daily trade limit ({}) reached", limits.max_daily_trades),
            Some(today_trade_count as i64),
            Some(limits.max_daily_trades as i64),
        );
    }

    // 7) Entries must carry a stop loss.
    if order.signal.is_entry() && order.stop_loss_micros.is_none() {
        return RiskDecision::deny(
            LimitType::StopLossRequired,
            "Stop loss is required for all entry orders",
            None,
            None,
        );
    }

    RiskDecision::allow()
}

/// Position size from risked capital:
/// `qty = floor((capital * risk_bps / 10_000) / |entry - stop|)`.
/// Returns 0 when entry == stop.
pub fn position_size_from_risk(
    capital_micros: i64,
    risk_bps: i64,
    entry_micros: i64,
    stop_micros: i64,
) -> i64 {
    let risk_per_unit = (entry_micros - stop_micros).abs();
    if risk_per_unit == 0 {
        return 0;
    }
    let risk_amount = bps_of_micros(capital_micros, risk_bps);
    (risk_amount / risk_per_unit).max(0)
}

/// Stop-hit evaluation against a percent-of-entry stop.
/// Long: `current <= avg * (1 - sl_bps/10_000)`.
/// Short: `current >= avg * (1 + sl_bps/10_000)`.
pub fn stop_loss_hit(
    avg_price_micros: i64,
    current_price_micros: i64,
    stop_loss_bps: i64,
    is_long: bool,
) -> bool {
    let delta = bps_of_micros(avg_price_micros, stop_loss_bps);
    if is_long {
        current_price_micros <= avg_price_micros - delta
    } else {
        current_price_micros >= avg_price_micros + delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_schemas::{micros_from_f64, OrderType, Position, MICROS_SCALE};

    fn limits() -> RiskLimits {
        RiskLimits::new(1_000, 5_000 * MICROS_SCALE, 200, 5)
    }

    fn context(capital_rupees: i64) -> StrategyContext {
        StrategyContext::new(
            "sma_rsi_crossover",
            "user-1",
            "sub-1",
            capital_rupees * MICROS_SCALE,
            &limits(),
            true,
        )
    }

    fn buy(qty: i64) -> OrderRequest {
        OrderRequest::market("SBIN", "NSE", Signal::Buy, qty)
            .with_stop_loss(micros_from_f64(490.0))
    }

    fn position(symbol: &str, qty: i64) -> Position {
        Position {
            symbol: symbol.to_string(),
            exchange: "NSE".to_string(),
            quantity: qty,
            avg_price_micros: micros_from_f64(500.0),
            last_price_micros: micros_from_f64(500.0),
            pnl_micros: 0,
        }
    }

    // --- check ordering ---

    #[test]
    fn clean_order_passes() {
        let d = check_order(&buy(10), &context(100_000), &limits(), 0, None);
        assert!(d.allowed, "unexpected denial: {d:?}");
    }

    #[test]
    fn kill_switch_denies_first() {
        let mut ctx = context(100_000);
        ctx.today_pnl_micros = -10_000 * MICROS_SCALE; // daily loss also breached
        let ks = KillSwitchSnapshot::active("market halt");
        let d = check_order(&buy(10), &ctx, &limits(), 0, Some(&ks));
        assert_eq!(d.limit_type, Some(LimitType::KillSwitch));
    }

    // --- daily loss ---

    #[test]
    fn daily_loss_denies_and_escalates() {
        let mut ctx = context(100_000);
        ctx.today_pnl_micros = -5_000 * MICROS_SCALE;
        let d = check_order(&buy(10), &ctx, &limits(), 0, None);
        assert!(!d.allowed);
        assert_eq!(d.limit_type, Some(LimitType::DailyLoss));
        assert!(d.escalates_kill_switch());
    }

    #[test]
    fn daily_loss_disabled_when_zero_limit() {
        let mut l = limits();
        l.daily_loss_limit_micros = 0;
        let mut ctx = context(100_000);
        ctx.today_pnl_micros = -50_000 * MICROS_SCALE;
        let d = check_order(&buy(10), &ctx, &l, 0, None);
        assert!(d.allowed);
    }

    // --- drawdown ---

    #[test]
    fn drawdown_trip_denies_and_escalates() {
        // max_drawdown 10%, capital 1,00,000, total_pnl -10,001.
        let mut ctx = context(100_000);
        ctx.total_pnl_micros = -10_001 * MICROS_SCALE;
        let d = check_order(&buy(10), &ctx, &limits(), 0, None);
        assert!(!d.allowed);
        assert_eq!(d.limit_type, Some(LimitType::MaxDrawdown));
        assert!(d.escalates_kill_switch());
    }

    #[test]
    fn drawdown_just_inside_limit_passes() {
        let mut ctx = context(100_000);
        ctx.total_pnl_micros = -9_999 * MICROS_SCALE;
        let d = check_order(&buy(10), &ctx, &limits(), 0, None);
        assert!(d.allowed);
    }

    // --- position count ---

    #[test]
    fn max_positions_blocks_new_symbol_entry() {
        let mut ctx = context(100_000);
        for i in 0..5 {
            ctx.upsert_position(position(&format!("SYM{i}"), 1));
        }
        let d = check_order(&buy(10), &ctx, &limits(), 0, None);
        assert_eq!(d.limit_type, Some(LimitType::MaxPositions));
    }

    #[test]
    fn adding_to_existing_position_skips_count_check() {
        let mut ctx = context(100_000);
        for i in 0..4 {
            ctx.upsert_position(position(&format!("SYM{i}"), 1));
        }
        ctx.upsert_position(position("SBIN", 5));
        let d = check_order(&buy(10), &ctx, &limits(), 0, None);
        assert!(d.allowed);
    }

    // --- sizing ---

    #[test]
    fn oversize_entry_denied() {
        // Capital 1,00,000; max order value 20% => 20,000.
        // BUY 10 @ 2,500 = 25,000 > 20,000.
        let order = OrderRequest {
            symbol: "RELIANCE".to_string(),
            exchange: "NSE".to_string(),
            signal: Signal::Buy,
            quantity: 10,
            order_type: OrderType::Limit,
            price_micros: Some(2_500 * MICROS_SCALE),
            stop_loss_micros: Some(2_400 * MICROS_SCALE),
            target_micros: None,
            reason: String::new(),
        };
        let d = check_order(&order, &context(100_000), &limits(), 0, None);
        assert!(!d.allowed);
        assert_eq!(d.limit_type, Some(LimitType::OrderValue));
        assert_eq!(d.current_value, Some(25_000 * MICROS_SCALE));
        assert_eq!(d.limit_value, Some(20_000 * MICROS_SCALE));
    }

    #[test]
    fn market_order_without_price_skips_sizing() {
        let d = check_order(&buy(1_000_000), &context(100_000), &limits(), 0, None);
        assert!(d.allowed);
    }

    // --- daily trades ---

    #[test]
    fn daily_trade_limit_denies() {
        let d = check_order(&buy(10), &context(100_000), &limits(), 50, None);
        assert_eq!(d.limit_type, Some(LimitType::DailyTrades));
        assert!(!d.escalates_kill_switch());
    }

    // --- stop loss required ---

    #[test]
    fn entry_without_stop_loss_denied_regardless_of_sizing() {
        let order = OrderRequest::market("SBIN", "NSE", Signal::Buy, 1);
        let d = check_order(&order, &context(100_000), &limits(), 0, None);
        assert!(!d.allowed);
        assert_eq!(d.limit_type, Some(LimitType::StopLossRequired));
    }

    #[test]
    fn exit_short_requires_stop_loss() {
        let order = OrderRequest::market("SBIN", "NSE", Signal::ExitShort, 1);
        let d = check_order(&order, &context(100_000), &limits(), 0, None);
        assert_eq!(d.limit_type, Some(LimitType::StopLossRequired));
    }

    #[test]
    fn exit_long_needs_no_stop_loss() {
        let order = OrderRequest::market("SBIN", "NSE", Signal::ExitLong, 1);
        let d = check_order(&order, &context(100_000), &limits(), 0, None);
        assert!(d.allowed);
    }

    // --- auxiliary computations ---

    #[test]
    fn position_size_formula() {
        // capital 1,00,000 risking 2% = 2,000; entry 500, stop 490 => 10/unit.
        let qty = position_size_from_risk(
            100_000 * MICROS_SCALE,
            200,
            micros_from_f64(500.0),
            micros_from_f64(490.0),
        );
        assert_eq!(qty, 200);
    }

    #[test]
    fn position_size_zero_when_entry_equals_stop() {
        let qty = position_size_from_risk(
            100_000 * MICROS_SCALE,
            200,
            micros_from_f64(500.0),
            micros_from_f64(500.0),
        );
        assert_eq!(qty, 0);
    }

    #[test]
    fn stop_hit_long() {
        let avg = micros_from_f64(500.0);
        // 2% stop => 490.
        assert!(stop_loss_hit(avg, micros_from_f64(490.0), 200, true));
        assert!(!stop_loss_hit(avg, micros_from_f64(491.0), 200, true));
    }

    #[test]
    fn stop_hit_short() {
        let avg = micros_from_f64(500.0);
        assert!(stop_loss_hit(avg, micros_from_f64(510.0), 200, false));
        assert!(!stop_loss_hit(avg, micros_from_f64(509.0), 200, false));
    }
}
