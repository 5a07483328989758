/// Which limit produced a denial.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LimitType {
    KillSwitch,
    DailyLoss,
    MaxDrawdown,
    MaxPositions,
    OrderValue,
    DailyTrades,
    StopLossRequired,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::KillSwitch => "kill_switch",
            LimitType::DailyLoss => "daily_loss",
            LimitType::MaxDrawdown => "max_drawdown",
            LimitType::MaxPositions => "max_positions",
            LimitType::OrderValue => "order_value",
            LimitType::DailyTrades => "daily_trades",
            LimitType::StopLossRequired => "stop_loss_required",
        }
    }

    /// Drawdown and daily-loss denials escalate to a subscription-scoped
    /// kill-switch activation.
    pub fn escalates_kill_switch(&self) -> bool {
        matches!(self, LimitType::MaxDrawdown | LimitType::DailyLoss)
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the pre-trade gate.
///
/// `current_value` / `limit_value` carry the observed and configured values
/// for the limit that denied, in the unit of that limit (micros for money
/// limits, bps for drawdown, counts for positions/trades).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
    pub limit_type: Option<LimitType>,
    pub current_value: Option<i64>,
    pub limit_value: Option<i64>,
}

impl RiskDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "All risk checks passed".to_string(),
            limit_type: None,
            current_value: None,
            limit_value: None,
        }
    }

    pub fn deny(
        limit_type: LimitType,
        reason: impl Into<String>,
        current_value: Option<i64>,
        limit_value: Option<i64>,
    ) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            limit_type: Some(limit_type),
            current_value,
            limit_value,
        }
    }

    /// True when this denial must escalate to a kill-switch activation.
    pub fn escalates_kill_switch(&self) -> bool {
        !self.allowed
            && self
                .limit_type
                .is_some_and(|lt| lt.escalates_kill_switch())
    }
}

/// Locally cached kill-switch view used by the gate's fast path.
/// The authoritative store is consulted elsewhere; this snapshot must be
/// no staler than the configured bound (1 s) when passed in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KillSwitchSnapshot {
    pub active: bool,
    pub reason: String,
}

impl KillSwitchSnapshot {
    pub fn active(reason: impl Into<String>) -> Self {
        Self {
            active: true,
            reason: reason.into(),
        }
    }

    pub fn inactive() -> Self {
        Self::default()
    }
}
