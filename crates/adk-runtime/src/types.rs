use adk_schemas::{OrderRequest, StrategyContext};
use adk_strategy::StateMap;

/// Commands accepted by a runner, processed in send order.
#[derive(Clone, Debug)]
pub enum RunnerCommand {
    Stop,
    Pause,
    Resume,
    UpdateContext(Box<StrategyContext>),
}

/// Runner life-cycle states surfaced through STATUS results.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunnerStatus {
    Started,
    Paused,
    Resumed,
    Stopped,
}

/// Typed results emitted by a runner on its result channel.
#[derive(Clone, Debug)]
pub enum RunnerResult {
    /// An order that passed the risk gate.
    Order {
        subscription_id: String,
        order: OrderRequest,
        market_price_micros: i64,
    },
    /// The risk gate denied an order. Not an error.
    RiskBlocked {
        subscription_id: String,
        reason: String,
        limit_type: String,
        symbol: String,
    },
    /// Life-cycle transition; `Stopped` carries the final serialized
    /// strategy state for restart recovery.
    Status {
        subscription_id: String,
        status: RunnerStatus,
        state: Option<StateMap>,
    },
    /// A strategy fault. The runner keeps serving ticks unless faults repeat.
    Error {
        subscription_id: String,
        error: String,
        backtrace: String,
    },
    /// A drawdown/daily-loss denial that must escalate to a
    /// subscription-scoped kill switch.
    KillSwitchTrigger {
        subscription_id: String,
        reason: String,
        limit_type: String,
    },
}

impl RunnerResult {
    pub fn subscription_id(&self) -> &str {
        match self {
            RunnerResult::Order {
                subscription_id, ..
            }
            | RunnerResult::RiskBlocked {
                subscription_id, ..
            }
            | RunnerResult::Status {
                subscription_id, ..
            }
            | RunnerResult::Error {
                subscription_id, ..
            }
            | RunnerResult::KillSwitchTrigger {
                subscription_id, ..
            } => subscription_id,
        }
    }
}

/// An allowed order on its way from the supervisor to the execution engine.
#[derive(Clone, Debug)]
pub struct OrderEnvelope {
    pub subscription_id: String,
    pub user_id: String,
    pub strategy_name: String,
    pub order: OrderRequest,
    pub market_price_micros: i64,
    pub dry_run: bool,
}
