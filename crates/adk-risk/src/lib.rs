//! adk-risk
//!
//! Synchronous pre-trade risk gate:
//! - fixed check order, first denial returns immediately
//! - daily loss, drawdown, position count, order value, trade count,
//!   required stop loss
//! - position sizing from risked capital
//! - stop-hit evaluation
//!
//! Deterministic, pure logic. No IO, no time, no broker calls. The
//! kill-switch fast path reads a caller-supplied cached snapshot.

mod engine;
mod types;

pub use engine::{check_order, position_size_from_risk, stop_loss_hit};
pub use types::{KillSwitchSnapshot, LimitType, RiskDecision};
