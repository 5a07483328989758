//! Technical indicator math shared by strategies and the chart-preview path.
//!
//! Every function returns a full series aligned to the input closes, with
//! `None` where there is not yet enough data. Strategies and the preview
//! endpoint call the same functions so chart overlays and live signals can
//! never diverge.

mod rsi;
mod sma;

pub use rsi::{calculate_rsi, last_rsi};
pub use sma::{calculate_sma, last_sma};
