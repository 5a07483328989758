use serde::{Deserialize, Serialize};

/// Trading signal emitted by a strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Buy,
    Sell,
    ExitLong,
    ExitShort,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Buy => "BUY",
            Signal::Sell => "SELL",
            Signal::ExitLong => "EXIT_LONG",
            Signal::ExitShort => "EXIT_SHORT",
        }
    }

    /// Entry signals open or increase exposure and must carry a stop loss.
    pub fn is_entry(&self) -> bool {
        matches!(self, Signal::Buy | Signal::ExitShort)
    }

    /// The broker-side transaction direction for this signal.
    pub fn transaction_side(&self) -> &'static str {
        match self {
            Signal::Buy | Signal::ExitShort => "BUY",
            Signal::Sell | Signal::ExitLong => "SELL",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type for candidate and broker orders.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::StopLossMarket => "STOP_LOSS_MARKET",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate order emitted by a strategy, before the risk gate.
///
/// Quantity is always positive; the signal carries direction. Entry signals
/// (BUY / EXIT_SHORT) must carry `stop_loss_micros` or the risk gate
/// rejects them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub signal: Signal,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price_micros: Option<i64>,
    pub stop_loss_micros: Option<i64>,
    pub target_micros: Option<i64>,
    pub reason: String,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        signal: Signal,
        quantity: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
            signal,
            quantity,
            order_type: OrderType::Market,
            price_micros: None,
            stop_loss_micros: None,
            target_micros: None,
            reason: String::new(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss_micros: i64) -> Self {
        self.stop_loss_micros = Some(stop_loss_micros);
        self
    }

    pub fn with_target(mut self, target_micros: i64) -> Self {
        self.target_micros = Some(target_micros);
        self
    }

    pub fn with_limit_price(mut self, price_micros: i64) -> Self {
        self.order_type = OrderType::Limit;
        self.price_micros = Some(price_micros);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}
