use crate::documents::Side;
use crate::error::ExchangeError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opening(side: Side) -> Option<OrderSide> {
        match side {
            Side::Long => Some(OrderSide::Buy),
            Side::Short => Some(OrderSide::Sell),
            Side::Flat => None,
        }
    }

    pub fn closing(qty: f64) -> Option<OrderSide> {
        if qty > 0.0 {
            Some(OrderSide::Sell)
        } else if qty < 0.0 {
            Some(OrderSide::Buy)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub signed_qty: f64,
    pub entry_price: f64,
    pub leverage: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub margin: Option<f64>,
    pub isolated_margin: Option<f64>,
    pub notional: Option<f64>,
    pub mark_price: Option<f64>,
}

impl ExchangePosition {
    pub fn side(&self) -> Side {
        Side::from_signed_qty(self.signed_qty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;
}
