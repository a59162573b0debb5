use async_trait::async_trait;

use crate::models::{Decision, MarketSnapshot};

use super::types::OrderAck;

pub type ExchangeResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Builds the snapshot a live trigger is evaluated against.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn snapshot(&self, symbol: &str, trigger_type: &str) -> ExchangeResult<MarketSnapshot>;
}

/// Sends validated, non-hold decisions to a venue.
#[async_trait]
pub trait OrderRouter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, decision: &Decision, client_order_id: &str) -> ExchangeResult<OrderAck>;
}
