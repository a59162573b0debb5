//! Collaborator interfaces for live trading: market feed and order routing.

pub mod traits;
pub mod types;

pub use traits::{ExchangeResult, MarketFeed, OrderRouter};
pub use types::OrderAck;
