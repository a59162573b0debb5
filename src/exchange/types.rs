use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Venue acknowledgement of a routed decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub client_order_id: String,
    pub status: String,
    #[serde(default)]
    pub raw: Value,
}
