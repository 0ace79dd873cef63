//! Subscription commands and change events.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::product::{Product, ProductId};

/// Subscription command verbs accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Replace the session's interest set with the listed products.
    Subscribe,
    /// Stop watching the listed products.
    Unsubscribe,
}

/// A command sent by a client over its live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    /// What to do.
    pub command: CommandKind,
    /// Products the command applies to.
    #[serde(rename = "entityIds", alias = "productIDs", default)]
    pub entity_ids: Vec<ProductId>,
}

impl ClientCommand {
    /// Create a subscribe command.
    pub fn subscribe(ids: impl Into<Vec<ProductId>>) -> Self {
        Self {
            command: CommandKind::Subscribe,
            entity_ids: ids.into(),
        }
    }

    /// Create an unsubscribe command.
    pub fn unsubscribe(ids: impl Into<Vec<ProductId>>) -> Self {
        Self {
            command: CommandKind::Unsubscribe,
            entity_ids: ids.into(),
        }
    }
}

/// A change reported by the upstream feed.
///
/// The action (`insert`, `update`, `delete`, ...) is informational and is
/// forwarded without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of change, lowercase.
    pub action: String,
    /// Product state after the change; the last state for deletes.
    #[serde(alias = "entity")]
    pub product: Product,
}

impl ChangeEvent {
    /// Create a change event.
    pub fn new(action: impl Into<String>, product: Product) -> Self {
        Self {
            action: action.into(),
            product,
        }
    }

    /// Identifier of the changed product.
    pub fn product_id(&self) -> ProductId {
        self.product.product_id
    }
}

/// Decode a client command from a text frame.
pub fn decode_command(text: &str) -> Result<ClientCommand, Error> {
    serde_json::from_str(text).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Decode an upstream change payload.
pub fn decode_change(payload: &[u8]) -> Result<ChangeEvent, Error> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::InvalidMessage("empty change payload".to_string()));
    }
    serde_json::from_slice(payload).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Encode a change event the way the upstream feed publishes it.
pub fn encode_change(event: &ChangeEvent) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(event).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a product for delivery to a subscriber.
pub fn encode_product(product: &Product) -> Result<String, Error> {
    serde_json::to_string(product).map_err(|e| Error::Serialization(e.to_string()))
}
