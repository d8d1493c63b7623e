use serde::Deserialize;
use serde::Serialize;

/// One node in a store response. Field names follow the coordination store's
/// JSON wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvNode {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    pub modified_index: u64,
    pub created_index: u64,
    #[serde(default)]
    pub nodes: Vec<KvNode>,
}

/// Response envelope for CRUD calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvResponse {
    pub action: EventKind,
    pub node: KvNode,
    /// Global store index at the time of the response.
    pub store_index: u64,
}

/// Action kinds the store reports, for both responses and watch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl EventKind {
    /// Whether this action removes the node it names.
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            EventKind::Delete | EventKind::CompareAndDelete | EventKind::Expire
        )
    }
}

/// One change accepted by the store, as delivered by the watch endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    pub value: Option<String>,
    pub dir: bool,
    pub modified_index: u64,
}

/// Conditions and flags for a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// `Some(true)`: the key must not exist. `Some(false)`: it must.
    /// `None`: either.
    pub create: Option<bool>,
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
    /// Create an in-order child key under `key` instead of writing `key`.
    pub append: bool,
    /// The target is a directory entry.
    pub dir: bool,
    /// Time-to-live in seconds, where the store supports it.
    pub ttl: Option<u64>,
}

/// Conditions for a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
    pub recursive: bool,
}
