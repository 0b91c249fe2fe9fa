use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A resource event emitted by the store on mutations.
///
/// The garbage collector and the subnet reconciler subscribe to these; a
/// lagged subscriber is expected to fall back to a full resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: WatchEventType,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// The serialized resource object (last-known state for deletes)
    pub object: serde_json::Value,
    pub revision: u64,
}

impl ResourceEvent {
    pub fn added(
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        object: serde_json::Value,
        revision: u64,
    ) -> Self {
        Self::new(WatchEventType::Added, kind, namespace, name, object, revision)
    }

    pub fn modified(
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        object: serde_json::Value,
        revision: u64,
    ) -> Self {
        Self::new(WatchEventType::Modified, kind, namespace, name, object, revision)
    }

    pub fn deleted(
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        object: serde_json::Value,
        revision: u64,
    ) -> Self {
        Self::new(WatchEventType::Deleted, kind, namespace, name, object, revision)
    }

    fn new(
        event_type: WatchEventType,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        object: serde_json::Value,
        revision: u64,
    ) -> Self {
        Self {
            event_type,
            kind: kind.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            object,
            revision,
        }
    }
}
