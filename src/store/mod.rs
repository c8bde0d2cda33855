// growerd: Remote document store access
//
// The store holds one device document per serial plus a commands
// subcollection and a config/intervals child. Authentication is opaque to
// the control plane (a bearer token read from the credentials file).

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ControlResult;
use crate::model::{fields, now_ts, DocumentUpdate};

pub use memory::MemoryDocumentStore;
pub use rest::RestDocumentStore;

/// Access to the remote desired-state document.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the device document. `None` means the document does not
    /// exist yet (no pins provisioned from the webapp).
    async fn fetch_device(&self) -> ControlResult<Option<Value>>;

    /// Apply a batched dotted-field-path update to the device document.
    async fn update_device(&self, update: DocumentUpdate) -> ControlResult<()>;

    /// Fetch the config/intervals child document.
    async fn fetch_intervals(&self) -> ControlResult<Option<Value>>;

    /// List pending command documents as (command_id, body) pairs.
    async fn list_commands(&self) -> ControlResult<Vec<(String, Value)>>;

    /// Delete a command document after processing.
    async fn delete_command(&self, id: &str) -> ControlResult<()>;

    /// Stamp the device presence status ("online"/"offline").
    async fn set_status(&self, status: &str) -> ControlResult<()> {
        let mut update = DocumentUpdate::new();
        update.set(fields::STATUS, json!(status));
        update.set(fields::LAST_HEARTBEAT, now_ts());
        self.update_device(update).await
    }
}
