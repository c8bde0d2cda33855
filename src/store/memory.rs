// growerd: In-memory document store
//
// Backs tests and credential-less simulation runs with the same contract
// as the REST store. Dotted field paths are applied into a JSON tree the
// way the remote database applies update masks.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::ControlResult;
use crate::model::DocumentUpdate;

use super::DocumentStore;

#[derive(Default)]
struct Inner {
    device: Option<Value>,
    intervals: Option<Value>,
    commands: Vec<(String, Value)>,
}

/// In-memory store with inspection helpers for tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<Inner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or replace) the device document.
    pub fn put_device(&self, doc: Value) {
        self.inner.lock().device = Some(doc);
    }

    pub fn put_intervals(&self, doc: Value) {
        self.inner.lock().intervals = Some(doc);
    }

    pub fn push_command(&self, id: &str, body: Value) {
        self.inner.lock().commands.push((id.to_string(), body));
    }

    /// Current device document (clone), if any.
    pub fn device(&self) -> Option<Value> {
        self.inner.lock().device.clone()
    }

    /// Read a dotted path out of the device document.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let inner = self.inner.lock();
        let mut current = inner.device.as_ref()?;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    pub fn command_count(&self) -> usize {
        self.inner.lock().commands.len()
    }

    /// Apply one dotted path into a JSON object tree, creating
    /// intermediate objects as needed.
    fn apply_path(target: &mut Value, path: &str, value: Value) {
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }

        let mut current = target;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let obj = current.as_object_mut().expect("object ensured above");
            if i == segments.len() - 1 {
                obj.insert((*segment).to_string(), value);
                return;
            }
            current = obj
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch_device(&self) -> ControlResult<Option<Value>> {
        Ok(self.inner.lock().device.clone())
    }

    async fn update_device(&self, update: DocumentUpdate) -> ControlResult<()> {
        let mut inner = self.inner.lock();
        let device = inner
            .device
            .get_or_insert_with(|| Value::Object(Map::new()));
        for (path, value) in update.into_fields() {
            Self::apply_path(device, &path, value);
        }
        Ok(())
    }

    async fn fetch_intervals(&self) -> ControlResult<Option<Value>> {
        Ok(self.inner.lock().intervals.clone())
    }

    async fn list_commands(&self) -> ControlResult<Vec<(String, Value)>> {
        Ok(self.inner.lock().commands.clone())
    }

    async fn delete_command(&self, id: &str) -> ControlResult<()> {
        self.inner.lock().commands.retain(|(cid, _)| cid != id);
        Ok(())
    }
}
