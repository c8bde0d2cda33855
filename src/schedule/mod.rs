// growerd: Schedule subsystem: cache, executors, window evaluation
//
// Schedules arrive from the same desired-state document as pin state.
// The engine keeps the cache synchronized with the document, spawns one
// executor per active (pin, schedule_id), and re-evaluates time windows
// periodically.

pub mod cache;
pub mod executor;
pub mod window;

use std::sync::Arc;

use chrono::Local;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::model::DeviceDocument;
use crate::reconcile::ReconcilerHandle;
use crate::safety::OverrideSet;
use crate::store::DocumentStore;

pub use cache::{CachedSchedule, ScheduleCache, WindowFlip};
pub use executor::ExecutorSet;

/// Shared handles of the schedule subsystem.
///
/// Cheap to clone; every executor task carries one.
#[derive(Clone)]
pub struct ScheduleEngine {
    pub cache: Arc<ScheduleCache>,
    pub executors: Arc<ExecutorSet>,
    pub overrides: Arc<OverrideSet>,
    pub recon: ReconcilerHandle,
    pub store: Arc<dyn DocumentStore>,
    stop: watch::Receiver<bool>,
}

impl ScheduleEngine {
    pub fn new(
        cache: Arc<ScheduleCache>,
        executors: Arc<ExecutorSet>,
        overrides: Arc<OverrideSet>,
        recon: ReconcilerHandle,
        store: Arc<dyn DocumentStore>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            executors,
            overrides,
            recon,
            store,
            stop,
        }
    }

    pub(crate) fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Synchronize the cache with a document snapshot.
    ///
    /// The initial snapshot populates without executing (boot safety has
    /// primacy). Subsequent snapshots start executors for newly added or
    /// redefined schedules that are active; a definition change also
    /// releases any user override on the pin (new intent supersedes it).
    pub fn ingest_document(&self, doc: &DeviceDocument, initial: bool) {
        let now = Local::now().time();

        for (pin, cfg) in &doc.pins {
            let pin = *pin;
            let cached: Vec<String> = self
                .cache
                .list(pin)
                .into_iter()
                .map(|(id, _)| id)
                .collect();

            for (id, spec) in &cfg.schedules {
                let existing = self.cache.get(pin, id);
                let changed = match &existing {
                    None => true,
                    Some(cached) => cached.spec != *spec,
                };
                if !changed {
                    continue;
                }

                let active = self.cache.upsert(pin, id, spec.clone(), now);
                if initial {
                    continue;
                }

                if existing.is_some() {
                    // A redefinition is fresh user intent; a standing
                    // override no longer applies.
                    self.overrides.clear(pin);
                }

                if active && !self.executors.is_running(pin, id) {
                    if existing.is_none() {
                        self.overrides.clear(pin);
                    }
                    info!(pin, schedule_id = %id, "Starting executor for new/updated schedule");
                    self.start(pin, id);
                }
            }

            // Deletions: cached ids the document no longer mentions.
            for id in cached {
                if !cfg.schedules.contains_key(&id) {
                    self.cache.remove(pin, &id);
                    // The running executor notices the cache miss within
                    // one poll chunk and stops on its own.
                }
            }
        }

        // Pins that vanished entirely (hot-remove drops their schedules).
        // Malformed entries are skips, not removals.
        for pin in self.cache.pin_numbers() {
            if !doc.mentions(pin) {
                self.cache.remove_pin(pin);
            }
        }
    }

    /// Start an executor for (pin, schedule_id) unless one is running.
    pub fn start(&self, pin: u8, schedule_id: &str) {
        if !self.executors.try_claim(pin, schedule_id) {
            debug!(pin, schedule_id, "Executor already running, not starting another");
            return;
        }

        let engine = self.clone();
        let id = schedule_id.to_string();
        let handle = tokio::spawn(executor::run_executor(engine, pin, id));
        self.executors.attach(pin, schedule_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcilerEvent;
    use crate::store::MemoryDocumentStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn engine_with_inbox() -> (ScheduleEngine, mpsc::Receiver<ReconcilerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let engine = ScheduleEngine::new(
            Arc::new(ScheduleCache::new()),
            Arc::new(ExecutorSet::new()),
            Arc::new(OverrideSet::new()),
            ReconcilerHandle::new(tx),
            Arc::new(MemoryDocumentStore::new()),
            stop_rx,
        );
        (engine, rx)
    }

    fn doc_with_schedule(enabled: bool) -> DeviceDocument {
        DeviceDocument::parse(&json!({
            "gpioState": {
                "19": {
                    "mode": "output",
                    "schedules": {
                        "s1": {
                            "enabled": enabled,
                            "durationSeconds": 1,
                            "frequencySeconds": 1,
                            "name": "misting"
                        }
                    }
                }
            }
        }))
    }

    #[tokio::test]
    async fn initial_ingest_populates_without_executing() {
        let (engine, _rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(true), true);
        assert!(engine.cache.get(19, "s1").unwrap().active);
        assert_eq!(engine.executors.running_count(), 0);
    }

    #[tokio::test]
    async fn non_initial_ingest_starts_active_schedule() {
        let (engine, mut rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(true), false);
        assert!(engine.executors.is_running(19, "s1"));
        // The executor drives the pin ON through the reconciler inbox.
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            ReconcilerEvent::ScheduleDrive { pin: 19, on: true, .. }
        ));
    }

    #[tokio::test]
    async fn disabled_schedule_not_started() {
        let (engine, _rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(false), false);
        assert_eq!(engine.executors.running_count(), 0);
    }

    #[tokio::test]
    async fn deleted_schedule_leaves_cache() {
        let (engine, _rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(false), true);
        let empty = DeviceDocument::parse(&json!({
            "gpioState": {"19": {"mode": "output"}}
        }));
        engine.ingest_document(&empty, false);
        assert!(engine.cache.get(19, "s1").is_none());
    }

    #[tokio::test]
    async fn redefinition_clears_override() {
        let (engine, _rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(false), true);
        engine.overrides.engage(19);

        // Same schedule, now enabled: definition changed.
        engine.ingest_document(&doc_with_schedule(true), false);
        assert!(!engine.overrides.contains(19));
    }

    #[tokio::test]
    async fn unchanged_definition_keeps_override() {
        let (engine, _rx) = engine_with_inbox();
        engine.ingest_document(&doc_with_schedule(true), true);
        engine.overrides.engage(19);
        engine.ingest_document(&doc_with_schedule(true), false);
        assert!(engine.overrides.contains(19));
    }
}
