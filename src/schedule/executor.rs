// growerd: Schedule executors
//
// One cooperative task per running (pin, schedule_id). The executor only
// ever drives the pin through the reconciler inbox; it owns no hardware.
// Every wait is chunked to at most one second so disable, window exit,
// user override and process stop are all honoured within ≤1 s.

use std::time::Duration;

use chrono::{Local, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::model::{fields, DocumentUpdate};

use super::ScheduleEngine;

/// Floor for the OFF pause between cycles, preventing relay chatter.
const MIN_OFF_SECONDS: f64 = 0.5;

/// Longest single sleep inside an executor; bounds cancellation latency.
const POLL_CHUNK: Duration = Duration::from_secs(1);

/// Run-state of all live executors, keyed by (pin, schedule_id).
///
/// The occupancy of a key is the per-(pin, schedule) mutex: a second
/// `start` for the same key returns without spawning.
#[derive(Default)]
pub struct ExecutorSet {
    running: DashMap<(u8, String), Option<JoinHandle<()>>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot. Returns false if an executor already holds it.
    pub fn try_claim(&self, pin: u8, schedule_id: &str) -> bool {
        match self.running.entry((pin, schedule_id.to_string())) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(None);
                true
            }
        }
    }

    /// Attach the spawned task handle to a claimed slot.
    pub fn attach(&self, pin: u8, schedule_id: &str, handle: JoinHandle<()>) {
        if let Some(mut slot) = self.running.get_mut(&(pin, schedule_id.to_string())) {
            *slot = Some(handle);
        }
    }

    /// Release the run slot (called by the executor itself on exit).
    pub fn finish(&self, pin: u8, schedule_id: &str) {
        self.running.remove(&(pin, schedule_id.to_string()));
    }

    pub fn is_running(&self, pin: u8, schedule_id: &str) -> bool {
        self.running.contains_key(&(pin, schedule_id.to_string()))
    }

    /// Any schedule currently holds this pin.
    pub fn any_on_pin(&self, pin: u8) -> bool {
        self.running.iter().any(|entry| entry.key().0 == pin)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Abort every executor and empty the set (emergency stop).
    pub fn abort_all(&self) {
        let keys: Vec<(u8, String)> = self.running.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.running.remove(&key) {
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
        }
    }
}

/// The executor body. The run slot must already be claimed.
pub(super) async fn run_executor(engine: ScheduleEngine, pin: u8, schedule_id: String) {
    let mut cycles: u64 = 0;

    loop {
        // Re-read the definition every cycle so edits apply mid-run.
        let Some(sched) = engine.cache.get(pin, &schedule_id) else {
            info!(pin, schedule_id = %schedule_id, "Schedule deleted mid-run, stopping");
            break;
        };
        if !sched.spec.enabled {
            info!(pin, schedule_id = %schedule_id, "Schedule disabled mid-run, stopping");
            break;
        }
        if !sched.spec.in_window(Local::now().time()) {
            break;
        }
        if engine.overrides.contains(pin) {
            info!(pin, schedule_id = %schedule_id, "Schedule stopped by user override");
            break;
        }
        if engine.stopping() {
            break;
        }

        cycles += 1;

        // ON phase. The first cycle is reported to the document
        // immediately; the sync push covers the rest.
        engine
            .recon
            .schedule_drive(pin, true, &schedule_id, cycles == 1)
            .await;

        let on = Duration::from_secs(sched.spec.duration_seconds);
        if !sleep_runnable(&engine, pin, &schedule_id, on).await {
            break;
        }

        // OFF phase.
        engine
            .recon
            .schedule_drive(pin, false, &schedule_id, false)
            .await;

        let off = Duration::from_secs_f64(
            (sched.spec.frequency_seconds as f64).max(MIN_OFF_SECONDS),
        );
        if !sleep_runnable(&engine, pin, &schedule_id, off).await {
            break;
        }
    }

    // Pin OFF on every exit path, reported to the document.
    engine
        .recon
        .schedule_drive(pin, false, &schedule_id, true)
        .await;

    let finished_at = Utc::now();
    engine.cache.set_last_run(pin, &schedule_id, finished_at);

    let mut update = DocumentUpdate::new();
    update.set_schedule_field(
        pin,
        &schedule_id,
        fields::LAST_RUN_AT,
        Value::String(finished_at.to_rfc3339()),
    );
    if let Err(e) = engine.store.update_device(update).await {
        error!(pin, schedule_id = %schedule_id, error = %e, "Failed to record schedule last_run_at");
    }

    engine.executors.finish(pin, &schedule_id);
    info!(pin, schedule_id = %schedule_id, cycles, "Schedule execution finished");
}

/// Sleep in ≤1 s chunks, bailing out (false) as soon as any abort
/// condition becomes true.
async fn sleep_runnable(
    engine: &ScheduleEngine,
    pin: u8,
    schedule_id: &str,
    total: Duration,
) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        let chunk = remaining.min(POLL_CHUNK);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);

        let Some(sched) = engine.cache.get(pin, schedule_id) else {
            return false;
        };
        if !sched.spec.enabled
            || !sched.spec.in_window(Local::now().time())
            || engine.overrides.contains(pin)
            || engine.stopping()
        {
            return false;
        }
    }
    true
}
