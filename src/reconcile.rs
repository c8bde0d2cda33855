// growerd: State reconciler
//
// The single authority that mutates pins. Document snapshots, explicit
// commands and schedule ticks all land in one inbox and are applied in
// arrival order; effects on the hardware follow that order. Every write
// is read back immediately and recorded in the registry, and the
// resulting observation is pushed to the document asynchronously.
//
// The driver and the registry are owned here exclusively; any other
// component touching them is a bug.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::gpio::{from_level, to_level, PinDriver, PinEntry, PinRegistry, RegistrySnapshot};
use crate::model::{fields, now_ts, DeviceCommand, DeviceDocument, DocumentUpdate, PinConfig};
use crate::safety::{boot_safety_update, OverrideSet};
use crate::schedule::ExecutorSet;
use crate::store::DocumentStore;

const INBOX_CAPACITY: usize = 256;

/// Events the reconciler serialises through its inbox.
#[derive(Debug)]
pub enum ReconcilerEvent {
    /// A device-document snapshot from the watcher. The initial snapshot
    /// populates state without applying it (boot safety has primacy).
    Snapshot { doc: DeviceDocument, initial: bool },
    /// An explicit command document.
    Command { id: String, command: DeviceCommand },
    /// A schedule executor driving its pin. `report` pushes the resulting
    /// hardware observation to the document immediately (first cycle and
    /// final OFF); the sync push covers the cycles in between.
    ScheduleDrive {
        pin: u8,
        on: bool,
        schedule_id: String,
        report: bool,
    },
    /// Deferred OFF scheduled by a `pin_control` command with a duration.
    AutoOff { pin: u8 },
    /// Fast cadence: poll every pin into memory, repair drift.
    ReadSweep,
    /// Slow cadence: batch the snapshot into one document write.
    PushSnapshot,
    /// Presence stamp without the full snapshot.
    Heartbeat,
    /// Force everything off. Synchronous when `done` is present.
    EmergencyStop {
        done: Option<oneshot::Sender<ControlResult<()>>>,
    },
}

/// Cloneable sender side of the reconciler inbox.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcilerEvent>,
}

impl ReconcilerHandle {
    pub fn new(tx: mpsc::Sender<ReconcilerEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: ReconcilerEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Reconciler inbox closed, event dropped");
        }
    }

    pub async fn snapshot(&self, doc: DeviceDocument, initial: bool) {
        self.send(ReconcilerEvent::Snapshot { doc, initial }).await;
    }

    pub async fn command(&self, id: String, command: DeviceCommand) {
        self.send(ReconcilerEvent::Command { id, command }).await;
    }

    pub async fn schedule_drive(&self, pin: u8, on: bool, schedule_id: &str, report: bool) {
        self.send(ReconcilerEvent::ScheduleDrive {
            pin,
            on,
            schedule_id: schedule_id.to_string(),
            report,
        })
        .await;
    }

    pub async fn read_sweep(&self) {
        self.send(ReconcilerEvent::ReadSweep).await;
    }

    pub async fn push_snapshot(&self) {
        self.send(ReconcilerEvent::PushSnapshot).await;
    }

    pub async fn heartbeat(&self) {
        self.send(ReconcilerEvent::Heartbeat).await;
    }

    /// Trigger the emergency stop and wait for it to complete or fail.
    /// This path is never fire-and-forget.
    pub async fn emergency_stop(&self, timeout: Duration) -> ControlResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(ReconcilerEvent::EmergencyStop {
            done: Some(done_tx),
        })
        .await;

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControlError::Internal(
                "reconciler dropped the emergency-stop acknowledgement".into(),
            )),
            Err(_) => Err(ControlError::CommandTimeout(
                "emergency stop did not acknowledge in time".into(),
            )),
        }
    }
}

/// The reconciler worker.
pub struct Reconciler {
    driver: Box<dyn PinDriver>,
    registry: PinRegistry,
    store: Arc<dyn DocumentStore>,
    overrides: Arc<OverrideSet>,
    executors: Arc<ExecutorSet>,
    inbox: mpsc::Receiver<ReconcilerEvent>,
    handle: ReconcilerHandle,
    /// What the document's `state` field last said, per pin. Schedule
    /// drives deliberately do not touch this: it is the baseline for
    /// detecting real document changes.
    last_document_state: HashMap<u8, bool>,
}

impl Reconciler {
    pub fn new(
        driver: Box<dyn PinDriver>,
        store: Arc<dyn DocumentStore>,
        overrides: Arc<OverrideSet>,
        executors: Arc<ExecutorSet>,
    ) -> (Self, ReconcilerHandle, watch::Receiver<RegistrySnapshot>) {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let handle = ReconcilerHandle::new(tx);
        let (registry, snapshot_rx) = PinRegistry::new();
        (
            Self {
                driver,
                registry,
                store,
                overrides,
                executors,
                inbox,
                handle: handle.clone(),
                last_document_state: HashMap::new(),
            },
            handle,
            snapshot_rx,
        )
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Reconciler running");

        loop {
            tokio::select! {
                event = self.inbox.recv() => {
                    match event {
                        Some(event) => {
                            self.handle_event(event).await;
                            self.registry.publish();
                        }
                        None => break,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.driver.cleanup_all() {
            warn!(error = %e, "GPIO cleanup failed on shutdown");
        }
        info!("Reconciler stopped");
    }

    async fn handle_event(&mut self, event: ReconcilerEvent) {
        match event {
            ReconcilerEvent::Snapshot { doc, initial } => {
                if initial {
                    self.boot_populate(doc).await;
                } else {
                    self.apply_snapshot(doc).await;
                }
            }
            ReconcilerEvent::Command { id, command } => self.handle_command(id, command).await,
            ReconcilerEvent::ScheduleDrive {
                pin,
                on,
                schedule_id,
                report,
            } => self.handle_schedule_drive(pin, on, &schedule_id, report),
            ReconcilerEvent::AutoOff { pin } => self.handle_auto_off(pin),
            ReconcilerEvent::ReadSweep => self.handle_read_sweep(),
            ReconcilerEvent::PushSnapshot => self.handle_push_snapshot(),
            ReconcilerEvent::Heartbeat => {
                let mut update = DocumentUpdate::new();
                update.set_heartbeat();
                self.spawn_push(update);
            }
            ReconcilerEvent::EmergencyStop { done } => {
                let result = self.emergency_stop_sweep().await;
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
        }
    }

    // ─── Boot protocol ──────────────────────────────────────────────

    /// Populate registry and driver from the initial snapshot without
    /// applying the document's desired states: every pin boots OFF, and
    /// stale `state=true` is cleared in the document so the webapp
    /// matches reality.
    async fn boot_populate(&mut self, doc: DeviceDocument) {
        let mut stale_on = Vec::new();
        let mut created = Vec::new();

        for (pin, cfg) in &doc.pins {
            let pin = *pin;
            let mut entry = PinEntry::from_config(cfg);
            entry.desired = false;

            let off_level = to_level(false, cfg.active_low);
            if let Err(e) = self.driver.configure(pin, cfg.mode, off_level) {
                error!(pin, error = %e, "Pin setup failed");
                entry.record_fault();
            } else if let Ok(raw) = self.driver.read(pin) {
                entry.hardware = from_level(raw, cfg.active_low);
            }

            if cfg.state {
                stale_on.push(pin);
            }
            if cfg.needs_defaults {
                created.push(pin);
            }

            self.last_document_state.insert(pin, false);
            self.registry.upsert(entry);
        }

        info!(
            pins = self.registry.len(),
            stale_cleared = stale_on.len(),
            "Boot sync: all pins OFF"
        );

        let update = boot_safety_update(&self.registry, &stale_on, &created);
        if let Err(e) = self.store.update_device(update.clone()).await {
            error!(error = %e, "Boot sync write failed, retrying once");
            if let Err(e) = self.store.update_device(update).await {
                error!(error = %e, "Boot sync retry failed; sync loop will cover");
            }
        }
    }

    // ─── Document snapshots ─────────────────────────────────────────

    async fn apply_snapshot(&mut self, doc: DeviceDocument) {
        // Hot-init pins the document added.
        for cfg in doc.pins.values() {
            if !self.registry.contains(cfg.pin) {
                self.hot_init(cfg);
            }
        }

        // Hot-remove pins the document dropped. A malformed entry is a
        // skip, not a removal.
        for pin in self.registry.pin_numbers() {
            if !doc.mentions(pin) {
                self.hot_remove(pin);
            }
        }

        // Field diffs on surviving pins.
        for (pin, cfg) in &doc.pins {
            self.apply_pin_diff(*pin, cfg);
        }
    }

    fn apply_pin_diff(&mut self, pin: u8, cfg: &PinConfig) {
        let Some(entry) = self.registry.get(pin) else {
            return;
        };

        let prev_doc_state = self.last_document_state.get(&pin).copied();
        let state_changed = prev_doc_state != Some(cfg.state);
        let polarity_changed = entry.active_low != cfg.active_low;
        let pwm_changed = entry.pwm_duty != cfg.pwm_duty;
        let enabled_changed = entry.enabled != cfg.enabled;
        let relevant_change = state_changed || polarity_changed || pwm_changed || enabled_changed;

        {
            let entry = self.registry.get_mut(pin).expect("checked above");
            entry.name = cfg.name.clone();
            entry.name_customized = cfg.name_customized;
            entry.enabled = cfg.enabled;
            if polarity_changed {
                info!(
                    pin,
                    from = entry.active_low,
                    to = cfg.active_low,
                    "Pin polarity changed"
                );
                entry.active_low = cfg.active_low;
            }
            if relevant_change {
                // A document change touching the pin lifts a fault latch.
                entry.restore_available();
            }
        }

        if !(state_changed || polarity_changed || pwm_changed) {
            return;
        }

        if state_changed {
            self.last_document_state.insert(pin, cfg.state);
            self.registry.set_desired(pin, cfg.state);
        }

        if !cfg.enabled {
            warn!(pin, "Document change ignored (pin disabled)");
            return;
        }

        if state_changed {
            info!(
                pin,
                from = ?prev_doc_state,
                to = cfg.state,
                "Desired state changed in document"
            );
            // User OFF while a schedule is executing overrides it; user
            // ON withdraws the override.
            if !cfg.state && self.executors.any_on_pin(pin) {
                self.overrides.engage(pin);
            }
            if cfg.state {
                self.overrides.clear(pin);
            }
        }

        if state_changed || polarity_changed {
            let desired = self
                .registry
                .get(pin)
                .map(|e| e.desired)
                .unwrap_or(false);
            if let Some(hw) = self.write_and_verify(pin, desired) {
                let mut update = DocumentUpdate::new();
                update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw));
                update.set_pin_field(pin, fields::MISMATCH, json!(desired != hw));
                update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
                self.spawn_push(update);
            }
        }

        if pwm_changed {
            info!(pin, duty = cfg.pwm_duty, "PWM duty changed in document");
            self.apply_pwm(pin, cfg.pwm_duty, false);
        }
    }

    fn hot_init(&mut self, cfg: &PinConfig) {
        let pin = cfg.pin;
        info!(pin, name = %cfg.name, "HOT-INIT: new pin added in document");

        let off_level = to_level(false, cfg.active_low);
        if let Err(e) = self.driver.configure(pin, cfg.mode, off_level) {
            error!(pin, error = %e, "Pin setup failed");
        }

        let mut entry = PinEntry::from_config(cfg);
        entry.desired = cfg.state;
        self.registry.upsert(entry);
        self.last_document_state.insert(pin, cfg.state);

        // Apply the desired state straight away when it is ON.
        let hw = if cfg.enabled && cfg.state {
            self.write_and_verify(pin, true)
        } else {
            self.refresh_hardware(pin)
        };

        if cfg.pwm_duty > 0 {
            self.apply_pwm(pin, cfg.pwm_duty, false);
        }

        let hw = hw.unwrap_or(false);
        let mut update = DocumentUpdate::new();
        update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw));
        update.set_pin_field(pin, fields::MISMATCH, json!(cfg.state != hw));
        update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
        self.spawn_push(update);
    }

    fn hot_remove(&mut self, pin: u8) {
        info!(pin, "HOT-REMOVE: pin deleted from document");

        // Safety first: force the device off before releasing the pin.
        let _ = self.write_and_verify(pin, false);
        if let Err(e) = self.driver.cleanup(pin) {
            warn!(pin, error = %e, "Pin cleanup failed");
        }

        self.registry.remove(pin);
        self.last_document_state.remove(&pin);
        self.overrides.remove_pin(pin);
    }

    // ─── Commands ───────────────────────────────────────────────────

    async fn handle_command(&mut self, id: String, command: DeviceCommand) {
        info!(command_id = %id, ?command, "Processing command");

        match command {
            DeviceCommand::PinControl { pin, on, duration } => {
                if !self.registry.contains(pin) {
                    warn!(pin, command_id = %id, "Command for unknown pin ignored");
                } else {
                    self.command_pin_control(pin, on, duration);
                }
            }
            DeviceCommand::PwmControl { pin, duty } => {
                if !self.registry.contains(pin) {
                    warn!(pin, command_id = %id, "Command for unknown pin ignored");
                } else {
                    self.apply_pwm(pin, duty, true);
                }
            }
            DeviceCommand::EmergencyStop => {
                let _ = self.emergency_stop_sweep().await;
            }
        }

        // Command documents are consumed on completion. The delete is a
        // store round-trip; it must not stall the inbox.
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.delete_command(&id).await {
                warn!(command_id = %id, error = %e, "Failed to delete processed command");
            }
        });
    }

    fn command_pin_control(&mut self, pin: u8, on: bool, duration: Option<u64>) {
        if let Some(entry) = self.registry.get_mut(pin) {
            entry.restore_available();
        }
        self.registry.set_desired(pin, on);
        self.last_document_state.insert(pin, on);

        if !on && self.executors.any_on_pin(pin) {
            self.overrides.engage(pin);
        }
        if on {
            self.overrides.clear(pin);
        }

        let hw = self.write_and_verify(pin, on).unwrap_or(on);

        let mut update = DocumentUpdate::new();
        update.set_pin_field(pin, fields::STATE, json!(on));
        update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw));
        update.set_pin_field(pin, fields::MISMATCH, json!(on != hw));
        update.set_pin_field(pin, fields::LAST_UPDATED, now_ts());
        update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
        self.spawn_push(update);

        if on {
            if let Some(secs) = duration {
                if secs > 0 {
                    info!(pin, secs, "Auto-OFF scheduled");
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(secs)).await;
                        handle.send(ReconcilerEvent::AutoOff { pin }).await;
                    });
                }
            }
        }
    }

    fn handle_auto_off(&mut self, pin: u8) {
        if !self.registry.contains(pin) {
            return;
        }
        info!(pin, "Auto-OFF after commanded duration");
        self.registry.set_desired(pin, false);
        self.last_document_state.insert(pin, false);
        let hw = self.write_and_verify(pin, false).unwrap_or(false);

        let mut update = DocumentUpdate::new();
        update.set_pin_field(pin, fields::STATE, json!(false));
        update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw));
        update.set_pin_field(pin, fields::MISMATCH, json!(hw));
        update.set_pin_field(pin, fields::LAST_UPDATED, now_ts());
        update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
        self.spawn_push(update);
    }

    // ─── Schedule drives ────────────────────────────────────────────

    fn handle_schedule_drive(&mut self, pin: u8, on: bool, schedule_id: &str, report: bool) {
        if on && self.overrides.contains(pin) {
            debug!(pin, schedule_id, "Schedule drive ignored (user override)");
            return;
        }
        let Some(entry) = self.registry.get(pin) else {
            debug!(pin, schedule_id, "Schedule drive for unknown pin ignored");
            return;
        };
        if !entry.enabled {
            debug!(pin, schedule_id, "Schedule drive ignored (pin disabled)");
            return;
        }

        // Schedule intent is desired state, but the document baseline
        // (`last_document_state`) is left alone: change detection must
        // not be corrupted by schedule cycling.
        self.registry.set_desired(pin, on);
        let hw = self.write_and_verify(pin, on);

        if report {
            let mut update = DocumentUpdate::new();
            update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw.unwrap_or(on)));
            // A schedule controls the pin; by definition not a mismatch.
            update.set_pin_field(pin, fields::MISMATCH, json!(false));
            update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
            self.spawn_push(update);
        }
    }

    // ─── Hardware sync ──────────────────────────────────────────────

    fn handle_read_sweep(&mut self) {
        for pin in self.registry.pin_numbers() {
            let Some(entry) = self.registry.get(pin) else {
                continue;
            };
            if !entry.available {
                continue;
            }
            let active_low = entry.active_low;
            let desired = entry.desired;

            let raw = match self.driver.read(pin) {
                Ok(raw) => raw,
                Err(e) => {
                    self.note_fault(pin, &e);
                    continue;
                }
            };
            if let Some(entry) = self.registry.get_mut(pin) {
                entry.record_ok();
            }
            let hw = from_level(raw, active_low);
            self.registry.set_hardware(pin, hw);

            if desired == hw {
                continue;
            }

            if self.executors.any_on_pin(pin) {
                debug!(pin, desired, hardware = hw, "Drift expected - schedule active");
                continue;
            }

            warn!(
                pin,
                desired,
                hardware = hw,
                "MISMATCH detected, re-asserting desired state"
            );
            if let Some(hw_after) = self.write_and_verify(pin, desired) {
                let mut update = DocumentUpdate::new();
                update.set_pin_field(pin, fields::HARDWARE_STATE, json!(hw_after));
                update.set_pin_field(pin, fields::MISMATCH, json!(desired != hw_after));
                update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
                self.spawn_push(update);
            }
        }
    }

    fn handle_push_snapshot(&mut self) {
        if self.registry.is_empty() {
            let mut update = DocumentUpdate::new();
            update.set_heartbeat();
            self.spawn_push(update);
            return;
        }

        let mut update = DocumentUpdate::new();
        for entry in self.registry.pins() {
            let controlled = self.executors.any_on_pin(entry.pin);
            let mismatch = entry.mismatch() && !controlled;
            update.set_pin_field(entry.pin, fields::HARDWARE_STATE, json!(entry.hardware));
            update.set_pin_field(entry.pin, fields::MISMATCH, json!(mismatch));
            update.set_pin_field(entry.pin, fields::LAST_HARDWARE_READ, now_ts());
            update.set_pin_field(entry.pin, fields::PWM_DUTY_CYCLE, json!(entry.pwm_duty));
        }
        update.set_heartbeat();

        debug!(pins = self.registry.len(), "Hardware snapshot push");
        self.spawn_push(update);
    }

    // ─── Emergency stop ─────────────────────────────────────────────

    /// Force every pin off, polarity-aware, clearing PWM and emptying the
    /// executor set. Driver faults are logged and the sweep continues to
    /// completion; the document update happens synchronously either way.
    async fn emergency_stop_sweep(&mut self) -> ControlResult<()> {
        error!("EMERGENCY STOP - forcing all pins OFF");

        self.executors.abort_all();
        let pins = self.registry.pin_numbers();
        self.overrides.engage_all(&pins);

        let mut update = DocumentUpdate::new();
        for pin in pins {
            let active_low = self
                .registry
                .get(pin)
                .map(|e| e.active_low)
                .unwrap_or(false);

            if let Err(e) = self.driver.set_pwm(pin, 0) {
                error!(pin, error = %e, "Emergency stop: PWM clear failed, continuing");
            }
            let off_level = to_level(false, active_low);
            if let Err(e) = self.driver.write(pin, off_level) {
                error!(pin, error = %e, "Emergency stop: write failed, continuing");
            }

            if let Some(entry) = self.registry.get_mut(pin) {
                entry.desired = false;
                entry.hardware = false;
                entry.pwm_duty = 0;
            }
            self.last_document_state.insert(pin, false);

            update.set_pin_field(pin, fields::STATE, json!(false));
            update.set_pin_field(pin, fields::HARDWARE_STATE, json!(false));
            update.set_pin_field(pin, fields::MISMATCH, json!(false));
            update.set_pin_field(pin, fields::PWM_DUTY_CYCLE, json!(0));
            update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());
        }

        update.set(fields::LAST_EMERGENCY_STOP, now_ts());
        update.set_heartbeat();

        let result = self.store.update_device(update).await;
        match &result {
            Ok(()) => error!("EMERGENCY STOP COMPLETE - all pins forced OFF, document updated"),
            Err(e) => error!(error = %e, "Emergency stop document update failed"),
        }
        result
    }

    // ─── Driver access ──────────────────────────────────────────────

    /// Drive a logical state onto a pin and read it back immediately.
    /// Returns the logical hardware state observed, or None on fault.
    fn write_and_verify(&mut self, pin: u8, state: bool) -> Option<bool> {
        let entry = self.registry.get(pin)?;
        if !entry.available {
            debug!(pin, "Write skipped, pin unavailable after repeated faults");
            return None;
        }
        let active_low = entry.active_low;

        let level = to_level(state, active_low);
        if let Err(e) = self.driver.write(pin, level) {
            self.note_fault(pin, &e);
            return None;
        }

        match self.driver.read(pin) {
            Ok(raw) => {
                let hw = from_level(raw, active_low);
                if let Some(entry) = self.registry.get_mut(pin) {
                    entry.record_ok();
                }
                self.registry.set_hardware(pin, hw);
                if hw == state {
                    info!(pin, state, active_low, "Pin driven and confirmed");
                } else {
                    error!(
                        pin,
                        set = state,
                        hardware = hw,
                        active_low,
                        "MISMATCH: pin did not take the driven level"
                    );
                }
                Some(hw)
            }
            Err(e) => {
                self.note_fault(pin, &e);
                None
            }
        }
    }

    /// Read a pin into the registry without driving it.
    fn refresh_hardware(&mut self, pin: u8) -> Option<bool> {
        let active_low = self.registry.get(pin)?.active_low;
        match self.driver.read(pin) {
            Ok(raw) => {
                let hw = from_level(raw, active_low);
                self.registry.set_hardware(pin, hw);
                Some(hw)
            }
            Err(e) => {
                self.note_fault(pin, &e);
                None
            }
        }
    }

    fn apply_pwm(&mut self, pin: u8, duty: u8, push: bool) {
        let Some(entry) = self.registry.get(pin) else {
            warn!(pin, "PWM change for unknown pin ignored");
            return;
        };
        if !entry.available {
            debug!(pin, "PWM skipped, pin unavailable after repeated faults");
            return;
        }

        match self.driver.set_pwm(pin, duty) {
            Ok(()) => {
                if let Some(entry) = self.registry.get_mut(pin) {
                    entry.record_ok();
                }
                self.registry.set_pwm(pin, duty);
                if duty == 0 {
                    // Duty 0 stops PWM and leaves the pin LOW: logical
                    // OFF by contract, regardless of polarity.
                    self.registry.set_hardware(pin, false);
                    info!(pin, "PWM stopped (0% = OFF)");
                } else {
                    info!(pin, duty, "PWM duty applied");
                }
                if push {
                    let mut update = DocumentUpdate::new();
                    update.set_pin_field(pin, fields::PWM_DUTY_CYCLE, json!(duty));
                    update.set_pin_field(pin, fields::LAST_UPDATED, now_ts());
                    self.spawn_push(update);
                }
            }
            Err(e) => self.note_fault(pin, &e),
        }
    }

    fn note_fault(&mut self, pin: u8, err: &ControlError) {
        error!(pin, error = %err, "Driver fault");
        if let Some(entry) = self.registry.get_mut(pin) {
            if entry.record_fault() {
                error!(pin, "Pin marked unavailable until the next document change");
            }
        }
    }

    /// Push a document update without blocking the inbox. Failures are
    /// logged; the periodic sync covers the state on its next cadence.
    fn spawn_push(&self, update: DocumentUpdate) {
        if update.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.update_device(update).await {
                error!(error = %e, "Async document write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{SimulatedHandle, SimulatedPinDriver};
    use crate::store::MemoryDocumentStore;
    use serde_json::json;

    struct Fixture {
        recon: Reconciler,
        sim: SimulatedHandle,
        store: Arc<MemoryDocumentStore>,
        overrides: Arc<OverrideSet>,
        executors: Arc<ExecutorSet>,
    }

    fn fixture() -> Fixture {
        let (driver, sim) = SimulatedPinDriver::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let overrides = Arc::new(OverrideSet::new());
        let executors = Arc::new(ExecutorSet::new());
        let (recon, _handle, _rx) = Reconciler::new(
            Box::new(driver),
            store.clone() as Arc<dyn DocumentStore>,
            overrides.clone(),
            executors.clone(),
        );
        Fixture {
            recon,
            sim,
            store,
            overrides,
            executors,
        }
    }

    fn doc(raw: serde_json::Value) -> DeviceDocument {
        DeviceDocument::parse(&raw)
    }

    #[tokio::test]
    async fn boot_forces_everything_off() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({
                "gpioState": {
                    "17": {"enabled": true, "state": true, "active_low": false},
                    "26": {"enabled": true, "state": true, "active_low": true}
                }
            })))
            .await;

        // Electrical OFF respects polarity.
        assert_eq!(fx.sim.level(17), Some(false));
        assert_eq!(fx.sim.level(26), Some(true));
        // Stale state cleared in the document.
        assert_eq!(fx.store.get_path("gpioState.17.state"), Some(json!(false)));
        assert_eq!(fx.store.get_path("gpioState.26.state"), Some(json!(false)));
        assert_eq!(
            fx.store.get_path("gpioState.17.hardwareState"),
            Some(json!(false))
        );
        assert_eq!(fx.store.get_path("status"), Some(json!("online")));
        assert!(!fx.recon.registry.get(17).unwrap().desired);
    }

    #[tokio::test]
    async fn document_state_change_drives_pin() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"18": {"enabled": true}}})))
            .await;

        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"18": {"enabled": true, "state": true}}
            })))
            .await;

        assert_eq!(fx.sim.level(18), Some(true));
        assert!(fx.recon.registry.get(18).unwrap().desired);
        assert!(fx.recon.registry.get(18).unwrap().hardware);
    }

    #[tokio::test]
    async fn active_low_state_true_drives_low() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({
                "gpioState": {"26": {"enabled": true, "active_low": true}}
            })))
            .await;

        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"26": {"enabled": true, "active_low": true, "state": true}}
            })))
            .await;

        assert_eq!(fx.sim.level(26), Some(false));
        // LOW reads back as logically ON.
        assert!(fx.recon.registry.get(26).unwrap().hardware);
    }

    #[tokio::test]
    async fn polarity_change_rewrites_unchanged_state() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"21": {"enabled": true}}})))
            .await;
        assert_eq!(fx.sim.level(21), Some(false));

        // State stays false, but the pin flips active-low: OFF is now HIGH.
        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"21": {"enabled": true, "active_low": true, "state": false}}
            })))
            .await;
        assert_eq!(fx.sim.level(21), Some(true));
    }

    #[tokio::test]
    async fn disabled_pin_change_ignored() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"18": {"enabled": true}}})))
            .await;

        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"18": {"enabled": false, "state": true}}
            })))
            .await;
        assert_eq!(fx.sim.level(18), Some(false));
    }

    #[tokio::test]
    async fn hot_init_applies_on_state() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {}})))
            .await;

        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"23": {"enabled": true, "state": true}}
            })))
            .await;

        assert!(fx.sim.is_configured(23));
        assert_eq!(fx.sim.level(23), Some(true));
        assert!(fx.recon.registry.contains(23));
    }

    #[tokio::test]
    async fn hot_remove_forces_off_and_releases() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"23": {"enabled": true}}})))
            .await;
        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"23": {"enabled": true, "state": true}}
            })))
            .await;
        assert_eq!(fx.sim.level(23), Some(true));

        fx.recon.apply_snapshot(doc(json!({"gpioState": {}}))).await;
        assert!(!fx.sim.is_configured(23));
        assert!(!fx.recon.registry.contains(23));
    }

    #[tokio::test]
    async fn malformed_entry_is_skipped_not_removed() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"18": {"enabled": true}}})))
            .await;

        // The entry turns to garbage in the document; the pin must stay
        // configured and tracked.
        fx.recon
            .apply_snapshot(doc(json!({"gpioState": {"18": "garbage"}})))
            .await;
        assert!(fx.sim.is_configured(18));
        assert!(fx.recon.registry.contains(18));
    }

    #[tokio::test]
    async fn read_sweep_repairs_external_drift() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"26": {"enabled": true, "active_low": true}}})))
            .await;
        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"26": {"enabled": true, "active_low": true, "state": true}}
            })))
            .await;
        assert_eq!(fx.sim.level(26), Some(false));

        // Someone forces the relay line HIGH behind our back.
        fx.sim.force_level(26, true);
        fx.recon.handle_read_sweep();

        // Auto-repair re-asserted LOW.
        assert_eq!(fx.sim.level(26), Some(false));
        assert!(fx.recon.registry.get(26).unwrap().hardware);
    }

    #[tokio::test]
    async fn read_sweep_leaves_schedule_controlled_pins() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"19": {"enabled": true}}})))
            .await;

        fx.executors.try_claim(19, "s1");
        fx.sim.force_level(19, true); // drift while schedule holds the pin
        fx.recon.handle_read_sweep();

        // Not repaired: the schedule owns the pin.
        assert_eq!(fx.sim.level(19), Some(true));
    }

    #[tokio::test]
    async fn idempotent_writes_skip_unchanged_state() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"18": {"enabled": true}}})))
            .await;

        let snapshot = json!({
            "gpioState": {"18": {"enabled": true, "state": true}}
        });
        fx.recon.apply_snapshot(doc(snapshot.clone())).await;
        assert_eq!(fx.sim.level(18), Some(true));

        // Drift the pin, then replay the identical document: no state
        // change is detected, so no write happens (the read sweep owns
        // drift repair).
        fx.sim.force_level(18, false);
        fx.recon.apply_snapshot(doc(snapshot)).await;
        assert_eq!(fx.sim.level(18), Some(false));
    }

    #[tokio::test]
    async fn schedule_drive_respects_override() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"19": {"enabled": true}}})))
            .await;

        fx.overrides.engage(19);
        fx.recon.handle_schedule_drive(19, true, "s1", false);
        assert_eq!(fx.sim.level(19), Some(false));

        // OFF drives still pass (they restore safety).
        fx.recon.handle_schedule_drive(19, false, "s1", false);
        assert_eq!(fx.sim.level(19), Some(false));
    }

    #[tokio::test]
    async fn schedule_drive_does_not_touch_document_baseline() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"19": {"enabled": true}}})))
            .await;

        fx.recon.handle_schedule_drive(19, true, "s1", false);
        assert_eq!(fx.recon.last_document_state.get(&19), Some(&false));
        assert!(fx.recon.registry.get(19).unwrap().desired);
    }

    #[tokio::test]
    async fn command_off_engages_override_when_schedule_runs() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"19": {"enabled": true}}})))
            .await;
        fx.executors.try_claim(19, "s1");
        fx.recon.handle_schedule_drive(19, true, "s1", false);

        fx.recon
            .handle_command(
                "cmd-1".into(),
                DeviceCommand::PinControl {
                    pin: 19,
                    on: false,
                    duration: None,
                },
            )
            .await;

        assert!(fx.overrides.contains(19));
        assert_eq!(fx.sim.level(19), Some(false));

        // The document push is spawned; give it a beat to land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(fx.store.get_path("gpioState.19.state"), Some(json!(false)));
    }

    #[tokio::test]
    async fn command_on_clears_override() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"19": {"enabled": true}}})))
            .await;
        fx.overrides.engage(19);

        fx.recon
            .handle_command(
                "cmd-2".into(),
                DeviceCommand::PinControl {
                    pin: 19,
                    on: true,
                    duration: None,
                },
            )
            .await;

        assert!(!fx.overrides.contains(19));
        assert_eq!(fx.sim.level(19), Some(true));
    }

    #[tokio::test]
    async fn pwm_zero_stops_and_reports_off() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({
                "gpioState": {"12": {"enabled": true, "mode": "pwm", "active_low": true}}
            })))
            .await;

        fx.recon.apply_pwm(12, 60, true);
        assert_eq!(fx.sim.duty(12), Some(60));

        fx.recon.apply_pwm(12, 0, true);
        assert_eq!(fx.sim.duty(12), Some(0));
        // Pin LOW and logically OFF regardless of polarity.
        assert_eq!(fx.sim.level(12), Some(false));
        assert!(!fx.recon.registry.get(12).unwrap().hardware);
    }

    #[tokio::test]
    async fn emergency_stop_sweeps_all_pins() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({
                "gpioState": {
                    "4": {"enabled": true},
                    "17": {"enabled": true},
                    "26": {"enabled": true, "active_low": true}
                }
            })))
            .await;
        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {
                    "4": {"enabled": true, "state": true},
                    "17": {"enabled": true, "state": true},
                    "26": {"enabled": true, "active_low": true, "state": true}
                }
            })))
            .await;
        fx.executors.try_claim(17, "s1");

        fx.recon.emergency_stop_sweep().await.unwrap();

        assert_eq!(fx.sim.level(4), Some(false));
        assert_eq!(fx.sim.level(17), Some(false));
        assert_eq!(fx.sim.level(26), Some(true)); // active-low OFF = HIGH
        assert_eq!(fx.executors.running_count(), 0);
        assert!(fx.overrides.contains(4));
        assert!(fx.overrides.contains(17));
        assert!(fx.overrides.contains(26));
        assert_eq!(fx.store.get_path("gpioState.17.state"), Some(json!(false)));
        assert_eq!(
            fx.store.get_path("gpioState.26.hardwareState"),
            Some(json!(false))
        );
        assert!(fx.store.get_path("lastEmergencyStop").is_some());
    }

    #[tokio::test]
    async fn fault_streak_marks_pin_unavailable() {
        let mut fx = fixture();
        fx.recon
            .boot_populate(doc(json!({"gpioState": {"7": {"enabled": true}}})))
            .await;

        // Release the pin behind the reconciler's back so writes fault.
        fx.sim.force_level(7, false);
        let mut broken = fx.recon.registry.get(7).cloned().unwrap();
        assert!(broken.available);
        // Two consecutive faults via the public bookkeeping path.
        fx.recon
            .note_fault(7, &ControlError::driver_fault(7, "io error"));
        fx.recon
            .note_fault(7, &ControlError::driver_fault(7, "io error"));
        broken = fx.recon.registry.get(7).cloned().unwrap();
        assert!(!broken.available);

        // A document change touching the pin restores availability.
        fx.recon
            .apply_snapshot(doc(json!({
                "gpioState": {"7": {"enabled": true, "state": true}}
            })))
            .await;
        assert!(fx.recon.registry.get(7).unwrap().available);
        assert_eq!(fx.sim.level(7), Some(true));
    }
}
