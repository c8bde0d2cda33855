// growerd: Safety supervisor primitives
//
// The boot protocol and the emergency-stop sweep themselves run inside
// the reconciler (the only worker allowed to touch driver and registry);
// this module owns the user-override registry those paths share, and
// builds the boot-safety document update.

use std::collections::HashSet;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{info, warn};

use crate::gpio::PinRegistry;
use crate::model::{fields, now_ts, DocumentUpdate};

/// Set of pins where user intent (OFF) currently supersedes schedule
/// intent (ON).
///
/// A pin joins the set when the user commands OFF while a schedule is
/// executing on it; every executor on that pin observes membership within
/// one poll interval and exits. The pin leaves the set when the user
/// commands ON, or when the window evaluator sees a schedule freshly
/// enter its window (cleared-by-intent).
#[derive(Default)]
pub struct OverrideSet {
    pins: RwLock<HashSet<u8>>,
}

impl OverrideSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self, pin: u8) {
        if self.pins.write().insert(pin) {
            info!(pin, "User override engaged, schedules on this pin will stop");
        }
    }

    pub fn clear(&self, pin: u8) {
        if self.pins.write().remove(&pin) {
            info!(pin, "User override cleared");
        }
    }

    pub fn contains(&self, pin: u8) -> bool {
        self.pins.read().contains(&pin)
    }

    /// Engage every listed pin at once (emergency stop).
    pub fn engage_all(&self, pins: &[u8]) {
        let mut set = self.pins.write();
        for pin in pins {
            set.insert(*pin);
        }
    }

    pub fn remove_pin(&self, pin: u8) {
        self.pins.write().remove(&pin);
    }

    pub fn len(&self) -> usize {
        self.pins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.read().is_empty()
    }
}

/// Build the boot-safety document update after the registry has been
/// populated from the initial snapshot.
///
/// Every pin's desired state has already been forced OFF locally; this
/// clears any stale `state=true` left in the document by a previous
/// session (the user must explicitly re-enable actuators after a
/// restart), reports the just-read hardware levels, creates the document
/// fields a freshly discovered pin is missing, and stamps presence.
pub fn boot_safety_update(
    registry: &PinRegistry,
    stale_on_pins: &[u8],
    created_pins: &[u8],
) -> DocumentUpdate {
    let mut update = DocumentUpdate::new();

    for entry in registry.pins() {
        let pin = entry.pin;
        update.set_pin_field(pin, fields::HARDWARE_STATE, json!(entry.hardware));
        update.set_pin_field(pin, fields::MISMATCH, json!(false));
        update.set_pin_field(pin, fields::LAST_HARDWARE_READ, now_ts());

        if stale_on_pins.contains(&pin) {
            warn!(
                pin,
                "SAFETY: stale state=true cleared on boot, re-enable from the webapp"
            );
            update.set_pin_field(pin, fields::STATE, json!(false));
        }

        if created_pins.contains(&pin) {
            update.set_pin_field(pin, "pin", json!(pin));
            update.set_pin_field(pin, "name", json!(entry.name));
            update.set_pin_field(pin, "default_name", json!(entry.default_name));
            update.set_pin_field(pin, "name_customized", json!(entry.name_customized));
            update.set_pin_field(pin, "mode", json!(entry.mode.as_str()));
            update.set_pin_field(pin, "enabled", json!(entry.enabled));
            update.set_pin_field(pin, fields::STATE, json!(false));
            update.set_pin_field(pin, fields::PWM_DUTY_CYCLE, json!(entry.pwm_duty));
        }
    }

    update.set_heartbeat();
    update
}
