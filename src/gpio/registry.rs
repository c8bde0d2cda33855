// growerd: In-memory pin registry
//
// The registry records intent and observation per pin; it never writes to
// the pin driver. It is owned exclusively by the reconciler worker
// (single-writer discipline, no locks); readers receive copy-on-write
// snapshots through a watch channel republished after every mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::model::{PinConfig, PinMode};

/// Consecutive driver faults after which a pin is marked unavailable
/// until the next document change touching it.
const FAULT_UNAVAILABLE_THRESHOLD: u8 = 2;

/// One pin as the registry tracks it.
#[derive(Debug, Clone, Serialize)]
pub struct PinEntry {
    pub pin: u8,
    pub name: String,
    pub default_name: String,
    pub name_customized: bool,
    pub mode: PinMode,
    pub active_low: bool,
    pub enabled: bool,
    /// Logical state the pin is supposed to be at.
    pub desired: bool,
    /// Logical state last read back from hardware.
    pub hardware: bool,
    pub pwm_duty: u8,
    /// False once the fault streak crosses the threshold; restored on the
    /// next document change for this pin.
    pub available: bool,
    #[serde(skip)]
    pub fault_streak: u8,
    pub last_read: Option<DateTime<Utc>>,
}

impl PinEntry {
    pub fn from_config(cfg: &PinConfig) -> Self {
        PinEntry {
            pin: cfg.pin,
            name: cfg.name.clone(),
            default_name: cfg.default_name.clone(),
            name_customized: cfg.name_customized,
            mode: cfg.mode,
            active_low: cfg.active_low,
            enabled: cfg.enabled,
            desired: false,
            hardware: false,
            pwm_duty: cfg.pwm_duty,
            available: true,
            fault_streak: 0,
            last_read: None,
        }
    }

    /// Desired and observed state disagree.
    pub fn mismatch(&self) -> bool {
        self.desired != self.hardware
    }

    /// Record a driver fault; returns true if the pin just became
    /// unavailable.
    pub fn record_fault(&mut self) -> bool {
        self.fault_streak = self.fault_streak.saturating_add(1);
        if self.fault_streak >= FAULT_UNAVAILABLE_THRESHOLD && self.available {
            self.available = false;
            return true;
        }
        false
    }

    /// Record a successful driver interaction.
    pub fn record_ok(&mut self) {
        self.fault_streak = 0;
    }

    /// A document change touching this pin restores availability.
    pub fn restore_available(&mut self) {
        self.fault_streak = 0;
        self.available = true;
    }
}

/// Copy-on-read snapshot handed to the HTTP surface and other readers.
pub type RegistrySnapshot = Arc<BTreeMap<u8, PinEntry>>;

/// Index-keyed registry of all known pins.
pub struct PinRegistry {
    pins: BTreeMap<u8, PinEntry>,
    snapshot_tx: watch::Sender<RegistrySnapshot>,
}

impl PinRegistry {
    pub fn new() -> (Self, watch::Receiver<RegistrySnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(BTreeMap::new()));
        (
            Self {
                pins: BTreeMap::new(),
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    pub fn upsert(&mut self, entry: PinEntry) {
        self.pins.insert(entry.pin, entry);
    }

    pub fn remove(&mut self, pin: u8) -> Option<PinEntry> {
        self.pins.remove(&pin)
    }

    pub fn get(&self, pin: u8) -> Option<&PinEntry> {
        self.pins.get(&pin)
    }

    pub fn get_mut(&mut self, pin: u8) -> Option<&mut PinEntry> {
        self.pins.get_mut(&pin)
    }

    pub fn contains(&self, pin: u8) -> bool {
        self.pins.contains_key(&pin)
    }

    pub fn pins(&self) -> impl Iterator<Item = &PinEntry> {
        self.pins.values()
    }

    pub fn pin_numbers(&self) -> Vec<u8> {
        self.pins.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn set_desired(&mut self, pin: u8, state: bool) {
        if let Some(entry) = self.pins.get_mut(&pin) {
            entry.desired = state;
        }
    }

    pub fn set_hardware(&mut self, pin: u8, state: bool) {
        if let Some(entry) = self.pins.get_mut(&pin) {
            entry.hardware = state;
            entry.last_read = Some(Utc::now());
        }
    }

    pub fn set_pwm(&mut self, pin: u8, duty: u8) {
        if let Some(entry) = self.pins.get_mut(&pin) {
            entry.pwm_duty = duty.min(100);
        }
    }

    /// Republish the copy-on-read snapshot. Called by the reconciler after
    /// every processed event.
    pub fn publish(&self) {
        let _ = self.snapshot_tx.send(Arc::new(self.pins.clone()));
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        Arc::new(self.pins.clone())
    }
}
