// growerd: Document watcher worker
//
// Watches the remote device document, its config/intervals child and the
// commands subcollection, translating remote changes into inbox events.
// The initial snapshot populates state without applying it (boot safety
// has primacy); every subsequent change is diffed and applied. Store
// failures back off exponentially with jitter; after a reconnect the next
// snapshot is treated as non-initial, so diffs apply normally.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::model::{DeviceCommand, DeviceDocument};
use crate::reconcile::ReconcilerHandle;
use crate::runtime_config::RuntimeConfig;
use crate::schedule::ScheduleEngine;
use crate::store::DocumentStore;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_JITTER_MS: u64 = 250;

pub struct DocumentWatcher {
    store: Arc<dyn DocumentStore>,
    recon: ReconcilerHandle,
    schedules: ScheduleEngine,
    config: Arc<RuntimeConfig>,
    poll_interval: Duration,
    last_device: Option<Value>,
    last_intervals: Option<Value>,
    seen_commands: HashSet<String>,
}

impl DocumentWatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        recon: ReconcilerHandle,
        schedules: ScheduleEngine,
        config: Arc<RuntimeConfig>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            recon,
            schedules,
            config,
            poll_interval,
            last_device: None,
            last_intervals: None,
            seen_commands: HashSet::new(),
        }
    }

    /// Initial read at startup. An unreachable store is a fatal
    /// initialisation error; a missing device document is not (the device
    /// waits for pins to be provisioned from the webapp).
    pub async fn bootstrap(&mut self) -> ControlResult<()> {
        match self.store.fetch_intervals().await {
            Ok(Some(intervals)) => {
                self.config.apply_document(&intervals);
                self.last_intervals = Some(intervals);
            }
            Ok(None) => debug!("No intervals document, using cached/default values"),
            Err(e) => warn!(error = %e, "Intervals unavailable at startup, using cached/default values"),
        }

        let raw = self.store.fetch_device().await.map_err(|e| {
            ControlError::FatalInit(format!("cannot read device document: {e}"))
        })?;

        match &raw {
            Some(value) => {
                let doc = DeviceDocument::parse(value);
                info!(pins = doc.pins.len(), "Initial device document loaded");
                self.schedules.ingest_document(&doc, true);
                self.recon.snapshot(doc, true).await;
            }
            None => {
                warn!("Device document not found - waiting for pins to be added from the webapp");
            }
        }
        self.last_device = raw;
        Ok(())
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "Document watcher running"
        );

        let mut backoff = BACKOFF_INITIAL;
        let mut delay = self.poll_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.poll_once().await {
                Ok(()) => {
                    backoff = BACKOFF_INITIAL;
                    delay = self.poll_interval;
                }
                Err(e) => {
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS));
                    warn!(
                        error = %e,
                        retry_in_s = backoff.as_secs(),
                        "Document store unreachable, backing off"
                    );
                    delay = backoff + jitter;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        info!("Document watcher stopped");
    }

    async fn poll_once(&mut self) -> ControlResult<()> {
        // Device document: change detection against the last seen value.
        let raw = self.store.fetch_device().await?;
        if raw != self.last_device {
            let doc = match &raw {
                Some(value) => DeviceDocument::parse(value),
                // The whole document vanished: every pin hot-removes.
                None => DeviceDocument::default(),
            };
            debug!(pins = doc.pins.len(), "Device document changed");
            self.schedules.ingest_document(&doc, false);
            self.recon.snapshot(doc, false).await;
            self.last_device = raw;
        }

        // Interval tuning.
        let intervals = self.store.fetch_intervals().await?;
        if intervals != self.last_intervals {
            if let Some(value) = &intervals {
                self.config.apply_document(value);
            }
            self.last_intervals = intervals;
        }

        // Explicit commands, delivered exactly once per id.
        let commands = self.store.list_commands().await?;
        let listed: HashSet<String> = commands.iter().map(|(id, _)| id.clone()).collect();
        self.seen_commands.retain(|id| listed.contains(id));

        for (id, body) in commands {
            if !self.seen_commands.insert(id.clone()) {
                continue;
            }
            match DeviceCommand::parse(&body) {
                Ok(command) => {
                    info!(command_id = %id, "Command received");
                    self.recon.command(id, command).await;
                }
                Err(e) => {
                    error!(command_id = %id, error = %e, "Malformed command discarded");
                    if let Err(e) = self.store.delete_command(&id).await {
                        warn!(command_id = %id, error = %e, "Failed to delete malformed command");
                    }
                }
            }
        }

        Ok(())
    }
}
