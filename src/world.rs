// growerd: World wiring
//
// The single value owning every singleton: settings, store, driver,
// config provider, shared sets, and the channels between workers. Built
// once by main; no package-level globals beyond it.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};
use crate::gpio::{PinDriver, RppalPinDriver, SimulatedPinDriver};
use crate::http::{self, HttpState, LogBuffer};
use crate::reconcile::Reconciler;
use crate::runtime_config::RuntimeConfig;
use crate::safety::OverrideSet;
use crate::schedule::{window, ExecutorSet, ScheduleCache, ScheduleEngine};
use crate::settings::Settings;
use crate::store::{DocumentStore, MemoryDocumentStore, RestDocumentStore};
use crate::sync::run_hardware_sync;
use crate::watcher::DocumentWatcher;

/// How long workers get to drain after the stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct World {
    settings: Settings,
    serial: String,
    logs: LogBuffer,
    store: Arc<dyn DocumentStore>,
    driver: Box<dyn PinDriver>,
    config: Arc<RuntimeConfig>,
}

impl World {
    /// Resolve identity, credentials, store and driver. Every failure
    /// here is fatal (exit code 1).
    pub fn build(settings: Settings, logs: LogBuffer) -> ControlResult<Self> {
        let serial = settings.resolve_serial();
        info!(serial = %serial, simulate = settings.simulate, "Initialising growerd");

        let token = settings.load_credentials()?;
        let store: Arc<dyn DocumentStore> = match &token {
            Some(token) => Arc::new(RestDocumentStore::new(
                &settings.store_url,
                &serial,
                Some(token),
            )?),
            None => {
                info!("No credentials in simulation mode - using the in-memory store");
                Arc::new(MemoryDocumentStore::new())
            }
        };

        let driver: Box<dyn PinDriver> = if settings.simulate {
            let (driver, _) = SimulatedPinDriver::new();
            info!("GPIO simulation mode (no hardware)");
            Box::new(driver)
        } else {
            Box::new(RppalPinDriver::new().map_err(|e| {
                ControlError::FatalInit(format!("GPIO driver init failed: {e}"))
            })?)
        };

        let config = Arc::new(RuntimeConfig::with_cache_dir(&settings.data_dir));

        Ok(Self {
            settings,
            serial,
            logs,
            store,
            driver,
            config,
        })
    }

    /// Spawn every worker and run until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ControlResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let overrides = Arc::new(OverrideSet::new());
        let executors = Arc::new(ExecutorSet::new());
        let cache = Arc::new(ScheduleCache::new());

        let (reconciler, recon, registry_rx) = Reconciler::new(
            self.driver,
            Arc::clone(&self.store),
            Arc::clone(&overrides),
            Arc::clone(&executors),
        );

        let engine = ScheduleEngine::new(
            cache,
            executors,
            overrides,
            recon.clone(),
            Arc::clone(&self.store),
            stop_rx.clone(),
        );

        let mut watcher = DocumentWatcher::new(
            Arc::clone(&self.store),
            recon.clone(),
            engine.clone(),
            Arc::clone(&self.config),
            Duration::from_millis(self.settings.poll_interval_ms),
        );

        // The diagnostics listener binds before anything is spawned so a
        // taken port fails the whole startup.
        let listener = http::bind(self.settings.http_port).await?;

        // Initial snapshot: populate-not-apply, boot safety. An
        // unreachable store aborts startup here.
        watcher.bootstrap().await?;

        let http_state = HttpState {
            logs: self.logs.clone(),
            registry: registry_rx,
            recon: recon.clone(),
            config: Arc::clone(&self.config),
            serial: self.serial.clone(),
            started_at: Instant::now(),
        };

        let workers = vec![
            tokio::spawn(reconciler.run(stop_rx.clone())),
            tokio::spawn(watcher.run(stop_rx.clone())),
            tokio::spawn(run_hardware_sync(
                recon.clone(),
                Arc::clone(&self.config),
                stop_rx.clone(),
            )),
            tokio::spawn(window::run_window_evaluator(
                engine,
                Arc::clone(&self.config),
                stop_rx.clone(),
            )),
            tokio::spawn(http::serve(http_state, listener, stop_rx.clone())),
        ];

        info!(serial = %self.serial, "growerd online - all workers active");

        shutdown.await;
        info!("Shutdown requested");
        let _ = stop_tx.send(true);

        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Workers did not drain within grace period");
        }

        if let Err(e) = self.store.set_status("offline").await {
            warn!(error = %e, "Could not mark device offline");
        }

        info!("growerd stopped");
        Ok(())
    }
}
