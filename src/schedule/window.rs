// growerd: Window evaluator worker
//
// Periodically re-evaluates every schedule's time window against the
// local wall clock. Schedules that just entered their window get an
// executor (and release any standing user override: cleared-by-intent);
// schedules that exited rely on the executor's in-loop polling to stop.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::runtime_config::RuntimeConfig;

use super::ScheduleEngine;

pub async fn run_window_evaluator(
    engine: ScheduleEngine,
    config: Arc<RuntimeConfig>,
    mut stop: watch::Receiver<bool>,
) {
    info!("Window evaluator running");

    loop {
        let interval = config.window_recheck_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let flips = engine.cache.reevaluate_windows(Local::now().time());
        for flip in flips {
            if !flip.active {
                continue;
            }
            if engine.executors.is_running(flip.pin, &flip.schedule_id) {
                continue;
            }
            // A schedule freshly entering its window is intent to run;
            // any stale override on the pin gives way.
            engine.overrides.clear(flip.pin);
            info!(
                pin = flip.pin,
                schedule_id = %flip.schedule_id,
                "Schedule entered window, starting executor"
            );
            engine.start(flip.pin, &flip.schedule_id);
        }

        // Re-trigger schedules that are in-window but not running (an
        // executor stopped by an override that has since been lifted).
        // A standing override blocks the pin until the user commands ON.
        for (pin, schedules) in engine.cache.all() {
            if engine.overrides.contains(pin) {
                continue;
            }
            for (id, sched) in schedules {
                if sched.active && !engine.executors.is_running(pin, &id) {
                    info!(pin, schedule_id = %id, "Re-triggering in-window schedule");
                    engine.start(pin, &id);
                }
            }
        }

        debug!("Window sweep completed");
    }

    info!("Window evaluator stopped");
}
