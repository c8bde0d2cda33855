// growerd: Hardware sync worker
//
// One worker, three cadences sharing a single loop:
//   - fast read: poll every pin from hardware into memory (drift repair)
//   - slow push: batch the whole snapshot into one document write
//   - heartbeat: presence stamp when no push happened within its interval
//
// All the hardware access happens inside the reconciler; this worker only
// sends the cadence events into its inbox. Intervals are re-read from the
// config provider every tick so document updates take effect live.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::reconcile::ReconcilerHandle;
use crate::runtime_config::RuntimeConfig;

/// Upper bound on a single sleep; keeps interval changes and the stop
/// signal honoured within a second.
const MAX_TICK: Duration = Duration::from_secs(1);

pub async fn run_hardware_sync(
    recon: ReconcilerHandle,
    config: Arc<RuntimeConfig>,
    mut stop: watch::Receiver<bool>,
) {
    info!(
        read_interval_s = config.local_hardware_read_interval().as_secs(),
        push_interval_s = config.hardware_state_sync_interval().as_secs(),
        "Hardware sync loop running"
    );

    let started = Instant::now();
    let mut last_read = started;
    let mut last_push = started;
    let mut last_heartbeat = started;

    loop {
        let read_interval = config.local_hardware_read_interval();
        let push_interval = config.hardware_state_sync_interval();
        let heartbeat_interval = config.heartbeat_interval();

        let now = Instant::now();
        let next_due = [
            last_read + read_interval,
            last_push + push_interval,
            last_heartbeat + heartbeat_interval,
        ]
        .into_iter()
        .min()
        .expect("three candidates");

        let sleep_for = next_due.saturating_duration_since(now).min(MAX_TICK);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = Instant::now();

        if now >= last_read + read_interval {
            last_read = now;
            recon.read_sweep().await;
        }

        if now >= last_push + push_interval {
            last_push = now;
            // The push carries the heartbeat; one write covers both.
            last_heartbeat = now;
            debug!("Snapshot push due");
            recon.push_snapshot().await;
        } else if now >= last_heartbeat + heartbeat_interval {
            last_heartbeat = now;
            recon.heartbeat().await;
        }
    }

    info!("Hardware sync loop stopped");
}
