// End-to-end control plane tests against the simulated pin driver and
// the in-memory document store: the same worker wiring as production,
// with fast cadences so each scenario settles in a few seconds.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;

use growerd::gpio::{RegistrySnapshot, SimulatedHandle, SimulatedPinDriver};
use growerd::model::DocumentUpdate;
use growerd::reconcile::{Reconciler, ReconcilerHandle};
use growerd::runtime_config::RuntimeConfig;
use growerd::safety::OverrideSet;
use growerd::schedule::{window, ExecutorSet, ScheduleCache, ScheduleEngine};
use growerd::store::{DocumentStore, MemoryDocumentStore};
use growerd::sync::run_hardware_sync;
use growerd::watcher::DocumentWatcher;

const POLL: Duration = Duration::from_millis(50);

struct Rig {
    store: Arc<MemoryDocumentStore>,
    sim: SimulatedHandle,
    recon: ReconcilerHandle,
    overrides: Arc<OverrideSet>,
    executors: Arc<ExecutorSet>,
    #[allow(dead_code)]
    registry: watch::Receiver<RegistrySnapshot>,
    stop: watch::Sender<bool>,
}

impl Rig {
    /// Boot the full worker set against a seeded device document.
    async fn start(device: Value) -> Rig {
        let store = Arc::new(MemoryDocumentStore::new());
        store.put_device(device);
        // Fastest legal read cadence so drift repair settles quickly.
        store.put_intervals(json!({"local_hardware_read_interval_s": 1}));

        let (driver, sim) = SimulatedPinDriver::new();
        let overrides = Arc::new(OverrideSet::new());
        let executors = Arc::new(ExecutorSet::new());
        let cache = Arc::new(ScheduleCache::new());
        let config = Arc::new(RuntimeConfig::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let (reconciler, recon, registry) = Reconciler::new(
            Box::new(driver),
            store.clone() as Arc<dyn DocumentStore>,
            overrides.clone(),
            executors.clone(),
        );

        let engine = ScheduleEngine::new(
            cache,
            executors.clone(),
            overrides.clone(),
            recon.clone(),
            store.clone() as Arc<dyn DocumentStore>,
            stop_rx.clone(),
        );

        let mut watcher = DocumentWatcher::new(
            store.clone() as Arc<dyn DocumentStore>,
            recon.clone(),
            engine.clone(),
            config.clone(),
            POLL,
        );
        watcher.bootstrap().await.unwrap();

        tokio::spawn(reconciler.run(stop_rx.clone()));
        tokio::spawn(watcher.run(stop_rx.clone()));
        tokio::spawn(run_hardware_sync(recon.clone(), config.clone(), stop_rx.clone()));
        tokio::spawn(window::run_window_evaluator(engine, config, stop_rx.clone()));

        Rig {
            store,
            sim,
            recon,
            overrides,
            executors,
            registry,
            stop: stop_tx,
        }
    }

    async fn set_field(&self, path: &str, value: Value) {
        let mut update = DocumentUpdate::new();
        update.set(path, value);
        self.store.update_device(update).await.unwrap();
    }

    fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

/// Poll a condition until it holds or the timeout elapses.
async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_preserves_safety() {
    // Document left over from a previous session: pin 17 stuck ON.
    let rig = Rig::start(json!({
        "gpioState": {
            "17": {"enabled": true, "state": true, "active_low": false, "name": "Pump"}
        }
    }))
    .await;

    wait_for("boot clears stale state", Duration::from_secs(3), || {
        rig.store.get_path("gpioState.17.state") == Some(json!(false))
    })
    .await;

    assert_eq!(rig.sim.level(17), Some(false));
    assert_eq!(
        rig.store.get_path("gpioState.17.hardwareState"),
        Some(json!(false))
    );
    assert_eq!(rig.store.get_path("status"), Some(json!("online")));
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn user_toggle_round_trips() {
    let rig = Rig::start(json!({
        "gpioState": {"18": {"enabled": true, "state": false}}
    }))
    .await;

    // ON: driver HIGH within a second, document reports back.
    rig.set_field("gpioState.18.state", json!(true)).await;
    wait_for("pin 18 high", Duration::from_secs(1), || {
        rig.sim.level(18) == Some(true)
    })
    .await;
    wait_for("hardwareState true", Duration::from_secs(2), || {
        rig.store.get_path("gpioState.18.hardwareState") == Some(json!(true))
            && rig.store.get_path("gpioState.18.mismatch") == Some(json!(false))
    })
    .await;

    // OFF: the round trip completes.
    rig.set_field("gpioState.18.state", json!(false)).await;
    wait_for("hardwareState false", Duration::from_secs(2), || {
        rig.sim.level(18) == Some(false)
            && rig.store.get_path("gpioState.18.hardwareState") == Some(json!(false))
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn schedule_cycles_and_records_last_run() {
    let rig = Rig::start(json!({
        "gpioState": {"19": {"enabled": true, "state": false}}
    }))
    .await;

    // Add a windowless 1s-ON/1s-OFF schedule through the document.
    rig.set_field(
        "gpioState.19.schedules.s1",
        json!({
            "enabled": true,
            "durationSeconds": 1,
            "frequencySeconds": 1,
            "name": "misting"
        }),
    )
    .await;

    wait_for("executor starts and drives ON", Duration::from_secs(2), || {
        rig.sim.level(19) == Some(true)
    })
    .await;

    // It must cycle: observe an OFF phase and a subsequent ON phase.
    wait_for("OFF phase", Duration::from_secs(3), || {
        rig.sim.level(19) == Some(false)
    })
    .await;
    wait_for("next ON phase", Duration::from_secs(3), || {
        rig.sim.level(19) == Some(true)
    })
    .await;

    // Disable the schedule: executor exits within a second, pin OFF,
    // last_run_at recorded.
    rig.set_field("gpioState.19.schedules.s1.enabled", json!(false))
        .await;
    wait_for("executor exits", Duration::from_secs(3), || {
        rig.executors.running_count() == 0
    })
    .await;
    wait_for("pin off and last_run recorded", Duration::from_secs(2), || {
        rig.sim.level(19) == Some(false)
            && rig
                .store
                .get_path("gpioState.19.schedules.s1.last_run_at")
                .is_some()
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn user_override_stops_schedule() {
    let rig = Rig::start(json!({
        "gpioState": {"19": {"enabled": true, "state": false}}
    }))
    .await;

    rig.set_field(
        "gpioState.19.schedules.s1",
        json!({
            "enabled": true,
            "durationSeconds": 2,
            "frequencySeconds": 1,
            "name": "misting"
        }),
    )
    .await;
    wait_for("schedule running", Duration::from_secs(2), || {
        rig.executors.is_running(19, "s1")
    })
    .await;

    // The user had the pin on earlier in the session...
    rig.set_field("gpioState.19.state", json!(true)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    // ...then commands OFF while the schedule is executing.
    rig.set_field("gpioState.19.state", json!(false)).await;

    wait_for("override engages and executor exits", Duration::from_secs(2), || {
        rig.overrides.contains(19) && rig.executors.running_count() == 0
    })
    .await;
    wait_for("pin forced off", Duration::from_secs(1), || {
        rig.sim.level(19) == Some(false)
    })
    .await;

    // The override holds: nothing restarts the executor...
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(rig.executors.running_count(), 0);
    assert_eq!(rig.sim.level(19), Some(false));

    // ...until the user commands ON again.
    rig.set_field("gpioState.19.state", json!(true)).await;
    wait_for("override cleared", Duration::from_secs(1), || {
        !rig.overrides.contains(19)
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn active_low_relay_and_auto_repair() {
    let rig = Rig::start(json!({
        "gpioState": {"26": {"enabled": true, "state": false, "active_low": true}}
    }))
    .await;

    // Boot leaves an active-low pin electrically HIGH (relay off).
    wait_for("boot settles", Duration::from_secs(2), || {
        rig.sim.level(26) == Some(true)
    })
    .await;

    // state=true drives the pin LOW; LOW reads back as logical ON.
    rig.set_field("gpioState.26.state", json!(true)).await;
    wait_for("relay energised (LOW)", Duration::from_secs(1), || {
        rig.sim.level(26) == Some(false)
    })
    .await;
    wait_for("hardwareState reports ON", Duration::from_secs(2), || {
        rig.store.get_path("gpioState.26.hardwareState") == Some(json!(true))
    })
    .await;

    // Someone forces the line HIGH externally: the fast read sweep
    // notices the drift and re-asserts LOW within two cycles.
    rig.sim.force_level(26, true);
    wait_for("auto-repair re-asserts LOW", Duration::from_secs(3), || {
        rig.sim.level(26) == Some(false)
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn emergency_stop_forces_everything_off() {
    let rig = Rig::start(json!({
        "gpioState": {
            "4":  {"enabled": true, "state": false},
            "17": {"enabled": true, "state": false},
            "26": {"enabled": true, "state": false, "active_low": true}
        }
    }))
    .await;

    for pin in [4, 17, 26] {
        rig.set_field(&format!("gpioState.{pin}.state"), json!(true))
            .await;
    }
    wait_for("all pins commanded on", Duration::from_secs(2), || {
        rig.sim.level(4) == Some(true)
            && rig.sim.level(17) == Some(true)
            && rig.sim.level(26) == Some(false)
    })
    .await;

    rig.recon
        .emergency_stop(Duration::from_secs(5))
        .await
        .unwrap();

    // Electrically off, polarity-aware.
    assert_eq!(rig.sim.level(4), Some(false));
    assert_eq!(rig.sim.level(17), Some(false));
    assert_eq!(rig.sim.level(26), Some(true));
    // Document cleared synchronously.
    for pin in [4, 17, 26] {
        assert_eq!(
            rig.store.get_path(&format!("gpioState.{pin}.state")),
            Some(json!(false))
        );
        assert_eq!(
            rig.store.get_path(&format!("gpioState.{pin}.hardwareState")),
            Some(json!(false))
        );
        assert!(rig.overrides.contains(pin));
    }
    assert!(rig.store.get_path("lastEmergencyStop").is_some());
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_init_and_hot_remove() {
    let rig = Rig::start(json!({"gpioState": {}})).await;

    // A new pin appears in the document, already commanded ON.
    rig.set_field(
        "gpioState.23",
        json!({"enabled": true, "state": true, "name": "Fan"}),
    )
    .await;
    wait_for("hot-init applies ON state", Duration::from_secs(2), || {
        rig.sim.level(23) == Some(true)
    })
    .await;

    // The pin disappears: forced off and released.
    rig.store.put_device(json!({"gpioState": {}}));
    wait_for("hot-remove releases the pin", Duration::from_secs(2), || {
        !rig.sim.is_configured(23)
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_execute_and_are_consumed() {
    let rig = Rig::start(json!({
        "gpioState": {"5": {"enabled": true, "state": false}}
    }))
    .await;
    wait_for("boot settles", Duration::from_secs(2), || {
        rig.sim.level(5) == Some(false)
    })
    .await;

    rig.store.push_command(
        "cmd-on",
        json!({"type": "pin_control", "pin": 5, "action": "on"}),
    );
    wait_for("command drives pin and is deleted", Duration::from_secs(2), || {
        rig.sim.level(5) == Some(true) && rig.store.command_count() == 0
    })
    .await;
    assert_eq!(rig.store.get_path("gpioState.5.state"), Some(json!(true)));

    // Auto-off: ON for one second, then back off without further input.
    rig.store.push_command(
        "cmd-burst",
        json!({"type": "pin_control", "pin": 5, "action": "on", "duration": 1}),
    );
    wait_for("auto-off lands", Duration::from_secs(4), || {
        rig.sim.level(5) == Some(false)
            && rig.store.get_path("gpioState.5.state") == Some(json!(false))
    })
    .await;
    rig.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn pwm_command_sets_and_clears_duty() {
    let rig = Rig::start(json!({
        "gpioState": {"12": {"enabled": true, "mode": "pwm"}}
    }))
    .await;
    wait_for("boot settles", Duration::from_secs(2), || {
        rig.sim.is_configured(12)
    })
    .await;

    rig.store.push_command(
        "cmd-pwm",
        json!({"type": "pwm_control", "pin": 12, "duty_cycle": 60}),
    );
    wait_for("duty applied", Duration::from_secs(2), || {
        rig.sim.duty(12) == Some(60)
    })
    .await;
    wait_for("duty reported", Duration::from_secs(2), || {
        rig.store.get_path("gpioState.12.pwmDutyCycle") == Some(json!(60))
    })
    .await;

    // Duty 0 stops PWM and leaves the pin LOW.
    rig.store.push_command(
        "cmd-pwm-off",
        json!({"type": "pwm_control", "pin": 12, "duty_cycle": 0}),
    );
    wait_for("duty cleared, pin low", Duration::from_secs(2), || {
        rig.sim.duty(12) == Some(0) && rig.sim.level(12) == Some(false)
    })
    .await;
    rig.shutdown();
}
