// growerd: Schedule cache
//
// Thread-safe store of every schedule definition per pin, each tagged
// active/inactive by time-window evaluation. The cache always reflects
// the document truth; executors re-read it every cycle so edits take
// effect within one poll interval.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::model::ScheduleSpec;

/// A schedule as cached, with its window-evaluated activation flag.
#[derive(Debug, Clone)]
pub struct CachedSchedule {
    pub spec: ScheduleSpec,
    /// `enabled ∧ in_window` at the last evaluation.
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl CachedSchedule {
    /// Live activation check against the current wall clock (the cached
    /// `active` flag is only as fresh as the last evaluator sweep).
    pub fn active_now(&self, now: NaiveTime) -> bool {
        self.spec.enabled && self.spec.in_window(now)
    }
}

/// An activation flip produced by a window sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFlip {
    pub pin: u8,
    pub schedule_id: String,
    pub active: bool,
}

/// Thread-safe cache of all schedule definitions, keyed by pin.
#[derive(Default)]
pub struct ScheduleCache {
    pins: DashMap<u8, BTreeMap<String, CachedSchedule>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a schedule definition, re-deriving its active
    /// flag. `last_run_at` survives redefinition. Returns the new flag.
    pub fn upsert(&self, pin: u8, schedule_id: &str, spec: ScheduleSpec, now: NaiveTime) -> bool {
        let active = spec.enabled && spec.in_window(now);
        let mut entry = self.pins.entry(pin).or_default();
        let last_run_at = entry
            .get(schedule_id)
            .and_then(|existing| existing.last_run_at);
        entry.insert(
            schedule_id.to_string(),
            CachedSchedule {
                spec,
                active,
                last_run_at,
            },
        );

        if active {
            info!(pin, schedule_id, "Schedule cached - active (within time window)");
        } else {
            info!(pin, schedule_id, "Schedule cached - inactive");
        }
        active
    }

    pub fn remove(&self, pin: u8, schedule_id: &str) -> bool {
        let removed = self
            .pins
            .get_mut(&pin)
            .map(|mut entry| entry.remove(schedule_id).is_some())
            .unwrap_or(false);
        if removed {
            info!(pin, schedule_id, "Schedule removed from cache");
        }
        removed
    }

    /// Drop every schedule for a pin (hot-remove).
    pub fn remove_pin(&self, pin: u8) {
        if self.pins.remove(&pin).is_some() {
            debug!(pin, "All schedules dropped for removed pin");
        }
    }

    pub fn get(&self, pin: u8, schedule_id: &str) -> Option<CachedSchedule> {
        self.pins
            .get(&pin)
            .and_then(|entry| entry.get(schedule_id).cloned())
    }

    /// All schedules for one pin as (id, schedule) pairs.
    pub fn list(&self, pin: u8) -> Vec<(String, CachedSchedule)> {
        self.pins
            .get(&pin)
            .map(|entry| {
                entry
                    .iter()
                    .map(|(id, sched)| (id.clone(), sched.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every cached schedule, keyed by pin.
    pub fn all(&self) -> BTreeMap<u8, Vec<(String, CachedSchedule)>> {
        self.pins
            .iter()
            .map(|entry| {
                let pin = *entry.key();
                let schedules = entry
                    .value()
                    .iter()
                    .map(|(id, sched)| (id.clone(), sched.clone()))
                    .collect();
                (pin, schedules)
            })
            .collect()
    }

    pub fn pin_numbers(&self) -> Vec<u8> {
        self.pins.iter().map(|entry| *entry.key()).collect()
    }

    pub fn set_last_run(&self, pin: u8, schedule_id: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.pins.get_mut(&pin) {
            if let Some(sched) = entry.get_mut(schedule_id) {
                sched.last_run_at = Some(at);
            }
        }
    }

    /// Walk every schedule and flip its active flag iff
    /// `enabled ∧ in_window(now)` disagrees with the cached flag.
    /// Returns the flips for the window evaluator to act on.
    pub fn reevaluate_windows(&self, now: NaiveTime) -> Vec<WindowFlip> {
        let mut flips = Vec::new();

        for mut entry in self.pins.iter_mut() {
            let pin = *entry.key();
            for (id, sched) in entry.value_mut().iter_mut() {
                let should_be = sched.active_now(now);
                if should_be != sched.active {
                    sched.active = should_be;
                    flips.push(WindowFlip {
                        pin,
                        schedule_id: id.clone(),
                        active: should_be,
                    });
                    if should_be {
                        info!(pin, schedule_id = %id, "Schedule entered its time window");
                    } else {
                        info!(pin, schedule_id = %id, "Schedule exited its time window");
                    }
                }
            }
        }

        flips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn spec(start: &str, end: &str, enabled: bool) -> ScheduleSpec {
        ScheduleSpec::parse(&json!({
            "enabled": enabled,
            "startTime": start,
            "endTime": end,
            "durationSeconds": 2,
            "frequencySeconds": 2,
        }))
        .unwrap()
    }

    #[test]
    fn upsert_derives_activation() {
        let cache = ScheduleCache::new();
        assert!(cache.upsert(19, "s1", spec("12:00", "12:05", true), t(12, 2)));
        assert!(!cache.upsert(19, "s2", spec("12:00", "12:05", true), t(13, 0)));
        assert!(!cache.upsert(19, "s3", spec("", "", false), t(12, 2)));
        assert_eq!(cache.list(19).len(), 3);
    }

    #[test]
    fn reevaluation_reports_flips_once() {
        let cache = ScheduleCache::new();
        cache.upsert(19, "s1", spec("12:00", "12:05", true), t(11, 0));

        let flips = cache.reevaluate_windows(t(12, 1));
        assert_eq!(
            flips,
            vec![WindowFlip {
                pin: 19,
                schedule_id: "s1".into(),
                active: true
            }]
        );
        // Second sweep at the same time: no change.
        assert!(cache.reevaluate_windows(t(12, 2)).is_empty());
        // Window exit flips back.
        let flips = cache.reevaluate_windows(t(12, 6));
        assert!(!flips[0].active);
    }

    #[test]
    fn disabled_schedule_never_activates() {
        let cache = ScheduleCache::new();
        cache.upsert(19, "s1", spec("12:00", "12:05", false), t(12, 2));
        assert!(cache.reevaluate_windows(t(12, 3)).is_empty());
        assert!(!cache.get(19, "s1").unwrap().active);
    }

    #[test]
    fn last_run_survives_redefinition() {
        let cache = ScheduleCache::new();
        cache.upsert(19, "s1", spec("", "", true), t(12, 0));
        let at = Utc::now();
        cache.set_last_run(19, "s1", at);
        cache.upsert(19, "s1", spec("", "", true), t(12, 0));
        assert_eq!(cache.get(19, "s1").unwrap().last_run_at, Some(at));
    }

    #[test]
    fn remove_pin_drops_everything() {
        let cache = ScheduleCache::new();
        cache.upsert(19, "s1", spec("", "", true), t(12, 0));
        cache.upsert(19, "s2", spec("", "", true), t(12, 0));
        cache.remove_pin(19);
        assert!(cache.list(19).is_empty());
    }
}
