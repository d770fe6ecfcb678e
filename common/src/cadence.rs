use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    clock::{Clock, Tick},
    config::CadenceConfig,
};

/// Longest single sleep of the cadence loop.
pub const MAX_SLEEP_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBase {
    Unsynced,
    Synced,
}

/// When the next action is due. `tick` is authoritative; `epoch_secs` is the wall-clock
/// target it was derived from, present only while synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Deadline {
    #[serde(rename = "tickMs", serialize_with = "serialize_tick")]
    pub tick: Tick,
    #[serde(rename = "epochSecs")]
    pub epoch_secs: Option<i64>,
}

fn serialize_tick<S: serde::Serializer>(tick: &Tick, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(tick.as_millis())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub interval_seconds: u32,
    pub align_to_boundary: bool,
    pub time_base: TimeBase,
    pub deadline: Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceStep {
    Fire,
    Sleep(Duration),
}

pub struct CadenceScheduler {
    clock: Arc<dyn Clock>,
    state: ScheduleState,
}

impl CadenceScheduler {
    pub fn new(clock: Arc<dyn Clock>, settings: CadenceConfig) -> Self {
        let now = clock.now();
        let synced = clock.is_synced();
        let mut scheduler = Self {
            clock,
            state: ScheduleState {
                interval_seconds: settings.post_interval_sec.max(1),
                align_to_boundary: settings.align_to_boundary,
                time_base: TimeBase::Unsynced,
                deadline: Deadline {
                    tick: now,
                    epoch_secs: None,
                },
            },
        };
        scheduler.recompute(now, synced);
        scheduler
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn deadline(&self) -> Deadline {
        self.state.deadline
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.state.interval_seconds))
    }

    /// Computes the next due deadline from `now`.
    pub fn recompute(&mut self, now: Tick, synced: bool) {
        if synced {
            let (paired_tick, wall_ms) = self.clock.paired();
            if let Some(wall_ms) = wall_ms {
                let target = self.epoch_target(wall_ms);
                let delta_ms = (target * 1000 - wall_ms).max(1);
                let delta = Duration::from_millis(u64::try_from(delta_ms).unwrap_or(u64::MAX));
                // The paired tick is never behind `now`.
                let base = paired_tick.max(now);
                self.state.time_base = TimeBase::Synced;
                self.state.deadline = Deadline {
                    tick: base + delta,
                    epoch_secs: Some(target),
                };
                return;
            }
        }

        self.state.time_base = TimeBase::Unsynced;
        self.state.deadline = Deadline {
            tick: now + self.interval(),
            epoch_secs: None,
        };
    }

    fn epoch_target(&self, wall_ms: i64) -> i64 {
        let now_secs = wall_ms.div_euclid(1000);
        let interval = i64::from(self.state.interval_seconds);
        let mut target = if self.state.align_to_boundary {
            (now_secs / interval + 1) * interval
        } else {
            now_secs + interval
        };
        if target * 1000 <= wall_ms {
            target += 1;
        }
        target
    }

    /// Recomputes with the clock's current sync state.
    pub fn reschedule(&mut self, now: Tick) {
        let synced = self.clock.is_synced();
        self.recompute(now, synced);
    }

    /// Applies interval/alignment changes. Returns `true` if the schedule was recomputed.
    pub fn apply_settings(&mut self, settings: CadenceConfig, now: Tick) -> bool {
        let interval_seconds = settings.post_interval_sec.max(1);
        if interval_seconds == self.state.interval_seconds
            && settings.align_to_boundary == self.state.align_to_boundary
        {
            return false;
        }
        self.state.interval_seconds = interval_seconds;
        self.state.align_to_boundary = settings.align_to_boundary;
        self.reschedule(now);
        true
    }

    /// Recomputes on the unsynced to synced transition. Returns `true` if it did.
    pub fn observe_time_base(&mut self, now: Tick) -> bool {
        if self.state.time_base == TimeBase::Synced || !self.clock.is_synced() {
            return false;
        }
        self.recompute(now, true);
        self.state.time_base == TimeBase::Synced
    }

    pub fn remaining(&self, now: Tick) -> Duration {
        self.state.deadline.tick.saturating_since(now)
    }

    pub fn poll(&self, now: Tick) -> CadenceStep {
        let remaining = self.remaining(now);
        if remaining.is_zero() {
            CadenceStep::Fire
        } else {
            CadenceStep::Sleep(remaining.min(MAX_SLEEP_SLICE))
        }
    }
}
