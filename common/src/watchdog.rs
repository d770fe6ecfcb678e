use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, TryLockError,
    },
    thread,
    time::Duration,
};

use serde::Serialize;

use crate::{
    clock::{Clock, Tick},
    error::{NodeError, NodeResult},
    log_ring::LogRing,
    task::{self, RunState, TaskHandle, TaskId},
};

pub const SUPERVISION_PERIOD: Duration = Duration::from_secs(1);
const SUPERVISOR_STACK_SIZE: usize = 8 * 1024;

/// Called from the supervisor thread; must not touch the task being replaced.
pub type RestartFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
struct WatchedTask {
    name: String,
    restart: Option<RestartFn>,
    timeout: Duration,
    last_heartbeat: Tick,
    // Bumped by every registration and heartbeat.
    beat_seq: u64,
    owner: Option<TaskHandle>,
    registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskView {
    pub name: String,
    pub state: Option<RunState>,
    pub priority: u8,
    #[serde(rename = "stackHeadroomBytes")]
    pub stack_headroom_bytes: Option<u32>,
    pub registered: bool,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "heartbeatAgeMs")]
    pub heartbeat_age_ms: Option<u64>,
}

/// Heartbeat supervision for the fixed task set.
pub struct TaskWatchdog {
    slots: Mutex<Vec<WatchedTask>>,
    clock: Arc<dyn Clock>,
    log: Arc<LogRing>,
    started: AtomicBool,
}

impl TaskWatchdog {
    pub fn new(clock: Arc<dyn Clock>, log: Arc<LogRing>) -> Self {
        Self {
            slots: Mutex::new(vec![WatchedTask::default(); TaskId::COUNT]),
            clock,
            log,
            started: AtomicBool::new(false),
        }
    }

    /// Starts the supervisor thread. Later calls are no-ops. The thread exits once the
    /// watchdog is dropped.
    pub fn init(self: &Arc<Self>) -> NodeResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("task-watchdog".to_string())
            .stack_size(SUPERVISOR_STACK_SIZE)
            .spawn(move || loop {
                thread::sleep(SUPERVISION_PERIOD);
                let Some(watchdog) = weak.upgrade() else {
                    break;
                };
                watchdog.check();
            });

        if let Err(err) = spawned {
            self.started.store(false, Ordering::Release);
            return Err(NodeError::Spawn {
                name: "task-watchdog".to_string(),
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    /// Registers the calling task. A `timeout_ms` of zero registers without supervision.
    pub fn register_task(&self, id: TaskId, name: &str, restart: RestartFn, timeout_ms: u32) {
        self.register_with_owner(id, name, restart, timeout_ms, task::current());
    }

    pub fn register_with_owner(
        &self,
        id: TaskId,
        name: &str,
        restart: RestartFn,
        timeout_ms: u32,
        owner: Option<TaskHandle>,
    ) {
        let now = self.clock.now();
        {
            let mut slots = self.lock_slots();
            let slot = &mut slots[id.index()];
            slot.name = name.to_string();
            slot.restart = Some(restart);
            slot.timeout = Duration::from_millis(u64::from(timeout_ms));
            slot.last_heartbeat = now;
            slot.beat_seq = slot.beat_seq.wrapping_add(1);
            slot.owner = owner;
            slot.registered = true;
        }
        self.log.info(format_args!("watchdog registered task: {name}"));
    }

    /// Silent no-op for an unregistered slot.
    pub fn heartbeat(&self, id: TaskId) {
        self.heartbeat_slot(id, task::current());
    }

    fn heartbeat_slot(&self, id: TaskId, current: Option<TaskHandle>) {
        let now = self.clock.now();
        let mut slots = self.lock_slots();
        let slot = &mut slots[id.index()];
        // A replaced task may still beat once before it observes termination.
        if !slot.registered || current.as_ref().is_some_and(TaskHandle::is_terminated) {
            return;
        }
        slot.last_heartbeat = now;
        slot.beat_seq = slot.beat_seq.wrapping_add(1);
        if current.is_some() {
            slot.owner = current;
        }
    }

    pub fn unregister_task(&self, id: TaskId) {
        let now = self.clock.now();
        let mut slots = self.lock_slots();
        let slot = &mut slots[id.index()];
        slot.registered = false;
        slot.owner = None;
        slot.last_heartbeat = now;
    }

    pub fn is_registered(&self, id: TaskId) -> bool {
        self.lock_slots()[id.index()].registered
    }

    /// One supervisory pass. Returns the number of restarts dispatched.
    pub fn check(&self) -> usize {
        match self.try_snapshot() {
            Some(snapshot) => self.evaluate(&snapshot, self.clock.now()),
            None => 0,
        }
    }

    fn try_snapshot(&self) -> Option<Vec<WatchedTask>> {
        match self.slots.try_lock() {
            Ok(slots) => Some(slots.clone()),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner().clone()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn evaluate(&self, snapshot: &[WatchedTask], now: Tick) -> usize {
        let mut restarts = 0;

        for (index, slot) in snapshot.iter().enumerate() {
            if !slot.registered || slot.timeout.is_zero() {
                continue;
            }

            if let Some(owner) = &slot.owner {
                match owner.state() {
                    RunState::Suspended => continue,
                    RunState::Terminated => {
                        if self.mark_unregistered(index, slot.beat_seq) {
                            self.log
                                .info(format_args!("watchdog: task {} exited", slot.name));
                        }
                        continue;
                    }
                    RunState::Running => {}
                }
            }

            if now.saturating_since(slot.last_heartbeat) <= slot.timeout {
                continue;
            }

            if self.mark_unregistered(index, slot.beat_seq) {
                self.log
                    .warn(format_args!("watchdog restarting task: {}", slot.name));
                if let Some(restart) = &slot.restart {
                    restart();
                }
                restarts += 1;
            }
        }

        restarts
    }

    /// Clears a slot only if no registration or heartbeat happened since the snapshot.
    fn mark_unregistered(&self, index: usize, expected_seq: u64) -> bool {
        let now = self.clock.now();
        let mut slots = self.lock_slots();
        let slot = &mut slots[index];
        if !slot.registered || slot.beat_seq != expected_seq {
            return false;
        }
        slot.registered = false;
        slot.owner = None;
        slot.last_heartbeat = now;
        true
    }

    /// Invokes the task's restart callback directly.
    pub fn restart(&self, id: TaskId) -> NodeResult<()> {
        let restart = self.lock_slots()[id.index()].restart.clone();
        let restart = restart.ok_or(NodeError::TaskNotRegistered(id.name()))?;
        self.log.info(format_args!("restart requested for task {id}"));
        restart();
        Ok(())
    }

    pub fn suspend(&self, id: TaskId) -> NodeResult<()> {
        let owner = self.owner(id).ok_or(NodeError::TaskNotRegistered(id.name()))?;
        if owner.suspend() {
            self.log.info(format_args!("task {id} suspended"));
        }
        Ok(())
    }

    pub fn resume(&self, id: TaskId) -> NodeResult<()> {
        let owner = self.owner(id).ok_or(NodeError::TaskNotRegistered(id.name()))?;
        if owner.resume() {
            // Time spent suspended does not count against the timeout.
            self.heartbeat_slot(id, None);
            self.log.info(format_args!("task {id} resumed"));
        }
        Ok(())
    }

    pub fn owner(&self, id: TaskId) -> Option<TaskHandle> {
        self.lock_slots()[id.index()].owner.clone()
    }

    pub fn task_views(&self) -> Vec<TaskView> {
        let now = self.clock.now();
        let snapshot = self.lock_slots().clone();

        TaskId::ALL
            .into_iter()
            .zip(snapshot)
            .map(|(id, slot)| TaskView {
                name: id.name().to_string(),
                state: slot.owner.as_ref().map(TaskHandle::state),
                priority: id.priority(),
                stack_headroom_bytes: slot.owner.as_ref().and_then(TaskHandle::stack_headroom),
                registered: slot.registered,
                timeout_ms: u64::try_from(slot.timeout.as_millis()).unwrap_or(u64::MAX),
                heartbeat_age_ms: slot.registered.then(|| {
                    u64::try_from(now.saturating_since(slot.last_heartbeat).as_millis())
                        .unwrap_or(u64::MAX)
                }),
            })
            .collect()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<WatchedTask>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
