use std::{
    cell::RefCell,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use serde::Serialize;

use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Suspended,
    Terminated,
}

const NO_HEADROOM: u32 = u32::MAX;

struct TaskShared {
    name: String,
    state: Mutex<RunState>,
    changed: Condvar,
    stack_headroom: AtomicU32,
}

/// Identity of one running task context. Suspension is cooperative: the task parks at
/// its next [`TaskHandle::checkpoint`] or [`TaskHandle::sleep`].
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskHandle {
    /// A handle not bound to any thread. Used by embedders and tests.
    pub fn detached(name: &str) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                name: name.to_string(),
                state: Mutex::new(RunState::Running),
                changed: Condvar::new(),
                stack_headroom: AtomicU32::new(NO_HEADROOM),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> RunState {
        *self.lock_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == RunState::Terminated
    }

    pub fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn suspend(&self) -> bool {
        self.transition(RunState::Running, RunState::Suspended)
    }

    pub fn resume(&self) -> bool {
        self.transition(RunState::Suspended, RunState::Running)
    }

    pub fn terminate(&self) {
        let mut state = self.lock_state();
        *state = RunState::Terminated;
        self.shared.changed.notify_all();
    }

    /// Parks while suspended. Returns `false` once the task has been terminated.
    pub fn checkpoint(&self) -> bool {
        let state = self.lock_state();
        let state = self
            .shared
            .changed
            .wait_while(state, |state| *state == RunState::Suspended)
            .unwrap_or_else(PoisonError::into_inner);
        *state != RunState::Terminated
    }

    /// Sleeps for `duration`, waking early on termination, then honours a pending
    /// suspension. Returns `false` once terminated.
    pub fn sleep(&self, duration: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, duration, |state| *state != RunState::Terminated)
            .unwrap_or_else(PoisonError::into_inner);
        if *state == RunState::Terminated {
            return false;
        }
        drop(state);
        self.checkpoint()
    }

    pub fn report_stack_headroom(&self, bytes: u32) {
        self.shared.stack_headroom.store(bytes, Ordering::Relaxed);
    }

    pub fn stack_headroom(&self) -> Option<u32> {
        match self.shared.stack_headroom.load(Ordering::Relaxed) {
            NO_HEADROOM => None,
            bytes => Some(bytes),
        }
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        let mut state = self.lock_state();
        if *state != from {
            return false;
        }
        *state = to;
        self.shared.changed.notify_all();
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskHandle>> = const { RefCell::new(None) };
}

/// Handle of the supervised task running on this thread, if any.
pub fn current() -> Option<TaskHandle> {
    CURRENT.with(|current| current.borrow().clone())
}

struct TerminateOnExit(TaskHandle);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// Spawns `body` on a named thread that owns a fresh [`TaskHandle`]. The handle reads
/// `Terminated` once the body returns or unwinds.
pub fn spawn_supervised<F>(name: &str, stack_size: usize, body: F) -> NodeResult<TaskHandle>
where
    F: FnOnce(TaskHandle) + Send + 'static,
{
    let handle = TaskHandle::detached(name);
    let task = handle.clone();

    thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_size)
        .spawn(move || {
            CURRENT.with(|current| *current.borrow_mut() = Some(task.clone()));
            let _exit = TerminateOnExit(task.clone());
            body(task);
        })
        .map_err(|err| NodeError::Spawn {
            name: name.to_string(),
            reason: err.to_string(),
        })?;

    Ok(handle)
}

/// The fixed set of long-running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Network,
    Sensor,
    HttpServer,
}

impl TaskId {
    pub const COUNT: usize = 3;
    pub const ALL: [TaskId; Self::COUNT] = [TaskId::Network, TaskId::Sensor, TaskId::HttpServer];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Sensor => "sensor",
            Self::HttpServer => "http-server",
        }
    }

    pub fn priority(self) -> u8 {
        match self {
            Self::Network => 2,
            Self::Sensor | Self::HttpServer => 1,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskId {
    type Err = NodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(text.trim()))
            .ok_or_else(|| NodeError::UnknownTask(text.to_string()))
    }
}
