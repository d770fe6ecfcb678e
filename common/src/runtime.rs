use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    time::Duration,
};

use crate::{
    api::{self, LogsView, ReadingView, StatusView, TaskActionReply, TaskActionRequest},
    cadence::{CadenceScheduler, CadenceStep, ScheduleState},
    clock::Clock,
    config::{
        ConfigPersistence, ConfigView, NodeConfig, NodeConfigUpdate, SharedConfig, UpdateOutcome,
    },
    error::{NodeError, NodeResult},
    link::{LinkDriver, LinkManager, LinkSignal, LinkState, NameAdvertiser, ReconnectHandle},
    log_ring::{LogRing, LogSink},
    metrics::{Environment, Metrics, MetricsSnapshot},
    report::{run_report_cycle, SensorProbe, Uplink},
    task::{spawn_supervised, TaskHandle, TaskId},
    watchdog::{RestartFn, TaskWatchdog},
};

/// Platform counters the core cannot observe itself.
pub trait DeviceStats: Send + Sync {
    fn heap_free_bytes(&self) -> u32;
    fn heap_min_free_bytes(&self) -> u32;
    /// Unused stack of the calling thread, when the platform can tell.
    fn stack_headroom_bytes(&self) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeTiming {
    pub network_period: Duration,
    pub network_timeout_ms: u32,
    pub sensor_timeout_ms: u32,
    pub network_stack_size: usize,
    pub sensor_stack_size: usize,
}

impl Default for RuntimeTiming {
    fn default() -> Self {
        Self {
            network_period: Duration::from_millis(250),
            network_timeout_ms: 15_000,
            sensor_timeout_ms: 30_000,
            network_stack_size: 12 * 1024,
            sensor_stack_size: 16 * 1024,
        }
    }
}

/// Everything a platform hands to [`NodeRuntime::new`].
pub struct NodeParts {
    pub clock: Arc<dyn Clock>,
    pub config: SharedConfig,
    /// Installed by a factory reset.
    pub factory_defaults: NodeConfig,
    pub persistence: Arc<dyn ConfigPersistence>,
    pub log_sink: Box<dyn LogSink>,
    pub stats: Arc<dyn DeviceStats>,
    pub link_driver: Box<dyn LinkDriver>,
    pub advertiser: Box<dyn NameAdvertiser>,
    pub sensor: Box<dyn SensorProbe>,
    pub uplink: Box<dyn Uplink>,
    pub timing: RuntimeTiming,
}

type TaskBody = fn(Arc<NodeRuntime>, TaskHandle);

#[derive(Clone, Copy)]
struct TaskPlan {
    stack_size: usize,
    timeout_ms: u32,
    body: TaskBody,
}

#[derive(Default)]
struct TaskSlot {
    plan: Option<TaskPlan>,
    handle: Option<TaskHandle>,
}

struct RuntimeEnvironment<'a> {
    stats: &'a dyn DeviceStats,
    signal: &'a LinkSignal,
}

impl Environment for RuntimeEnvironment<'_> {
    fn heap_free_bytes(&self) -> u32 {
        self.stats.heap_free_bytes()
    }

    fn heap_min_free_bytes(&self) -> u32 {
        self.stats.heap_min_free_bytes()
    }

    fn link_connected(&self) -> bool {
        self.signal.is_up()
    }

    fn rssi_dbm(&self) -> Option<i32> {
        self.signal.rssi_dbm()
    }
}

/// The wired node: link task, sensor task, watchdog and the state the control plane reads.
pub struct NodeRuntime {
    clock: Arc<dyn Clock>,
    config: SharedConfig,
    factory_defaults: NodeConfig,
    persistence: Arc<dyn ConfigPersistence>,
    metrics: Arc<Metrics>,
    log: Arc<LogRing>,
    watchdog: Arc<TaskWatchdog>,
    stats: Arc<dyn DeviceStats>,
    link: Mutex<LinkManager>,
    link_signal: Arc<LinkSignal>,
    reconnect: ReconnectHandle,
    sensor: Mutex<Box<dyn SensorProbe>>,
    uplink: Mutex<Box<dyn Uplink>>,
    tasks: Mutex<Vec<TaskSlot>>,
    schedule: Mutex<Option<ScheduleState>>,
    timing: RuntimeTiming,
    started: AtomicBool,
}

impl NodeRuntime {
    pub fn new(parts: NodeParts) -> Arc<Self> {
        let log = Arc::new(LogRing::new(parts.clock.clone(), parts.log_sink));
        log.set_level(parts.config.read(|config| config.log_level));
        let metrics = Arc::new(Metrics::new(parts.clock.clone()));
        let watchdog = Arc::new(TaskWatchdog::new(parts.clock.clone(), log.clone()));
        let link = LinkManager::new(
            parts.link_driver,
            parts.advertiser,
            parts.config.clone(),
            metrics.clone(),
            log.clone(),
        );
        let link_signal = link.signal();
        let reconnect = link.reconnect_handle();

        Arc::new(Self {
            clock: parts.clock,
            config: parts.config,
            factory_defaults: parts.factory_defaults,
            persistence: parts.persistence,
            metrics,
            log,
            watchdog,
            stats: parts.stats,
            link: Mutex::new(link),
            link_signal,
            reconnect,
            sensor: Mutex::new(parts.sensor),
            uplink: Mutex::new(parts.uplink),
            tasks: Mutex::new((0..TaskId::COUNT).map(|_| TaskSlot::default()).collect()),
            schedule: Mutex::new(None),
            timing: parts.timing,
            started: AtomicBool::new(false),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn log(&self) -> &Arc<LogRing> {
        &self.log
    }

    pub fn watchdog(&self) -> &Arc<TaskWatchdog> {
        &self.watchdog
    }

    pub fn link_signal(&self) -> &Arc<LinkSignal> {
        &self.link_signal
    }

    /// Starts supervision and the network and sensor tasks. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) -> NodeResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.watchdog.init()?;
        lock(&self.link).init();
        let location = self.config.read(|config| config.device_location.clone());
        self.log.info(format_args!("node starting at {location}"));

        self.start_task(
            TaskId::Network,
            TaskPlan {
                stack_size: self.timing.network_stack_size,
                timeout_ms: self.timing.network_timeout_ms,
                body: network_loop,
            },
        )?;
        self.start_task(
            TaskId::Sensor,
            TaskPlan {
                stack_size: self.timing.sensor_stack_size,
                timeout_ms: self.timing.sensor_timeout_ms,
                body: sensor_loop,
            },
        )?;
        Ok(())
    }

    fn start_task(self: &Arc<Self>, id: TaskId, plan: TaskPlan) -> NodeResult<TaskHandle> {
        let mut tasks = lock(&self.tasks);
        tasks[id.index()].plan = Some(plan);
        let handle = self.spawn_task(id, plan)?;
        tasks[id.index()].handle = Some(handle.clone());
        Ok(handle)
    }

    fn spawn_task(self: &Arc<Self>, id: TaskId, plan: TaskPlan) -> NodeResult<TaskHandle> {
        let weak = Arc::downgrade(self);
        let restart: RestartFn = Arc::new(move || {
            if let Some(runtime) = weak.upgrade() {
                runtime.respawn(id);
            }
        });

        let runtime = self.clone();
        spawn_supervised(id.name(), plan.stack_size, move |task| {
            runtime
                .watchdog
                .register_task(id, id.name(), restart, plan.timeout_ms);
            (plan.body)(runtime, task);
        })
    }

    /// Replaces a task: the old context is terminated and a fresh one spawned.
    fn respawn(self: &Arc<Self>, id: TaskId) {
        let mut tasks = lock(&self.tasks);
        let slot = &mut tasks[id.index()];
        let Some(plan) = slot.plan else {
            self.log
                .warn(format_args!("no task body for {id}; restart ignored"));
            return;
        };
        if let Some(old) = slot.handle.take() {
            old.terminate();
        }
        match self.spawn_task(id, plan) {
            Ok(handle) => {
                slot.handle = Some(handle);
                self.log.info(format_args!("task {id} restarted"));
            }
            Err(err) => self.log.error(format_args!("{err}")),
        }
    }

    /// Terminates every task this runtime spawned.
    pub fn shutdown(&self) {
        for (id, slot) in TaskId::ALL.into_iter().zip(lock(&self.tasks).iter_mut()) {
            if let Some(handle) = slot.handle.take() {
                handle.terminate();
                self.watchdog.unregister_task(id);
            }
        }
        self.log.info(format_args!("node stopped"));
    }

    /// Handle of the current context of a runtime-owned task.
    pub fn task_handle(&self, id: TaskId) -> Option<TaskHandle> {
        lock(&self.tasks)[id.index()].handle.clone()
    }

    fn sync_log_level(&self) {
        let level = self.config.read(|config| config.log_level);
        if self.log.level() != level {
            self.log.set_level(level);
        }
    }

    fn step_link(&self) {
        let now = self.clock.now();
        match self.link.try_lock() {
            Ok(mut link) => link.step(now),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().step(now),
            Err(TryLockError::WouldBlock) => {
                self.log.debug(format_args!("link busy; step skipped"));
            }
        }
    }

    fn publish_schedule(&self, state: ScheduleState) {
        *lock(&self.schedule) = Some(state);
    }

    /// One report cycle. Skipped when another context still holds the sensor or uplink.
    pub fn report_once(&self) -> bool {
        let (Some(mut sensor), Some(mut uplink)) = (try_lock(&self.sensor), try_lock(&self.uplink))
        else {
            self.log
                .warn(format_args!("sensor or uplink busy; report skipped"));
            return false;
        };
        let config = self.config.snapshot();
        run_report_cycle(
            &mut **sensor,
            &mut **uplink,
            &config,
            &self.metrics,
            &self.log,
        )
    }

    /// Reads the sensor without reporting upstream.
    pub fn read_now(&self) -> ReadingView {
        let location = self.config.read(|config| config.device_location.clone());
        let result = match try_lock(&self.sensor) {
            Some(mut sensor) => sensor.read(),
            None => Err(NodeError::Sensor("sensor busy".to_string())),
        };
        ReadingView::new(&location, result)
    }

    pub fn status_view(&self) -> StatusView {
        let link_state = match self.link.try_lock() {
            Ok(link) => link.state(),
            Err(_) if self.link_signal.is_up() => LinkState::Connected,
            Err(_) => LinkState::Connecting,
        };

        StatusView {
            location: self.config.read(|config| config.device_location.clone()),
            wifi_connected: self.link_signal.is_up(),
            link_state,
            rssi_dbm: self.link_signal.rssi_dbm(),
            uptime_ms: self.clock.now().as_millis(),
            heap_free_bytes: self.stats.heap_free_bytes(),
            heap_min_free_bytes: self.stats.heap_min_free_bytes(),
            time_synced: self.clock.is_synced(),
            schedule: *lock(&self.schedule),
            tasks: self.watchdog.task_views(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&RuntimeEnvironment {
            stats: self.stats.as_ref(),
            signal: &self.link_signal,
        })
    }

    pub fn logs_view(&self, max_entries: usize) -> LogsView {
        LogsView {
            level: self.log.level(),
            entries: self.log.snapshot(max_entries),
        }
    }

    pub fn clear_logs(&self) {
        self.log.clear();
        tracing::info!("log buffer cleared");
    }

    pub fn task_action(&self, request: &TaskActionRequest) -> NodeResult<TaskActionReply> {
        api::apply_task_action(&self.watchdog, request)
    }

    pub fn config_view(&self) -> ConfigView {
        let current = self.config.snapshot();
        let persisted = matches!(self.persistence.load(), Ok(Some(saved)) if saved == current);
        ConfigView::new(current, persisted)
    }

    /// Applies a partial update to the in-memory configuration. Nothing is persisted
    /// until [`Self::save_config`].
    pub fn apply_config_update(&self, update: NodeConfigUpdate) -> UpdateOutcome {
        let outcome = self.config.apply(update);
        self.after_config_change(outcome);
        outcome
    }

    pub fn save_config(&self) -> NodeResult<()> {
        self.persistence.save(&self.config.snapshot())?;
        self.log.info(format_args!("configuration saved"));
        Ok(())
    }

    /// Reverts in-memory changes to the last saved configuration.
    pub fn discard_config(&self) -> NodeResult<UpdateOutcome> {
        let saved = self
            .persistence
            .load()?
            .unwrap_or_else(|| self.factory_defaults.clone());
        let outcome = self.config.replace(saved);
        self.log.info(format_args!("unsaved configuration discarded"));
        self.after_config_change(outcome);
        Ok(outcome)
    }

    /// Erases stored configuration and installs factory defaults.
    pub fn factory_reset(&self) -> NodeResult<UpdateOutcome> {
        self.persistence.erase()?;
        let outcome = self.config.replace(self.factory_defaults.clone());
        self.log.warn(format_args!("configuration reset to factory defaults"));
        self.after_config_change(outcome);
        Ok(outcome)
    }

    fn after_config_change(&self, outcome: UpdateOutcome) {
        self.sync_log_level();
        if outcome.link_changed {
            self.log
                .info(format_args!("link settings changed; reconnecting"));
            self.reconnect.request(true);
        }
    }
}

fn network_loop(runtime: Arc<NodeRuntime>, task: TaskHandle) {
    while task.checkpoint() {
        runtime.watchdog.heartbeat(TaskId::Network);
        runtime.sync_log_level();
        runtime.step_link();
        if let Some(bytes) = runtime.stats.stack_headroom_bytes() {
            task.report_stack_headroom(bytes);
        }
        if !task.sleep(runtime.timing.network_period) {
            break;
        }
    }
}

fn sensor_loop(runtime: Arc<NodeRuntime>, task: TaskHandle) {
    let cadence = runtime.config.read(|config| config.cadence);
    let mut scheduler = CadenceScheduler::new(runtime.clock.clone(), cadence);
    runtime.publish_schedule(scheduler.state());

    // One report as soon as the task comes up, ahead of the first slot.
    if runtime.link_signal.is_up() {
        runtime.report_once();
    }

    while task.checkpoint() {
        runtime.watchdog.heartbeat(TaskId::Sensor);
        let now = runtime.clock.now();

        let cadence = runtime.config.read(|config| config.cadence);
        if scheduler.apply_settings(cadence, now) {
            runtime.log.info(format_args!(
                "report interval now {} s (aligned: {})",
                cadence.post_interval_sec, cadence.align_to_boundary
            ));
        }
        if scheduler.observe_time_base(now) {
            runtime
                .log
                .info(format_args!("wall clock synced; schedule realigned"));
        }

        let step = scheduler.poll(now);
        if step == CadenceStep::Fire {
            if runtime.link_signal.is_up() {
                runtime.report_once();
            } else {
                runtime
                    .log
                    .warn(format_args!("wifi down; report skipped"));
            }
            scheduler.reschedule(runtime.clock.now());
        }
        runtime.publish_schedule(scheduler.state());
        if let Some(bytes) = runtime.stats.stack_headroom_bytes() {
            task.report_stack_headroom(bytes);
        }

        if let CadenceStep::Sleep(duration) = step {
            if !task.sleep(duration) {
                break;
            }
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn try_lock<T: ?Sized>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        addressing::AddressConfig,
        clock::ManualClock,
        config::UpstreamConfig,
        link::{Credentials, LinkStatus},
        log_ring::{LogLevel, NullSink},
        report::Reading,
    };

    struct Stats;

    impl DeviceStats for Stats {
        fn heap_free_bytes(&self) -> u32 {
            120_000
        }

        fn heap_min_free_bytes(&self) -> u32 {
            90_000
        }
    }

    struct IdleDriver;

    impl LinkDriver for IdleDriver {
        fn status(&self) -> LinkStatus {
            LinkStatus::Disconnected
        }

        fn connect(&mut self, _credentials: &Credentials) -> NodeResult<()> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn rssi_dbm(&self) -> Option<i32> {
            None
        }

        fn set_hostname(&mut self, _hostname: &str) -> NodeResult<()> {
            Ok(())
        }

        fn configure_addressing(&mut self, _address: &AddressConfig) -> NodeResult<()> {
            Ok(())
        }
    }

    struct Silent;

    impl NameAdvertiser for Silent {
        fn start(&mut self, _name: &str) -> NodeResult<()> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct FixedSensor;

    impl SensorProbe for FixedSensor {
        fn read(&mut self) -> NodeResult<Reading> {
            Ok(Reading {
                temperature_c: 19.5,
                humidity_pct: 55.0,
            })
        }
    }

    struct Accepting;

    impl Uplink for Accepting {
        fn post_json(&mut self, _upstream: &UpstreamConfig, _body: &[u8]) -> NodeResult<u16> {
            Ok(200)
        }
    }

    #[derive(Default)]
    struct MemoryStore(Mutex<Option<NodeConfig>>);

    impl ConfigPersistence for MemoryStore {
        fn load(&self) -> NodeResult<Option<NodeConfig>> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, config: &NodeConfig) -> NodeResult<()> {
            *self.0.lock().unwrap() = Some(config.clone());
            Ok(())
        }

        fn erase(&self) -> NodeResult<()> {
            *self.0.lock().unwrap() = None;
            Ok(())
        }
    }

    fn runtime() -> (Arc<NodeRuntime>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let runtime = NodeRuntime::new(NodeParts {
            clock: Arc::new(ManualClock::new()),
            config: SharedConfig::new(NodeConfig::default()),
            factory_defaults: NodeConfig::default(),
            persistence: store.clone(),
            log_sink: Box::new(NullSink),
            stats: Arc::new(Stats),
            link_driver: Box::new(IdleDriver),
            advertiser: Box::new(Silent),
            sensor: Box::new(FixedSensor),
            uplink: Box::new(Accepting),
            timing: RuntimeTiming::default(),
        });
        (runtime, store)
    }

    #[test]
    fn link_update_requests_immediate_reconnect() {
        let (runtime, _store) = runtime();
        let outcome = runtime.apply_config_update(NodeConfigUpdate {
            wifi_ssid: Some("shed".into()),
            log_level: Some(LogLevel::Debug),
            ..Default::default()
        });

        assert!(outcome.link_changed);
        assert_eq!(runtime.reconnect.take(), Some(true));
        assert_eq!(runtime.log().level(), LogLevel::Debug);
    }

    #[test]
    fn save_discard_and_factory_reset() {
        let (runtime, store) = runtime();
        runtime.apply_config_update(NodeConfigUpdate {
            device_location: Some("garage".into()),
            ..Default::default()
        });
        assert!(!runtime.config_view().persisted);

        runtime.save_config().unwrap();
        assert!(runtime.config_view().persisted);

        runtime.apply_config_update(NodeConfigUpdate {
            device_location: Some("porch".into()),
            ..Default::default()
        });
        runtime.discard_config().unwrap();
        assert_eq!(runtime.config().snapshot().device_location, "garage");

        runtime.factory_reset().unwrap();
        assert_eq!(runtime.config().snapshot(), NodeConfig::default());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn cleared_log_stays_empty() {
        let (runtime, _store) = runtime();
        runtime.log().info(format_args!("first"));
        runtime.log().warn(format_args!("second"));
        assert!(runtime.logs_view(64).entries.len() >= 2);

        runtime.clear_logs();
        assert!(runtime.logs_view(64).entries.is_empty());
        assert!(runtime.log().is_empty());
    }

    #[test]
    fn read_now_does_not_touch_metrics() {
        let (runtime, _store) = runtime();
        let view = runtime.read_now();
        assert!(view.ok);
        assert_eq!(view.temperature_c, Some(19.5));
        assert_eq!(runtime.metrics_snapshot().sensor_read_total, 0);
    }

    #[test]
    fn report_once_records_the_cycle() {
        let (runtime, _store) = runtime();
        assert!(runtime.report_once());

        let snapshot = runtime.metrics_snapshot();
        assert_eq!(snapshot.sensor_read_success, 1);
        assert_eq!(snapshot.post_reading.total, 1);
        assert!(!snapshot.wifi_connected);
        assert_eq!(snapshot.heap_free_bytes, 120_000);
    }

    #[test]
    fn status_before_start_lists_idle_tasks() {
        let (runtime, _store) = runtime();
        let status = runtime.status_view();
        assert!(!status.wifi_connected);
        assert_eq!(status.link_state, LinkState::Disconnected);
        assert_eq!(status.schedule, None);
        assert_eq!(status.tasks.len(), TaskId::COUNT);
        assert!(status.tasks.iter().all(|task| !task.registered));
    }

    #[test]
    fn restart_of_unknown_body_is_ignored() {
        let (runtime, _store) = runtime();
        runtime.respawn(TaskId::HttpServer);
        assert!(runtime.task_handle(TaskId::HttpServer).is_none());
    }
}
