use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use pretty_assertions::assert_eq;
use sensornode_common::{
    addressing::AddressConfig,
    cadence::TimeBase,
    config::{CadenceConfig, UpstreamConfig},
    log_ring::NullSink,
    ConfigPersistence, Credentials, DeviceStats, LinkDriver, LinkStatus, NameAdvertiser,
    NodeConfig, NodeParts, NodeResult, NodeRuntime, Reading, RunState, RuntimeTiming,
    SensorProbe, SharedConfig, SystemClock, TaskActionRequest, TaskId, Uplink,
};

struct Stats;

impl DeviceStats for Stats {
    fn heap_free_bytes(&self) -> u32 {
        200_000
    }

    fn heap_min_free_bytes(&self) -> u32 {
        150_000
    }
}

/// Associates on the first connect call.
struct InstantLink(Arc<AtomicBool>);

impl LinkDriver for InstantLink {
    fn status(&self) -> LinkStatus {
        if self.0.load(Ordering::SeqCst) {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn connect(&mut self, _credentials: &Credentials) -> NodeResult<()> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn rssi_dbm(&self) -> Option<i32> {
        Some(-58)
    }

    fn set_hostname(&mut self, _hostname: &str) -> NodeResult<()> {
        Ok(())
    }

    fn configure_addressing(&mut self, _address: &AddressConfig) -> NodeResult<()> {
        Ok(())
    }
}

struct NoMdns;

impl NameAdvertiser for NoMdns {
    fn start(&mut self, _name: &str) -> NodeResult<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Blocks for `stall` on the first read, then reads instantly.
struct StallingSensor {
    stall: Option<Duration>,
}

impl SensorProbe for StallingSensor {
    fn read(&mut self) -> NodeResult<Reading> {
        if let Some(stall) = self.stall.take() {
            thread::sleep(stall);
        }
        Ok(Reading {
            temperature_c: 22.0,
            humidity_pct: 45.0,
        })
    }
}

struct CountingUplink(Arc<AtomicUsize>);

impl Uplink for CountingUplink {
    fn post_json(&mut self, _upstream: &UpstreamConfig, _body: &[u8]) -> NodeResult<u16> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(201)
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

struct Node {
    runtime: Arc<NodeRuntime>,
    posts: Arc<AtomicUsize>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}

fn node(stall: Option<Duration>, sensor_timeout_ms: u32) -> Node {
    let mut config = NodeConfig::default();
    config.network.wifi_ssid = "bench".into();
    config.cadence = CadenceConfig {
        post_interval_sec: 1,
        align_to_boundary: false,
    };

    let posts = Arc::new(AtomicUsize::new(0));
    let runtime = NodeRuntime::new(NodeParts {
        clock: Arc::new(SystemClock::held_unsynced()),
        config: SharedConfig::new(config.clone()),
        factory_defaults: config,
        persistence: Arc::new(MemoryStore::default()),
        log_sink: Box::new(NullSink),
        stats: Arc::new(Stats),
        link_driver: Box::new(InstantLink(Arc::new(AtomicBool::new(false)))),
        advertiser: Box::new(NoMdns),
        sensor: Box::new(StallingSensor { stall }),
        uplink: Box::new(CountingUplink(posts.clone())),
        timing: RuntimeTiming {
            sensor_timeout_ms,
            network_stack_size: 256 * 1024,
            sensor_stack_size: 256 * 1024,
            ..RuntimeTiming::default()
        },
    });
    runtime.start().unwrap();
    Node { runtime, posts }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn task_state(runtime: &NodeRuntime, id: TaskId) -> Option<RunState> {
    runtime.status_view().tasks[id.index()].state
}

fn action(name: &str, action: &str) -> TaskActionRequest {
    TaskActionRequest {
        name: name.into(),
        action: action.into(),
    }
}

#[test]
fn readings_flow_once_the_link_is_up() {
    let node = node(None, 30_000);
    wait_until("two posts", || node.posts.load(Ordering::SeqCst) >= 2);

    let metrics = node.runtime.metrics_snapshot();
    assert!(metrics.wifi_connected);
    assert_eq!(metrics.wifi_rssi_dbm, -58);
    assert!(metrics.post_reading.total >= 2);
    assert_eq!(metrics.post_reading.failed, 0);

    let status = node.runtime.status_view();
    assert!(status.wifi_connected);
    assert!(!status.time_synced);
    let schedule = status.schedule.unwrap();
    assert_eq!(schedule.time_base, TimeBase::Unsynced);
    assert_eq!(schedule.interval_seconds, 1);
    for id in [TaskId::Network, TaskId::Sensor] {
        let task = &status.tasks[id.index()];
        assert!(task.registered, "{id} not registered");
        assert_eq!(task.state, Some(RunState::Running));
    }
}

#[test]
fn sensor_task_answers_control_actions() {
    let node = node(None, 30_000);
    let runtime = &node.runtime;
    wait_until("first post", || node.posts.load(Ordering::SeqCst) >= 1);

    runtime.task_action(&action("sensor", "suspend")).unwrap();
    assert_eq!(task_state(runtime, TaskId::Sensor), Some(RunState::Suspended));
    thread::sleep(Duration::from_millis(1_500));
    let parked = node.posts.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(2_500));
    assert_eq!(node.posts.load(Ordering::SeqCst), parked);

    runtime.task_action(&action("sensor", "resume")).unwrap();
    wait_until("posts after resume", || {
        node.posts.load(Ordering::SeqCst) > parked
    });

    let before = runtime.task_handle(TaskId::Sensor).unwrap();
    runtime.task_action(&action("sensor", "restart")).unwrap();
    let after = runtime.task_handle(TaskId::Sensor).unwrap();
    assert!(!after.same_task(&before));
    assert!(before.is_terminated());
    wait_until("restarted task to register", || {
        runtime
            .watchdog()
            .owner(TaskId::Sensor)
            .is_some_and(|owner| owner.same_task(&after))
    });
}

#[test]
fn wedged_sensor_task_is_restarted_by_watchdog() {
    let node = node(Some(Duration::from_secs(6)), 2_000);
    let runtime = &node.runtime;
    wait_until("sensor task", || runtime.task_handle(TaskId::Sensor).is_some());
    let first = runtime.task_handle(TaskId::Sensor).unwrap();

    wait_until("watchdog restart", || {
        runtime
            .task_handle(TaskId::Sensor)
            .is_some_and(|handle| !handle.same_task(&first))
    });
    assert!(first.is_terminated());

    // The replacement reports once the stalled read releases the sensor.
    wait_until("posts after restart", || node.posts.load(Ordering::SeqCst) >= 1);
}
