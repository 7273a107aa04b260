use super::*;
use crate::container::ContainerDetail;
use crate::error::{AdvertiserError, HostnameError, RuntimeError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    IsEmpty,
    Reset,
    StageAddress(String),
    StageService(String, String),
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Published {
    Address(String, Vec<IpAddr>),
    Service(String, u16, String),
}

/// Advertiser state shared by every fake handle, keyed by container id.
#[derive(Default)]
struct Backend {
    calls: Mutex<Vec<(String, Call)>>,
    published: Mutex<HashMap<String, Vec<Published>>>,
    stalls: Mutex<HashMap<String, Arc<Notify>>>,
    delay: Mutex<Duration>,
    offline: Mutex<bool>,
    fail_commit: Mutex<bool>,
}

impl Backend {
    fn calls_for(&self, container_id: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == container_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn published(&self, container_id: &str) -> Vec<Published> {
        self.published
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    fn stall(&self, container_id: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.stalls
            .lock()
            .unwrap()
            .insert(container_id.to_string(), Arc::clone(&notify));
        notify
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn record(&self, container_id: &str, call: Call) {
        self.calls
            .lock()
            .unwrap()
            .push((container_id.to_string(), call));
    }

    async fn pause(&self, container_id: &str) {
        let stall = self.stalls.lock().unwrap().remove(container_id);
        if let Some(stall) = stall {
            stall.notified().await;
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

struct FakeHandle {
    container_id: String,
    backend: Arc<Backend>,
    staged: Vec<Published>,
}

#[async_trait]
impl AdvertisementHandle for FakeHandle {
    async fn is_empty(&self) -> Result<bool, AdvertiserError> {
        self.backend.record(&self.container_id, Call::IsEmpty);
        self.backend.pause(&self.container_id).await;
        Ok(self.staged.is_empty() && self.backend.published(&self.container_id).is_empty())
    }

    async fn reset(&mut self) -> Result<(), AdvertiserError> {
        self.backend.record(&self.container_id, Call::Reset);
        self.backend.pause(&self.container_id).await;
        self.staged.clear();
        self.backend
            .published
            .lock()
            .unwrap()
            .remove(&self.container_id);
        Ok(())
    }

    fn stage_address(&mut self, hostname: &str, addresses: &[IpAddr]) {
        self.backend
            .record(&self.container_id, Call::StageAddress(hostname.to_string()));
        self.staged
            .push(Published::Address(hostname.to_string(), addresses.to_vec()));
    }

    fn stage_service(&mut self, service: &ServiceRecord, hostname: &str) {
        self.backend.record(
            &self.container_id,
            Call::StageService(service.service_type.clone(), hostname.to_string()),
        );
        self.staged.push(Published::Service(
            service.service_type.clone(),
            service.port,
            hostname.to_string(),
        ));
    }

    async fn commit(&mut self) -> Result<(), AdvertiserError> {
        self.backend.record(&self.container_id, Call::Commit);
        self.backend.pause(&self.container_id).await;
        if *self.backend.fail_commit.lock().unwrap() {
            return Err(AdvertiserError::Mutation("bus went away".into()));
        }
        let staged = std::mem::take(&mut self.staged);
        self.backend
            .published
            .lock()
            .unwrap()
            .insert(self.container_id.clone(), staged);
        Ok(())
    }
}

struct FakeAdvertiser(Arc<Backend>);

impl Advertiser for FakeAdvertiser {
    type Handle = FakeHandle;

    fn new_handle(&self, container_id: &str) -> Result<FakeHandle, AdvertiserError> {
        if *self.0.offline.lock().unwrap() {
            return Err(AdvertiserError::Unavailable);
        }
        Ok(FakeHandle {
            container_id: container_id.to_string(),
            backend: Arc::clone(&self.0),
            staged: Vec::new(),
        })
    }
}

type EventItem = Result<ContainerEvent, RuntimeError>;

#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerDetail>>,
    log: Arc<Mutex<Vec<String>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventItem>>>,
}

impl FakeRuntime {
    fn with_events() -> (Self, mpsc::UnboundedSender<EventItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            events: Mutex::new(Some(rx)),
            ..Default::default()
        };
        (runtime, tx)
    }

    fn add(&self, detail: ContainerDetail) {
        self.containers
            .lock()
            .unwrap()
            .insert(detail.id.clone(), detail);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        self.log.lock().unwrap().push("list".into());
        let mut ids: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        self.log.lock().unwrap().push(format!("inspect {}", id));
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(RuntimeError::MissingField("Id"))
    }

    fn events(&self, since: i64) -> BoxStream<'static, EventItem> {
        self.log.lock().unwrap().push(format!("events since {}", since));
        let rx = self.events.lock().unwrap().take();
        match rx {
            Some(rx) => futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => futures_util::stream::empty().boxed(),
        }
    }
}

/// Returns configured hostnames per container, or the container name.
#[derive(Default)]
struct FakeHostnames {
    by_container: Mutex<HashMap<String, Vec<String>>>,
    failing: Mutex<Vec<String>>,
}

#[async_trait]
impl HostnameResolver for FakeHostnames {
    async fn hostnames(&self, container: &ContainerDetail) -> Result<Vec<String>, HostnameError> {
        if self.failing.lock().unwrap().contains(&container.id) {
            return Err(HostnameError::Lookup("resolver timed out".into()));
        }
        Ok(self
            .by_container
            .lock()
            .unwrap()
            .get(&container.id)
            .cloned()
            .unwrap_or_else(|| vec![format!("{}.local", container.name)]))
    }
}

type TestController = Controller<FakeRuntime, FakeAdvertiser, FakeHostnames>;

struct Harness {
    controller: Arc<TestController>,
    backend: Arc<Backend>,
}

impl Harness {
    fn new(runtime: FakeRuntime) -> Self {
        init_logging();
        let backend = Arc::new(Backend::default());
        let controller = Controller::new(
            runtime,
            FakeAdvertiser(Arc::clone(&backend)),
            FakeHostnames::default(),
            ServiceTable::builtin(),
        );
        Self {
            controller: Arc::new(controller),
            backend,
        }
    }

    fn runtime(&self) -> &FakeRuntime {
        &self.controller.runtime
    }

    fn hostnames(&self) -> &FakeHostnames {
        &self.controller.hostnames
    }
}

fn web(id: &str) -> ContainerDetail {
    ContainerDetail {
        id: id.into(),
        name: format!("web-{}", id),
        ip_addresses: vec!["172.17.0.2".parse().unwrap()],
        ports: vec!["80/tcp".into()],
        ..Default::default()
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Polls `check` until it holds or a second has passed.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Per-event algorithm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_publishes_addresses_and_services() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));

    let outcome = h.controller.handle_event("a", &Status::Start).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Advertised {
            hostnames: 1,
            services: 1
        }
    );
    assert_eq!(
        h.backend.published("a"),
        vec![
            Published::Address("web-a.local".into(), vec![ip("172.17.0.2")]),
            Published::Service("_http._tcp".into(), 80, "web-a.local".into()),
        ]
    );
}

#[tokio::test]
async fn unknown_ports_are_not_advertised() {
    let h = Harness::new(FakeRuntime::default());
    let mut detail = web("a");
    detail.ports = vec!["80/tcp".into(), "9999/tcp".into()];
    h.runtime().add(detail);

    h.controller.handle_event("a", &Status::Start).await.unwrap();

    let services: Vec<Call> = h
        .backend
        .calls_for("a")
        .into_iter()
        .filter(|c| matches!(c, Call::StageService(..)))
        .collect();
    assert_eq!(
        services,
        vec![Call::StageService("_http._tcp".into(), "web-a.local".into())]
    );
}

#[tokio::test]
async fn container_without_address_stages_nothing() {
    let h = Harness::new(FakeRuntime::default());
    let mut detail = web("a");
    detail.ip_addresses.clear();
    h.runtime().add(detail);

    let outcome = h.controller.handle_event("a", &Status::Start).await.unwrap();

    assert_eq!(outcome, Outcome::NoAddress);
    assert_eq!(h.backend.calls_for("a"), vec![Call::IsEmpty]);
}

#[tokio::test]
async fn services_only_under_first_hostname() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.hostnames()
        .by_container
        .lock()
        .unwrap()
        .insert("a".into(), vec!["a.local".into(), "b.local".into()]);

    h.controller.handle_event("a", &Status::Start).await.unwrap();

    assert_eq!(
        h.backend.calls_for("a"),
        vec![
            Call::IsEmpty,
            Call::StageAddress("a.local".into()),
            Call::StageAddress("b.local".into()),
            Call::StageService("_http._tcp".into(), "a.local".into()),
            Call::Commit,
        ]
    );
}

#[tokio::test]
async fn no_hostnames_commits_empty_set() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.hostnames()
        .by_container
        .lock()
        .unwrap()
        .insert("a".into(), Vec::new());

    let outcome = h.controller.handle_event("a", &Status::Start).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Advertised {
            hostnames: 0,
            services: 0
        }
    );
    assert_eq!(h.backend.calls_for("a"), vec![Call::IsEmpty, Call::Commit]);
    assert!(h.backend.published("a").is_empty());
}

#[tokio::test]
async fn restart_replaces_previous_records() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.controller.handle_event("a", &Status::Start).await.unwrap();

    let mut moved = web("a");
    moved.ip_addresses = vec![ip("10.0.0.9")];
    moved.ports.clear();
    h.runtime().add(moved);
    h.controller.handle_event("a", &Status::Unpause).await.unwrap();

    assert_eq!(
        h.backend.published("a"),
        vec![Published::Address("web-a.local".into(), vec![ip("10.0.0.9")])]
    );
    assert_eq!(
        h.backend.calls_for("a")[4..],
        [
            Call::IsEmpty,
            Call::Reset,
            Call::StageAddress("web-a.local".into()),
            Call::Commit
        ]
    );
}

#[tokio::test]
async fn repeated_withdrawal_skips_reset() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.controller.handle_event("a", &Status::Start).await.unwrap();

    for status in [Status::Die, Status::Kill, Status::Pause] {
        assert_eq!(
            h.controller.handle_event("a", &status).await.unwrap(),
            Outcome::Withdrawn
        );
    }

    let calls = h.backend.calls_for("a");
    let resets = calls.iter().filter(|c| **c == Call::Reset).count();
    assert_eq!(resets, 1, "only the first withdrawal resets: {:?}", calls);
    assert!(h.backend.published("a").is_empty());
    // Withdrawal never inspects the container.
    assert_eq!(h.runtime().log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn hostname_failure_leaves_container_withdrawn() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.controller.handle_event("a", &Status::Start).await.unwrap();
    h.hostnames().failing.lock().unwrap().push("a".into());

    let result = h.controller.handle_event("a", &Status::Start).await;

    assert!(matches!(result, Err(HandleError::Hostnames(_))));
    assert!(h.backend.published("a").is_empty());
    assert_eq!(h.backend.calls_for("a").last(), Some(&Call::Reset));
}

#[tokio::test]
async fn inspect_failure_is_reported() {
    let h = Harness::new(FakeRuntime::default());

    let result = h.controller.handle_event("gone", &Status::Start).await;

    assert!(matches!(result, Err(HandleError::Inspect(_))));
    assert_eq!(h.backend.calls_for("gone"), vec![Call::IsEmpty]);
}

#[tokio::test]
async fn commit_failure_is_reported_and_next_event_resyncs() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    *h.backend.fail_commit.lock().unwrap() = true;

    let result = h.controller.handle_event("a", &Status::Start).await;
    assert!(matches!(result, Err(HandleError::Commit(_))));
    assert!(h.backend.published("a").is_empty());

    *h.backend.fail_commit.lock().unwrap() = false;
    h.controller.handle_event("a", &Status::Start).await.unwrap();
    assert_eq!(h.backend.published("a").len(), 2);
}

#[tokio::test]
async fn unavailable_advertiser_fails_acquire() {
    let h = Harness::new(FakeRuntime::default());
    *h.backend.offline.lock().unwrap() = true;

    let result = h.controller.handle_event("a", &Status::Start).await;

    assert!(matches!(result, Err(HandleError::Acquire(_))));
    assert!(!h.controller.registry.contains("a"));
    assert!(h.backend.calls_for("a").is_empty());
}

// ---------------------------------------------------------------------------
// Registry interplay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn die_evicts_registry_entry() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.controller.handle_event("a", &Status::Start).await.unwrap();
    assert!(h.controller.registry.contains("a"));

    h.controller.handle_event("a", &Status::Kill).await.unwrap();
    assert!(h.controller.registry.contains("a"));

    h.controller.handle_event("a", &Status::Die).await.unwrap();
    assert!(!h.controller.registry.contains("a"));
}

#[tokio::test]
async fn eviction_can_be_disabled() {
    init_logging();
    let backend = Arc::new(Backend::default());
    let controller = Controller::new(
        FakeRuntime::default(),
        FakeAdvertiser(Arc::clone(&backend)),
        FakeHostnames::default(),
        ServiceTable::builtin(),
    )
    .evict_withdrawn(false);

    controller.handle_event("a", &Status::Die).await.unwrap();
    assert!(controller.registry.contains("a"));
}

#[tokio::test]
async fn same_container_handlers_never_interleave() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.backend.set_delay(Duration::from_millis(20));

    let (first, second) = tokio::join!(
        h.controller.handle_event("a", &Status::Start),
        h.controller.handle_event("a", &Status::Start),
    );
    first.unwrap();
    second.unwrap();

    let one_pass = |reset: bool| {
        let mut calls = vec![Call::IsEmpty];
        if reset {
            calls.push(Call::Reset);
        }
        calls.extend([
            Call::StageAddress("web-a.local".into()),
            Call::StageService("_http._tcp".into(), "web-a.local".into()),
            Call::Commit,
        ]);
        calls
    };
    let expected: Vec<Call> = one_pass(false).into_iter().chain(one_pass(true)).collect();
    assert_eq!(h.backend.calls_for("a"), expected);
}

#[tokio::test]
async fn stalled_container_does_not_block_others() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.runtime().add(web("b"));
    let release_a = h.backend.stall("a");

    let stalled = {
        let controller = Arc::clone(&h.controller);
        tokio::spawn(async move { controller.handle_event("a", &Status::Start).await })
    };
    assert!(eventually(|| h.backend.calls_for("a") == vec![Call::IsEmpty]).await);

    let b = tokio::time::timeout(
        Duration::from_secs(1),
        h.controller.handle_event("b", &Status::Start),
    )
    .await
    .expect("b is not blocked by a");
    assert!(b.is_ok());
    assert!(!stalled.is_finished());

    release_a.notify_one();
    let a = tokio::time::timeout(Duration::from_secs(1), stalled)
        .await
        .expect("a finishes once released")
        .unwrap();
    assert!(a.is_ok());
}

// ---------------------------------------------------------------------------
// Startup reconciliation and the live loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconcile_advertises_running_containers() {
    let h = Harness::new(FakeRuntime::default());
    h.runtime().add(web("a"));
    h.runtime().add(web("b"));

    h.controller.reconcile().await;

    assert_eq!(h.backend.published("a").len(), 2);
    assert_eq!(h.backend.published("b").len(), 2);
}

#[tokio::test]
async fn live_die_after_enumeration_withdraws() {
    let (runtime, events) = FakeRuntime::with_events();
    let h = Harness::new(runtime);
    h.runtime().add(web("x"));
    let before = unix_now();

    let (stop, shutdown) = oneshot::channel::<()>();
    let run = tokio::spawn(Arc::clone(&h.controller).run(async {
        let _ = shutdown.await;
    }));

    assert!(eventually(|| !h.backend.published("x").is_empty()).await);
    events
        .send(Ok(ContainerEvent {
            container_id: "x".into(),
            status: Status::Die,
            observed_at: Some(before + 1),
        }))
        .unwrap();
    assert!(eventually(|| h.backend.published("x").is_empty()).await);

    stop.send(()).unwrap();
    run.await.unwrap().unwrap();

    // The subscription starts no later than the enumeration it follows.
    let log = h.runtime().log.lock().unwrap().clone();
    assert_eq!(log[0], "list");
    assert_eq!(log[1], "inspect x");
    let since: i64 = log[2]
        .strip_prefix("events since ")
        .unwrap()
        .parse()
        .unwrap();
    assert!(since >= before && since <= unix_now());
}

#[tokio::test]
async fn live_events_for_one_container_keep_their_order() {
    let (runtime, events) = FakeRuntime::with_events();
    let h = Harness::new(runtime);
    h.runtime().add(web("x"));
    h.backend.set_delay(Duration::from_millis(10));

    let (stop, shutdown) = oneshot::channel::<()>();
    let run = tokio::spawn(Arc::clone(&h.controller).run(async {
        let _ = shutdown.await;
    }));

    for status in [Status::Die, Status::Start, Status::Pause, Status::Unpause] {
        events.send(Ok(ContainerEvent::new("x", status))).unwrap();
    }

    let commits = || {
        h.backend
            .calls_for("x")
            .iter()
            .filter(|c| **c == Call::Commit)
            .count()
    };
    // One commit from reconciliation, one each from start and unpause.
    assert!(eventually(|| commits() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.published("x").len(), 2);

    stop.send(()).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn event_stream_failure_is_fatal() {
    let (runtime, events) = FakeRuntime::with_events();
    let h = Harness::new(runtime);

    events
        .send(Err(RuntimeError::EventStream("connection reset".into())))
        .unwrap();
    let result = Arc::clone(&h.controller)
        .run(future::pending::<()>())
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn closed_event_stream_is_fatal() {
    let h = Harness::new(FakeRuntime::default());

    let result = Arc::clone(&h.controller)
        .run(future::pending::<()>())
        .await;

    assert!(result.is_err());
}
