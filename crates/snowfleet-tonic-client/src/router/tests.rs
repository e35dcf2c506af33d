use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use snowfleet_coord::{CoordinationRegistry, CreateMode, MemoryTree, PeerRecord};
use snowfleet_tonic_core::{Error as WireError, Result as WireResult, snowfleet};

use super::*;
use crate::{Health, RouterRegistry};

const ROOT: &str = "/snowfleet-servers";

struct FakeServer {
    up: AtomicBool,
    rolled_back: AtomicBool,
    base: i64,
    issued: AtomicI64,
}

impl FakeServer {
    fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn check(&self) -> WireResult<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WireError::Transport {
                reason: "connection refused".into(),
            })
        }
    }
}

struct FakeRpc(Arc<FakeServer>);

#[async_trait]
impl IdRpc for FakeRpc {
    async fn next_id(&self, _worker_id: u64) -> WireResult<i64> {
        self.0.check()?;
        if self.0.rolled_back.load(Ordering::SeqCst) {
            return Err(WireError::IdGeneration(snowfleet::Error::ClockRollback {
                last_timestamp: 1_000,
                now: 900,
            }));
        }
        Ok(self.0.base + self.0.issued.fetch_add(1, Ordering::SeqCst))
    }

    async fn next_ids(&self, worker_id: u64, count: usize) -> WireResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.next_id(worker_id).await?);
        }
        Ok(ids)
    }

    async fn datacenter_id(&self) -> WireResult<u64> {
        self.0.check()?;
        Ok(1)
    }

    async fn timestamp(&self) -> WireResult<u64> {
        self.0.check()?;
        Ok(0)
    }

    async fn ping(&self) -> WireResult<()> {
        self.0.check()
    }
}

#[derive(Default)]
struct FakeConnector {
    servers: Mutex<HashMap<String, Arc<FakeServer>>>,
}

impl FakeConnector {
    fn add(&self, addr: &str, base: i64) -> Arc<FakeServer> {
        let server = Arc::new(FakeServer {
            up: AtomicBool::new(true),
            rolled_back: AtomicBool::new(false),
            base,
            issued: AtomicI64::new(0),
        });
        self.servers
            .lock()
            .insert(addr.to_string(), Arc::clone(&server));
        server
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: &str) -> WireResult<Arc<dyn IdRpc>> {
        let server = self
            .servers
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| WireError::Transport {
                reason: format!("no route to {addr}"),
            })?;
        server.check()?;
        Ok(Arc::new(FakeRpc(server)))
    }
}

fn config() -> RouterConfig {
    RouterConfig {
        root_path: ROOT.to_string(),
        ping_interval: Duration::from_millis(10),
        retry_interval: Duration::from_millis(10),
        node_retry_delay: Duration::from_millis(10),
    }
}

async fn session(tree: &MemoryTree) -> Arc<CoordinationRegistry> {
    let registry = CoordinationRegistry::connect(Arc::new(tree.connect()), Duration::from_secs(1))
        .await
        .unwrap();
    registry.ensure_root_path(ROOT).await.unwrap();
    Arc::new(registry)
}

fn record(addrs: &[&str]) -> PeerRecord {
    PeerRecord::new(addrs.iter().map(|a| a.to_string()).collect())
}

fn router(
    registry: &Arc<CoordinationRegistry>,
    connector: &Arc<FakeConnector>,
    worker_id: u64,
) -> FailoverRouter {
    let router = FailoverRouter::new(
        Arc::clone(registry),
        Arc::clone(connector) as Arc<dyn Connector>,
        worker_id,
        config(),
    );
    router.bind().unwrap();
    router
}

async fn wait_phase(router: &FailoverRouter, phase: RouterPhase) {
    let mut routes = router.subscribe();
    tokio::time::timeout(Duration::from_secs(2), routes.wait_for(|t| t.phase() == phase))
        .await
        .expect("router never reached the expected phase")
        .unwrap();
}

#[tokio::test]
async fn routes_to_the_lowest_sequence_number() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    connector.add("one:1", 1_000);
    connector.add("two:1", 2_000);
    connector.add("three:1", 3_000);

    let slot = format!("{ROOT}/5");
    client.ensure_root_path(&slot).await.unwrap();
    for (name, addr) in [
        ("0000000003", "three:1"),
        ("0000000001", "one:1"),
        ("0000000002", "two:1"),
    ] {
        let data = record(&[addr]).to_json().unwrap();
        client
            .coordinator()
            .create(&format!("{slot}/{name}"), &data, CreateMode::Persistent)
            .await
            .unwrap();
    }

    let router = router(&client, &connector, 5);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(router.routes().leader(), Some("0000000001"));
    assert_eq!(router.next_id().await.unwrap().to_raw(), 1_000);
    assert_eq!(router.next_id().await.unwrap().to_raw(), 1_001);
}

#[tokio::test]
async fn hands_over_to_the_standby_without_losing_the_route() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let leader = session(&tree).await;
    let standby = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    connector.add("leader:1", 1_000);
    connector.add("standby:1", 2_000);

    let held = leader
        .register_worker_slot(ROOT, 1, &record(&["leader:1"]))
        .await
        .unwrap();
    standby
        .register_worker_slot(ROOT, 1, &record(&["standby:1"]))
        .await
        .unwrap();

    let router = router(&client, &connector, 1);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(router.next_id().await.unwrap().to_raw(), 1_000);

    leader.release(&held).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let id = router.next_id().await.unwrap().to_raw();
        if id >= 2_000 {
            break;
        }
        assert!(Instant::now() < deadline, "router never moved to the standby");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(router.routes().leader(), Some("0000000001"));
    assert_eq!(router.phase(), RouterPhase::Ready);
}

#[tokio::test]
async fn keeps_the_old_leader_until_the_new_one_is_reachable() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let leader = session(&tree).await;
    let standby = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    connector.add("leader:1", 1_000);
    let standby_server = connector.add("standby:1", 2_000);
    standby_server.set_up(false);

    let held = leader
        .register_worker_slot(ROOT, 1, &record(&["leader:1"]))
        .await
        .unwrap();
    standby
        .register_worker_slot(ROOT, 1, &record(&["standby:1"]))
        .await
        .unwrap();

    let router = router(&client, &connector, 1);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    let old = router.routes().connections().to_vec();

    // The leader steps down but its server keeps answering.
    leader.release(&held).await.unwrap();
    let mut routes = router.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        routes.wait_for(|t| t.leader() == Some("0000000001")),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = router.next_id().await.unwrap().to_raw();
    assert!((1_000..2_000).contains(&id));
    assert!(!old[0].is_closed());
    assert_eq!(router.routes().fallback().len(), 1);

    standby_server.set_up(true);
    tokio::time::timeout(
        Duration::from_secs(2),
        routes.wait_for(|t| t.fallback().is_empty()),
    )
    .await
    .unwrap()
    .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !old[0].is_closed() {
        assert!(Instant::now() < deadline, "fallback was never closed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(router.next_id().await.unwrap().to_raw() >= 2_000);
    assert_eq!(router.phase(), RouterPhase::Ready);
}

#[tokio::test]
async fn degrades_when_the_slot_empties_and_recovers() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let server = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    connector.add("first:1", 1_000);
    connector.add("second:1", 2_000);

    let held = server
        .register_worker_slot(ROOT, 2, &record(&["first:1"]))
        .await
        .unwrap();
    let router = router(&client, &connector, 2);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();

    server.release(&held).await.unwrap();
    wait_phase(&router, RouterPhase::Degraded).await;
    assert_eq!(
        router.next_id().await,
        Err(Error::NoRoute { worker_id: 2 })
    );
    assert!(router.routes().connections().is_empty());

    server
        .register_worker_slot(ROOT, 2, &record(&["second:1"]))
        .await
        .unwrap();
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(router.next_id().await.unwrap().to_raw(), 2_000);
}

#[tokio::test]
async fn unserved_slot_never_becomes_ready() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());

    let router = router(&client, &connector, 9);
    wait_phase(&router, RouterPhase::Degraded).await;
    assert_eq!(
        router.wait_ready(Duration::from_millis(50)).await,
        Err(Error::NoRoute { worker_id: 9 })
    );
}

#[tokio::test]
async fn fails_over_between_leader_endpoints() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let server = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    let primary = connector.add("primary:1", 1_000);
    let secondary = connector.add("secondary:1", 2_000);

    server
        .register_worker_slot(ROOT, 4, &record(&["primary:1", "secondary:1"]))
        .await
        .unwrap();
    let router = router(&client, &connector, 4);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(router.routes().connections().len(), 2);

    primary.set_up(false);
    for _ in 0..20 {
        assert!(router.next_id().await.unwrap().to_raw() >= 2_000);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let routes = router.routes();
    let health: Vec<_> = routes
        .connections()
        .iter()
        .map(|c| (c.addr().to_string(), c.health()))
        .collect();
    assert!(health.contains(&("primary:1".to_string(), Health::Suspect)));
    assert!(health.contains(&("secondary:1".to_string(), Health::Ok)));

    secondary.set_up(false);
    assert_eq!(
        router.next_id().await,
        Err(Error::NoRoute { worker_id: 4 })
    );

    primary.set_up(true);
    let deadline = Instant::now() + Duration::from_secs(2);
    while router.next_id().await.is_err() {
        assert!(Instant::now() < deadline, "primary never recovered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn remote_errors_are_returned_as_is() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let server = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    let leader = connector.add("leader:1", 1_000);

    server
        .register_worker_slot(ROOT, 6, &record(&["leader:1"]))
        .await
        .unwrap();
    let router = router(&client, &connector, 6);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();

    let ids = router.next_ids(5).await.unwrap();
    let raw: Vec<u64> = ids.iter().map(|id| id.to_raw()).collect();
    assert_eq!(raw, vec![1_000, 1_001, 1_002, 1_003, 1_004]);

    leader.rolled_back.store(true, Ordering::SeqCst);
    assert_eq!(
        router.next_id().await,
        Err(Error::Remote(WireError::IdGeneration(
            snowfleet::Error::ClockRollback {
                last_timestamp: 1_000,
                now: 900,
            }
        )))
    );
    // A refusal is not a connection fault.
    assert!(router.routes().connections()[0].is_healthy());
}

#[tokio::test]
async fn closed_router_refuses_calls() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let server = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    connector.add("leader:1", 1_000);

    server
        .register_worker_slot(ROOT, 8, &record(&["leader:1"]))
        .await
        .unwrap();
    let router = router(&client, &connector, 8);
    router.wait_ready(Duration::from_secs(2)).await.unwrap();
    let connections = router.routes().connections().to_vec();

    router.close();
    assert_eq!(router.phase(), RouterPhase::Closed);
    assert!(connections.iter().all(|c| c.is_closed()));
    assert_eq!(
        router.next_id().await,
        Err(Error::RouterClosed { worker_id: 8 })
    );
    assert_eq!(router.bind(), Err(Error::RouterClosed { worker_id: 8 }));
    assert_eq!(
        router.wait_ready(Duration::from_millis(50)).await,
        Err(Error::RouterClosed { worker_id: 8 })
    );
}

#[tokio::test]
async fn registry_reuses_live_routers() {
    let tree = MemoryTree::new();
    let client = session(&tree).await;
    let connector = Arc::new(FakeConnector::default());
    let routers = RouterRegistry::new(client, connector, config());

    let first = routers.bind(3).unwrap();
    let again = routers.bind(3).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_ne!(first.phase(), RouterPhase::Unbound);
    assert_eq!(routers.len(), 1);

    first.close();
    assert!(routers.get(3).is_none());
    let fresh = routers.bind(3).unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert_ne!(fresh.phase(), RouterPhase::Closed);

    routers.close_all();
    assert!(routers.is_empty());
    assert_eq!(fresh.phase(), RouterPhase::Closed);
}
