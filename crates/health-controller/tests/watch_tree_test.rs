//! Integration tests for the task watch tree over the in-memory store

use async_trait::async_trait;
use health_controller::backend::MemoryStore;
use health_controller::store::{CoordinationStore, StoreError, StoreEvent, StoreWatch};
use health_controller::watch_tree::EXISTENCE_POLL_INTERVAL;
use health_controller::{NodeKind, SyncAction, SyncEvent, TaskWatchTree, WatchError};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const ROOT: &str = "/swan/application";

fn task_path(group: &str, task: &str) -> String {
    format!("{}/default/web/{}/{}", ROOT, group, task)
}

/// Running host-network task with one TCP check per port
fn payload(id: &str, ports: &[u16]) -> Vec<u8> {
    let checks: Vec<_> = ports
        .iter()
        .map(|port| json!({"Type": "REMOTE_TCP", "Port": port, "IntervalSeconds": 10, "TimeoutSeconds": 2}))
        .collect();
    json!({
        "ID": id,
        "Status": "Running",
        "Network": "host",
        "StatusData": {"NodeAddress": "10.0.0.5"},
        "HealthChecks": checks,
    })
    .to_string()
    .into_bytes()
}

struct Harness {
    store: Arc<MemoryStore>,
    tree: Arc<TaskWatchTree>,
    events: mpsc::Receiver<SyncEvent>,
    scope: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

fn start(store: Arc<MemoryStore>) -> Harness {
    common::logging::init_for_tests();
    let (tx, events) = mpsc::channel(1024);
    let scope = CancellationToken::new();
    let dyn_store: Arc<dyn CoordinationStore> = store.clone();
    let tree = Arc::new(TaskWatchTree::new(dyn_store, ROOT, tx, scope.clone()));
    let handle = tokio::spawn(tree.clone().run());
    Harness {
        store,
        tree,
        events,
        scope,
        handle,
    }
}

async fn next(events: &mut mpsc::Receiver<SyncEvent>) -> (SyncAction, String) {
    let event = timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for sync event")
        .expect("sync event channel closed");
    (event.action, event.def.id)
}

async fn take(events: &mut mpsc::Receiver<SyncEvent>, n: usize) -> HashSet<(SyncAction, String)> {
    let mut seen = HashSet::new();
    for _ in 0..n {
        seen.insert(next(events).await);
    }
    seen
}

async fn assert_quiet(events: &mut mpsc::Receiver<SyncEvent>) {
    if let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        panic!("unexpected sync event {:?} {}", event.action, event.def.id);
    }
}

fn set(items: &[(SyncAction, &str)]) -> HashSet<(SyncAction, String)> {
    items
        .iter()
        .map(|(action, id)| (*action, id.to_string()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_existing_tasks_are_added() {
    let store = Arc::new(MemoryStore::new());
    store.put(&task_path("g1", "t1"), payload("t1", &[80, 81]));
    store.put(&task_path("g2", "t2"), payload("t2", &[6379]));

    let mut h = start(store);
    let seen = take(&mut h.events, 3).await;
    assert_eq!(
        seen,
        set(&[
            (SyncAction::Add, "0.t1"),
            (SyncAction::Add, "1.t1"),
            (SyncAction::Add, "0.t2"),
        ])
    );
    assert!(h.tree.is_watching(&task_path("g1", "t1")));
    assert_eq!(
        h.tree.node(&format!("{}/default", ROOT)).map(|(kind, _)| kind),
        Some(NodeKind::Namespace)
    );
    assert_quiet(&mut h.events).await;
}

#[tokio::test(start_paused = true)]
async fn test_payload_changes_are_diffed() {
    let store = Arc::new(MemoryStore::new());
    let path = task_path("g1", "t1");
    store.put(&path, payload("t1", &[80, 81]));

    let mut h = start(store);
    take(&mut h.events, 2).await;

    h.store.put(&path, payload("t1", &[80, 81, 82]));
    assert_eq!(
        take(&mut h.events, 3).await,
        set(&[
            (SyncAction::Update, "0.t1"),
            (SyncAction::Update, "1.t1"),
            (SyncAction::Add, "2.t1"),
        ])
    );

    h.store.put(&path, payload("t1", &[80]));
    assert_eq!(
        take(&mut h.events, 3).await,
        set(&[
            (SyncAction::Update, "0.t1"),
            (SyncAction::Delete, "1.t1"),
            (SyncAction::Delete, "2.t1"),
        ])
    );

    // Same content again
    h.store.put(&path, payload("t1", &[80]));
    assert_quiet(&mut h.events).await;
    assert_eq!(h.tree.node(&path).map(|(_, defs)| defs.len()), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_new_task_is_picked_up() {
    let store = Arc::new(MemoryStore::new());
    store.put(&task_path("g1", "t1"), payload("t1", &[80]));

    let mut h = start(store);
    take(&mut h.events, 1).await;

    h.store.put(&task_path("g1", "t2"), payload("t2", &[8080]));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t2".to_string()));

    h.store.put(&task_path("g9", "t3"), payload("t3", &[9000]));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t3".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_task_is_retracted() {
    let store = Arc::new(MemoryStore::new());
    let path = task_path("g1", "t1");
    store.put(&path, payload("t1", &[80, 81]));

    let mut h = start(store);
    take(&mut h.events, 2).await;

    h.store.delete(&path).unwrap();
    assert_eq!(
        take(&mut h.events, 2).await,
        set(&[(SyncAction::Delete, "0.t1"), (SyncAction::Delete, "1.t1")])
    );
    assert!(!h.tree.is_watching(&path));
}

#[tokio::test(start_paused = true)]
async fn test_deleting_ancestor_retracts_subtree() {
    let store = Arc::new(MemoryStore::new());
    store.put(&task_path("g1", "t1"), payload("t1", &[80]));
    store.put(&task_path("g1", "t2"), payload("t2", &[81]));
    store.put(&task_path("g2", "t3"), payload("t3", &[82]));

    let mut h = start(store);
    take(&mut h.events, 3).await;

    h.store.delete(&format!("{}/default/web/g1", ROOT)).unwrap();
    assert_eq!(
        take(&mut h.events, 2).await,
        set(&[(SyncAction::Delete, "0.t1"), (SyncAction::Delete, "0.t2")])
    );
    assert_quiet(&mut h.events).await;
    assert!(h.tree.is_watching(&task_path("g2", "t3")));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payload_yields_no_checks_until_fixed() {
    let store = Arc::new(MemoryStore::new());
    let path = task_path("g1", "t1");
    store.put(&path, b"{not json".to_vec());

    let mut h = start(store);
    assert_quiet(&mut h.events).await;
    assert!(h.tree.is_watching(&path));

    h.store.put(&path, payload("t1", &[80]));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_root_then_reseeds() {
    let store = Arc::new(MemoryStore::new());
    let mut h = start(store);
    assert_quiet(&mut h.events).await;

    h.store.put(&task_path("g1", "t1"), payload("t1", &[80]));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t1".to_string()));

    h.store.delete(ROOT).unwrap();
    assert_eq!(next(&mut h.events).await, (SyncAction::Delete, "0.t1".to_string()));

    h.store.put(&task_path("g1", "t1"), payload("t1", &[80]));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_expired_watches_recover() {
    let store = Arc::new(MemoryStore::new());
    store.put(&task_path("g1", "t1"), payload("t1", &[80]));

    let mut h = start(store);
    take(&mut h.events, 1).await;

    h.store.expire_watches();
    assert_eq!(next(&mut h.events).await, (SyncAction::Delete, "0.t1".to_string()));
    assert_eq!(next(&mut h.events).await, (SyncAction::Add, "0.t1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_second_watch_on_same_path_fails() {
    let store = Arc::new(MemoryStore::new());
    let path = task_path("g1", "t1");
    store.put(&path, payload("t1", &[80]));

    let mut h = start(store);
    take(&mut h.events, 1).await;

    assert_eq!(
        h.tree.watch_data(&path, NodeKind::Task).await,
        Err(WatchError::AlreadyWatching(path))
    );
    assert_quiet(&mut h.events).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_does_not_retract() {
    let store = Arc::new(MemoryStore::new());
    store.put(&task_path("g1", "t1"), payload("t1", &[80]));

    let mut h = start(store);
    take(&mut h.events, 1).await;

    h.scope.cancel();
    timeout(Duration::from_secs(5), h.handle)
        .await
        .expect("tree did not stop")
        .unwrap();
    assert_quiet(&mut h.events).await;
}

/// Store whose value watches never fire
struct SilentStore {
    inner: Arc<MemoryStore>,
    held: Mutex<Vec<tokio::sync::oneshot::Sender<StoreEvent>>>,
}

#[async_trait]
impl CoordinationStore for SilentStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.exists(path).await
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, StoreWatch), StoreError> {
        let (data, _) = self.inner.get_watch(path).await?;
        let (tx, watch) = StoreWatch::channel();
        self.held.lock().unwrap().push(tx);
        Ok((data, watch))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, StoreWatch), StoreError> {
        self.inner.children_watch(path).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_existence_check_evicts_node_without_watch_event() {
    common::logging::init_for_tests();
    let memory = Arc::new(MemoryStore::new());
    let path = task_path("g1", "t1");
    memory.put(&path, payload("t1", &[80]));

    let store: Arc<dyn CoordinationStore> = Arc::new(SilentStore {
        inner: memory.clone(),
        held: Mutex::new(Vec::new()),
    });
    let (tx, mut events) = mpsc::channel(1024);
    let scope = CancellationToken::new();
    let tree = Arc::new(TaskWatchTree::new(store, ROOT, tx, scope.clone()));
    tokio::spawn(tree.clone().run());

    assert_eq!(next(&mut events).await, (SyncAction::Add, "0.t1".to_string()));

    memory.delete(&path).unwrap();
    // Nothing until the existence check runs
    assert_quiet(&mut events).await;
    assert!(tree.is_watching(&path));

    let event = timeout(EXISTENCE_POLL_INTERVAL, events.recv())
        .await
        .expect("existence check did not run")
        .expect("sync event channel closed");
    assert_eq!((event.action, event.def.id), (SyncAction::Delete, "0.t1".to_string()));
    assert!(!tree.is_watching(&path));
    scope.cancel();
}
