//! In-process store and registry.

use crate::discovery::{DiscoveryError, EntryStream, Registry, RegistryEntry, is_direct_child};
use crate::store::{CoordinationStore, StoreError, StoreEvent, StoreWatch};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};

type Waiters = HashMap<String, Vec<oneshot::Sender<StoreEvent>>>;

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Vec<u8>>,
    data_watches: Waiters,
    child_watches: Waiters,
}

impl StoreState {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(waiters: &mut Waiters, path: &str, event: StoreEvent) {
        for tx in waiters.remove(path).unwrap_or_default() {
            let _ = tx.send(event);
        }
    }

    fn fire_parent(&mut self, path: &str) {
        if let Some(parent) = parent_of(path) {
            Self::fire(&mut self.child_watches, parent, StoreEvent::ChildrenChanged);
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

/// In-memory hierarchical store with one-shot watches
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or overwrite `path`, creating missing ancestors empty
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.lock();

        let mut missing = Vec::new();
        let mut cursor = parent_of(path);
        while let Some(ancestor) = cursor {
            if state.nodes.contains_key(ancestor) {
                break;
            }
            missing.push(ancestor.to_string());
            cursor = parent_of(ancestor);
        }
        for ancestor in missing.into_iter().rev() {
            state.nodes.insert(ancestor.clone(), Vec::new());
            StoreState::fire(&mut state.data_watches, &ancestor, StoreEvent::NodeCreated);
            state.fire_parent(&ancestor);
        }

        let created = state.nodes.insert(path.to_string(), data.into()).is_none();
        if created {
            StoreState::fire(&mut state.data_watches, path, StoreEvent::NodeCreated);
            state.fire_parent(path);
        } else {
            StoreState::fire(&mut state.data_watches, path, StoreEvent::DataChanged);
        }
    }

    /// Delete `path` and everything below it, deepest first
    pub fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }

        let prefix = format!("{}/", path);
        let mut doomed: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        doomed.sort_by_key(|key| std::cmp::Reverse(key.matches('/').count()));
        doomed.push(path.to_string());

        for key in doomed {
            state.nodes.remove(&key);
            StoreState::fire(&mut state.data_watches, &key, StoreEvent::NodeDeleted);
            StoreState::fire(&mut state.child_watches, &key, StoreEvent::NodeDeleted);
            state.fire_parent(&key);
        }
        Ok(())
    }

    /// Resolve every pending watch with `NotWatching`
    pub fn expire_watches(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let waiters: Vec<_> = state
            .data_watches
            .drain()
            .chain(state.child_watches.drain())
            .flat_map(|(_, txs)| txs)
            .collect();
        for tx in waiters {
            let _ = tx.send(StoreEvent::NotWatching);
        }
    }

    /// Number of pending value watches on `path`
    pub fn data_watchers(&self, path: &str) -> usize {
        let mut state = self.lock();
        let waiters = state.data_watches.entry(path.to_string()).or_default();
        waiters.retain(|tx| !tx.is_closed());
        waiters.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.lock().nodes.contains_key(path))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, StoreWatch), StoreError> {
        let mut state = self.lock();
        let data = state
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let (tx, watch) = StoreWatch::channel();
        state.data_watches.entry(path.to_string()).or_default().push(tx);
        Ok((data, watch))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, StoreWatch), StoreError> {
        let mut state = self.lock();
        if !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = state.children(path);
        let (tx, watch) = StoreWatch::channel();
        state.child_watches.entry(path.to_string()).or_default().push(tx);
        Ok((children, watch))
    }
}

#[derive(Clone)]
struct RegistryState {
    entries: Vec<RegistryEntry>,
    available: bool,
}

/// In-memory registry keeping registration order
pub struct MemoryRegistry {
    state: watch::Sender<RegistryState>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        let (state, _) = watch::channel(RegistryState {
            entries: Vec::new(),
            available: true,
        });
        Self { state }
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a registration, as if its session expired
    pub fn remove(&self, key: &str) -> bool {
        let mut removed = false;
        self.state.send_modify(|state| {
            let before = state.entries.len();
            state.entries.retain(|entry| entry.key != key);
            removed = state.entries.len() != before;
        });
        removed
    }

    /// Simulate an outage: watches fail and registration is refused
    pub fn set_available(&self, available: bool) {
        self.state.send_modify(|state| state.available = available);
    }

    /// Direct children of `path` in registration order
    pub fn entries(&self, path: &str) -> Vec<RegistryEntry> {
        children_of(&self.state.borrow().entries, path)
    }
}

fn children_of(entries: &[RegistryEntry], path: &str) -> Vec<RegistryEntry> {
    entries
        .iter()
        .filter(|entry| is_direct_child(path, &entry.key))
        .cloned()
        .collect()
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, key: &str, value: Vec<u8>) -> Result<(), DiscoveryError> {
        if !self.state.borrow().available {
            return Err(DiscoveryError::Backend("registry unavailable".to_string()));
        }

        self.state.send_modify(|state| {
            match state.entries.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.value = value,
                None => state.entries.push(RegistryEntry {
                    key: key.to_string(),
                    value,
                }),
            }
        });
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<EntryStream, DiscoveryError> {
        if !self.state.borrow().available {
            return Err(DiscoveryError::Backend("registry unavailable".to_string()));
        }

        let mut state_rx = self.state.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let path = path.to_string();

        tokio::spawn(async move {
            loop {
                let item = {
                    let state = state_rx.borrow_and_update();
                    if state.available {
                        Ok(children_of(&state.entries, &path))
                    } else {
                        Err(DiscoveryError::Backend("registry unavailable".to_string()))
                    }
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }

                tokio::select! {
                    _ = tx.closed() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
