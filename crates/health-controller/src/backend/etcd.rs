//! etcd-backed store and registry.
//!
//! etcd is flat, so the tree is kept as one key per node path. Value and
//! children watches are etcd watches started at the revision following the
//! read, resolved on the first event that matters to the caller. Registry
//! entries are bound to a lease kept alive in the background and are listed
//! by create revision, which gives registration order.

use crate::discovery::{DiscoveryError, EntryStream, Registry, RegistryEntry, is_direct_child};
use crate::store::{CoordinationStore, StoreError, StoreEvent, StoreWatch};
use crate::types::TlsFiles;
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, Event, EventType, GetOptions, Identity, PutOptions,
    SortOrder, SortTarget, TlsOptions, WatchOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build connect options, loading PEM material when configured
pub async fn connect_options(
    tls: &TlsFiles,
    timeout: Duration,
) -> Result<ConnectOptions, std::io::Error> {
    let mut options = ConnectOptions::new()
        .with_timeout(timeout)
        .with_connect_timeout(timeout);

    if !tls.is_empty() {
        let mut tls_options = TlsOptions::new();
        if let Some(ca) = &tls.ca_cert {
            tls_options = tls_options.ca_certificate(Certificate::from_pem(tokio::fs::read(ca).await?));
        }
        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            let cert = tokio::fs::read(cert).await?;
            let key = tokio::fs::read(key).await?;
            tls_options = tls_options.identity(Identity::from_pem(cert, key));
        }
        options = options.with_tls(tls_options);
    }

    Ok(options)
}

fn backend(e: etcd_client::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn registry_backend(e: etcd_client::Error) -> DiscoveryError {
    DiscoveryError::Backend(e.to_string())
}

fn key_of(event: &Event) -> Option<String> {
    event
        .kv()
        .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
}

/// Value watch: first put or delete of `path` itself
fn classify_value(path: &str, event: &Event) -> Option<StoreEvent> {
    if key_of(event).as_deref() != Some(path) {
        return None;
    }
    match event.event_type() {
        EventType::Delete => Some(StoreEvent::NodeDeleted),
        EventType::Put => {
            let created = event
                .kv()
                .is_some_and(|kv| kv.create_revision() == kv.mod_revision());
            Some(if created {
                StoreEvent::NodeCreated
            } else {
                StoreEvent::DataChanged
            })
        }
    }
}

/// Children watch: deletion of `path`, or a direct child appearing or vanishing
fn classify_children(path: &str, event: &Event) -> Option<StoreEvent> {
    let key = key_of(event)?;
    if key == path {
        return matches!(event.event_type(), EventType::Delete).then_some(StoreEvent::NodeDeleted);
    }
    if !is_direct_child(path, &key) {
        return None;
    }
    match event.event_type() {
        EventType::Delete => Some(StoreEvent::ChildrenChanged),
        EventType::Put => event
            .kv()
            .filter(|kv| kv.create_revision() == kv.mod_revision())
            .map(|_| StoreEvent::ChildrenChanged),
    }
}

/// Resolve a one-shot watch from an etcd watch stream
fn spawn_watch<F>(mut client: Client, key: String, options: WatchOptions, classify: F) -> StoreWatch
where
    F: Fn(&Event) -> Option<StoreEvent> + Send + 'static,
{
    let (mut tx, watch) = StoreWatch::channel();

    tokio::spawn(async move {
        let (mut watcher, mut stream) = match client.watch(key.clone(), Some(options)).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to create watch stream");
                let _ = tx.send(StoreEvent::NotWatching);
                return;
            }
        };

        let event = loop {
            tokio::select! {
                _ = tx.closed() => break None,
                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break Some(StoreEvent::NotWatching);
                        }
                        if let Some(event) = resp.events().iter().find_map(&classify) {
                            break Some(event);
                        }
                    }
                    Ok(None) => break Some(StoreEvent::NotWatching),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Watch stream error");
                        break Some(StoreEvent::NotWatching);
                    }
                }
            }
        };

        if let Err(e) = watcher.cancel().await {
            debug!(key = %key, error = %e, "Failed to cancel watch");
        }
        if let Some(event) = event {
            let _ = tx.send(event);
        }
    });

    watch
}

/// Coordination store on etcd
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(
        endpoints: &[String],
        tls: &TlsFiles,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = connect_options(tls, timeout)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to load TLS material: {}", e)))?;
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(backend)?;
        info!(endpoints = ?endpoints, "Connected to etcd store");
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(path, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(backend)?;
        Ok(resp.count() > 0)
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, StoreWatch), StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(backend)?;
        let data = resp
            .kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();

        let watched = path.to_string();
        let watch = spawn_watch(
            client,
            path.to_string(),
            WatchOptions::new().with_start_revision(revision + 1),
            move |event| classify_value(&watched, event),
        );
        Ok((data, watch))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, StoreWatch), StoreError> {
        if !self.exists(path).await? {
            return Err(StoreError::NoNode(path.to_string()));
        }

        let mut client = self.client.clone();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let resp = client
            .get(
                prefix.clone(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(backend)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let children = resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
            .filter(|key| is_direct_child(path, key))
            .map(|key| key[prefix.len()..].to_string())
            .collect();

        let watched = path.to_string();
        let watch = spawn_watch(
            client,
            path.to_string(),
            WatchOptions::new()
                .with_prefix()
                .with_start_revision(revision + 1),
            move |event| classify_children(&watched, event),
        );
        Ok((children, watch))
    }
}

/// Registry on etcd with lease-bound registrations
pub struct EtcdRegistry {
    client: Client,
    lease_ttl: Duration,
    lease: Arc<Mutex<Option<i64>>>,
    scope: CancellationToken,
}

impl EtcdRegistry {
    /// Registrations live until `scope` is cancelled and the lease runs out
    pub fn new(client: Client, lease_ttl: Duration, scope: CancellationToken) -> Self {
        Self {
            client,
            lease_ttl,
            lease: Arc::new(Mutex::new(None)),
            scope,
        }
    }

    pub async fn connect(
        endpoints: &[String],
        tls: &TlsFiles,
        lease_ttl: Duration,
        scope: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let options = connect_options(tls, lease_ttl)
            .await
            .map_err(|e| DiscoveryError::Backend(format!("failed to load TLS material: {}", e)))?;
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(registry_backend)?;
        info!(endpoints = ?endpoints, "Connected to etcd registry");
        Ok(Self::new(client, lease_ttl, scope))
    }

    /// Current lease, granting a new one if the last expired
    async fn lease_id(&self) -> Result<i64, DiscoveryError> {
        let mut slot = self.lease.lock().await;
        if let Some(id) = *slot {
            return Ok(id);
        }

        let mut client = self.client.clone();
        let ttl = self.lease_ttl.as_secs().max(1) as i64;
        let lease = client.lease_grant(ttl, None).await.map_err(registry_backend)?;
        let (keeper, stream) = client
            .lease_keep_alive(lease.id())
            .await
            .map_err(registry_backend)?;
        info!(lease = lease.id(), ttl, "Granted registry lease");

        tokio::spawn(keep_alive(
            keeper,
            stream,
            lease.id(),
            self.lease_ttl,
            self.lease.clone(),
            self.scope.clone(),
        ));

        *slot = Some(lease.id());
        Ok(lease.id())
    }
}

async fn keep_alive(
    mut keeper: etcd_client::LeaseKeeper,
    mut stream: etcd_client::LeaseKeepAliveStream,
    id: i64,
    ttl: Duration,
    slot: Arc<Mutex<Option<i64>>>,
    scope: CancellationToken,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease = id, error = %e, "Failed to refresh registry lease");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {}
                    Ok(_) => {
                        warn!(lease = id, "Registry lease expired");
                        break;
                    }
                    Err(e) => {
                        warn!(lease = id, error = %e, "Registry lease keep-alive failed");
                        break;
                    }
                }
            }
        }
    }

    let mut slot = slot.lock().await;
    if *slot == Some(id) {
        *slot = None;
    }
}

async fn list_children(
    client: &mut Client,
    path: &str,
) -> Result<(Vec<RegistryEntry>, i64), DiscoveryError> {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let resp = client
        .get(
            prefix,
            Some(
                GetOptions::new()
                    .with_prefix()
                    .with_sort(SortTarget::Create, SortOrder::Ascend),
            ),
        )
        .await
        .map_err(registry_backend)?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
    let entries = resp
        .kvs()
        .iter()
        .map(|kv| RegistryEntry {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
        })
        .filter(|entry| is_direct_child(path, &entry.key))
        .collect();
    Ok((entries, revision))
}

async fn pump_entries(
    mut client: Client,
    path: String,
    tx: &mpsc::Sender<Result<Vec<RegistryEntry>, DiscoveryError>>,
) -> Result<(), DiscoveryError> {
    let (entries, revision) = list_children(&mut client, &path).await?;
    if tx.send(Ok(entries)).await.is_err() {
        return Ok(());
    }

    let prefix = format!("{}/", path.trim_end_matches('/'));
    let options = WatchOptions::new()
        .with_prefix()
        .with_start_revision(revision + 1);
    let (mut watcher, mut stream) = client
        .watch(prefix, Some(options))
        .await
        .map_err(registry_backend)?;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                let _ = watcher.cancel().await;
                return Ok(());
            }
            message = stream.message() => {
                let resp = message.map_err(registry_backend)?.ok_or(DiscoveryError::Closed)?;
                if resp.canceled() {
                    return Err(DiscoveryError::Closed);
                }
                if resp.events().is_empty() {
                    continue;
                }
                let (entries, _) = list_children(&mut client, &path).await?;
                if tx.send(Ok(entries)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, key: &str, value: Vec<u8>) -> Result<(), DiscoveryError> {
        let lease = self.lease_id().await?;
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(registry_backend)?;
        debug!(key = %key, lease, "Registered");
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<EntryStream, DiscoveryError> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let path = path.to_string();

        tokio::spawn(async move {
            if let Err(e) = pump_entries(client, path.clone(), &tx).await {
                warn!(path = %path, error = %e, "Registry watch failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(rx)
    }
}
