//! The dispatch hub -- the sole public API surface.
//!
//! One hub per messaging domain. Owns the subscription index, the service
//! registry, the peer-connection table, and the optional acceptor. Symmetric
//! peer model: a hub is simultaneously a server (registry, acceptor, index)
//! and a client (originates calls, installs remote subscriptions).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use armi_protocol::{CallOutcome, CallRequest, Envelope, SubscribeControl, Value, WireError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::error::ArmiError;
use crate::peer::PeerConnection;
use crate::service::ServiceDescriptor;
use crate::subscription::{Delivery, Filter, Sink, SubscriberEntry, SubscriptionIndex};

/// Reason handed to peers and callers when the hub tears itself down.
/// Callers that trigger a remote shutdown may verify this text.
pub const REASON_SHUTDOWN: &str = "Shutdown requested.";

/// Consulted once per inbound TCP accept; a `false` answer closes the
/// socket before anything is read from it.
pub type AccessControl = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// A value that can be published under its canonical type name.
pub trait TypedPayload: serde::Serialize {
    const DATA_TYPE: &'static str;
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// The process-level messaging hub. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    pub(crate) subscriptions: SubscriptionIndex,
    services: RwLock<HashMap<String, Arc<ServiceDescriptor>>>,
    peers: Mutex<HashMap<SocketAddr, Arc<PeerConnection>>>,
    /// Hub-scoped call serial counter; never shared between hub instances.
    serials: AtomicU64,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                subscriptions: SubscriptionIndex::default(),
                services: RwLock::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                serials: AtomicU64::new(0),
                state: AtomicU8::new(STATE_IDLE),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Whether this hub is accepting remote clients: true after
    /// [`accept_remote_clients`](Self::accept_remote_clients) succeeds,
    /// false again after [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Bind the listening socket and start accepting remote hubs. May be
    /// called at most once per hub. Returns the bound port, which is the
    /// kernel-assigned one when the caller requested port 0.
    pub async fn accept_remote_clients(
        &self,
        bind: Option<SocketAddr>,
        access: Option<AccessControl>,
    ) -> Result<u16, ArmiError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ArmiError::IllegalState(
                "already accepting remote clients (or shut down); accept_remote_clients may be called once".into(),
            ));
        }
        let bind = match bind {
            Some(addr) => addr,
            None => inner.config.listen_addr.parse().map_err(|e| {
                inner.state.store(STATE_IDLE, Ordering::SeqCst);
                ArmiError::IllegalState(format!("bad listen_addr {:?}: {e}", inner.config.listen_addr))
            })?,
        };
        let listener = match TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                inner.state.store(STATE_IDLE, Ordering::SeqCst);
                return Err(ArmiError::Io(e));
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                inner.state.store(STATE_IDLE, Ordering::SeqCst);
                return Err(ArmiError::Io(e));
            }
        };
        tracing::info!(%bind, port, "accepting remote clients");

        let hub = inner.clone();
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            accept_loop(hub, listener, access, cancel).await;
        });
        Ok(port)
    }

    /// Install or remove a named service. Requires the hub to be accepting
    /// remote clients; `None` unregisters.
    pub async fn register_service(
        &self,
        name: &str,
        service: Option<Arc<ServiceDescriptor>>,
    ) -> Result<(), ArmiError> {
        if !self.is_running() {
            return Err(ArmiError::IllegalState(
                "server not running; you must first call accept_remote_clients()".into(),
            ));
        }
        let mut services = self.inner.services.write().await;
        match service {
            Some(svc) => {
                services.insert(name.to_owned(), svc);
            }
            None => {
                services.remove(name);
            }
        }
        Ok(())
    }

    /// Names of the registered services, sorted.
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Human-readable descriptions of the live subscriptions.
    pub async fn subscription_descriptions(&self) -> Vec<String> {
        self.inner.subscriptions.descriptions().await
    }

    /// Synchronously invoke `service.method(args)` on a remote hub, dialling
    /// it first if no connection exists. Blocks this task until the response
    /// arrives or the configured call timeout fires.
    pub async fn call(
        &self,
        peer: SocketAddr,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ArmiError> {
        let conn = self.inner.open_peer(peer).await?;
        conn.call(service, method, args, self.inner.config.call_timeout()).await
    }

    /// Publish a typed value under its canonical type name.
    pub async fn publish<T: TypedPayload>(
        &self,
        value: &T,
        flavor: Option<&str>,
    ) -> Result<(), ArmiError> {
        let payload = armi_protocol::payload::encode(value)?;
        self.publish_raw(T::DATA_TYPE, flavor, payload).await;
        Ok(())
    }

    /// Publish raw payload bytes under an explicit type tag.
    pub async fn publish_raw(&self, data_type: &str, flavor: Option<&str>, payload: Vec<u8>) {
        let envelope = Envelope::new(data_type, flavor.map(str::to_owned), payload);
        self.inner.publish_envelope(envelope).await;
    }

    /// Publish a ready-made envelope to every matching subscriber.
    pub async fn publish_envelope(&self, envelope: Envelope) {
        self.inner.publish_envelope(envelope).await;
    }

    /// Install a subscription for `(data_type, flavor)`. With a `peer`, also
    /// install a matching remote subscription on that hub so its publishes
    /// are forwarded here. The receipt's `cancel` reverses both.
    pub async fn subscribe(
        &self,
        data_type: &str,
        flavor: Option<&str>,
        filter: Option<Filter>,
        delivery: Arc<dyn Delivery>,
        peer: Option<SocketAddr>,
    ) -> Result<Subscription, ArmiError> {
        let entry = SubscriberEntry::local(
            data_type.to_owned(),
            flavor.map(str::to_owned),
            filter.clone(),
            delivery,
        );
        let key = entry.key();
        self.inner.subscriptions.insert(entry).await;

        let mut remote = None;
        if let Some(addr) = peer {
            let transportable = filter.as_ref().and_then(Filter::transportable);
            if filter.is_some() && transportable.is_none() {
                // The remote side will forward everything under the key and
                // the filter only runs here; that costs bandwidth.
                tracing::info!(%addr, data_type, "filter is not transportable; evaluating locally only");
            }
            let control = SubscribeControl {
                data_type: data_type.to_owned(),
                flavor: flavor.map(str::to_owned),
                filter: transportable,
                subscribe: true,
            };
            let result = async {
                let conn = self.inner.open_peer(addr).await?;
                conn.transmit(Envelope::subscriber(&control)?).await?;
                Ok::<_, ArmiError>(conn)
            }
            .await;
            match result {
                Ok(conn) => {
                    conn.bind_local(key.clone());
                    remote = Some((addr, control));
                }
                Err(e) => {
                    self.inner
                        .subscriptions
                        .remove_id(&key.0, key.1.as_deref(), key.2)
                        .await;
                    return Err(e);
                }
            }
        }

        Ok(Subscription {
            hub: Arc::downgrade(&self.inner),
            key,
            remote,
        })
    }

    /// Terminal: closes the acceptor, shuts down every peer connection
    /// (waking their callers with [`REASON_SHUTDOWN`]), and clears both
    /// indices.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        tracing::info!("hub shutting down");
        inner.cancel.cancel();
        let peers: Vec<Arc<PeerConnection>> =
            inner.peers.lock().await.drain().map(|(_, conn)| conn).collect();
        for conn in peers {
            conn.shutdown(REASON_SHUTDOWN).await;
        }
        inner.subscriptions.clear().await;
        inner.services.write().await.clear();
    }

    /// Number of live peer connections.
    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    /// Number of calls currently awaiting a response, across all peers.
    pub async fn outstanding_calls(&self) -> usize {
        let peers = self.inner.peers.lock().await;
        peers.values().map(|conn| conn.calls.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<HubInner> {
        &self.inner
    }
}

impl HubInner {
    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serials.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reuse the connection to `addr` or dial a new one. Racing callers
    /// serialise on the table lock and converge on a single connection.
    pub(crate) async fn open_peer(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<PeerConnection>, ArmiError> {
        if addr.port() == 0 {
            return Err(ArmiError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "remote port can't be zero",
            )));
        }
        let mut peers = self.peers.lock().await;
        if let Some(conn) = peers.get(&addr) {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }
        let stream = match tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ArmiError::Io(e)),
            Err(_) => {
                return Err(ArmiError::Timeout(format!(
                    "Time-out expired while connecting to {addr}"
                )))
            }
        };
        let conn = PeerConnection::spawn(self, stream, addr);
        peers.insert(addr, conn.clone());
        tracing::info!(peer = %addr, "connected to remote hub");
        Ok(conn)
    }

    /// Register an accepted connection under its remote address.
    async fn register_peer(self: &Arc<Self>, addr: SocketAddr, conn: Arc<PeerConnection>) {
        let replaced = self.peers.lock().await.insert(addr, conn);
        if let Some(old) = replaced {
            tokio::spawn(async move {
                old.shutdown("Replaced by a new connection from the same peer.").await;
            });
        }
    }

    /// Drop a dying connection from the table, unless a newer connection has
    /// already taken its slot.
    pub(crate) async fn forget_peer(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        let mut peers = self.peers.lock().await;
        if let Some(current) = peers.get(&conn.peer_addr()) {
            if Arc::ptr_eq(current, conn) {
                peers.remove(&conn.peer_addr());
            }
        }
    }

    /// Fan an envelope out to every matching subscriber: first the exact
    /// (type, flavor) key, then -- for flavored envelopes -- the null-flavor
    /// subscribers of the same type. Delivery runs from a snapshot, so a
    /// tear-down triggered mid-publish never mutates the list under us.
    pub(crate) async fn publish_envelope(self: &Arc<Self>, envelope: Envelope) {
        let mut targets = self
            .subscriptions
            .snapshot(&envelope.data_type, envelope.flavor.as_deref())
            .await;
        if envelope.flavor.is_some() {
            targets.extend(self.subscriptions.snapshot(&envelope.data_type, None).await);
        }
        for sub in targets {
            if !sub.accepts(&envelope) {
                continue;
            }
            match &sub.sink {
                Sink::Local(delivery) => delivery.deliver(&envelope),
                Sink::Remote(weak) => {
                    let Some(conn) = weak.upgrade() else { continue };
                    if let Err(e) = conn.transmit(envelope.clone()).await {
                        tracing::warn!(
                            peer = %conn.peer_addr(),
                            error = %e,
                            "transmit failed during fan-out; tearing down connection"
                        );
                        // Deferred so the rest of the fan-out proceeds.
                        tokio::spawn(async move {
                            conn.shutdown("Transmit failed.").await;
                        });
                    }
                }
            }
        }
    }

    /// Run an inbound call against the registry. Every failure mode becomes
    /// the value of the response, never a connection-level error.
    pub(crate) async fn invoke(&self, request: CallRequest) -> CallOutcome {
        let service = self.services.read().await.get(&request.service).cloned();
        let Some(service) = service else {
            return CallOutcome::Error(WireError::here(format!(
                "Service not found: {}",
                request.service
            )));
        };
        let fut = match service.prepare(&request.service, &request.method, request.args) {
            Ok(fut) => fut,
            Err(e) => return CallOutcome::Error(e),
        };
        // Spawned so a panicking handler surfaces as an error response.
        match tokio::spawn(fut).await {
            Ok(Ok(value)) => CallOutcome::Value(value),
            Ok(Err(e)) => CallOutcome::Error(e),
            Err(e) => CallOutcome::Error(WireError::here(format!(
                "Invocation problem for {}.{}: {e}",
                request.service, request.method
            ))),
        }
    }
}

async fn accept_loop(
    hub: Arc<HubInner>,
    listener: TcpListener,
    access: Option<AccessControl>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if let Some(control) = &access {
                        if !control(remote.ip()) {
                            tracing::info!(%remote, "denied per access control");
                            continue;
                        }
                    }
                    tracing::info!(%remote, "accepted connection from remote hub");
                    let conn = PeerConnection::spawn(&hub, stream, remote);
                    hub.register_peer(remote, conn).await;
                }
                Err(e) => {
                    if hub.is_running() {
                        tracing::warn!(error = %e, "problem accepting connection from remote hub");
                    }
                }
            }
        }
    }
    tracing::info!("no longer accepting remote connections");
}

/// Subscription receipt; cancelling reverses the local installation and,
/// for remote subscriptions, transmits the matching cancel control message.
pub struct Subscription {
    hub: std::sync::Weak<HubInner>,
    key: (String, Option<String>, u64),
    remote: Option<(SocketAddr, SubscribeControl)>,
}

impl Subscription {
    pub fn data_type(&self) -> &str {
        &self.key.0
    }

    pub fn flavor(&self) -> Option<&str> {
        self.key.1.as_deref()
    }

    pub async fn cancel(self) -> Result<(), ArmiError> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(()); // hub already gone, nothing to reverse
        };
        hub.subscriptions
            .remove_id(&self.key.0, self.key.1.as_deref(), self.key.2)
            .await;
        if let Some((addr, mut control)) = self.remote {
            control.subscribe = false;
            let conn = hub.peers.lock().await.get(&addr).cloned();
            match conn {
                Some(conn) => {
                    conn.unbind_local(self.key.2);
                    conn.transmit(Envelope::subscriber(&control)?).await?;
                }
                None => {
                    return Err(ArmiError::Closed(format!(
                        "no connection to {addr} to cancel the remote subscription"
                    )))
                }
            }
        }
        Ok(())
    }
}
