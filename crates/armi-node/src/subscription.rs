//! Subscribers and the (type, flavor) subscription index.
//!
//! A subscriber is either local (an in-process delivery callback) or remote
//! (a proxy forwarding matched envelopes over its peer connection). The
//! index is the authoritative two-level map `type -> flavor -> ordered
//! subscribers`; null-flavor subscribers see every flavor of their type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use armi_protocol::{Envelope, FilterSpec};
use tokio::sync::RwLock;

use crate::peer::PeerConnection;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Sink for envelopes matching a subscription.
///
/// `deliver` runs on the publishing task; keep it short or hand off to a
/// channel. `abort` fires once when the subscription dies for a reason other
/// than cancellation, e.g. the remote peer closing.
pub trait Delivery: Send + Sync {
    fn deliver(&self, envelope: &Envelope);
    fn abort(&self, reason: &str);
}

/// Closure-backed [`Delivery`] implementation.
pub struct CallbackDelivery {
    on_envelope: Box<dyn Fn(&Envelope) + Send + Sync>,
    on_abort: Box<dyn Fn(&str) + Send + Sync>,
}

impl CallbackDelivery {
    pub fn new(
        on_envelope: impl Fn(&Envelope) + Send + Sync + 'static,
        on_abort: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_envelope: Box::new(on_envelope),
            on_abort: Box::new(on_abort),
        }
    }
}

impl Delivery for CallbackDelivery {
    fn deliver(&self, envelope: &Envelope) {
        (self.on_envelope)(envelope)
    }

    fn abort(&self, reason: &str) {
        (self.on_abort)(reason)
    }
}

/// Subscription predicate: either the transportable grammar or an arbitrary
/// local closure. Closures never travel to the publishing side.
#[derive(Clone)]
pub enum Filter {
    Spec(FilterSpec),
    Predicate(Arc<dyn Fn(&Envelope) -> bool + Send + Sync>),
}

impl Filter {
    pub fn accepts(&self, env: &Envelope) -> bool {
        match self {
            Filter::Spec(spec) => spec.accepts(env),
            Filter::Predicate(f) => f(env),
        }
    }

    /// The part of this filter that can be shipped to the publishing side.
    pub fn transportable(&self) -> Option<FilterSpec> {
        match self {
            Filter::Spec(spec) => Some(spec.clone()),
            Filter::Predicate(_) => None,
        }
    }
}

pub(crate) enum Sink {
    Local(Arc<dyn Delivery>),
    Remote(Weak<PeerConnection>),
}

/// One installed subscriber under a (type, flavor) key.
pub(crate) struct SubscriberEntry {
    pub id: u64,
    pub data_type: String,
    pub flavor: Option<String>,
    pub filter: Option<Filter>,
    pub sink: Sink,
}

impl SubscriberEntry {
    pub fn local(
        data_type: String,
        flavor: Option<String>,
        filter: Option<Filter>,
        delivery: Arc<dyn Delivery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            data_type,
            flavor,
            filter,
            sink: Sink::Local(delivery),
        })
    }

    pub fn remote(
        data_type: String,
        flavor: Option<String>,
        filter: Option<Filter>,
        conn: Weak<PeerConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            data_type,
            flavor,
            filter,
            sink: Sink::Remote(conn),
        })
    }

    /// Apply the filter; accepts everything when no filter is set.
    pub fn accepts(&self, env: &Envelope) -> bool {
        self.filter.as_ref().map_or(true, |f| f.accepts(env))
    }

    /// Fire the abort hook (local subscribers only).
    pub fn abort(&self, reason: &str) {
        if let Sink::Local(delivery) = &self.sink {
            delivery.abort(reason);
        }
    }

    pub fn key(&self) -> (String, Option<String>, u64) {
        (self.data_type.clone(), self.flavor.clone(), self.id)
    }

    fn describe(&self) -> String {
        let mut s = self.data_type.clone();
        if let Some(flavor) = &self.flavor {
            s.push('/');
            s.push_str(flavor);
        }
        if self.filter.is_some() {
            s.push_str("[+filter]");
        }
        match &self.sink {
            Sink::Local(_) => s,
            Sink::Remote(conn) => match conn.upgrade() {
                Some(c) => format!("{s} -> {}", c.peer_addr()),
                None => format!("{s} -> (closed)"),
            },
        }
    }
}

/// Two-level subscriber map; all structural mutation behind one lock, reads
/// hand out snapshots so fan-out never traverses under the lock.
#[derive(Default)]
pub(crate) struct SubscriptionIndex {
    inner: RwLock<HashMap<String, HashMap<Option<String>, Vec<Arc<SubscriberEntry>>>>>,
}

impl SubscriptionIndex {
    /// Add a subscriber at the tail of its (type, flavor) list; lists are
    /// created lazily.
    pub async fn insert(&self, entry: Arc<SubscriberEntry>) {
        let mut map = self.inner.write().await;
        map.entry(entry.data_type.clone())
            .or_default()
            .entry(entry.flavor.clone())
            .or_default()
            .push(entry);
    }

    /// Remove a subscriber by id.
    pub async fn remove_id(
        &self,
        data_type: &str,
        flavor: Option<&str>,
        id: u64,
    ) -> Option<Arc<SubscriberEntry>> {
        let mut map = self.inner.write().await;
        let subs = map.get_mut(data_type)?.get_mut(&flavor.map(str::to_owned))?;
        let pos = subs.iter().position(|s| s.id == id)?;
        Some(subs.remove(pos))
    }

    /// Remove the first remote subscriber under (type, flavor) bound to the
    /// given connection. Used when a cancel control message arrives.
    pub async fn remove_remote_matching(
        &self,
        data_type: &str,
        flavor: Option<&str>,
        conn: &Arc<PeerConnection>,
    ) -> Option<Arc<SubscriberEntry>> {
        let mut map = self.inner.write().await;
        let subs = map.get_mut(data_type)?.get_mut(&flavor.map(str::to_owned))?;
        let pos = subs.iter().position(|s| match &s.sink {
            Sink::Remote(weak) => weak
                .upgrade()
                .is_some_and(|c| Arc::ptr_eq(&c, conn)),
            Sink::Local(_) => false,
        })?;
        Some(subs.remove(pos))
    }

    /// Snapshot of the subscribers under exactly (type, flavor), in
    /// insertion order. Callers wanting null-flavor generalisation do a
    /// second lookup with `flavor = None`.
    pub async fn snapshot(&self, data_type: &str, flavor: Option<&str>) -> Vec<Arc<SubscriberEntry>> {
        let map = self.inner.read().await;
        map.get(data_type)
            .and_then(|flavors| flavors.get(&flavor.map(str::to_owned)))
            .map(|subs| subs.to_vec())
            .unwrap_or_default()
    }

    /// Human-readable list of live subscriptions, for diagnostics.
    pub async fn descriptions(&self) -> Vec<String> {
        let map = self.inner.read().await;
        let mut out = Vec::new();
        for flavors in map.values() {
            for subs in flavors.values() {
                for sub in subs {
                    out.push(sub.describe());
                }
            }
        }
        out
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}
