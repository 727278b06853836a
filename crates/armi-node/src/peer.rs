//! Peer connection -- owns one socket to one remote hub.
//!
//! Symmetric: identical on both sides regardless of who dialled. One receive
//! task reads and classifies envelopes; writes contend on a per-connection
//! monitor; outstanding outbound calls wait in the call table until the
//! paired response arrives on the same socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use armi_protocol::{
    CallOutcome, CallRequest, CallResponse, Envelope, EnvelopeCodec, SubscribeControl, Value,
    CALL_TYPE, RESPONSE_TYPE, SUBSCRIBER_TYPE,
};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::calls::CallTable;
use crate::error::ArmiError;
use crate::hub::HubInner;
use crate::subscription::{Filter, SubscriberEntry};

/// (type, flavor, subscriber id) -- enough to find an entry in the index.
type SubKey = (String, Option<String>, u64);

pub struct PeerConnection {
    addr: SocketAddr,
    hub: Weak<HubInner>,
    /// Write monitor: every writer on this connection serialises here.
    writer: Mutex<FramedWrite<OwnedWriteHalf, EnvelopeCodec>>,
    pub(crate) calls: CallTable,
    open: AtomicBool,
    cancel: CancellationToken,
    /// Remote-proxy subscribers installed by this peer's control messages;
    /// the receive task owns them and removes them on shutdown.
    installed: StdMutex<Vec<SubKey>>,
    /// Local subscribers installed on behalf of this peer; aborted when the
    /// connection dies.
    bound_locals: StdMutex<Vec<SubKey>>,
}

impl PeerConnection {
    /// Wrap an established socket and start its receive task. Used for both
    /// dialled and accepted connections.
    pub(crate) fn spawn(hub: &Arc<HubInner>, stream: TcpStream, addr: SocketAddr) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Self {
            addr,
            hub: Arc::downgrade(hub),
            writer: Mutex::new(FramedWrite::new(write_half, EnvelopeCodec)),
            calls: CallTable::default(),
            open: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            installed: StdMutex::new(Vec::new()),
            bound_locals: StdMutex::new(Vec::new()),
        });
        let frames = FramedRead::new(read_half, EnvelopeCodec);
        tokio::spawn(receive_loop(conn.clone(), frames));
        conn
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Remember a local subscriber installed on behalf of this peer.
    pub(crate) fn bind_local(&self, key: SubKey) {
        self.bound_locals.lock().unwrap().push(key);
    }

    pub(crate) fn unbind_local(&self, id: u64) {
        self.bound_locals.lock().unwrap().retain(|(_, _, sub_id)| *sub_id != id);
    }

    /// Write one envelope to the peer. Contends with every other writer on
    /// this connection.
    pub async fn transmit(&self, envelope: Envelope) -> Result<(), ArmiError> {
        if !self.is_open() {
            return Err(ArmiError::Closed(format!("connection to {} is closed", self.addr)));
        }
        let mut writer = self.writer.lock().await;
        writer.send(envelope).await.map_err(ArmiError::from)
    }

    /// Synchronously invoke a method on the peer: transmit the call, block
    /// this task until the paired response arrives or the watchdog fires.
    pub(crate) async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ArmiError> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| ArmiError::Closed("hub has shut down".into()))?;
        let serial = hub.next_serial();
        let slot = self.calls.register(serial);
        let request = CallRequest {
            service: service.to_owned(),
            method: method.to_owned(),
            serial,
            args,
        };
        let envelope = Envelope::call(&request)?;
        if let Err(e) = self.transmit(envelope).await {
            self.calls.discard(serial);
            return Err(e);
        }
        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(Ok(CallOutcome::Value(value)))) => Ok(value),
            Ok(Ok(Ok(CallOutcome::Error(e)))) => Err(ArmiError::Invocation(e)),
            Ok(Ok(Err(aborted))) => Err(aborted),
            Ok(Err(_)) => Err(ArmiError::Closed(format!("connection to {} is closed", self.addr))),
            Err(_) => {
                // Watchdog fired; forget the serial so a late response is
                // dropped rather than delivered to nobody.
                self.calls.discard(serial);
                Err(ArmiError::Timeout(format!(
                    "no response to {service}.{method} @ {} within {} ms",
                    self.addr,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Deliver an inbound response to the caller waiting on its serial.
    pub(crate) fn handle_response(&self, response: CallResponse) {
        if !self.calls.complete(response.serial, response.outcome) {
            tracing::debug!(
                serial = response.serial,
                peer = %self.addr,
                "dropping response for unknown or expired call"
            );
        }
    }

    /// Close the socket, wake every blocked caller with `reason`, and evict
    /// every subscriber tied to this connection. Idempotent.
    pub async fn shutdown(self: &Arc<Self>, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peer = %self.addr, reason, "closing peer connection");
        self.cancel.cancel();
        self.calls.abort_all(reason);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.get_mut().shutdown().await;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.forget_peer(self).await;

            let installed: Vec<SubKey> = self.installed.lock().unwrap().drain(..).collect();
            for (data_type, flavor, id) in installed {
                hub.subscriptions.remove_id(&data_type, flavor.as_deref(), id).await;
            }

            let bound: Vec<SubKey> = self.bound_locals.lock().unwrap().drain(..).collect();
            for (data_type, flavor, id) in bound {
                if let Some(entry) = hub.subscriptions.remove_id(&data_type, flavor.as_deref(), id).await
                {
                    entry.abort(reason);
                }
            }
        }
    }
}

/// Read envelopes until EOF, corruption, or cancellation; classify each by
/// its type tag. Any terminal condition shuts the connection down.
async fn receive_loop(conn: Arc<PeerConnection>, mut frames: FramedRead<OwnedReadHalf, EnvelopeCodec>) {
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            frame = frames.next() => {
                let reason = match frame {
                    Some(Ok(envelope)) => match dispatch(&conn, envelope).await {
                        Ok(()) => continue,
                        Err(reason) => reason,
                    },
                    Some(Err(e)) => format!("Bad envelope from {}: {e}", conn.peer_addr()),
                    None => "Remote server disconnected.".to_owned(),
                };
                conn.shutdown(&reason).await;
                break;
            }
        }
    }
}

async fn dispatch(conn: &Arc<PeerConnection>, envelope: Envelope) -> Result<(), String> {
    let Some(hub) = conn.hub.upgrade() else {
        return Err("hub has shut down".into());
    };
    match envelope.data_type.as_str() {
        SUBSCRIBER_TYPE => {
            let control: SubscribeControl = envelope
                .decode_payload()
                .map_err(|e| format!("bad subscription control: {e}"))?;
            if control.subscribe {
                let entry = SubscriberEntry::remote(
                    control.data_type,
                    control.flavor,
                    control.filter.map(Filter::Spec),
                    Arc::downgrade(conn),
                );
                conn.installed.lock().unwrap().push(entry.key());
                tracing::debug!(peer = %conn.peer_addr(), sub = %entry.data_type, "installing remote subscriber");
                hub.subscriptions.insert(entry).await;
            } else {
                match hub
                    .subscriptions
                    .remove_remote_matching(&control.data_type, control.flavor.as_deref(), conn)
                    .await
                {
                    Some(entry) => {
                        conn.installed.lock().unwrap().retain(|(_, _, id)| *id != entry.id);
                    }
                    None => tracing::debug!(
                        peer = %conn.peer_addr(),
                        data_type = %control.data_type,
                        "cancel for a subscription that is not installed"
                    ),
                }
            }
            Ok(())
        }
        CALL_TYPE => {
            let request: CallRequest = envelope
                .decode_payload()
                .map_err(|e| format!("bad call request: {e}"))?;
            // Long-running service methods must not stall the receive loop.
            let conn = conn.clone();
            tokio::spawn(async move {
                let Some(hub) = conn.hub.upgrade() else { return };
                let serial = request.serial;
                let outcome = hub.invoke(request).await;
                let response = CallResponse { serial, outcome };
                let envelope = match Envelope::response(&response) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::error!(serial, error = %e, "response not encodable");
                        return;
                    }
                };
                if let Err(e) = conn.transmit(envelope).await {
                    tracing::warn!(
                        peer = %conn.peer_addr(),
                        serial,
                        error = %e,
                        "problem sending call response back to caller"
                    );
                }
            });
            Ok(())
        }
        RESPONSE_TYPE => {
            let response: CallResponse = envelope
                .decode_payload()
                .map_err(|e| format!("bad call response: {e}"))?;
            conn.handle_response(response);
            Ok(())
        }
        _ => {
            // Application payload: hand to the local fan-out.
            hub.publish_envelope(envelope).await;
            Ok(())
        }
    }
}
