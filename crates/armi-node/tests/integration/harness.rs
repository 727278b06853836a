//! Test harness for in-process hub integration tests.
//!
//! Spins up real hubs on ephemeral localhost ports within one tokio
//! runtime, plus a collecting subscriber and poll-until-deadline helpers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use armi_node::protocol::Envelope;
use armi_node::{Delivery, Hub, HubConfig};

/// A hub accepting remote clients on an ephemeral localhost port.
pub struct TestHub {
    pub hub: Hub,
    pub addr: SocketAddr,
}

#[allow(dead_code)]
impl TestHub {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(HubConfig::default()).await
    }

    pub async fn start_with(config: HubConfig) -> anyhow::Result<Self> {
        let hub = Hub::new(config);
        let port = hub
            .accept_remote_clients(Some("127.0.0.1:0".parse()?), None)
            .await?;
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
        Ok(Self { hub, addr })
    }

    /// A hub that only originates calls and subscriptions; no acceptor.
    pub fn client() -> Hub {
        Hub::default()
    }

    /// A calling-side hub with a shortened call timeout.
    pub fn client_with_call_timeout(ms: u64) -> Hub {
        Hub::new(HubConfig {
            call_timeout_ms: ms,
            ..HubConfig::default()
        })
    }

    pub async fn shutdown(self) {
        self.hub.shutdown().await;
    }
}

/// Delivery sink that records everything for later assertions.
#[derive(Default)]
pub struct Collector {
    envelopes: Mutex<Vec<Envelope>>,
    aborts: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.envelopes.lock().unwrap().len()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().unwrap().clone()
    }

    /// Poll until at least `n` envelopes have arrived.
    pub async fn wait_count(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < n {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {} envelopes (have {})", n, self.count());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    /// Poll until the abort hook has fired, returning the reason.
    pub async fn wait_abort(&self, timeout: Duration) -> anyhow::Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(reason) = self.aborts.lock().unwrap().first().cloned() {
                return Ok(reason);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for abort");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl Delivery for Collector {
    fn deliver(&self, envelope: &Envelope) {
        self.envelopes.lock().unwrap().push(envelope.clone());
    }

    fn abort(&self, reason: &str) {
        self.aborts.lock().unwrap().push(reason.to_owned());
    }
}

/// Poll until the hub reports at least `n` live subscriptions. Remote
/// subscribe control messages install asynchronously on the publishing side.
#[allow(dead_code)]
pub async fn wait_subscriptions(hub: &Hub, n: usize, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let have = hub.subscription_descriptions().await.len();
        if have >= n {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {} subscriptions (have {})", n, have);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the hub's peer table holds exactly `n` connections.
#[allow(dead_code)]
pub async fn wait_peer_count(hub: &Hub, n: usize, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let have = hub.peer_count().await;
        if have == n {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for peer count {} (have {})", n, have);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
