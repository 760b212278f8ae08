//! Source adapter runtime
//!
//! An adapter connects to one external source (chat, issues, code
//! review) and emits normalized raw-event drafts. The supervisor owns
//! the long-lived task per adapter: it drives the connection state
//! machine, reconnects with bounded backoff, drops self-authored
//! events, and forwards everything else into the ingestion channel.
//! Source-specific wire handling lives behind the trait; the channel
//! adapter here is the in-process reference implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event_log::NewRawEvent;
use crate::types::AdapterError;

/// Connection state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A long-lived connection to one external event source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source tag stamped on emitted events ("slack", "jira", ...).
    fn source(&self) -> &str;

    async fn connect(&self) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// Can the source be reached right now?
    async fn health_check(&self) -> Result<bool, AdapterError>;

    /// Wait for the next batch of observations, already converted to
    /// the raw-event shape without enrichment.
    async fn poll(&self) -> Result<Vec<NewRawEvent>, AdapterError>;
}

/// Reconnect backoff for the supervisor loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }
}

/// Drives one adapter and forwards its events to the ingestion channel.
pub struct AdapterSupervisor {
    adapter: Arc<dyn SourceAdapter>,
    output: mpsc::Sender<NewRawEvent>,
    /// Identity of the service's own bot account; events it authored
    /// are dropped to avoid feedback loops.
    self_identity: Option<String>,
    reconnect: ReconnectPolicy,
    state: Arc<RwLock<AdapterState>>,
}

/// Handle for a running supervisor.
pub struct AdapterHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<RwLock<AdapterState>>,
}

impl AdapterHandle {
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl AdapterSupervisor {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        output: mpsc::Sender<NewRawEvent>,
        self_identity: Option<String>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            adapter,
            output,
            self_identity,
            reconnect,
            state: Arc::new(RwLock::new(AdapterState::Disconnected)),
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<AdapterState>> {
        self.state.clone()
    }

    fn is_self_authored(&self, event: &NewRawEvent) -> bool {
        let Some(ref own) = self.self_identity else {
            return false;
        };
        event
            .payload
            .get("user")
            .and_then(|v| v.as_str())
            .is_some_and(|user| user == own)
    }

    pub fn spawn(self) -> AdapterHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = self.state.clone();
        let source = self.adapter.source().to_string();

        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            tracing::info!(source = %source, "adapter supervisor started");

            'outer: loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                *self.state.write() = AdapterState::Connecting;
                match self.adapter.connect().await {
                    Ok(()) => {
                        *self.state.write() = AdapterState::Connected;
                        failures = 0;
                        tracing::info!(source = %source, "adapter connected");
                    }
                    Err(e) => {
                        *self.state.write() = AdapterState::Error;
                        failures += 1;
                        let delay = self.reconnect.delay_for(failures);
                        tracing::warn!(
                            source = %source,
                            error = %e,
                            failures,
                            delay = ?delay,
                            "adapter connect failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = shutdown_rx.changed() => continue,
                        }
                    }
                }

                // Poll until the connection breaks or shutdown arrives.
                loop {
                    if *shutdown_rx.borrow() {
                        break 'outer;
                    }
                    let events = tokio::select! {
                        result = self.adapter.poll() => result,
                        _ = shutdown_rx.changed() => continue,
                    };
                    match events {
                        Ok(events) => {
                            for event in events {
                                if self.is_self_authored(&event) {
                                    tracing::debug!(source = %source, "dropping self-authored event");
                                    continue;
                                }
                                if self.output.send(event).await.is_err() {
                                    tracing::warn!(source = %source, "ingestion channel closed");
                                    break 'outer;
                                }
                            }
                        }
                        Err(e) => {
                            *self.state.write() = AdapterState::Error;
                            failures += 1;
                            tracing::warn!(source = %source, error = %e, "adapter poll failed");
                            let _ = self.adapter.disconnect().await;
                            let delay = self.reconnect.delay_for(failures);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                            break; // back to the connect loop
                        }
                    }
                }
            }

            let _ = self.adapter.disconnect().await;
            *self.state.write() = AdapterState::Disconnected;
            tracing::info!(source = %source, "adapter supervisor stopped");
        });

        AdapterHandle {
            shutdown_tx,
            task,
            state,
        }
    }
}

/// In-process adapter fed through an mpsc channel. The reference
/// implementation for tests and replay ingestion.
pub struct ChannelAdapter {
    source: String,
    receiver: tokio::sync::Mutex<mpsc::Receiver<NewRawEvent>>,
    connected: RwLock<bool>,
}

impl ChannelAdapter {
    /// Returns the adapter and the sender used to feed it.
    pub fn new(source: impl Into<String>, buffer: usize) -> (Self, mpsc::Sender<NewRawEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                source: source.into(),
                receiver: tokio::sync::Mutex::new(rx),
                connected: RwLock::new(false),
            },
            tx,
        )
    }
}

#[async_trait]
impl SourceAdapter for ChannelAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        *self.connected.write() = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        *self.connected.write() = false;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, AdapterError> {
        Ok(*self.connected.read())
    }

    async fn poll(&self) -> Result<Vec<NewRawEvent>, AdapterError> {
        if !*self.connected.read() {
            return Err(AdapterError::NotConnected);
        }
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(event) => Ok(vec![event]),
            None => Err(AdapterError::Source("event channel closed".to_string())),
        }
    }
}
