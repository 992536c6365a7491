use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shared::{
    error::ProtocolError,
    protocol::{decode_frame, encode_envelope, InboundEvent, OutboundEnvelope},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backoff::ReconnectPolicy,
    store::ChatStore,
    transport::{Connector, TransportCommand, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    Terminated,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("not connected to the chat server")]
    NotConnected,
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

struct ConnectionInner {
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    session_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    endpoint: Url,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    store: ChatStore,
    inner: Mutex<ConnectionInner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: Url,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
        store: ChatStore,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            endpoint,
            policy,
            connector,
            store,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                attempts: 0,
                generation: 0,
                outbound: None,
                session_task: None,
                reconnect_timer: None,
            }),
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// No-op while a socket is live or opening; otherwise opens now with a
    /// fresh retry budget.
    pub fn connect(self: &Arc<Self>) {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!(state = ?inner.state, "connect ignored, socket already active");
            return;
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.attempts = 0;
        self.begin_attempt(&mut inner);
    }

    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(TransportCommand::Close);
        }
        if let Some(task) = inner.session_task.take() {
            task.abort();
        }
        inner.attempts = 0;
        if inner.state != ConnectionState::Disconnected {
            info!(url = %self.endpoint, "chat socket disconnected");
        }
        self.set_state(&mut inner, ConnectionState::Disconnected);
        self.store.set_connected(false);
    }

    pub fn send(&self, envelope: &OutboundEnvelope) -> Result<(), ConnectionError> {
        self.send_then(envelope, || ())
    }

    /// Queues the envelope, then runs `after` before the session applies any
    /// further inbound frame.
    pub fn send_then<R>(
        &self,
        envelope: &OutboundEnvelope,
        after: impl FnOnce() -> R,
    ) -> Result<R, ConnectionError> {
        let text = encode_envelope(envelope)?;
        let inner = self.lock();
        let outbound = match (&inner.state, &inner.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound,
            (state, _) => {
                warn!(
                    state = ?state,
                    conversation_id = %envelope.conversation_id,
                    "dropping send while not connected"
                );
                return Err(ConnectionError::NotConnected);
            }
        };
        outbound
            .send(TransportCommand::Text(text))
            .map_err(|_| ConnectionError::NotConnected)?;
        Ok(after())
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut ConnectionInner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn begin_attempt(self: &Arc<Self>, inner: &mut ConnectionInner) {
        inner.generation += 1;
        let generation = inner.generation;
        self.set_state(inner, ConnectionState::Connecting);
        info!(url = %self.endpoint, attempt = inner.attempts, "opening chat socket");

        if let Some(previous) = inner.session_task.take() {
            previous.abort();
        }
        let manager = Arc::clone(self);
        inner.session_task = Some(tokio::spawn(async move {
            manager.run_session(generation).await;
        }));
    }

    async fn run_session(self: Arc<Self>, generation: u64) {
        let link = match self.connector.open(&self.endpoint).await {
            Ok(link) => link,
            Err(err) => {
                warn!(url = %self.endpoint, error = %err, "chat socket failed to open");
                self.handle_closed(generation);
                return;
            }
        };

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                let _ = link.outbound.send(TransportCommand::Close);
                return;
            }
            inner.attempts = 0;
            inner.outbound = Some(link.outbound.clone());
            self.set_state(&mut inner, ConnectionState::Connected);
            self.store.set_connected(true);
        }
        info!(url = %self.endpoint, "chat socket connected");

        let mut inbound = link.inbound;
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(text) => {
                    if !self.apply_frame(generation, &text) {
                        return;
                    }
                }
                TransportEvent::Closed { reason } => {
                    info!(url = %self.endpoint, reason = ?reason, "chat socket closed");
                    break;
                }
            }
        }
        self.handle_closed(generation);
    }

    /// Frames are applied under the manager lock; returns false once this
    /// session has been superseded.
    fn apply_frame(&self, generation: u64, text: &str) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        match decode_frame(text) {
            Ok(event) => {
                if let InboundEvent::ServerError { message } = &event {
                    warn!(%message, "chat server reported an error");
                }
                self.store.apply_inbound(event);
            }
            Err(err) => warn!(error = %err, "dropping malformed chat frame"),
        }
        true
    }

    fn handle_closed(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        inner.session_task = None;
        self.store.set_connected(false);

        if !self.policy.allows_retry(inner.attempts) {
            warn!(
                url = %self.endpoint,
                attempts = inner.attempts,
                "giving up on chat socket after repeated failures"
            );
            self.set_state(&mut inner, ConnectionState::Terminated);
            return;
        }

        let delay = self.policy.delay_for(inner.attempts);
        inner.attempts += 1;
        info!(
            attempt = inner.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling chat socket reconnect"
        );
        self.set_state(&mut inner, ConnectionState::ReconnectScheduled);

        let manager = Arc::clone(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire_reconnect(generation);
        }));
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectionState::ReconnectScheduled {
            return;
        }
        inner.reconnect_timer = None;
        self.begin_attempt(&mut inner);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
