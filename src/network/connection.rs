//! Connection to a remote desktop peer
//!
//! Drives one attempt from peer id to an active, negotiated session
//! channel and then carries the session traffic.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::{Message, RendezvousMessage, RequestRelay};

use super::error::NetworkError;
use super::identity::ConnectionContext;
use super::rendezvous::{RendezvousClient, RendezvousOutcome};
use super::secure::{negotiate, Negotiated};
use super::transport::{ChannelCloser, ChannelSender, Inbound, SessionChannel, SessionKeyState};

/// Connection state
///
/// ```text
/// [*] --> Idle
/// Idle --> Resolving: start()
/// Resolving --> Connecting: direct route
/// Resolving --> ConnectingRelay: relay assigned
/// Connecting --> Securing: channel open
/// ConnectingRelay --> Securing: channel open, relay requested
/// Securing --> Active: negotiated (secured or insecure)
/// any --> Closed: close() or a fatal error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Idle = 0,
    Resolving = 1,
    Connecting = 2,
    ConnectingRelay = 3,
    Securing = 4,
    Active = 5,
    Closed = 6,
}

impl ConnectionState {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Resolving,
            2 => Self::Connecting,
            3 => Self::ConnectingRelay,
            4 => Self::Securing,
            5 => Self::Active,
            _ => Self::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the connection attempt is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Resolving | Self::Connecting | Self::ConnectingRelay | Self::Securing
        )
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages handed to the channel by the outbound drain
    pub messages_sent: u64,
    /// Messages delivered to the caller
    pub messages_received: u64,
    /// Pixel frames delivered to the caller
    pub frames_received: u64,
    /// Delay last reported by the peer in a TestDelay probe (ms)
    pub last_peer_delay_ms: Option<u32>,
    /// Seconds since the connection became active
    pub uptime_seconds: u64,
    /// Whether the session key negotiation succeeded
    pub secured: bool,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    frames_received: AtomicU64,
}

/// Closes a connection from another task
#[derive(Clone)]
pub struct CloseHandle {
    state: Arc<AtomicU8>,
    shutdown: Arc<watch::Sender<bool>>,
    channel_closer: Arc<Mutex<Option<ChannelCloser>>>,
}

impl CloseHandle {
    /// Idempotent; any pending `start()` or `next()` resolves with an error
    pub fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        if let Some(closer) = self.channel_closer.lock().as_ref() {
            closer.close();
        }
    }
}

/// A connection to one remote peer
pub struct Connection {
    id: Uuid,
    ctx: ConnectionContext,
    config: ClientConfig,
    state: Arc<AtomicU8>,
    shutdown: Arc<watch::Sender<bool>>,
    peer_id: Option<String>,
    channel: Option<SessionChannel>,
    channel_closer: Arc<Mutex<Option<ChannelCloser>>>,
    negotiated: Option<Negotiated>,
    outbox: Arc<Mutex<VecDeque<Message>>>,
    drain_handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    last_peer_delay: Option<u32>,
    connected_at: Option<Instant>,
}

impl Connection {
    /// Create a new connection (not yet started)
    pub fn new(ctx: ConnectionContext, config: ClientConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            ctx,
            config,
            state: Arc::new(AtomicU8::new(ConnectionState::Idle as u8)),
            shutdown: Arc::new(shutdown),
            peer_id: None,
            channel: None,
            channel_closer: Arc::new(Mutex::new(None)),
            negotiated: None,
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            drain_handle: None,
            counters: Arc::new(Counters::default()),
            last_peer_delay: None,
            connected_at: None,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            debug!(
                "Connection {} state: {:?} -> {:?}",
                self.id,
                ConnectionState::from_u8(previous),
                state
            );
        }
    }

    /// Local id of this connection, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// How the session key negotiation ended, once it has run
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn key_state(&self) -> Option<&SessionKeyState> {
        self.channel.as_ref().map(|channel| channel.key_state())
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            channel_closer: self.channel_closer.clone(),
        }
    }

    /// Connect to `peer_id` and negotiate the session
    ///
    /// Valid from `Idle` only. Any error closes the connection.
    pub async fn start(&mut self, peer_id: &str) -> Result<Negotiated, NetworkError> {
        let state = self.state();
        if state != ConnectionState::Idle {
            return Err(NetworkError::InvalidState(state));
        }
        self.peer_id = Some(peer_id.to_string());

        match self.establish(peer_id).await {
            Ok(negotiated) => Ok(negotiated),
            Err(e) => {
                warn!("Connection {} to {} failed: {}", self.id, peer_id, e);
                self.close();
                Err(e)
            }
        }
    }

    async fn establish(&mut self, peer_id: &str) -> Result<Negotiated, NetworkError> {
        self.set_state(ConnectionState::Resolving);
        let rendezvous = RendezvousClient::from_config(&self.config)?;
        let outcome = self
            .until_closed(rendezvous.resolve(peer_id, self.config.conn_type))
            .await?;

        let mut channel = match &outcome {
            RendezvousOutcome::Direct { uri, .. } => {
                self.set_state(ConnectionState::Connecting);
                self.until_closed(SessionChannel::open(uri)).await?
            }
            RendezvousOutcome::Relay { uri, uuid, .. } => {
                self.set_state(ConnectionState::ConnectingRelay);
                let channel = self.until_closed(SessionChannel::open(uri)).await?;
                channel.send_encoded(&RendezvousMessage::RequestRelay(RequestRelay {
                    id: peer_id.to_string(),
                    uuid: uuid.clone(),
                    licence_key: self.config.licence_key.clone(),
                }))?;
                debug!("Relay requested for {} (uuid {})", peer_id, uuid);
                channel
            }
        };
        *self.channel_closer.lock() = Some(channel.closer());

        self.set_state(ConnectionState::Securing);
        let negotiated = self
            .until_closed(negotiate(
                &mut channel,
                &self.ctx,
                peer_id,
                outcome.peer_public_key(),
            ))
            .await?;

        // A close that raced the last step wins
        if *self.shutdown.borrow() {
            return Err(NetworkError::ChannelClosed);
        }

        self.start_drain_loop(channel.sender());
        self.channel = Some(channel);
        self.negotiated = Some(negotiated.clone());
        self.connected_at = Some(Instant::now());
        self.set_state(ConnectionState::Active);
        info!(
            "Connected to {} ({})",
            peer_id,
            if negotiated.is_secured() {
                "encrypted"
            } else {
                "unencrypted"
            }
        );
        Ok(negotiated)
    }

    /// Race `fut` against `close()`
    async fn until_closed<T>(
        &self,
        fut: impl Future<Output = Result<T, NetworkError>>,
    ) -> Result<T, NetworkError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(NetworkError::ChannelClosed);
        }
        tokio::select! {
            result = fut => result,
            _ = shutdown.changed() => Err(NetworkError::ChannelClosed),
        }
    }

    /// Start the loop that drains the outbound queue into the channel
    fn start_drain_loop(&mut self, sender: ChannelSender<Message>) {
        let outbox = self.outbox.clone();
        let counters = self.counters.clone();
        let period = self.config.send_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let batch: Vec<Message> = outbox.lock().drain(..).collect();
                for message in batch {
                    if let Err(e) = sender.send(&message) {
                        debug!("Outbound drain stopped: {}", e);
                        return;
                    }
                    counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        self.drain_handle = Some(handle);
    }

    /// Queue a message for the peer
    ///
    /// Valid in `Active` only. The queue is drained on a fixed tick and
    /// is unbounded: a producer outpacing the channel gets no backpressure
    /// signal.
    pub fn send(&self, message: Message) -> Result<(), NetworkError> {
        let state = self.state();
        if !state.is_active() {
            return Err(NetworkError::InvalidState(state));
        }
        trace!("Queueing {}", message.kind());
        self.outbox.lock().push_back(message);
        Ok(())
    }

    /// Messages queued but not yet handed to the channel
    pub fn pending(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Wait for the next inbound message or pixel frame
    ///
    /// Delay probes from the peer are answered here and not returned. A
    /// channel failure closes the connection.
    pub async fn next(&mut self) -> Result<Inbound<Message>, NetworkError> {
        loop {
            let state = self.state();
            if !state.is_active() {
                return Err(NetworkError::InvalidState(state));
            }
            let Some(channel) = self.channel.as_mut() else {
                return Err(NetworkError::InvalidState(state));
            };

            let mut shutdown = self.shutdown.subscribe();
            let item = tokio::select! {
                item = channel.next() => item,
                _ = shutdown.changed() => Err(NetworkError::ChannelClosed),
            };

            match item {
                Ok(Inbound::Message(Message::TestDelay(probe))) if !probe.from_client => {
                    self.last_peer_delay = Some(probe.last_delay);
                    trace!("Answering delay probe (last delay {} ms)", probe.last_delay);
                    if let Err(e) = channel.send(&Message::TestDelay(probe)) {
                        self.close();
                        return Err(e);
                    }
                }
                Ok(item) => {
                    let counter = match item {
                        Inbound::Message(_) => &self.counters.messages_received,
                        Inbound::Frame(_) => &self.counters.frames_received,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return Ok(item);
                }
                Err(e) => {
                    warn!("Connection {} lost: {}", self.id, e);
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            last_peer_delay_ms: self.last_peer_delay,
            uptime_seconds: self
                .connected_at
                .map(|start| start.elapsed().as_secs())
                .unwrap_or(0),
            secured: self
                .negotiated
                .as_ref()
                .map(Negotiated::is_secured)
                .unwrap_or(false),
        }
    }

    /// Close the connection; valid from any state and idempotent
    ///
    /// Messages still queued for the peer are discarded.
    pub fn close(&mut self) {
        let previous = self.state();
        self.set_state(ConnectionState::Closed);
        self.shutdown.send_replace(true);

        if let Some(handle) = self.drain_handle.take() {
            handle.abort();
        }
        self.outbox.lock().clear();
        if let Some(closer) = self.channel_closer.lock().take() {
            closer.close();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }

        if previous != ConnectionState::Closed {
            info!(
                "Connection {} to {} closed",
                self.id,
                self.peer_id.as_deref().unwrap_or("<none>")
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
