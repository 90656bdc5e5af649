//! WebSocket transport channel
//!
//! One channel carries one schema (`RendezvousMessage` towards the
//! rendezvous server, `Message` towards the peer). Each channel owns a
//! reader task and a writer task:
//!
//! ```text
//! caller --send/send_raw--> [unbounded FIFO] --> writer task --> sink
//! stream --> reader task (decrypt, decode, reassemble) --> [bounded queue] --> next()
//! ```
//!
//! The reader task is the only consumer of the socket and `next()` takes
//! `&mut self`, so there is exactly one consumer of inbound traffic.

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::protocol::codec::{decode, encode};
use crate::protocol::{Message, RendezvousMessage, WireMessage};

use super::encryption::{Direction, SessionCipher, SessionKey};
use super::error::NetworkError;
use super::reassembly::{PixelFrame, Reassembler};

/// Depth of the decoded inbound queue
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Channel to the remote peer (directly or through a relay)
pub type SessionChannel = TransportChannel<Message>;

/// Channel to the rendezvous server
pub type SignalingChannel = TransportChannel<RendezvousMessage>;

/// One fully decoded inbound item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<M> {
    Message(M),
    /// A pixel frame rebuilt from a header and its raw frames
    Frame(PixelFrame),
}

/// Encryption state of a channel
///
/// Set at most once; a channel never goes back to `Unestablished`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionKeyState {
    #[default]
    Unestablished,
    Secured(SessionKey),
    ExplicitlyInsecure,
}

impl SessionKeyState {
    pub fn is_secured(&self) -> bool {
        matches!(self, SessionKeyState::Secured(_))
    }
}

enum Outbound {
    /// Encoded schema message, encrypted by the writer once a key is installed
    Message(Vec<u8>),
    /// Raw frame, sent verbatim
    Raw(Vec<u8>),
    InstallKey(SessionCipher),
}

type InboundItem<M> = Result<Inbound<M>, NetworkError>;

/// Cloneable handle for queueing outbound traffic from other tasks
pub struct ChannelSender<M> {
    tx: mpsc::UnboundedSender<Outbound>,
    _schema: PhantomData<fn(M)>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _schema: PhantomData,
        }
    }
}

impl<M: WireMessage> ChannelSender<M> {
    pub fn send(&self, message: &M) -> Result<(), NetworkError> {
        self.push(Outbound::Message(encode(message)?))
    }

    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.push(Outbound::Raw(bytes))
    }

    fn push(&self, item: Outbound) -> Result<(), NetworkError> {
        self.tx.send(item).map_err(|_| NetworkError::ChannelClosed)
    }
}

/// Closes a channel from any task
#[derive(Clone)]
pub struct ChannelCloser {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ChannelCloser {
    /// Idempotent; wakes any pending `next()`
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Duplex, schema-typed WebSocket channel
pub struct TransportChannel<M: WireMessage> {
    uri: String,
    outbound: ChannelSender<M>,
    inbound_rx: mpsc::Receiver<InboundItem<M>>,
    inbound_cipher: Arc<Mutex<Option<SessionCipher>>>,
    key_state: SessionKeyState,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl<M: WireMessage> TransportChannel<M> {
    /// Connect to `uri` (`ws://` or `wss://`)
    pub async fn open(uri: &str) -> Result<Self, NetworkError> {
        debug!("Opening channel to {}", uri);
        let (ws_stream, _) = connect_async(uri).await?;
        info!("Channel open: {}", uri);
        Ok(Self::from_stream(uri, ws_stream))
    }

    /// Wrap an already established WebSocket
    pub fn from_stream<S>(uri: &str, ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inbound_cipher = Arc::new(Mutex::new(None));

        let decoder = InboundDecoder::new(inbound_cipher.clone());
        let reader_handle = tokio::spawn(read_loop(
            stream,
            decoder,
            inbound_tx,
            shutdown.subscribe(),
        ));
        let writer_handle = tokio::spawn(write_loop(sink, outbound_rx, shutdown.subscribe()));

        Self {
            uri: uri.to_string(),
            outbound: ChannelSender {
                tx: outbound_tx,
                _schema: PhantomData,
            },
            inbound_rx,
            inbound_cipher,
            key_state: SessionKeyState::Unestablished,
            shutdown: Arc::new(shutdown),
            shutdown_rx,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Queue a schema message; encrypted once a session key is installed
    pub fn send(&self, message: &M) -> Result<(), NetworkError> {
        self.outbound.send(message)
    }

    /// Queue a message of another schema on this channel
    ///
    /// Used for the relay request, which is a control-plane message sent
    /// on the channel that later carries the session.
    pub fn send_encoded<T: Serialize>(&self, message: &T) -> Result<(), NetworkError> {
        self.outbound.push(Outbound::Message(encode(message)?))
    }

    /// Queue bytes verbatim, without schema framing or encryption
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.outbound.send_raw(bytes)
    }

    pub fn sender(&self) -> ChannelSender<M> {
        self.outbound.clone()
    }

    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Wait for the next decoded item
    ///
    /// Resolves with `ChannelClosed` as soon as the channel is closed,
    /// including from another task through a [`ChannelCloser`].
    pub async fn next(&mut self) -> Result<Inbound<M>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ChannelClosed);
        }
        tokio::select! {
            item = self.inbound_rx.recv() => match item {
                Some(item) => item,
                None => Err(NetworkError::ChannelClosed),
            },
            _ = self.shutdown_rx.changed() => Err(NetworkError::ChannelClosed),
        }
    }

    /// Wait for the next schema message, failing on anything else
    pub async fn next_message(&mut self) -> Result<M, NetworkError> {
        match self.next().await? {
            Inbound::Message(message) => Ok(message),
            Inbound::Frame(_) => Err(NetworkError::ProtocolViolation(
                "pixel frame where a message was expected".into(),
            )),
        }
    }

    /// Send `announce` in plaintext, then encrypt everything after it
    /// with `key`
    ///
    /// The inbound key is installed before `announce` is queued, since
    /// the peer encrypts everything it sends once it has read `announce`.
    pub fn send_and_secure(&mut self, announce: &M, key: SessionKey) -> Result<(), NetworkError> {
        if self.key_state != SessionKeyState::Unestablished {
            return Err(NetworkError::KeyAlreadySet);
        }
        let announce = encode(announce)?;
        *self.inbound_cipher.lock() = Some(SessionCipher::new(&key, Direction::PeerToClient));
        self.outbound.push(Outbound::Message(announce))?;
        self.outbound.push(Outbound::InstallKey(SessionCipher::new(
            &key,
            Direction::ClientToPeer,
        )))?;
        self.key_state = SessionKeyState::Secured(key);
        debug!("Session key installed on {}", self.uri);
        Ok(())
    }

    /// Record that the session runs unencrypted
    pub fn mark_insecure(&mut self) -> Result<(), NetworkError> {
        if self.key_state != SessionKeyState::Unestablished {
            return Err(NetworkError::KeyAlreadySet);
        }
        self.key_state = SessionKeyState::ExplicitlyInsecure;
        warn!("Channel {} continues without encryption", self.uri);
        Ok(())
    }

    pub fn key_state(&self) -> &SessionKeyState {
        &self.key_state
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Close the channel; idempotent
    ///
    /// Queued outbound traffic that the writer has not sent yet is dropped.
    pub fn close(&mut self) {
        let was_closed = self.shutdown.send_replace(true);
        self.inbound_rx.close();
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        // The writer exits on its own so it can send a close frame
        self.writer_handle.take();
        if !was_closed {
            info!("Channel closed: {}", self.uri);
        }
    }
}

impl<M: WireMessage> Drop for TransportChannel<M> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turns raw inbound frames into decoded items
struct InboundDecoder<M> {
    reassembler: Reassembler,
    cipher: Arc<Mutex<Option<SessionCipher>>>,
    _schema: PhantomData<fn() -> M>,
}

impl<M: WireMessage> InboundDecoder<M> {
    fn new(cipher: Arc<Mutex<Option<SessionCipher>>>) -> Self {
        Self {
            reassembler: Reassembler::new(),
            cipher,
            _schema: PhantomData,
        }
    }

    fn on_binary(&mut self, bytes: Vec<u8>) -> Result<Option<Inbound<M>>, NetworkError> {
        if self.reassembler.is_active() {
            return Ok(self.reassembler.push(bytes)?.map(Inbound::Frame));
        }

        let plaintext = match self.cipher.lock().as_mut() {
            Some(cipher) => cipher.open_next(&bytes).map_err(|e| {
                NetworkError::ProtocolViolation(format!("undecryptable message: {}", e))
            })?,
            None => bytes,
        };
        let message: M = decode(&plaintext)
            .map_err(|e| NetworkError::ProtocolViolation(format!("undecodable message: {}", e)))?;

        if let Some(format) = message.pixel_header() {
            trace!("Pixel header received, expecting {} raw frames", format.frame_count());
            self.reassembler.begin(format)?;
            return Ok(None);
        }
        Ok(Some(Inbound::Message(message)))
    }
}

async fn read_loop<S, M>(
    mut stream: SplitStream<WebSocketStream<S>>,
    mut decoder: InboundDecoder<M>,
    tx: mpsc::Sender<InboundItem<M>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    M: WireMessage,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = stream.next() => frame,
        };

        let item = match frame {
            Some(Ok(WsMessage::Binary(bytes))) => {
                trace!("Received {} bytes", bytes.len());
                match decoder.on_binary(bytes) {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("Remote closed the channel");
                break;
            }
            Some(Ok(WsMessage::Text(_))) => {
                warn!("Ignoring text frame");
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => Err(NetworkError::from(e)),
        };

        let fatal = item.is_err();
        tokio::select! {
            _ = shutdown.changed() => break,
            sent = tx.send(item) => if sent.is_err() { break },
        }
        if fatal {
            break;
        }
    }
    debug!("Read loop finished");
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut cipher: Option<SessionCipher> = None;

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let bytes = match item {
            Outbound::Message(bytes) => match cipher.as_mut() {
                Some(cipher) => match cipher.seal_next(&bytes) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!("Failed to encrypt outbound message: {}", e);
                        break;
                    }
                },
                None => bytes,
            },
            Outbound::Raw(bytes) => bytes,
            Outbound::InstallKey(installed) => {
                cipher = Some(installed);
                continue;
            }
        };

        trace!("Sending {} bytes", bytes.len());
        if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
            debug!("Write failed: {}", e);
            break;
        }
    }

    let _ = sink.close().await;
    debug!("Write loop finished");
}
