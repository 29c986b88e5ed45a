//! The connection manager.
//!
//! One logical connection per contact, each driven by its own task: the
//! registry maps a peer address to the task's command channel, so one
//! peer's handshake or decryption cost never blocks another's traffic,
//! and the map lock is only ever held for insertion and removal.
//!
//! A peer task dials through the [`Connector`], runs the handshake under
//! the configured timeout, then loops over three inputs: consumer
//! commands, inbound frames, and the keep-alive tick. Transport failure
//! tears the session down (its keys are wiped on drop) and schedules a
//! reconnect with exponential backoff and jitter, bounded by a retry cap
//! after which the connection is reported failed. Disconnecting cancels
//! whatever the task is doing — dialing, handshaking, or waiting out a
//! backoff — and the dropped state wipes its key material.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{Command, Event, MessageId, MessageMeta};
use crate::identity::{normalize_address, Identity};
use crate::protocol::handshake::{Handshake, HandshakeFailReason};
use crate::protocol::message::{FileMetadata, MessageType, WireMessage};
use crate::session::Session;
use crate::transport::{Acceptor, Connector, FrameTransport};

/// Upper bound on the random jitter added to each reconnect delay.
const RECONNECT_JITTER_MS: u64 = 250;

enum PeerCommand {
    Send {
        kind: MessageType,
        body: Vec<u8>,
        reply: oneshot::Sender<Result<MessageId, CoreError>>,
    },
    Disconnect,
}

struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
    task: JoinHandle<()>,
    epoch: u64,
}

struct ManagerInner {
    identity: Arc<Identity>,
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    peers: Mutex<HashMap<String, PeerHandle>>,
    events: mpsc::UnboundedSender<Event>,
    epochs: AtomicU64,
}

impl ManagerInner {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn remove_peer(&self, address: &str, epoch: u64) {
        let mut peers = self.peers.lock().expect("peer registry lock poisoned");
        if peers.get(address).is_some_and(|h| h.epoch == epoch) {
            peers.remove(address);
        }
    }
}

/// Multiplexes concurrent peer sessions and drives reconnects.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager and the event stream its consumer reads.
    pub fn new(
        identity: Arc<Identity>,
        config: CoreConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            identity,
            config,
            connector,
            peers: Mutex::new(HashMap::new()),
            events,
            epochs: AtomicU64::new(0),
        });
        (Self { inner }, event_rx)
    }

    /// Our own network address.
    pub fn local_address(&self) -> &str {
        self.inner.identity.address()
    }

    /// Whether a connection to this peer exists or is being established.
    pub fn is_active(&self, address: &str) -> bool {
        match normalize_address(address) {
            Ok(address) => self
                .inner
                .peers
                .lock()
                .expect("peer registry lock poisoned")
                .contains_key(&address),
            Err(_) => false,
        }
    }

    /// Open a logical connection to a peer. Idempotent while a
    /// connection attempt or session for that peer exists.
    pub fn connect(&self, address: &str) -> Result<(), CoreError> {
        let address = normalize_address(address)?;
        if address == self.inner.identity.address() {
            return Err(CoreError::InvalidAddress(
                "cannot connect to own address".into(),
            ));
        }

        let mut peers = self
            .inner
            .peers
            .lock()
            .expect("peer registry lock poisoned");
        if peers.contains_key(&address) {
            return Ok(());
        }
        let handle = spawn_peer(&self.inner, address.clone(), None);
        peers.insert(address, handle);
        Ok(())
    }

    /// Tear down the connection to a peer, cancelling in-flight work and
    /// wiping its session keys before returning.
    pub async fn disconnect(&self, address: &str) -> Result<(), CoreError> {
        let address = normalize_address(address)?;

        let handle = {
            let mut peers = self
                .inner
                .peers
                .lock()
                .expect("peer registry lock poisoned");
            peers.remove(&address)
        }
        .ok_or_else(|| CoreError::NotConnected(address.clone()))?;

        if handle.commands.send(PeerCommand::Disconnect).is_err() {
            handle.task.abort();
        }
        let _ = handle.task.await;
        Ok(())
    }

    /// Send a text message. Returns the message id assigned by the
    /// session, or [`CoreError::NotConnected`].
    pub async fn send_text(&self, address: &str, text: &str) -> Result<MessageId, CoreError> {
        self.send(address, MessageType::Text, text.as_bytes().to_vec())
            .await
    }

    /// Send a file offer (metadata only; transfer is a separate concern).
    pub async fn send_file_metadata(
        &self,
        address: &str,
        metadata: FileMetadata,
    ) -> Result<MessageId, CoreError> {
        let body = serde_json::to_vec(&metadata)
            .map_err(|e| CoreError::SerializationFailed(e.to_string()))?;
        self.send(address, MessageType::File, body).await
    }

    /// Execute a consumer command.
    pub async fn dispatch(&self, command: Command) -> Result<(), CoreError> {
        match command {
            Command::Connect { address } => self.connect(&address),
            Command::Disconnect { address } => self.disconnect(&address).await,
            Command::SendText { address, text } => {
                self.send_text(&address, &text).await.map(|_| ())
            }
            Command::SendFileMetadata { address, metadata } => self
                .send_file_metadata(&address, metadata)
                .await
                .map(|_| ()),
        }
    }

    /// Accept inbound transports (the streams the daemon forwards from
    /// the local hidden-service port) until the acceptor fails.
    pub fn start_accept_loop(&self, mut acceptor: Box<dyn Acceptor>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(transport) => {
                        tokio::spawn(handle_inbound(inner.clone(), transport));
                    }
                    Err(e) => {
                        warn!(error = %e, "acceptor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Disconnect every peer.
    pub async fn shutdown(&self) {
        let handles: Vec<PeerHandle> = {
            let mut peers = self
                .inner
                .peers
                .lock()
                .expect("peer registry lock poisoned");
            peers.drain().map(|(_, h)| h).collect()
        };

        for handle in handles {
            if handle.commands.send(PeerCommand::Disconnect).is_err() {
                handle.task.abort();
            }
            let _ = handle.task.await;
        }
    }

    async fn send(
        &self,
        address: &str,
        kind: MessageType,
        body: Vec<u8>,
    ) -> Result<MessageId, CoreError> {
        let address = normalize_address(address)?;

        let commands = {
            let peers = self
                .inner
                .peers
                .lock()
                .expect("peer registry lock poisoned");
            peers.get(&address).map(|h| h.commands.clone())
        }
        .ok_or_else(|| CoreError::NotConnected(address.clone()))?;

        let (reply, response) = oneshot::channel();
        commands
            .send(PeerCommand::Send { kind, body, reply })
            .map_err(|_| CoreError::NotConnected(address.clone()))?;

        response
            .await
            .map_err(|_| CoreError::NotConnected(address))?
    }
}

fn spawn_peer(
    inner: &Arc<ManagerInner>,
    address: String,
    established: Option<(Box<dyn FrameTransport>, Session)>,
) -> PeerHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let epoch = inner.epochs.fetch_add(1, Ordering::Relaxed);
    let task = tokio::spawn(run_peer(
        inner.clone(),
        address,
        command_rx,
        epoch,
        established,
    ));
    PeerHandle {
        commands,
        task,
        epoch,
    }
}

/// Register an inbound, already-established session, replacing any
/// previous connection to the same peer.
fn register_established(
    inner: &Arc<ManagerInner>,
    address: String,
    transport: Box<dyn FrameTransport>,
    session: Session,
) {
    let handle = spawn_peer(inner, address.clone(), Some((transport, session)));
    let mut peers = inner.peers.lock().expect("peer registry lock poisoned");
    if let Some(old) = peers.insert(address, handle) {
        let _ = old.commands.send(PeerCommand::Disconnect);
    }
}

enum SessionEnd {
    /// We closed it. No event, no reconnect.
    LocalClose,
    /// The peer sent a disconnect notification.
    PeerClose,
    /// The transport died or the session became untrustworthy.
    TransportLost,
}

enum AttemptOutcome {
    Established(Box<dyn FrameTransport>, Session),
    Failed,
    Disconnected,
}

async fn run_peer(
    inner: Arc<ManagerInner>,
    address: String,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    epoch: u64,
    mut established: Option<(Box<dyn FrameTransport>, Session)>,
) {
    let mut attempts: u32 = 0;

    loop {
        let (transport, session) = match established.take() {
            Some(pair) => pair,
            None => match attempt_connection(&inner, &address, &mut commands).await {
                AttemptOutcome::Established(transport, session) => (transport, session),
                AttemptOutcome::Disconnected => break,
                AttemptOutcome::Failed => {
                    attempts += 1;
                    if attempts > inner.config.max_reconnect_attempts {
                        inner.emit(Event::ConnectionFailed {
                            address: address.clone(),
                        });
                        break;
                    }
                    if !wait_backoff(&inner, &address, attempts, &mut commands).await {
                        break;
                    }
                    continue;
                }
            },
        };

        inner.emit(Event::HandshakeCompleted {
            address: address.clone(),
        });
        attempts = 0;

        match session_loop(&inner, &address, transport, session, &mut commands).await {
            SessionEnd::LocalClose => break,
            SessionEnd::PeerClose => {
                inner.emit(Event::ConnectionLost {
                    address: address.clone(),
                });
                break;
            }
            SessionEnd::TransportLost => {
                inner.emit(Event::ConnectionLost {
                    address: address.clone(),
                });
                attempts += 1;
                if attempts > inner.config.max_reconnect_attempts {
                    inner.emit(Event::ConnectionFailed {
                        address: address.clone(),
                    });
                    break;
                }
                if !wait_backoff(&inner, &address, attempts, &mut commands).await {
                    break;
                }
            }
        }
    }

    inner.remove_peer(&address, epoch);
}

/// Dial the peer and run the handshake, draining consumer commands the
/// whole time so a disconnect cancels promptly.
async fn attempt_connection(
    inner: &Arc<ManagerInner>,
    address: &str,
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
) -> AttemptOutcome {
    let connect_fut = inner.connector.connect(address);
    tokio::pin!(connect_fut);

    let transport = loop {
        tokio::select! {
            result = &mut connect_fut => match result {
                Ok(transport) => break transport,
                Err(e) => {
                    debug!(peer = %address, error = %e, "dial failed");
                    return AttemptOutcome::Failed;
                }
            },
            cmd = commands.recv() => match cmd {
                None | Some(PeerCommand::Disconnect) => return AttemptOutcome::Disconnected,
                Some(PeerCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(CoreError::NotConnected(address.to_string())));
                }
            },
        }
    };

    let handshake_fut =
        tokio::time::timeout(inner.config.handshake_timeout(), initiate_handshake(inner, address, transport));
    tokio::pin!(handshake_fut);

    loop {
        tokio::select! {
            result = &mut handshake_fut => match result {
                Err(_) => {
                    inner.emit(Event::HandshakeFailed {
                        address: address.to_string(),
                        reason: HandshakeFailReason::Timeout,
                    });
                    return AttemptOutcome::Failed;
                }
                Ok(Err(e)) => {
                    debug!(peer = %address, error = %e, "handshake failed");
                    inner.emit(Event::HandshakeFailed {
                        address: address.to_string(),
                        reason: HandshakeFailReason::from_error(&e),
                    });
                    return AttemptOutcome::Failed;
                }
                Ok(Ok((transport, session))) => {
                    return AttemptOutcome::Established(transport, session);
                }
            },
            cmd = commands.recv() => match cmd {
                None | Some(PeerCommand::Disconnect) => return AttemptOutcome::Disconnected,
                Some(PeerCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(CoreError::NotConnected(address.to_string())));
                }
            },
        }
    }
}

/// The initiator side of the key exchange.
async fn initiate_handshake(
    inner: &Arc<ManagerInner>,
    address: &str,
    mut transport: Box<dyn FrameTransport>,
) -> Result<(Box<dyn FrameTransport>, Session), CoreError> {
    let mut handshake = Handshake::new(inner.identity.clone(), Some(address.to_string()));

    let payload = handshake.initiate()?;
    let frame = WireMessage::handshake(inner.identity.address(), &payload)?;
    transport.send(&frame).await?;

    let reply = transport.receive().await?;
    let reply_payload = reply.handshake_payload()?;
    handshake.receive_peer_key(&reply_payload)?;

    let session = handshake.into_session()?;
    Ok((transport, session))
}

/// The responder side of the key exchange, for an accepted transport.
async fn respond_handshake(
    inner: &Arc<ManagerInner>,
    mut transport: Box<dyn FrameTransport>,
) -> Result<(String, Box<dyn FrameTransport>, Session), CoreError> {
    let first = transport.receive().await?;
    let payload = first.handshake_payload()?;

    let mut handshake = Handshake::new(inner.identity.clone(), None);
    let reply = handshake.receive_peer_key(&payload)?.ok_or_else(|| {
        CoreError::HandshakeMalformed("responder produced no key exchange reply".into())
    })?;

    // The envelope's sender must be the address the identity key commits to.
    let claimed = normalize_address(&first.sender)?;
    let authenticated = handshake
        .peer_address()
        .map(str::to_string)
        .ok_or_else(|| CoreError::HandshakeMalformed("peer not authenticated".into()))?;
    if claimed != authenticated {
        return Err(CoreError::HandshakeMalformed(format!(
            "sender field {} does not match identity address {}",
            claimed, authenticated
        )));
    }

    let frame = WireMessage::handshake(inner.identity.address(), &reply)?;
    transport.send(&frame).await?;

    let session = handshake.into_session()?;
    Ok((authenticated, transport, session))
}

async fn handle_inbound(inner: Arc<ManagerInner>, transport: Box<dyn FrameTransport>) {
    let label = transport.peer_addr();
    match tokio::time::timeout(
        inner.config.handshake_timeout(),
        respond_handshake(&inner, transport),
    )
    .await
    {
        Err(_) => {
            debug!(transport = %label, "inbound handshake timed out");
        }
        Ok(Err(e)) => {
            debug!(transport = %label, error = %e, "inbound handshake rejected");
        }
        Ok(Ok((address, transport, session))) => {
            info!(peer = %address, "inbound session established");
            register_established(&inner, address, transport, session);
        }
    }
}

/// Drive one established session until it ends.
async fn session_loop(
    inner: &Arc<ManagerInner>,
    address: &str,
    mut transport: Box<dyn FrameTransport>,
    mut session: Session,
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
) -> SessionEnd {
    let mut auth_failures: u32 = 0;
    let period = inner.config.keepalive_interval();
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(PeerCommand::Disconnect) => {
                    // Best-effort notification; the session dies either way.
                    if let Ok(frame) = session.seal_outbound(MessageType::Disconnect, b"") {
                        let _ = transport.send(&frame).await;
                    }
                    let _ = transport.close().await;
                    return SessionEnd::LocalClose;
                }
                Some(PeerCommand::Send { kind, body, reply }) => {
                    match session.seal_outbound(kind, &body) {
                        Ok(frame) => {
                            let id = frame.id.clone();
                            if let Err(e) = transport.send(&frame).await {
                                debug!(peer = %address, error = %e, "send failed, dropping transport");
                                let _ = reply.send(Err(CoreError::NotConnected(address.to_string())));
                                return SessionEnd::TransportLost;
                            }
                            let _ = reply.send(Ok(id));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            },

            frame = transport.receive() => match frame {
                Err(e) => {
                    debug!(peer = %address, error = %e, "transport read failed");
                    return SessionEnd::TransportLost;
                }
                Ok(wire) => match session.open_inbound(&wire) {
                    Ok(plaintext) => {
                        auth_failures = 0;
                        match wire.kind {
                            MessageType::Keepalive => {}
                            MessageType::Disconnect => {
                                let _ = transport.close().await;
                                return SessionEnd::PeerClose;
                            }
                            _ => {
                                inner.emit(Event::MessageReceived {
                                    address: address.to_string(),
                                    plaintext,
                                    meta: MessageMeta {
                                        id: wire.id,
                                        kind: wire.kind,
                                        timestamp: wire.timestamp,
                                        sequence: wire.sequence,
                                    },
                                });
                            }
                        }
                    }
                    Err(CoreError::ReplayRejected { .. }) => {
                        // Already logged by the session; invisible to the consumer.
                    }
                    Err(CoreError::AuthFailure) => {
                        auth_failures += 1;
                        warn!(
                            peer = %address,
                            consecutive = auth_failures,
                            "dropping unauthenticated frame"
                        );
                        if auth_failures >= inner.config.auth_failure_threshold {
                            warn!(peer = %address, "authentication failure threshold hit, forcing reconnect");
                            return SessionEnd::TransportLost;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %address, error = %e, "dropping frame");
                    }
                },
            },

            _ = keepalive.tick() => {
                if let Ok(frame) = session.seal_outbound(MessageType::Keepalive, b"") {
                    if let Err(e) = transport.send(&frame).await {
                        debug!(peer = %address, error = %e, "keep-alive failed");
                        return SessionEnd::TransportLost;
                    }
                }
            }
        }
    }
}

/// Sleep out a reconnect delay, still answering commands. Returns `false`
/// when the peer was disconnected while waiting.
async fn wait_backoff(
    inner: &Arc<ManagerInner>,
    address: &str,
    attempt: u32,
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
) -> bool {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS));
    let delay = inner.config.reconnect_delay(attempt) + jitter;
    info!(peer = %address, attempt, ?delay, "scheduling reconnect");

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None | Some(PeerCommand::Disconnect) => return false,
                Some(PeerCommand::Send { reply, .. }) => {
                    let _ = reply.send(Err(CoreError::NotConnected(address.to_string())));
                }
            },
        }
    }
}
