//! The message queue engine: single point of mutation for the message
//! lifecycle and the only caller of a connection handle's send operations.
//!
//! Four queues carry a message from submission to its terminal callback:
//! waiting (FIFO, fed by [`Transport::add_message`]), in-flight (keyed by
//! correlation id, awaiting acknowledgement), pending-callback (retired,
//! awaiting exactly one callback invocation), and received (inbound traffic
//! awaiting dispatch). Send-side queues share one lock, the received queue
//! has its own, so inbound latency never waits on outbound throughput.
//! Network I/O is always awaited with no lock held.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::{
    config::{DeviceConfig, TransportConfig},
    connection::{
        ConnectionError, ConnectionFactory, ConnectionHandle, ConnectionListener,
        ConnectionStatus, Disposition, StatusCallback, StatusChange, StatusReason,
    },
    message::{InboundMessage, Message, MessageKind},
    packet::{
        CallbackPacket, CompletionStatus, CorrelationId, PacketCallback, TransportPacket,
        UserContext,
    },
    reconnect::ReconnectMonitor,
    retry::RetryPolicy,
};

/// Error surfaced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation is not valid in the transport's current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The underlying connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Handler for one kind of inbound message, returning how the message was
/// settled.
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) -> Disposition + Send + Sync>;

/// Snapshot of the engine's queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages waiting to be sent.
    pub waiting: usize,
    /// Messages sent and awaiting acknowledgement.
    pub in_flight: usize,
    /// Retired messages awaiting their callback invocation.
    pub pending_callbacks: usize,
    /// Inbound messages awaiting dispatch.
    pub received: usize,
}

/// Internal lifecycle, distinct from the user-visible [`ConnectionStatus`].
/// `Open` persists across transient loss/recovery cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Closed,
    Opening,
    Open,
}

/// The currently installed connection handle. Replaced wholesale on each
/// reconnect; the generation lets stale listener events be told apart from
/// live ones.
struct ConnectionInstance {
    handle: Arc<dyn ConnectionHandle>,
    generation: u64,
    lost: bool,
}

/// Per-identity state on a multiplexed connection. Mutated only under the
/// send-side lock.
#[derive(Debug)]
struct DeviceState {
    status: ConnectionStatus,
    last_error: Option<ConnectionError>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_error: None,
        }
    }
}

struct SendState {
    lifecycle: Lifecycle,
    status: ConnectionStatus,
    connection: Option<ConnectionInstance>,
    generation: u64,
    waiting: VecDeque<TransportPacket>,
    in_flight: FxHashMap<CorrelationId, TransportPacket>,
    callbacks: VecDeque<CallbackPacket>,
    devices: Vec<DeviceConfig>,
    device_states: FxHashMap<String, DeviceState>,
    status_callback: Option<StatusCallback>,
    last_error: Option<ConnectionError>,
    reconnect_attempts: u32,
    reconnect_started: Option<Instant>,
    retry_exhausted: bool,
}

impl SendState {
    /// Whether a listener event tagged with `connection_id` comes from the
    /// currently installed handle.
    fn is_current(&self, connection_id: &str) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|i| i.handle.id() == connection_id)
    }

    fn set_all_devices(&mut self, status: ConnectionStatus, error: Option<&ConnectionError>) {
        for state in self.device_states.values_mut() {
            state.status = status;
            state.last_error = error.cloned();
        }
    }
}

struct RecvState {
    received: VecDeque<InboundMessage>,
    handlers: FxHashMap<MessageKind, MessageHandler>,
}

pub(crate) struct TransportState {
    factory: Arc<dyn ConnectionFactory>,
    policy: Arc<dyn RetryPolicy>,
    pub(crate) config: TransportConfig,
    next_correlation: AtomicU64,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    /// Wait-handle the reconnection coordinator parks on. Signaled at most
    /// once per disconnection, on the connected-to-disconnected edge.
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
}

/// Shared reference to the engine state; the engine's own listener identity.
#[derive(Clone)]
pub(crate) struct TransportRef(pub(crate) Arc<TransportState>);

/// Client-side transport orchestration for one hub connection.
///
/// Accepts outbound messages, queues them, pumps them through a pluggable
/// protocol binding, tracks acknowledgement, and recovers from connection
/// loss without dropping in-flight work. Every submitted message receives
/// exactly one terminal callback, across reconnects and close.
///
/// May be cloned to obtain another handle to the same transport.
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: TransportRef,
}

impl Transport {
    /// Build a transport over the given protocol binding and retry policy.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        policy: Arc<dyn RetryPolicy>,
        config: TransportConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: TransportRef(Arc::new(TransportState {
                factory,
                policy,
                config,
                next_correlation: AtomicU64::new(0),
                send: Mutex::new(SendState {
                    lifecycle: Lifecycle::Closed,
                    status: ConnectionStatus::Disconnected,
                    connection: None,
                    generation: 0,
                    waiting: VecDeque::new(),
                    in_flight: FxHashMap::default(),
                    callbacks: VecDeque::new(),
                    devices: Vec::new(),
                    device_states: FxHashMap::default(),
                    status_callback: None,
                    last_error: None,
                    reconnect_attempts: 0,
                    reconnect_started: None,
                    retry_exhausted: false,
                }),
                recv: Mutex::new(RecvState {
                    received: VecDeque::new(),
                    handlers: FxHashMap::default(),
                }),
                reconnect: Notify::new(),
                shutdown,
            })),
        }
    }

    /// Open a connection for the given identity set: one config for a
    /// single-identity session, several for a multiplexed one.
    ///
    /// A no-op when already open; an error while another open is still in
    /// progress. On failure the transport remains closed.
    pub async fn open(&self, devices: Vec<DeviceConfig>) -> Result<(), TransportError> {
        if devices.is_empty() {
            return Err(TransportError::InvalidArgument(
                "at least one device config is required",
            ));
        }
        {
            let mut send = self.inner.send_state();
            match send.lifecycle {
                Lifecycle::Open => return Ok(()),
                Lifecycle::Opening => {
                    return Err(TransportError::IllegalState(
                        "another open is already in progress",
                    ))
                }
                Lifecycle::Closed => {
                    send.lifecycle = Lifecycle::Opening;
                    send.device_states = devices
                        .iter()
                        .map(|d| (d.device_id.clone(), DeviceState::new()))
                        .collect();
                    send.devices = devices;
                    send.reconnect_attempts = 0;
                    send.reconnect_started = None;
                    send.retry_exhausted = false;
                    send.last_error = None;
                }
            }
        }
        match self.inner.establish().await {
            Ok(()) => {
                self.inner.send_state().lifecycle = Lifecycle::Open;
                let _ = self.inner.0.shutdown.send(false);
                ReconnectMonitor::spawn(self.inner.clone());
                Ok(())
            }
            Err(e) => {
                let mut send = self.inner.send_state();
                send.lifecycle = Lifecycle::Closed;
                send.connection = None;
                send.devices.clear();
                send.device_states.clear();
                Err(e.into())
            }
        }
    }

    /// Submit a fire-and-forget message. The callback fires exactly once
    /// with the message's terminal status.
    ///
    /// Never blocks on the network; back-pressure is the caller's concern.
    pub fn add_message(
        &self,
        message: Message,
        callback: impl FnOnce(CompletionStatus, UserContext) + Send + 'static,
        context: UserContext,
    ) -> Result<(), TransportError> {
        self.inner
            .enqueue(message, PacketCallback::Event(Box::new(callback)), context)
    }

    /// Submit a request expecting a response. The callback fires exactly
    /// once; the response is `None` when the service acknowledged without a
    /// body.
    pub fn add_request(
        &self,
        message: Message,
        callback: impl FnOnce(CompletionStatus, Option<InboundMessage>, UserContext) + Send + 'static,
        context: UserContext,
    ) -> Result<(), TransportError> {
        self.inner
            .enqueue(message, PacketCallback::Response(Box::new(callback)), context)
    }

    /// Register the connection status callback. One callback per transport;
    /// registering again replaces it. Cleared on close.
    pub fn register_status_callback(&self, callback: StatusCallback) {
        self.inner.send_state().status_callback = Some(callback);
    }

    /// Register the handler for one kind of inbound message.
    pub fn register_message_handler(&self, kind: MessageKind, handler: MessageHandler) {
        self.inner.recv_state().handlers.insert(kind, handler);
    }

    /// Flush up to one batch of waiting messages to the wire.
    ///
    /// Normally invoked by the send driver; exposed so hosts can schedule
    /// the pump themselves.
    pub async fn send_queued_messages(&self) -> Result<(), TransportError> {
        self.inner.send_queued_messages().await
    }

    /// Drain the pending-callback queue, invoking each callback exactly
    /// once, synchronously, on the calling task.
    pub fn invoke_callbacks(&self) -> Result<(), TransportError> {
        self.inner.invoke_callbacks()
    }

    /// Dispatch at most one received message to its registered handler and
    /// settle it with the service.
    pub async fn handle_received_messages(&self) -> Result<(), TransportError> {
        self.inner.handle_received_messages().await
    }

    /// Retire all queued and in-flight messages as cancelled, fire their
    /// callbacks, and tear the connection down. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    /// Whether the waiting, in-flight, and pending-callback queues are all
    /// empty. The received queue is deliberately excluded: inbound traffic
    /// does not block shutdown readiness.
    pub fn is_empty(&self) -> bool {
        let send = self.inner.send_state();
        send.waiting.is_empty() && send.in_flight.is_empty() && send.callbacks.is_empty()
    }

    /// Snapshot the queue depths.
    pub fn stats(&self) -> TransportStats {
        let (waiting, in_flight, pending_callbacks) = {
            let send = self.inner.send_state();
            (
                send.waiting.len(),
                send.in_flight.len(),
                send.callbacks.len(),
            )
        };
        let received = self.inner.recv_state().received.len();
        TransportStats {
            waiting,
            in_flight,
            pending_callbacks,
            received,
        }
    }

    /// Current user-visible connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.send_state().status
    }

    /// Status of one device identity on a multiplexed connection.
    pub fn device_status(&self, device_id: &str) -> Option<ConnectionStatus> {
        self.inner
            .send_state()
            .device_states
            .get(device_id)
            .map(|d| d.status)
    }

    /// Most recent connection error observed by one device identity.
    pub fn device_last_error(&self, device_id: &str) -> Option<ConnectionError> {
        self.inner
            .send_state()
            .device_states
            .get(device_id)
            .and_then(|d| d.last_error.clone())
    }
}

impl TransportRef {
    fn send_state(&self) -> std::sync::MutexGuard<'_, SendState> {
        self.0.send.lock().unwrap()
    }

    fn recv_state(&self) -> std::sync::MutexGuard<'_, RecvState> {
        self.0.recv.lock().unwrap()
    }

    fn enqueue(
        &self,
        message: Message,
        callback: PacketCallback,
        context: UserContext,
    ) -> Result<(), TransportError> {
        let mut send = self.send_state();
        if send.lifecycle == Lifecycle::Closed {
            return Err(TransportError::IllegalState(
                "cannot add a message to a closed transport",
            ));
        }
        let device_id = match message.device_id() {
            Some(id) => {
                if !send.devices.iter().any(|d| d.device_id == id) {
                    return Err(TransportError::InvalidArgument(
                        "message addressed to an unknown device identity",
                    ));
                }
                id.to_owned()
            }
            None => send
                .devices
                .first()
                .map(|d| d.device_id.clone())
                .unwrap_or_default(),
        };
        let correlation = CorrelationId(self.0.next_correlation.fetch_add(1, Ordering::Relaxed));
        send.waiting.push_back(TransportPacket::new(
            message,
            callback,
            context,
            correlation,
            device_id,
        ));
        trace!(correlation = %correlation, queued = send.waiting.len(), "message queued");
        Ok(())
    }

    async fn send_queued_messages(&self) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut notices = Vec::new();
        let (batch, handle, generation) = {
            let mut send = self.send_state();
            if send.lifecycle == Lifecycle::Closed {
                return Err(TransportError::IllegalState(
                    "cannot send on a closed transport",
                ));
            }
            if send.status != ConnectionStatus::Connected {
                return Ok(());
            }
            let Some(instance) = &send.connection else {
                return Ok(());
            };
            let handle = instance.handle.clone();
            let generation = instance.generation;
            let bound = self.0.config.send_batch_bound();
            let mut batch = Vec::new();
            while batch.len() < bound {
                let Some(packet) = send.waiting.pop_front() else {
                    break;
                };
                if packet.message().is_expired(now) {
                    trace!(correlation = %packet.correlation(), "retiring expired message");
                    send.callbacks
                        .push_back(packet.complete(CompletionStatus::MessageExpired));
                    continue;
                }
                let unusable = send
                    .devices
                    .iter()
                    .find(|d| d.device_id == packet.device_id())
                    .map(|d| d.credential.is_unusable(now))
                    .unwrap_or(false);
                if unusable {
                    // Terminal by design: an unrenewable credential is not a
                    // transient network condition.
                    let device_id = packet.device_id().to_owned();
                    warn!(device = %device_id, "credential expired without renewal; dropping message");
                    send.callbacks
                        .push_back(packet.complete(CompletionStatus::Unauthorized));
                    if let Some(state) = send.device_states.get_mut(&device_id) {
                        state.status = ConnectionStatus::Disconnected;
                    }
                    notices.push(StatusChange {
                        status: ConnectionStatus::Disconnected,
                        reason: StatusReason::ExpiredSasToken,
                        cause: None,
                        device_id: Some(device_id),
                    });
                    continue;
                }
                batch.push(packet);
            }
            (batch, handle, generation)
        };
        for change in notices {
            self.emit_status(change);
        }

        for mut packet in batch {
            packet.note_attempt();
            let correlation = packet.correlation();
            // Reserve the in-flight slot before the network call so an ack
            // racing the send finds its packet, and so close() can cancel a
            // message whose send is still outstanding.
            let slotted = {
                let mut send = self.send_state();
                if send.lifecycle == Lifecycle::Closed {
                    Err(packet)
                } else if send
                    .connection
                    .as_ref()
                    .is_some_and(|i| i.generation == generation)
                {
                    let message = packet.message().clone();
                    send.in_flight.insert(correlation, packet);
                    Ok(message)
                } else {
                    // The handle was replaced mid-batch; line the packet up
                    // again for the replacement.
                    send.waiting.push_back(packet);
                    continue;
                }
            };
            let message = match slotted {
                Ok(message) => message,
                Err(packet) => {
                    packet
                        .complete(CompletionStatus::MessageCancelledOnClose)
                        .invoke();
                    continue;
                }
            };
            // The send itself happens with no lock held. The reserved slot
            // may be gone by the time it returns: an early ack, a loss
            // event, or close() settles the packet first, and each branch
            // below must then leave it alone.
            match handle.send(&message, correlation).await {
                Ok(code) if (200..300).contains(&code) => {
                    if let Some(packet) = self.send_state().in_flight.get_mut(&correlation) {
                        packet.set_status_code(code);
                    }
                }
                Ok(code) => {
                    debug!(correlation = %correlation, code, "service rejected send");
                    let mut send = self.send_state();
                    if let Some(packet) = send.in_flight.remove(&correlation) {
                        send.callbacks
                            .push_back(packet.complete(CompletionStatus::from_code(code)));
                    }
                }
                Err(e) => {
                    let mut send = self.send_state();
                    if let Some(packet) = send.in_flight.remove(&correlation) {
                        debug!(
                            correlation = %correlation,
                            attempts = packet.attempts(),
                            age = ?packet.age(),
                            "send failed, requeueing: {e}"
                        );
                        send.last_error = Some(e);
                        send.waiting.push_back(packet);
                    }
                }
            }
        }
        Ok(())
    }

    fn invoke_callbacks(&self) -> Result<(), TransportError> {
        loop {
            let packet = {
                let mut send = self.send_state();
                if send.lifecycle == Lifecycle::Closed {
                    return Err(TransportError::IllegalState(
                        "cannot invoke callbacks on a closed transport",
                    ));
                }
                send.callbacks.pop_front()
            };
            match packet {
                // Invoked outside the lock: a callback may re-enter the
                // transport.
                Some(packet) => packet.invoke(),
                None => return Ok(()),
            }
        }
    }

    async fn handle_received_messages(&self) -> Result<(), TransportError> {
        if self.send_state().lifecycle == Lifecycle::Closed {
            return Err(TransportError::IllegalState(
                "cannot handle received messages on a closed transport",
            ));
        }
        let (message, handler) = {
            let mut recv = self.recv_state();
            let Some(message) = recv.received.pop_front() else {
                return Ok(());
            };
            let handler = recv.handlers.get(&message.kind()).cloned();
            (message, handler)
        };
        let disposition = match handler {
            Some(handler) => handler(&message),
            None => {
                debug!(kind = ?message.kind(), "no handler registered, abandoning message");
                Disposition::Abandon
            }
        };
        let handle = self
            .send_state()
            .connection
            .as_ref()
            .map(|i| i.handle.clone());
        let settled = match handle {
            Some(handle) => match handle.send_ack(&message, disposition).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    debug!("failed to settle received message: {e}");
                    false
                }
            },
            None => false,
        };
        if !settled {
            // Retried on the next tick rather than dropped.
            self.recv_state().received.push_front(message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (pending, handle, callback) = {
            let mut send = self.send_state();
            if send.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            send.lifecycle = Lifecycle::Closed;
            send.status = ConnectionStatus::Disconnected;
            send.set_all_devices(ConnectionStatus::Disconnected, None);

            let mut pending: Vec<CallbackPacket> = send.callbacks.drain(..).collect();
            let mut cancelled: Vec<TransportPacket> = send.waiting.drain(..).collect();
            let mut in_flight: Vec<TransportPacket> =
                send.in_flight.drain().map(|(_, p)| p).collect();
            in_flight.sort_by_key(|p| p.correlation());
            cancelled.extend(in_flight);
            pending.extend(
                cancelled
                    .into_iter()
                    .map(|p| p.complete(CompletionStatus::MessageCancelledOnClose)),
            );

            let handle = send.connection.take().map(|i| i.handle);
            let callback = send.status_callback.take();
            (pending, handle, callback)
        };
        let _ = self.0.shutdown.send(true);

        debug!(cancelled = pending.len(), "closing transport");
        for packet in pending {
            packet.invoke();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                debug!("error closing connection handle: {e}");
            }
        }
        if let Some(callback) = callback {
            callback(&StatusChange {
                status: ConnectionStatus::Disconnected,
                reason: StatusReason::ClientClose,
                cause: None,
                device_id: None,
            });
        }
        Ok(())
    }

    /// Construct, wire up, and open a fresh connection handle, replacing any
    /// previous one. Used both by the initial open and by the reconnection
    /// coordinator.
    pub(crate) async fn establish(&self) -> Result<(), ConnectionError> {
        let listener: Arc<dyn ConnectionListener> = Arc::new(self.clone());
        let (handle, generation) = {
            let mut send = self.send_state();
            let handle = self.0.factory.connect(&send.devices);
            handle.set_listener(listener)?;
            send.generation += 1;
            let generation = send.generation;
            send.connection = Some(ConnectionInstance {
                handle: handle.clone(),
                generation,
                lost: false,
            });
            (handle, generation)
        };

        if let Err(e) = handle.open().await {
            let mut send = self.send_state();
            if send
                .connection
                .as_ref()
                .is_some_and(|i| i.generation == generation)
            {
                send.connection = None;
            }
            send.last_error = Some(e.clone());
            return Err(e);
        }

        let change = {
            let mut send = self.send_state();
            match &send.connection {
                Some(instance) if instance.generation == generation && !instance.lost => {
                    let already_connected = send.status == ConnectionStatus::Connected;
                    send.status = ConnectionStatus::Connected;
                    send.set_all_devices(ConnectionStatus::Connected, None);
                    send.reconnect_attempts = 0;
                    send.reconnect_started = None;
                    send.retry_exhausted = false;
                    send.last_error = None;
                    (!already_connected).then_some(StatusChange {
                        status: ConnectionStatus::Connected,
                        reason: StatusReason::ConnectionOk,
                        cause: None,
                        device_id: None,
                    })
                }
                _ => {
                    let cause = send.last_error.clone().unwrap_or_else(|| {
                        ConnectionError::Lost("connection dropped during open".into())
                    });
                    return Err(cause);
                }
            }
        };
        if let Some(change) = change {
            self.emit_status(change);
        }
        Ok(())
    }

    /// Attempt count and most recent failure for the next retry decision,
    /// or `None` when no reconnect is needed.
    pub(crate) fn reconnect_context(&self) -> Option<(u32, Option<ConnectionError>)> {
        let send = self.send_state();
        if send.lifecycle != Lifecycle::Open
            || send.status == ConnectionStatus::Connected
            || send.retry_exhausted
        {
            return None;
        }
        Some((send.reconnect_attempts, send.last_error.clone()))
    }

    /// Record that a reconnect attempt has been scheduled, flipping the
    /// user-visible status to retrying on the first one.
    pub(crate) fn note_attempt_scheduled(&self) {
        let change = {
            let mut send = self.send_state();
            if send.lifecycle == Lifecycle::Closed {
                return;
            }
            send.reconnect_attempts += 1;
            if send.reconnect_started.is_none() {
                send.reconnect_started = Some(Instant::now());
            }
            if send.status == ConnectionStatus::DisconnectedRetrying {
                None
            } else {
                send.status = ConnectionStatus::DisconnectedRetrying;
                let cause = send.last_error.clone();
                send.set_all_devices(ConnectionStatus::DisconnectedRetrying, cause.as_ref());
                Some(StatusChange {
                    status: ConnectionStatus::DisconnectedRetrying,
                    reason: classify_loss(cause.as_ref()),
                    cause,
                    device_id: None,
                })
            }
        };
        if let Some(change) = change {
            self.emit_status(change);
        }
    }

    /// The retry policy gave up: the connection is terminally down until the
    /// transport is closed and reopened.
    pub(crate) fn reconnect_exhausted(&self) {
        let change = {
            let mut send = self.send_state();
            if send.lifecycle == Lifecycle::Closed {
                return;
            }
            send.retry_exhausted = true;
            send.status = ConnectionStatus::Disconnected;
            let cause = send.last_error.clone();
            send.set_all_devices(ConnectionStatus::Disconnected, cause.as_ref());
            warn!(
                attempts = send.reconnect_attempts,
                elapsed = ?send.reconnect_started.map(|t| t.elapsed()),
                "retry policy exhausted, giving up on reconnection"
            );
            StatusChange {
                status: ConnectionStatus::Disconnected,
                reason: StatusReason::RetryExpired,
                cause,
                device_id: None,
            }
        };
        self.emit_status(change);
    }

    pub(crate) fn policy(&self) -> Arc<dyn RetryPolicy> {
        self.0.policy.clone()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.0.shutdown.subscribe()
    }

    /// Park until the engine signals a disconnection.
    pub(crate) async fn loss_signaled(&self) {
        self.0.reconnect.notified().await;
    }

    fn emit_status(&self, change: StatusChange) {
        debug!(status = ?change.status, reason = ?change.reason, device = ?change.device_id,
            "connection status changed");
        let callback = self.send_state().status_callback.clone();
        if let Some(callback) = callback {
            callback(&change);
        }
    }
}

impl ConnectionListener for TransportRef {
    fn on_message_sent(
        &self,
        connection_id: &str,
        correlation: CorrelationId,
        response: Option<InboundMessage>,
        error: Option<ConnectionError>,
    ) {
        let mut send = self.send_state();
        if !send.is_current(connection_id) {
            trace!(correlation = %correlation, "ignoring ack from stale connection");
            return;
        }
        let Some(packet) = send.in_flight.remove(&correlation) else {
            debug!(correlation = %correlation, "ack for unknown correlation id");
            return;
        };
        match error {
            None => {
                let status = packet.acknowledged_status();
                send.callbacks
                    .push_back(packet.complete(status).with_response(response));
            }
            Some(e) => {
                // The sole path that turns a network nack into a resend.
                debug!(correlation = %correlation, "delivery nacked, requeueing: {e}");
                send.last_error = Some(e);
                send.waiting.push_back(packet);
            }
        }
    }

    fn on_message_received(
        &self,
        _connection_id: &str,
        message: InboundMessage,
        error: Option<ConnectionError>,
    ) {
        if let Some(e) = error {
            warn!("dropping inbound message reported with error: {e}");
            return;
        }
        self.recv_state().received.push_back(message);
    }

    fn on_connection_lost(&self, connection_id: &str, error: ConnectionError) {
        let change = {
            let mut send = self.send_state();
            if !send.is_current(connection_id) {
                trace!("ignoring loss event from stale connection");
                return;
            }
            if let Some(instance) = &mut send.connection {
                instance.lost = true;
            }
            send.last_error = Some(error.clone());
            if send.status != ConnectionStatus::Connected {
                // Already recovering; the coordinator was signaled on the
                // first edge.
                return;
            }
            send.status = ConnectionStatus::Disconnected;
            send.set_all_devices(ConnectionStatus::Disconnected, Some(&error));

            // Attempted-but-unacknowledged messages go ahead of the waiting
            // queue: better to resend than to silently lose.
            let mut flushed: Vec<TransportPacket> =
                send.in_flight.drain().map(|(_, p)| p).collect();
            flushed.sort_by_key(|p| p.correlation());
            let requeued = flushed.len();
            for packet in flushed.into_iter().rev() {
                send.waiting.push_front(packet);
            }
            debug!(requeued, "connection lost: {error}");

            send.reconnect_attempts = 0;
            send.reconnect_started = None;
            send.retry_exhausted = false;
            StatusChange {
                status: ConnectionStatus::Disconnected,
                reason: classify_loss(Some(&error)),
                cause: Some(error),
                device_id: None,
            }
        };
        self.emit_status(change);
        self.0.reconnect.notify_one();
    }

    fn on_connection_established(&self, connection_id: &str) {
        let change = {
            let mut send = self.send_state();
            if send.lifecycle == Lifecycle::Closed
                || !send.is_current(connection_id)
                || send.status == ConnectionStatus::Connected
            {
                return;
            }
            send.status = ConnectionStatus::Connected;
            send.set_all_devices(ConnectionStatus::Connected, None);
            send.reconnect_attempts = 0;
            send.reconnect_started = None;
            send.retry_exhausted = false;
            send.last_error = None;
            StatusChange {
                status: ConnectionStatus::Connected,
                reason: StatusReason::ConnectionOk,
                cause: None,
                device_id: None,
            }
        };
        self.emit_status(change);
    }
}

fn classify_loss(error: Option<&ConnectionError>) -> StatusReason {
    match error {
        Some(ConnectionError::Lost(_)) | Some(ConnectionError::OpenFailed(_)) | None => {
            StatusReason::NoNetwork
        }
        Some(_) => StatusReason::CommunicationError,
    }
}
