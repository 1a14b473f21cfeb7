//! Seams between the queue engine and the wire-protocol bindings.
//!
//! A binding implements [`ConnectionFactory`] and [`ConnectionHandle`] once
//! per protocol; the engine implements [`ConnectionListener`] and is wired to
//! each handle before it is opened. Handles are replaced, never reopened, so
//! every reconnect produces a fresh handle with a fresh stable id.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::DeviceConfig,
    message::{InboundMessage, Message},
    packet::CorrelationId,
};

/// Error reported by a protocol binding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The handle could not be opened.
    #[error("failed to open connection: {0}")]
    OpenFailed(String),
    /// The open connection was lost.
    #[error("connection lost: {0}")]
    Lost(String),
    /// An individual send could not be handed to the wire.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The service rejected an operation with a protocol status code.
    #[error("protocol error {code}: {reason}")]
    Protocol {
        /// Protocol-reported status code, passed through unchanged.
        code: u32,
        /// Human-readable detail.
        reason: String,
    },
    /// The handle was already closed.
    #[error("connection closed")]
    Closed,
}

/// User-visible connection status.
///
/// Distinct from the engine's internal open/closed lifecycle: the transport
/// stays open across loss/recovery cycles while this status tracks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection is established and healthy.
    Connected,
    /// The connection is down and no reconnect attempt is scheduled.
    Disconnected,
    /// The connection is down and the transport is actively retrying.
    DisconnectedRetrying,
}

/// Why a status transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    /// The connection was (re)established.
    ConnectionOk,
    /// The identity's shared-access credential expired and cannot renew.
    ExpiredSasToken,
    /// The retry policy gave up; the connection is terminally down.
    RetryExpired,
    /// The network dropped out from under the connection.
    NoNetwork,
    /// The protocol reported an error that tore the connection down.
    CommunicationError,
    /// The application closed the transport.
    ClientClose,
}

/// A status transition delivered to the registered status callback.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The new status.
    pub status: ConnectionStatus,
    /// Why the transition happened.
    pub reason: StatusReason,
    /// The causal error, when there is one.
    pub cause: Option<ConnectionError>,
    /// The affected device identity, or `None` for connection-wide events.
    pub device_id: Option<String>,
}

/// Callback observing [`StatusChange`] events.
pub type StatusCallback = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// How a received message was settled by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; remove it from the service queue.
    Complete,
    /// Not handled now; the service should redeliver later.
    Abandon,
    /// Rejected; the service should dead-letter it.
    Reject,
}

/// One open wire-protocol session.
///
/// The engine is the only caller of `send`/`send_ack`. A handle is opened at
/// most once; reconnection constructs a replacement through the
/// [`ConnectionFactory`] instead of reopening a dead handle.
#[async_trait]
pub trait ConnectionHandle: Send + Sync + fmt::Debug {
    /// Stable identifier for correlating listener events to this specific
    /// handle instance.
    fn id(&self) -> &str;

    /// Register the listener that receives acknowledgement, receive, and
    /// connectivity events. Must be called before `open`.
    fn set_listener(&self, listener: Arc<dyn ConnectionListener>) -> Result<(), ConnectionError>;

    /// Perform the protocol handshake for the configured identity set.
    async fn open(&self) -> Result<(), ConnectionError>;

    /// Tear the session down. Idempotent.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Hand one message to the wire. Returns the protocol's synchronous
    /// status code; the delivery acknowledgement arrives later through
    /// [`ConnectionListener::on_message_sent`] carrying `correlation`.
    async fn send(
        &self,
        message: &Message,
        correlation: CorrelationId,
    ) -> Result<u32, ConnectionError>;

    /// Report a received message's disposition back to the service. Returns
    /// `false` when the protocol could not deliver the settlement and the
    /// caller should retry it later.
    async fn send_ack(
        &self,
        message: &InboundMessage,
        disposition: Disposition,
    ) -> Result<bool, ConnectionError>;
}

/// Constructor for [`ConnectionHandle`]s; one implementation per protocol.
///
/// One config in `devices` yields a single-identity session, several yield a
/// multiplexed session sharing one physical connection.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Build an unopened handle for the given identity set.
    fn connect(&self, devices: &[DeviceConfig]) -> Arc<dyn ConnectionHandle>;
}

/// Events a handle reports back to the engine.
///
/// Implementations must be cheap and non-blocking; bindings may invoke them
/// from their own I/O tasks.
pub trait ConnectionListener: Send + Sync {
    /// The delivery of `correlation` was acknowledged (`error` is `None`) or
    /// nacked by the service. For request traffic, `response` carries the
    /// service's response body when the acknowledgement had one.
    fn on_message_sent(
        &self,
        connection_id: &str,
        correlation: CorrelationId,
        response: Option<InboundMessage>,
        error: Option<ConnectionError>,
    );

    /// A message arrived from the service.
    fn on_message_received(
        &self,
        connection_id: &str,
        message: InboundMessage,
        error: Option<ConnectionError>,
    );

    /// The connection dropped.
    fn on_connection_lost(&self, connection_id: &str, error: ConnectionError);

    /// The connection finished establishing.
    fn on_connection_established(&self, connection_id: &str);
}
