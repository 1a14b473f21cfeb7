//! Client-side transport orchestration for IoT hub device connections.
//!
//! This crate is the layer between application code and a wire-protocol
//! binding: it queues outbound telemetry and command responses, pumps them
//! through a pluggable [`ConnectionHandle`], tracks delivery
//! acknowledgement, and recovers from connection loss under a configurable
//! [`RetryPolicy`]. In-flight work survives reconnection, and every
//! submitted message gets exactly one terminal callback.
//!
//! The entry point is the [`Transport`]. Protocol bindings (MQTT, AMQP,
//! HTTPS or anything else) live outside this crate and plug in through the
//! [`ConnectionFactory`] and [`ConnectionHandle`] traits; the engine plugs
//! back into them as a [`ConnectionListener`].
//!
//! # Operation
//!
//! Applications submit messages with [`Transport::add_message`] (or
//! [`Transport::add_request`] for request/response traffic). A [`SendDriver`]
//! and a [`ReceiveDriver`], spawned by the host on whatever executor it
//! likes, tick the engine: the send driver flushes a bounded batch of
//! waiting messages and fires completed callbacks, while the receive driver
//! dispatches inbound messages to handlers registered per [`MessageKind`].
//!
//! When the binding reports connection loss, in-flight messages are requeued
//! rather than dropped and the user-visible [`ConnectionStatus`] flips to
//! disconnected. A dedicated reconnection task, parked while the connection
//! is healthy, drives recovery attempts paced by the retry policy.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::time::Duration;

mod config;
mod connection;
mod driver;
mod message;
mod packet;
mod reconnect;
mod retry;
mod transport;

pub use crate::config::{Credential, DeviceConfig, TransportConfig};
pub use crate::connection::{
    ConnectionError, ConnectionFactory, ConnectionHandle, ConnectionListener, ConnectionStatus,
    Disposition, StatusCallback, StatusChange, StatusReason,
};
pub use crate::driver::{ReceiveDriver, SendDriver};
pub use crate::message::{InboundMessage, Message, MessageKind};
pub use crate::packet::{
    CompletionStatus, CorrelationId, EventCallback, PacketCallback, ResponseCallback, UserContext,
};
pub use crate::retry::{ExponentialBackoffWithJitter, NoRetry, RetryDecision, RetryPolicy};
pub use crate::transport::{MessageHandler, Transport, TransportError, TransportStats};

/// Maximum number of waiting messages drained per send tick.
///
/// Bounds the time slice one tick can consume so a deep queue cannot starve
/// acknowledgement processing or shutdown.
pub const SEND_BATCH_BOUND: usize = 10;

/// Default interval between driver ticks.
pub const DRIVER_TICK: Duration = Duration::from_millis(10);
