use std::{any::Any, fmt, time::Instant};

use crate::message::{InboundMessage, Message};

/// Identifier matching an asynchronous delivery acknowledgement to its
/// in-flight packet.
///
/// Allocated from a monotonic sequence when the message is enqueued, so it is
/// unique for as long as the packet is outstanding and never collides the way
/// a content hash could.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub(crate) u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal status delivered to a message's callback.
///
/// Every message submitted to the transport receives exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Delivered and acknowledged.
    Ok,
    /// Delivered; the service acknowledged with an empty response.
    OkEmpty,
    /// The message's expiry deadline passed before it could be sent.
    MessageExpired,
    /// The owning identity's credential expired and cannot be renewed.
    Unauthorized,
    /// The transport was closed while the message was still queued or
    /// in flight.
    MessageCancelledOnClose,
    /// A protocol-reported error code, passed through unchanged.
    Protocol(u32),
}

impl CompletionStatus {
    /// Map a protocol status code onto a completion status.
    pub fn from_code(code: u32) -> Self {
        match code {
            200 => Self::Ok,
            204 => Self::OkEmpty,
            401 => Self::Unauthorized,
            other => Self::Protocol(other),
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::OkEmpty => write!(f, "ok (empty response)"),
            Self::MessageExpired => write!(f, "message expired"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::MessageCancelledOnClose => write!(f, "cancelled on close"),
            Self::Protocol(code) => write!(f, "protocol status {code}"),
        }
    }
}

/// Opaque application context threaded through to the callback.
pub type UserContext = Option<Box<dyn Any + Send + Sync>>;

/// Fire-and-forget completion callback.
pub type EventCallback = Box<dyn FnOnce(CompletionStatus, UserContext) + Send>;

/// Request/response completion callback. The response is `None` when the
/// service acknowledged without a body.
pub type ResponseCallback =
    Box<dyn FnOnce(CompletionStatus, Option<InboundMessage>, UserContext) + Send>;

/// Exactly one of the two callback shapes, fixed at submission time.
pub enum PacketCallback {
    /// Event (fire-and-forget) form.
    Event(EventCallback),
    /// Request/response form.
    Response(ResponseCallback),
}

impl fmt::Debug for PacketCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(_) => f.write_str("PacketCallback::Event"),
            Self::Response(_) => f.write_str("PacketCallback::Response"),
        }
    }
}

/// A message wrapped for transport, carrying its delivery bookkeeping.
#[derive(Debug)]
pub(crate) struct TransportPacket {
    message: Message,
    callback: PacketCallback,
    context: UserContext,
    correlation: CorrelationId,
    created_at: Instant,
    attempts: u32,
    device_id: String,
    /// Synchronous status code reported by the protocol at send time, used
    /// to resolve OK vs. OK_EMPTY once the acknowledgement arrives.
    status_code: Option<u32>,
}

impl TransportPacket {
    pub(crate) fn new(
        message: Message,
        callback: PacketCallback,
        context: UserContext,
        correlation: CorrelationId,
        device_id: String,
    ) -> Self {
        Self {
            message,
            callback,
            context,
            correlation,
            created_at: Instant::now(),
            attempts: 0,
            device_id,
            status_code: None,
        }
    }

    pub(crate) fn message(&self) -> &Message {
        &self.message
    }

    pub(crate) fn correlation(&self) -> CorrelationId {
        self.correlation
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Record one send attempt. The counter only ever grows.
    pub(crate) fn note_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn set_status_code(&mut self, code: u32) {
        self.status_code = Some(code);
    }

    /// Resolve the acknowledged status, honoring any synchronous status code
    /// the protocol reported at send time.
    pub(crate) fn acknowledged_status(&self) -> CompletionStatus {
        match self.status_code {
            Some(code) => CompletionStatus::from_code(code),
            None => CompletionStatus::Ok,
        }
    }

    /// Retire the packet with a terminal status.
    pub(crate) fn complete(self, status: CompletionStatus) -> CallbackPacket {
        CallbackPacket {
            status,
            callback: self.callback,
            context: self.context,
            response: None,
        }
    }
}

/// A retired packet waiting for its one and only callback invocation.
#[derive(Debug)]
pub(crate) struct CallbackPacket {
    status: CompletionStatus,
    callback: PacketCallback,
    context: UserContext,
    response: Option<InboundMessage>,
}

impl CallbackPacket {
    /// Attach the service's response body for request/response traffic.
    pub(crate) fn with_response(mut self, response: Option<InboundMessage>) -> Self {
        self.response = response;
        self
    }

    /// Invoke the resolved callback, consuming the packet.
    pub(crate) fn invoke(self) {
        match self.callback {
            PacketCallback::Event(cb) => cb(self.status, self.context),
            PacketCallback::Response(cb) => cb(self.status, self.response, self.context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_protocol_codes_map_to_named_statuses() {
        assert_eq!(CompletionStatus::from_code(200), CompletionStatus::Ok);
        assert_eq!(CompletionStatus::from_code(204), CompletionStatus::OkEmpty);
        assert_eq!(
            CompletionStatus::from_code(401),
            CompletionStatus::Unauthorized
        );
        assert_eq!(
            CompletionStatus::from_code(429),
            CompletionStatus::Protocol(429)
        );
    }

    #[test]
    fn acknowledged_status_honors_the_synchronous_code() {
        let mut packet = TransportPacket::new(
            Message::telemetry("x"),
            PacketCallback::Event(Box::new(|_, _| {})),
            None,
            CorrelationId(1),
            "dev".into(),
        );
        assert_eq!(packet.acknowledged_status(), CompletionStatus::Ok);
        packet.set_status_code(204);
        assert_eq!(packet.acknowledged_status(), CompletionStatus::OkEmpty);
    }
}
