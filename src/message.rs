use std::time::Instant;

use bytes::Bytes;

/// Kind of traffic a message carries.
///
/// Inbound dispatch is keyed on this tag rather than on runtime type
/// inspection, so handlers are registered per kind and resolved with a map
/// lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Device-to-cloud telemetry, fire-and-forget from the application's
    /// point of view.
    Telemetry,
    /// Response to a method invocation previously received from the cloud.
    MethodResponse,
    /// Request against the device twin (reported-property update, etc.).
    TwinRequest,
    /// Cloud-to-device message delivered to the application.
    CloudToDevice,
    /// Method invocation from the cloud that expects a response.
    MethodInvocation,
    /// Desired-property change notification for the device twin.
    TwinUpdate,
}

/// An outbound application message.
///
/// Messages are immutable once handed to the transport. Expiry is an absolute
/// deadline checked before each send attempt; an expired message is retired
/// without ever reaching the wire.
#[derive(Debug, Clone)]
pub struct Message {
    payload: Bytes,
    kind: MessageKind,
    expires_at: Option<Instant>,
    device_id: Option<String>,
    properties: Vec<(String, String)>,
}

impl Message {
    /// Create a message of the given kind.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            kind,
            expires_at: None,
            device_id: None,
            properties: Vec::new(),
        }
    }

    /// Shorthand for a telemetry message.
    pub fn telemetry(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Telemetry, payload)
    }

    /// Set an absolute expiry deadline.
    pub fn with_expiry(mut self, deadline: Instant) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Address the message to a specific device identity on a multiplexed
    /// connection. Defaults to the first configured identity.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Attach an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Target device identity, if any.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Application properties in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Whether the expiry deadline has passed as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// A message received from the cloud, pending dispatch to a registered
/// handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    payload: Bytes,
    kind: MessageKind,
    properties: Vec<(String, String)>,
}

impl InboundMessage {
    /// Construct an inbound message. Called by protocol bindings when they
    /// decode traffic from the wire.
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            kind,
            properties: Vec::new(),
        }
    }

    /// Attach a decoded property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Message kind, used to resolve the registered handler.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Decoded properties.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }
}
