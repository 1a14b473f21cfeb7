use std::time::{Duration, Instant};

/// Credential under which a device identity authenticates.
///
/// Renewal itself happens outside the transport; only the expiry-triggered
/// effect on sending is modeled here. A message owned by an identity whose
/// credential has expired and cannot renew is retired as unauthorized rather
/// than retried.
#[derive(Debug, Clone)]
pub struct Credential {
    expires_at: Option<Instant>,
    renewable: bool,
}

impl Credential {
    /// A credential that never expires (X.509 or connection-string auth).
    pub fn permanent() -> Self {
        Self {
            expires_at: None,
            renewable: false,
        }
    }

    /// A time-limited shared-access credential.
    pub fn sas(expires_at: Instant, renewable: bool) -> Self {
        Self {
            expires_at: Some(expires_at),
            renewable,
        }
    }

    /// Whether the credential has expired as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }

    /// Whether an expired credential can be renewed out of band.
    pub fn is_renewable(&self) -> bool {
        self.renewable
    }

    /// Expired with no way to renew: sends under this credential are
    /// terminally unauthorized.
    pub(crate) fn is_unusable(&self, now: Instant) -> bool {
        self.is_expired(now) && !self.renewable
    }
}

/// One device identity participating in a connection.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device identifier, unique within the identity set.
    pub device_id: String,
    /// Credential the identity authenticates with.
    pub credential: Credential,
}

impl DeviceConfig {
    /// Identity with a permanent credential.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            credential: Credential::permanent(),
        }
    }

    /// Replace the credential.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }
}

/// Tuning knobs for the queue engine and its drivers.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    send_batch: usize,
    send_interval: Duration,
    receive_interval: Duration,
}

impl TransportConfig {
    /// Maximum number of waiting messages drained per send tick.
    ///
    /// Bounds the time slice one tick can consume so a deep queue cannot
    /// starve acknowledgement processing.
    pub fn send_batch(&mut self, bound: usize) -> &mut Self {
        self.send_batch = bound.max(1);
        self
    }

    /// Interval between send driver ticks.
    pub fn send_interval(&mut self, interval: Duration) -> &mut Self {
        self.send_interval = interval;
        self
    }

    /// Interval between receive driver ticks.
    pub fn receive_interval(&mut self, interval: Duration) -> &mut Self {
        self.receive_interval = interval;
        self
    }

    pub(crate) fn send_batch_bound(&self) -> usize {
        self.send_batch
    }

    pub(crate) fn send_tick(&self) -> Duration {
        self.send_interval
    }

    pub(crate) fn receive_tick(&self) -> Duration {
        self.receive_interval
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_batch: crate::SEND_BATCH_BOUND,
            send_interval: crate::DRIVER_TICK,
            receive_interval: crate::DRIVER_TICK,
        }
    }
}
