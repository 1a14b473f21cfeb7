//! Periodic pumps that drive the queue engine.
//!
//! The drivers own no correctness logic: they re-invoke the engine on an
//! interval and isolate it from the host's scheduling model. Any error the
//! engine returns is logged and swallowed so a single bad tick never
//! terminates a pump; the loops exit only on the transport's shutdown
//! signal.

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

fn log_tick_error(pump: &str, error: TransportError) {
    match error {
        // Expected while the transport is closed or not yet open.
        TransportError::IllegalState(_) => debug!(pump, "tick skipped: {error}"),
        _ => warn!(pump, "tick failed: {error}"),
    }
}

/// Pump that flushes waiting messages and fires completed callbacks.
pub struct SendDriver {
    transport: Transport,
}

impl SendDriver {
    /// Create a send driver for `transport`.
    pub fn new(transport: &Transport) -> Self {
        Self {
            transport: transport.clone(),
        }
    }

    /// Run the pump until the transport closes. Spawn this on the host's
    /// executor.
    pub async fn run(self) {
        let interval = self.transport.inner.0.config.send_tick();
        let mut shutdown = self.transport.inner.shutdown_rx();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                () = sleep(interval) => {}
                _ = shutdown.changed() => continue,
            }
            self.tick().await;
        }
    }

    /// One pump cycle: send one batch, then invoke completed callbacks.
    pub async fn tick(&self) {
        if let Err(e) = self.transport.send_queued_messages().await {
            log_tick_error("send", e);
        }
        if let Err(e) = self.transport.invoke_callbacks() {
            log_tick_error("send", e);
        }
    }
}

/// Pump that dispatches received messages to their handlers.
pub struct ReceiveDriver {
    transport: Transport,
}

impl ReceiveDriver {
    /// Create a receive driver for `transport`.
    pub fn new(transport: &Transport) -> Self {
        Self {
            transport: transport.clone(),
        }
    }

    /// Run the pump until the transport closes. Spawn this on the host's
    /// executor.
    pub async fn run(self) {
        let interval = self.transport.inner.0.config.receive_tick();
        let mut shutdown = self.transport.inner.shutdown_rx();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                () = sleep(interval) => {}
                _ = shutdown.changed() => continue,
            }
            self.tick().await;
        }
    }

    /// One pump cycle: dispatch at most one received message.
    pub async fn tick(&self) {
        if let Err(e) = self.transport.handle_received_messages().await {
            log_tick_error("receive", e);
        }
    }
}
