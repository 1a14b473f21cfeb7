//! Reconnection coordinator: one long-lived task per open transport.
//!
//! The task parks on the engine's wait-handle and costs nothing while the
//! connection is healthy; there is no polling. When the engine signals a
//! disconnection it drives the retry sequence under the transport's
//! [`RetryPolicy`](crate::RetryPolicy) until the connection is back or the
//! policy gives up. The shutdown signal is the only cancellation point and
//! interrupts both the park and the backoff sleep.

use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, info_span, Instrument};

use crate::transport::TransportRef;

pub(crate) struct ReconnectMonitor {
    transport: TransportRef,
}

impl ReconnectMonitor {
    pub(crate) fn spawn(transport: TransportRef) {
        let monitor = Self { transport };
        tokio::spawn(monitor.run().instrument(info_span!("reconnect")));
    }

    async fn run(self) {
        let mut shutdown = self.transport.shutdown_rx();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            tokio::select! {
                () = self.transport.loss_signaled() => {}
                _ = shutdown.changed() => continue,
            }
            if !self.drive_recovery(&mut shutdown).await {
                return;
            }
        }
    }

    /// Drive reconnect attempts until connected, exhausted, or shut down.
    /// Returns `false` when the transport is shutting down.
    async fn drive_recovery(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let policy = self.transport.policy();
        loop {
            let Some((attempt, last_error)) = self.transport.reconnect_context() else {
                return true;
            };
            let decision = policy.decide(attempt, last_error.as_ref());
            if !decision.should_retry {
                self.transport.reconnect_exhausted();
                return true;
            }
            self.transport.note_attempt_scheduled();
            debug!(attempt, delay = ?decision.delay, "scheduling reconnect attempt");
            if !decision.delay.is_zero() {
                tokio::select! {
                    () = sleep(decision.delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow_and_update() {
                            return false;
                        }
                    }
                }
            }
            match self.transport.establish().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return true;
                }
                Err(e) => debug!(attempt, "reconnect attempt failed: {e}"),
            }
            if *shutdown.borrow_and_update() {
                return false;
            }
        }
    }
}
