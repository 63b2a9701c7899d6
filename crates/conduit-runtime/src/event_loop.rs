//! [`EventLoop`] – feeds queued transport events into the [`Registry`].
//!
//! The loop owns the registry and the receiving end of the event queue.
//! Events are handled strictly one at a time, in arrival order; each one is
//! fully dispatched (including any synchronous transport replies) before the
//! next is taken.
//!
//! ```rust,no_run
//! use std::sync::{Arc, atomic::AtomicBool};
//! use conduit_middleware::{channel, LoopbackTransport};
//! use conduit_runtime::{EventLoop, Registry};
//!
//! # async fn demo() {
//! let (_tx, queue) = channel(256);
//! let registry = Registry::new(LoopbackTransport::new());
//! let mut event_loop = EventLoop::new(registry, queue);
//! event_loop.run(Arc::new(AtomicBool::new(false))).await;
//! # }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use conduit_middleware::EventQueue;
use conduit_types::TransportEvent;
use tracing::{debug, info};

use crate::registry::Registry;

/// How often [`EventLoop::run`] re-checks the shutdown flag while idle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct EventLoop {
    registry: Registry,
    queue: EventQueue,
    handled: u64,
    skipped: u64,
}

impl EventLoop {
    pub fn new(registry: Registry, queue: EventQueue) -> Self {
        Self {
            registry,
            queue,
            handled: 0,
            skipped: 0,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Events handled so far, and how many of them were skipped as
    /// inconsistent.
    pub fn stats(&self) -> (u64, u64) {
        (self.handled, self.skipped)
    }

    fn handle(&mut self, event: TransportEvent) {
        self.handled += 1;
        // Inconsistencies are logged by the registry.
        if self.registry.handle_event(event).is_err() {
            self.skipped += 1;
        }
    }

    /// Handle every event already queued, without waiting. Returns how many
    /// were handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut n = 0;
        while let Some(event) = self.queue.try_recv() {
            self.handle(event);
            n += 1;
        }
        n
    }

    /// Handle events until every sender is gone or `shutdown` is set.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!("event loop started");
        while !shutdown.load(Ordering::SeqCst) {
            match tokio::time::timeout(SHUTDOWN_POLL, self.queue.recv()).await {
                Ok(Some(event)) => self.handle(event),
                Ok(None) => {
                    debug!("event queue closed");
                    break;
                }
                Err(_) => continue,
            }
        }
        info!(handled = self.handled, skipped = self.skipped, "event loop stopped");
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }
}
