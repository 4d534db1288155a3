//! Fatal error escalation channel
//!
//! Converts "an unexpected condition happened deep in a worker" into a
//! single notification the hosting process can act on. Each component
//! (producer, consumer, job watcher) is constructed with a [`FatalHook`];
//! the host keeps the matching [`FatalEvents`] receiver and shuts down
//! gracefully when anything arrives.
//!
//! A hook delivers at most one event over its lifetime, no matter how many
//! clones exist or how many tasks race to raise. The first raise wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

/// A fatal fault reported by a component.
#[derive(Debug, Clone)]
pub struct FatalError {
    /// Name of the component that faulted (e.g. "producer", "job-watcher")
    pub component: String,
    /// Human-readable description of the fault
    pub message: String,
    /// Rendered source error, if one triggered the fault
    pub cause: Option<String>,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {} (cause: {})", self.component, self.message, cause),
            None => write!(f, "{}: {}", self.component, self.message),
        }
    }
}

/// Create a fatal escalation channel for one component instance.
///
/// Returns the hook to hand to the component and the event receiver for
/// the host.
pub fn fatal_channel(component: &str) -> (FatalHook, FatalEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook = FatalHook {
        component: Arc::<str>::from(component),
        raised: Arc::new(AtomicBool::new(false)),
        tx,
    };
    (hook, FatalEvents { rx })
}

/// Component-side handle for raising a fatal fault.
///
/// Clones share the one-shot latch: across all clones, only the first
/// `raise` delivers an event.
#[derive(Clone)]
pub struct FatalHook {
    component: Arc<str>,
    raised: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<FatalError>,
}

impl FatalHook {
    /// Raise a fatal fault. Returns true if this call delivered the event,
    /// false if the component had already faulted.
    pub fn raise(&self, message: impl Into<String>, cause: Option<String>) -> bool {
        if self.raised.swap(true, Ordering::SeqCst) {
            return false;
        }
        let fault = FatalError {
            component: self.component.to_string(),
            message: message.into(),
            cause,
        };
        error!("fatal error raised by {}", fault);
        // A dropped receiver means the host is already shutting down.
        let _ = self.tx.send(fault);
        true
    }

    /// Whether this component has already raised a fatal fault.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Component name this hook was created for.
    pub fn component(&self) -> &str {
        &self.component
    }
}

/// Host-side receiver of fatal faults.
pub struct FatalEvents {
    rx: mpsc::UnboundedReceiver<FatalError>,
}

impl FatalEvents {
    /// Wait for a fatal fault. Returns `None` if every hook clone has been
    /// dropped without raising.
    pub async fn recv(&mut self) -> Option<FatalError> {
        self.rx.recv().await
    }

    /// Non-blocking poll, mainly for tests and shutdown paths.
    pub fn try_recv(&mut self) -> Option<FatalError> {
        self.rx.try_recv().ok()
    }
}
