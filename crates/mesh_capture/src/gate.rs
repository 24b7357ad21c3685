use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Interlock between anchor ingestion and snapshot export.
///
/// Shared by the registry (which checks it and skips) and the exporter (which
/// engages it for the duration of a flush). Only one flush can hold it.
#[derive(Debug, Default)]
pub struct CaptureGate {
    flushing: AtomicBool,
}

impl CaptureGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Engages the gate, or returns `None` if a flush already holds it.
    pub fn try_engage(self: &Arc<Self>) -> Option<GateGuard> {
        self.flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GateGuard { gate: self.clone() })
    }
}

/// Holds the gate engaged; releasing happens on drop, whatever the outcome.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<CaptureGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.flushing.store(false, Ordering::SeqCst);
    }
}
