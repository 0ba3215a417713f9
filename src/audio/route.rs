//! Device route-change notifications
//!
//! Notifications arrive on arbitrary threads. The handler only records the
//! event and raises a flag; the engine consumes both on the control thread in
//! `reinitialize_if_needed`.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pending notifications kept before older ones are dropped
const ROUTE_CHANGE_QUEUE: usize = 16;

/// Why the platform changed the output route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    NewDeviceAvailable,
    OldDeviceUnavailable,
    CategoryChange,
    Override,
    ConfigurationChange,
    Unknown,
}

impl RouteChangeReason {
    /// Whether the output device may now be a different one
    pub fn requires_reinit(&self) -> bool {
        matches!(
            self,
            RouteChangeReason::NewDeviceAvailable
                | RouteChangeReason::OldDeviceUnavailable
                | RouteChangeReason::Override
                | RouteChangeReason::ConfigurationChange
                | RouteChangeReason::Unknown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub reason: RouteChangeReason,
    /// Name of the device the route moved to, if known
    pub device_name: Option<String>,
}

impl RouteChange {
    pub fn new(reason: RouteChangeReason) -> Self {
        Self {
            reason,
            device_name: None,
        }
    }
}

/// Cloneable handle for delivering route changes from any thread
#[derive(Clone)]
pub struct RouteChangeNotifier {
    needs_reinit: Arc<AtomicBool>,
    tx: Sender<RouteChange>,
}

impl RouteChangeNotifier {
    pub fn notify(&self, change: RouteChange) {
        if change.reason.requires_reinit() {
            self.needs_reinit.store(true, Ordering::Release);
        }
        if let Err(TrySendError::Full(change)) = self.tx.try_send(change) {
            tracing::debug!("Route change queue full, dropping {:?}", change.reason);
        }
    }
}

/// Engine-side end of the notification path
pub(crate) struct RouteChangeQueue {
    needs_reinit: Arc<AtomicBool>,
    tx: Sender<RouteChange>,
    rx: Receiver<RouteChange>,
}

impl RouteChangeQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = bounded(ROUTE_CHANGE_QUEUE);
        Self {
            needs_reinit: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    pub(crate) fn notifier(&self) -> RouteChangeNotifier {
        RouteChangeNotifier {
            needs_reinit: self.needs_reinit.clone(),
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn needs_reinit(&self) -> bool {
        self.needs_reinit.load(Ordering::Acquire)
    }

    pub(crate) fn request_reinit(&self) {
        self.needs_reinit.store(true, Ordering::Release);
    }

    /// Drain queued events and clear the flag, returning whether a reinit was requested
    pub(crate) fn take(&self) -> (bool, Vec<RouteChange>) {
        let changes: Vec<RouteChange> = self.rx.try_iter().collect();
        let requested = self.needs_reinit.swap(false, Ordering::AcqRel);
        (requested, changes)
    }
}
