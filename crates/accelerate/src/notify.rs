//! In-process notifications.
//!
//! Hosts subscribe to client notifications with [`Notifier::on`] and keep the
//! returned [`Subscription`] to unsubscribe later.

use crate::types::{Endpoint, RecordedEvent};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Payload-carrying notification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Configuration read and the client constructed.
    Loaded,
    /// Consent resolved and tracking started.
    Ready,
    /// An event was queued.
    Record(RecordedEvent),
    /// The endpoint was merged and persisted.
    UpdateEndpoint(Endpoint),
    /// Matched audience IDs changed (sorted).
    UpdateAudiences(Vec<u64>),
}

/// Notification discriminant used for subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Loaded,
    Ready,
    Record,
    UpdateEndpoint,
    UpdateAudiences,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Loaded => NotificationKind::Loaded,
            Notification::Ready => NotificationKind::Ready,
            Notification::Record(_) => NotificationKind::Record,
            Notification::UpdateEndpoint(_) => NotificationKind::UpdateEndpoint,
            Notification::UpdateAudiences(_) => NotificationKind::UpdateAudiences,
        }
    }
}

/// Handle returned by [`Notifier::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub(crate) type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Listeners registered on the builder, attached before `Loaded` fires.
#[derive(Clone, Default)]
pub(crate) struct PendingListeners(pub(crate) Vec<(NotificationKind, Callback)>);

impl std::fmt::Debug for PendingListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PendingListeners").field(&self.0.len()).finish()
    }
}

struct Listener {
    id: u64,
    kind: NotificationKind,
    callback: Callback,
}

/// Callback registry.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for notifications of `kind`.
    pub fn on<F>(&self, kind: NotificationKind, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.attach(kind, Arc::new(callback))
    }

    pub(crate) fn attach(&self, kind: NotificationKind, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push(Listener { id, kind, callback });
        Subscription(id)
    }

    /// Remove a subscription. Returns false if it was already removed.
    pub fn off(&self, subscription: Subscription) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription.0);
        listeners.len() != before
    }

    /// Deliver `notification` to every matching listener.
    pub fn dispatch(&self, notification: Notification) {
        let kind = notification.kind();
        // Snapshot so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.callback.clone())
            .collect();
        for callback in callbacks {
            callback(&notification);
        }
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
