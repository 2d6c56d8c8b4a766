//! In-process publish/subscribe used for all cross-component signaling.
//!
//! Each event kind has its own [`Topic`]. Publishing dispatches synchronously to every listener
//! registered at that moment, so a head update observed by the head tracker is visible to the
//! type scanners before `publish` returns.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    ScannerError,
    types::{FetchedBatch, HeadUpdated, WatermarkAdvanced},
};

/// Maximum listeners per topic. Going past it is a configuration error.
pub const MAX_LISTENERS: usize = 100;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

/// A typed channel for one kind of event.
pub struct Topic<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Topic<T> {
    fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `listener` and returns a handle that unregisters it on
    /// [`remove`](RemovableListener::remove) or drop.
    ///
    /// # Errors
    ///
    /// * [`ScannerError::TooManyListeners`] - if the topic already has [`MAX_LISTENERS`].
    pub fn subscribe<F>(&self, listener: F) -> Result<RemovableListener, ScannerError>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = lock(&self.registry.listeners);
            if listeners.len() >= MAX_LISTENERS {
                return Err(ScannerError::TooManyListeners { limit: MAX_LISTENERS });
            }
            listeners.push((id, Arc::new(listener)));
        }

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        Ok(RemovableListener {
            remove: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry.listeners).retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        })
    }

    /// Delivers `event` to every currently registered listener.
    pub fn publish(&self, event: &T) {
        // Listeners run outside the lock; they may subscribe or unsubscribe from a callback.
        let listeners: Vec<Listener<T>> =
            lock(&self.registry.listeners).iter().map(|(_, listener)| listener.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.registry.listeners).len()
    }
}

fn lock<T>(listeners: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Unregisters its listener when removed or dropped.
#[must_use = "dropping the handle unregisters the listener"]
pub struct RemovableListener {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemovableListener {
    /// Unregisters the listener.
    pub fn remove(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for RemovableListener {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for RemovableListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovableListener").field("active", &self.remove.is_some()).finish()
    }
}

/// The bus shared by the head tracker, type scanners and coordinator.
pub struct EventBus {
    pub head_updated: Topic<HeadUpdated>,
    pub events_fetched: Topic<FetchedBatch>,
    pub watermark_advanced: Topic<WatermarkAdvanced>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head_updated: Topic::new(),
            events_fetched: Topic::new(),
            watermark_advanced: Topic::new(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("head_updated", &self.head_updated.listener_count())
            .field("events_fetched", &self.events_fetched.listener_count())
            .field("watermark_advanced", &self.watermark_advanced.listener_count())
            .finish()
    }
}
