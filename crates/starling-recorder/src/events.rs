//! Voice-channel event fan-out with explicit subscription handles.
//!
//! The client layer emits into an [`EventHub`]; subscribers hold
//! [`Subscription`] handles and detach either explicitly or on drop. The
//! recorder keeps its handles in a vector and releases them all on dispose.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    BotConnected,
    BotDisconnected,
    AloneChanged(bool),
    ParticipantsChanged,
    EnabledChanged(bool),
}

type Callback = Box<dyn Fn(&VoiceEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers: Vec<(u64, Callback)>,
}

#[derive(Clone, Default)]
pub struct EventHub {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&VoiceEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("event registry poisoned")
            .handlers
            .push((id, Box::new(callback)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    pub fn emit(&self, event: &VoiceEvent) {
        // Snapshot outside the registry lock is not needed: handlers are
        // invoked while holding it, so unsubscribing from inside a handler
        // would deadlock. The recorder only unsubscribes on dispose.
        let registry = self.registry.lock().expect("event registry poisoned");
        for (_, handler) in &registry.handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .expect("event registry poisoned")
            .handlers
            .len()
    }
}

/// Handle to one registered callback. Detaches on [`Subscription::unsubscribe`]
/// or drop.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .expect("event registry poisoned")
                .handlers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
