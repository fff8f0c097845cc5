use std::sync::{Arc, RwLock};

/// Lifecycle notifications fanned out to registered listeners.
///
/// The supervisor variants are emitted by the optional TTL/memory watcher
/// layered on top of the pool; they travel over the same bus so the pool
/// itself never has to know the supervisor exists.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker failed outside of a normal response (death, failed stop).
    WorkerError { pid: u32, error: String },
    /// A worker was retired after a hard failure.
    WorkerDestruct { pid: u32 },
    /// A pool-level operation failed, typically a replacement allocation.
    PoolError { error: String },
    /// Supervisor: worker exceeded its total time-to-live.
    SupervisorTtl { pid: u32 },
    /// Supervisor: worker sat idle past its idle time-to-live.
    SupervisorIdleTtl { pid: u32 },
    /// Supervisor: worker grew past its memory limit.
    SupervisorMaxMemory { pid: u32 },
}

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-out point for [`Event`]s.
///
/// Delivery is synchronous in the emitter's task; listeners must not
/// block. Exposed as a trait so external observers (the supervisor, test
/// probes) can be layered on without touching pool internals.
pub trait EventBus: Send + Sync {
    fn push(&self, event: Event);
    fn add_listener(&self, listener: EventListener);
}

/// Default in-process bus.
pub struct EventsHandler {
    listeners: RwLock<Vec<EventListener>>,
}

impl EventsHandler {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl Default for EventsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for EventsHandler {
    fn push(&self, event: Event) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    fn add_listener(&self, listener: EventListener) {
        self.listeners.write().unwrap().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_r::test;

    #[test]
    fn listeners_receive_events_in_registration_order() {
        let bus = EventsHandler::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.add_listener(Arc::new(move |event| {
                if let Event::PoolError { error } = event {
                    seen.lock().unwrap().push(format!("{tag}:{error}"));
                }
            }));
        }

        bus.push(Event::PoolError {
            error: "alloc".to_string(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["first:alloc".to_string(), "second:alloc".to_string()]);
    }

    #[test]
    fn push_without_listeners_is_a_noop() {
        let bus = EventsHandler::new();
        bus.push(Event::WorkerDestruct { pid: 42 });
    }
}
