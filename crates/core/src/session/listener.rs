use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::device::DeviceState;
use crate::error::EventCode;

/// Event ids carried by [`SessionListener::on_event`].
pub mod event {
    /// Consult data (session properties JSON) for an unpaired peer.
    pub const CONSULT_DATA: i32 = 1;
    /// Cast mode changed: `{"castMode":"stream","fromPeer":true}`.
    pub const CAST_MODE: i32 = 2;
    /// Stream action from the peer: the action JSON as sent.
    pub const STREAM_ACTION: i32 = 3;
    /// Peer finished rendering the first frame.
    pub const RENDER_READY: i32 = 4;
    /// Remote-control input from the peer: `{"data":"<base64>"}`.
    pub const REMOTE_CONTROL: i32 = 5;
}

/// Upper-layer observer of a session.
pub trait SessionListener: Send + Sync {
    fn on_device_state(&self, state: DeviceState, device_id: &str, event_code: EventCode);
    fn on_event(&self, event_id: i32, json: &str);
}

/// Registered listeners keyed by process id.
///
/// Notifications go to every listener; late registrations see no replay.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<BTreeMap<u32, Arc<dyn SessionListener>>>,
    registered: Condvar,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the listener for `pid`.
    pub fn register(&self, pid: u32, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().insert(pid, listener);
        self.registered.notify_all();
        tracing::debug!(pid, "session listener registered");
    }

    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.listeners.lock().remove(&pid).is_some();
        if removed {
            tracing::debug!(pid, "session listener unregistered");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Wait up to `timeout` for at least one listener.
    pub fn wait_for_listener(&self, timeout: Duration) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.is_empty() {
            self.registered
                .wait_while_for(&mut listeners, |l| l.is_empty(), timeout);
        }
        !listeners.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.lock().values().cloned().collect()
    }

    pub fn notify_device_state(&self, state: DeviceState, device_id: &str, event_code: EventCode) {
        tracing::info!(device_id, %state, event_code = event_code.code(), "device state");
        for listener in self.snapshot() {
            listener.on_device_state(state, device_id, event_code);
        }
    }

    pub fn notify_event(&self, event_id: i32, json: &str) {
        tracing::debug!(event_id, "session event");
        for listener in self.snapshot() {
            listener.on_event(event_id, json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Counter(Mutex<Vec<String>>);

    impl SessionListener for Counter {
        fn on_device_state(&self, state: DeviceState, device_id: &str, _event_code: EventCode) {
            self.0.lock().push(format!("{device_id} {state}"));
        }
        fn on_event(&self, event_id: i32, _json: &str) {
            self.0.lock().push(format!("event {event_id}"));
        }
    }

    #[test]
    fn fan_out_reaches_every_listener_without_replay() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        registry.register(1, first.clone());
        registry.notify_device_state(DeviceState::Connecting, "tv", EventCode::None);
        registry.register(2, second.clone());
        registry.notify_event(event::RENDER_READY, "{}");

        assert_eq!(*first.0.lock(), vec!["tv connecting", "event 4"]);
        assert_eq!(*second.0.lock(), vec!["event 4"]);
        assert!(registry.unregister(2));
        assert!(!registry.unregister(2));
    }

    #[test]
    fn wait_returns_once_a_listener_arrives() {
        let registry = Arc::new(ListenerRegistry::new());
        assert!(!registry.wait_for_listener(Duration::from_millis(10)));

        let registrar = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                registry.register(9, Arc::new(Counter::default()));
            })
        };
        assert!(registry.wait_for_listener(Duration::from_secs(2)));
        registrar.join().unwrap();
    }
}
