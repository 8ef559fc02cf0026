use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};

use iptunnel_traits::status::{ObserverResult, StatusEvent, StatusObserver};

/// Delivers status events to a single observer.
///
/// Whatever the observer does, including returning an error or panicking,
/// stays inside `notify`: the supervisor and its watchdog never see it.
#[derive(Default)]
pub struct StatusNotifier {
    observer: RwLock<Option<Arc<dyn StatusObserver>>>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current observer.
    pub fn set_observer<O>(&self, observer: O)
    where
        O: StatusObserver + 'static,
    {
        *self.observer.write() = Some(Arc::new(observer));
    }

    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    pub fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }

    /// Replaces the current observer with a bounded channel and returns its
    /// receiving end. Events that do not fit are dropped and logged.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.set_observer(ChannelObserver { tx });
        rx
    }

    pub fn notify(&self, connected: bool, message: &str) {
        // Clone out of the lock so an observer may call `set_observer`.
        let observer = self.observer.read().clone();
        let Some(observer) = observer else {
            debug!("No status observer registered, dropping: {}", message);
            return;
        };

        let event = StatusEvent::new(connected, message);
        match panic::catch_unwind(AssertUnwindSafe(|| observer.on_status(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Status observer failed: {}", e),
            Err(payload) => error!("Status observer panicked: {}", panic_message(&*payload)),
        }
    }
}

struct ChannelObserver {
    tx: mpsc::Sender<StatusEvent>,
}

impl StatusObserver for ChannelObserver {
    fn on_status(&self, event: &StatusEvent) -> ObserverResult {
        self.tx
            .try_send(event.clone())
            .map_err(|e| format!("status channel rejected event: {}", e).into())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
