//! Merged event stream returned by `start_sync_all`.

use discovery_core::Event;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;

/// Receiving end of the manager's global event channel.
///
/// Clones share one underlying receiver, so every event is delivered to
/// exactly one caller. The stream ends (`recv` returns `None`) after all
/// forwarders finished and the manager released the channel.
#[derive(Clone)]
pub struct EventStream {
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl EventStream {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stream = Self {
            receiver: Arc::new(Mutex::new(receiver)),
        };
        (sender, stream)
    }

    /// Next event from any syncing worker.
    pub async fn recv(&self) -> Option<Event> {
        self.receiver.lock().await.recv().await
    }

    /// Next event if one is ready. A stream busy in another `recv` counts
    /// as empty.
    pub fn try_recv(&self) -> Result<Event, TryRecvError> {
        match self.receiver.try_lock() {
            Ok(mut receiver) => receiver.try_recv(),
            Err(_) => Err(TryRecvError::Empty),
        }
    }

    /// Whether both handles read from the same channel.
    pub fn same_stream(&self, other: &EventStream) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
