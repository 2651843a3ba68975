use std::sync::Arc;

use tokio::sync::watch;

/// Injected reachability capability. Whatever platform probe hosts the daemon
/// feeds transitions in through `set_online`; consumers read the flag or wait
/// on the transition stream. No business logic lives here: the monitor never
/// blocks and never retries anything.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records a transition. Setting the same value twice is a no-op and wakes
    /// nobody.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
