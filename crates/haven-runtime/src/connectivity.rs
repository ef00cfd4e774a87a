//! Connectivity signal shared by the queue and the scheduler.

use std::sync::Arc;
use tokio::sync::watch;

/// Online/offline flag fed by the host.
///
/// Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Report the current connectivity. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.sender.send_replace(online);
        if previous != online {
            if online {
                tracing::info!("Connectivity restored");
            } else {
                tracing::info!("Connectivity lost, writes will be queued");
            }
        }
        previous != online
    }

    /// Receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        assert!(monitor.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }
}
