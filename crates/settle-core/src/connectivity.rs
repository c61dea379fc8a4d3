//! Online/offline signal shared by the mutation facade and the sync scheduler

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Reactive reachability flag.
///
/// Starts online so that startup does not flash an offline state before the
/// first real observation. Cloning shares the same signal.
#[derive(Clone)]
pub struct Connectivity {
    sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::with_initial(true)
    }

    pub fn with_initial(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record an observation; subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    /// Change stream; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls an HTTP endpoint and feeds the result into a `Connectivity`.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl ReachabilityProbe {
    pub fn new(url: impl Into<String>, interval: Duration, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| crate::remote::RemoteError::Network(error.to_string()))?;
        Ok(Self {
            url: url.into(),
            interval,
            client,
        })
    }

    /// Any HTTP answer counts as reachable; only transport failures do not.
    pub async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!("Reachability check failed: {error}");
                false
            }
        }
    }

    /// Probe on every tick until the task is aborted.
    pub fn spawn(self, connectivity: Connectivity) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                connectivity.set_online(self.check().await);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_online() {
        assert!(Connectivity::new().is_online());
        assert!(!Connectivity::with_initial(false).is_online());
    }

    #[tokio::test]
    async fn notifies_only_on_change() {
        let connectivity = Connectivity::new();
        let mut receiver = connectivity.subscribe();

        assert!(!connectivity.set_online(true));
        assert!(!receiver.has_changed().unwrap());

        assert!(connectivity.set_online(false));
        assert!(receiver.has_changed().unwrap());
        assert!(!*receiver.borrow_and_update());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let connectivity = Connectivity::new();
        let other = connectivity.clone();
        other.set_online(false);
        assert!(!connectivity.is_online());
    }

    #[tokio::test]
    async fn probe_reports_reachable_server() {
        let mut server = mockito::Server::new_async().await;
        server.mock("HEAD", "/").with_status(204).create_async().await;

        let probe = ReachabilityProbe::new(
            server.url(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(probe.check().await);

        let unreachable = ReachabilityProbe::new(
            "http://127.0.0.1:9",
            Duration::from_secs(1),
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(!unreachable.check().await);
    }
}
