//! Topology polling and change detection.
//!
//! Every tick re-enumerates displays and compares the device-name set with
//! the last known one. Only a genuine change pays for enrichment and
//! publishes [`BusEvent::MonitorsChanged`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::domain::MonitorInfo;
use crate::events::BusEvent;
use crate::events::EventBus;
use crate::native::NativeError;
use crate::topology::TopologyProvider;
use crate::topology::same_device_names;

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Polling,
}

/// Everything guarded by the watcher lock.
#[derive(Debug)]
struct WatcherInner {
    state: WatcherState,
    last_known: Vec<MonitorInfo>,
    cancel: Option<CancellationToken>,
}

/// Polls the topology provider and reports monitor set changes.
pub struct TopologyWatcher {
    provider: TopologyProvider,
    bus: EventBus,
    interval: Duration,
    inner: Arc<Mutex<WatcherInner>>,
}

impl TopologyWatcher {
    pub fn new(provider: TopologyProvider, bus: EventBus, interval: Duration) -> Self {
        Self {
            provider,
            bus,
            interval,
            inner: Arc::new(Mutex::new(WatcherInner {
                state: WatcherState::Stopped,
                last_known: Vec::new(),
                cancel: None,
            })),
        }
    }

    /// Discover once, seed the last known set and begin polling.
    ///
    /// Returns the enriched monitors. Calling this while already polling
    /// returns the last known set without discovering or publishing again.
    pub async fn start(&self) -> Result<Vec<MonitorInfo>, NativeError> {
        let mut inner = self.inner.lock().await;
        if inner.state == WatcherState::Polling {
            debug!("Topology watcher already polling");
            return Ok(inner.last_known.clone());
        }

        let monitors = self.provider.monitors().await?;
        inner.last_known = monitors.clone();
        inner.state = WatcherState::Polling;

        let token = CancellationToken::new();
        inner.cancel = Some(token.clone());

        let provider = self.provider.clone();
        let bus = self.bus.clone();
        let shared = self.inner.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => tick(&provider, &bus, &shared).await,
                }
            }
            debug!("Topology polling task exited");
        });

        info!(
            "Topology watcher started with {} monitors, polling every {:?}",
            monitors.len(),
            self.interval
        );
        Ok(monitors)
    }

    /// Halt polling. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == WatcherState::Stopped {
            return;
        }
        inner.state = WatcherState::Stopped;
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        info!("Topology watcher stopped");
    }

    pub async fn state(&self) -> WatcherState {
        self.inner.lock().await.state
    }

    /// The most recent enriched monitor set.
    pub async fn last_known(&self) -> Vec<MonitorInfo> {
        self.inner.lock().await.last_known.clone()
    }
}

/// One polling tick, run under the watcher lock.
async fn tick(provider: &TopologyProvider, bus: &EventBus, inner: &Mutex<WatcherInner>) {
    let mut inner = inner.lock().await;
    if inner.state != WatcherState::Polling {
        return;
    }

    let current = match provider.discover().await {
        Ok(displays) => displays,
        Err(e) => {
            warn!("Topology poll failed: {}", e);
            return;
        }
    };

    if same_device_names(&current, &inner.last_known) {
        trace!("Monitor set unchanged ({} displays)", current.len());
        return;
    }

    let monitors = provider.enrich(current).await;
    info!(
        "Monitor set changed: {} -> {} displays",
        inner.last_known.len(),
        monitors.len()
    );
    inner.last_known = monitors.clone();
    bus.publish(BusEvent::MonitorsChanged(monitors));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Rect;
    use crate::native::fake::FakeBrightness;
    use crate::native::fake::FakeDisplays;
    use crate::native::fake::raw;

    fn setup() -> (Arc<FakeDisplays>, EventBus, TopologyWatcher) {
        let displays = Arc::new(FakeDisplays::new(vec![
            raw("DP-1", "S1", Rect::new(0, 0, 2560, 1440)),
            raw("DP-2", "S2", Rect::new(2560, 0, 2560, 1440)),
        ]));
        let provider =
            TopologyProvider::new(displays.clone(), Arc::new(FakeBrightness::default()));
        let bus = EventBus::default();
        let watcher = TopologyWatcher::new(provider, bus.clone(), DEFAULT_POLL_INTERVAL);
        (displays, bus, watcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (displays, bus, watcher) = setup();
        let mut sub = bus.subscribe();

        let first = watcher.start().await.unwrap();
        let second = watcher.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*displays.calls.lock().unwrap(), 1);
        assert_eq!(watcher.state().await, WatcherState::Polling);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(sub.try_recv().is_none());
        // One discovery on start plus two ticks.
        assert_eq!(*displays.calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_change_is_not_a_topology_change() {
        let (displays, bus, watcher) = setup();
        let mut sub = bus.subscribe();
        watcher.start().await.unwrap();

        displays.set(vec![
            raw("DP-1", "S1", Rect::new(0, 0, 3840, 2160)),
            raw("DP-2", "S2", Rect::new(3840, 0, 1920, 1080)),
        ]);
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_added_display_publishes_enriched_set() {
        let (displays, bus, watcher) = setup();
        let mut sub = bus.subscribe();
        watcher.start().await.unwrap();

        displays.set(vec![
            raw("DP-1", "S1", Rect::new(0, 0, 2560, 1440)),
            raw("DP-2", "S2", Rect::new(2560, 0, 2560, 1440)),
            raw("HDMI-A-1", "S3", Rect::new(5120, 0, 1920, 1080)),
        ]);
        tokio::time::sleep(Duration::from_millis(2100)).await;

        let Some(BusEvent::MonitorsChanged(monitors)) = sub.try_recv() else {
            panic!("expected MonitorsChanged");
        };
        assert_eq!(monitors.len(), 3);
        assert_eq!(monitors[2].hardware_id.as_str(), "Acme_Panel#S3");
        assert!(monitors[2].ddc_ci);
        assert_eq!(watcher.last_known().await, monitors);

        // The new set is now the baseline.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_polling() {
        let (displays, bus, watcher) = setup();
        let mut sub = bus.subscribe();
        watcher.start().await.unwrap();

        watcher.stop().await;
        watcher.stop().await;
        assert_eq!(watcher.state().await, WatcherState::Stopped);

        displays.set(vec![raw("DP-1", "S1", Rect::new(0, 0, 2560, 1440))]);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(sub.try_recv().is_none());
        assert_eq!(*displays.calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_polling() {
        let (displays, bus, watcher) = setup();
        let mut sub = bus.subscribe();
        watcher.start().await.unwrap();

        *displays.fail.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(sub.try_recv().is_none());

        *displays.fail.lock().unwrap() = false;
        displays.set(vec![raw("DP-1", "S1", Rect::new(0, 0, 2560, 1440))]);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(matches!(
            sub.try_recv(),
            Some(BusEvent::MonitorsChanged(m)) if m.len() == 1
        ));
    }
}
