//! Blackout overlay lifecycle.
//!
//! The registry maps each live overlay's native handle to its record, so
//! "is this window ours" is a single lookup and the per-monitor view is
//! derived from the same map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ActuationError;
use super::KeyedLocks;
use crate::domain::HardwareId;
use crate::domain::Rect;
use crate::domain::WindowHandle;
use crate::native::NativeError;
use crate::native::OverlayHost;

/// A live overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRecord {
    pub hardware_id: HardwareId,
    pub device_name: String,
    /// Requested bounds in physical pixels.
    pub bounds: Rect,
    /// Bounds actually applied in the window's own coordinates, once placed.
    pub placed: Option<Rect>,
}

/// Shows and hides black cover windows.
pub struct BlackoutService {
    host: Arc<dyn OverlayHost>,
    registry: RwLock<HashMap<WindowHandle, OverlayRecord>>,
    locks: KeyedLocks,
}

impl BlackoutService {
    pub fn new(host: Arc<dyn OverlayHost>) -> Self {
        Self {
            host,
            registry: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Cover `id` with an overlay matching `bounds`. No-op if already shown.
    pub async fn show(
        &self,
        id: &HardwareId,
        device_name: &str,
        bounds: Rect,
    ) -> Result<(), ActuationError> {
        let _guard = self.locks.lock(id).await;

        if let Some(window) = self.handle_for(id) {
            debug!("Blackout already shown on {} ({})", id, window);
            return Ok(());
        }

        let window = self
            .host
            .create(device_name)
            .await
            .map_err(ActuationError::hardware(id, "create overlay"))?;

        // Tracked before placement so the window is recognised while it maps.
        self.write().insert(
            window,
            OverlayRecord {
                hardware_id: id.clone(),
                device_name: device_name.to_string(),
                bounds,
                placed: None,
            },
        );

        match self.place(window, bounds).await {
            Ok(placed) => {
                if let Some(record) = self.write().get_mut(&window) {
                    record.placed = Some(placed);
                }
                info!("Blackout shown on {} ({}) at {}", id, window, placed);
                Ok(())
            }
            Err(e) => {
                // A half-initialised overlay is worse than none.
                self.write().remove(&window);
                if let Err(destroy) = self.host.destroy(window).await {
                    warn!("Failed to close overlay {} after error: {}", window, destroy);
                }
                Err(ActuationError::hardware(id, "place overlay")(e))
            }
        }
    }

    /// Remove the overlay covering `id`, if any.
    pub async fn hide(&self, id: &HardwareId) -> Result<(), ActuationError> {
        let _guard = self.locks.lock(id).await;

        // Untrack first so a closing window is never reported as ours.
        let window = {
            let mut registry = self.write();
            let window = registry
                .iter()
                .find(|(_, record)| &record.hardware_id == id)
                .map(|(window, _)| *window);
            if let Some(window) = window {
                registry.remove(&window);
            }
            window
        };

        let Some(window) = window else {
            debug!("No blackout on {}", id);
            return Ok(());
        };

        self.host
            .destroy(window)
            .await
            .map_err(ActuationError::hardware(id, "close overlay"))?;
        info!("Blackout hidden on {} ({})", id, window);
        Ok(())
    }

    /// Hide every overlay. Returns how many were closed cleanly.
    pub async fn hide_all(&self) -> usize {
        let mut closed = 0;
        for id in self.shown() {
            match self.hide(&id).await {
                Ok(()) => closed += 1,
                Err(e) => warn!("{}", e),
            }
        }
        closed
    }

    /// Whether `window` is one of our overlays. The null handle never is.
    pub fn is_overlay_window(&self, window: WindowHandle) -> bool {
        !window.is_null() && self.read().contains_key(&window)
    }

    pub fn handle_for(&self, id: &HardwareId) -> Option<WindowHandle> {
        self.read()
            .iter()
            .find(|(_, record)| &record.hardware_id == id)
            .map(|(window, _)| *window)
    }

    /// Monitors currently covered.
    pub fn shown(&self) -> Vec<HardwareId> {
        let mut ids: Vec<HardwareId> = self
            .read()
            .values()
            .map(|record| record.hardware_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn record(&self, window: WindowHandle) -> Option<OverlayRecord> {
        self.read().get(&window).cloned()
    }

    async fn place(&self, window: WindowHandle, bounds: Rect) -> Result<Rect, NativeError> {
        let scale = self.host.scale_factor(window).await?;
        let logical = bounds.to_logical(scale);
        self.host.place(window, logical).await?;
        Ok(logical)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<WindowHandle, OverlayRecord>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<WindowHandle, OverlayRecord>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::fake::FakeOverlays;
    use crate::native::fake::OverlayCall;

    fn id(s: &str) -> HardwareId {
        HardwareId::new(s)
    }

    #[tokio::test]
    async fn test_show_twice_tracks_one_overlay() {
        let host = Arc::new(FakeOverlays::new(1.0));
        let service = BlackoutService::new(host.clone());
        let bounds = Rect::new(0, 0, 1920, 1080);

        service.show(&id("A"), "DP-1", bounds).await.unwrap();
        service.show(&id("A"), "DP-1", bounds).await.unwrap();

        assert_eq!(host.live_count(), 1);
        assert_eq!(service.shown(), vec![id("A")]);
        let creates = host
            .calls()
            .iter()
            .filter(|c| matches!(c, OverlayCall::Create(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_hide_untracks_handle() {
        let host = Arc::new(FakeOverlays::new(1.0));
        let service = BlackoutService::new(host.clone());

        service
            .show(&id("A"), "DP-1", Rect::new(0, 0, 1920, 1080))
            .await
            .unwrap();
        let window = service.handle_for(&id("A")).unwrap();
        assert!(service.is_overlay_window(window));

        service.hide(&id("A")).await.unwrap();
        assert!(!service.is_overlay_window(window));
        assert!(service.handle_for(&id("A")).is_none());
        assert_eq!(host.live_count(), 0);
    }

    #[tokio::test]
    async fn test_null_handle_is_never_an_overlay() {
        let service = BlackoutService::new(Arc::new(FakeOverlays::new(1.0)));
        assert!(!service.is_overlay_window(WindowHandle::NULL));
    }

    #[tokio::test]
    async fn test_bounds_are_scaled_by_window_scale() {
        let host = Arc::new(FakeOverlays::new(2.0));
        let service = BlackoutService::new(host.clone());

        service
            .show(&id("B"), "DP-2", Rect::new(3840, 0, 3840, 2160))
            .await
            .unwrap();
        let window = service.handle_for(&id("B")).unwrap();

        assert_eq!(
            host.calls(),
            vec![
                OverlayCall::Create("DP-2".to_string()),
                OverlayCall::Scale(window),
                OverlayCall::Place(window, Rect::new(1920, 0, 1920, 1080)),
            ]
        );
        assert_eq!(
            service.record(window).unwrap().placed,
            Some(Rect::new(1920, 0, 1920, 1080))
        );
    }

    #[tokio::test]
    async fn test_failed_placement_rolls_back() {
        let host = Arc::new(FakeOverlays::new(1.0));
        *host.fail_place.lock().unwrap() = true;
        let service = BlackoutService::new(host.clone());

        let err = service
            .show(&id("A"), "DP-1", Rect::new(0, 0, 1920, 1080))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(service.shown().is_empty());
        assert_eq!(host.live_count(), 0);
        assert!(matches!(host.calls().last(), Some(OverlayCall::Destroy(_))));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_tracked() {
        let host = Arc::new(FakeOverlays::new(1.0));
        *host.fail_create.lock().unwrap() = true;
        let service = BlackoutService::new(host.clone());

        assert!(service
            .show(&id("A"), "DP-9", Rect::new(0, 0, 1920, 1080))
            .await
            .is_err());
        assert!(service.shown().is_empty());
    }

    #[tokio::test]
    async fn test_hide_without_overlay_is_noop() {
        let host = Arc::new(FakeOverlays::new(1.0));
        let service = BlackoutService::new(host.clone());
        service.hide(&id("A")).await.unwrap();
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_hide_all() {
        let host = Arc::new(FakeOverlays::new(1.0));
        let service = BlackoutService::new(host.clone());
        service
            .show(&id("A"), "DP-1", Rect::new(0, 0, 1920, 1080))
            .await
            .unwrap();
        service
            .show(&id("B"), "DP-2", Rect::new(1920, 0, 1920, 1080))
            .await
            .unwrap();

        assert_eq!(service.hide_all().await, 2);
        assert!(service.shown().is_empty());
        assert_eq!(host.live_count(), 0);
    }
}
