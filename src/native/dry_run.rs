//! Stand-in channels that log instead of touching hardware.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::BrightnessControl;
use super::NativeError;
use super::OverlayHost;
use super::RawDisplay;
use crate::domain::HardwareId;
use crate::domain::Rect;
use crate::domain::WindowHandle;

/// Brightness assumed for a monitor nobody has set yet.
const INITIAL_LEVEL: u8 = 100;

/// Brightness channel that remembers levels in memory.
#[derive(Debug, Default)]
pub struct DryRunBrightness {
    levels: Mutex<HashMap<HardwareId, u8>>,
}

impl DryRunBrightness {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrightnessControl for DryRunBrightness {
    async fn probe(&self, raw: &RawDisplay, id: &HardwareId) -> Result<bool, NativeError> {
        info!("[DRY RUN] Would probe DDC/CI on {} ({})", raw.device_name, id);
        Ok(true)
    }

    async fn brightness(&self, id: &HardwareId) -> Result<u8, NativeError> {
        Ok(self
            .levels
            .lock()
            .await
            .get(id)
            .copied()
            .unwrap_or(INITIAL_LEVEL))
    }

    async fn set_brightness(&self, id: &HardwareId, level: u8) -> Result<(), NativeError> {
        info!("[DRY RUN] Would set brightness of {} to {}", id, level);
        self.levels.lock().await.insert(id.clone(), level);
        Ok(())
    }
}

/// Overlay host that hands out handles without opening windows.
#[derive(Debug)]
pub struct DryRunOverlays {
    next: AtomicU64,
}

impl DryRunOverlays {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for DryRunOverlays {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayHost for DryRunOverlays {
    async fn create(&self, device_name: &str) -> Result<WindowHandle, NativeError> {
        let handle = WindowHandle(self.next.fetch_add(1, Ordering::Relaxed));
        info!("[DRY RUN] Would cover {} with overlay {}", device_name, handle);
        Ok(handle)
    }

    async fn scale_factor(&self, _window: WindowHandle) -> Result<f64, NativeError> {
        Ok(1.0)
    }

    async fn place(&self, window: WindowHandle, bounds: Rect) -> Result<(), NativeError> {
        info!("[DRY RUN] Would place overlay {} at {}", window, bounds);
        Ok(())
    }

    async fn destroy(&self, window: WindowHandle) -> Result<(), NativeError> {
        info!("[DRY RUN] Would close overlay {}", window);
        Ok(())
    }
}
