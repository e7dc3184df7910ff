//! Native display, brightness and overlay channels.
//!
//! The rest of the crate only depends on the traits defined here; concrete
//! backends live in submodules.

pub mod ddcutil;
pub mod dry_run;
pub mod hyprland;
pub mod idle_notify;
pub mod layer_shell;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::domain::HardwareId;
use crate::domain::Point;
use crate::domain::Rect;
use crate::domain::WindowHandle;

/// A display as reported by basic enumeration, before capability probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDisplay {
    /// Compositor-assigned device name (e.g. `DP-1`).
    pub device_name: String,

    /// Bounds in virtual-screen coordinates (physical pixels).
    pub bounds: Rect,

    /// Panel description (make and model).
    pub device_string: String,

    /// Adapter-side identity (serial number where the panel reports one).
    pub adapter_string: String,
}

/// The window that currently holds input focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundWindow {
    pub handle: WindowHandle,
    pub bounds: Rect,
}

/// One reading of every activity signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySample {
    /// Pointer position, if known.
    pub pointer: Option<Point>,

    /// Focused window, if any.
    pub foreground: Option<ForegroundWindow>,

    /// When the last system-wide input event happened, if known.
    pub last_input: Option<Instant>,
}

/// Errors that can occur talking to native display facilities.
#[derive(Error, Debug)]
pub enum NativeError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Socket path not found: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No brightness channel for monitor {0}")]
    UnknownMonitor(HardwareId),

    #[error("No overlay window with handle {0}")]
    UnknownWindow(WindowHandle),

    #[error("No output named {0}")]
    UnknownOutput(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Basic display enumeration.
#[async_trait]
pub trait DisplaySource: Send + Sync {
    /// Enumerate connected displays in a stable order.
    async fn enumerate(&self) -> Result<Vec<RawDisplay>, NativeError>;
}

/// Hardware brightness control channel.
#[async_trait]
pub trait BrightnessControl: Send + Sync {
    /// Check whether `raw` accepts brightness commands and remember how
    /// to reach it under `id`.
    async fn probe(&self, raw: &RawDisplay, id: &HardwareId) -> Result<bool, NativeError>;

    /// Current brightness (0-100).
    async fn brightness(&self, id: &HardwareId) -> Result<u8, NativeError>;

    /// Set brightness (0-100). Setting the same value twice is harmless.
    async fn set_brightness(&self, id: &HardwareId, level: u8) -> Result<(), NativeError>;
}

/// Host for top-most, input-inert, non-activating cover windows.
#[async_trait]
pub trait OverlayHost: Send + Sync {
    /// Create an opaque cover window on the named output and return its handle.
    async fn create(&self, device_name: &str) -> Result<WindowHandle, NativeError>;

    /// Device scale factor of the surface actually hosting `window`.
    async fn scale_factor(&self, window: WindowHandle) -> Result<f64, NativeError>;

    /// Size and position `window` in its own (logical) coordinate space.
    async fn place(&self, window: WindowHandle, bounds: Rect) -> Result<(), NativeError>;

    /// Close `window`.
    async fn destroy(&self, window: WindowHandle) -> Result<(), NativeError>;
}

/// Source of pointer, focus and input signals.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Read every signal once.
    async fn sample(&self) -> Result<ActivitySample, NativeError>;
}
