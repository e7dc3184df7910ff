//! Hyprland IPC display and activity backend.
//!
//! Sends JSON requests (`j/monitors`, `j/activewindow`, `j/cursorpos`) over
//! Hyprland's request socket. Hyprland reports positions in layout
//! (logical) coordinates. They are mapped into one physical-pixel virtual
//! screen: layout origins are multiplied by the largest monitor scale, and
//! each monitor keeps its physical mode size from there. Monitors that do not
//! overlap in the layout cannot overlap in that space.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::trace;

use super::ActivitySample;
use super::ActivitySource;
use super::DisplaySource;
use super::ForegroundWindow;
use super::NativeError;
use super::RawDisplay;
use super::idle_notify::InputIdleWatch;
use crate::domain::Point;
use crate::domain::Rect;
use crate::domain::WindowHandle;

/// Monitor as reported by `j/monitors`.
#[derive(Debug, Clone, Deserialize)]
struct HyprMonitor {
    name: String,
    #[serde(default)]
    make: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    serial: String,
    width: i32,
    height: i32,
    x: i32,
    y: i32,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    disabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

/// Window as reported by `j/activewindow`. Empty object when nothing has focus.
#[derive(Debug, Clone, Default, Deserialize)]
struct HyprWindow {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    at: Option<[i32; 2]>,
    #[serde(default)]
    size: Option<[i32; 2]>,
}

/// Cursor position as reported by `j/cursorpos`.
#[derive(Debug, Clone, Copy, Deserialize)]
struct HyprCursor {
    x: i32,
    y: i32,
}

/// Hyprland request-socket client.
pub struct HyprlandIpc {
    socket_path: PathBuf,
}

impl HyprlandIpc {
    /// Locate the request socket of the running Hyprland instance.
    pub fn from_env() -> Result<Self, NativeError> {
        Ok(Self {
            socket_path: get_socket_path()?,
        })
    }

    /// Get diagnostic information about the Hyprland environment.
    pub fn get_diagnostics() -> Vec<String> {
        let mut diags = Vec::new();

        match env::var("XDG_RUNTIME_DIR") {
            Ok(v) => diags.push(format!("XDG_RUNTIME_DIR={v}")),
            Err(_) => diags.push("XDG_RUNTIME_DIR: NOT SET".to_string()),
        }

        match env::var("HYPRLAND_INSTANCE_SIGNATURE") {
            Ok(v) => diags.push(format!("HYPRLAND_INSTANCE_SIGNATURE={v}")),
            Err(_) => diags.push("HYPRLAND_INSTANCE_SIGNATURE: NOT SET".to_string()),
        }

        if let Ok(path) = get_socket_path() {
            diags.push(format!("Socket path: {} (exists)", path.display()));
        } else {
            diags.push("Socket path: NOT FOUND".to_string());
        }

        diags
    }

    /// Send one request and read the whole reply.
    async fn request(&self, command: &str) -> Result<String, NativeError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| NativeError::ConnectionFailed(e.to_string()))?;

        stream.write_all(command.as_bytes()).await?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        trace!("Hyprland {} -> {} bytes", command, reply.len());
        Ok(reply)
    }

    async fn monitors(&self) -> Result<Vec<HyprMonitor>, NativeError> {
        let reply = self.request("j/monitors").await?;
        parse_json(&reply)
    }
}

#[async_trait]
impl DisplaySource for HyprlandIpc {
    async fn enumerate(&self) -> Result<Vec<RawDisplay>, NativeError> {
        let monitors = self.monitors().await?;
        Ok(to_raw_displays(&monitors))
    }
}

/// Activity signals from Hyprland plus, when available, Wayland idle
/// notifications for the last-input time.
pub struct HyprlandActivity {
    ipc: Arc<HyprlandIpc>,
    input: Option<InputIdleWatch>,
}

impl HyprlandActivity {
    pub fn new(ipc: Arc<HyprlandIpc>, input: Option<InputIdleWatch>) -> Self {
        Self { ipc, input }
    }
}

#[async_trait]
impl ActivitySource for HyprlandActivity {
    async fn sample(&self) -> Result<ActivitySample, NativeError> {
        let monitors = self.ipc.monitors().await?;
        let window: HyprWindow = parse_json(&self.ipc.request("j/activewindow").await?)?;
        let cursor: HyprCursor = parse_json(&self.ipc.request("j/cursorpos").await?)?;

        Ok(ActivitySample {
            pointer: Some(to_physical(Point::new(cursor.x, cursor.y), &monitors)),
            foreground: foreground_window(&window, &monitors),
            last_input: self.input.as_ref().and_then(InputIdleWatch::last_input),
        })
    }
}

/// Get the path to Hyprland's request socket.
fn get_socket_path() -> Result<PathBuf, NativeError> {
    let xdg_runtime_dir = env::var("XDG_RUNTIME_DIR")
        .map_err(|_| NativeError::EnvVarNotSet("XDG_RUNTIME_DIR".to_string()))?;

    let hyprland_sig = env::var("HYPRLAND_INSTANCE_SIGNATURE")
        .map_err(|_| NativeError::EnvVarNotSet("HYPRLAND_INSTANCE_SIGNATURE".to_string()))?;

    let socket_path = PathBuf::from(&xdg_runtime_dir)
        .join("hypr")
        .join(&hyprland_sig)
        .join(".socket.sock");

    if !socket_path.exists() {
        return Err(NativeError::SocketNotFound(format!(
            "{}",
            socket_path.display()
        )));
    }

    Ok(socket_path)
}

fn parse_json<T: serde::de::DeserializeOwned>(reply: &str) -> Result<T, NativeError> {
    serde_json::from_str(reply).map_err(|e| NativeError::Parse(format!("{e}: {}", reply.trim())))
}

fn to_raw_displays(monitors: &[HyprMonitor]) -> Vec<RawDisplay> {
    let space = virtual_scale(monitors);
    monitors
        .iter()
        .filter(|m| !m.disabled)
        .map(|m| RawDisplay {
            device_name: m.name.clone(),
            bounds: physical_bounds(m, space),
            device_string: format!("{} {}", m.make.trim(), m.model.trim())
                .trim()
                .to_string(),
            adapter_string: m.serial.trim().to_string(),
        })
        .collect()
}

/// Scale applied to layout origins: the largest enabled monitor scale.
fn virtual_scale(monitors: &[HyprMonitor]) -> f64 {
    monitors
        .iter()
        .filter(|m| !m.disabled)
        .map(|m| m.scale)
        .fold(1.0, f64::max)
}

/// Monitor bounds in the virtual screen: scaled layout origin, mode size as-is.
#[allow(clippy::cast_possible_truncation)]
fn physical_bounds(m: &HyprMonitor, space: f64) -> Rect {
    Rect::new(
        (f64::from(m.x) * space).round() as i32,
        (f64::from(m.y) * space).round() as i32,
        m.width,
        m.height,
    )
}

/// Map a layout-space point onto the physical bounds of the monitor holding it.
#[allow(clippy::cast_possible_truncation)]
fn to_physical(p: Point, monitors: &[HyprMonitor]) -> Point {
    let space = virtual_scale(monitors);
    for m in monitors.iter().filter(|m| !m.disabled) {
        let logical_w = (f64::from(m.width) / m.scale).round() as i32;
        let logical_h = (f64::from(m.height) / m.scale).round() as i32;
        if Rect::new(m.x, m.y, logical_w, logical_h).contains(p) {
            let origin = physical_bounds(m, space);
            return Point::new(
                origin.x + (f64::from(p.x - m.x) * m.scale).round() as i32,
                origin.y + (f64::from(p.y - m.y) * m.scale).round() as i32,
            );
        }
    }
    p
}

#[allow(clippy::cast_possible_truncation)]
fn foreground_window(window: &HyprWindow, monitors: &[HyprMonitor]) -> Option<ForegroundWindow> {
    let address = window.address.as_deref()?;
    let handle = parse_address(address)?;
    let [x, y] = window.at?;
    let [w, h] = window.size?;

    let top_left = to_physical(Point::new(x, y), monitors);
    let bottom_right = to_physical(Point::new(x + w - 1, y + h - 1), monitors);

    Some(ForegroundWindow {
        handle,
        bounds: Rect::new(
            top_left.x,
            top_left.y,
            bottom_right.x - top_left.x + 1,
            bottom_right.y - top_left.y + 1,
        ),
    })
}

/// Parse a window address like `0x55a1b2c3d4e5`.
fn parse_address(address: &str) -> Option<WindowHandle> {
    let hex = address.trim().trim_start_matches("0x");
    let value = u64::from_str_radix(hex, 16).ok()?;
    let handle = WindowHandle(value);
    (!handle.is_null()).then_some(handle)
}
