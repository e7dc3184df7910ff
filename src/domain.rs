//! Domain types shared by topology, idle detection and actuation.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Sentinel display number for device names without trailing digits.
pub const UNKNOWN_DISPLAY_NUMBER: i32 = -1;

/// Stable monitor identity (newtype for type safety).
///
/// Derived from the panel's device and adapter strings, never from the
/// connector name, which the compositor may hand to another panel on hot-plug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(String);

impl HardwareId {
    /// Create a new hardware id.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the id from device and adapter strings.
    ///
    /// Whitespace runs collapse to `_` so the id stays usable as a config key.
    pub fn from_parts(device: &str, adapter: &str) -> Self {
        let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join("_");
        let device = squash(device);
        let adapter = squash(adapter);

        if adapter.is_empty() {
            Self(device)
        } else {
            Self(format!("{device}#{adapter}"))
        }
    }

    /// Get the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HardwareId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A point in virtual-screen coordinates (physical pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in virtual-screen coordinates (physical pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Half-open containment: the right and bottom edges belong to the neighbour.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    /// Area shared with another rectangle, zero when they do not overlap.
    pub fn overlap_area(&self, other: &Rect) -> i64 {
        let w = (self.right().min(other.right()) - self.x.max(other.x)).max(0);
        let h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0);
        i64::from(w) * i64::from(h)
    }

    /// Convert physical pixels to the logical coordinate space of a surface
    /// rendered at `scale`. The size rounds up so the cover never falls short.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_logical(&self, scale: f64) -> Rect {
        if scale <= 0.0 || (scale - 1.0).abs() < f64::EPSILON {
            return *self;
        }
        Rect {
            x: (f64::from(self.x) / scale).floor() as i32,
            y: (f64::from(self.y) / scale).floor() as i32,
            width: (f64::from(self.width) / scale).ceil() as i32,
            height: (f64::from(self.height) / scale).ceil() as i32,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} @ ({},{})", self.width, self.height, self.x, self.y)
    }
}

/// Native window handle. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WindowHandle(pub u64);

impl WindowHandle {
    pub const NULL: WindowHandle = WindowHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical display record, fully enriched.
///
/// Immutable once built; every enumeration supersedes the previous list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    /// Compositor-assigned device name (e.g. `DP-1`).
    pub device_name: String,

    /// Ordinal parsed from the device name, or [`UNKNOWN_DISPLAY_NUMBER`].
    pub display_number: i32,

    /// Bounds in virtual-screen coordinates.
    pub bounds: Rect,

    /// Whether the panel answers DDC/CI brightness commands.
    pub ddc_ci: bool,

    /// Stable identity across reboots and hot-plugs.
    pub hardware_id: HardwareId,
}

/// Why an idle/active transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityReason {
    PointerOnMonitor,
    ForegroundWindowOnMonitor,
    RecentInput,
    NoSignal,
}

impl ActivityReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PointerOnMonitor => "pointer on monitor",
            Self::ForegroundWindowOnMonitor => "foreground window on monitor",
            Self::RecentInput => "recent input",
            Self::NoSignal => "no signal",
        }
    }
}

/// Soft per-monitor activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    #[default]
    Active,
    Idle,
}

/// Parse the display ordinal from a device name's trailing digits.
///
/// `\\.\DISPLAY2` and `HDMI-A-2` both yield 2. Names without trailing digits
/// (or with an ordinal that overflows) map to [`UNKNOWN_DISPLAY_NUMBER`].
pub fn parse_display_number(device_name: &str) -> i32 {
    let trimmed = device_name.trim_end_matches('\0').trim_end();
    let digits_start = trimmed
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);

    match digits_start {
        Some(start) => trimmed[start..]
            .parse()
            .unwrap_or(UNKNOWN_DISPLAY_NUMBER),
        None => UNKNOWN_DISPLAY_NUMBER,
    }
}
