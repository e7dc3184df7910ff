//! DDC/CI brightness control through `ddcutil`.
//!
//! Displays are matched to I2C buses by the DRM connector name that
//! `ddcutil detect` reports, which is the same name the compositor uses.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use super::BrightnessControl;
use super::NativeError;
use super::RawDisplay;
use crate::domain::HardwareId;

/// VCP feature code for luminance.
const VCP_BRIGHTNESS: &str = "10";

/// How long one `ddcutil detect` result is reused across probes.
const DETECT_TTL: Duration = Duration::from_secs(10);

static RE_DISPLAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Display\s+\d+|Invalid display)").expect("valid regex"));
static RE_BUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"I2C bus:\s*/dev/i2c-(\d+)").expect("valid regex"));
static RE_CONNECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"DRM[_ ]connector:\s*card\d+-(\S+)").expect("valid regex"));
static RE_CURRENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"current value\s*=\s*(\d+),\s*max value\s*=\s*(\d+)").expect("valid regex")
});

/// One entry of `ddcutil detect --terse`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DetectedDisplay {
    bus: u8,
    connector: Option<String>,
    valid: bool,
}

/// Brightness channel backed by the `ddcutil` CLI.
pub struct DdcutilControl {
    /// I2C bus per probed monitor.
    buses: RwLock<HashMap<HardwareId, u8>>,

    /// Maximum raw VCP value per I2C bus, learned from `getvcp`.
    max_values: RwLock<HashMap<u8, u32>>,

    /// Last detection result and when it was taken.
    detected: Mutex<Option<(Instant, Vec<DetectedDisplay>)>>,
}

impl DdcutilControl {
    pub fn new() -> Self {
        Self {
            buses: RwLock::new(HashMap::new()),
            max_values: RwLock::new(HashMap::new()),
            detected: Mutex::new(None),
        }
    }

    /// Run (or reuse) `ddcutil detect`.
    async fn detect(&self) -> Result<Vec<DetectedDisplay>, NativeError> {
        let mut cached = self.detected.lock().await;
        if let Some((at, displays)) = cached.as_ref()
            && at.elapsed() < DETECT_TTL
        {
            trace!("Reusing ddcutil detection from {:?} ago", at.elapsed());
            return Ok(displays.clone());
        }

        let stdout = run_ddcutil(&["detect", "--terse"]).await?;
        let displays = parse_detect(&stdout);
        debug!("ddcutil detected {} displays", displays.len());

        *cached = Some((Instant::now(), displays.clone()));
        Ok(displays)
    }

    /// Read the raw (current, max) pair and remember the maximum.
    async fn read_raw(&self, bus: u8) -> Result<(u32, u32), NativeError> {
        let bus_arg = bus.to_string();
        let stdout = run_ddcutil(&["getvcp", VCP_BRIGHTNESS, "--bus", &bus_arg]).await?;
        let (current, max) = parse_getvcp(&stdout)?;
        self.max_values.write().await.insert(bus, max);
        Ok((current, max))
    }

    async fn bus_for(&self, id: &HardwareId) -> Result<u8, NativeError> {
        self.buses
            .read()
            .await
            .get(id)
            .copied()
            .ok_or_else(|| NativeError::UnknownMonitor(id.clone()))
    }
}

impl Default for DdcutilControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrightnessControl for DdcutilControl {
    async fn probe(&self, raw: &RawDisplay, id: &HardwareId) -> Result<bool, NativeError> {
        let detected = self.detect().await?;

        let found = detected
            .iter()
            .find(|d| d.connector.as_deref() == Some(raw.device_name.as_str()));

        match found {
            Some(d) if d.valid => {
                debug!("{} ({}) is on I2C bus {}", raw.device_name, id, d.bus);
                self.buses.write().await.insert(id.clone(), d.bus);
                Ok(true)
            }
            _ => {
                self.buses.write().await.remove(id);
                Ok(false)
            }
        }
    }

    async fn brightness(&self, id: &HardwareId) -> Result<u8, NativeError> {
        let bus = self.bus_for(id).await?;
        let (current, max) = self.read_raw(bus).await?;
        Ok(to_percent(current, max))
    }

    async fn set_brightness(&self, id: &HardwareId, level: u8) -> Result<(), NativeError> {
        let bus = self.bus_for(id).await?;
        let cached_max = self.max_values.read().await.get(&bus).copied();
        let max = match cached_max {
            Some(max) => max,
            None => self.read_raw(bus).await?.1,
        };

        let raw = from_percent(level, max).to_string();
        let bus = bus.to_string();
        run_ddcutil(&["setvcp", VCP_BRIGHTNESS, &raw, "--bus", &bus]).await?;
        Ok(())
    }
}

/// Run ddcutil and return its stdout.
async fn run_ddcutil(args: &[&str]) -> Result<String, NativeError> {
    trace!("Running ddcutil {}", args.join(" "));

    let out = Command::new("ddcutil")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| NativeError::Command(format!("failed to run ddcutil: {e}")))?;

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(NativeError::Command(format!(
            "ddcutil {} exited with {:?}: {}",
            args.first().unwrap_or(&""),
            out.status.code(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Parse `ddcutil detect --terse` output.
fn parse_detect(output: &str) -> Vec<DetectedDisplay> {
    let mut displays = Vec::new();
    let mut current: Option<DetectedDisplay> = None;

    for line in output.lines() {
        if let Some(c) = RE_DISPLAY.captures(line) {
            if let Some(d) = current.take() {
                displays.push(d);
            }
            current = Some(DetectedDisplay {
                bus: 0,
                connector: None,
                valid: c[1].starts_with("Display"),
            });
            continue;
        }

        let Some(ref mut d) = current else {
            continue;
        };
        if let Some(c) = RE_BUS.captures(line) {
            d.bus = c[1].parse().unwrap_or(0);
        } else if let Some(c) = RE_CONNECTOR.captures(line) {
            d.connector = Some(c[1].to_string());
        }
    }

    if let Some(d) = current.take() {
        displays.push(d);
    }
    displays
}

/// Parse `getvcp 10` output into raw (current, max) values.
fn parse_getvcp(output: &str) -> Result<(u32, u32), NativeError> {
    let caps = RE_CURRENT
        .captures(output)
        .ok_or_else(|| NativeError::Parse(format!("unexpected getvcp output: {}", output.trim())))?;

    let current: u32 = caps[1]
        .parse()
        .map_err(|_| NativeError::Parse(format!("bad current value: {}", &caps[1])))?;
    let max: u32 = caps[2]
        .parse()
        .map_err(|_| NativeError::Parse(format!("bad max value: {}", &caps[2])))?;

    if max == 0 {
        return Err(NativeError::Parse("max value is zero".to_string()));
    }

    Ok((current.min(max), max))
}

fn to_percent(raw: u32, max: u32) -> u8 {
    let percent = (raw.min(max) * 100 + max / 2) / max.max(1);
    u8::try_from(percent).unwrap_or(100)
}

fn from_percent(level: u8, max: u32) -> u32 {
    (u32::from(level.min(100)) * max + 50) / 100
}
