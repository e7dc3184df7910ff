//! Hardware topology discovery.
//!
//! Discovery is split in two: `discover` is the cheap enumeration, `enrich`
//! resolves hardware ids and probes brightness capability. The watcher only
//! pays for enrichment when the set of displays actually changed.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::domain::HardwareId;
use crate::domain::MonitorInfo;
use crate::domain::parse_display_number;
use crate::native::BrightnessControl;
use crate::native::DisplaySource;
use crate::native::NativeError;
use crate::native::RawDisplay;

/// Answers on-demand topology queries, independent of any polling cadence.
#[derive(Clone)]
pub struct TopologyProvider {
    displays: Arc<dyn DisplaySource>,
    brightness: Arc<dyn BrightnessControl>,
}

impl TopologyProvider {
    pub fn new(displays: Arc<dyn DisplaySource>, brightness: Arc<dyn BrightnessControl>) -> Self {
        Self {
            displays,
            brightness,
        }
    }

    /// Basic enumeration, in the order the display layer reports.
    pub async fn discover(&self) -> Result<Vec<RawDisplay>, NativeError> {
        let displays = self.displays.enumerate().await?;
        trace!("Enumerated {} displays", displays.len());
        Ok(displays)
    }

    /// Resolve hardware ids and brightness capability.
    ///
    /// Every input display yields exactly one record; a failed probe only
    /// marks that display as lacking DDC/CI.
    pub async fn enrich(&self, displays: Vec<RawDisplay>) -> Vec<MonitorInfo> {
        let mut seen: HashMap<HardwareId, usize> = HashMap::new();
        let mut monitors = Vec::with_capacity(displays.len());

        for raw in displays {
            let base = HardwareId::from_parts(&raw.device_string, &raw.adapter_string);
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            // Identical panels without serials would otherwise share one id.
            let hardware_id = if *count == 1 {
                base
            } else {
                HardwareId::new(format!("{base}#{count}"))
            };

            let ddc_ci = match self.brightness.probe(&raw, &hardware_id).await {
                Ok(supported) => supported,
                Err(e) => {
                    warn!(
                        "Capability probe failed for {} ({}): {}",
                        raw.device_name, hardware_id, e
                    );
                    false
                }
            };

            debug!(
                "{} is {} (DDC/CI: {})",
                raw.device_name, hardware_id, ddc_ci
            );

            monitors.push(MonitorInfo {
                display_number: parse_display_number(&raw.device_name),
                device_name: raw.device_name,
                bounds: raw.bounds,
                ddc_ci,
                hardware_id,
            });
        }

        monitors
    }

    /// `discover` followed by `enrich`.
    pub async fn monitors(&self) -> Result<Vec<MonitorInfo>, NativeError> {
        let displays = self.discover().await?;
        Ok(self.enrich(displays).await)
    }
}

/// Whether two snapshots name the same displays (same count, same name set).
///
/// Bounds and ordinals are ignored on purpose.
pub fn same_device_names(current: &[RawDisplay], known: &[MonitorInfo]) -> bool {
    if current.len() != known.len() {
        return false;
    }
    let current: HashSet<&str> = current.iter().map(|d| d.device_name.as_str()).collect();
    let known: HashSet<&str> = known.iter().map(|m| m.device_name.as_str()).collect();
    current == known
}
