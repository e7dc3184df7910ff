//! Per-monitor idle decision engine.
//!
//! Each managed monitor carries a soft state (active or idle). A monitor goes
//! idle once its timeout passes without any activity signal pointing at it,
//! and becomes active on the first tick a signal reappears. Every transition
//! is offered to a [`TransitionHandler`], which may veto it.
//!
//! Signals per sample: the pointer moving inside a monitor, the focused
//! window sitting mostly on a monitor, and input since the previous sample.
//! Focus is a level signal, so a monitor showing the focused window never
//! idles.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::config::Config;
use crate::config::MonitorSettings;
use crate::domain::ActivityReason;
use crate::domain::HardwareId;
use crate::domain::IdleState;
use crate::domain::MonitorInfo;
use crate::domain::Point;
use crate::domain::Rect;
use crate::domain::WindowHandle;
use crate::events::BusEvent;
use crate::events::EventBus;
use crate::native::ActivitySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameIdle,
    BecameActive,
}

impl Transition {
    fn target(self) -> IdleState {
        match self {
            Self::BecameIdle => IdleState::Idle,
            Self::BecameActive => IdleState::Active,
        }
    }
}

/// Payload offered to the transition handler.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorIdleStateEvent {
    pub hardware_id: HardwareId,
    pub device_name: String,
    pub display_number: i32,
    pub bounds: Rect,
    pub ddc_ci: bool,
    pub settings: MonitorSettings,
    /// Focused window when the event was raised.
    pub foreground: Option<WindowHandle>,
    pub reason: ActivityReason,
    pub transition: Transition,
}

/// A handler's answer to a proposed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the engine commit the new state.
    Commit,
    /// The transition is spurious; keep the previous state.
    Veto,
}

/// The single consumer of proposed transitions.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn on_transition(&self, event: &MonitorIdleStateEvent) -> Verdict;
}

#[derive(Debug)]
struct TrackedMonitor {
    info: MonitorInfo,
    settings: MonitorSettings,
    state: IdleState,
    last_activity: Instant,
}

/// Idle state machine for every known monitor.
#[derive(Debug)]
pub struct IdleEngine {
    bus: EventBus,
    monitors: Vec<TrackedMonitor>,

    /// Baselines from the previous sample. `last_sample_at` is `None` until
    /// the first sample has been seen.
    last_pointer: Option<Point>,
    last_sample_at: Option<Instant>,
}

impl IdleEngine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            monitors: Vec::new(),
            last_pointer: None,
            last_sample_at: None,
        }
    }

    /// Replace the tracked monitor set.
    ///
    /// Monitors that stay keep their state; new ones start active at `now`.
    /// Returns the removed monitors that were idle, so their actuation can be
    /// released.
    pub fn set_monitors(
        &mut self,
        monitors: &[MonitorInfo],
        config: &Config,
        now: Instant,
    ) -> Vec<MonitorInfo> {
        let mut previous: HashMap<HardwareId, TrackedMonitor> = self
            .monitors
            .drain(..)
            .map(|m| (m.info.hardware_id.clone(), m))
            .collect();

        for info in monitors {
            let settings = config.settings_for(&info.hardware_id);
            let tracked = match previous.remove(&info.hardware_id) {
                Some(old) => TrackedMonitor {
                    info: info.clone(),
                    settings,
                    ..old
                },
                None => {
                    debug!(
                        "Tracking {} ({}), managed: {}",
                        info.device_name, info.hardware_id, settings.managed
                    );
                    TrackedMonitor {
                        info: info.clone(),
                        settings,
                        state: IdleState::Active,
                        last_activity: now,
                    }
                }
            };
            self.monitors.push(tracked);
        }

        previous
            .into_values()
            .filter(|m| m.state == IdleState::Idle)
            .map(|m| m.info)
            .collect()
    }

    pub fn state(&self, hardware_id: &HardwareId) -> Option<IdleState> {
        self.monitors
            .iter()
            .find(|m| &m.info.hardware_id == hardware_id)
            .map(|m| m.state)
    }

    /// Mark every monitor active without raising transitions.
    ///
    /// Used after actuation was lifted wholesale (restore-all).
    pub fn reset(&mut self, now: Instant) {
        for monitor in &mut self.monitors {
            monitor.state = IdleState::Active;
            monitor.last_activity = now;
        }
    }

    /// Evaluate one activity sample taken at `now`.
    pub async fn tick(
        &mut self,
        sample: &ActivitySample,
        now: Instant,
        handler: &dyn TransitionHandler,
    ) {
        let signals = self.attribute(sample);
        let foreground = sample.foreground.map(|f| f.handle);

        for monitor in &mut self.monitors {
            if !monitor.settings.managed {
                continue;
            }

            let proposal = match (signals.get(&monitor.info.hardware_id), monitor.state) {
                (Some(&reason), IdleState::Idle) => Some((Transition::BecameActive, reason)),
                (Some(_), IdleState::Active) => {
                    monitor.last_activity = now;
                    None
                }
                (None, IdleState::Active)
                    if now.saturating_duration_since(monitor.last_activity)
                        >= monitor.settings.idle_timeout =>
                {
                    Some((Transition::BecameIdle, ActivityReason::NoSignal))
                }
                (None, _) => None,
            };

            let Some((transition, reason)) = proposal else {
                continue;
            };

            let event = MonitorIdleStateEvent {
                hardware_id: monitor.info.hardware_id.clone(),
                device_name: monitor.info.device_name.clone(),
                display_number: monitor.info.display_number,
                bounds: monitor.info.bounds,
                ddc_ci: monitor.info.ddc_ci,
                settings: monitor.settings.clone(),
                foreground,
                reason,
                transition,
            };

            match handler.on_transition(&event).await {
                Verdict::Commit => {
                    monitor.state = transition.target();
                    if transition == Transition::BecameActive {
                        monitor.last_activity = now;
                    }
                    info!(
                        "{} ({}) is now {:?}: {}",
                        monitor.info.device_name,
                        monitor.info.hardware_id,
                        monitor.state,
                        reason.as_str()
                    );
                    self.bus.publish(BusEvent::IdleStateChanged {
                        hardware_id: monitor.info.hardware_id.clone(),
                        state: monitor.state,
                        reason,
                    });
                }
                Verdict::Veto => {
                    debug!(
                        "{:?} on {} vetoed ({})",
                        transition,
                        monitor.info.hardware_id,
                        reason.as_str()
                    );
                }
            }
        }

        self.last_pointer = sample.pointer.or(self.last_pointer);
        self.last_sample_at = Some(now);
    }

    /// Map each signal in `sample` to the monitor it points at.
    ///
    /// Pointer movement wins over the focused window, which wins over
    /// recent input, when several point at one monitor. Movement and input
    /// are measured against the previous sample, so the first sample only
    /// counts the focused window.
    fn attribute(&self, sample: &ActivitySample) -> HashMap<HardwareId, ActivityReason> {
        let mut signals = HashMap::new();

        let pointer_monitor = sample.pointer.and_then(|p| self.monitor_at(p));
        let foreground_monitor = sample
            .foreground
            .and_then(|f| self.monitor_overlapping(&f.bounds));

        if let Some(pointer) = sample.pointer
            && self.last_pointer.is_some_and(|last| last != pointer)
            && let Some(id) = pointer_monitor
        {
            signals.insert(id.clone(), ActivityReason::PointerOnMonitor);
        }

        if let Some(id) = foreground_monitor {
            signals
                .entry(id.clone())
                .or_insert(ActivityReason::ForegroundWindowOnMonitor);
        }

        if let Some(previous_sample) = self.last_sample_at
            && sample.last_input.is_some_and(|at| at > previous_sample)
            && let Some(id) = pointer_monitor.or(foreground_monitor)
        {
            signals
                .entry(id.clone())
                .or_insert(ActivityReason::RecentInput);
        }

        signals
    }

    fn monitor_at(&self, point: Point) -> Option<&HardwareId> {
        self.monitors
            .iter()
            .find(|m| m.info.bounds.contains(point))
            .map(|m| &m.info.hardware_id)
    }

    /// The monitor sharing the largest area with `bounds`, if any.
    fn monitor_overlapping(&self, bounds: &Rect) -> Option<&HardwareId> {
        self.monitors
            .iter()
            .map(|m| (m.info.bounds.overlap_area(bounds), &m.info.hardware_id))
            .filter(|(area, _)| *area > 0)
            .max_by_key(|(area, _)| *area)
            .map(|(_, id)| id)
    }
}
