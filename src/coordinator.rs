//! Turns idle transitions into actuation commands.
//!
//! The coordinator is the engine's transition handler. It knows which
//! windows are its own overlays, so it can veto activations those overlays
//! would otherwise cause.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::actuation::ActuationError;
use crate::actuation::BlackoutService;
use crate::dispatch::ApplyDim;
use crate::dispatch::ApplyUndim;
use crate::dispatch::Command;
use crate::dispatch::DispatchError;
use crate::dispatch::Dispatcher;
use crate::dispatch::HideBlackout;
use crate::dispatch::RestoreAllDimmed;
use crate::dispatch::ShowBlackout;
use crate::domain::MonitorInfo;
use crate::idle::MonitorIdleStateEvent;
use crate::idle::Transition;
use crate::idle::TransitionHandler;
use crate::idle::Verdict;

pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    blackout: Arc<BlackoutService>,
}

impl Coordinator {
    pub fn new(dispatcher: Arc<Dispatcher>, blackout: Arc<BlackoutService>) -> Self {
        Self {
            dispatcher,
            blackout,
        }
    }

    /// Lift overlays from monitors that disappeared while idle.
    ///
    /// Brightness is left alone: the panel cannot be reached. Its record
    /// survives until the next restore pass (SIGUSR1, shutdown or startup),
    /// which clears it even when the panel is still gone, so a panel
    /// unplugged while dimmed can come back dim.
    pub async fn release_removed(&self, removed: &[MonitorInfo]) {
        for monitor in removed {
            info!(
                "{} ({}) disconnected while idle",
                monitor.device_name, monitor.hardware_id
            );
            self.send(HideBlackout {
                hardware_id: monitor.hardware_id.clone(),
            })
            .await;
        }
    }

    /// Hide every overlay, then restore every dimmed monitor.
    pub async fn restore_everything(&self) -> Result<(), DispatchError> {
        let closed = self.blackout.hide_all().await;
        debug!("Closed {} overlays", closed);
        self.dispatcher.send(RestoreAllDimmed).await
    }

    async fn send<C: Command>(&self, command: C) {
        match self.dispatcher.send(command).await {
            // Missing handlers are already logged by the dispatcher.
            Ok(()) | Err(DispatchError::NoHandler { .. }) => {}
            Err(e) if is_transient(&e) => warn!("{}", e),
            Err(e) => error!("{}", e),
        }
    }
}

/// Whether a failed command only hit a flaky panel.
///
/// Store and validation failures are not transient; they need an operator.
fn is_transient(e: &DispatchError) -> bool {
    match e {
        DispatchError::Failed { source, .. } => source
            .downcast_ref::<ActuationError>()
            .is_some_and(ActuationError::is_transient),
        _ => false,
    }
}

#[async_trait]
impl TransitionHandler for Coordinator {
    async fn on_transition(&self, event: &MonitorIdleStateEvent) -> Verdict {
        let hardware_id = event.hardware_id.clone();

        match event.transition {
            Transition::BecameActive => {
                if let Some(window) = event.foreground
                    && self.blackout.is_overlay_window(window)
                {
                    debug!(
                        "Ignoring activation of {}: foreground {} is our overlay",
                        hardware_id, window
                    );
                    return Verdict::Veto;
                }

                self.send(HideBlackout {
                    hardware_id: hardware_id.clone(),
                })
                .await;
                self.send(ApplyUndim { hardware_id }).await;
            }
            Transition::BecameIdle => {
                if event.settings.blackout_enabled || !event.ddc_ci {
                    self.send(ShowBlackout {
                        hardware_id,
                        device_name: event.device_name.clone(),
                        bounds: event.bounds,
                        ddc_ci_supported: event.ddc_ci,
                    })
                    .await;
                } else {
                    self.send(ApplyDim {
                        hardware_id,
                        level: event.settings.dim_level,
                    })
                    .await;
                }
            }
        }

        Verdict::Commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;

    use crate::actuation::DimmingService;
    use crate::actuation::dimming::MemoryBrightnessStore;
    use crate::actuation::dimming::StoreError;
    use crate::actuation::register_handlers;
    use crate::config::Config;
    use crate::domain::ActivityReason;
    use crate::domain::HardwareId;
    use crate::domain::Rect;
    use crate::domain::WindowHandle;
    use crate::native::NativeError;
    use crate::native::fake::FakeBrightness;
    use crate::native::fake::FakeOverlays;

    struct Rig {
        brightness: Arc<FakeBrightness>,
        overlays: Arc<FakeOverlays>,
        blackout: Arc<BlackoutService>,
        coordinator: Coordinator,
    }

    fn rig() -> Rig {
        let brightness = Arc::new(FakeBrightness::with_level("A", 80));
        let overlays = Arc::new(FakeOverlays::new(1.0));
        let dimming = Arc::new(DimmingService::new(
            brightness.clone(),
            Arc::new(MemoryBrightnessStore::default()),
        ));
        let blackout = Arc::new(BlackoutService::new(overlays.clone()));
        let dispatcher = register_handlers(Dispatcher::builder(), dimming, blackout.clone())
            .unwrap()
            .build();
        Rig {
            brightness,
            overlays,
            blackout: blackout.clone(),
            coordinator: Coordinator::new(Arc::new(dispatcher), blackout),
        }
    }

    fn event(transition: Transition, ddc_ci: bool, config: &Config) -> MonitorIdleStateEvent {
        let hardware_id = HardwareId::new("A");
        MonitorIdleStateEvent {
            settings: config.settings_for(&hardware_id),
            hardware_id,
            device_name: "DP-1".to_string(),
            display_number: 1,
            bounds: Rect::new(0, 0, 1920, 1080),
            ddc_ci,
            foreground: None,
            reason: match transition {
                Transition::BecameIdle => ActivityReason::NoSignal,
                Transition::BecameActive => ActivityReason::PointerOnMonitor,
            },
            transition,
        }
    }

    #[tokio::test]
    async fn test_idle_dims_ddc_monitor() {
        let rig = rig();
        let config = Config::default();

        let verdict = rig
            .coordinator
            .on_transition(&event(Transition::BecameIdle, true, &config))
            .await;

        assert_eq!(verdict, Verdict::Commit);
        assert_eq!(rig.brightness.level("A"), Some(10));
        assert_eq!(rig.overlays.live_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_blacks_out_without_ddc() {
        let rig = rig();
        let config = Config::default();

        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, false, &config))
            .await;

        assert_eq!(rig.blackout.shown(), vec![HardwareId::new("A")]);
        assert_eq!(rig.brightness.level("A"), Some(80));
    }

    #[tokio::test]
    async fn test_idle_blacks_out_when_enabled() {
        let rig = rig();
        let mut config = Config::default();
        config.defaults.blackout_enabled = true;

        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, true, &config))
            .await;

        assert_eq!(rig.overlays.live_count(), 1);
    }

    #[tokio::test]
    async fn test_activation_by_own_overlay_is_vetoed() {
        let rig = rig();
        let config = Config::default();
        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, false, &config))
            .await;
        let overlay = rig.blackout.handle_for(&HardwareId::new("A")).unwrap();

        let mut active = event(Transition::BecameActive, false, &config);
        active.foreground = Some(overlay);
        let verdict = rig.coordinator.on_transition(&active).await;

        assert_eq!(verdict, Verdict::Veto);
        assert!(rig.blackout.is_overlay_window(overlay));
    }

    #[tokio::test]
    async fn test_activation_lifts_everything() {
        let rig = rig();
        let config = Config::default();
        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, true, &config))
            .await;

        let mut active = event(Transition::BecameActive, true, &config);
        active.foreground = Some(WindowHandle(0x42));
        let verdict = rig.coordinator.on_transition(&active).await;

        assert_eq!(verdict, Verdict::Commit);
        assert_eq!(rig.brightness.level("A"), Some(80));
    }

    #[tokio::test]
    async fn test_restore_everything() {
        let rig = rig();
        let mut config = Config::default();
        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, true, &config))
            .await;
        config.defaults.blackout_enabled = true;
        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, true, &config))
            .await;
        assert_eq!(rig.overlays.live_count(), 1);
        assert_eq!(rig.brightness.level("A"), Some(10));

        rig.coordinator.restore_everything().await.unwrap();

        assert_eq!(rig.overlays.live_count(), 0);
        assert_eq!(rig.brightness.level("A"), Some(80));
    }

    #[test]
    fn test_store_failures_are_not_transient() {
        let store = DispatchError::Failed {
            command: "ApplyDim",
            source: Box::new(ActuationError::Store(StoreError::Io {
                path: PathBuf::from("/nonexistent/brightness.json"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            })),
        };
        assert!(!is_transient(&store));

        let hardware = DispatchError::Failed {
            command: "ApplyDim",
            source: Box::new(ActuationError::hardware(&HardwareId::new("A"), "set brightness")(
                NativeError::Command("ddcutil exited with 1".to_string()),
            )),
        };
        assert!(is_transient(&hardware));

        assert!(!is_transient(&DispatchError::NoHandler { command: "ApplyDim" }));
    }

    #[tokio::test]
    async fn test_release_removed_hides_overlay() {
        let rig = rig();
        let config = Config::default();
        rig.coordinator
            .on_transition(&event(Transition::BecameIdle, false, &config))
            .await;

        let gone = MonitorInfo {
            device_name: "DP-1".to_string(),
            display_number: 1,
            bounds: Rect::new(0, 0, 1920, 1080),
            ddc_ci: false,
            hardware_id: HardwareId::new("A"),
        };
        rig.coordinator.release_removed(&[gone]).await;

        assert!(rig.blackout.shown().is_empty());
    }
}
