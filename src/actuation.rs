//! Actuation services and their command handlers.
//!
//! Both services serialise work per hardware id; different monitors proceed
//! independently. Handlers log transient hardware faults and report success
//! so a flaky panel never fails the caller; everything else propagates.

pub mod blackout;
pub mod dimming;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::error;
use tracing::warn;

pub use blackout::BlackoutService;
pub use dimming::DimmingService;

use crate::dispatch::ApplyDim;
use crate::dispatch::ApplyUndim;
use crate::dispatch::DispatchError;
use crate::dispatch::DispatcherBuilder;
use crate::dispatch::Handler;
use crate::dispatch::HandlerError;
use crate::dispatch::HideBlackout;
use crate::dispatch::RestoreAllDimmed;
use crate::dispatch::ShowBlackout;
use crate::domain::HardwareId;
use crate::native::NativeError;
use dimming::StoreError;

#[derive(Error, Debug)]
pub enum ActuationError {
    #[error("Failed to {action} on {hardware_id}: {source}")]
    Hardware {
        hardware_id: HardwareId,
        action: String,
        #[source]
        source: NativeError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Brightness level {level} out of range for {hardware_id}")]
    InvalidLevel { hardware_id: HardwareId, level: u8 },
}

impl ActuationError {
    pub(crate) fn hardware(
        hardware_id: &HardwareId,
        action: impl Into<String>,
    ) -> impl FnOnce(NativeError) -> Self {
        let hardware_id = hardware_id.clone();
        let action = action.into();
        move |source| Self::Hardware {
            hardware_id,
            action,
            source,
        }
    }

    /// Hardware faults are transient: the next event gets another chance.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Hardware { .. })
    }
}

/// One async mutex per hardware id.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<HardwareId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: &HardwareId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn absorb_transient(result: Result<(), ActuationError>) -> Result<(), HandlerError> {
    match result {
        Err(e) if e.is_transient() => {
            warn!("{}", e);
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

/// Routes dimming commands to a [`DimmingService`].
#[derive(Clone)]
pub struct DimmingHandler(pub Arc<DimmingService>);

#[async_trait]
impl Handler<ApplyDim> for DimmingHandler {
    async fn handle(&self, command: &ApplyDim) -> Result<(), HandlerError> {
        absorb_transient(self.0.dim(&command.hardware_id, command.level).await)
    }
}

#[async_trait]
impl Handler<ApplyUndim> for DimmingHandler {
    async fn handle(&self, command: &ApplyUndim) -> Result<(), HandlerError> {
        absorb_transient(self.0.undim(&command.hardware_id).await)
    }
}

#[async_trait]
impl Handler<RestoreAllDimmed> for DimmingHandler {
    async fn handle(&self, _command: &RestoreAllDimmed) -> Result<(), HandlerError> {
        let report = self.0.restore_all().await?;
        for id in &report.failed {
            error!("Could not restore brightness of {}", id);
        }
        Ok(())
    }
}

/// Routes overlay commands to a [`BlackoutService`].
#[derive(Clone)]
pub struct BlackoutHandler(pub Arc<BlackoutService>);

#[async_trait]
impl Handler<ShowBlackout> for BlackoutHandler {
    async fn handle(&self, command: &ShowBlackout) -> Result<(), HandlerError> {
        absorb_transient(
            self.0
                .show(&command.hardware_id, &command.device_name, command.bounds)
                .await,
        )
    }
}

#[async_trait]
impl Handler<HideBlackout> for BlackoutHandler {
    async fn handle(&self, command: &HideBlackout) -> Result<(), HandlerError> {
        absorb_transient(self.0.hide(&command.hardware_id).await)
    }
}

/// Register the handler for every actuation command.
pub fn register_handlers(
    builder: DispatcherBuilder,
    dimming: Arc<DimmingService>,
    blackout: Arc<BlackoutService>,
) -> Result<DispatcherBuilder, DispatchError> {
    let dimming = DimmingHandler(dimming);
    let blackout = BlackoutHandler(blackout);

    builder
        .register::<ApplyDim, _>(dimming.clone())?
        .register::<ApplyUndim, _>(dimming.clone())?
        .register::<RestoreAllDimmed, _>(dimming)?
        .register::<ShowBlackout, _>(blackout.clone())?
        .register::<HideBlackout, _>(blackout)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::domain::Rect;
    use crate::native::fake::FakeBrightness;
    use crate::native::fake::FakeOverlays;
    use dimming::MemoryBrightnessStore;

    fn dispatcher(brightness: Arc<FakeBrightness>, overlays: Arc<FakeOverlays>) -> Dispatcher {
        let dimming = Arc::new(DimmingService::new(
            brightness,
            Arc::new(MemoryBrightnessStore::default()),
        ));
        let blackout = Arc::new(BlackoutService::new(overlays));
        register_handlers(Dispatcher::builder(), dimming, blackout)
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_every_command_has_a_handler() {
        let d = dispatcher(
            Arc::new(FakeBrightness::default()),
            Arc::new(FakeOverlays::new(1.0)),
        );
        assert!(d.handles::<ApplyDim>());
        assert!(d.handles::<ApplyUndim>());
        assert!(d.handles::<ShowBlackout>());
        assert!(d.handles::<HideBlackout>());
        assert!(d.handles::<RestoreAllDimmed>());
    }

    #[tokio::test]
    async fn test_transient_hardware_fault_does_not_fail_command() {
        let brightness = Arc::new(FakeBrightness::with_level("A", 80));
        brightness.fail_set("A", true);
        let d = dispatcher(brightness.clone(), Arc::new(FakeOverlays::new(1.0)));

        d.send(ApplyDim {
            hardware_id: HardwareId::new("A"),
            level: 10,
        })
        .await
        .unwrap();
        assert_eq!(brightness.level("A"), Some(80));
    }

    #[tokio::test]
    async fn test_invalid_level_fails_command() {
        let d = dispatcher(
            Arc::new(FakeBrightness::with_level("A", 80)),
            Arc::new(FakeOverlays::new(1.0)),
        );
        let err = d
            .send(ApplyDim {
                hardware_id: HardwareId::new("A"),
                level: 101,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_overlay_commands_round_trip() {
        let overlays = Arc::new(FakeOverlays::new(1.0));
        let d = dispatcher(Arc::new(FakeBrightness::default()), overlays.clone());

        d.send(ShowBlackout {
            hardware_id: HardwareId::new("A"),
            device_name: "DP-1".to_string(),
            bounds: Rect::new(0, 0, 1920, 1080),
            ddc_ci_supported: false,
        })
        .await
        .unwrap();
        assert_eq!(overlays.live_count(), 1);

        d.send(HideBlackout {
            hardware_id: HardwareId::new("A"),
        })
        .await
        .unwrap();
        assert_eq!(overlays.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_locks_serialise_one_id_only() {
        let locks = Arc::new(KeyedLocks::new());
        let a = HardwareId::new("A");
        let b = HardwareId::new("B");

        let guard = locks.lock(&a).await;

        // A different id is not blocked.
        let _other = locks.lock(&b).await;

        let waiter = {
            let locks = locks.clone();
            let a = a.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&a).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
