//! Last-input time via Wayland `ext-idle-notify-v1`.
//!
//! Registers a one-second idle notification: `resumed` means input just
//! happened, `idled` means the last input was one window ago.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;
use wayland_client::Connection;
use wayland_client::Dispatch;
use wayland_client::QueueHandle;
use wayland_client::delegate_noop;
use wayland_client::globals::GlobalListContents;
use wayland_client::globals::registry_queue_init;
use wayland_client::protocol::wl_registry;
use wayland_client::protocol::wl_seat;
use wayland_protocols::ext::idle_notify::v1::client::ext_idle_notification_v1;
use wayland_protocols::ext::idle_notify::v1::client::ext_idle_notifier_v1;

use super::NativeError;

/// Inactivity window after which the compositor reports `idled`.
const INPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct InputState {
    idle: bool,
    last_input: Instant,
}

/// Shared view of the most recent input time.
#[derive(Debug, Clone)]
pub struct InputIdleWatch {
    state: Arc<Mutex<InputState>>,
}

impl InputIdleWatch {
    /// Connect to the compositor and start listening on a background thread.
    pub fn spawn() -> Result<Self, NativeError> {
        let conn = Connection::connect_to_env()
            .map_err(|e| NativeError::Unavailable(format!("wayland: {e}")))?;
        let (globals, mut queue) = registry_queue_init::<Listener>(&conn)
            .map_err(|e| NativeError::Unavailable(format!("wayland registry: {e}")))?;
        let qh = queue.handle();

        let seat: wl_seat::WlSeat = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| NativeError::Unavailable(format!("wl_seat: {e}")))?;
        let notifier: ext_idle_notifier_v1::ExtIdleNotifierV1 = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| NativeError::Unavailable(format!("ext_idle_notifier_v1: {e}")))?;

        let timeout_ms = u32::try_from(INPUT_WINDOW.as_millis()).unwrap_or(u32::MAX);
        let notification = notifier.get_idle_notification(timeout_ms, &seat, &qh, ());

        let state = Arc::new(Mutex::new(InputState {
            idle: false,
            last_input: Instant::now(),
        }));
        let mut listener = Listener {
            state: state.clone(),
        };

        thread::Builder::new()
            .name("burnguard-input".to_string())
            .spawn(move || {
                // Keep the protocol objects alive for as long as we listen.
                let _objects = (seat, notifier, notification);
                loop {
                    if let Err(e) = queue.blocking_dispatch(&mut listener) {
                        warn!("Input idle listener stopped: {}", e);
                        break;
                    }
                }
            })?;

        info!("Listening for input activity via ext-idle-notify");
        Ok(Self { state })
    }

    /// Time of the most recent input event.
    pub fn last_input(&self) -> Option<Instant> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.idle {
            Some(state.last_input)
        } else {
            // Input within the last window; as recent as we can tell.
            Some(Instant::now())
        }
    }
}

struct Listener {
    state: Arc<Mutex<InputState>>,
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for Listener {
    fn event(
        _state: &mut Self,
        _proxy: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ext_idle_notification_v1::ExtIdleNotificationV1, ()> for Listener {
    fn event(
        listener: &mut Self,
        _proxy: &ext_idle_notification_v1::ExtIdleNotificationV1,
        event: ext_idle_notification_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let mut state = listener
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match event {
            ext_idle_notification_v1::Event::Idled => {
                state.idle = true;
                state.last_input = Instant::now()
                    .checked_sub(INPUT_WINDOW)
                    .unwrap_or_else(Instant::now);
                debug!("Input idle");
            }
            ext_idle_notification_v1::Event::Resumed => {
                state.idle = false;
                state.last_input = Instant::now();
                debug!("Input resumed");
            }
            _ => {}
        }
    }
}

delegate_noop!(Listener: ignore wl_seat::WlSeat);
delegate_noop!(Listener: ext_idle_notifier_v1::ExtIdleNotifierV1);
