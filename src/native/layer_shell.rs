//! Blackout overlays as `wlr-layer-shell` surfaces.
//!
//! One thread owns the Wayland connection and every overlay surface. Async
//! callers send it requests over a channel and await the reply, so window
//! creation and destruction never run anywhere else.
//!
//! Surfaces sit on the overlay layer, take no keyboard focus, have an empty
//! input region and show an opaque black buffer.
//!
//! The reported scale comes from `wp_fractional_scale_v1` when the compositor
//! offers it. `wl_output.scale` is an integer (a 1.5 output reports 2), so it
//! is only the fallback.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use wayland_client::Connection;
use wayland_client::Dispatch;
use wayland_client::EventQueue;
use wayland_client::Proxy;
use wayland_client::QueueHandle;
use wayland_client::delegate_noop;
use wayland_client::globals::GlobalListContents;
use wayland_client::globals::registry_queue_init;
use wayland_client::protocol::wl_buffer;
use wayland_client::protocol::wl_compositor;
use wayland_client::protocol::wl_output;
use wayland_client::protocol::wl_region;
use wayland_client::protocol::wl_registry;
use wayland_client::protocol::wl_shm;
use wayland_client::protocol::wl_shm_pool;
use wayland_client::protocol::wl_surface;
use wayland_protocols::wp::fractional_scale::v1::client::wp_fractional_scale_manager_v1;
use wayland_protocols::wp::fractional_scale::v1::client::wp_fractional_scale_v1;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1;

use super::NativeError;
use super::OverlayHost;
use crate::domain::Rect;
use crate::domain::WindowHandle;

/// Layer-shell namespace, visible to compositor rules.
const NAMESPACE: &str = "burnguard-blackout";

/// How often the thread reads compositor events while no request is pending.
const EVENT_POLL: Duration = Duration::from_millis(250);

/// Denominator of `wp_fractional_scale_v1.preferred_scale`.
const FRACTIONAL_SCALE_DENOMINATOR: f64 = 120.0;

type Reply<T> = oneshot::Sender<Result<T, NativeError>>;

enum Request {
    Create {
        output: String,
        reply: Reply<WindowHandle>,
    },
    Scale {
        window: WindowHandle,
        reply: Reply<f64>,
    },
    Place {
        window: WindowHandle,
        bounds: Rect,
        reply: Reply<()>,
    },
    Destroy {
        window: WindowHandle,
        reply: Reply<()>,
    },
}

/// Overlay host backed by a dedicated Wayland thread.
pub struct LayerShellHost {
    tx: mpsc::Sender<Request>,
}

impl LayerShellHost {
    /// Connect to the compositor and start the overlay thread.
    pub fn spawn() -> Result<Self, NativeError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name("burnguard-overlay".to_string())
            .spawn(move || match connect() {
                Ok((queue, state)) => {
                    let _ = ready_tx.send(Ok(()));
                    run(queue, state, &rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| NativeError::Unavailable("overlay thread exited".to_string()))??;

        info!("Overlay thread connected to the compositor");
        Ok(Self { tx })
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T, NativeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .map_err(|_| NativeError::Unavailable("overlay thread stopped".to_string()))?;
        rx.await
            .map_err(|_| NativeError::Unavailable("overlay thread stopped".to_string()))?
    }
}

#[async_trait]
impl OverlayHost for LayerShellHost {
    async fn create(&self, device_name: &str) -> Result<WindowHandle, NativeError> {
        let output = device_name.to_string();
        self.call(|reply| Request::Create { output, reply }).await
    }

    async fn scale_factor(&self, window: WindowHandle) -> Result<f64, NativeError> {
        self.call(|reply| Request::Scale { window, reply }).await
    }

    async fn place(&self, window: WindowHandle, bounds: Rect) -> Result<(), NativeError> {
        self.call(|reply| Request::Place {
            window,
            bounds,
            reply,
        })
        .await
    }

    async fn destroy(&self, window: WindowHandle) -> Result<(), NativeError> {
        self.call(|reply| Request::Destroy { window, reply }).await
    }
}

struct Output {
    global: u32,
    output: wl_output::WlOutput,
    name: Option<String>,
    scale: i32,
}

struct Overlay {
    surface: wl_surface::WlSurface,
    layer: zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
    /// Present when the compositor reports fractional scales for the surface.
    fractional: Option<wp_fractional_scale_v1::WpFractionalScaleV1>,
    /// Scale the compositor renders the surface at.
    scale: f64,
    /// Attached buffer and its backing file.
    buffer: Option<(wl_buffer::WlBuffer, File)>,
}

/// State owned by the overlay thread.
struct OverlayThread {
    compositor: wl_compositor::WlCompositor,
    shm: wl_shm::WlShm,
    layer_shell: zwlr_layer_shell_v1::ZwlrLayerShellV1,
    fractional_scale: Option<wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1>,
    outputs: Vec<Output>,
    overlays: HashMap<WindowHandle, Overlay>,
}

fn connect() -> Result<(EventQueue<OverlayThread>, OverlayThread), NativeError> {
    let conn = Connection::connect_to_env()
        .map_err(|e| NativeError::Unavailable(format!("wayland: {e}")))?;
    let (globals, mut queue) = registry_queue_init::<OverlayThread>(&conn)
        .map_err(|e| NativeError::Unavailable(format!("wayland registry: {e}")))?;
    let qh = queue.handle();

    let compositor = globals
        .bind(&qh, 4..=4, ())
        .map_err(|e| NativeError::Unavailable(format!("wl_compositor: {e}")))?;
    let shm = globals
        .bind(&qh, 1..=1, ())
        .map_err(|e| NativeError::Unavailable(format!("wl_shm: {e}")))?;
    let layer_shell = globals
        .bind(&qh, 1..=4, ())
        .map_err(|e| NativeError::Unavailable(format!("zwlr_layer_shell_v1: {e}")))?;
    let fractional_scale = match globals.bind(&qh, 1..=1, ()) {
        Ok(manager) => Some(manager),
        Err(e) => {
            debug!("No fractional scale support, using output scale: {}", e);
            None
        }
    };

    let mut state = OverlayThread {
        compositor,
        shm,
        layer_shell,
        fractional_scale,
        outputs: Vec::new(),
        overlays: HashMap::new(),
    };

    for global in globals.contents().clone_list() {
        if global.interface == "wl_output" {
            state.bind_output(globals.registry(), global.name, global.version, &qh);
        }
    }

    // Collect output names and scales before serving requests.
    queue
        .roundtrip(&mut state)
        .map_err(|e| NativeError::ConnectionFailed(e.to_string()))?;

    Ok((queue, state))
}

fn run(
    mut queue: EventQueue<OverlayThread>,
    mut state: OverlayThread,
    rx: &mpsc::Receiver<Request>,
) {
    let qh = queue.handle();

    loop {
        let request = match rx.recv_timeout(EVENT_POLL) {
            Ok(request) => request,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = sync(&mut queue, &mut state) {
                    error!("Overlay thread lost the compositor: {}", e);
                    break;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match request {
            Request::Create { output, reply } => {
                let result = state
                    .create(&output, &qh)
                    .and_then(|handle| sync(&mut queue, &mut state).map(|()| handle));
                let _ = reply.send(result);
            }
            Request::Scale { window, reply } => {
                // Scale events follow the first mapped commit; read them first.
                let result = sync(&mut queue, &mut state).and_then(|()| {
                    state
                        .overlays
                        .get(&window)
                        .map(|o| o.scale)
                        .ok_or(NativeError::UnknownWindow(window))
                });
                let _ = reply.send(result);
            }
            Request::Place {
                window,
                bounds,
                reply,
            } => {
                let result = state
                    .place(window, bounds)
                    .and_then(|()| sync(&mut queue, &mut state));
                let _ = reply.send(result);
            }
            Request::Destroy { window, reply } => {
                let result = state
                    .destroy(window)
                    .and_then(|()| sync(&mut queue, &mut state));
                let _ = reply.send(result);
            }
        }
    }

    let handles: Vec<WindowHandle> = state.overlays.keys().copied().collect();
    for handle in handles {
        let _ = state.destroy(handle);
    }
    let _ = queue.flush();
    debug!("Overlay thread stopped");
}

/// Flush requests and dispatch every event the compositor sent in response.
fn sync(
    queue: &mut EventQueue<OverlayThread>,
    state: &mut OverlayThread,
) -> Result<(), NativeError> {
    queue
        .roundtrip(state)
        .map(|_| ())
        .map_err(|e| NativeError::ConnectionFailed(e.to_string()))
}

fn surface_handle(surface: &wl_surface::WlSurface) -> WindowHandle {
    WindowHandle(u64::from(surface.id().protocol_id()))
}

impl OverlayThread {
    fn bind_output(
        &mut self,
        registry: &wl_registry::WlRegistry,
        global: u32,
        version: u32,
        qh: &QueueHandle<Self>,
    ) {
        let output = registry.bind::<wl_output::WlOutput, _, Self>(global, version.min(4), qh, global);
        self.outputs.push(Output {
            global,
            output,
            name: None,
            scale: 1,
        });
    }

    fn create(&mut self, output_name: &str, qh: &QueueHandle<Self>) -> Result<WindowHandle, NativeError> {
        let (output, scale) = self
            .outputs
            .iter()
            .find(|o| o.name.as_deref() == Some(output_name))
            .map(|o| (o.output.clone(), o.scale))
            .ok_or_else(|| NativeError::UnknownOutput(output_name.to_string()))?;

        let surface = self.compositor.create_surface(qh, ());
        let handle = surface_handle(&surface);

        // Empty input region: pointer and touch fall through to what is below.
        let region = self.compositor.create_region(qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        let fractional = self
            .fractional_scale
            .as_ref()
            .map(|manager| manager.get_fractional_scale(&surface, qh, handle));

        let layer = self.layer_shell.get_layer_surface(
            &surface,
            Some(&output),
            zwlr_layer_shell_v1::Layer::Overlay,
            NAMESPACE.to_string(),
            qh,
            handle,
        );
        layer.set_anchor(
            zwlr_layer_surface_v1::Anchor::Top
                | zwlr_layer_surface_v1::Anchor::Bottom
                | zwlr_layer_surface_v1::Anchor::Left
                | zwlr_layer_surface_v1::Anchor::Right,
        );
        layer.set_exclusive_zone(-1);
        layer.set_keyboard_interactivity(zwlr_layer_surface_v1::KeyboardInteractivity::None);
        surface.commit();

        self.overlays.insert(
            handle,
            Overlay {
                surface,
                layer,
                fractional,
                scale: f64::from(scale),
                buffer: None,
            },
        );
        debug!("Created overlay {} on {}", handle, output_name);
        Ok(handle)
    }

    #[allow(clippy::cast_sign_loss)]
    fn place(&mut self, window: WindowHandle, bounds: Rect) -> Result<(), NativeError> {
        let overlay = self
            .overlays
            .get(&window)
            .ok_or(NativeError::UnknownWindow(window))?;

        // The layer is bound to one output; only the size is meaningful here.
        overlay
            .layer
            .set_size(bounds.width.max(0) as u32, bounds.height.max(0) as u32);
        overlay.surface.commit();
        Ok(())
    }

    fn destroy(&mut self, window: WindowHandle) -> Result<(), NativeError> {
        let overlay = self
            .overlays
            .remove(&window)
            .ok_or(NativeError::UnknownWindow(window))?;

        if let Some(fractional) = overlay.fractional {
            fractional.destroy();
        }
        overlay.layer.destroy();
        overlay.surface.destroy();
        if let Some((buffer, _file)) = overlay.buffer {
            buffer.destroy();
        }
        debug!("Destroyed overlay {}", window);
        Ok(())
    }

    /// Attach an opaque black buffer of `width` x `height` logical pixels.
    ///
    /// Solid black needs no extra resolution, so the buffer stays at scale 1
    /// whatever the output scale is.
    fn paint(
        &mut self,
        window: WindowHandle,
        width: u32,
        height: u32,
        qh: &QueueHandle<Self>,
    ) -> Result<(), NativeError> {
        let shm = self.shm.clone();
        let Some(overlay) = self.overlays.get_mut(&window) else {
            return Ok(());
        };
        if width == 0 || height == 0 {
            return Ok(());
        }

        let too_large = || NativeError::Unavailable(format!("{width}x{height} buffer too large"));
        let w = i32::try_from(width).map_err(|_| too_large())?;
        let h = i32::try_from(height).map_err(|_| too_large())?;
        let stride = w.checked_mul(4).ok_or_else(too_large)?;
        let len = stride.checked_mul(h).ok_or_else(too_large)?;

        // A fresh file reads as zeros, which is black in XRGB8888.
        let file = tempfile::tempfile()?;
        file.set_len(u64::from(len.unsigned_abs()))?;

        let pool = shm.create_pool(file.as_fd(), len, qh, ());
        let buffer = pool.create_buffer(0, w, h, stride, wl_shm::Format::Xrgb8888, qh, ());
        pool.destroy();

        overlay.surface.attach(Some(&buffer), 0, 0);
        overlay.surface.damage_buffer(0, 0, w, h);
        overlay.surface.commit();

        if let Some((old, _)) = overlay.buffer.replace((buffer, file)) {
            old.destroy();
        }
        Ok(())
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for OverlayThread {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == "wl_output" => {
                debug!("Output global {} appeared", name);
                state.bind_output(registry, name, version, qh);
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.outputs.retain(|o| o.global != name);
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for OverlayThread {
    fn event(
        state: &mut Self,
        _output: &wl_output::WlOutput,
        event: wl_output::Event,
        global: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.outputs.iter_mut().find(|o| o.global == *global) else {
            return;
        };
        match event {
            wl_output::Event::Name { name } => entry.name = Some(name),
            wl_output::Event::Scale { factor } => entry.scale = factor.max(1),
            _ => {}
        }
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for OverlayThread {
    fn event(
        state: &mut Self,
        surface: &wl_surface::WlSurface,
        event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_surface::Event::Enter { output } = event {
            let scale = state
                .outputs
                .iter()
                .find(|o| o.output == output)
                .map(|o| o.scale);
            if let (Some(scale), Some(overlay)) =
                (scale, state.overlays.get_mut(&surface_handle(surface)))
                && overlay.fractional.is_none()
            {
                overlay.scale = f64::from(scale);
            }
        }
    }
}

impl Dispatch<zwlr_layer_surface_v1::ZwlrLayerSurfaceV1, WindowHandle> for OverlayThread {
    fn event(
        state: &mut Self,
        layer: &zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        window: &WindowHandle,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                layer.ack_configure(serial);
                if let Err(e) = state.paint(*window, width, height, qh) {
                    warn!("Failed to paint overlay {}: {}", window, e);
                }
            }
            zwlr_layer_surface_v1::Event::Closed => {
                warn!("Compositor closed overlay {}", window);
            }
            _ => {}
        }
    }
}

impl Dispatch<wp_fractional_scale_v1::WpFractionalScaleV1, WindowHandle> for OverlayThread {
    fn event(
        state: &mut Self,
        _fractional: &wp_fractional_scale_v1::WpFractionalScaleV1,
        event: wp_fractional_scale_v1::Event,
        window: &WindowHandle,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wp_fractional_scale_v1::Event::PreferredScale { scale } = event
            && let Some(overlay) = state.overlays.get_mut(window)
        {
            overlay.scale = preferred_scale(scale);
            debug!("Overlay {} renders at scale {}", window, overlay.scale);
        }
    }
}

/// Convert a `preferred_scale` numerator into a scale factor.
fn preferred_scale(numerator: u32) -> f64 {
    if numerator == 0 {
        return 1.0;
    }
    f64::from(numerator) / FRACTIONAL_SCALE_DENOMINATOR
}

delegate_noop!(OverlayThread: wl_compositor::WlCompositor);
delegate_noop!(OverlayThread: wp_fractional_scale_manager_v1::WpFractionalScaleManagerV1);
delegate_noop!(OverlayThread: wl_region::WlRegion);
delegate_noop!(OverlayThread: wl_shm_pool::WlShmPool);
delegate_noop!(OverlayThread: zwlr_layer_shell_v1::ZwlrLayerShellV1);
delegate_noop!(OverlayThread: ignore wl_shm::WlShm);
delegate_noop!(OverlayThread: ignore wl_buffer::WlBuffer);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_scale() {
        assert!((preferred_scale(120) - 1.0).abs() < f64::EPSILON);
        assert!((preferred_scale(180) - 1.5).abs() < f64::EPSILON);
        assert!((preferred_scale(150) - 1.25).abs() < f64::EPSILON);
        assert!((preferred_scale(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fractional_output_is_fully_covered() {
        // A 4K panel at 1.5 is 2560x1440 logical; the integer output scale
        // (2) would leave bands uncovered.
        let physical = Rect::new(0, 0, 3840, 2160);
        assert_eq!(
            physical.to_logical(preferred_scale(180)),
            Rect::new(0, 0, 2560, 1440)
        );
    }
}
