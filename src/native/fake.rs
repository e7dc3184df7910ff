//! In-memory native channels for unit tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::BrightnessControl;
use super::DisplaySource;
use super::NativeError;
use super::OverlayHost;
use super::RawDisplay;
use crate::domain::HardwareId;
use crate::domain::Rect;
use crate::domain::WindowHandle;

pub fn raw(device_name: &str, serial: &str, bounds: Rect) -> RawDisplay {
    RawDisplay {
        device_name: device_name.to_string(),
        bounds,
        device_string: "Acme Panel".to_string(),
        adapter_string: serial.to_string(),
    }
}

#[derive(Default)]
pub struct FakeDisplays {
    pub displays: Mutex<Vec<RawDisplay>>,
    pub fail: Mutex<bool>,
    pub calls: Mutex<usize>,
}

impl FakeDisplays {
    pub fn new(displays: Vec<RawDisplay>) -> Self {
        Self {
            displays: Mutex::new(displays),
            ..Self::default()
        }
    }

    pub fn set(&self, displays: Vec<RawDisplay>) {
        *self.displays.lock().unwrap() = displays;
    }
}

#[async_trait]
impl DisplaySource for FakeDisplays {
    async fn enumerate(&self) -> Result<Vec<RawDisplay>, NativeError> {
        *self.calls.lock().unwrap() += 1;
        if *self.fail.lock().unwrap() {
            return Err(NativeError::ConnectionFailed("fake".to_string()));
        }
        Ok(self.displays.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeBrightness {
    pub levels: Mutex<HashMap<HardwareId, u8>>,
    /// Device names whose probe errors out.
    pub probe_errors: Mutex<HashSet<String>>,
    /// Device names that probe as unsupported.
    pub unsupported: Mutex<HashSet<String>>,
    pub fail_get: Mutex<HashSet<HardwareId>>,
    pub fail_set: Mutex<HashSet<HardwareId>>,
    pub set_calls: Mutex<Vec<(HardwareId, u8)>>,
}

impl FakeBrightness {
    pub fn with_level(id: &str, level: u8) -> Self {
        let fake = Self::default();
        fake.levels.lock().unwrap().insert(HardwareId::new(id), level);
        fake
    }

    pub fn level(&self, id: &str) -> Option<u8> {
        self.levels.lock().unwrap().get(&HardwareId::new(id)).copied()
    }

    pub fn fail_set(&self, id: &str, fail: bool) {
        let mut set = self.fail_set.lock().unwrap();
        if fail {
            set.insert(HardwareId::new(id));
        } else {
            set.remove(&HardwareId::new(id));
        }
    }
}

#[async_trait]
impl BrightnessControl for FakeBrightness {
    async fn probe(&self, raw: &RawDisplay, id: &HardwareId) -> Result<bool, NativeError> {
        if self.probe_errors.lock().unwrap().contains(&raw.device_name) {
            return Err(NativeError::Command("probe timed out".to_string()));
        }
        if self.unsupported.lock().unwrap().contains(&raw.device_name) {
            return Ok(false);
        }
        self.levels.lock().unwrap().entry(id.clone()).or_insert(100);
        Ok(true)
    }

    async fn brightness(&self, id: &HardwareId) -> Result<u8, NativeError> {
        if self.fail_get.lock().unwrap().contains(id) {
            return Err(NativeError::Command("getvcp failed".to_string()));
        }
        self.levels
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .ok_or_else(|| NativeError::UnknownMonitor(id.clone()))
    }

    async fn set_brightness(&self, id: &HardwareId, level: u8) -> Result<(), NativeError> {
        if self.fail_set.lock().unwrap().contains(id) {
            return Err(NativeError::Command("setvcp failed".to_string()));
        }
        self.set_calls.lock().unwrap().push((id.clone(), level));
        self.levels.lock().unwrap().insert(id.clone(), level);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayCall {
    Create(String),
    Scale(WindowHandle),
    Place(WindowHandle, Rect),
    Destroy(WindowHandle),
}

pub struct FakeOverlays {
    pub scale: f64,
    pub next: Mutex<u64>,
    pub live: Mutex<HashSet<WindowHandle>>,
    pub calls: Mutex<Vec<OverlayCall>>,
    pub fail_create: Mutex<bool>,
    pub fail_place: Mutex<bool>,
}

impl FakeOverlays {
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            next: Mutex::new(0x100),
            live: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            fail_create: Mutex::new(false),
            fail_place: Mutex::new(false),
        }
    }

    pub fn calls(&self) -> Vec<OverlayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl OverlayHost for FakeOverlays {
    async fn create(&self, device_name: &str) -> Result<WindowHandle, NativeError> {
        self.calls
            .lock()
            .unwrap()
            .push(OverlayCall::Create(device_name.to_string()));
        if *self.fail_create.lock().unwrap() {
            return Err(NativeError::UnknownOutput(device_name.to_string()));
        }
        let mut next = self.next.lock().unwrap();
        let handle = WindowHandle(*next);
        *next += 1;
        self.live.lock().unwrap().insert(handle);
        Ok(handle)
    }

    async fn scale_factor(&self, window: WindowHandle) -> Result<f64, NativeError> {
        self.calls.lock().unwrap().push(OverlayCall::Scale(window));
        Ok(self.scale)
    }

    async fn place(&self, window: WindowHandle, bounds: Rect) -> Result<(), NativeError> {
        self.calls
            .lock()
            .unwrap()
            .push(OverlayCall::Place(window, bounds));
        if *self.fail_place.lock().unwrap() {
            return Err(NativeError::Command("configure refused".to_string()));
        }
        Ok(())
    }

    async fn destroy(&self, window: WindowHandle) -> Result<(), NativeError> {
        self.calls.lock().unwrap().push(OverlayCall::Destroy(window));
        if self.live.lock().unwrap().remove(&window) {
            Ok(())
        } else {
            Err(NativeError::UnknownWindow(window))
        }
    }
}
