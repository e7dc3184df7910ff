//! Brightness dimming with crash-safe state.
//!
//! The brightness a monitor had before it was dimmed is written to the
//! store before the hardware is touched, and removed only after it has been
//! put back. A non-empty store at startup therefore means the previous
//! session ended with monitors dimmed.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ActuationError;
use super::KeyedLocks;
use crate::config::MAX_LEVEL;
use crate::domain::HardwareId;
use crate::native::BrightnessControl;

/// Pre-dim brightness per monitor.
pub type BrightnessMap = BTreeMap<HardwareId, u8>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access brightness state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Brightness state {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode brightness state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Durable storage for the brightness map.
#[async_trait]
pub trait BrightnessStore: Send + Sync {
    async fn load(&self) -> Result<BrightnessMap, StoreError>;
    async fn save(&self, map: &BrightnessMap) -> Result<(), StoreError>;
}

/// Brightness map as a JSON object on disk.
#[derive(Debug, Clone)]
pub struct JsonBrightnessStore {
    path: PathBuf,
}

impl JsonBrightnessStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl BrightnessStore for JsonBrightnessStore {
    async fn load(&self) -> Result<BrightnessMap, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BrightnessMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        if content.trim().is_empty() {
            return Ok(BrightnessMap::new());
        }

        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, map: &BrightnessMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let content = serde_json::to_string_pretty(map).map_err(StoreError::Encode)?;

        // Write-then-rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// Process-local store, for dry runs.
#[derive(Debug, Default)]
pub struct MemoryBrightnessStore {
    map: Mutex<BrightnessMap>,
}

#[async_trait]
impl BrightnessStore for MemoryBrightnessStore {
    async fn load(&self) -> Result<BrightnessMap, StoreError> {
        Ok(self.map.lock().await.clone())
    }

    async fn save(&self, map: &BrightnessMap) -> Result<(), StoreError> {
        *self.map.lock().await = map.clone();
        Ok(())
    }
}

/// Outcome of a restore-all pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<HardwareId>,
    pub failed: Vec<HardwareId>,
}

impl RestoreReport {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty() && self.failed.is_empty()
    }
}

/// Dims and restores monitor brightness.
pub struct DimmingService {
    channel: Arc<dyn BrightnessControl>,
    store: Arc<dyn BrightnessStore>,
    /// Serialises read-modify-write cycles on the store.
    store_lock: Mutex<()>,
    locks: KeyedLocks,
}

impl DimmingService {
    pub fn new(channel: Arc<dyn BrightnessControl>, store: Arc<dyn BrightnessStore>) -> Self {
        Self {
            channel,
            store,
            store_lock: Mutex::new(()),
            locks: KeyedLocks::new(),
        }
    }

    /// Set `id` to `level`, recording its current brightness first.
    ///
    /// Dimming an already dimmed monitor keeps the original record.
    pub async fn dim(&self, id: &HardwareId, level: u8) -> Result<(), ActuationError> {
        if level > MAX_LEVEL {
            return Err(ActuationError::InvalidLevel {
                hardware_id: id.clone(),
                level,
            });
        }

        let _guard = self.locks.lock(id).await;

        let recorded = {
            let _store = self.store_lock.lock().await;
            self.store.load().await?.contains_key(id)
        };

        if !recorded {
            let previous = self
                .channel
                .brightness(id)
                .await
                .map_err(ActuationError::hardware(id, "read brightness"))?;

            let _store = self.store_lock.lock().await;
            let mut map = self.store.load().await?;
            map.entry(id.clone()).or_insert(previous);
            self.store.save(&map).await?;
            debug!("Recorded brightness {} for {}", previous, id);
        }

        self.channel
            .set_brightness(id, level)
            .await
            .map_err(ActuationError::hardware(id, format!("set brightness to {level}")))?;

        info!("Dimmed {} to {}", id, level);
        Ok(())
    }

    /// Put back the recorded brightness of `id`. No record means no-op.
    pub async fn undim(&self, id: &HardwareId) -> Result<(), ActuationError> {
        let _guard = self.locks.lock(id).await;

        let previous = {
            let _store = self.store_lock.lock().await;
            self.store.load().await?.get(id).copied()
        };
        let Some(previous) = previous else {
            debug!("{} is not dimmed", id);
            return Ok(());
        };

        self.channel
            .set_brightness(id, previous)
            .await
            .map_err(ActuationError::hardware(id, format!("restore brightness {previous}")))?;

        {
            let _store = self.store_lock.lock().await;
            let mut map = self.store.load().await?;
            map.remove(id);
            self.store.save(&map).await?;
        }

        info!("Restored {} to {}", id, previous);
        Ok(())
    }

    /// Restore every recorded monitor, then clear what was processed.
    ///
    /// A failure on one monitor does not stop the others. Records are only
    /// cleared after the whole pass, so a crash midway retries all of them.
    pub async fn restore_all(&self) -> Result<RestoreReport, ActuationError> {
        let snapshot = {
            let _store = self.store_lock.lock().await;
            self.store.load().await?
        };

        let mut report = RestoreReport::default();
        if snapshot.is_empty() {
            debug!("No dimmed monitors to restore");
            return Ok(report);
        }

        warn!("Restoring {} monitors left dimmed", snapshot.len());

        for (id, level) in &snapshot {
            let _guard = self.locks.lock(id).await;
            match self.channel.set_brightness(id, *level).await {
                Ok(()) => {
                    info!("Restored {} to {}", id, level);
                    report.restored.push(id.clone());
                }
                Err(e) => {
                    error!("Failed to restore {} to {}: {}", id, level, e);
                    report.failed.push(id.clone());
                }
            }
        }

        {
            let _store = self.store_lock.lock().await;
            let mut map = self.store.load().await?;
            map.retain(|id, _| !snapshot.contains_key(id));
            self.store.save(&map).await?;
        }

        Ok(report)
    }
}
