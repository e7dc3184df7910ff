//! Command dispatch.
//!
//! Producers (the idle coordinator, startup recovery, the shell) submit
//! immutable command values; the dispatcher routes each one to the single
//! handler registered for its concrete type and awaits it. There is no
//! queueing and no retry.

use std::any::Any;
use std::any::TypeId;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use tracing::error;

use crate::domain::HardwareId;
use crate::domain::Rect;

/// Error type handlers report back through the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No handler registered for {command}")]
    NoHandler { command: &'static str },

    #[error("A handler for {command} is already registered")]
    DuplicateHandler { command: &'static str },

    #[error("{command} failed: {source}")]
    Failed {
        command: &'static str,
        #[source]
        source: HandlerError,
    },
}

/// Marker for values the dispatcher can route.
pub trait Command: Any + Send + Sync + fmt::Debug {}

/// Dim a monitor to `level` (0-100).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyDim {
    pub hardware_id: HardwareId,
    pub level: u8,
}

/// Restore a monitor's pre-dim brightness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyUndim {
    pub hardware_id: HardwareId,
}

/// Cover a monitor with a black overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowBlackout {
    pub hardware_id: HardwareId,
    /// Output the overlay goes on.
    pub device_name: String,
    pub bounds: Rect,
    pub ddc_ci_supported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HideBlackout {
    pub hardware_id: HardwareId,
}

/// Restore every monitor recorded as dimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreAllDimmed;

impl Command for ApplyDim {}
impl Command for ApplyUndim {}
impl Command for ShowBlackout {}
impl Command for HideBlackout {}
impl Command for RestoreAllDimmed {}

/// Handles one command type.
#[async_trait]
pub trait Handler<C: Command>: Send + Sync {
    async fn handle(&self, command: &C) -> Result<(), HandlerError>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn handle_any(&self, command: &(dyn Any + Send + Sync)) -> Result<(), DispatchError>;
}

struct Typed<C, H> {
    handler: H,
    _command: PhantomData<fn(C)>,
}

#[async_trait]
impl<C, H> ErasedHandler for Typed<C, H>
where
    C: Command,
    H: Handler<C> + 'static,
{
    async fn handle_any(&self, command: &(dyn Any + Send + Sync)) -> Result<(), DispatchError> {
        let name = type_name::<C>();
        // Handlers are keyed by TypeId, so this only fails on a wiring bug.
        let Some(command) = command.downcast_ref::<C>() else {
            return Err(DispatchError::NoHandler { command: name });
        };
        self.handler
            .handle(command)
            .await
            .map_err(|source| DispatchError::Failed {
                command: name,
                source,
            })
    }
}

/// Collects handlers before the dispatcher is sealed.
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `C`. A second handler for one type is an error.
    pub fn register<C, H>(mut self, handler: H) -> Result<Self, DispatchError>
    where
        C: Command,
        H: Handler<C> + 'static,
    {
        let key = TypeId::of::<C>();
        if self.handlers.contains_key(&key) {
            return Err(DispatchError::DuplicateHandler {
                command: type_name::<C>(),
            });
        }
        self.handlers.insert(
            key,
            Box::new(Typed {
                handler,
                _command: PhantomData,
            }),
        );
        Ok(self)
    }

    pub fn build(self) -> Dispatcher {
        debug!("Dispatcher sealed with {} handlers", self.handlers.len());
        Dispatcher {
            handlers: self.handlers,
        }
    }
}

/// Routes commands to their handlers.
pub struct Dispatcher {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Run the handler registered for `C` to completion.
    pub async fn send<C: Command>(&self, command: C) -> Result<(), DispatchError> {
        let Some(handler) = self.handlers.get(&TypeId::of::<C>()) else {
            let err = DispatchError::NoHandler {
                command: type_name::<C>(),
            };
            error!("{}", err);
            return Err(err);
        };

        debug!("Dispatching {:?}", command);
        handler.handle_any(&command).await
    }

    pub fn handles<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }
}
