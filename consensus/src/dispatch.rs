// One-shot dispatch of executed operations to type-specific handlers
//
// The consensus layer decides whether dispatch happens; the handler's own
// result is recorded on the operation and never unwinds execution.

use crate::operation::OperationType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler rejected payload: {0}")]
    Rejected(String),

    #[error("Downstream failure: {0}")]
    Downstream(String),
}

/// Operation-specific executor, e.g. wallet registration or status change
pub trait OperationHandler: Send + Sync {
    fn handle(&self, operation_type: OperationType, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Recorded result of a dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    /// Failure description, empty on success
    pub detail: String,
}

impl DispatchOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            detail: String::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Handlers keyed by operation type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `operation_type`, returning any handler it replaces
    pub fn register(
        &mut self,
        operation_type: OperationType,
        handler: Arc<dyn OperationHandler>,
    ) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.insert(operation_type, handler)
    }

    pub fn is_registered(&self, operation_type: OperationType) -> bool {
        self.handlers.contains_key(&operation_type)
    }

    /// Send the payload to its handler once and record what happened
    pub fn dispatch(&self, operation_type: OperationType, payload: &[u8]) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&operation_type) else {
            warn!(%operation_type, "No handler registered");
            return DispatchOutcome::failed(format!("no handler for {}", operation_type));
        };

        match handler.handle(operation_type, payload) {
            Ok(()) => {
                debug!(%operation_type, "Dispatch succeeded");
                DispatchOutcome::succeeded()
            }
            Err(e) => {
                warn!(%operation_type, error = %e, "Dispatch failed");
                DispatchOutcome::failed(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
