use async_trait::async_trait;
use fileproc_core::models::TaskKind;
use fileproc_core::TaskError;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::envelope::Task;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task, ctx: TaskContext) -> Result<(), TaskError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler for {0} is already registered")]
    Duplicate(TaskKind),
}

/// Immutable routing table from task kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(
        mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
