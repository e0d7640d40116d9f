// Archivo: registry.rs
// Propósito: trait `Flow` (un paso ejecutable) y el registro que resuelve
// el paso de destino de cada transición.
use crate::command::Command;
use crate::domain::{FlowId, StateCtx};
use crate::engine::FlowEngine;
use crate::errors::{FlowError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Un paso del workflow.
///
/// Recibe el ctx del estado (puede mutar `current`) y el motor, y devuelve
/// el comando que decide qué pasa después.
#[async_trait]
pub trait Flow: Send + Sync {
    async fn execute(&self, state_ctx: &mut StateCtx, engine: &FlowEngine) -> Result<Command>;
}

/// Adaptador para pasos síncronos escritos como closure.
pub struct FlowFn<F>(F);

impl<F> FlowFn<F> where F: Fn(&mut StateCtx, &FlowEngine) -> Result<Command> + Send + Sync
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Flow for FlowFn<F> where F: Fn(&mut StateCtx, &FlowEngine) -> Result<Command> + Send + Sync
{
    async fn execute(&self, state_ctx: &mut StateCtx, engine: &FlowEngine) -> Result<Command> {
        (self.0)(state_ctx, engine)
    }
}

/// Registro concurrente `FlowId -> Flow`.
#[derive(Default)]
pub struct FlowRegistry {
    flows: DashMap<FlowId, Arc<dyn Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra (o reemplaza) el paso `id`.
    pub fn set_flow(&self, id: impl Into<FlowId>, flow: impl Flow + 'static) {
        self.flows.insert(id.into(), Arc::new(flow));
    }

    /// Atajo para registrar una closure síncrona.
    pub fn set_fn<F>(&self, id: impl Into<FlowId>, f: F)
        where F: Fn(&mut StateCtx, &FlowEngine) -> Result<Command> + Send + Sync + 'static
    {
        self.set_flow(id, FlowFn::new(f));
    }

    pub fn flow(&self, id: &FlowId) -> Result<Arc<dyn Flow>> {
        self.flows
            .get(id)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::FlowNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.flows.contains_key(id)
    }
}
