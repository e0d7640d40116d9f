// Archivo: service.rs
// Propósito: implementar `FlowService`, una capa orquestadora que arranca el
// motor junto con el recoverer y el delayer y los apaga en orden. Esta capa
// debe ser invocada desde el binario o desde workers.
use crate::clock::Clock;
use crate::command::Command;
use crate::config::{DelayerConfig, EngineConfig, RecovererConfig};
use crate::delayer::{Delayer, DelayerStats};
use crate::domain::{FlowId, State, StateCtx};
use crate::engine::FlowEngine;
use crate::errors::Result;
use crate::recovery::{Recoverer, RecovererStats};
use crate::registry::FlowRegistry;
use crate::repository::StateRepository;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Configuración agregada del servicio.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub engine: EngineConfig,
    pub recoverer: RecovererConfig,
    pub delayer: DelayerConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self { engine: EngineConfig::from_env()?,
                  recoverer: RecovererConfig::from_env()?,
                  delayer: DelayerConfig::from_env()? })
    }
}

/// Servicio de alto nivel: motor + recoverer + delayer sobre un mismo
/// repositorio.
pub struct FlowService {
    engine: FlowEngine,
    recoverer: Recoverer,
    delayer: Delayer,
}

impl FlowService {
    /// Construye el motor y arranca los componentes de fondo.
    pub fn start(repo: Arc<dyn StateRepository>,
                 registry: Arc<FlowRegistry>,
                 config: ServiceConfig,
                 clock: Clock)
                 -> Result<Self> {
        let engine = FlowEngine::with_clock(repo, registry, config.engine, clock);
        let recoverer = Recoverer::start(engine.clone(), config.recoverer)?;
        let delayer = Delayer::start(engine.clone(), config.delayer)?;
        info!("servicio iniciado");
        Ok(Self { engine,
                  recoverer,
                  delayer })
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub fn recoverer_stats(&self) -> RecovererStats {
        self.recoverer.stats()
    }

    pub fn delayer_stats(&self) -> DelayerStats {
        self.delayer.stats()
    }

    /// Commitea `state` con una transición a `to` y lo ejecuta en segundo
    /// plano. Devuelve el ctx confirmado.
    pub fn start_state(&self, state: State, to: impl Into<FlowId>) -> Result<StateCtx> {
        let cmd = self.engine.commit(vec![Command::transit(state.to_ctx(), to)])?;
        let ctx = Command::Commit(cmd).into_state_ctx().unwrap_or_default();
        self.engine.spawn_execute(ctx.clone());
        Ok(ctx)
    }

    /// Apaga delayer, recoverer y motor, en ese orden, cada uno con
    /// `deadline`. Se intenta apagar todo aunque alguno falle; se devuelve el
    /// primer error.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let delayer = self.delayer.shutdown(deadline).await;
        let recoverer = self.recoverer.shutdown(deadline).await;
        let engine = self.engine.shutdown(deadline).await;
        info!("servicio detenido");
        delayer.and(recoverer).and(engine)
    }
}
