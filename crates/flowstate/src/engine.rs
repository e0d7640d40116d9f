// Archivo: engine.rs
// Propósito: implementar el `FlowEngine`: loop de ejecución de pasos,
// tabla de despacho de comandos y apagado ordenado.
//
// El loop es un trampolín: cada paso devuelve un comando, el comando se
// despacha y, si produce un ctx de continuación, se vuelve a iterar sin
// recursión. Los ctx de continuación secundarios se lanzan como tareas
// independientes.
use crate::clock::Clock;
use crate::command::{Command, CommitCommand};
use crate::config::EngineConfig;
use crate::domain::{StateCtx, StateId};
use crate::errors::{FlowError, Result};
use crate::registry::FlowRegistry;
use crate::repository::{GetStatesQuery, GetStatesResult, StateRepository};
use crate::watcher::Watcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

struct EngineInner {
    repo: Arc<dyn StateRepository>,
    registry: Arc<FlowRegistry>,
    config: EngineConfig,
    clock: Clock,
    shutdown: CancellationToken,
    /// Ejecuciones en curso (directas y lanzadas en segundo plano).
    tracker: TaskTracker,
}

/// Motor de ejecución de estados.
///
/// Es barato de clonar: todas las copias comparten repositorio, registro y
/// señal de apagado.
///
/// Nota sobre errores y concurrencia:
/// - Un `RevMismatch` al despachar detiene el loop en silencio: otro
///   ejecutor ya avanzó el estado.
/// - `NotFound`, `FlowNotFound` y errores de validación se propagan al
///   caller de `execute`.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    /// Crea una nueva instancia del motor.
    pub fn new(repo: Arc<dyn StateRepository>, registry: Arc<FlowRegistry>, config: EngineConfig) -> Self {
        Self::with_clock(repo, registry, config, Clock::new())
    }

    /// Igual que `new` pero con un reloj compartido con el repositorio.
    pub fn with_clock(repo: Arc<dyn StateRepository>,
                      registry: Arc<FlowRegistry>,
                      config: EngineConfig,
                      clock: Clock)
                      -> Self {
        Self { inner: Arc::new(EngineInner { repo,
                                             registry,
                                             config,
                                             clock,
                                             shutdown: CancellationToken::new(),
                                             tracker: TaskTracker::new() }) }
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository> {
        &self.inner.repo
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token hijo que se cancela cuando el motor se apaga.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Ejecuta el estado hasta que un paso devuelva un comando sin
    /// continuación, haya conflicto de revisión o el motor se apague.
    pub async fn execute(&self, state_ctx: StateCtx) -> Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        let _running = self.inner.tracker.token();
        if state_ctx.id().is_empty() {
            return Err(FlowError::Validation("estado sin id".into()));
        }

        let mut state_ctx = state_ctx;
        loop {
            if self.is_shutdown() {
                debug!(id = %state_ctx.id(), "motor apagado; se detiene la ejecución");
                return Ok(());
            }
            let to = state_ctx.current.transition.to.clone();
            if to.is_empty() {
                return Err(FlowError::Validation(format!("estado {} sin paso de destino", state_ctx.id())));
            }
            let flow = self.inner.registry.flow(&to)?;
            debug!(id = %state_ctx.id(), rev = state_ctx.committed.rev, flow = %to, "ejecutando paso");

            let mut cmd = flow.execute(&mut state_ctx, self).await?;
            // Un `Execute` devuelto por el paso continúa en esta misma tarea.
            if !matches!(cmd, Command::Execute(_)) {
                match self.do_command(&mut cmd) {
                    Ok(()) => {}
                    Err(e) if e.is_rev_mismatch() => {
                        debug!(id = %state_ctx.id(), error = %e, "conflicto de revisión; otro ejecutor avanzó el estado");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }

            let mut next = cmd.follow_ons().into_iter();
            let Some(primary) = next.next() else {
                return Ok(());
            };
            for other in next {
                self.spawn_execute(other);
            }
            state_ctx = primary;
        }
    }

    /// Lanza `execute` en una tarea de fondo. Los errores se registran en el
    /// log.
    pub fn spawn_execute(&self, state_ctx: StateCtx) {
        if self.is_shutdown() {
            return;
        }
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            let id = state_ctx.id().clone();
            if let Err(e) = engine.execute(state_ctx).await {
                error!(id = %id, error = %e, "la ejecución terminó con error");
            }
        });
    }

    /// Tabla de despacho única de comandos.
    pub fn do_command(&self, cmd: &mut Command) -> Result<()> {
        let repo = &self.inner.repo;
        match cmd {
            Command::Commit(c) => repo.commit(c),
            Command::Transit(_)
            | Command::Pause(_)
            | Command::Resume(_)
            | Command::End(_)
            | Command::Stack(_)
            | Command::Unstack(_)
            | Command::ReferenceData(_) => cmd.apply(),
            Command::DereferenceData(c) => {
                c.apply()?;
                if let Some(data) = c.data.as_mut() {
                    repo.get_data(data)?;
                }
                Ok(())
            }
            Command::CommitStateCtx(_) | Command::Noop => Ok(()),
            Command::Delay(d) => {
                let (snap, at) = d.snapshot(&d.state_ctx.current, self.now());
                d.result = Some(repo.delay(snap, at)?);
                Ok(())
            }
            Command::Execute(c) => {
                self.spawn_execute(c.state_ctx.clone());
                Ok(())
            }
            Command::StoreData(c) => repo.store_data(&mut c.data),
            Command::GetData(c) => repo.get_data(&mut c.data),
            Command::GetStateById(c) => {
                c.result = Some(repo.get_state_by_id(&c.id, c.rev)?);
                Ok(())
            }
            Command::GetStateByLabels(c) => {
                c.result = Some(repo.get_state_by_labels(&c.labels)?);
                Ok(())
            }
            Command::GetStates(c) => {
                c.result = Some(repo.get_states(&c.query)?);
                Ok(())
            }
            Command::GetDelayedStates(c) => {
                c.result = Some(repo.get_delayed_states(&c.query)?);
                Ok(())
            }
        }
    }

    /// Atajo: commitea `commands` y devuelve el bundle con los ctx ya
    /// confirmados.
    pub fn commit(&self, commands: impl IntoIterator<Item = Command>) -> Result<CommitCommand> {
        let mut cmd = CommitCommand::new(commands);
        self.inner.repo.commit(&mut cmd)?;
        Ok(cmd)
    }

    pub fn get_state_by_id(&self, id: impl Into<StateId>, rev: i64) -> Result<StateCtx> {
        self.inner.repo.get_state_by_id(&id.into(), rev)
    }

    pub fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
        self.inner.repo.get_states(query)
    }

    /// Observa el log desde `query.since_rev` con sus filtros de etiquetas.
    pub fn watch(&self, query: GetStatesQuery) -> Watcher {
        Watcher::new(self.inner.repo.clone(), query, self.inner.config.watch_poll_interval)
    }

    /// Número de ejecuciones en curso.
    pub fn running(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Apaga el motor: deja de aceptar ejecuciones y espera a las que están
    /// en curso hasta `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        match tokio::time::timeout(deadline, self.inner.tracker.wait()).await {
            Ok(()) => {
                info!("motor apagado");
                Ok(())
            }
            Err(_) => Err(FlowError::Shutdown(format!("{} ejecuciones siguen en curso", self.inner.tracker.len()))),
        }
    }
}
