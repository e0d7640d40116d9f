// Archivo: repository.rs
// Propósito: definir el trait `StateRepository` y las consultas que usa el
// motor. Describe el contrato que deben implementar los backends
// (in-memory, relacional, red) y decoradores como la caché en anillo.
use crate::command::CommitCommand;
use crate::domain::{Data, DelayedState, Labels, State, StateCtx, StateId};
use crate::errors::{FlowError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

/// Límite por defecto de una página de `get_states`.
pub const DEFAULT_STATES_LIMIT: usize = 50;
/// Límite por defecto de una página de `get_delayed_states`.
pub const DEFAULT_DELAYED_LIMIT: usize = 500;

/// Consulta paginada del log por revisión.
#[derive(Debug, Clone)]
pub struct GetStatesQuery {
    /// Revisión exclusiva desde la que leer. Negativo: sólo la última
    /// entrada del log.
    pub since_rev: i64,
    pub since_time: Option<DateTime<Utc>>,
    /// Filtros OR; cada uno exige todas sus etiquetas. Vacío = todo.
    pub labels: Vec<Labels>,
    /// Sólo la revisión más reciente de cada id.
    pub latest_only: bool,
    pub limit: usize,
}

impl Default for GetStatesQuery {
    fn default() -> Self {
        Self { since_rev: 0,
               since_time: None,
               labels: Vec::new(),
               latest_only: false,
               limit: DEFAULT_STATES_LIMIT }
    }
}

impl GetStatesQuery {
    pub fn since_rev(rev: i64) -> Self {
        Self { since_rev: rev,
               ..Default::default() }
    }

    /// Sólo la última entrada del log.
    pub fn latest() -> Self {
        Self { since_rev: -1,
               limit: 1,
               ..Default::default() }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels.push(labels);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_since_time(mut self, at: DateTime<Utc>) -> Self {
        self.since_time = Some(at);
        self
    }

    pub fn with_latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }

    /// True si el estado pasa los filtros de etiquetas y tiempo.
    pub fn matches(&self, state: &State) -> bool {
        let labels_ok = self.labels.is_empty() || self.labels.iter().any(|l| state.matches_labels(l));
        let time_ok = match (self.since_time, state.committed_at) {
            (Some(since), Some(at)) => at >= since,
            (Some(_), None) => false,
            (None, _) => true,
        };
        labels_ok && time_ok
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetStatesResult {
    pub states: Vec<State>,
    /// Hay más resultados tras el último devuelto.
    pub more: bool,
}

/// Ventana `[since, until)` de delays con `offset` mayor que el dado.
#[derive(Debug, Clone)]
pub struct GetDelayedQuery {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub offset: i64,
    pub limit: usize,
}

impl GetDelayedQuery {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>, offset: i64) -> Self {
        Self { since,
               until,
               offset,
               limit: DEFAULT_DELAYED_LIMIT }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetDelayedResult {
    pub states: Vec<DelayedState>,
    pub more: bool,
}

/// Contrato de almacenamiento del motor.
///
/// Toda mutación del log pasa por `commit`, que compara `committed.rev` de
/// cada subcomando con la última revisión almacenada del id.
pub trait StateRepository: Send + Sync {
    /// Estado por id; `rev == 0` pide la última revisión. `NotFound` si no
    /// existe.
    fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx>;

    /// Última revisión del estado más reciente que tiene todas las
    /// etiquetas.
    fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx>;

    /// Página del log en orden de revisión ascendente.
    fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult>;

    /// Página de delays pendientes, ordenados por `offset`.
    fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult>;

    /// Guarda una copia diferida; el almacenamiento asigna `offset`.
    fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState>;

    /// Borra el delay ya disparado o descartado.
    fn ack_delayed(&self, offset: i64) -> Result<()>;

    /// Aplica un bundle de forma atómica. En conflicto devuelve
    /// `FlowError::RevMismatch` con todos los ids y no persiste nada.
    fn commit(&self, cmd: &mut CommitCommand) -> Result<()>;

    /// Guarda un blob, asigna id (si falta) y la siguiente revisión.
    /// `Unsupported` si el backend no guarda datos.
    fn store_data(&self, data: &mut Data) -> Result<()> {
        Err(FlowError::Unsupported(format!("store_data de {}", data.id)))
    }

    /// Carga el contenido de `data.id` en `data.rev`.
    fn get_data(&self, data: &mut Data) -> Result<()> {
        Err(FlowError::Unsupported(format!("get_data de {}", data.id)))
    }

    /// Notificación de commits para watchers. `None` si el backend no la
    /// soporta (los watchers hacen polling).
    fn subscribe(&self) -> Option<Arc<Notify>> {
        None
    }
}

impl<R: StateRepository + ?Sized> StateRepository for Arc<R> {
    fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
        (**self).get_state_by_id(id, rev)
    }

    fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
        (**self).get_state_by_labels(labels)
    }

    fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
        (**self).get_states(query)
    }

    fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult> {
        (**self).get_delayed_states(query)
    }

    fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState> {
        (**self).delay(state, execute_at)
    }

    fn ack_delayed(&self, offset: i64) -> Result<()> {
        (**self).ack_delayed(offset)
    }

    fn commit(&self, cmd: &mut CommitCommand) -> Result<()> {
        (**self).commit(cmd)
    }

    fn store_data(&self, data: &mut Data) -> Result<()> {
        (**self).store_data(data)
    }

    fn get_data(&self, data: &mut Data) -> Result<()> {
        (**self).get_data(data)
    }

    fn subscribe(&self) -> Option<Arc<Notify>> {
        (**self).subscribe()
    }
}
