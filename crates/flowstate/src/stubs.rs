// Archivo: stubs.rs
// Propósito: implementación en memoria del contrato de almacenamiento para
// pruebas, demos y wiring rápido.
//
// No es durable. El log es global: la revisión `n` está en la posición
// `n - 1`, así que las revisiones son contiguas entre todos los ids.
use crate::clock::Clock;
use crate::command::{Command, CommitCommand};
use crate::domain::{Data, DataId, DelayedState, Labels, State, StateCtx, StateId};
use crate::errors::{FlowError, RevMismatch, Result};
use crate::repository::{
    GetDelayedQuery, GetDelayedResult, GetStatesQuery, GetStatesResult, StateRepository, DEFAULT_DELAYED_LIMIT,
    DEFAULT_STATES_LIMIT,
};
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct StateLog {
    entries: Vec<State>,
    /// Posición de la última revisión de cada id.
    latest: HashMap<StateId, usize>,
}

impl StateLog {
    fn latest_rev(&self, id: &StateId) -> i64 {
        self.latest.get(id).map(|&i| self.entries[i].rev).unwrap_or(0)
    }

    fn next_rev(&self) -> i64 {
        self.entries.len() as i64 + 1
    }

    fn append(&mut self, state: State) {
        self.latest.insert(state.id.clone(), self.entries.len());
        self.entries.push(state);
    }

    fn get_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
        let found = if rev == 0 {
            self.latest.get(id).map(|&i| &self.entries[i])
        } else {
            position(rev).and_then(|i| self.entries.get(i))
                         .filter(|s| &s.id == id)
        };
        found.map(State::to_ctx)
             .ok_or_else(|| FlowError::NotFound(format!("estado {} rev {}", id, rev)))
    }

    fn get_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(i, s)| self.latest.get(&s.id) == Some(i) && s.matches_labels(labels))
            .map(|(_, s)| s.to_ctx())
            .ok_or_else(|| FlowError::NotFound(format!("estado con etiquetas {:?}", labels)))
    }
}

/// Posición en el log de la revisión `rev` (`None` si `rev < 1`).
fn position(rev: i64) -> Option<usize> {
    rev.checked_sub(1).and_then(|i| usize::try_from(i).ok())
}

/// Versiones de cada blob; la revisión `n` está en la posición `n - 1`.
#[derive(Default)]
struct DataStore {
    versions: HashMap<DataId, Vec<Data>>,
}

impl DataStore {
    fn next_rev(&self, id: &DataId) -> i64 {
        self.versions.get(id).map_or(0, Vec::len) as i64 + 1
    }

    fn push(&mut self, data: Data) {
        self.versions.entry(data.id.clone()).or_default().push(data);
    }

    fn fetch(&self, data: &mut Data) -> Result<()> {
        let versions = self.versions
                           .get(&data.id)
                           .ok_or_else(|| FlowError::NotFound(format!("datos {}", data.id)))?;
        let found = if data.rev == 0 {
            versions.last()
        } else {
            position(data.rev).and_then(|i| versions.get(i))
        };
        let found = found.ok_or_else(|| FlowError::NotFound(format!("datos {} rev {}", data.id, data.rev)))?;
        *data = found.clone();
        Ok(())
    }
}

/// Asigna id (si falta) y revisión a un blob que todavía no se guardó.
/// `pending` son las escrituras ya preparadas en el mismo commit.
fn prepare_data(store: &DataStore, pending: &[Data], data: &mut Data) {
    if data.id.is_empty() {
        data.id = DataId::new(Uuid::new_v4().to_string());
    }
    let queued = pending.iter().filter(|d| d.id == data.id).count() as i64;
    data.rev = store.next_rev(&data.id) + queued;
}

#[derive(Default)]
struct DelayedLog {
    offset: i64,
    items: BTreeMap<i64, DelayedState>,
}

impl DelayedLog {
    fn push(&mut self, state: State, execute_at: DateTime<Utc>) -> DelayedState {
        self.offset += 1;
        let item = DelayedState { state,
                                  execute_at,
                                  offset: self.offset };
        self.items.insert(item.offset, item.clone());
        item
    }
}

/// Repositorio en memoria (no durable).
///
/// Los commits son todo-o-nada: primero se comprueba el CAS de todos los
/// ids y, si alguno falla, no se persiste nada.
pub struct InMemoryStateRepository {
    clock: Clock,
    log: Mutex<StateLog>,
    delayed: Mutex<DelayedLog>,
    data: Mutex<DataStore>,
    notify: Arc<Notify>,
}

impl InMemoryStateRepository {
    /// Crea una nueva instancia del repositorio en memoria.
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Usa `clock` para los timestamps de commit y los vencimientos.
    pub fn with_clock(clock: Clock) -> Self {
        Self { clock,
               log: Mutex::new(StateLog::default()),
               delayed: Mutex::new(DelayedLog::default()),
               data: Mutex::new(DataStore::default()),
               notify: Arc::new(Notify::new()) }
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Última revisión del log (0 si está vacío).
    pub fn head_rev(&self) -> Result<i64> {
        Ok(self.lock(&self.log)?.entries.len() as i64)
    }

    /// Número de delays pendientes.
    pub fn pending_delayed(&self) -> Result<usize> {
        Ok(self.lock(&self.delayed)?.items.len())
    }

    /// Helper para mapear `Mutex::lock()` en un `Result` con
    /// `FlowError::Storage`.
    fn lock<'a, T>(&'a self, m: &'a Mutex<T>) -> std::result::Result<MutexGuard<'a, T>, FlowError> {
        m.lock().map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }
}

impl Default for InMemoryStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl StateRepository for InMemoryStateRepository {
    fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
        self.lock(&self.log)?.get_by_id(id, rev)
    }

    fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
        self.lock(&self.log)?.get_by_labels(labels)
    }

    fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
        let log = self.lock(&self.log)?;
        // rev = posición + 1, así que `since_rev` es la posición de inicio.
        let start = if query.since_rev < 0 {
            log.entries.len().saturating_sub(1)
        } else {
            usize::try_from(query.since_rev).unwrap_or(usize::MAX)
        };
        let limit = if query.limit == 0 { DEFAULT_STATES_LIMIT } else { query.limit };

        let mut res = GetStatesResult::default();
        for (i, state) in log.entries.iter().enumerate().skip(start) {
            if !query.matches(state) {
                continue;
            }
            if query.latest_only && log.latest.get(&state.id) != Some(&i) {
                continue;
            }
            if res.states.len() == limit {
                res.more = true;
                break;
            }
            res.states.push(state.clone());
        }
        Ok(res)
    }

    fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult> {
        let delayed = self.lock(&self.delayed)?;
        let limit = if query.limit == 0 { DEFAULT_DELAYED_LIMIT } else { query.limit };

        let mut res = GetDelayedResult::default();
        let window = delayed.items
                            .range(query.offset.saturating_add(1)..)
                            .map(|(_, d)| d)
                            .filter(|d| d.execute_at >= query.since && d.execute_at < query.until);
        for item in window {
            if res.states.len() == limit {
                res.more = true;
                break;
            }
            res.states.push(item.clone());
        }
        Ok(res)
    }

    fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState> {
        let item = self.lock(&self.delayed)?.push(state, execute_at);
        debug!(id = %item.state.id, offset = item.offset, execute_at = %item.execute_at, "delay registrado");
        Ok(item)
    }

    fn ack_delayed(&self, offset: i64) -> Result<()> {
        self.lock(&self.delayed)?.items.remove(&offset);
        Ok(())
    }

    fn commit(&self, cmd: &mut CommitCommand) -> Result<()> {
        cmd.validate()?;
        let now = self.clock.now();
        // Se trabaja sobre una copia: si hay conflicto el bundle del caller
        // queda intacto.
        let mut work = cmd.clone();
        let mut log = self.lock(&self.log)?;
        let mut store = self.lock(&self.data)?;

        // Subcomandos con el mismo id comparten un único ctx en preparación.
        // Las lecturas se resuelven aquí y las escrituras de datos se
        // preparan; nada se persiste hasta pasar el CAS.
        let mut staged: IndexMap<StateId, StateCtx> = IndexMap::new();
        let mut tracked: IndexSet<StateId> = IndexSet::new();
        let mut writes: Vec<Data> = Vec::new();
        for sub in work.commands.iter_mut() {
            match sub {
                Command::GetStateById(c) => {
                    c.result = Some(log.get_by_id(&c.id, c.rev)?);
                    continue;
                }
                Command::GetStateByLabels(c) => {
                    c.result = Some(log.get_by_labels(&c.labels)?);
                    continue;
                }
                Command::GetData(c) => {
                    store.fetch(&mut c.data)?;
                    continue;
                }
                Command::StoreData(c) => {
                    prepare_data(&store, &writes, &mut c.data);
                    writes.push(c.data.clone());
                    continue;
                }
                _ => {}
            }
            let is_delay = matches!(sub, Command::Delay(_));
            let is_tracked = sub.is_tracked();
            let Some(ctx) = sub.state_ctx_mut() else {
                continue;
            };
            let id = ctx.id().clone();
            if let Some(prev) = staged.get(&id) {
                *ctx = prev.clone();
            }
            if is_delay {
                continue;
            }
            sub.apply()?;
            if let Command::DereferenceData(c) = sub {
                if let Some(data) = c.data.as_mut() {
                    store.fetch(data)?;
                }
            }
            if let Some(ctx) = sub.state_ctx() {
                staged.insert(id.clone(), ctx.clone());
            }
            if is_tracked {
                tracked.insert(id);
            }
        }

        let mut mismatch = RevMismatch::new();
        for id in &tracked {
            let expected = staged.get(id).map(StateCtx::expected_rev).unwrap_or(0);
            if expected != log.latest_rev(id) {
                mismatch.add(id.clone());
            }
        }
        mismatch.into_result()
                .inspect_err(|e| debug!(error = %e, "commit rechazado"))?;

        let mut delayed = self.lock(&self.delayed)?;
        let mut revs = Vec::with_capacity(tracked.len());
        for id in &tracked {
            if let Some(ctx) = staged.get_mut(id) {
                let mut stored = ctx.current.clone();
                stored.rev = log.next_rev();
                stored.committed_at = Some(now);
                revs.push(stored.rev);
                log.append(stored.clone());
                ctx.mark_committed(stored);
            }
        }
        drop(log);
        for data in writes {
            store.push(data);
        }
        drop(store);

        for sub in work.commands.iter_mut() {
            let Some(ctx) = sub.state_ctx_mut() else {
                continue;
            };
            if let Some(done) = staged.get(ctx.id()) {
                *ctx = done.clone();
            }
            // El delay copia el estado ya commiteado, con su nueva revisión.
            if let Command::Delay(d) = sub {
                let (snap, at) = d.snapshot(&d.state_ctx.current, now);
                d.result = Some(delayed.push(snap, at));
            }
        }
        drop(delayed);

        *cmd = work;
        if !revs.is_empty() {
            debug!(revs = ?revs, "commit aplicado");
            self.notify.notify_waiters();
        }
        Ok(())
    }

    fn store_data(&self, data: &mut Data) -> Result<()> {
        let mut store = self.lock(&self.data)?;
        prepare_data(&store, &[], data);
        store.push(data.clone());
        Ok(())
    }

    fn get_data(&self, data: &mut Data) -> Result<()> {
        self.lock(&self.data)?.fetch(data)
    }

    fn subscribe(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}
