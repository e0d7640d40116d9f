// Archivo: cache.rs
// Propósito: decorador de `StateRepository` con una caché en anillo de las
// revisiones más recientes del log.
//
// El anillo sólo contiene revisiones contiguas `(min_rev, max_rev]`. Las
// revisiones que llegan con hueco esperan en una lista pendiente hasta que
// `refresh_head` rellena el hueco desde el repositorio envuelto.
use crate::command::{Command, CommitCommand};
use crate::domain::{Data, DelayedState, Labels, State, StateCtx, StateId};
use crate::errors::{FlowError, RevMismatch, Result};
use crate::repository::{GetDelayedQuery, GetDelayedResult, GetStatesQuery, GetStatesResult, StateRepository};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_RING_CAPACITY: usize = 1000;
const PENDING_CAPACITY: usize = 100;
const REFRESH_BATCH: usize = 100;

#[derive(Debug, Default)]
struct Ring {
    capacity: usize,
    entries: VecDeque<State>,
    /// Revisiones commiteadas que llegaron con hueco.
    pending: BTreeMap<i64, State>,
}

impl Ring {
    fn min_rev(&self) -> Option<i64> {
        self.entries.front().map(|s| s.rev - 1)
    }

    fn max_rev(&self) -> Option<i64> {
        self.entries.back().map(|s| s.rev)
    }

    fn push(&mut self, state: State) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(state);
    }

    /// Añade `state` si continúa el anillo; si no, lo deja pendiente.
    fn offer(&mut self, state: State) {
        let Some(max) = self.max_rev() else {
            self.push(state);
            self.drain_pending();
            return;
        };
        if state.rev <= max {
            return;
        }
        if state.rev == max + 1 {
            self.push(state);
            self.drain_pending();
            return;
        }
        self.pending.insert(state.rev, state);
        if self.pending.len() > PENDING_CAPACITY {
            warn!(max_rev = max, "demasiadas revisiones pendientes; se reinicia la caché");
            self.entries.clear();
            self.pending.clear();
        }
    }

    fn drain_pending(&mut self) {
        while let Some(max) = self.max_rev() {
            let stale: Vec<i64> = self.pending.range(..=max).map(|(rev, _)| *rev).collect();
            for rev in stale {
                self.pending.remove(&rev);
            }
            match self.pending.remove(&(max + 1)) {
                Some(next) => self.push(next),
                None => break,
            }
        }
    }

    /// Última revisión de `id` presente en el anillo.
    fn latest_rev_of(&self, id: &StateId) -> Option<i64> {
        self.entries.iter().rev().find(|s| &s.id == id).map(|s| s.rev)
    }

    fn covers(&self, rev: i64) -> bool {
        match (self.min_rev(), self.max_rev()) {
            (Some(min), Some(max)) => rev > min && rev <= max,
            _ => false,
        }
    }

    fn get(&self, rev: i64) -> Option<&State> {
        let min = self.min_rev()?;
        usize::try_from(rev - min - 1).ok().and_then(|i| self.entries.get(i))
    }
}

/// Aciertos y fallos de lectura de la caché.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Decorador de lectura sobre otro repositorio.
///
/// - `get_states` por revisión (sin filtro de tiempo ni `latest_only`) con
///   `since_rev` en `[min_rev, max_rev)` se sirve desde el anillo.
/// - `get_state_by_id` con revisión explícita dentro del rango también.
/// - Todo lo demás pasa al repositorio envuelto.
///
/// El pre-chequeo de commit sólo puede rechazar: si el anillo ya tiene una
/// revisión más nueva de algún id, devuelve `RevMismatch` sin llamar al
/// backend.
pub struct CachedStateRepository<R: StateRepository> {
    inner: R,
    ring: Mutex<Ring>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<R: StateRepository> CachedStateRepository<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self { inner,
               ring: Mutex::new(Ring { capacity: capacity.max(1),
                                       ..Default::default() }),
               hits: AtomicU64::new(0),
               misses: AtomicU64::new(0) }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Rango `(min_rev, max_rev]` cubierto por el anillo, si no está vacío.
    pub fn range(&self) -> Result<Option<(i64, i64)>> {
        let ring = self.lock()?;
        Ok(ring.min_rev().zip(ring.max_rev()))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { hits: self.hits.load(Ordering::Relaxed),
                     misses: self.misses.load(Ordering::Relaxed) }
    }

    /// Trae las revisiones nuevas del repositorio envuelto. Con el anillo
    /// vacío sólo carga la última entrada del log. Devuelve cuántos estados
    /// leyó.
    pub fn refresh_head(&self) -> Result<usize> {
        let mut read = 0;
        loop {
            let since = self.lock()?.max_rev();
            let query = match since {
                Some(rev) => GetStatesQuery::since_rev(rev).with_limit(REFRESH_BATCH),
                None => GetStatesQuery::latest(),
            };
            let res = self.inner.get_states(&query)?;
            read += res.states.len();
            let mut ring = self.lock()?;
            for state in res.states {
                ring.offer(state);
            }
            if !res.more || since.is_none() {
                break;
            }
        }
        Ok(read)
    }

    fn lock(&self) -> std::result::Result<MutexGuard<'_, Ring>, FlowError> {
        self.ring
            .lock()
            .map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl<R: StateRepository + 'static> CachedStateRepository<R> {
    /// Lanza una tarea que llama a `refresh_head` cada `interval` hasta que
    /// se cancele `cancel`.
    pub fn spawn_head_refresher(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_head() {
                            warn!(error = %e, "no se pudo refrescar la caché");
                        }
                    }
                }
            }
        })
    }
}

impl<R: StateRepository> StateRepository for CachedStateRepository<R> {
    fn get_state_by_id(&self, id: &StateId, rev: i64) -> Result<StateCtx> {
        if rev > 0 {
            let ring = self.lock()?;
            if ring.covers(rev) {
                self.hit();
                return ring.get(rev)
                           .filter(|s| &s.id == id)
                           .map(State::to_ctx)
                           .ok_or_else(|| FlowError::NotFound(format!("estado {} rev {}", id, rev)));
            }
        }
        self.miss();
        self.inner.get_state_by_id(id, rev)
    }

    fn get_state_by_labels(&self, labels: &Labels) -> Result<StateCtx> {
        self.inner.get_state_by_labels(labels)
    }

    fn get_states(&self, query: &GetStatesQuery) -> Result<GetStatesResult> {
        if query.since_time.is_none() && !query.latest_only && query.since_rev >= 0 {
            let ring = self.lock()?;
            if let (Some(min), Some(max)) = (ring.min_rev(), ring.max_rev()) {
                if query.since_rev >= min && query.since_rev < max {
                    self.hit();
                    let limit = if query.limit == 0 { crate::repository::DEFAULT_STATES_LIMIT } else { query.limit };
                    let mut res = GetStatesResult::default();
                    for state in ring.entries.iter().filter(|s| s.rev > query.since_rev && query.matches(s)) {
                        if res.states.len() == limit {
                            res.more = true;
                            break;
                        }
                        res.states.push(state.clone());
                    }
                    return Ok(res);
                }
            }
        }
        self.miss();
        self.inner.get_states(query)
    }

    fn get_delayed_states(&self, query: &GetDelayedQuery) -> Result<GetDelayedResult> {
        self.inner.get_delayed_states(query)
    }

    fn delay(&self, state: State, execute_at: DateTime<Utc>) -> Result<DelayedState> {
        self.inner.delay(state, execute_at)
    }

    fn ack_delayed(&self, offset: i64) -> Result<()> {
        self.inner.ack_delayed(offset)
    }

    fn commit(&self, cmd: &mut CommitCommand) -> Result<()> {
        {
            let ring = self.lock()?;
            let mut seen = HashSet::new();
            let mut mismatch = RevMismatch::new();
            for ctx in cmd.commands
                          .iter()
                          .filter(|sub| sub.is_tracked())
                          .filter_map(Command::state_ctx)
                          .filter(|ctx| seen.insert(ctx.id().clone()))
            {
                if ring.latest_rev_of(ctx.id()).is_some_and(|rev| rev > ctx.expected_rev()) {
                    mismatch.add(ctx.id().clone());
                }
            }
            if !mismatch.is_empty() {
                debug!(conflicts = %mismatch, "commit rechazado por la caché");
                return Err(mismatch.into());
            }
        }

        self.inner.commit(cmd)?;

        let mut committed: Vec<State> = cmd.commands
                                           .iter()
                                           .filter(|sub| sub.is_tracked())
                                           .filter_map(Command::state_ctx)
                                           .map(|ctx| ctx.committed.clone())
                                           .filter(|s| s.rev > 0)
                                           .collect();
        committed.sort_by_key(|s| s.rev);
        committed.dedup_by_key(|s| s.rev);
        let mut ring = self.lock()?;
        for state in committed {
            ring.offer(state);
        }
        Ok(())
    }

    fn store_data(&self, data: &mut Data) -> Result<()> {
        self.inner.store_data(data)
    }

    fn get_data(&self, data: &mut Data) -> Result<()> {
        self.inner.get_data(data)
    }

    fn subscribe(&self) -> Option<Arc<Notify>> {
        self.inner.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str, rev: i64) -> State {
        State { rev,
                ..State::new(id) }
    }

    #[test]
    fn ring_keeps_contiguous_revisions_and_waits_on_gaps() {
        let mut ring = Ring { capacity: 3,
                              ..Default::default() };
        ring.offer(state("a", 1));
        ring.offer(state("b", 2));
        ring.offer(state("a", 4));
        assert_eq!(ring.max_rev(), Some(2));
        assert_eq!(ring.pending.len(), 1);

        ring.offer(state("c", 3));
        assert_eq!(ring.max_rev(), Some(4));
        assert_eq!(ring.min_rev(), Some(1));
        assert!(ring.pending.is_empty());
        assert_eq!(ring.latest_rev_of(&StateId::new("a")), Some(4));
        assert_eq!(ring.get(3).map(|s| s.id.as_str()), Some("c"));
        assert!(!ring.covers(1));
        assert!(ring.covers(2));
    }
}
