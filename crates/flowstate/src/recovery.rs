// Archivo: recovery.rs
// Propósito: reintentar estados cuya ejecución se quedó a medias (proceso
// caído o paso colgado) con un número acotado de intentos.
//
// Una sola instancia activa por log, elegida con el lease del meta-estado
// de recovery. El resto queda en standby y toma el relevo cuando el lease se
// libera o caduca.
use crate::annotations;
use crate::clock;
use crate::command::Command;
use crate::config::RecovererConfig;
use crate::domain::{State, StateId};
use crate::engine::FlowEngine;
use crate::errors::{lock, FlowError, Result};
use crate::lease::Lease;
use crate::repository::GetStatesQuery;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Contadores del recoverer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecovererStats {
    /// Última revisión vista por el head scan.
    pub head_rev: i64,
    /// Watermark: todo lo anterior está resuelto.
    pub tail_rev: i64,
    pub added: u64,
    pub completed: u64,
    pub retried: u64,
    pub dropped: u64,
    pub committed: u64,
    pub tracked: usize,
    pub active: bool,
}

struct Tracked {
    state: State,
    retry_at: DateTime<Utc>,
}

struct RecoveryState {
    lease: Lease,
    /// Posición del head scan en el log.
    since_rev: i64,
    head_rev: i64,
    tracked: HashMap<StateId, Tracked>,
    added: u64,
    completed: u64,
    retried: u64,
    dropped: u64,
}

impl RecoveryState {
    fn persisted_since_rev(&self) -> i64 {
        self.lease
            .meta()
            .annotations
            .get(annotations::RECOVERY_SINCE_REV)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Vuelve a empezar desde el watermark guardado en el meta-estado.
    fn reset(&mut self) {
        self.tracked.clear();
        self.since_rev = self.persisted_since_rev();
        self.head_rev = self.since_rev;
    }

    fn watermark(&self) -> i64 {
        self.tracked
            .values()
            .map(|t| t.state.rev - 1)
            .min()
            .unwrap_or(self.since_rev)
    }

    fn stats(&self) -> RecovererStats {
        RecovererStats { head_rev: self.head_rev,
                         tail_rev: self.watermark(),
                         added: self.added,
                         completed: self.completed,
                         retried: self.retried,
                         dropped: self.dropped,
                         committed: self.lease.committed(),
                         tracked: self.tracked.len(),
                         active: self.lease.is_active() }
    }

    fn update_head(&mut self, engine: &FlowEngine, cfg: &RecovererConfig) -> Result<()> {
        if !self.lease.is_active() {
            return Ok(());
        }
        loop {
            if self.tracked.len() >= cfg.max_tracked {
                debug!(tracked = self.tracked.len(), "conjunto de trabajo lleno; se pausa el head scan");
                return Ok(());
            }
            let query = GetStatesQuery::since_rev(self.since_rev).with_limit(cfg.batch_limit);
            let res = engine.repository().get_states(&query)?;
            for state in res.states {
                self.since_rev = state.rev;
                if &state.id == self.lease.meta_id() {
                    if self.lease.observe(&state) {
                        self.reset();
                        return Ok(());
                    }
                    continue;
                }
                if !annotations::recovery_enabled(&state) {
                    continue;
                }
                self.head_rev = state.rev;

                if state.is_ended() || state.is_paused() {
                    self.tracked.remove(&state.id);
                    self.completed += 1;
                    continue;
                }
                let Some(committed_at) = state.committed_at else {
                    continue;
                };
                let retry_at = clock::shift(committed_at, cfg.clamp_retry_after(annotations::retry_after(&state)));
                self.tracked.insert(state.id.clone(), Tracked { state, retry_at });
                self.added += 1;
            }
            if !res.more {
                return Ok(());
            }
        }
    }

    fn update_tail(&mut self, engine: &FlowEngine, cfg: &RecovererConfig) -> Result<()> {
        if !self.lease.is_active() {
            self.lease.refresh(engine)?;
            if self.lease.try_takeover(engine, cfg.stale_after())? {
                self.reset();
            }
            return Ok(());
        }

        let now = engine.now();
        let due: Vec<StateId> = self.tracked
                                    .iter()
                                    .filter(|(_, t)| t.retry_at <= now)
                                    .map(|(id, _)| id.clone())
                                    .collect();
        for id in due {
            let Some(t) = self.tracked.remove(&id) else {
                continue;
            };
            if let Err(e) = self.retry(engine, cfg, &t.state) {
                warn!(id = %id, error = %e, "no se pudo reintentar; se repite en el próximo tick");
                self.tracked.insert(id, t);
            }
        }

        self.maybe_commit(engine, cfg, now)
    }

    fn retry(&mut self, engine: &FlowEngine, cfg: &RecovererConfig, state: &State) -> Result<()> {
        let attempt = annotations::recovery_attempt(state) + 1;
        let max = annotations::max_attempts(state, cfg.max_attempts);
        let mut ctx = state.to_ctx();
        annotations::set_recovery_attempt(&mut ctx, attempt);

        if attempt > max {
            match engine.commit(vec![Command::end(ctx)]) {
                Ok(_) => {
                    self.dropped += 1;
                    warn!(id = %state.id, attempts = max, "se agotaron los reintentos; estado terminado");
                }
                Err(e) if e.is_rev_mismatch() => debug!(id = %state.id, "el estado avanzó antes de terminarlo"),
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        match engine.commit(vec![Command::commit_state_ctx(ctx)]) {
            Ok(cmd) => {
                self.retried += 1;
                info!(id = %state.id, attempt, "reintentando estado");
                if let Some(ctx) = Command::Commit(cmd).into_state_ctx() {
                    engine.spawn_execute(ctx);
                }
            }
            Err(e) if e.is_rev_mismatch() => debug!(id = %state.id, "el estado avanzó antes del reintento"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Commit del watermark por salto de revisiones, por intervalo si se
    /// movió, o como keepalive del lease.
    fn maybe_commit(&mut self, engine: &FlowEngine, cfg: &RecovererConfig, now: DateTime<Utc>) -> Result<()> {
        let persisted = self.persisted_since_rev();
        let next = self.watermark();
        let passed = |d: Duration| {
            self.lease
                .last_commit_at()
                .map(|at| clock::shift(at, d) <= now)
                .unwrap_or(true)
        };
        let due = next - persisted > cfg.commit_rev_gap
                  || (next != persisted && passed(cfg.commit_interval))
                  || passed(cfg.keepalive_interval());
        if !due {
            return Ok(());
        }
        let committed = self.lease.commit(engine, |ctx| {
                                      ctx.current.set_annotation(annotations::RECOVERY_SINCE_REV, next.to_string())
                                  })?;
        if !committed {
            self.reset();
        }
        Ok(())
    }
}

/// Recoverer con un bucle de fondo (head scan y tail scan).
pub struct Recoverer {
    engine: FlowEngine,
    state: Arc<Mutex<RecoveryState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Recoverer {
    /// Arranca el recoverer: toma (o no) el lease y lanza el bucle de fondo.
    pub fn start(engine: FlowEngine, config: RecovererConfig) -> Result<Recoverer> {
        config.validate()?;
        let lease = Lease::acquire(&engine,
                                   config.meta_id.clone(),
                                   config.holder.clone(),
                                   config.stale_after(),
                                   |ctx| ctx.current.set_annotation(annotations::RECOVERY_SINCE_REV, "0"))?;
        let mut state = RecoveryState { lease,
                                        since_rev: 0,
                                        head_rev: 0,
                                        tracked: HashMap::new(),
                                        added: 0,
                                        completed: 0,
                                        retried: 0,
                                        dropped: 0 };
        state.reset();
        info!(holder = %config.holder, active = state.lease.is_active(), since_rev = state.since_rev, "recoverer iniciado");

        let state = Arc::new(Mutex::new(state));
        let cancel = engine.shutdown_token();
        let handle = tokio::spawn(run(engine.clone(), config, state.clone(), cancel.clone()));
        Ok(Recoverer { engine,
                       state,
                       cancel,
                       handle: Mutex::new(Some(handle)) })
    }

    pub fn stats(&self) -> RecovererStats {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    pub fn is_active(&self) -> bool {
        self.stats().active
    }

    /// Detiene el bucle, espera hasta `deadline` y libera el lease dejando
    /// el watermark guardado.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        let handle = lock(&self.handle)?.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(FlowError::Other(format!("tarea del recoverer: {}", e))),
                Err(_) => return Err(FlowError::Shutdown("recoverer".into())),
            }
        }

        let mut state = lock(&self.state)?;
        let next = state.watermark();
        if let Err(e) = state.lease.release(&self.engine, |ctx| {
                                        ctx.current.set_annotation(annotations::RECOVERY_SINCE_REV, next.to_string())
                                    })
        {
            error!(error = %e, "no se pudo liberar el lease del recoverer");
        }
        state.tracked.clear();
        Ok(())
    }
}

async fn run(engine: FlowEngine, config: RecovererConfig, state: Arc<Mutex<RecoveryState>>, cancel: CancellationToken) {
    let mut head = interval(config.head_interval);
    head.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tail = interval(config.tail_interval);
    tail.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = head.tick() => tick(&state, "head", |s| s.update_head(&engine, &config)),
            _ = tail.tick() => tick(&state, "tail", |s| s.update_tail(&engine, &config)),
        }
    }
}

/// Ejecuta un scan con el estado bloqueado. Los errores se registran y el
/// scan se repite en el siguiente tick.
fn tick<F>(state: &Mutex<RecoveryState>, scan: &str, f: F)
    where F: FnOnce(&mut RecoveryState) -> Result<()>
{
    match lock(state) {
        Ok(mut guard) => {
            if let Err(e) = f(&mut guard) {
                warn!(scan, error = %e, "scan de recovery fallido");
            }
        }
        Err(e) => error!(scan, error = %e, "estado del recoverer inaccesible"),
    }
}
