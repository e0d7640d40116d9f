// Archivo: delayer.rs
// Propósito: disparar las re-ejecuciones diferidas (`Delay`) una vez por
// vencimiento.
//
// Tres scans alimentan un mapa en memoria indexado por `offset`:
// - horizon: avanza una ventana de tiempo desde el watermark hasta
//   `now + lookahead`;
// - freshness: relee las últimas horas buscando offsets nuevos (delays
//   insertados detrás del horizonte);
// - fire: commitea la copia, hace ack y lanza la ejecución.
// Igual que el recoverer, sólo la instancia con el lease del meta-estado
// trabaja; las demás esperan en standby.
use crate::annotations;
use crate::clock;
use crate::command::Command;
use crate::config::DelayerConfig;
use crate::domain::DelayedState;
use crate::engine::FlowEngine;
use crate::errors::{lock, FlowError, Result};
use crate::lease::Lease;
use crate::repository::GetDelayedQuery;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayerStats {
    pub active: bool,
    pub tracked: usize,
    pub fired: u64,
    /// Delays descartados porque el estado avanzó antes de dispararse.
    pub skipped: u64,
    pub committed: u64,
}

struct DelayerState {
    lease: Lease,
    /// Inicio de la próxima ventana del horizon scan.
    since: DateTime<Utc>,
    /// Mayor offset visto por el freshness scan.
    offset: i64,
    tracked: BTreeMap<i64, DelayedState>,
    fired: u64,
    skipped: u64,
}

impl DelayerState {
    fn persisted(&self) -> (DateTime<Utc>, i64) {
        let meta = self.lease.meta();
        let since = meta.annotations
                        .get(annotations::DELAYER_SINCE)
                        .and_then(|v| annotations::parse_time(v))
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let offset = meta.annotations
                         .get(annotations::DELAYER_OFFSET)
                         .and_then(|v| v.parse().ok())
                         .unwrap_or(0);
        (since, offset)
    }

    fn reset(&mut self) {
        self.tracked.clear();
        (self.since, self.offset) = self.persisted();
    }

    /// Desde dónde hay que re-escanear tras un reinicio: lo más antiguo
    /// entre el horizonte y los delays aún sin disparar.
    fn watermark(&self) -> (DateTime<Utc>, i64) {
        let since = self.tracked
                        .values()
                        .map(|d| d.execute_at)
                        .min()
                        .map_or(self.since, |at| at.min(self.since));
        (since, self.offset)
    }

    fn stats(&self) -> DelayerStats {
        DelayerStats { active: self.lease.is_active(),
                       tracked: self.tracked.len(),
                       fired: self.fired,
                       skipped: self.skipped,
                       committed: self.lease.committed() }
    }

    /// Trae al mapa los delays de `[since, until)` con offset mayor que
    /// `offset`. Devuelve el mayor offset visto y si la ventana se leyó
    /// completa.
    fn pull(&mut self,
            engine: &FlowEngine,
            cfg: &DelayerConfig,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
            offset: i64)
            -> Result<(i64, bool)> {
        let mut offset = offset;
        loop {
            if self.tracked.len() >= cfg.max_tracked {
                debug!(tracked = self.tracked.len(), "mapa de delays lleno");
                return Ok((offset, false));
            }
            let query = GetDelayedQuery::new(since, until, offset).with_limit(cfg.batch_limit);
            let res = engine.repository().get_delayed_states(&query)?;
            for item in res.states {
                offset = offset.max(item.offset);
                self.tracked.entry(item.offset).or_insert(item);
            }
            if !res.more {
                return Ok((offset, true));
            }
        }
    }

    fn horizon(&mut self, engine: &FlowEngine, cfg: &DelayerConfig) -> Result<()> {
        if !self.lease.is_active() {
            self.lease.refresh(engine)?;
            if self.lease.try_takeover(engine, cfg.stale_after())? {
                self.reset();
            }
            return Ok(());
        }
        let until = clock::shift(engine.now(), cfg.horizon_lookahead);
        if self.since >= until {
            return Ok(());
        }
        let (_, complete) = self.pull(engine, cfg, self.since, until, 0)?;
        if complete {
            self.since = until;
        }
        Ok(())
    }

    fn freshness(&mut self, engine: &FlowEngine, cfg: &DelayerConfig) -> Result<()> {
        if !self.lease.is_active() {
            return Ok(());
        }
        let now = engine.now();
        let since = if self.offset == 0 {
            DateTime::<Utc>::UNIX_EPOCH
        } else {
            clock::unshift(now, cfg.freshness_lookback)
        };
        let until = clock::shift(now, cfg.horizon_lookahead);
        let (offset, _) = self.pull(engine, cfg, since, until, self.offset)?;
        self.offset = offset;
        Ok(())
    }

    fn fire(&mut self, engine: &FlowEngine) -> Result<()> {
        if !self.lease.is_active() {
            return Ok(());
        }
        let now = engine.now();
        let mut due: Vec<(DateTime<Utc>, i64)> = self.tracked
                                                     .values()
                                                     .filter(|d| d.execute_at <= now)
                                                     .map(|d| (d.execute_at, d.offset))
                                                     .collect();
        due.sort();
        for (_, offset) in due {
            let Some(item) = self.tracked.get(&offset).cloned() else {
                continue;
            };
            match self.fire_one(engine, &item) {
                Ok(()) => {
                    self.tracked.remove(&offset);
                }
                Err(e) => warn!(offset, id = %item.state.id, error = %e, "no se pudo disparar; se reintenta"),
            }
        }
        Ok(())
    }

    fn fire_one(&mut self, engine: &FlowEngine, item: &DelayedState) -> Result<()> {
        let ctx = item.state.to_ctx();
        let commit = item.state.transition.annotation(annotations::DELAY_COMMIT) != Some("false");
        let ctx = if commit {
            match engine.commit(vec![Command::commit_state_ctx(ctx)]) {
                Ok(cmd) => Command::Commit(cmd).into_state_ctx()
                                               .ok_or_else(|| FlowError::Other("commit sin ctx".into()))?,
                Err(e) if e.is_rev_mismatch() => {
                    debug!(id = %item.state.id, offset = item.offset, "el estado avanzó; delay descartado");
                    engine.repository().ack_delayed(item.offset)?;
                    self.skipped += 1;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        } else {
            ctx
        };
        engine.repository().ack_delayed(item.offset)?;
        self.fired += 1;
        debug!(id = %item.state.id, offset = item.offset, to = %ctx.current.transition.to, "delay disparado");
        engine.spawn_execute(ctx);
        Ok(())
    }

    fn maybe_commit(&mut self, engine: &FlowEngine, cfg: &DelayerConfig) -> Result<()> {
        if !self.lease.is_active() {
            return Ok(());
        }
        let now = engine.now();
        let (since, offset) = self.watermark();
        let changed = (since, offset) != self.persisted();
        let keepalive = self.lease
                            .last_commit_at()
                            .map(|at| clock::shift(at, cfg.keepalive_interval()) <= now)
                            .unwrap_or(true);
        if !changed && !keepalive {
            return Ok(());
        }
        let committed = self.lease.commit(engine, |ctx| {
                                      ctx.current.set_annotation(annotations::DELAYER_SINCE, annotations::format_time(since));
                                      ctx.current.set_annotation(annotations::DELAYER_OFFSET, offset.to_string());
                                  })?;
        if !committed {
            self.reset();
        }
        Ok(())
    }
}

/// Programador de delays con un bucle de fondo.
pub struct Delayer {
    engine: FlowEngine,
    state: Arc<Mutex<DelayerState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Delayer {
    pub fn start(engine: FlowEngine, config: DelayerConfig) -> Result<Delayer> {
        config.validate()?;
        let lease = Lease::acquire(&engine,
                                   config.meta_id.clone(),
                                   config.holder.clone(),
                                   config.stale_after(),
                                   |ctx| {
                                       ctx.current.set_annotation(annotations::DELAYER_SINCE,
                                                                  annotations::format_time(DateTime::<Utc>::UNIX_EPOCH));
                                       ctx.current.set_annotation(annotations::DELAYER_OFFSET, "0");
                                   })?;
        let mut state = DelayerState { lease,
                                       since: DateTime::<Utc>::UNIX_EPOCH,
                                       offset: 0,
                                       tracked: BTreeMap::new(),
                                       fired: 0,
                                       skipped: 0 };
        state.reset();
        info!(holder = %config.holder, active = state.lease.is_active(), "delayer iniciado");

        let state = Arc::new(Mutex::new(state));
        let cancel = engine.shutdown_token();
        let handle = tokio::spawn(run(engine.clone(), config, state.clone(), cancel.clone()));
        Ok(Delayer { engine,
                     state,
                     cancel,
                     handle: Mutex::new(Some(handle)) })
    }

    pub fn stats(&self) -> DelayerStats {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    pub fn is_active(&self) -> bool {
        self.stats().active
    }

    /// Detiene el bucle, guarda el watermark y libera el lease.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.cancel.cancel();
        let handle = lock(&self.handle)?.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(FlowError::Other(format!("tarea del delayer: {}", e))),
                Err(_) => return Err(FlowError::Shutdown("delayer".into())),
            }
        }

        let mut state = lock(&self.state)?;
        let (since, offset) = state.watermark();
        if let Err(e) = state.lease.release(&self.engine, |ctx| {
                                        ctx.current.set_annotation(annotations::DELAYER_SINCE, annotations::format_time(since));
                                        ctx.current.set_annotation(annotations::DELAYER_OFFSET, offset.to_string());
                                    })
        {
            error!(error = %e, "no se pudo liberar el lease del delayer");
        }
        state.tracked.clear();
        Ok(())
    }
}

async fn run(engine: FlowEngine, config: DelayerConfig, state: Arc<Mutex<DelayerState>>, cancel: CancellationToken) {
    let mut horizon = interval(config.horizon_interval);
    let mut freshness = interval(config.freshness_interval);
    let mut fire = interval(config.fire_interval);
    let mut commit = interval(config.commit_interval);
    for ticker in [&mut horizon, &mut freshness, &mut fire, &mut commit] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }
    // El primer tick de commit es inmediato; se salta para no commitear al
    // arrancar.
    commit.reset();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = horizon.tick() => tick(&state, "horizon", |s| s.horizon(&engine, &config)),
            _ = freshness.tick() => tick(&state, "freshness", |s| s.freshness(&engine, &config)),
            _ = fire.tick() => tick(&state, "fire", |s| s.fire(&engine)),
            _ = commit.tick() => tick(&state, "commit", |s| s.maybe_commit(&engine, &config)),
        }
    }
}

fn tick<F>(state: &Mutex<DelayerState>, scan: &str, f: F)
    where F: FnOnce(&mut DelayerState) -> Result<()>
{
    match lock(state) {
        Ok(mut guard) => {
            if let Err(e) = f(&mut guard) {
                warn!(scan, error = %e, "scan del delayer fallido");
            }
        }
        Err(e) => error!(scan, error = %e, "estado del delayer inaccesible"),
    }
}
