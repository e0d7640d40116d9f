// Archivo: lease.rs
// Propósito: lease de liderazgo sobre un meta-estado reservado, basado en el
// CAS de commit.
//
// El meta-estado guarda el titular (`flowstate.lease.holder`) y el watermark
// del componente. Se crea con `Pause`, se toma con `Resume` y cada commit del
// líder renueva el lease. Un commit que pierde el CAS significa que otra
// instancia es líder.
use crate::annotations;
use crate::command::{Command, CommitCommand};
use crate::domain::{State, StateCtx, StateId};
use crate::engine::FlowEngine;
use crate::errors::Result;
use crate::clock;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) struct Lease {
    meta_id: StateId,
    holder: String,
    /// Última copia conocida del meta-estado.
    meta: StateCtx,
    active: bool,
    /// Commits del meta-estado hechos por esta instancia.
    committed: u64,
}

impl Lease {
    /// Arranque: crea el meta-estado si falta (queda como líder) o lo toma
    /// si está liberado o caducado. Si otra instancia lo creó a la vez, queda
    /// en standby.
    pub(crate) fn acquire<F>(engine: &FlowEngine,
                             meta_id: StateId,
                             holder: String,
                             stale_after: Duration,
                             init: F)
                             -> Result<Lease>
        where F: FnOnce(&mut StateCtx)
    {
        let mut lease = Lease { meta_id: meta_id.clone(),
                                holder,
                                meta: StateCtx::default(),
                                active: false,
                                committed: 0 };

        match engine.repository().get_state_by_id(&meta_id, 0) {
            Ok(meta) => {
                lease.meta = meta;
                lease.try_takeover(engine, stale_after)?;
            }
            Err(e) if e.is_not_found() => {
                let mut ctx = StateCtx::new(State::new(meta_id.clone()));
                annotations::disable_recovery(&mut ctx);
                init(&mut ctx);
                ctx.current.set_annotation(annotations::LEASE_HOLDER, lease.holder.clone());
                let mut cmd = CommitCommand::new(vec![Command::pause(ctx)]);
                match engine.repository().commit(&mut cmd) {
                    Ok(()) => {
                        lease.meta = Command::Commit(cmd).into_state_ctx().unwrap_or_default();
                        lease.active = true;
                        lease.committed += 1;
                        info!(meta = %meta_id, holder = %lease.holder, "meta-estado creado; instancia activa");
                    }
                    Err(e) if e.is_rev_mismatch() => {
                        warn!(meta = %meta_id, "otra instancia creó el meta-estado; se queda en standby");
                        lease.refresh(engine)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
        Ok(lease)
    }

    pub(crate) fn meta_id(&self) -> &StateId {
        &self.meta_id
    }

    pub(crate) fn meta(&self) -> &State {
        &self.meta.current
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn committed(&self) -> u64 {
        self.committed
    }

    /// Relee el meta-estado; si el titular ya no es esta instancia, pasa a
    /// standby.
    pub(crate) fn refresh(&mut self, engine: &FlowEngine) -> Result<()> {
        self.meta = engine.repository().get_state_by_id(&self.meta_id, 0)?;
        if annotations::lease_holder(&self.meta.current) != self.holder {
            self.active = false;
        }
        Ok(())
    }

    /// Toma el lease si está liberado o si el último commit del titular es
    /// más viejo que `stale_after`. Devuelve si esta instancia es líder.
    pub(crate) fn try_takeover(&mut self, engine: &FlowEngine, stale_after: Duration) -> Result<bool> {
        if self.active {
            return Ok(true);
        }
        let current = annotations::lease_holder(&self.meta.current).to_string();
        let stale = self.meta
                        .committed
                        .committed_at
                        .map(|at| clock::shift(at, stale_after) <= engine.now())
                        .unwrap_or(true);
        if !current.is_empty() && current != self.holder && !stale {
            return Ok(false);
        }

        let mut next = self.meta.clone();
        next.current.set_annotation(annotations::LEASE_HOLDER, self.holder.clone());
        let mut cmd = CommitCommand::new(vec![Command::resume(next)]);
        match engine.repository().commit(&mut cmd) {
            Ok(()) => {
                self.meta = Command::Commit(cmd).into_state_ctx().unwrap_or_default();
                self.active = true;
                self.committed += 1;
                info!(meta = %self.meta_id, holder = %self.holder, previous = %current, "lease tomado");
                Ok(true)
            }
            Err(e) if e.is_rev_mismatch() => {
                self.refresh(engine)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Commit del meta-estado como líder (watermark y/o keepalive). Si pierde
    /// el CAS, pasa a standby y devuelve `false`.
    pub(crate) fn commit<F>(&mut self, engine: &FlowEngine, update: F) -> Result<bool>
        where F: FnOnce(&mut StateCtx)
    {
        if !self.active {
            return Ok(false);
        }
        let mut next = self.meta.clone();
        update(&mut next);
        next.current.set_annotation(annotations::LEASE_HOLDER, self.holder.clone());
        let mut cmd = CommitCommand::new(vec![Command::commit_state_ctx(next)]);
        match engine.repository().commit(&mut cmd) {
            Ok(()) => {
                self.meta = Command::Commit(cmd).into_state_ctx().unwrap_or_default();
                self.committed += 1;
                Ok(true)
            }
            Err(e) if e.is_rev_mismatch() => {
                warn!(meta = %self.meta_id, holder = %self.holder, "lease perdido");
                self.active = false;
                self.refresh(engine)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Revisa un commit del meta-estado visto en el log. Un commit más nuevo
    /// de otro titular significa que esta instancia perdió el lease; devuelve
    /// `true` en ese caso.
    pub(crate) fn observe(&mut self, state: &State) -> bool {
        if state.id != self.meta_id || state.rev <= self.meta.committed.rev {
            return false;
        }
        self.meta = state.to_ctx();
        if annotations::lease_holder(state) != self.holder && self.active {
            warn!(meta = %self.meta_id, holder = %annotations::lease_holder(state), "otra instancia tomó el lease");
            self.active = false;
            return true;
        }
        false
    }

    /// Libera el lease (titular vacío) dejando el último watermark.
    pub(crate) fn release<F>(&mut self, engine: &FlowEngine, update: F) -> Result<()>
        where F: FnOnce(&mut StateCtx)
    {
        if !self.active {
            return Ok(());
        }
        let mut next = self.meta.clone();
        update(&mut next);
        next.current.set_annotation(annotations::LEASE_HOLDER, "");
        let mut cmd = CommitCommand::new(vec![Command::pause(next)]);
        self.active = false;
        match engine.repository().commit(&mut cmd) {
            Ok(()) => {
                self.meta = Command::Commit(cmd).into_state_ctx().unwrap_or_default();
                self.committed += 1;
                info!(meta = %self.meta_id, holder = %self.holder, "lease liberado");
                Ok(())
            }
            Err(e) if e.is_rev_mismatch() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Momento del último commit conocido del meta-estado.
    pub(crate) fn last_commit_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.meta.committed.committed_at
    }
}
