// Archivo: watcher.rs
// Propósito: seguir el log revisionado desde una revisión para pasos que
// esperan a otros estados.
use crate::domain::State;
use crate::errors::Result;
use crate::repository::{GetStatesQuery, StateRepository};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Cola de estados nuevos que pasan los filtros de la consulta.
///
/// Sin backend con notificación hace polling cada `poll_interval`; con
/// notificación se despierta en cada commit (y sigue haciendo polling por si
/// se perdió un aviso).
pub struct Watcher {
    repo: Arc<dyn StateRepository>,
    query: GetStatesQuery,
    buffer: VecDeque<State>,
    notify: Option<Arc<Notify>>,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(repo: Arc<dyn StateRepository>, query: GetStatesQuery, poll_interval: Duration) -> Self {
        let notify = repo.subscribe();
        Self { repo,
               query,
               buffer: VecDeque::new(),
               notify,
               poll_interval }
    }

    /// Revisión del último estado leído del log.
    pub fn since_rev(&self) -> i64 {
        self.query.since_rev
    }

    /// Siguiente estado, esperando como mucho `timeout`. Devuelve `None` si
    /// vence el plazo o se cancela `cancel`.
    pub async fn recv(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Option<State>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(state) = self.buffer.pop_front() {
                return Ok(Some(state));
            }

            let notify = self.notify.clone();
            let notified = async {
                match &notify {
                    Some(n) => n.notified().await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(notified);

            let res = self.repo.get_states(&self.query)?;
            if let Some(last) = res.states.last() {
                self.query.since_rev = last.rev;
            }
            self.buffer.extend(res.states);
            if !self.buffer.is_empty() || res.more {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = &mut notified => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
    }
}
