// Archivo: clock.rs
// Propósito: reloj UTC anclado al reloj monotónico de tokio.
//
// Timestamps de commit, vencimientos de reintento y de delays salen de la
// misma fuente; con el reloj de tokio pausado las pruebas avanzan el tiempo
// de forma determinista.
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_utc: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Reloj cuyo "ahora" empieza en `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self { anchor_utc: at,
               anchor: Instant::now() }
    }

    pub fn now(&self) -> DateTime<Utc> {
        shift(self.anchor_utc, self.anchor.elapsed())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// `at + d`, saturando si la duración no cabe en chrono.
pub fn shift(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d).ok()
                                 .and_then(|d| at.checked_add_signed(d))
                                 .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - d`, saturando en el mínimo representable.
pub fn unshift(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d).ok()
                                 .and_then(|d| at.checked_sub_signed(d))
                                 .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
