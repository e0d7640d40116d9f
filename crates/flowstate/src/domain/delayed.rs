// Archivo: domain/delayed.rs
use super::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Re-ejecución diferida: copia del estado, hora de vencimiento y `offset`
/// (secuencia de inserción asignada por el almacenamiento, usada para
/// deduplicar y paginar).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedState {
    pub state: State,
    pub execute_at: DateTime<Utc>,
    pub offset: i64,
}
