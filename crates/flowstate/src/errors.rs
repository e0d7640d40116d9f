// Archivo: errors.rs
// Propósito: definir los errores del dominio y el alias Result<T> usado por
// las APIs del crate. Los comentarios y variantes están en español.
use crate::domain::StateId;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Conflicto de revisión agregado de un commit.
///
/// Nombra todos los ids cuyo `committed.rev` no coincidió con la última
/// revisión almacenada. Es contención normal, no un fallo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevMismatch {
  ids: Vec<StateId>,
}

impl RevMismatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Añade un id en conflicto (sin duplicados).
  pub fn add(&mut self, id: StateId) {
    if !self.ids.contains(&id) {
      self.ids.push(id);
    }
  }

  pub fn ids(&self) -> &[StateId] {
    &self.ids
  }

  pub fn contains(&self, id: &StateId) -> bool {
    self.ids.contains(id)
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  /// Convierte en `Err` si hay algún conflicto registrado.
  pub fn into_result(self) -> Result<()> {
    if self.ids.is_empty() {
      Ok(())
    } else {
      Err(FlowError::RevMismatch(self))
    }
  }
}

impl fmt::Display for RevMismatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ids: Vec<&str> = self.ids.iter().map(|id| id.as_str()).collect();
    write!(f, "conflicto de revisión; ids: {}", ids.join(", "))
  }
}

/// Errores comunes del motor de estados.
///
/// - `NotFound`: estado, dato o meta inexistente.
/// - `FlowNotFound`: no hay flow registrado para el id de destino.
/// - `RevMismatch`: conflicto optimista (silencioso en el loop de ejecución).
/// - `Validation`: entrada mal formada o bundle de commit inválido.
/// - `Storage`: error del backend de almacenamiento.
#[derive(Error, Debug)]
pub enum FlowError {
  /// Entidad no encontrada (estado, dato, meta).
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// No existe un flow registrado con ese id.
  #[error("Flow no registrado: {0}")]
  FlowNotFound(String),
  /// El backend no soporta el comando recibido.
  #[error("Comando no soportado: {0}")]
  Unsupported(String),
  #[error("{0}")]
  RevMismatch(RevMismatch),
  #[error("Error de validación: {0}")]
  Validation(String),
  /// Error genérico de almacenamiento.
  #[error("Error de almacenamiento: {0}")]
  Storage(String),
  #[error("Error de serialización: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Se agotó el plazo esperando a que terminen las tareas en curso.
  #[error("Plazo de apagado agotado: {0}")]
  Shutdown(String),
  /// Otro tipo de error.
  #[error("Otro: {0}")]
  Other(String),
}

impl FlowError {
  pub fn is_rev_mismatch(&self) -> bool {
    matches!(self, FlowError::RevMismatch(_))
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, FlowError::NotFound(_))
  }

  pub fn is_unsupported(&self) -> bool {
    matches!(self, FlowError::Unsupported(_))
  }

  /// Devuelve true si el error es un conflicto que incluye `id`.
  pub fn rev_mismatch_contains(&self, id: &StateId) -> bool {
    match self {
      FlowError::RevMismatch(m) => m.contains(id),
      _ => false,
    }
  }
}

impl From<RevMismatch> for FlowError {
  fn from(m: RevMismatch) -> Self {
    FlowError::RevMismatch(m)
  }
}

/// Alias de resultado usado por las APIs del crate.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Helper para mapear `Mutex::lock()` en un `Result` con
/// `FlowError::Storage`.
pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  m.lock().map_err(|e| FlowError::Storage(format!("mutex poisoned: {:?}", e)))
}
