// Archivo: domain/transition.rs
use super::{Annotations, FlowId};
use serde::{Deserialize, Serialize};

/// Movimiento entre pasos. Cada transición nueva empieza con anotaciones
/// vacías; las marcas de ciclo de vida, intento de recovery y delay viven
/// aquí.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: FlowId,
    pub to: FlowId,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Transition {
    pub fn new(from: FlowId, to: FlowId) -> Self {
        Self { from,
               to,
               annotations: Annotations::new() }
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations.get(name).map(String::as_str)
    }

    pub fn set_annotation(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(name.into(), value.into());
    }
}
