// Archivo: domain/state_ctx.rs
// Propósito: borrador mutable de un estado junto con el valor esperado para
// el CAS del commit.
use super::{State, StateId, Transition};
use serde::{Deserialize, Serialize};

/// Contexto de ejecución de un estado.
///
/// - `current`: borrador que los pasos mutan.
/// - `committed`: última copia confirmada; su `rev` es el valor esperado del
///   CAS.
/// - `transitions`: historial desde el último commit (se vacía al commitear).
///
/// Pertenece a la tarea que lo conduce; para entregarlo a otra tarea se
/// clona explícitamente.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCtx {
    pub current: State,
    pub committed: State,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

impl StateCtx {
    pub fn new(state: State) -> Self {
        Self::from(state)
    }

    /// Deriva un ctx nuevo, sin commitear, para otro id. Copia etiquetas,
    /// anotaciones y transición del estado actual.
    pub fn new_to(&self, id: impl Into<StateId>) -> StateCtx {
        let mut current = self.current.clone();
        current.id = id.into();
        current.rev = 0;
        current.committed_at = None;
        StateCtx::new(current)
    }

    pub fn id(&self) -> &StateId {
        &self.current.id
    }

    /// Revisión esperada por el CAS (`0` si nunca se commiteó).
    pub fn expected_rev(&self) -> i64 {
        self.committed.rev
    }

    /// Empuja la transición actual al historial y la reemplaza por `next`.
    pub fn push_transition(&mut self, next: Transition) {
        let prev = std::mem::replace(&mut self.current.transition, next);
        self.transitions.push(prev);
    }

    /// Marca el ctx como confirmado con el estado almacenado.
    pub fn mark_committed(&mut self, stored: State) {
        self.current = stored.clone();
        self.committed = stored;
        self.transitions.clear();
    }
}

impl From<State> for StateCtx {
    fn from(state: State) -> Self {
        let committed = if state.rev > 0 {
            state.clone()
        } else {
            State::default()
        };
        Self { current: state,
               committed,
               transitions: Vec::new() }
    }
}
