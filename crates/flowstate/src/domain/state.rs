// Archivo: domain/state.rs
// Propósito: unidad de trabajo versionada que se mueve entre flows.
use super::{Annotations, FlowId, Labels, StateCtx, StateId, Transition};
use crate::annotations;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Estado persistido en el log revisionado.
///
/// `rev` lo asigna exclusivamente el almacenamiento; `0` significa que el
/// estado nunca fue commiteado. Por id, `rev` es estrictamente creciente.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub rev: i64,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    pub transition: Transition,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn new(id: impl Into<StateId>) -> Self {
        Self { id: id.into(),
               ..Default::default() }
    }

    /// Builder: fija el paso de destino de la transición actual.
    pub fn with_transit_to(mut self, to: impl Into<FlowId>) -> Self {
        self.transition.to = to.into();
        self
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    /// Busca primero en la transición y luego en las anotaciones del estado.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.transition
            .annotation(name)
            .or_else(|| self.annotations.get(name).map(String::as_str))
    }

    pub fn set_annotation(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(name.into(), value.into());
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    /// True si todas las etiquetas de `labels` están presentes con el mismo
    /// valor. Un filtro vacío coincide siempre.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        labels.iter().all(|(k, v)| self.labels.get(k) == Some(v))
    }

    pub fn is_paused(&self) -> bool {
        self.transition.annotation(annotations::STATE) == Some(annotations::PAUSED)
    }

    pub fn is_resumed(&self) -> bool {
        self.transition.annotation(annotations::STATE) == Some(annotations::RESUMED)
    }

    pub fn is_ended(&self) -> bool {
        self.transition.annotation(annotations::STATE) == Some(annotations::ENDED)
    }

    /// Construye un ctx a partir de este estado. `committed` sólo se fija si
    /// el estado ya tiene revisión.
    pub fn to_ctx(&self) -> StateCtx {
        StateCtx::from(self.clone())
    }
}
