// Archivo: domain/mod.rs
// Propósito: tipos de dominio del motor: identificadores, `State`,
// `Transition`, `StateCtx`, `DelayedState` y `Data`.
mod data;
mod delayed;
mod state;
mod state_ctx;
mod transition;

pub use data::*;
pub use delayed::*;
pub use state::*;
pub use state_ctx::*;
pub use transition::*;

use std::collections::BTreeMap;

/// Anotaciones clave/valor (orden estable para serialización).
pub type Annotations = BTreeMap<String, String>;
/// Etiquetas clave/valor usadas para búsquedas.
pub type Labels = BTreeMap<String, String>;

/// Declara un identificador opaco basado en `String`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identidad opaca de un estado.
    StateId
);
string_id!(
    /// Identificador opaco de un paso (flow) registrado.
    FlowId
);
string_id!(
    /// Identificador de un blob de datos.
    DataId
);
