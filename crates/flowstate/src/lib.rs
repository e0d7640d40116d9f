//! Crate `flowstate` — motor de ejecución de estados sobre un log
//! revisionado.
//!
//! Un estado (`State`) se mueve entre pasos (`Flow`) ejecutando un paso,
//! obteniendo un `Command` y aplicándolo de forma durable al log. El crate
//! define el modelo de datos, el contrato de almacenamiento
//! `StateRepository`, una implementación en memoria
//! (`InMemoryStateRepository`), un decorador de caché en anillo y los
//! componentes de coordinación:
//!
//! - `FlowEngine`: loop de ejecución y despacho de comandos.
//! - `Recoverer`: reintenta estados cuya ejecución quedó a medias.
//! - `Delayer`: dispara re-ejecuciones diferidas.
//!
//! Diseño resumido:
//! - Concurrencia optimista: cada commit compara `committed.rev` con la
//!   última revisión almacenada (`RevMismatch` si no coincide).
//! - Commits todo-o-nada por bundle.
//! - Un único recoverer/delayer activo por log, elegido con un lease sobre
//!   un meta-estado reservado.
//!
//! Ejemplo rápido:
//! ```rust
//! use flowstate::{Command, EngineConfig, FlowEngine, FlowRegistry, InMemoryStateRepository, State};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(FlowRegistry::new());
//! registry.set_fn("saludo", |ctx, _| Ok(Command::commit(vec![Command::end(ctx.clone())])));
//! let engine = FlowEngine::new(Arc::new(InMemoryStateRepository::new()), registry, EngineConfig::default());
//!
//! let ctx = engine.commit(vec![Command::transit(State::new("s1").to_ctx(), "saludo")])
//!                 .map(|c| Command::Commit(c).into_state_ctx().unwrap())
//!                 .unwrap();
//! engine.execute(ctx).await.unwrap();
//! assert!(engine.get_state_by_id("s1", 0).unwrap().current.is_ended());
//! # });
//! ```
pub mod annotations;
pub mod cache;
pub mod clock;
pub mod command;
pub mod config;
pub mod delayer;
pub mod domain;
pub mod engine;
pub mod errors;
mod lease;
pub mod recovery;
pub mod registry;
pub mod repository;
pub mod service;
pub mod stubs;
pub mod watcher;

pub use cache::*;
pub use clock::Clock;
pub use command::*;
pub use config::*;
pub use delayer::*;
pub use domain::*;
pub use engine::*;
pub use errors::{FlowError, Result, RevMismatch};
pub use recovery::*;
pub use registry::*;
pub use repository::*;
pub use service::*;
pub use stubs::*;
pub use watcher::*;
