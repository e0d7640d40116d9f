// Archivo: domain/data.rs
// Propósito: blobs fuera de banda referenciados desde anotaciones.
use super::DataId;
use serde::{Deserialize, Serialize};

/// Blob versionado. Se referencia desde anotaciones como
/// `data:<id>:<rev>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub id: DataId,
    pub rev: i64,
    pub binary: bool,
    pub bytes: Vec<u8>,
}

impl Data {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: bytes.into(),
               ..Default::default() }
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self { binary: true,
               bytes: bytes.into(),
               ..Default::default() }
    }

    /// Referencia a una revisión concreta (sin contenido).
    pub fn reference(id: impl Into<DataId>, rev: i64) -> Self {
        Self { id: id.into(),
               rev,
               ..Default::default() }
    }

    /// Contenido como texto (lossy para binarios).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
