// Archivo: config.rs
// Propósito: configuración del motor, del recoverer y del delayer.
//
// Cada struct tiene `Default` y `from_env()`. `from_env` carga `.env` con
// dotenvy y sobreescribe los valores presentes en el entorno; un valor mal
// formado es un error de validación.
use crate::annotations;
use crate::domain::StateId;
use crate::errors::{FlowError, Result};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_RECOVERY_META_ID: &str = "flowstate.recovery.meta";
pub const DEFAULT_DELAYER_META_ID: &str = "flowstate.delayer.meta";

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw.trim()
                      .parse::<T>()
                      .map(Some)
                      .map_err(|_| FlowError::Validation(format!("{} tiene un valor inválido: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

fn env_duration(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(raw) => annotations::parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| FlowError::Validation(format!("{} no es una duración válida: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn holder_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Intervalo de polling de los watchers cuando no hay notificación.
    pub watch_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { watch_poll_interval: Duration::from_secs(1) }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(d) = env_duration("FLOWSTATE_WATCH_POLL_INTERVAL")? {
            cfg.watch_poll_interval = d;
        }
        Ok(cfg)
    }
}

/// Parámetros del recoverer.
#[derive(Debug, Clone)]
pub struct RecovererConfig {
    /// Meta-estado reservado que guarda watermark y lease.
    pub meta_id: StateId,
    /// Identidad de esta instancia en el lease.
    pub holder: String,
    pub head_interval: Duration,
    pub tail_interval: Duration,
    /// Tamaño de página del head scan.
    pub batch_limit: usize,
    /// Máximo de estados en el conjunto de trabajo.
    pub max_tracked: usize,
    pub default_retry_after: Duration,
    pub min_retry_after: Duration,
    pub max_retry_after: Duration,
    pub max_attempts: u32,
    /// Sin commits del líder durante `failover_window + failover_margin`, un
    /// standby toma el lease.
    pub failover_window: Duration,
    pub failover_margin: Duration,
    /// Commit del watermark cuando avanza más de estas revisiones.
    pub commit_rev_gap: i64,
    /// Commit del watermark si se movió y pasó este intervalo.
    pub commit_interval: Duration,
}

impl Default for RecovererConfig {
    fn default() -> Self {
        Self { meta_id: StateId::new(DEFAULT_RECOVERY_META_ID),
               holder: holder_id("recoverer"),
               head_interval: Duration::from_secs(10),
               tail_interval: Duration::from_secs(10),
               batch_limit: 100,
               max_tracked: 10_000,
               default_retry_after: Duration::from_secs(120),
               min_retry_after: Duration::from_secs(60),
               max_retry_after: Duration::from_secs(300),
               max_attempts: 3,
               failover_window: Duration::from_secs(300),
               failover_margin: Duration::from_secs(60),
               commit_rev_gap: 1000,
               commit_interval: Duration::from_secs(300) }
    }
}

impl RecovererConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(id) = env_string("FLOWSTATE_RECOVERY_META_ID") {
            cfg.meta_id = StateId::new(id);
        }
        if let Some(holder) = env_string("FLOWSTATE_RECOVERY_HOLDER") {
            cfg.holder = holder;
        }
        if let Some(n) = env_parse("FLOWSTATE_RECOVERY_MAX_ATTEMPTS")? {
            cfg.max_attempts = n;
        }
        if let Some(n) = env_parse("FLOWSTATE_RECOVERY_MAX_TRACKED")? {
            cfg.max_tracked = n;
        }
        if let Some(d) = env_duration("FLOWSTATE_RECOVERY_RETRY_AFTER")? {
            cfg.default_retry_after = d;
        }
        if let Some(d) = env_duration("FLOWSTATE_RECOVERY_FAILOVER_WINDOW")? {
            cfg.failover_window = d;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.meta_id.is_empty() {
            return Err(FlowError::Validation("recoverer sin meta id".into()));
        }
        if self.min_retry_after > self.max_retry_after {
            return Err(FlowError::Validation("min_retry_after mayor que max_retry_after".into()));
        }
        if self.head_interval.is_zero() || self.tail_interval.is_zero() {
            return Err(FlowError::Validation("los intervalos del recoverer deben ser positivos".into()));
        }
        Ok(())
    }

    /// Plazo de reintento acotado a `[min_retry_after, max_retry_after]`.
    pub fn clamp_retry_after(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_retry_after)
                 .clamp(self.min_retry_after, self.max_retry_after)
    }

    /// Antigüedad a partir de la cual un lease ajeno se considera caído.
    pub fn stale_after(&self) -> Duration {
        self.failover_window + self.failover_margin
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.failover_window / 2
    }
}

/// Parámetros del delayer.
#[derive(Debug, Clone)]
pub struct DelayerConfig {
    pub meta_id: StateId,
    pub holder: String,
    pub horizon_interval: Duration,
    /// Cuánto por delante de ahora mira el horizon scan.
    pub horizon_lookahead: Duration,
    pub freshness_interval: Duration,
    /// Cuánto hacia atrás re-escanea el freshness scan.
    pub freshness_lookback: Duration,
    pub fire_interval: Duration,
    pub commit_interval: Duration,
    pub max_tracked: usize,
    pub batch_limit: usize,
    pub failover_window: Duration,
    pub failover_margin: Duration,
}

impl Default for DelayerConfig {
    fn default() -> Self {
        Self { meta_id: StateId::new(DEFAULT_DELAYER_META_ID),
               holder: holder_id("delayer"),
               horizon_interval: Duration::from_secs(30),
               horizon_lookahead: Duration::from_secs(60),
               freshness_interval: Duration::from_secs(5),
               freshness_lookback: Duration::from_secs(24 * 3600),
               fire_interval: Duration::from_secs(1),
               commit_interval: Duration::from_secs(60),
               max_tracked: 1000,
               batch_limit: 500,
               failover_window: Duration::from_secs(300),
               failover_margin: Duration::from_secs(60) }
    }
}

impl DelayerConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(id) = env_string("FLOWSTATE_DELAYER_META_ID") {
            cfg.meta_id = StateId::new(id);
        }
        if let Some(holder) = env_string("FLOWSTATE_DELAYER_HOLDER") {
            cfg.holder = holder;
        }
        if let Some(n) = env_parse("FLOWSTATE_DELAYER_MAX_TRACKED")? {
            cfg.max_tracked = n;
        }
        if let Some(d) = env_duration("FLOWSTATE_DELAYER_FAILOVER_WINDOW")? {
            cfg.failover_window = d;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.meta_id.is_empty() {
            return Err(FlowError::Validation("delayer sin meta id".into()));
        }
        if self.fire_interval.is_zero() || self.horizon_interval.is_zero() || self.freshness_interval.is_zero() {
            return Err(FlowError::Validation("los intervalos del delayer deben ser positivos".into()));
        }
        if self.max_tracked == 0 {
            return Err(FlowError::Validation("max_tracked debe ser positivo".into()));
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        self.failover_window + self.failover_margin
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.failover_window / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_clamped() {
        let cfg = RecovererConfig::default();
        assert_eq!(cfg.clamp_retry_after(None), Duration::from_secs(120));
        assert_eq!(cfg.clamp_retry_after(Some(Duration::from_secs(5))), Duration::from_secs(60));
        assert_eq!(cfg.clamp_retry_after(Some(Duration::from_secs(3600))), Duration::from_secs(300));
        assert_eq!(cfg.clamp_retry_after(Some(Duration::from_secs(90))), Duration::from_secs(90));
    }

    #[test]
    fn defaults_are_valid() {
        assert!(RecovererConfig::default().validate().is_ok());
        assert!(DelayerConfig::default().validate().is_ok());
        assert_ne!(RecovererConfig::default().holder, RecovererConfig::default().holder);
    }
}
