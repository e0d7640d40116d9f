// Archivo: annotations.rs
// Propósito: claves de anotación reservadas y helpers para leerlas y
// escribirlas sobre `State`/`StateCtx`.
//
// Las duraciones se guardan como segundos con sufijo (`"120s"`); al leer se
// aceptan también `m` y `h`.
use crate::domain::{DataId, State, StateCtx};
use crate::errors::{FlowError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Marca de ciclo de vida en la transición.
pub const STATE: &str = "flowstate.state";
pub const PAUSED: &str = "paused";
pub const RESUMED: &str = "resumed";
pub const ENDED: &str = "ended";

pub const RECOVERY_ENABLED: &str = "flowstate.recovery.enabled";
pub const RECOVERY_ATTEMPT: &str = "flowstate.recovery.attempt";
pub const RECOVERY_MAX_ATTEMPTS: &str = "flowstate.recovery.max_attempts";
pub const RECOVERY_RETRY_AFTER: &str = "flowstate.recovery.retry_after";
/// Watermark del recoverer dentro de su meta-estado.
pub const RECOVERY_SINCE_REV: &str = "flowstate.recovery.since_rev";

pub const DELAY_AT: &str = "flowstate.delay.at";
pub const DELAY_DURATION: &str = "flowstate.delay.duration";
pub const DELAY_COMMIT: &str = "flowstate.delay.commit";

/// Watermark del delayer dentro de su meta-estado.
pub const DELAYER_SINCE: &str = "flowstate.delayer.since";
pub const DELAYER_OFFSET: &str = "flowstate.delayer.offset";

/// Instancia que tiene el lease de un meta-estado (vacío = liberado).
pub const LEASE_HOLDER: &str = "flowstate.lease.holder";

/// Anotación por defecto para `Stack`/`Unstack`.
pub const STACKED: &str = "flowstate.stacked";

const DATA_PREFIX: &str = "data:";

pub fn format_duration(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

/// Parsea `"90"`, `"90s"`, `"2m"` o `"1h"`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (num, mult) = match raw.chars().last()? {
        's' => (&raw[..raw.len() - 1], 1),
        'm' => (&raw[..raw.len() - 1], 60),
        'h' => (&raw[..raw.len() - 1], 3600),
        _ => (raw, 1),
    };
    num.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * mult))
}

/// Recovery está habilitado salvo que la anotación diga `"false"`.
pub fn recovery_enabled(state: &State) -> bool {
    state.annotation(RECOVERY_ENABLED) != Some("false")
}

pub fn disable_recovery(ctx: &mut StateCtx) {
    ctx.current.set_annotation(RECOVERY_ENABLED, "false");
}

/// Intento de recovery registrado en la transición actual (0 si no hay).
pub fn recovery_attempt(state: &State) -> u32 {
    state.transition
         .annotation(RECOVERY_ATTEMPT)
         .and_then(|v| v.parse().ok())
         .unwrap_or(0)
}

pub fn set_recovery_attempt(ctx: &mut StateCtx, attempt: u32) {
    ctx.current.transition.set_annotation(RECOVERY_ATTEMPT, attempt.to_string());
}

pub fn max_attempts(state: &State, default: u32) -> u32 {
    state.annotation(RECOVERY_MAX_ATTEMPTS)
         .and_then(|v| v.parse().ok())
         .unwrap_or(default)
}

pub fn set_max_attempts(ctx: &mut StateCtx, max: u32) {
    ctx.current.set_annotation(RECOVERY_MAX_ATTEMPTS, max.to_string());
}

/// Plazo de reintento pedido por el estado, sin acotar.
pub fn retry_after(state: &State) -> Option<Duration> {
    state.annotation(RECOVERY_RETRY_AFTER).and_then(parse_duration)
}

pub fn set_retry_after(ctx: &mut StateCtx, d: Duration) {
    ctx.current.set_annotation(RECOVERY_RETRY_AFTER, format_duration(d));
}

pub fn lease_holder(state: &State) -> &str {
    state.annotations.get(LEASE_HOLDER).map(String::as_str).unwrap_or("")
}

pub fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// Valor de anotación para una referencia de datos.
pub fn data_ref(id: &DataId, rev: i64) -> String {
    format!("{}{}:{}", DATA_PREFIX, id, rev)
}

/// Parsea `data:<id>:<rev>`.
pub fn parse_data_ref(raw: &str) -> Result<(DataId, i64)> {
    let rest = raw.strip_prefix(DATA_PREFIX)
                  .ok_or_else(|| FlowError::Validation(format!("referencia de datos inválida: {}", raw)))?;
    let (id, rev) = rest.rsplit_once(':')
                        .ok_or_else(|| FlowError::Validation(format!("referencia de datos sin revisión: {}", raw)))?;
    let rev = rev.parse::<i64>()
                 .map_err(|_| FlowError::Validation(format!("revisión de datos inválida: {}", raw)))?;
    if id.is_empty() {
        return Err(FlowError::Validation(format!("referencia de datos sin id: {}", raw)));
    }
    Ok((DataId::new(id), rev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations_with_suffix() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn data_ref_round_trips_through_annotation_format() {
        let raw = data_ref(&DataId::new("abc"), 7);
        assert_eq!(raw, "data:abc:7");
        let (id, rev) = parse_data_ref(&raw).unwrap();
        assert_eq!(id.as_str(), "abc");
        assert_eq!(rev, 7);
        assert!(parse_data_ref("abc:7").is_err());
        assert!(parse_data_ref("data:abc").is_err());
    }

    #[test]
    fn recovery_annotations_default_when_missing() {
        let state = State::new("s1");
        assert!(recovery_enabled(&state));
        assert_eq!(recovery_attempt(&state), 0);
        assert_eq!(max_attempts(&state, 3), 3);
        assert_eq!(retry_after(&state), None);

        let mut ctx = state.to_ctx();
        disable_recovery(&mut ctx);
        set_recovery_attempt(&mut ctx, 2);
        set_max_attempts(&mut ctx, 5);
        set_retry_after(&mut ctx, Duration::from_secs(90));
        assert!(!recovery_enabled(&ctx.current));
        assert_eq!(recovery_attempt(&ctx.current), 2);
        assert_eq!(max_attempts(&ctx.current, 3), 5);
        assert_eq!(retry_after(&ctx.current), Some(Duration::from_secs(90)));
    }
}
