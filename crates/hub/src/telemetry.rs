//! Telemetry validation: turns a raw MQTT payload into a [`TelemetryRecord`]
//! or a [`ValidationError`].
//!
//! Wire format (extra fields are ignored):
//!
//! ```text
//! {"s_raw":500,"s_pct":50,"s_temp":18.5,"a_temp":22.1,"hum":60,"pump":1,"man":0,"life":120}
//! ```
//!
//! `s_temp` / `a_temp` are optional and fall back to `0.0` when missing or
//! implausible, so a dead temperature probe never blinds the pipeline.
//! Every other field is required and out-of-range values reject the whole
//! message (no clamping).

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::ValidationError;

/// Full scale of the node's 10-bit soil ADC.
pub const SOIL_RAW_MAX: f64 = 1024.0;

/// Plausible range for the temperature probes (DS18B20 / DHT datasheets).
const TEMP_MIN_C: f64 = -55.0;
const TEMP_MAX_C: f64 = 125.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub soil_raw: f64,
    pub soil_pct: f64,
    pub soil_temp: f64,
    pub air_temp: f64,
    pub humidity: f64,
    pub pump_on: bool,
    pub manual: bool,
    pub pump_life: f64,
    /// Server receipt time. Any device-supplied time is ignored.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Decode and validate one transport payload.
pub fn parse(payload: &[u8], received_at: OffsetDateTime) -> Result<TelemetryRecord, ValidationError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    match value {
        Value::Object(fields) => validate(&fields, received_at),
        _ => Err(ValidationError::NotAnObject),
    }
}

/// Validate an already-decoded field map.
pub fn validate(
    fields: &Map<String, Value>,
    received_at: OffsetDateTime,
) -> Result<TelemetryRecord, ValidationError> {
    // ── Required numerics ───────────────────────────────────────────
    let soil_raw = required_number(fields, "s_raw")?;
    let soil_pct = required_number(fields, "s_pct")?;
    let humidity = required_number(fields, "hum")?;
    let pump_life = required_number(fields, "life")?;

    // ── Optional temperatures (fallback to 0) ───────────────────────
    let soil_temp = temperature_or_zero(fields.get("s_temp"));
    let air_temp = temperature_or_zero(fields.get("a_temp"));

    // ── Booleans ────────────────────────────────────────────────────
    let pump_on = required_bool(fields, "pump")?;
    let manual = required_bool(fields, "man")?;

    // ── Ranges ──────────────────────────────────────────────────────
    check_range("s_raw", soil_raw, 0.0, SOIL_RAW_MAX)?;
    check_range("s_pct", soil_pct, 0.0, 100.0)?;
    check_range("hum", humidity, 0.0, 100.0)?;
    check_range("life", pump_life, 0.0, f64::MAX)?;

    Ok(TelemetryRecord {
        soil_raw,
        soil_pct,
        soil_temp,
        air_temp,
        humidity,
        pump_on,
        manual,
        pump_life,
        timestamp: received_at,
    })
}

// ---------------------------------------------------------------------------
// Field coercion helpers
// ---------------------------------------------------------------------------

/// JSON numbers and numeric strings are accepted; NaN/inf are not.
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn required_number(fields: &Map<String, Value>, name: &'static str) -> Result<f64, ValidationError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(ValidationError::Missing(name)),
        Some(v) => as_number(v).ok_or(ValidationError::NotNumeric(name)),
    }
}

fn temperature_or_zero(value: Option<&Value>) -> f64 {
    value
        .and_then(as_number)
        .filter(|t| (TEMP_MIN_C..=TEMP_MAX_C).contains(t))
        .unwrap_or(0.0)
}

/// Parse a boolean flag: `true`/`false`, numbers (`1` is true, anything
/// else false) or one of a few well-known strings.
pub(crate) fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64() == Some(1.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Some(true),
            "0" | "false" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn required_bool(fields: &Map<String, Value>, name: &'static str) -> Result<bool, ValidationError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(ValidationError::Missing(name)),
        Some(v) => as_flag(v).ok_or(ValidationError::NotBoolean(name)),
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
