// growerd: Typed document model
//
// The remote document is dynamically typed JSON; everything is
// parse-and-validated into the structs below on ingest. A malformed pin
// entry is skipped with an ERROR log so the remaining pins proceed.

use std::collections::BTreeMap;

use chrono::{NaiveTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::error::{ControlError, ControlResult};

/// Document field names (normative wire contract).
pub mod fields {
    pub const GPIO_STATE: &str = "gpioState";
    pub const STATUS: &str = "status";
    pub const LAST_HEARTBEAT: &str = "lastHeartbeat";
    pub const LAST_EMERGENCY_STOP: &str = "lastEmergencyStop";
    pub const STATE: &str = "state";
    pub const HARDWARE_STATE: &str = "hardwareState";
    pub const MISMATCH: &str = "mismatch";
    pub const PWM_DUTY_CYCLE: &str = "pwmDutyCycle";
    pub const LAST_HARDWARE_READ: &str = "lastHardwareRead";
    pub const LAST_UPDATED: &str = "lastUpdated";
    pub const SCHEDULES: &str = "schedules";
    pub const LAST_RUN_AT: &str = "last_run_at";
}

/// Current wall-clock timestamp as a document value.
pub fn now_ts() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

/// Pin mode as declared in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Output,
    Input,
    Pwm,
}

impl PinMode {
    pub fn parse(s: &str) -> ControlResult<Self> {
        match s {
            "output" => Ok(PinMode::Output),
            "input" => Ok(PinMode::Input),
            "pwm" => Ok(PinMode::Pwm),
            other => Err(ControlError::ProtocolInvalid(format!(
                "unknown pin mode '{other}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PinMode::Output => "output",
            PinMode::Input => "input",
            PinMode::Pwm => "pwm",
        }
    }
}

/// One schedule definition as declared in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSpec {
    pub enabled: bool,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub duration_seconds: u64,
    /// OFF pause between ON cycles (`frequencySeconds` on the wire).
    pub frequency_seconds: u64,
    pub name: String,
}

impl ScheduleSpec {
    /// Parse a schedule entry. Invalid time strings or negative durations
    /// make the whole schedule invalid.
    pub fn parse(value: &Value) -> ControlResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ControlError::ProtocolInvalid("schedule is not an object".into()))?;

        let start_time = parse_time_of_day(obj.get("startTime"))?;
        let end_time = parse_time_of_day(obj.get("endTime"))?;

        let duration_seconds = parse_u64(obj.get("durationSeconds"), "durationSeconds", 10)?;
        let frequency_seconds = parse_u64(obj.get("frequencySeconds"), "frequencySeconds", 10)?;

        Ok(ScheduleSpec {
            enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            start_time,
            end_time,
            duration_seconds,
            frequency_seconds,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        })
    }

    /// Strict time-window check against a wall-clock time of day.
    ///
    /// No times set: always in window. `end < start` is an overnight
    /// window crossing midnight. The interval is closed on both ends.
    pub fn in_window(&self, now: NaiveTime) -> bool {
        in_window(self.start_time, self.end_time, now)
    }
}

/// Window rule shared by the schedule cache and executors.
pub fn in_window(start: Option<NaiveTime>, end: Option<NaiveTime>, now: NaiveTime) -> bool {
    match (start, end) {
        (None, None) => true,
        (start, end) => {
            let start = start.unwrap_or(NaiveTime::MIN);
            let end = end.unwrap_or_else(|| NaiveTime::from_hms_opt(23, 59, 59).unwrap());
            if start <= end {
                start <= now && now <= end
            } else {
                // Overnight window, e.g. 22:00 → 06:00
                now >= start || now <= end
            }
        }
    }
}

fn parse_time_of_day(value: Option<&Value>) -> ControlResult<Option<NaiveTime>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => NaiveTime::parse_from_str(s, "%H:%M")
            .map(Some)
            .map_err(|e| ControlError::ProtocolInvalid(format!("bad time '{s}': {e}"))),
        Some(other) => Err(ControlError::ProtocolInvalid(format!(
            "time field is not a string: {other}"
        ))),
    }
}

fn parse_u64(value: Option<&Value>, field: &str, default: u64) -> ControlResult<u64> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(v) => {
            if let Some(n) = v.as_u64() {
                Ok(n)
            } else if let Some(f) = v.as_f64() {
                if f >= 0.0 {
                    Ok(f as u64)
                } else {
                    Err(ControlError::ProtocolInvalid(format!(
                        "{field} is negative: {f}"
                    )))
                }
            } else {
                Err(ControlError::ProtocolInvalid(format!(
                    "{field} is not a number: {v}"
                )))
            }
        }
    }
}

/// One pin entry as declared in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct PinConfig {
    pub pin: u8,
    pub name: String,
    pub default_name: String,
    pub name_customized: bool,
    pub mode: PinMode,
    pub active_low: bool,
    pub enabled: bool,
    pub state: bool,
    pub pwm_duty: u8,
    pub schedules: BTreeMap<String, ScheduleSpec>,
    /// The document entry is missing the baseline fields (freshly created
    /// from the webapp with a sparse body); boot sync fills them in.
    pub needs_defaults: bool,
}

impl PinConfig {
    pub fn parse(pin: u8, value: &Value) -> ControlResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ControlError::ProtocolInvalid(format!("pin {pin} is not an object")))?;

        let mode = match obj.get("mode").and_then(Value::as_str) {
            Some(s) => PinMode::parse(s)?,
            None => PinMode::Output,
        };

        let pwm_duty = match obj.get(fields::PWM_DUTY_CYCLE) {
            None | Some(Value::Null) => 0,
            Some(v) => {
                let duty = v.as_f64().ok_or_else(|| {
                    ControlError::ProtocolInvalid(format!("pin {pin} pwmDutyCycle is not a number"))
                })?;
                duty.clamp(0.0, 100.0).round() as u8
            }
        };

        let default_name = obj
            .get("default_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_pin_name(pin));

        let mut schedules = BTreeMap::new();
        if let Some(Value::Object(map)) = obj.get(fields::SCHEDULES) {
            for (id, spec) in map {
                match ScheduleSpec::parse(spec) {
                    Ok(parsed) => {
                        schedules.insert(id.clone(), parsed);
                    }
                    Err(e) => {
                        error!(pin, schedule_id = %id, error = %e, "Skipping malformed schedule");
                    }
                }
            }
        }

        Ok(PinConfig {
            pin,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| default_pin_name(pin)),
            default_name,
            name_customized: obj
                .get("name_customized")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            mode,
            active_low: obj.get("active_low").and_then(Value::as_bool).unwrap_or(false),
            enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            state: obj.get(fields::STATE).and_then(Value::as_bool).unwrap_or(false),
            pwm_duty,
            schedules,
            needs_defaults: !obj.contains_key("default_name")
                || !obj.contains_key("name_customized")
                || !obj.contains_key(fields::PWM_DUTY_CYCLE),
        })
    }
}

/// Generated default name for a pin the document does not label.
pub fn default_pin_name(pin: u8) -> String {
    format!("GPIO{pin}")
}

/// The parsed device document: everything growerd reconciles against.
#[derive(Debug, Clone, Default)]
pub struct DeviceDocument {
    pub pins: BTreeMap<u8, PinConfig>,
    /// Pins whose entries were malformed. They are skipped, not removed:
    /// the hot-remove path must leave them untouched.
    pub skipped: Vec<u8>,
}

impl DeviceDocument {
    /// Parse the raw device document. Malformed pin entries are skipped
    /// (logged at ERROR); other pins proceed.
    pub fn parse(raw: &Value) -> Self {
        let mut pins = BTreeMap::new();
        let mut skipped = Vec::new();

        let gpio_state = raw
            .get(fields::GPIO_STATE)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for (pin_str, pin_value) in gpio_state {
            let pin: u8 = match pin_str.parse() {
                Ok(p) => p,
                Err(_) => {
                    error!(key = %pin_str, "Skipping non-numeric pin key");
                    continue;
                }
            };
            match PinConfig::parse(pin, &pin_value) {
                Ok(cfg) => {
                    pins.insert(pin, cfg);
                }
                Err(e) => {
                    error!(pin, error = %e, "Skipping malformed pin entry");
                    skipped.push(pin);
                }
            }
        }

        DeviceDocument { pins, skipped }
    }

    /// A pin the document still mentions, well-formed or not.
    pub fn mentions(&self, pin: u8) -> bool {
        self.pins.contains_key(&pin) || self.skipped.contains(&pin)
    }
}

/// An explicit device command from the commands subcollection.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    PinControl {
        pin: u8,
        on: bool,
        /// Optional auto-off delay in seconds (for `on` commands).
        duration: Option<u64>,
    },
    PwmControl {
        pin: u8,
        duty: u8,
    },
    EmergencyStop,
}

impl DeviceCommand {
    pub fn parse(value: &Value) -> ControlResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ControlError::ProtocolInvalid("command is not an object".into()))?;

        let cmd_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::ProtocolInvalid("command has no type".into()))?;

        match cmd_type {
            "emergency_stop" => Ok(DeviceCommand::EmergencyStop),
            "pin_control" => {
                let pin = parse_pin_number(obj)?;
                let action = obj
                    .get("action")
                    .and_then(Value::as_str)
                    .map(str::to_lowercase)
                    .ok_or_else(|| ControlError::ProtocolInvalid("pin_control has no action".into()))?;
                let on = match action.as_str() {
                    "on" => true,
                    "off" => false,
                    other => {
                        return Err(ControlError::ProtocolInvalid(format!(
                            "unknown pin_control action '{other}'"
                        )))
                    }
                };
                let duration = match obj.get("duration") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(parse_u64(Some(v), "duration", 0)?),
                };
                Ok(DeviceCommand::PinControl { pin, on, duration })
            }
            "pwm_control" => {
                let pin = parse_pin_number(obj)?;
                let duty = obj
                    .get("duty_cycle")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        ControlError::ProtocolInvalid("pwm_control has no duty_cycle".into())
                    })?;
                Ok(DeviceCommand::PwmControl {
                    pin,
                    duty: duty.clamp(0.0, 100.0).round() as u8,
                })
            }
            other => Err(ControlError::ProtocolInvalid(format!(
                "unknown command type '{other}'"
            ))),
        }
    }
}

fn parse_pin_number(obj: &Map<String, Value>) -> ControlResult<u8> {
    let pin = obj
        .get("pin")
        .and_then(Value::as_u64)
        .ok_or_else(|| ControlError::ProtocolInvalid("command has no pin".into()))?;
    u8::try_from(pin)
        .map_err(|_| ControlError::ProtocolInvalid(format!("pin {pin} out of range")))
}

/// Batched dotted-field-path update against the device document.
///
/// Paths use the `gpioState.{pin}.{field}` shape of the wire contract;
/// the store implementations translate them to their native update form.
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    fields: Vec<(String, Value)>,
}

impl DocumentUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.fields.push((path.into(), value));
        self
    }

    pub fn set_pin_field(&mut self, pin: u8, field: &str, value: Value) -> &mut Self {
        self.set(format!("{}.{}.{}", fields::GPIO_STATE, pin, field), value)
    }

    pub fn set_schedule_field(
        &mut self,
        pin: u8,
        schedule_id: &str,
        field: &str,
        value: Value,
    ) -> &mut Self {
        self.set(
            format!(
                "{}.{}.{}.{}.{}",
                fields::GPIO_STATE,
                pin,
                fields::SCHEDULES,
                schedule_id,
                field
            ),
            value,
        )
    }

    /// Presence marker shared by the sync push, boot sync and emergency stop.
    pub fn set_heartbeat(&mut self) -> &mut Self {
        self.set(fields::LAST_HEARTBEAT, now_ts());
        self.set(fields::STATUS, json!("online"))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }
}
