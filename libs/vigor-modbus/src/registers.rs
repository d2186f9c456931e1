//! Vigor register map
//!
//! A static table of every semantic field the engine knows: address, range
//! class, decode rule and, for writable fields, an encode rule. Decoding is
//! total: every raw value yields a [`SemanticValue`], with sentinels and
//! unknown enum codes mapped to explicit variants instead of errors.

use serde::Serialize;
use std::fmt;

use crate::constants::MODBUS_MAX_READ_REGISTERS;
use crate::error::{Result, VigorError};
use crate::pdu::Request;

/// Bumped whenever a field is added, removed or re-addressed
pub const REGISTER_MAP_VERSION: u32 = 1;

/// Access class of a register range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeClass {
    /// 4000-4801, read-only, FC04
    Input,
    /// 6000-7993, read/write, FC03/FC06
    HoldingConfig,
    /// 8000-8011, read/write, reset by the device on power loss
    HoldingCommand,
}

impl RangeClass {
    pub fn of(address: u16) -> Option<Self> {
        match address {
            4000..=4801 => Some(RangeClass::Input),
            6000..=7993 => Some(RangeClass::HoldingConfig),
            8000..=8011 => Some(RangeClass::HoldingCommand),
            _ => None,
        }
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, RangeClass::Input)
    }

    /// Values in this range revert when the device loses power
    pub fn is_volatile(self) -> bool {
        matches!(self, RangeClass::HoldingCommand)
    }

    /// Read request using the function code matching this range
    pub fn read_request(self, start: u16, count: u16) -> Request {
        match self {
            RangeClass::Input => Request::ReadInputRegisters { start, count },
            RangeClass::HoldingConfig | RangeClass::HoldingCommand => {
                Request::ReadHoldingRegisters { start, count }
            },
        }
    }
}

/// Address inside one of the three mapped ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    address: u16,
    class: RangeClass,
}

impl RegisterAddress {
    pub fn new(address: u16) -> Result<Self> {
        let class = RangeClass::of(address).ok_or_else(|| {
            VigorError::invalid_value(format!("Register {address} is outside the mapped ranges"))
        })?;
        Ok(Self { address, class })
    }

    pub fn get(self) -> u16 {
        self.address
    }

    pub fn class(self) -> RangeClass {
        self.class
    }

    pub fn read_request(self, count: u16) -> Request {
        self.class.read_request(self.address, count)
    }

    /// FC06 request; input registers are never written
    pub fn write_request(self, value: u16) -> Result<Request> {
        if !self.class.is_writable() {
            return Err(VigorError::NotWritable(format!(
                "register {} is an input register",
                self.address
            )));
        }
        Ok(Request::WriteSingleRegister {
            address: self.address,
            value,
        })
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Decoded register content
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SemanticValue {
    Integer(i64),
    Float(f64),
    /// Enum code; `label` is `None` for codes the map does not know
    Enum {
        raw: u16,
        label: Option<&'static str>,
    },
    Text(String),
    /// Device reports no sensor, sensor not running, or no incident
    Unavailable,
}

impl SemanticValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SemanticValue::Integer(v) => Some(*v as f64),
            SemanticValue::Float(v) => Some(*v),
            SemanticValue::Enum { raw, .. } => Some(f64::from(*raw)),
            SemanticValue::Text(_) | SemanticValue::Unavailable => None,
        }
    }
}

impl fmt::Display for SemanticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticValue::Integer(v) => write!(f, "{v}"),
            SemanticValue::Float(v) => write!(f, "{v:.1}"),
            SemanticValue::Enum {
                label: Some(label), ..
            } => f.write_str(label),
            SemanticValue::Enum { raw, label: None } => write!(f, "Unrecognized({raw})"),
            SemanticValue::Text(text) => f.write_str(text),
            SemanticValue::Unavailable => f.write_str("unavailable"),
        }
    }
}

impl From<f64> for SemanticValue {
    fn from(value: f64) -> Self {
        SemanticValue::Float(value)
    }
}

impl From<i64> for SemanticValue {
    fn from(value: i64) -> Self {
        SemanticValue::Integer(value)
    }
}

impl From<u16> for SemanticValue {
    fn from(value: u16) -> Self {
        SemanticValue::Integer(i64::from(value))
    }
}

impl From<&str> for SemanticValue {
    fn from(value: &str) -> Self {
        SemanticValue::Text(value.to_string())
    }
}

impl From<String> for SemanticValue {
    fn from(value: String) -> Self {
        SemanticValue::Text(value)
    }
}

fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_label(table: &[(u16, &'static str)], raw: u16) -> Option<&'static str> {
    table
        .iter()
        .find(|(code, _)| *code == raw)
        .map(|(_, label)| *label)
}

fn lookup_code(table: &[(u16, &'static str)], label: &str) -> Option<u16> {
    let wanted = normalize_label(label);
    table
        .iter()
        .find(|(_, candidate)| normalize_label(candidate) == wanted)
        .map(|(code, _)| *code)
}

/// Typed register enum with a catch-all for codes newer firmware may add
macro_rules! register_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $raw:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            Unrecognized(u16),
        }

        impl $name {
            pub const TABLE: &'static [(u16, &'static str)] = &[$(($raw, $label)),+];

            pub fn from_raw(raw: u16) -> Self {
                match raw {
                    $($raw => $name::$variant,)+
                    other => $name::Unrecognized(other),
                }
            }

            pub fn raw(self) -> u16 {
                match self {
                    $($name::$variant => $raw,)+
                    $name::Unrecognized(raw) => raw,
                }
            }

            pub fn label(self) -> Option<&'static str> {
                match self {
                    $($name::$variant => Some($label),)+
                    $name::Unrecognized(_) => None,
                }
            }

            /// Case-, space- and underscore-insensitive label lookup
            pub fn from_label(label: &str) -> Option<Self> {
                lookup_code(Self::TABLE, label).map(Self::from_raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.label() {
                    Some(label) => f.write_str(label),
                    None => write!(f, "Unrecognized({})", self.raw()),
                }
            }
        }
    };
}

register_enum!(
    /// 4020
    ActiveFunction {
        Standby = 0 => "Standby",
        Bootloader = 1 => "Bootloader",
        Manual = 4 => "Manual",
        Holiday = 5 => "Holiday",
        NightVentilation = 6 => "Night Ventilation",
        Party = 7 => "Party",
        BypassBoost = 8 => "Bypass Boost",
        NormalBoost = 9 => "Normal Boost",
        AutoCo2 = 10 => "Auto CO2",
        AutoEbus = 11 => "Auto eBus",
        AutoModbus = 12 => "Auto Modbus",
        AutoPortal = 13 => "Auto LAN/WLAN Portal",
        AutoLocal = 14 => "Auto LAN/WLAN Local",
    }
);

register_enum!(
    /// 4022
    VentilationMode {
        Holiday = 0 => "Holiday",
        Low = 1 => "Low",
        Normal = 2 => "Normal",
        High = 3 => "High",
        Auto = 4 => "Auto",
    }
);

register_enum!(
    /// 4030 / 4040
    FanStatus {
        NoCommunication = 2 => "No Communication",
        Idle = 3 => "Idle",
        Running = 4 => "Running",
        Blocked = 5 => "Blocked",
        FanError = 6 => "Fan Error",
    }
);

register_enum!(
    /// 4050
    BypassStatus {
        Initializing = 0 => "Initializing",
        Opening = 1 => "Opening",
        Closing = 2 => "Closing",
        Open = 3 => "Open",
        Closed = 4 => "Closed",
    }
);

register_enum!(
    /// 4060
    PreheaterStatus {
        Initializing = 0 => "Initializing",
        Inactive = 1 => "Inactive",
        Active = 2 => "Active",
        TestMode = 3 => "Test Mode",
    }
);

register_enum!(
    /// 4100
    FilterStatus {
        Clean = 0 => "Clean",
        Dirty = 1 => "Dirty",
    }
);

register_enum!(
    /// 4800
    ErrorSeverity {
        NoError = 0 => "No Error",
        Warning = 1 => "Warning",
        NonBlocking = 2 => "Non-blocking Error",
        Blocking = 3 => "Blocking Error",
    }
);

register_enum!(
    /// 6100
    BypassMode {
        Automatic = 0 => "Automatic",
        Closed = 1 => "Closed",
        Open = 2 => "Open",
    }
);

register_enum!(
    /// 8000
    ControlMode {
        Off = 0 => "Off",
        Switch = 1 => "Switch",
        FlowRate = 2 => "Flow Rate",
    }
);

register_enum!(
    /// 8001
    SwitchPosition {
        Holiday = 0 => "Holiday",
        Low = 1 => "Low",
        Normal = 2 => "Normal",
        High = 3 => "High",
    }
);

register_enum!(
    /// 8003
    StandbyState {
        Standby = 1 => "Standby",
        Normal = 2 => "Normal",
    }
);

/// Airflow mode derived from modbus control (8000) and switch position (8001)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AirflowMode {
    /// Modbus control off, wall unit in charge
    WallUnit,
    Preset(SwitchPosition),
    /// Fixed flow rate from 8002
    Custom,
    Unrecognized(u16),
}

impl AirflowMode {
    pub fn derive(control: u16, switch_position: u16) -> Self {
        match ControlMode::from_raw(control) {
            ControlMode::Off => AirflowMode::WallUnit,
            ControlMode::Switch => AirflowMode::Preset(SwitchPosition::from_raw(switch_position)),
            ControlMode::FlowRate => AirflowMode::Custom,
            ControlMode::Unrecognized(raw) => AirflowMode::Unrecognized(raw),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match normalize_label(label).as_str() {
            "wallunit" => Some(AirflowMode::WallUnit),
            "custom" => Some(AirflowMode::Custom),
            _ => SwitchPosition::from_label(label).map(AirflowMode::Preset),
        }
    }
}

impl fmt::Display for AirflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AirflowMode::WallUnit => f.write_str("Wall Unit"),
            AirflowMode::Preset(position) => write!(f, "{position}"),
            AirflowMode::Custom => f.write_str("Custom"),
            AirflowMode::Unrecognized(raw) => write!(f, "Unrecognized({raw})"),
        }
    }
}

/// Raw words to semantic value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decode {
    /// raw / divisor; divisor 1 yields an integer
    Unsigned { divisor: u16 },
    /// two's complement raw / divisor
    Signed { divisor: u16 },
    /// raw above `max_raw` means no sensor
    Bounded { divisor: u16, max_raw: u16 },
    /// signed raw equal to `sentinel` means no sensor
    SignedSentinel { divisor: u16, sentinel: i16 },
    Enum(&'static [(u16, &'static str)]),
    /// two words, high word first
    U32,
    /// `words` registers of four BCD digits each
    Bcd { words: u16 },
    /// zero means nothing active
    NonZero,
    /// status word then value word; value valid only when status == `valid`
    Gated { valid: u16 },
    /// major word then minor word
    Version,
}

impl Decode {
    pub const fn words(&self) -> u16 {
        match self {
            Decode::U32 | Decode::Gated { .. } | Decode::Version => 2,
            Decode::Bcd { words } => *words,
            _ => 1,
        }
    }

    /// Decode `words`; a short slice decodes as unavailable
    pub fn decode(&self, words: &[u16]) -> SemanticValue {
        if words.len() < self.words() as usize {
            return SemanticValue::Unavailable;
        }
        let raw = words[0];
        match *self {
            Decode::Unsigned { divisor } => scaled(i64::from(raw), divisor),
            Decode::Signed { divisor } => scaled(i64::from(raw as i16), divisor),
            Decode::Bounded { divisor, max_raw } => {
                if raw > max_raw {
                    SemanticValue::Unavailable
                } else {
                    scaled(i64::from(raw), divisor)
                }
            },
            Decode::SignedSentinel { divisor, sentinel } => {
                let signed = raw as i16;
                if signed == sentinel {
                    SemanticValue::Unavailable
                } else {
                    scaled(i64::from(signed), divisor)
                }
            },
            Decode::Enum(table) => SemanticValue::Enum {
                raw,
                label: lookup_label(table, raw),
            },
            Decode::U32 => {
                SemanticValue::Integer(i64::from((u32::from(words[0]) << 16) | u32::from(words[1])))
            },
            Decode::Bcd { words: count } => {
                let digits = words[..count as usize]
                    .iter()
                    .map(|word| {
                        format!(
                            "{}{}{}{}",
                            (word >> 12) & 0xF,
                            (word >> 8) & 0xF,
                            (word >> 4) & 0xF,
                            word & 0xF
                        )
                    })
                    .collect::<String>();
                SemanticValue::Text(digits)
            },
            Decode::NonZero => {
                if raw == 0 {
                    SemanticValue::Unavailable
                } else {
                    SemanticValue::Integer(i64::from(raw))
                }
            },
            Decode::Gated { valid } => {
                if raw == valid {
                    SemanticValue::Integer(i64::from(words[1]))
                } else {
                    SemanticValue::Unavailable
                }
            },
            Decode::Version => SemanticValue::Text(format!("{}.{}", words[0], words[1])),
        }
    }
}

fn scaled(value: i64, divisor: u16) -> SemanticValue {
    if divisor <= 1 {
        SemanticValue::Integer(value)
    } else {
        SemanticValue::Float(value as f64 / f64::from(divisor))
    }
}

/// Semantic value to raw word, validated before any bus traffic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encode {
    /// value * multiplier, bounded and on a step grid starting at `min`
    Scaled {
        min: f64,
        max: f64,
        step: f64,
        multiplier: u16,
    },
    Enum(&'static [(u16, &'static str)]),
    /// Stateless command: always writes `sentinel`
    Action { sentinel: u16 },
}

impl Encode {
    pub fn encode(&self, field: &str, value: &SemanticValue) -> Result<u16> {
        match *self {
            Encode::Scaled {
                min,
                max,
                step,
                multiplier,
            } => {
                let number = match value {
                    SemanticValue::Integer(_) | SemanticValue::Float(_) => value.as_f64(),
                    SemanticValue::Text(text) => text.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|n| n.is_finite())
                .ok_or_else(|| {
                    VigorError::invalid_value(format!("{field} expects a number, got {value}"))
                })?;

                // off-grid values are reported as such even when out of range
                let steps = (number - min) / step;
                if (steps - steps.round()).abs() > 1e-6 {
                    return Err(VigorError::InvalidStep {
                        field: field.to_string(),
                        value: number,
                        step,
                    });
                }
                if number < min || number > max {
                    return Err(VigorError::OutOfRange {
                        field: field.to_string(),
                        value: number,
                        min,
                        max,
                    });
                }

                let raw = (number * f64::from(multiplier)).round() as i64;
                Ok(raw as i16 as u16)
            },
            Encode::Enum(table) => {
                let code = match value {
                    SemanticValue::Text(label) => lookup_code(table, label),
                    SemanticValue::Enum { raw, .. } => Some(*raw),
                    SemanticValue::Integer(n) => u16::try_from(*n).ok(),
                    _ => None,
                };
                code.filter(|code| lookup_label(table, *code).is_some())
                    .ok_or_else(|| {
                        let options = table
                            .iter()
                            .map(|(_, label)| *label)
                            .collect::<Vec<_>>()
                            .join(", ");
                        VigorError::invalid_value(format!(
                            "{field} expects one of [{options}], got {value}"
                        ))
                    })
            },
            Encode::Action { sentinel } => Ok(sentinel),
        }
    }
}

/// One mapped field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub address: u16,
    pub class: RangeClass,
    pub decode: Decode,
    pub encode: Option<Encode>,
    pub unit: Option<&'static str>,
    /// Actions are never read back
    pub polled: bool,
}

impl Field {
    pub fn words(&self) -> u16 {
        self.decode.words()
    }

    pub fn register(&self) -> RegisterAddress {
        RegisterAddress {
            address: self.address,
            class: self.class,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self.encode,
            Some(Encode::Scaled { .. }) | Some(Encode::Enum(_))
        )
    }

    pub fn is_action(&self) -> bool {
        matches!(self.encode, Some(Encode::Action { .. }))
    }

    /// Validate and encode a value for this field
    pub fn encode(&self, value: &SemanticValue) -> Result<u16> {
        match self.encode {
            Some(rule) => rule.encode(self.name, value),
            None => Err(VigorError::NotWritable(self.name.to_string())),
        }
    }
}

const fn input(
    name: &'static str,
    address: u16,
    decode: Decode,
    unit: Option<&'static str>,
) -> Field {
    Field {
        name,
        address,
        class: RangeClass::Input,
        decode,
        encode: None,
        unit,
        polled: true,
    }
}

const fn holding(
    name: &'static str,
    address: u16,
    class: RangeClass,
    decode: Decode,
    encode: Option<Encode>,
    unit: Option<&'static str>,
) -> Field {
    Field {
        name,
        address,
        class,
        decode,
        encode,
        unit,
        polled: true,
    }
}

const fn action(name: &'static str, address: u16) -> Field {
    Field {
        name,
        address,
        class: RangeClass::HoldingCommand,
        decode: Decode::Unsigned { divisor: 1 },
        encode: Some(Encode::Action { sentinel: 1 }),
        unit: None,
        polled: false,
    }
}

const RAW: Decode = Decode::Unsigned { divisor: 1 };
const TENTHS: Decode = Decode::Signed { divisor: 10 };
const HUMIDITY: Decode = Decode::Bounded {
    divisor: 10,
    max_raw: 1000,
};

const CELSIUS: Option<&str> = Some("°C");
const PERCENT: Option<&str> = Some("%");
const FLOW: Option<&str> = Some("m³/h");
const RPM: Option<&str> = Some("rpm");
const PASCAL: Option<&str> = Some("Pa");

/// Address of the register every cycle must be able to read
pub const BASIC_REGISTER: u16 = 4020;

pub const MODBUS_CONTROL: &str = "modbus_control";
pub const SWITCH_POSITION: &str = "switch_position";
pub const DESIRED_FLOW_RATE: &str = "desired_flow_rate";
pub const STANDBY: &str = "standby";
pub const FILTER_RESET: &str = "filter_reset";
pub const APPLIANCE_RESET: &str = "appliance_reset";
/// Virtual field derived from 8000/8001
pub const AIRFLOW_MODE: &str = "airflow_mode";

static FIELDS: &[Field] = &[
    // Device info
    input("software_version", 4000, Decode::Version, None),
    input("appliance_type", 4004, RAW, None),
    input("serial_number", 4010, Decode::Bcd { words: 3 }, None),
    // Function
    input("active_function", 4020, Decode::Enum(ActiveFunction::TABLE), None),
    input("fan_control_type", 4021, RAW, None),
    input("ventilation_mode", 4022, Decode::Enum(VentilationMode::TABLE), None),
    input("supply_pressure", 4023, TENTHS, PASCAL),
    input("exhaust_pressure", 4024, TENTHS, PASCAL),
    // Supply fan
    input("supply_fan_status", 4030, Decode::Enum(FanStatus::TABLE), None),
    input("supply_airflow_setpoint", 4031, RAW, FLOW),
    input("supply_airflow_actual", 4032, RAW, FLOW),
    input("supply_massflow", 4033, RAW, None),
    input("supply_fan_speed", 4034, RAW, RPM),
    input("supply_temperature", 4036, TENTHS, CELSIUS),
    input("supply_humidity", 4037, HUMIDITY, PERCENT),
    // Exhaust fan
    input("exhaust_fan_status", 4040, Decode::Enum(FanStatus::TABLE), None),
    input("exhaust_airflow_actual", 4042, RAW, FLOW),
    input("exhaust_fan_speed", 4044, RAW, RPM),
    input("exhaust_temperature", 4046, TENTHS, CELSIUS),
    input("exhaust_humidity", 4047, HUMIDITY, PERCENT),
    // Bypass
    input("bypass_status", 4050, Decode::Enum(BypassStatus::TABLE), None),
    input("bypass_step_position", 4051, RAW, None),
    // Preheater
    input("preheater_status", 4060, Decode::Enum(PreheaterStatus::TABLE), None),
    input("preheater_capacity", 4061, RAW, PERCENT),
    // Frost protection
    input("frost_status", 4070, RAW, None),
    input("frost_heater_power", 4071, RAW, PERCENT),
    input("frost_fan_reduction", 4072, RAW, PERCENT),
    // Sensors
    input("flow_switch_position", 4080, RAW, None),
    input("outside_temperature", 4081, TENTHS, CELSIUS),
    input(
        "dwelling_temperature",
        4082,
        Decode::SignedSentinel {
            divisor: 10,
            sentinel: 9999,
        },
        CELSIUS,
    ),
    input("rht_humidity", 4083, HUMIDITY, PERCENT),
    // Status
    input("filter_status", 4100, Decode::Enum(FilterStatus::TABLE), None),
    input("ebus_power", 4101, RAW, None),
    input("operating_hours", 4113, Decode::U32, Some("h")),
    input("filter_hours", 4115, RAW, Some("h")),
    input("co2_sensor_1", 4200, Decode::Gated { valid: 4 }, Some("ppm")),
    input("co2_sensor_2", 4202, Decode::Gated { valid: 4 }, Some("ppm")),
    input("system_error", 4800, Decode::Enum(ErrorSeverity::TABLE), None),
    input("active_incident", 4801, Decode::NonZero, None),
    // Configuration
    holding("flow_preset_holiday", 6000, RangeClass::HoldingConfig, RAW, None, FLOW),
    holding("flow_preset_low", 6001, RangeClass::HoldingConfig, RAW, None, FLOW),
    holding("flow_preset_normal", 6002, RangeClass::HoldingConfig, RAW, None, FLOW),
    holding("flow_preset_high", 6003, RangeClass::HoldingConfig, RAW, None, FLOW),
    holding(
        "bypass_mode",
        6100,
        RangeClass::HoldingConfig,
        Decode::Enum(BypassMode::TABLE),
        Some(Encode::Enum(BypassMode::TABLE)),
        None,
    ),
    holding(
        "bypass_temp_dwelling",
        6101,
        RangeClass::HoldingConfig,
        TENTHS,
        Some(Encode::Scaled {
            min: 15.0,
            max: 35.0,
            step: 0.5,
            multiplier: 10,
        }),
        CELSIUS,
    ),
    holding(
        "bypass_temp_outside",
        6102,
        RangeClass::HoldingConfig,
        TENTHS,
        Some(Encode::Scaled {
            min: 7.0,
            max: 15.0,
            step: 0.5,
            multiplier: 10,
        }),
        CELSIUS,
    ),
    holding("filter_warning_days", 6120, RangeClass::HoldingConfig, RAW, None, Some("d")),
    // Remote control (volatile)
    holding(
        MODBUS_CONTROL,
        8000,
        RangeClass::HoldingCommand,
        Decode::Enum(ControlMode::TABLE),
        Some(Encode::Enum(ControlMode::TABLE)),
        None,
    ),
    holding(
        SWITCH_POSITION,
        8001,
        RangeClass::HoldingCommand,
        Decode::Enum(SwitchPosition::TABLE),
        Some(Encode::Enum(SwitchPosition::TABLE)),
        None,
    ),
    holding(
        DESIRED_FLOW_RATE,
        8002,
        RangeClass::HoldingCommand,
        RAW,
        Some(Encode::Scaled {
            min: 50.0,
            max: 400.0,
            step: 5.0,
            multiplier: 1,
        }),
        FLOW,
    ),
    holding(
        STANDBY,
        8003,
        RangeClass::HoldingCommand,
        Decode::Enum(StandbyState::TABLE),
        Some(Encode::Enum(StandbyState::TABLE)),
        None,
    ),
    action(FILTER_RESET, 8010),
    action(APPLIANCE_RESET, 8011),
];

/// All mapped fields in address order
pub fn fields() -> &'static [Field] {
    FIELDS
}

/// Field by semantic name
pub fn field(name: &str) -> Result<&'static Field> {
    FIELDS
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| VigorError::UnknownField(name.to_string()))
}

/// Contiguous read covering one or more fields of the same range class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBlock {
    pub class: RangeClass,
    pub start: u16,
    pub count: u16,
}

impl PollBlock {
    pub fn end(&self) -> u16 {
        self.start + self.count - 1
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.start..=self.end()).contains(&address)
    }

    /// A failing basic block fails the whole cycle
    pub fn is_basic(&self) -> bool {
        self.contains(BASIC_REGISTER)
    }

    pub fn request(&self) -> Request {
        self.class.read_request(self.start, self.count)
    }
}

/// Group polled fields into read blocks
///
/// Fields of one class merge while at most `max_gap` unmapped registers sit
/// between them and the block stays within one read.
pub fn poll_blocks(max_gap: u16) -> Vec<PollBlock> {
    let mut polled: Vec<&Field> = FIELDS.iter().filter(|f| f.polled).collect();
    polled.sort_by_key(|f| (f.class, f.address));

    let mut blocks: Vec<PollBlock> = Vec::new();
    for field in polled {
        let field_end = field.address + field.words() - 1;
        if let Some(block) = blocks.last_mut() {
            let gap = field.address.saturating_sub(block.end() + 1);
            let merged_count = field_end - block.start + 1;
            if block.class == field.class
                && field.address > block.end()
                && gap <= max_gap
                && merged_count <= MODBUS_MAX_READ_REGISTERS
            {
                block.count = merged_count;
                continue;
            }
        }
        blocks.push(PollBlock {
            class: field.class,
            start: field.address,
            count: field.words(),
        });
    }
    blocks
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_table_addresses_match_classes() {
        for f in fields() {
            let end = f.address + f.words() - 1;
            assert_eq!(RangeClass::of(f.address), Some(f.class), "{}", f.name);
            assert_eq!(RangeClass::of(end), Some(f.class), "{}", f.name);
            assert_eq!(RegisterAddress::new(f.address).unwrap(), f.register());
            if f.class == RangeClass::Input {
                assert!(f.encode.is_none(), "{} is an input", f.name);
            }
        }
    }

    #[test]
    fn test_table_has_no_overlaps() {
        let mut used = std::collections::HashSet::new();
        for f in fields() {
            for a in f.address..f.address + f.words() {
                assert!(used.insert(a), "register {} mapped twice", a);
            }
        }
    }

    #[test]
    fn test_input_register_never_writable() {
        let addr = RegisterAddress::new(4020).unwrap();
        assert!(matches!(
            addr.write_request(1),
            Err(VigorError::NotWritable(_))
        ));
        assert!(matches!(
            addr.read_request(1),
            Request::ReadInputRegisters { start: 4020, count: 1 }
        ));

        let addr = RegisterAddress::new(8002).unwrap();
        assert!(matches!(
            addr.read_request(1),
            Request::ReadHoldingRegisters { .. }
        ));
        assert!(addr.write_request(200).is_ok());
        assert!(RegisterAddress::new(5000).is_err());
    }

    #[test]
    fn test_enum_decoding_is_total() {
        for f in fields() {
            let Decode::Enum(table) = f.decode else {
                continue;
            };
            for raw in 0..=u16::MAX {
                match f.decode.decode(&[raw]) {
                    SemanticValue::Enum { raw: r, label } => {
                        assert_eq!(r, raw);
                        assert_eq!(label.is_some(), table.iter().any(|(c, _)| *c == raw));
                    },
                    other => panic!("{} decoded {} to {:?}", f.name, raw, other),
                }
            }
        }
    }

    #[test]
    fn test_typed_enums_total() {
        for raw in 0..=u16::MAX {
            assert_eq!(BypassMode::from_raw(raw).raw(), raw);
            assert_eq!(BypassStatus::from_raw(raw).raw(), raw);
            assert_eq!(FilterStatus::from_raw(raw).raw(), raw);
            assert_eq!(ErrorSeverity::from_raw(raw).raw(), raw);
        }
        assert_eq!(BypassMode::from_raw(7), BypassMode::Unrecognized(7));
        assert_eq!(BypassMode::from_label("open"), Some(BypassMode::Open));
        assert_eq!(ErrorSeverity::from_label("non_blocking_error"), Some(ErrorSeverity::NonBlocking));
    }

    #[test]
    fn test_airflow_mode_derivation() {
        assert_eq!(AirflowMode::derive(0, 3), AirflowMode::WallUnit);
        assert_eq!(
            AirflowMode::derive(1, 2),
            AirflowMode::Preset(SwitchPosition::Normal)
        );
        assert_eq!(
            AirflowMode::derive(1, 9),
            AirflowMode::Preset(SwitchPosition::Unrecognized(9))
        );
        assert_eq!(AirflowMode::derive(2, 0), AirflowMode::Custom);
        assert_eq!(AirflowMode::derive(5, 0), AirflowMode::Unrecognized(5));
        assert_eq!(AirflowMode::from_label("wall_unit"), Some(AirflowMode::WallUnit));
        assert_eq!(
            AirflowMode::from_label("high"),
            Some(AirflowMode::Preset(SwitchPosition::High))
        );
    }

    #[test]
    fn test_sentinel_decodes() {
        let humidity = field("supply_humidity").unwrap();
        assert_eq!(humidity.decode.decode(&[455]), SemanticValue::Float(45.5));
        assert_eq!(humidity.decode.decode(&[1001]), SemanticValue::Unavailable);

        let dwelling = field("dwelling_temperature").unwrap();
        assert_eq!(dwelling.decode.decode(&[9999]), SemanticValue::Unavailable);
        assert_eq!(dwelling.decode.decode(&[215]), SemanticValue::Float(21.5));

        let outside = field("outside_temperature").unwrap();
        assert_eq!(
            outside.decode.decode(&[(-52i16) as u16]),
            SemanticValue::Float(-5.2)
        );

        let co2 = field("co2_sensor_1").unwrap();
        assert_eq!(co2.decode.decode(&[4, 650]), SemanticValue::Integer(650));
        assert_eq!(co2.decode.decode(&[3, 650]), SemanticValue::Unavailable);

        let incident = field("active_incident").unwrap();
        assert_eq!(incident.decode.decode(&[0]), SemanticValue::Unavailable);
        assert_eq!(incident.decode.decode(&[17]), SemanticValue::Integer(17));
    }

    #[test]
    fn test_multi_word_decodes() {
        let hours = field("operating_hours").unwrap();
        assert_eq!(
            hours.decode.decode(&[0x0001, 0x0002]),
            SemanticValue::Integer(65538)
        );
        let serial = field("serial_number").unwrap();
        assert_eq!(
            serial.decode.decode(&[0x1234, 0x5678, 0x9012]),
            SemanticValue::Text("123456789012".to_string())
        );
        assert_eq!(hours.decode.decode(&[1]), SemanticValue::Unavailable);
    }

    #[test]
    fn test_flow_rate_validation() {
        let rate = field(DESIRED_FLOW_RATE).unwrap();
        assert!(matches!(
            rate.encode(&SemanticValue::Integer(403)),
            Err(VigorError::InvalidStep { .. })
        ));
        assert!(matches!(
            rate.encode(&SemanticValue::Integer(503)),
            Err(VigorError::InvalidStep { .. })
        ));
        assert!(matches!(
            rate.encode(&SemanticValue::Integer(500)),
            Err(VigorError::OutOfRange { .. })
        ));
        assert!(matches!(
            rate.encode(&SemanticValue::Integer(45)),
            Err(VigorError::OutOfRange { .. })
        ));
        let raw = rate.encode(&SemanticValue::Integer(200)).unwrap();
        assert_eq!(rate.decode.decode(&[raw]), SemanticValue::Integer(200));
    }

    #[test]
    fn test_round_trip_all_writable_values() {
        for f in fields().iter().filter(|f| f.is_writable()) {
            match f.encode {
                Some(Encode::Scaled { min, max, step, .. }) => {
                    let steps = ((max - min) / step).round() as u32;
                    for i in 0..=steps {
                        let value = min + f64::from(i) * step;
                        let raw = f.encode(&SemanticValue::Float(value)).unwrap();
                        let decoded = f.decode.decode(&[raw]).as_f64().unwrap();
                        assert!((decoded - value).abs() < 1e-9, "{} {}", f.name, value);
                    }
                },
                Some(Encode::Enum(table)) => {
                    for (code, label) in table {
                        let raw = f.encode(&SemanticValue::from(*label)).unwrap();
                        assert_eq!(raw, *code);
                        assert_eq!(
                            f.decode.decode(&[raw]),
                            SemanticValue::Enum {
                                raw: *code,
                                label: Some(*label)
                            }
                        );
                    }
                },
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_threshold_bounds() {
        let dwelling = field("bypass_temp_dwelling").unwrap();
        assert!(matches!(
            dwelling.encode(&SemanticValue::Float(14.5)),
            Err(VigorError::OutOfRange { .. })
        ));
        assert!(matches!(
            dwelling.encode(&SemanticValue::Float(20.25)),
            Err(VigorError::InvalidStep { .. })
        ));
        assert_eq!(dwelling.encode(&SemanticValue::Float(22.5)).unwrap(), 225);
    }

    #[test]
    fn test_enum_encode_rejects_unknown_label() {
        let mode = field("bypass_mode").unwrap();
        assert!(matches!(
            mode.encode(&SemanticValue::from("sideways")),
            Err(VigorError::InvalidValue(_))
        ));
        assert!(matches!(
            mode.encode(&SemanticValue::Integer(3)),
            Err(VigorError::InvalidValue(_))
        ));
        assert_eq!(mode.encode(&SemanticValue::Integer(2)).unwrap(), 2);
    }

    #[test]
    fn test_read_only_and_unknown_fields() {
        assert!(matches!(
            field("supply_temperature").unwrap().encode(&SemanticValue::Float(1.0)),
            Err(VigorError::NotWritable(_))
        ));
        assert!(matches!(field("warp_drive"), Err(VigorError::UnknownField(_))));
        assert_eq!(field(FILTER_RESET).unwrap().encode(&SemanticValue::Integer(0)).unwrap(), 1);
    }

    #[test]
    fn test_poll_blocks() {
        let blocks = poll_blocks(1);
        let spans: Vec<(u16, u16)> = blocks.iter().map(|b| (b.start, b.count)).collect();
        assert_eq!(
            spans,
            vec![
                (4000, 2),
                (4004, 1),
                (4010, 3),
                (4020, 5),
                (4030, 8),
                (4040, 8),
                (4050, 2),
                (4060, 2),
                (4070, 3),
                (4080, 4),
                (4100, 2),
                (4113, 3),
                (4200, 4),
                (4800, 2),
                (6000, 4),
                (6100, 3),
                (6120, 1),
                (8000, 4),
            ]
        );
        assert_eq!(blocks.iter().filter(|b| b.is_basic()).count(), 1);
        assert!(blocks.iter().all(|b| !b.contains(8010)));
    }

    #[test]
    fn test_poll_blocks_never_mix_classes() {
        for block in poll_blocks(5000) {
            assert_eq!(RangeClass::of(block.start), Some(block.class));
            assert_eq!(RangeClass::of(block.end()), Some(block.class));
            assert!(block.count <= MODBUS_MAX_READ_REGISTERS);
        }
    }
}
