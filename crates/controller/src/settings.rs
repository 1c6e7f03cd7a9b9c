//! TOML rig settings: pin assignment, circuit/program counts and flow sensor
//! calibration. Every field has a default matching the reference rig, so a
//! missing file or a partial file is valid.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Relay boards driven LOW for "on". The reference rig is active-high.
    pub active_low: bool,
    pub pins: PinSettings,
    pub watering: WateringSettings,
    pub flow: FlowSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinSettings {
    /// Circuit address lines, most significant bit first.
    pub address: [i64; 4],
    /// HIGH while any circuit is active.
    pub any_active: i64,
    pub main_valve: i64,
    pub flow_sensor: i64,
    pub electricity: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WateringSettings {
    pub circuits: u8,
    pub programs: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub sampling_frequency_hz: f64,
    /// flow (L/min) = (pulses * sampling_frequency_hz + offset) / divisor
    pub offset: f64,
    pub divisor: f64,
    pub max_continuous_minutes: f64,
    pub retention_hours: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_low: false,
            pins: PinSettings::default(),
            watering: WateringSettings::default(),
            flow: FlowSettings::default(),
        }
    }
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            address: [20, 26, 16, 19],
            any_active: 21,
            main_valve: 5,
            flow_sensor: 4,
            electricity: 6,
        }
    }
}

impl Default for WateringSettings {
    fn default() -> Self {
        Self {
            circuits: 12,
            programs: 3,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            sampling_frequency_hz: 1.0 / 30.0,
            offset: 0.0,
            divisor: 7.5,
            max_continuous_minutes: 60.0,
            retention_hours: 24,
        }
    }
}

impl FlowSettings {
    /// Governor tick period.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sampling_frequency_hz)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Four address lines encode at most 16 circuits.
pub const MAX_CIRCUITS: u8 = 16;

/// Start-time slots per program in the watering config.
pub const START_SLOTS: u8 = 3;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_watering(&mut errors);
        self.validate_flow(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let p = &self.pins;
        let named = [
            ("address[0]", p.address[0]),
            ("address[1]", p.address[1]),
            ("address[2]", p.address[2]),
            ("address[3]", p.address[3]),
            ("any_active", p.any_active),
            ("main_valve", p.main_valve),
            ("flow_sensor", p.flow_sensor),
            ("electricity", p.electricity),
        ];

        let mut seen: HashSet<i64> = HashSet::new();
        for (name, pin) in named {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("pins.{name}: {pin} is already used by another line"));
            }
        }
    }

    fn validate_watering(&self, errors: &mut Vec<String>) {
        let w = &self.watering;
        if w.circuits == 0 || w.circuits > MAX_CIRCUITS {
            errors.push(format!(
                "watering.circuits: {} out of range [1, {MAX_CIRCUITS}]",
                w.circuits
            ));
        }
        if w.programs == 0 {
            errors.push("watering.programs must be positive, got 0".to_string());
        }
    }

    fn validate_flow(&self, errors: &mut Vec<String>) {
        let f = &self.flow;
        if !(f.sampling_frequency_hz > 0.0 && f.sampling_frequency_hz <= 1.0) {
            errors.push(format!(
                "flow.sampling_frequency_hz: {} out of range (0, 1]",
                f.sampling_frequency_hz
            ));
        }
        if f.divisor == 0.0 || !f.divisor.is_finite() {
            errors.push(format!("flow.divisor must be finite and non-zero, got {}", f.divisor));
        }
        if f.offset < 0.0 {
            errors.push(format!("flow.offset must not be negative, got {}", f.offset));
        }
        if f.max_continuous_minutes <= 0.0 {
            errors.push(format!(
                "flow.max_continuous_minutes must be positive, got {}",
                f.max_continuous_minutes
            ));
        }
        if f.retention_hours == 0 {
            errors.push("flow.retention_hours must be positive, got 0".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file. A missing file yields the
/// defaults.
pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let settings = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "settings file not found, using defaults");
        Settings::default()
    };
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_validation_err(s: &Settings, needle: &str) {
        let err = s.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_settings_gives_defaults() {
        let s: Settings = toml::from_str("").unwrap();
        assert_eq!(s.pins.address, [20, 26, 16, 19]);
        assert_eq!(s.watering.circuits, 12);
        assert_eq!(s.watering.programs, 3);
        assert!((s.flow.divisor - 7.5).abs() < f64::EPSILON);
        s.validate().unwrap();
    }

    #[test]
    fn parse_partial_settings() {
        let toml_str = r#"
active_low = true

[pins]
main_valve = 12

[watering]
circuits = 8

[flow]
max_continuous_minutes = 45.0
"#;
        let s: Settings = toml::from_str(toml_str).unwrap();
        assert!(s.active_low);
        assert_eq!(s.pins.main_valve, 12);
        assert_eq!(s.pins.any_active, 21);
        assert_eq!(s.watering.circuits, 8);
        assert_eq!(s.watering.programs, 3);
        assert!((s.flow.max_continuous_minutes - 45.0).abs() < f64::EPSILON);
        s.validate().unwrap();
    }

    #[test]
    fn default_period_is_thirty_seconds() {
        assert_eq!(FlowSettings::default().period(), Duration::from_secs(30));
    }

    // -- Pins -------------------------------------------------------------

    #[test]
    fn pin_outside_header_rejected() {
        let mut s = Settings::default();
        s.pins.main_valve = 28;
        assert_validation_err(&s, "pins.main_valve: 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn reserved_pin_rejected() {
        let mut s = Settings::default();
        s.pins.address[2] = 1;
        assert_validation_err(&s, "pins.address[2]: 1 is not a valid");
    }

    #[test]
    fn duplicate_pin_rejected() {
        let mut s = Settings::default();
        s.pins.electricity = s.pins.any_active;
        assert_validation_err(&s, "already used by another line");
    }

    // -- Watering / flow --------------------------------------------------

    #[test]
    fn too_many_circuits_rejected() {
        let mut s = Settings::default();
        s.watering.circuits = 17;
        assert_validation_err(&s, "watering.circuits: 17 out of range");
    }

    #[test]
    fn zero_programs_rejected() {
        let mut s = Settings::default();
        s.watering.programs = 0;
        assert_validation_err(&s, "watering.programs must be positive");
    }

    #[test]
    fn zero_divisor_rejected() {
        let mut s = Settings::default();
        s.flow.divisor = 0.0;
        assert_validation_err(&s, "flow.divisor");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut s = Settings::default();
        s.pins.flow_sensor = 0;
        s.watering.circuits = 0;
        s.flow.sampling_frequency_hz = 0.0;
        let msg = format!("{:#}", s.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "unexpected: {msg}");
        assert!(msg.contains("pins.flow_sensor"), "unexpected: {msg}");
        assert!(msg.contains("watering.circuits"), "unexpected: {msg}");
        assert!(msg.contains("sampling_frequency_hz"), "unexpected: {msg}");
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("rig-controller-no-such-settings.toml");
        let s = load(&path).unwrap();
        assert_eq!(s.watering.circuits, 12);
    }
}
