//! Weekly watering configuration: the persisted JSON document, its
//! validation, and the file store that loads and saves it.
//!
//! ```json
//! { "1": { "selected": true,
//!          "circuits": { "3": { "activated": true, "time": 5 } },
//!          "days":     { "L": true, "X": false },
//!          "starts":   { "1": { "activated": true, "hour": "06:00" } } } }
//! ```

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{RigError, RigResult};
use crate::settings::{WateringSettings, START_SLOTS};

// ---------------------------------------------------------------------------
// Weekday codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    #[serde(rename = "L")]
    Monday,
    #[serde(rename = "M")]
    Tuesday,
    #[serde(rename = "X")]
    Wednesday,
    #[serde(rename = "J")]
    Thursday,
    #[serde(rename = "V")]
    Friday,
    #[serde(rename = "S")]
    Saturday,
    #[serde(rename = "D")]
    Sunday,
}

impl Weekday {
    pub fn code(self) -> char {
        match self {
            Self::Monday => 'L',
            Self::Tuesday => 'M',
            Self::Wednesday => 'X',
            Self::Thursday => 'J',
            Self::Friday => 'V',
            Self::Saturday => 'S',
            Self::Sunday => 'D',
        }
    }
}

impl From<time::Weekday> for Weekday {
    fn from(day: time::Weekday) -> Self {
        match day {
            time::Weekday::Monday => Self::Monday,
            time::Weekday::Tuesday => Self::Tuesday,
            time::Weekday::Wednesday => Self::Wednesday,
            time::Weekday::Thursday => Self::Thursday,
            time::Weekday::Friday => Self::Friday,
            time::Weekday::Saturday => Self::Saturday,
            time::Weekday::Sunday => Self::Sunday,
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Time of day ("HH:MM")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const MIDNIGHT: Self = Self { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        let digits = |i: usize| b[i].is_ascii_digit();
        if b.len() != 5 || b[2] != b':' || !(digits(0) && digits(1) && digits(3) && digits(4)) {
            return Err(format!("time '{s}' is not in HH:MM format"));
        }
        let hour = (b[0] - b'0') * 10 + (b[1] - b'0');
        let minute = (b[3] - b'0') * 10 + (b[4] - b'0');
        Self::new(hour, minute).ok_or_else(|| format!("time '{s}' is out of range"))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

// ---------------------------------------------------------------------------
// Insertion-ordered map
// ---------------------------------------------------------------------------

/// JSON object that keeps document order. Circuits run in the order they
/// are listed, not by id.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<K, V>(pub Vec<(K, V)>);

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<K, V> OrderedMap<K, V> {
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Serialize, V: Serialize> Serialize for OrderedMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, K, V> Deserialize<'de> for OrderedMap<K, V>
where
    K: Deserialize<'de> + PartialEq + fmt::Debug,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<K, V>(PhantomData<(K, V)>);

        impl<'de, K, V> Visitor<'de> for OrderedVisitor<K, V>
        where
            K: Deserialize<'de> + PartialEq + fmt::Debug,
            V: Deserialize<'de>,
        {
            type Value = OrderedMap<K, V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(K, V)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<K, V>()? {
                    if entries.iter().any(|(seen, _)| *seen == k) {
                        return Err(serde::de::Error::custom(format!("duplicate key {k:?}")));
                    }
                    entries.push((k, v));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

// ---------------------------------------------------------------------------
// Config document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WateringConfig {
    pub programs: BTreeMap<u8, ProgramConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub selected: bool,
    #[serde(default)]
    pub circuits: OrderedMap<u8, CircuitConfig>,
    #[serde(default)]
    pub days: BTreeMap<Weekday, bool>,
    #[serde(default)]
    pub starts: BTreeMap<u8, StartConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    pub activated: bool,
    /// Minutes.
    pub time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConfig {
    pub activated: bool,
    #[serde(alias = "time")]
    pub hour: TimeOfDay,
}

impl ProgramConfig {
    /// Every (day, start) pair with both flags on: the cross product of
    /// activated days and activated start times.
    pub fn triggers(&self) -> Vec<(Weekday, TimeOfDay)> {
        let days = self.days.iter().filter(|(_, on)| **on).map(|(d, _)| *d);
        let starts: Vec<TimeOfDay> = self
            .starts
            .values()
            .filter(|s| s.activated)
            .map(|s| s.hour)
            .collect();
        days.flat_map(|d| starts.iter().map(move |t| (d, *t)))
            .collect()
    }

    /// Activated circuits with their minutes, in document order.
    pub fn active_circuits(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.circuits
            .iter()
            .filter(|(_, c)| c.activated)
            .map(|(id, c)| (*id, c.time))
    }
}

impl WateringConfig {
    pub fn program(&self, program_id: u8) -> Option<&ProgramConfig> {
        self.programs.get(&program_id)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str, limits: &WateringSettings) -> RigResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RigError::Schema(e.to_string()))?;
        config.validate(limits)?;
        Ok(config)
    }

    /// Check id ranges. Reports every violation, not just the first.
    pub fn validate(&self, limits: &WateringSettings) -> RigResult<()> {
        let mut errors: Vec<String> = Vec::new();

        for (program_id, program) in &self.programs {
            if !(1..=limits.programs).contains(program_id) {
                errors.push(format!(
                    "program {program_id}: id out of range [1, {}]",
                    limits.programs
                ));
            }
            for (circuit_id, _) in program.circuits.iter() {
                if !(1..=limits.circuits).contains(circuit_id) {
                    errors.push(format!(
                        "program {program_id}: circuit {circuit_id} out of range [1, {}]",
                        limits.circuits
                    ));
                }
            }
            for slot in program.starts.keys() {
                if !(1..=START_SLOTS).contains(slot) {
                    errors.push(format!(
                        "program {program_id}: start slot {slot} out of range [1, {START_SLOTS}]"
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RigError::Schema(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub trait ConfigStore: Send + Sync {
    fn load(&self) -> RigResult<WateringConfig>;
    fn save(&self, config: &WateringConfig) -> RigResult<()>;
}

/// `watering_config.json` inside the config directory.
pub struct JsonFileStore {
    path: PathBuf,
    limits: WateringSettings,
    /// Held across the temp-file write and the rename.
    writing: Mutex<()>,
}

pub const CONFIG_FILE_NAME: &str = "watering_config.json";

impl JsonFileStore {
    pub fn new(config_dir: impl AsRef<Path>, limits: WateringSettings) -> Self {
        Self {
            path: config_dir.as_ref().join(CONFIG_FILE_NAME),
            limits,
            writing: Mutex::new(()),
        }
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> RigResult<WateringConfig> {
        tracing::info!(path = %self.path.display(), "reading watering config");
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "no watering config yet");
                return Ok(WateringConfig::default());
            }
            Err(e) => return Err(RigError::Schema(format!("{}: {e}", self.path.display()))),
        };
        WateringConfig::from_json(&json, &self.limits)
    }

    fn save(&self, config: &WateringConfig) -> RigResult<()> {
        config.validate(&self.limits)?;
        tracing::info!(path = %self.path.display(), "saving watering config");

        let persist = |e: std::io::Error| RigError::Persistence(format!("{}: {e}", self.path.display()));
        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| RigError::Persistence(e.to_string()))?;

        let _writing = self.writing.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(persist)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(persist)?;
        std::fs::rename(&tmp, &self.path).map_err(persist)?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
