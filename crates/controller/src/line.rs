//! Physical signal lines. The `gpio` feature gates the real rppal driver;
//! without it, mock lines keep their level in memory and log changes.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
#[cfg(feature = "gpio")]
use std::sync::Mutex;

use crate::settings::Settings;

/// A boolean signal that can be driven and read back.
pub trait Line: Send + Sync {
    fn set(&self, high: bool);
    fn read(&self) -> bool;
}

pub type SharedLine = Arc<dyn Line>;

// ---------------------------------------------------------------------------
// Flow sensor pulse counter
// ---------------------------------------------------------------------------

/// Counts flow sensor edges between governor ticks.
#[derive(Clone, Default)]
pub struct PulseCounter(Arc<AtomicU32>);

impl PulseCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, pulses: u32) {
        self.0.fetch_add(pulses, Ordering::Relaxed);
    }

    /// Return the count since the last call and reset it.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// All lines of the rig
// ---------------------------------------------------------------------------

pub struct RigLines {
    /// Circuit address lines, MSB first.
    pub address: [SharedLine; 4],
    pub any_active: SharedLine,
    pub main_valve: SharedLine,
    pub electricity: SharedLine,
    pub flow_pulses: PulseCounter,
    #[cfg(feature = "gpio")]
    _flow_pin: InputPin,
}

// ---------------------------------------------------------------------------
// Real GPIO lines (requires the gpio feature and Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioOutputLine {
    name: &'static str,
    pin: Mutex<OutputPin>,
    active_low: bool,
    level: AtomicBool,
}

#[cfg(feature = "gpio")]
impl GpioOutputLine {
    fn new(gpio: &Gpio, name: &'static str, pin_num: i64, active_low: bool) -> Result<Self> {
        let mut pin = gpio.get(pin_num as u8)?.into_output();
        // Fail-safe: logical LOW at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(Self {
            name,
            pin: Mutex::new(pin),
            active_low,
            level: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "gpio")]
impl Line for GpioOutputLine {
    fn set(&self, high: bool) {
        let mut pin = match self.pin.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        if high != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        self.level.store(high, Ordering::SeqCst);
        tracing::debug!(line = self.name, gpio = pin.pin(), high, "line set");
    }

    fn read(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

#[cfg(feature = "gpio")]
pub struct GpioInputLine {
    name: &'static str,
    pin: InputPin,
}

#[cfg(feature = "gpio")]
impl Line for GpioInputLine {
    fn set(&self, _high: bool) {
        tracing::warn!(line = self.name, "attempted to drive an input line");
    }

    fn read(&self) -> bool {
        self.pin.is_high()
    }
}

#[cfg(feature = "gpio")]
impl RigLines {
    pub fn open(settings: &Settings) -> Result<Self> {
        let gpio = Gpio::new()?;
        let p = &settings.pins;
        let low = settings.active_low;

        let out = |name: &'static str, pin: i64| -> Result<SharedLine> {
            Ok(Arc::new(GpioOutputLine::new(&gpio, name, pin, low)?))
        };

        let address = [
            out("address0", p.address[0])?,
            out("address1", p.address[1])?,
            out("address2", p.address[2])?,
            out("address3", p.address[3])?,
        ];
        let any_active = out("any_active", p.any_active)?;
        let main_valve = out("main_valve", p.main_valve)?;

        let electricity: SharedLine = Arc::new(GpioInputLine {
            name: "electricity",
            pin: gpio.get(p.electricity as u8)?.into_input_pulldown(),
        });

        let flow_pulses = PulseCounter::default();
        let mut flow_pin = gpio.get(p.flow_sensor as u8)?.into_input_pullup();
        let counter = flow_pulses.clone();
        flow_pin.set_async_interrupt(Trigger::FallingEdge, move |_: Level| counter.record())?;

        tracing::info!(?p, active_low = low, "gpio lines initialised");

        Ok(Self {
            address,
            any_active,
            main_valve,
            electricity,
            flow_pulses,
            _flow_pin: flow_pin,
        })
    }
}

// ---------------------------------------------------------------------------
// Mock lines (no hardware, state changes are logged)
// ---------------------------------------------------------------------------

pub struct MockLine {
    name: String,
    level: AtomicBool,
}

impl MockLine {
    pub fn new(name: impl Into<String>, initial: bool) -> Self {
        Self {
            name: name.into(),
            level: AtomicBool::new(initial),
        }
    }
}

impl Line for MockLine {
    fn set(&self, high: bool) {
        let was = self.level.swap(high, Ordering::SeqCst);
        if was != high {
            tracing::debug!(line = %self.name, high, "[mock-gpio] line changed");
        }
    }

    fn read(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

#[cfg(not(feature = "gpio"))]
impl RigLines {
    pub fn open(settings: &Settings) -> Result<Self> {
        let p = &settings.pins;
        let mock = |name: &str, pin: i64, initial: bool| -> SharedLine {
            tracing::info!("[mock-gpio] registered {name} (gpio {pin}, not wired)");
            Arc::new(MockLine::new(name, initial))
        };

        let lines = Self {
            address: [
                mock("address0", p.address[0], false),
                mock("address1", p.address[1], false),
                mock("address2", p.address[2], false),
                mock("address3", p.address[3], false),
            ],
            any_active: mock("any_active", p.any_active, false),
            main_valve: mock("main_valve", p.main_valve, false),
            // No hardware: pretend mains power is present.
            electricity: mock("electricity", p.electricity, true),
            flow_pulses: PulseCounter::default(),
        };
        tracing::info!("[mock-gpio] rig lines initialised (no hardware)");
        Ok(lines)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
