//! Watering circuits and the address bus they share.
//!
//! A circuit is selected by writing `id - 1` in binary onto four address
//! lines (MSB first) and raising the shared any-active line. Writes take
//! `&mut AddressBus`, so only the holder of the bus can address a circuit.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{RigError, RigResult};
use crate::line::SharedLine;

// ---------------------------------------------------------------------------
// Circuit id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CircuitId(u8);

impl CircuitId {
    pub fn new(id: i64, n_circuits: u8) -> RigResult<Self> {
        if (1..=i64::from(n_circuits)).contains(&id) {
            Ok(Self(id as u8))
        } else {
            Err(RigError::InvalidCircuitId {
                id,
                max: n_circuits,
            })
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Address line levels, most significant bit first.
    pub fn address(self) -> [bool; 4] {
        let code = self.0 - 1;
        [
            code & 0b1000 != 0,
            code & 0b0100 != 0,
            code & 0b0010 != 0,
            code & 0b0001 != 0,
        ]
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Address bus
// ---------------------------------------------------------------------------

/// Read-only view of the any-active line for the supply valve governor.
#[derive(Clone, Default)]
pub struct WateringFlag(Arc<AtomicBool>);

impl WateringFlag {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct AddressBus {
    address: [SharedLine; 4],
    any_active: SharedLine,
    watering: WateringFlag,
}

impl AddressBus {
    pub fn new(address: [SharedLine; 4], any_active: SharedLine) -> Self {
        Self {
            address,
            any_active,
            watering: WateringFlag::default(),
        }
    }

    pub fn watering_flag(&self) -> WateringFlag {
        self.watering.clone()
    }

    fn drive(&mut self, pattern: [bool; 4], any: bool) {
        for (bit, (line, high)) in self.address.iter().zip(pattern).enumerate() {
            line.set(high);
            tracing::debug!(bit, high, "address line written");
        }
        self.any_active.set(any);
        tracing::debug!(high = any, "any-active line written");
        self.watering.0.store(any, Ordering::SeqCst);
    }

    /// Drive every line LOW regardless of which circuit is active.
    pub fn sweep(&mut self) {
        tracing::info!("deactivating all circuit lines");
        self.drive([false; 4], false);
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper {
            address: self.address.clone(),
            any_active: self.any_active.clone(),
            watering: self.watering.clone(),
        }
    }
}

/// Last-resort handle that can only drive the bus LOW, for shutdown when
/// the bus itself cannot be acquired in time.
#[derive(Clone)]
pub struct Sweeper {
    address: [SharedLine; 4],
    any_active: SharedLine,
    watering: WateringFlag,
}

impl Sweeper {
    pub fn sweep(&self) {
        tracing::warn!("forcing all circuit lines low");
        for line in &self.address {
            line.set(false);
        }
        self.any_active.set(false);
        self.watering.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Circuit
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Circuit {
    id: CircuitId,
    activated: bool,
}

impl Circuit {
    pub fn new(id: i64, n_circuits: u8) -> RigResult<Self> {
        Ok(Self::from_id(CircuitId::new(id, n_circuits)?))
    }

    pub fn from_id(id: CircuitId) -> Self {
        Self {
            id,
            activated: false,
        }
    }

    #[cfg(test)]
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn activate(&mut self, bus: &mut AddressBus) {
        bus.drive(self.id.address(), true);
        self.activated = true;
        tracing::info!(circuit = self.id.get(), "circuit activated");
    }

    /// Drives all five lines LOW. Safe to call repeatedly.
    pub fn deactivate(&mut self, bus: &mut AddressBus) {
        bus.drive([false; 4], false);
        if self.activated {
            tracing::info!(circuit = self.id.get(), "circuit deactivated");
        } else {
            tracing::debug!(circuit = self.id.get(), "circuit already off, lines driven low");
        }
        self.activated = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::line::Line;
    use std::sync::Mutex;

    /// Line that records every write.
    #[derive(Default)]
    pub(crate) struct RecordingLine {
        pub(crate) writes: Mutex<Vec<bool>>,
    }

    impl Line for RecordingLine {
        fn set(&self, high: bool) {
            self.writes.lock().unwrap().push(high);
        }

        fn read(&self) -> bool {
            self.writes.lock().unwrap().last().copied().unwrap_or(false)
        }
    }

    pub(crate) struct TestBus {
        pub(crate) address: [Arc<RecordingLine>; 4],
        pub(crate) any: Arc<RecordingLine>,
    }

    impl TestBus {
        pub(crate) fn new() -> (Self, AddressBus) {
            let address: [Arc<RecordingLine>; 4] = Default::default();
            let any = Arc::new(RecordingLine::default());
            let bus = AddressBus::new(
                [
                    address[0].clone() as SharedLine,
                    address[1].clone() as SharedLine,
                    address[2].clone() as SharedLine,
                    address[3].clone() as SharedLine,
                ],
                any.clone() as SharedLine,
            );
            (Self { address, any }, bus)
        }

        pub(crate) fn levels(&self) -> [bool; 5] {
            [
                self.address[0].read(),
                self.address[1].read(),
                self.address[2].read(),
                self.address[3].read(),
                self.any.read(),
            ]
        }
    }

    #[test]
    fn circuit_id_range() {
        assert!(CircuitId::new(1, 12).is_ok());
        assert!(CircuitId::new(12, 12).is_ok());
        assert_eq!(
            CircuitId::new(0, 12),
            Err(RigError::InvalidCircuitId { id: 0, max: 12 })
        );
        assert_eq!(
            CircuitId::new(13, 12),
            Err(RigError::InvalidCircuitId { id: 13, max: 12 })
        );
        assert!(CircuitId::new(-3, 12).is_err());
    }

    #[test]
    fn address_is_id_minus_one_msb_first() {
        assert_eq!(CircuitId(1).address(), [false, false, false, false]);
        assert_eq!(CircuitId(2).address(), [false, false, false, true]);
        assert_eq!(CircuitId(3).address(), [false, false, true, false]);
        assert_eq!(CircuitId(9).address(), [true, false, false, false]);
        assert_eq!(CircuitId(16).address(), [true, true, true, true]);
    }

    #[test]
    fn activate_sets_pattern_for_every_circuit() {
        for id in 1..=16u8 {
            let (lines, mut bus) = TestBus::new();
            let mut circuit = Circuit::new(i64::from(id), 16).unwrap();
            circuit.activate(&mut bus);

            let code = id - 1;
            let expected = [
                (code >> 3) & 1 == 1,
                (code >> 2) & 1 == 1,
                (code >> 1) & 1 == 1,
                code & 1 == 1,
                true,
            ];
            assert_eq!(lines.levels(), expected, "circuit {id}");
            assert!(circuit.is_activated());
            assert!(bus.watering_flag().is_active());

            circuit.deactivate(&mut bus);
            assert_eq!(lines.levels(), [false; 5], "circuit {id}");
            assert!(!circuit.is_activated());
            assert!(!bus.watering_flag().is_active());
        }
    }

    #[test]
    fn deactivate_is_idempotent_but_still_writes() {
        let (lines, mut bus) = TestBus::new();
        let mut circuit = Circuit::new(5, 12).unwrap();
        circuit.deactivate(&mut bus);
        circuit.deactivate(&mut bus);

        assert!(!circuit.is_activated());
        for line in lines.address.iter().chain(std::iter::once(&lines.any)) {
            assert_eq!(*line.writes.lock().unwrap(), vec![false, false]);
        }
    }

    #[test]
    fn sweep_drives_everything_low() {
        let (lines, mut bus) = TestBus::new();
        Circuit::new(12, 12).unwrap().activate(&mut bus);
        bus.sweep();
        assert_eq!(lines.levels(), [false; 5]);
    }

    #[test]
    fn sweeper_works_without_the_bus() {
        let (lines, mut bus) = TestBus::new();
        let sweeper = bus.sweeper();
        Circuit::new(11, 12).unwrap().activate(&mut bus);
        let flag = bus.watering_flag();

        sweeper.sweep();
        assert_eq!(lines.levels(), [false; 5]);
        assert!(!flag.is_active());
    }
}
