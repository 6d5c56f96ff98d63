//! External interrupt lines INTn.
//!
//! Each line samples its pin once per cycle. The sense control bits pick
//! low level, any edge, falling edge or rising edge. Edge modes latch a
//! flag (cleared by writing a 1 or on vector entry); low level drives the
//! request directly for as long as the pin stays low.

use std::any::Any;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::dispatch::{Attach, IoContext, Peripheral};
use crate::error::{DispatchError, SaveStateError};
use crate::variant::ExtIntAddrs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sense {
    Low,
    Change,
    Falling,
    Rising,
}

impl Sense {
    fn from_isc(v: u8) -> Self {
        match v & 3 {
            0 => Sense::Low,
            1 => Sense::Change,
            2 => Sense::Falling,
            _ => Sense::Rising,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExtIntState {
    /// Pin level per line at the previous sample
    last: Vec<bool>,
    /// Flag register bits owned by the lines
    flags: u8,
}

pub struct ExtInt {
    addrs: ExtIntAddrs,
    st: ExtIntState,
}

impl ExtInt {
    pub fn new(addrs: ExtIntAddrs) -> Self {
        let last = vec![true; addrs.lines.len()];
        ExtInt { addrs, st: ExtIntState { last, flags: 0 } }
    }

    fn update_irq(&self, io: &mut IoContext<'_>) {
        let mask = io.get(self.addrs.mask);
        for line in self.addrs.lines {
            let bit = 1u8 << line.bit;
            let level_low = Sense::from_isc(line.isc.get(io.data())) == Sense::Low && !line.pin.is_set(io.data());
            let active = mask & bit != 0 && (self.st.flags & bit != 0 || level_low);
            io.set_candidate(line.vector, active);
        }
    }
}

impl Peripheral for ExtInt {
    fn name(&self) -> &'static str {
        "extint"
    }

    fn claimed(&self) -> RangeInclusive<u16> {
        super::span(
            [self.addrs.mask, self.addrs.flags]
                .into_iter()
                .chain(self.addrs.lines.iter().map(|l| l.isc.addr)),
        )
    }

    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
        bus.writer(self.addrs.flags)?;
        bus.clock()?;
        for line in self.addrs.lines {
            bus.acknowledge(line.vector)?;
        }
        Ok(())
    }

    fn reset(&mut self, io: &mut IoContext<'_>) {
        self.st.flags = 0;
        for (last, line) in self.st.last.iter_mut().zip(self.addrs.lines) {
            *last = line.pin.is_set(io.data());
        }
        io.set(self.addrs.flags, 0);
        self.update_irq(io);
    }

    fn write(&mut self, _addr: u16, value: u8, io: &mut IoContext<'_>) {
        self.st.flags &= !value;
        io.set(self.addrs.flags, self.st.flags);
        self.update_irq(io);
    }

    fn clock(&mut self, io: &mut IoContext<'_>) {
        for (last, line) in self.st.last.iter_mut().zip(self.addrs.lines) {
            let level = line.pin.is_set(io.data());
            let edge = match Sense::from_isc(line.isc.get(io.data())) {
                Sense::Low => false,
                Sense::Change => level != *last,
                Sense::Falling => *last && !level,
                Sense::Rising => !*last && level,
            };
            if edge {
                self.st.flags |= 1 << line.bit;
            }
            *last = level;
        }
        io.set(self.addrs.flags, self.st.flags);
        self.update_irq(io);
    }

    fn acknowledge(&mut self, vector: u8, io: &mut IoContext<'_>) {
        if let Some(line) = self.addrs.lines.iter().find(|l| l.vector == vector) {
            self.st.flags &= !(1 << line.bit);
            io.set(self.addrs.flags, self.st.flags);
        }
        self.update_irq(io);
    }

    fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        super::encode(&self.st)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SaveStateError> {
        let st: ExtIntState = super::decode(state)?;
        if st.last.len() != self.addrs.lines.len() {
            return Err(SaveStateError::Layout("external interrupt line count".into()));
        }
        self.st = st;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::{Avr, MachineConfig, StepOutcome, SREG_ADDR, SREG_I};

    const EICRA: u16 = 0x69;
    const EIMSK: u16 = 0x3D;
    const EIFR: u16 = 0x3C;

    fn avr() -> Avr {
        let mut a = Avr::new(&MachineConfig::new("atmega328p")).unwrap().with_standard_peripherals().unwrap();
        a.mem.flash.fill(0x0000);
        a
    }

    fn nop(a: &mut Avr) -> StepOutcome {
        a.step().unwrap()
    }

    #[test]
    fn test_falling_edge_latches_flag() {
        let mut a = avr();
        a.write_data(EICRA, 0b10); // INT0 falling
        a.drive_pin('D', 2, Some(true));
        nop(&mut a);
        assert_eq!(a.mem.data[EIFR as usize], 0);
        a.drive_pin('D', 2, Some(false));
        nop(&mut a);
        assert_eq!(a.mem.data[EIFR as usize], 0x01);
        // Rising edge does not set it again once cleared
        a.write_data(EIFR, 0x01);
        a.drive_pin('D', 2, Some(true));
        nop(&mut a);
        assert_eq!(a.mem.data[EIFR as usize], 0);
    }

    #[test]
    fn test_any_change_on_int1() {
        let mut a = avr();
        a.write_data(EICRA, 0b0100); // INT1 any change
        a.drive_pin('D', 3, Some(true));
        nop(&mut a);
        assert_eq!(a.mem.data[EIFR as usize], 0x02);
    }

    #[test]
    fn test_edge_interrupt_clears_flag_on_entry() {
        let mut a = avr();
        a.mem.data[SREG_ADDR as usize] |= 1 << SREG_I;
        a.write_data(EICRA, 0b11); // rising
        a.write_data(EIMSK, 0x01);
        a.drive_pin('D', 2, Some(true));
        nop(&mut a);
        assert!(matches!(nop(&mut a), StepOutcome::Interrupt(1)));
        assert_eq!(a.mem.data[EIFR as usize], 0);
        assert!(!a.irq.is_pending(1));
    }

    #[test]
    fn test_low_level_holds_request() {
        let mut a = avr();
        a.write_data(EIMSK, 0x01); // ISC 00: low level
        a.drive_pin('D', 2, Some(false));
        nop(&mut a);
        assert!(a.irq.is_pending(1));
        // No flag for level sense
        assert_eq!(a.mem.data[EIFR as usize], 0);
        a.drive_pin('D', 2, Some(true));
        nop(&mut a);
        assert!(!a.irq.is_pending(1));
    }
}
