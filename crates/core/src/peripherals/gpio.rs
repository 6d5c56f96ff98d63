//! General purpose I/O port.
//!
//! PINx always holds the current pin levels: outputs follow PORTx, inputs
//! follow whatever the host drives, undriven inputs read high with the
//! pull-up (PORTx bit set) and low otherwise. Writing a 1 to a PINx bit
//! toggles the matching PORTx bit.

use std::any::Any;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::dispatch::{Attach, IoContext, Peripheral};
use crate::error::{DispatchError, SaveStateError};
use crate::variant::PortAddrs;
use crate::Avr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PortState {
    /// Pins the host is driving
    driven: u8,
    /// Levels of the driven pins
    levels: u8,
}

pub struct Gpio {
    addrs: PortAddrs,
    st: PortState,
}

impl Gpio {
    pub fn new(addrs: PortAddrs) -> Self {
        Gpio { addrs, st: PortState::default() }
    }

    /// Port letter ('B', 'D', ...).
    pub fn port(&self) -> char {
        self.addrs.name
    }

    fn levels(&self, io: &IoContext<'_>) -> u8 {
        let ddr = io.get(self.addrs.ddr);
        let port = io.get(self.addrs.port);
        let inputs = (self.st.levels & self.st.driven) | (port & !self.st.driven);
        (port & ddr) | (inputs & !ddr)
    }

    fn refresh(&self, io: &mut IoContext<'_>) {
        let v = self.levels(io);
        io.set(self.addrs.pin, v);
    }

    /// Drive pin `bit` from outside (`Some(level)`) or release it.
    pub fn drive(&mut self, bit: u8, level: Option<bool>, io: &mut IoContext<'_>) {
        let mask = 1u8 << (bit & 7);
        match level {
            Some(l) => {
                self.st.driven |= mask;
                if l {
                    self.st.levels |= mask;
                } else {
                    self.st.levels &= !mask;
                }
            }
            None => {
                self.st.driven &= !mask;
                self.st.levels &= !mask;
            }
        }
        self.refresh(io);
    }
}

impl Peripheral for Gpio {
    fn name(&self) -> &'static str {
        "gpio"
    }

    fn claimed(&self) -> RangeInclusive<u16> {
        super::span([self.addrs.pin, self.addrs.ddr, self.addrs.port])
    }

    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
        bus.writer(self.addrs.pin)?;
        bus.writer(self.addrs.ddr)?;
        bus.writer(self.addrs.port)
    }

    fn reset(&mut self, io: &mut IoContext<'_>) {
        io.set(self.addrs.ddr, 0);
        io.set(self.addrs.port, 0);
        self.refresh(io);
    }

    fn write(&mut self, addr: u16, value: u8, io: &mut IoContext<'_>) {
        if addr == self.addrs.pin {
            let port = io.get(self.addrs.port);
            io.set(self.addrs.port, port ^ value);
        }
        self.refresh(io);
    }

    fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        super::encode(&self.st)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SaveStateError> {
        self.st = super::decode(state)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Avr {
    /// Drive (`Some`) or release (`None`) pin `bit` of port `port` from the
    /// host side. Returns false if the model has no such port.
    pub fn drive_pin(&mut self, port: char, bit: u8, level: Option<bool>) -> bool {
        let port = port.to_ascii_uppercase();
        self.with_io(|peripherals, io| {
            for p in peripherals.iter_mut() {
                if let Some(g) = p.as_any_mut().downcast_mut::<Gpio>() {
                    if g.port() == port {
                        g.drive(bit, level, io);
                        return true;
                    }
                }
            }
            false
        })
    }

    /// Current level of a port pin, as the PINx register shows it.
    pub fn pin_level(&self, port: char, bit: u8) -> Option<bool> {
        let port = port.to_ascii_uppercase();
        let p = self.variant.ports.iter().find(|p| p.name == port)?;
        Some(self.mem.read_raw(p.pin) & (1 << (bit & 7)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Avr, MachineConfig};

    fn avr() -> Avr {
        Avr::new(&MachineConfig::new("atmega328p")).unwrap().with_standard_peripherals().unwrap()
    }

    #[test]
    fn test_output_follows_port() {
        let mut a = avr();
        a.write_data(0x24, 0x20); // DDRB5
        a.write_data(0x25, 0x20); // PORTB5
        assert_eq!(a.read_data(0x23), 0x20);
        assert_eq!(a.pin_level('b', 5), Some(true));
    }

    #[test]
    fn test_pin_write_toggles_port() {
        let mut a = avr();
        a.write_data(0x24, 0xFF);
        a.write_data(0x25, 0x0F);
        a.write_data(0x23, 0x03);
        assert_eq!(a.mem.data[0x25], 0x0C);
        assert_eq!(a.mem.data[0x23], 0x0C);
    }

    #[test]
    fn test_driven_inputs_and_pullups() {
        let mut a = avr();
        // PD2 input with pull-up reads high until driven low
        a.write_data(0x2B, 0x04);
        assert_eq!(a.pin_level('D', 2), Some(true));
        assert!(a.drive_pin('D', 2, Some(false)));
        assert_eq!(a.pin_level('D', 2), Some(false));
        a.drive_pin('D', 2, None);
        assert_eq!(a.pin_level('D', 2), Some(true));
        assert!(!a.drive_pin('A', 0, Some(true)));
    }
}
