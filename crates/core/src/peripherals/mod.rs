//! Stock peripheral plugins.
//!
//! Each model in the variant table describes where its peripherals live;
//! [`standard`] builds one plugin per described block:
//!
//! - [`Gpio`] — One I/O port (PINx / DDRx / PORTx) with host-driven inputs
//! - [`Timer8`] — 8-bit Timer/Counter0 (normal, CTC, fast PWM, phase correct)
//! - [`Usart`] — Serial port with baud-rate timing and a host-side queue
//! - [`ExtInt`] — External interrupt lines INTn
//! - [`EepromCtrl`] — EEPROM read/write controller
//!
//! Plugins hold only state that is not visible in data memory; register
//! bytes themselves stay in data memory so the debugger sees them.

mod eeprom;
mod extint;
mod gpio;
mod timer8;
mod usart;

use std::ops::RangeInclusive;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dispatch::Peripheral;
use crate::error::SaveStateError;
use crate::variant::Variant;

pub use eeprom::EepromCtrl;
pub use extint::ExtInt;
pub use gpio::Gpio;
pub use timer8::Timer8;
pub use usart::Usart;

/// One plugin per peripheral block the model describes.
pub fn standard(variant: &'static Variant) -> Vec<Box<dyn Peripheral>> {
    let mut v: Vec<Box<dyn Peripheral>> = Vec::new();
    for port in variant.ports {
        v.push(Box::new(Gpio::new(*port)));
    }
    if let Some(t) = variant.timer0 {
        v.push(Box::new(Timer8::new(t)));
    }
    if let Some(u) = variant.usart {
        v.push(Box::new(Usart::new(u)));
    }
    if let Some(e) = variant.ext_int {
        v.push(Box::new(ExtInt::new(e)));
    }
    if let Some(e) = variant.eeprom {
        v.push(Box::new(EepromCtrl::new(e)));
    }
    v
}

/// Smallest range covering every address in `addrs`.
pub(crate) fn span(addrs: impl IntoIterator<Item = u16>) -> RangeInclusive<u16> {
    let mut lo = u16::MAX;
    let mut hi = 0;
    for a in addrs {
        lo = lo.min(a);
        hi = hi.max(a);
    }
    lo..=hi
}

pub(crate) fn encode<T: Serialize>(state: &T) -> Result<Vec<u8>, SaveStateError> {
    Ok(bincode::serialize(state)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SaveStateError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Cycles per frame for a given baud divisor: start + 8 data + stop bits.
pub(crate) fn frame_cycles(ubrr: u16, double_speed: bool) -> u32 {
    let per_bit = if double_speed { 8 } else { 16 } * (ubrr as u32 + 1);
    per_bit * 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Avr, MachineConfig};

    #[test]
    fn test_standard_set_per_model() {
        let a = Avr::new(&MachineConfig::new("atmega328p")).unwrap().with_standard_peripherals().unwrap();
        assert_eq!(
            a.peripheral_names(),
            vec!["gpio", "gpio", "gpio", "timer0", "usart", "extint", "eeprom"]
        );
        let t = Avr::new(&MachineConfig::new("attiny85")).unwrap().with_standard_peripherals().unwrap();
        assert_eq!(t.peripheral_names(), vec!["gpio", "timer0", "extint", "eeprom"]);
    }

    #[test]
    fn test_every_model_attaches() {
        for v in Variant::all() {
            let a = Avr::new(&MachineConfig::new(v.name)).unwrap();
            assert!(a.with_standard_peripherals().is_ok(), "{}", v.name);
        }
    }

    #[test]
    fn test_span_and_frame() {
        assert_eq!(span([0x44, 0x35, 0x6E]), 0x35..=0x6E);
        // 9600 baud at 16 MHz: UBRR 103
        assert_eq!(frame_cycles(103, false), 16_640);
        assert_eq!(frame_cycles(103, true), 8_320);
    }
}
