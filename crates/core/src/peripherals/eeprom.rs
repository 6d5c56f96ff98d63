//! EEPROM controller (EECR / EEDR / EEAR).
//!
//! Setting EEMPE opens a four-cycle window in which setting EEPE starts a
//! programming operation. The cell is updated at once; EEPE stays set
//! until the programming time has passed. Reads via EERE stall the CPU
//! four cycles, a write start stalls it two. The EE_READY request is a
//! level condition: enabled and not busy.

use std::any::Any;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::dispatch::{Attach, IoContext, Peripheral};
use crate::error::{DispatchError, SaveStateError};
use crate::variant::EepromAddrs;

const EERE: u8 = 1 << 0;
const EEPE: u8 = 1 << 1;
const EEMPE: u8 = 1 << 2;
const EERIE: u8 = 1 << 3;
const EEPM_SHIFT: u8 = 4;

const MPE_WINDOW: u32 = 4;
const READ_STALL: u32 = 4;
const WRITE_STALL: u32 = 2;

/// Programming time in microseconds per EEPM mode: erase+write, erase, write.
const PROGRAM_US: [u64; 3] = [3400, 1800, 1800];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EepromState {
    /// Cycles left in the master write enable window
    mpe_remaining: u32,
    /// Cycles until the running write completes
    busy_remaining: u64,
    writes: u64,
}

pub struct EepromCtrl {
    addrs: EepromAddrs,
    st: EepromState,
}

impl EepromCtrl {
    pub fn new(addrs: EepromAddrs) -> Self {
        EepromCtrl { addrs, st: EepromState::default() }
    }

    pub fn is_busy(&self) -> bool {
        self.st.busy_remaining > 0
    }

    /// Write operations started since reset.
    pub fn writes(&self) -> u64 {
        self.st.writes
    }

    fn address(&self, io: &IoContext<'_>) -> Option<usize> {
        let len = io.eeprom().len();
        if len == 0 {
            return None;
        }
        let hi = self.addrs.eearh.map_or(0, |a| io.get(a));
        Some(u16::from_le_bytes([io.get(self.addrs.eearl), hi]) as usize % len)
    }

    fn program(&mut self, control: u8, io: &mut IoContext<'_>) {
        let Some(addr) = self.address(io) else { return };
        let data = io.get(self.addrs.eedr);
        let mode = ((control >> EEPM_SHIFT) & 3).min(2) as usize;
        let cell = &mut io.eeprom_mut()[addr];
        *cell = match mode {
            0 => data,
            1 => 0xFF,
            _ => *cell & data,
        };
        log::trace!("eeprom[0x{:03X}] = 0x{:02X}", addr, *cell);
        self.st.busy_remaining = (io.clock_hz() as u64 * PROGRAM_US[mode] / 1_000_000).max(1);
        self.st.writes += 1;
        io.stall(WRITE_STALL);
    }

    fn update_irq(&self, io: &mut IoContext<'_>) {
        let control = io.get(self.addrs.eecr);
        io.set_candidate(self.addrs.ready_vector, control & EERIE != 0 && !self.is_busy());
    }
}

impl Peripheral for EepromCtrl {
    fn name(&self) -> &'static str {
        "eeprom"
    }

    fn claimed(&self) -> RangeInclusive<u16> {
        let a = &self.addrs;
        super::span([a.eecr, a.eedr, a.eearl].into_iter().chain(a.eearh))
    }

    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
        bus.writer(self.addrs.eecr)?;
        bus.clock()
    }

    fn reset(&mut self, io: &mut IoContext<'_>) {
        self.st = EepromState::default();
        io.set(self.addrs.eecr, 0);
        io.set(self.addrs.eedr, 0);
        self.update_irq(io);
    }

    fn write(&mut self, _addr: u16, value: u8, io: &mut IoContext<'_>) {
        let mut control = value;

        if value & EEMPE != 0 && value & EEPE == 0 {
            self.st.mpe_remaining = MPE_WINDOW;
        }

        if value & EEPE != 0 {
            if self.st.mpe_remaining > 0 && !self.is_busy() {
                self.program(value, io);
            } else if !self.is_busy() {
                control &= !EEPE;
            }
        } else if self.is_busy() {
            control |= EEPE;
        }

        if value & EERE != 0 {
            if !self.is_busy() {
                if let Some(addr) = self.address(io) {
                    let v = io.eeprom()[addr];
                    io.set(self.addrs.eedr, v);
                }
                io.stall(READ_STALL);
            }
            control &= !EERE;
        }

        io.set(self.addrs.eecr, control);
        self.update_irq(io);
    }

    fn clock(&mut self, io: &mut IoContext<'_>) {
        if self.st.mpe_remaining > 0 {
            self.st.mpe_remaining -= 1;
            if self.st.mpe_remaining == 0 {
                let c = io.get(self.addrs.eecr);
                io.set(self.addrs.eecr, c & !EEMPE);
            }
        }
        if self.st.busy_remaining > 0 {
            self.st.busy_remaining -= 1;
            if self.st.busy_remaining == 0 {
                let c = io.get(self.addrs.eecr);
                io.set(self.addrs.eecr, c & !EEPE);
            }
        }
        self.update_irq(io);
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
