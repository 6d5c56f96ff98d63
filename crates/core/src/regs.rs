//! Named views over data-memory bytes.
//!
//! A [`BitField`] is a fixed byte offset plus a bit range. It never holds a
//! value of its own: `get`/`set` shift and mask the byte in data memory, so
//! the named view and the raw array cannot diverge.

/// One bit or bit group inside a data-memory byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub addr: u16,
    pub shift: u8,
    pub width: u8,
}

impl BitField {
    pub const fn new(addr: u16, shift: u8, width: u8) -> Self {
        BitField { addr, shift, width }
    }

    /// Single-bit field.
    pub const fn bit(addr: u16, shift: u8) -> Self {
        BitField { addr, shift, width: 1 }
    }

    /// Mask of the field in its byte.
    #[inline(always)]
    pub fn mask(self) -> u8 {
        (((1u16 << self.width) - 1) << self.shift) as u8
    }

    #[inline(always)]
    pub fn get(self, data: &[u8]) -> u8 {
        (data[self.addr as usize] & self.mask()) >> self.shift
    }

    #[inline(always)]
    pub fn set(self, data: &mut [u8], v: u8) {
        let b = &mut data[self.addr as usize];
        *b = (*b & !self.mask()) | ((v << self.shift) & self.mask());
    }

    #[inline(always)]
    pub fn is_set(self, data: &[u8]) -> bool {
        self.get(data) != 0
    }
}

// Watchdog control bits (WDTCSR / WDTCR)
pub const WDIF: u8 = 7;
pub const WDIE: u8 = 6;
pub const WDP3: u8 = 5;
pub const WDCE: u8 = 4;
pub const WDE: u8 = 3;

// MCUSR reset flags
pub const PORF: u8 = 0;
pub const WDRF: u8 = 3;

// SPMCSR bits
pub const SPMEN: u8 = 0;
pub const PGERS: u8 = 1;
pub const PGWRT: u8 = 2;
pub const BLBSET: u8 = 3;
pub const RWWSRE: u8 = 4;
pub const SIGRD: u8 = 5;
pub const RWWSB: u8 = 6;
