//! AVR address spaces.
//!
//! Three physically separate memories:
//!
//! | Region  | Unit       | Content                                      |
//! |---------|------------|----------------------------------------------|
//! | Flash   | 16-bit word| Program memory, word-addressed by the PC     |
//! | Data    | byte       | R0–R31, I/O, extended I/O, then SRAM         |
//! | EEPROM  | byte       | Non-volatile data                            |
//!
//! Debugger front ends use a single 24-bit address space where each region
//! sits in its own band (see [`Region::classify`]).

use std::fmt;

use crate::error::AccessError;

/// Start of the data-memory band in the unified debugger address space.
pub const DATA_BASE: u32 = 0x80_0000;
/// Start of the EEPROM band in the unified debugger address space.
pub const EEPROM_BASE: u32 = 0x81_0000;

/// Which memory an address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Flash,
    Data,
    Eeprom,
}

impl Region {
    /// Split a unified address into region and offset within the region.
    pub fn classify(addr: u32) -> (Region, u32) {
        if addr >= EEPROM_BASE {
            (Region::Eeprom, addr - EEPROM_BASE)
        } else if addr >= DATA_BASE {
            (Region::Data, addr - DATA_BASE)
        } else {
            (Region::Flash, addr)
        }
    }

    /// Base of this region's band in the unified address space.
    pub fn base(self) -> u32 {
        match self {
            Region::Flash => 0,
            Region::Data => DATA_BASE,
            Region::Eeprom => EEPROM_BASE,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Flash => "flash",
            Region::Data => "data",
            Region::Eeprom => "eeprom",
        })
    }
}

/// Backing store for all three memories.
///
/// `data` is the only copy of the register file, SREG and the stack
/// pointer; every named view reads and writes these bytes.
pub struct Memory {
    /// Data space: registers + I/O + SRAM
    pub data: Vec<u8>,
    /// Program memory in words
    pub flash: Vec<u16>,
    pub eeprom: Vec<u8>,
}

impl Memory {
    /// Erased flash and EEPROM read as all ones.
    pub fn new(flash_bytes: usize, data_size: usize, eeprom_bytes: usize) -> Self {
        Memory {
            data: vec![0u8; data_size],
            flash: vec![0xFFFFu16; flash_bytes / 2],
            eeprom: vec![0xFFu8; eeprom_bytes],
        }
    }

    // --- Register access ---

    #[inline(always)]
    pub fn reg(&self, r: u8) -> u8 {
        self.data[r as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, r: u8, v: u8) {
        self.data[r as usize] = v;
    }

    /// Read a 16-bit pair starting at register `r` (low byte first).
    #[inline(always)]
    pub fn reg_word(&self, r: u8) -> u16 {
        self.data[r as usize] as u16 | ((self.data[r as usize + 1] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_reg_word(&mut self, r: u8, v: u16) {
        self.data[r as usize] = v as u8;
        self.data[r as usize + 1] = (v >> 8) as u8;
    }

    /// X pointer (R27:R26)
    #[inline(always)]
    pub fn x(&self) -> u16 {
        self.reg_word(26)
    }

    /// Y pointer (R29:R28)
    #[inline(always)]
    pub fn y(&self) -> u16 {
        self.reg_word(28)
    }

    /// Z pointer (R31:R30)
    #[inline(always)]
    pub fn z(&self) -> u16 {
        self.reg_word(30)
    }

    #[inline(always)]
    pub fn set_x(&mut self, v: u16) {
        self.set_reg_word(26, v);
    }

    #[inline(always)]
    pub fn set_y(&mut self, v: u16) {
        self.set_reg_word(28, v);
    }

    #[inline(always)]
    pub fn set_z(&mut self, v: u16) {
        self.set_reg_word(30, v);
    }

    // --- Program memory ---

    /// Word at `word_addr`, or `None` past the end of flash.
    #[inline(always)]
    pub fn program_word(&self, word_addr: usize) -> Option<u16> {
        self.flash.get(word_addr).copied()
    }

    pub fn read_program_word(&self, word_addr: usize) -> Result<u16, AccessError> {
        self.program_word(word_addr)
            .ok_or_else(|| self.out_of_range(Region::Flash, word_addr as u32 * 2, 2))
    }

    pub fn write_program_word(&mut self, word_addr: usize, v: u16) -> Result<(), AccessError> {
        let err = self.out_of_range(Region::Flash, word_addr as u32 * 2, 2);
        let slot = self.flash.get_mut(word_addr).ok_or(err)?;
        *slot = v;
        Ok(())
    }

    /// Byte view of flash for LPM. Addresses wrap at the flash size.
    #[inline(always)]
    pub fn read_flash_byte(&self, byte_addr: u32) -> u8 {
        if self.flash.is_empty() {
            return 0xFF;
        }
        let a = byte_addr as usize % (self.flash.len() * 2);
        let w = self.flash[a / 2];
        if a & 1 == 0 { w as u8 } else { (w >> 8) as u8 }
    }

    fn write_flash_byte(&mut self, byte_addr: usize, v: u8) {
        let w = &mut self.flash[byte_addr / 2];
        if byte_addr & 1 == 0 {
            *w = (*w & 0xFF00) | v as u16;
        } else {
            *w = (*w & 0x00FF) | ((v as u16) << 8);
        }
    }

    // --- Data space ---

    #[inline(always)]
    pub fn read_raw(&self, addr: u16) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn write_raw(&mut self, addr: u16, v: u8) {
        if let Some(b) = self.data.get_mut(addr as usize) {
            *b = v;
        }
    }

    // --- Bulk access by region ---

    /// Size of a region in bytes.
    pub fn region_len(&self, region: Region) -> usize {
        match region {
            Region::Flash => self.flash.len() * 2,
            Region::Data => self.data.len(),
            Region::Eeprom => self.eeprom.len(),
        }
    }

    fn out_of_range(&self, region: Region, addr: u32, len: usize) -> AccessError {
        AccessError::OutOfRange { region, addr, len, size: self.region_len(region) }
    }

    fn check(&self, region: Region, addr: u32, len: usize) -> Result<usize, AccessError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.region_len(region) => Ok(start),
            _ => Err(self.out_of_range(region, addr, len)),
        }
    }

    /// Raw bytes from a region; no peripheral side effects.
    pub fn read_region(&self, region: Region, addr: u32, len: usize) -> Result<Vec<u8>, AccessError> {
        let start = self.check(region, addr, len)?;
        Ok(match region {
            Region::Flash => (start..start + len).map(|a| self.read_flash_byte(a as u32)).collect(),
            Region::Data => self.data[start..start + len].to_vec(),
            Region::Eeprom => self.eeprom[start..start + len].to_vec(),
        })
    }

    /// Raw store into a region; no peripheral side effects.
    pub fn write_region(&mut self, region: Region, addr: u32, bytes: &[u8]) -> Result<(), AccessError> {
        let start = self.check(region, addr, bytes.len())?;
        match region {
            Region::Flash => {
                for (i, &b) in bytes.iter().enumerate() {
                    self.write_flash_byte(start + i, b);
                }
            }
            Region::Data => self.data[start..start + bytes.len()].copy_from_slice(bytes),
            Region::Eeprom => self.eeprom[start..start + bytes.len()].copy_from_slice(bytes),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_pair() {
        let mut mem = Memory::new(1024, 0x160, 64);
        mem.set_z(0x1234);
        assert_eq!(mem.z(), 0x1234);
        assert_eq!(mem.data[30], 0x34);
        assert_eq!(mem.data[31], 0x12);
    }

    #[test]
    fn test_named_and_raw_views_alias() {
        let mut mem = Memory::new(1024, 0x160, 64);
        mem.set_reg(5, 0xAB);
        assert_eq!(mem.data[5], 0xAB);
        mem.data[6] = 0xCD;
        assert_eq!(mem.reg(6), 0xCD);
        mem.write_raw(26, 0x10);
        assert_eq!(mem.x(), 0x0010);
    }

    #[test]
    fn test_program_word_bounds() {
        let mut mem = Memory::new(1024, 0x160, 64);
        mem.write_program_word(0, 0x940C).unwrap();
        assert_eq!(mem.read_program_word(0), Ok(0x940C));
        assert_eq!(mem.read_flash_byte(0), 0x0C);
        assert_eq!(mem.read_flash_byte(1), 0x94);
        assert!(mem.read_program_word(512).is_err());
        assert!(mem.write_program_word(512, 0).is_err());
    }

    #[test]
    fn test_region_bytes() {
        let mut mem = Memory::new(1024, 0x160, 64);
        mem.write_region(Region::Flash, 3, &[0x11, 0x22]).unwrap();
        assert_eq!(mem.flash[1], 0x11FF);
        assert_eq!(mem.flash[2], 0xFF22);
        assert_eq!(mem.read_region(Region::Flash, 3, 2).unwrap(), vec![0x11, 0x22]);
        assert!(mem.read_region(Region::Eeprom, 60, 8).is_err());
        assert!(mem.write_region(Region::Data, 0x15F, &[1, 2]).is_err());
    }

    #[test]
    fn test_classify_bands() {
        assert_eq!(Region::classify(0x0100), (Region::Flash, 0x100));
        assert_eq!(Region::classify(0x80_0060), (Region::Data, 0x60));
        assert_eq!(Region::classify(0x81_0002), (Region::Eeprom, 2));
    }
}
