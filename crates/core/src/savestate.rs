//! Save states.
//!
//! Captures the whole machine to a byte image using bincode serialization
//! with deflate compression.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "AVSS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Variant name     |  u8 length + ASCII
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! The payload holds the engine bookkeeping, the three memories, the
//! pending interrupt mask and the SPM page buffer, followed by one opaque
//! blob per attached peripheral produced by its own `save_state`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cpu::Cpu;
use crate::error::SaveStateError;
use crate::Avr;

const MAGIC: &[u8; 4] = b"AVSS";
const FORMAT_VERSION: u32 = 1;
const DEFLATE_LEVEL: u8 = 6;

#[derive(Serialize, Deserialize)]
struct SaveState {
    cpu: Cpu,
    flash: Vec<u16>,
    data: Vec<u8>,
    eeprom: Vec<u8>,
    pending: u64,
    spm_buffer: Vec<u16>,
    /// (plugin name, plugin blob) in attach order
    peripherals: Vec<(String, Vec<u8>)>,
}

impl Avr {
    /// Serialize the machine into a save state image.
    pub fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        let peripherals = self
            .peripherals()
            .iter()
            .map(|p| Ok((p.name().to_string(), p.save_state()?)))
            .collect::<Result<Vec<_>, SaveStateError>>()?;
        let state = SaveState {
            cpu: self.cpu.clone(),
            flash: self.mem.flash.clone(),
            data: self.mem.data.clone(),
            eeprom: self.mem.eeprom.clone(),
            pending: self.irq.pending(),
            spm_buffer: self.spm_buffer.clone(),
            peripherals,
        };
        let payload = bincode::serialize(&state)?;
        let compressed = miniz_oxide::deflate::compress_to_vec(&payload, DEFLATE_LEVEL);

        let name = self.variant.name.as_bytes();
        let mut out = Vec::with_capacity(9 + name.len() + compressed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Restore a save state image taken from a machine with the same
    /// variant, memory layout and peripheral set. Nothing is changed if
    /// the header, the layout or any peripheral blob is rejected.
    pub fn load_state(&mut self, image: &[u8]) -> Result<(), SaveStateError> {
        let body = check_header(image, self.variant.name)?;
        let payload = miniz_oxide::inflate::decompress_to_vec(body).map_err(|_| SaveStateError::Inflate)?;
        let state: SaveState = bincode::deserialize(&payload)?;

        let layout = |what: &str, saved: usize, ours: usize| {
            if saved == ours {
                Ok(())
            } else {
                Err(SaveStateError::Layout(format!("{} is {} here but {} in the save state", what, ours, saved)))
            }
        };
        layout("flash size", state.flash.len() * 2, self.mem.flash.len() * 2)?;
        layout("data space", state.data.len(), self.mem.data.len())?;
        layout("eeprom size", state.eeprom.len(), self.mem.eeprom.len())?;
        layout("SPM page", state.spm_buffer.len(), self.spm_buffer.len())?;
        layout("peripheral count", state.peripherals.len(), self.peripherals().len())?;
        for ((name, _), p) in state.peripherals.iter().zip(self.peripherals()) {
            if name != p.name() {
                return Err(SaveStateError::Layout(format!("peripheral '{}' where '{}' is attached", name, p.name())));
            }
        }

        // Plugins are restored first; on a bad blob the ones already
        // loaded get their previous state back.
        let previous = self
            .peripherals()
            .iter()
            .map(|p| p.save_state())
            .collect::<Result<Vec<_>, SaveStateError>>()?;
        for (i, (_, blob)) in state.peripherals.iter().enumerate() {
            if let Err(e) = self.peripherals_mut()[i].load_state(blob) {
                for (p, old) in self.peripherals_mut()[..i].iter_mut().zip(&previous) {
                    let _ = p.load_state(old);
                }
                return Err(e);
            }
        }
        self.cpu = state.cpu;
        self.mem.flash = state.flash;
        self.mem.data = state.data;
        self.mem.eeprom = state.eeprom;
        self.spm_buffer = state.spm_buffer;
        self.irq.set_pending(state.pending);
        self.irq.evaluate();
        log::info!("state restored at cycle {}", self.cpu.cycles);
        Ok(())
    }

    pub fn save_state_file(&self, path: &Path) -> Result<(), SaveStateError> {
        std::fs::write(path, self.save_state()?)?;
        Ok(())
    }

    pub fn load_state_file(&mut self, path: &Path) -> Result<(), SaveStateError> {
        let image = std::fs::read(path)?;
        self.load_state(&image)
    }
}

/// Validate magic, version and variant; returns the compressed body.
fn check_header<'a>(image: &'a [u8], variant: &str) -> Result<&'a [u8], SaveStateError> {
    if image.len() < 9 || &image[..4] != MAGIC {
        return Err(SaveStateError::BadMagic);
    }
    let version = u32::from_le_bytes([image[4], image[5], image[6], image[7]]);
    if version != FORMAT_VERSION {
        return Err(SaveStateError::Version(version));
    }
    let len = image[8] as usize;
    let name = image.get(9..9 + len).ok_or(SaveStateError::BadMagic)?;
    let name = String::from_utf8_lossy(name);
    if name != variant {
        return Err(SaveStateError::VariantMismatch { expected: variant.to_string(), found: name.into_owned() });
    }
    Ok(&image[9 + len..])
}

/// Default save state path next to a program file: `blink.hex` → `blink.state`.
pub fn state_path(program: &Path) -> PathBuf {
    program.with_extension("state")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MachineConfig, SREG_ADDR};

    fn avr(name: &str) -> Avr {
        let mut a = Avr::new(&MachineConfig::new(name)).unwrap().with_standard_peripherals().unwrap();
        a.mem.flash.fill(0x0000);
        a
    }

    #[test]
    fn test_round_trip_restores_machine() {
        let mut a = avr("atmega328p");
        a.write_data(0x45, 0x01); // timer0 clk/1
        a.write_data(0x100, 0x77);
        a.mem.eeprom[1] = 0x12;
        for _ in 0..50 {
            a.step().unwrap();
        }
        let image = a.save_state().unwrap();
        assert_eq!(&image[..4], b"AVSS");

        let (pc, cycles, tcnt) = (a.cpu.pc, a.cpu.cycles, a.mem.data[0x46]);
        for _ in 0..20 {
            a.step().unwrap();
        }
        a.mem.data[0x100] = 0;
        a.load_state(&image).unwrap();
        assert_eq!(a.cpu.pc, pc);
        assert_eq!(a.cpu.cycles, cycles);
        assert_eq!(a.mem.data[0x46], tcnt);
        assert_eq!(a.mem.data[0x100], 0x77);
        assert_eq!(a.mem.eeprom[1], 0x12);
    }

    #[test]
    fn test_rejects_other_variant() {
        let image = avr("atmega328p").save_state().unwrap();
        let mut b = avr("atmega168");
        assert!(matches!(b.load_state(&image), Err(SaveStateError::VariantMismatch { .. })));
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut a = avr("atmega328p");
        assert!(matches!(a.load_state(b"nope"), Err(SaveStateError::BadMagic)));
        let mut image = a.save_state().unwrap();
        image[4] = 9;
        assert!(matches!(a.load_state(&image), Err(SaveStateError::Version(9))));
    }

    #[test]
    fn test_rejects_different_layout() {
        let image = avr("atmega328p").save_state().unwrap();
        let mut cfg = MachineConfig::new("atmega328p");
        cfg.sram_size = Some(1024);
        let mut b = Avr::new(&cfg).unwrap().with_standard_peripherals().unwrap();
        assert!(matches!(b.load_state(&image), Err(SaveStateError::Layout(_))));
    }

    #[test]
    fn test_identical_states_run_identically() {
        let mut a = avr("atmega328p");
        // LDI r16,1 ; OUT TCCR0B,r16 ; loop: INC r17 ; ADD r18,r17 ; RJMP loop
        a.mem.flash[..5].copy_from_slice(&[0xE001, 0xBD05, 0x9513, 0x0F21, 0xCFFD]);
        a.mem.data[SREG_ADDR as usize] = 0x00;
        for _ in 0..7 {
            a.step().unwrap();
        }
        let image = a.save_state().unwrap();

        let runs: Vec<_> = (0..2)
            .map(|_| {
                let mut b = avr("atmega328p");
                b.load_state(&image).unwrap();
                for _ in 0..500 {
                    b.step().unwrap();
                }
                (b.cpu.pc, b.cpu.cycles, b.sreg(), b.mem.data.clone(), b.mem.eeprom.clone())
            })
            .collect();
        assert_eq!(runs[0], runs[1]);
        assert!(runs[0].1 > a.cpu.cycles);
        assert_ne!(runs[0].3[17], a.mem.data[17]);
    }

    #[test]
    fn test_bad_peripheral_blob_changes_nothing() {
        let mut a = avr("atmega328p");
        a.write_data(0x45, 0x01); // timer0 clk/1
        for _ in 0..30 {
            a.step().unwrap();
        }
        let image = a.save_state().unwrap();

        // Same image with the last plugin blob (eeprom) truncated
        let body = check_header(&image, "atmega328p").unwrap();
        let payload = miniz_oxide::inflate::decompress_to_vec(body).unwrap();
        let mut state: SaveState = bincode::deserialize(&payload).unwrap();
        state.peripherals.last_mut().unwrap().1.clear();
        let mut bad = image[..image.len() - body.len()].to_vec();
        bad.extend(miniz_oxide::deflate::compress_to_vec(&bincode::serialize(&state).unwrap(), DEFLATE_LEVEL));

        for _ in 0..40 {
            a.step().unwrap();
        }
        let before = a.save_state().unwrap();
        assert!(matches!(a.load_state(&bad), Err(SaveStateError::Codec(_))));
        assert_eq!(a.save_state().unwrap(), before);
    }

    #[test]
    fn test_state_path() {
        assert_eq!(state_path(Path::new("out/blink.hex")), PathBuf::from("out/blink.state"));
    }
}
