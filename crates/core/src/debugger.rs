//! Debugging facilities.
//!
//! - **Breakpoints**: program word addresses checked before each step
//! - **Watchpoints**: data addresses checked on every bus read/write
//! - **Debugger contract**: register and memory access, disassembly and
//!   register views used by the console and the GDB server
//!
//! Both registries hold at most one entry per address; insert and delete
//! are idempotent.

use std::fmt::Write as _;

use crate::disasm;
use crate::error::AccessError;
use crate::memory::Region;
use crate::opcodes;
use crate::{Avr, REG_COUNT, SPH_ADDR, SPL_ADDR, SREG_ADDR};

/// Register index of SREG in the debugger numbering.
pub const REG_SREG: u8 = 32;
pub const REG_SPL: u8 = 33;
pub const REG_SPH: u8 = 34;

// ─── Breakpoints ────────────────────────────────────────────────────────────

/// Program-memory breakpoints (word addresses).
#[derive(Debug, Clone, Default)]
pub struct Breakpoints {
    addrs: Vec<u16>,
}

impl Breakpoints {
    /// Returns false if one was already set.
    pub fn insert(&mut self, pc: u16) -> bool {
        if self.is_set(pc) {
            return false;
        }
        self.addrs.push(pc);
        true
    }

    /// Returns false if none was set.
    pub fn remove(&mut self, pc: u16) -> bool {
        let before = self.addrs.len();
        self.addrs.retain(|&a| a != pc);
        self.addrs.len() != before
    }

    #[inline]
    pub fn is_set(&self, pc: u16) -> bool {
        !self.addrs.is_empty() && self.addrs.contains(&pc)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.addrs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
    }
}

// ─── Watchpoints ────────────────────────────────────────────────────────────

/// Watchpoint trigger type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Write,
    Read,
    /// Read or write
    Access,
}

impl WatchKind {
    fn on_write(self) -> bool {
        self != WatchKind::Read
    }

    fn on_read(self) -> bool {
        self != WatchKind::Write
    }
}

/// A data-space watchpoint.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub addr: u16,
    pub kind: WatchKind,
    pub hits: u64,
}

/// Watchpoint trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHit {
    pub addr: u16,
    /// Access that triggered: `Read` or `Write`
    pub kind: WatchKind,
    /// Value before the access
    pub old: u8,
    /// Value after the access (equal to `old` for reads)
    pub new: u8,
    /// Word address of the instruction that made the access
    pub pc: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Watchpoints {
    points: Vec<Watchpoint>,
    hit: Option<WatchHit>,
}

impl Watchpoints {
    /// Set a watchpoint. An existing one at `addr` takes the new kind and
    /// false is returned.
    pub fn insert(&mut self, addr: u16, kind: WatchKind) -> bool {
        if let Some(wp) = self.points.iter_mut().find(|w| w.addr == addr) {
            wp.kind = kind;
            return false;
        }
        self.points.push(Watchpoint { addr, kind, hits: 0 });
        true
    }

    pub fn remove(&mut self, addr: u16) -> bool {
        let before = self.points.len();
        self.points.retain(|w| w.addr != addr);
        self.points.len() != before
    }

    pub fn is_set(&self, addr: u16) -> bool {
        self.points.iter().any(|w| w.addr == addr)
    }

    pub fn get(&self, addr: u16) -> Option<&Watchpoint> {
        self.points.iter().find(|w| w.addr == addr)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watchpoint> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.hit = None;
    }

    fn trigger(&mut self, hit: WatchHit) {
        // The first hit in an instruction is the one reported
        if self.hit.is_none() {
            self.hit = Some(hit);
        }
    }

    /// Called by the data bus after a write has been stored.
    pub fn on_write(&mut self, addr: u16, old: u8, new: u8, pc: u16) {
        let Some(wp) = self.points.iter_mut().find(|w| w.addr == addr && w.kind.on_write()) else {
            return;
        };
        wp.hits += 1;
        self.trigger(WatchHit { addr, kind: WatchKind::Write, old, new, pc });
    }

    /// Called by the data bus after a read has been resolved.
    pub fn on_read(&mut self, addr: u16, value: u8, pc: u16) {
        let Some(wp) = self.points.iter_mut().find(|w| w.addr == addr && w.kind.on_read()) else {
            return;
        };
        wp.hits += 1;
        self.trigger(WatchHit { addr, kind: WatchKind::Read, old: value, new: value, pc });
    }

    /// Take the pending hit, if any.
    pub fn take_hit(&mut self) -> Option<WatchHit> {
        self.hit.take()
    }
}

/// Why [`Avr::run_until_breakpoint`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// PC reached a breakpoint (word address)
    Breakpoint(u16),
    Watchpoint(WatchHit),
    /// A BREAK instruction executed
    BreakInstruction,
    /// The pause flag was raised
    Paused,
    CycleLimit,
}

// ─── Debugger contract ──────────────────────────────────────────────────────

impl Avr {
    /// Register by debugger index: 0–31 general registers, 32 SREG,
    /// 33 SPL, 34 SPH.
    pub fn fetch_register(&self, index: u8) -> Result<u8, AccessError> {
        let addr = Self::register_addr(index)?;
        Ok(self.mem.data[addr as usize])
    }

    pub fn write_register(&mut self, index: u8, value: u8) -> Result<(), AccessError> {
        let addr = Self::register_addr(index)?;
        self.mem.data[addr as usize] = value;
        Ok(())
    }

    fn register_addr(index: u8) -> Result<u16, AccessError> {
        match index {
            i if (i as usize) < REG_COUNT => Ok(i as u16),
            REG_SREG => Ok(SREG_ADDR),
            REG_SPL => Ok(SPL_ADDR),
            REG_SPH => Ok(SPH_ADDR),
            other => Err(AccessError::BadRegister(other)),
        }
    }

    /// Raw, bounds-checked read; peripherals are not notified.
    pub fn read_memory(&self, region: Region, addr: u32, len: usize) -> Result<Vec<u8>, AccessError> {
        self.mem.read_region(region, addr, len)
    }

    /// Raw, bounds-checked write; peripherals are not notified.
    pub fn write_memory(&mut self, region: Region, addr: u32, bytes: &[u8]) -> Result<(), AccessError> {
        self.mem.write_region(region, addr, bytes)
    }

    /// Read through the unified address space (see [`Region::classify`]).
    pub fn read_unified(&self, addr: u32, len: usize) -> Result<Vec<u8>, AccessError> {
        let (region, offset) = Region::classify(addr);
        self.read_memory(region, offset, len)
    }

    pub fn write_unified(&mut self, addr: u32, bytes: &[u8]) -> Result<(), AccessError> {
        let (region, offset) = Region::classify(addr);
        self.write_memory(region, offset, bytes)
    }

    /// Disassemble the instruction at word address `pc`.
    pub fn disassemble_at(&self, pc: u16) -> Result<String, AccessError> {
        let word = self.mem.read_program_word(pc as usize)?;
        let next = self.mem.program_word(pc as usize + 1).unwrap_or(0);
        let (inst, _) = opcodes::decode(word, next);
        Ok(disasm::disassemble_with(inst, pc, Some(&self.symbols)))
    }

    /// Source location of a program word, from the ELF line table.
    pub fn source_line(&self, pc: u16) -> Option<String> {
        self.lines.lookup(pc as u32 * 2).map(|(file, line)| format!("{}:{}", file, line))
    }

    /// General registers, SREG, SP, PC and cycle count.
    pub fn dump_registers(&self) -> String {
        let mut s = String::new();
        for row in 0..4 {
            for col in 0..8 {
                let r = row * 8 + col;
                let _ = write!(s, "R{:<2}={:02X} ", r, self.mem.data[r]);
            }
            s.push('\n');
        }
        let _ = writeln!(
            s,
            "SREG={:02X} [{}]  SP={:04X}  PC={:04X}  X={:04X} Y={:04X} Z={:04X}  cycles={}",
            self.sreg(),
            disasm::format_sreg(self.sreg()),
            self.sp(),
            self.cpu.pc as u32 * 2,
            self.mem.x(),
            self.mem.y(),
            self.mem.z(),
            self.cpu.cycles
        );
        s
    }

    /// Named I/O registers. With `all` false, zero registers are skipped.
    pub fn dump_io(&self, all: bool) -> String {
        let mut s = String::new();
        for &(addr, name) in self.variant.io_names {
            let val = self.mem.read_raw(addr);
            if all || val != 0 {
                let _ = writeln!(s, "  {:>8} (0x{:02X}) = 0x{:02X}  {:08b}", name, addr, val, val);
            }
        }
        if s.is_empty() {
            s.push_str("  (all zero)\n");
        }
        s
    }

    /// Vectors currently raised, with their names.
    pub fn pending_interrupts(&self) -> Vec<(u8, &'static str)> {
        let mask = self.irq.pending();
        (0..64u8)
            .filter(|v| mask & (1u64 << v) != 0)
            .map(|v| (v, self.variant.vector_name(v).unwrap_or("?")))
            .collect()
    }
}

/// Hex + ASCII dump of a byte slice, 16 bytes per line, addresses
/// starting at `base`.
pub fn dump_bytes(bytes: &[u8], base: u32) -> String {
    let mut s = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(s, "{:06X}: ", base as usize + i * 16);
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => {
                    let _ = write!(s, "{:02X} ", b);
                }
                None => s.push_str("   "),
            }
            if j == 7 {
                s.push(' ');
            }
        }
        s.push(' ');
        s.extend(chunk.iter().map(|&c| if (0x20..0x7F).contains(&c) { c as char } else { '.' }));
        s.push('\n');
    }
    s
}
