//! # avrsim-core
//!
//! Cycle-accurate emulation core for 8-bit AVR microcontrollers.
//!
//! One [`Avr`] owns a whole target: the CPU bookkeeping, the three address
//! spaces, the interrupt unit, the peripheral plugins and the debug
//! registries. Everything runs on the caller's thread; the only thing
//! another thread may touch is the [`PauseHandle`].
//!
//! ## Architecture
//!
//! - [`Avr`] — Top-level machine: data bus, step loop, reset, loaders
//! - [`Cpu`] — PC, cycle counters, sleep and watchdog state
//! - [`Memory`] — Flash (words), data space (registers + I/O + SRAM), EEPROM
//! - [`variant::Variant`] — Per-model memory sizes, vectors, features, register map
//! - [`dispatch`] — Per-address reader/writer lists and the [`Peripheral`] trait
//! - [`interrupt`] — Candidate vectors and lowest-vector-wins arbitration
//! - [`peripherals`] — GPIO, timer/counter 0, USART, external interrupts, EEPROM
//! - [`debugger`] — Breakpoints, watchpoints and the register/memory contract
//! - [`disasm`] — Instruction disassembler for debug views
//! - [`hex`] / [`elf`] — Program image loaders, symbol table and line info
//! - [`gdb_server`] — GDB Remote Serial Protocol server for avr-gdb
//! - [`profiler`] — PC histogram and call graph
//! - [`savestate`] — Compressed machine snapshots
//!
//! ## Per-step ordering
//!
//! 1. A pending, enabled interrupt is entered instead of fetching.
//! 2. A sleeping core idles one cycle unless a candidate wakes it.
//! 3. Otherwise one instruction is fetched, decoded and executed.
//! 4. Peripherals are clocked once per elapsed cycle, then the interrupt
//!    unit re-evaluates its candidates.

pub mod cpu;
pub mod debugger;
pub mod disasm;
pub mod dispatch;
pub mod elf;
pub mod error;
pub mod gdb_server;
pub mod hex;
pub mod interrupt;
pub mod memory;
pub mod opcodes;
pub mod peripherals;
pub mod profiler;
pub mod regs;
pub mod savestate;
pub mod symbols;
pub mod variant;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use cpu::Cpu;
pub use debugger::{Breakpoints, StopReason, WatchHit, WatchKind, Watchpoints};
pub use dispatch::{Attach, DispatchTable, IoContext, Peripheral, PeripheralId};
pub use error::{AccessError, ConfigError, DispatchError, EngineError, LoadError, SaveStateError};
pub use interrupt::{InterruptUnit, IrqState};
pub use memory::{Memory, Region};
pub use symbols::SymbolTable;
pub use variant::Variant;

use regs::{PORF, WDIF};

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

// Core registers common to every supported model (data-space addresses)
pub const SREG_ADDR: u16 = 0x5F;
pub const SPH_ADDR: u16 = 0x5E;
pub const SPL_ADDR: u16 = 0x5D;

/// Number of general purpose registers at the bottom of data space.
pub const REG_COUNT: usize = 32;

pub const DEFAULT_MCU: &str = "atmega328p";
pub const DEFAULT_CLOCK_HZ: u32 = 16_000_000;

const FLASH_MIN: usize = 512;
const FLASH_MAX: usize = 128 * 1024;
const SRAM_MIN: usize = 128;
const EEPROM_MAX: usize = 64 * 1024;
const CLOCK_MAX: u32 = 100_000_000;

/// Machine selection: model name, clock, optional memory-size overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub variant: String,
    pub clock_hz: u32,
    #[serde(default)]
    pub flash_size: Option<usize>,
    #[serde(default)]
    pub sram_size: Option<usize>,
    #[serde(default)]
    pub eeprom_size: Option<usize>,
}

/// A validated [`MachineConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MachineLayout {
    pub variant: &'static Variant,
    pub clock_hz: u32,
    pub flash_size: usize,
    pub sram_size: usize,
    pub eeprom_size: usize,
}

impl MachineConfig {
    pub fn new(variant: &str) -> Self {
        MachineConfig {
            variant: variant.to_string(),
            clock_hz: DEFAULT_CLOCK_HZ,
            flash_size: None,
            sram_size: None,
            eeprom_size: None,
        }
    }

    /// Look up the model and check every size against the supported bounds.
    pub fn resolve(&self) -> Result<MachineLayout, ConfigError> {
        let variant = Variant::lookup(&self.variant)?;
        if self.clock_hz == 0 || self.clock_hz > CLOCK_MAX {
            return Err(ConfigError::BadClock(self.clock_hz));
        }

        let bounded = |region, size: usize, min, max| {
            if size < min || size > max {
                Err(ConfigError::SizeOutOfBounds { region, size, min, max })
            } else {
                Ok(size)
            }
        };
        let flash_size = bounded(Region::Flash, self.flash_size.unwrap_or(variant.flash_size), FLASH_MIN, FLASH_MAX)?;
        if flash_size % 2 != 0 {
            return Err(ConfigError::OddFlashSize(flash_size));
        }
        let sram_max = 0x1_0000 - variant.ram_start() as usize;
        let sram_size = bounded(Region::Data, self.sram_size.unwrap_or(variant.sram_size), SRAM_MIN, sram_max)?;
        let eeprom_size = bounded(Region::Eeprom, self.eeprom_size.unwrap_or(variant.eeprom_size), 0, EEPROM_MAX)?;

        Ok(MachineLayout { variant, clock_hz: self.clock_hz, flash_size, sram_size, eeprom_size })
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MCU)
    }
}

/// Cross-thread pause request. Setting it stops
/// [`Avr::run_until_breakpoint`] before the next instruction.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// What one call to [`Avr::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction retired, taking this many cycles (stalls included)
    Executed(u32),
    /// Interrupt entry to this vector instead of a fetch
    Interrupt(u8),
    /// Idle cycle while asleep
    Sleeping,
    /// A BREAK instruction executed
    Break,
}

/// A complete emulated microcontroller.
pub struct Avr {
    pub cpu: Cpu,
    pub mem: Memory,
    pub variant: &'static Variant,
    pub irq: InterruptUnit,
    dispatch: DispatchTable,
    peripherals: Vec<Box<dyn Peripheral>>,
    pub breakpoints: Breakpoints,
    pub watchpoints: Watchpoints,
    pub symbols: SymbolTable,
    /// Source line table from the loaded ELF, if any
    pub lines: elf::LineTable,
    /// Execution profiler (zero-cost when disabled)
    pub profiler: profiler::Profiler,
    pause: PauseHandle,
    /// SPM temporary page buffer
    pub(crate) spm_buffer: Vec<u16>,
}

impl Avr {
    /// Build a machine in its power-on state. No peripherals are attached;
    /// see [`with_standard_peripherals`](Self::with_standard_peripherals).
    pub fn new(config: &MachineConfig) -> Result<Self, ConfigError> {
        let layout = config.resolve()?;
        Ok(Self::from_layout(layout))
    }

    pub fn from_layout(layout: MachineLayout) -> Self {
        let variant = layout.variant;
        let data_size = variant.ram_start() as usize + layout.sram_size;
        let mut avr = Avr {
            cpu: Cpu::new(layout.clock_hz),
            mem: Memory::new(layout.flash_size, data_size, layout.eeprom_size),
            variant,
            irq: InterruptUnit::new(variant.vector_count()),
            dispatch: DispatchTable::new(variant.io_top),
            peripherals: Vec::new(),
            breakpoints: Breakpoints::default(),
            watchpoints: Watchpoints::default(),
            symbols: SymbolTable::default(),
            lines: elf::LineTable::default(),
            profiler: profiler::Profiler::new(),
            pause: PauseHandle::default(),
            spm_buffer: vec![0xFFFF; variant.features.spm_page_words as usize],
        };
        avr.reset();
        avr
    }

    /// Attach the stock plugins for every peripheral this model describes.
    pub fn with_standard_peripherals(mut self) -> Result<Self, DispatchError> {
        for p in peripherals::standard(self.variant) {
            self.attach(p)?;
        }
        Ok(self)
    }

    /// Register a plugin: it claims its addresses, hooks and vectors, then
    /// is reset to its power-on register values.
    pub fn attach(&mut self, mut plugin: Box<dyn Peripheral>) -> Result<PeripheralId, DispatchError> {
        let id = PeripheralId(self.peripherals.len());
        {
            let mut bus = Attach::new(
                id,
                plugin.name(),
                plugin.claimed(),
                &mut self.dispatch,
                &mut self.irq,
                self.variant,
            );
            plugin.init(&mut bus)?;
        }
        self.peripherals.try_reserve(1).map_err(|_| DispatchError::Exhausted)?;
        self.peripherals.push(plugin);
        self.with_io(|peripherals, io| {
            if let Some(p) = peripherals.get_mut(id.0) {
                p.reset(io);
            }
        });
        Ok(id)
    }

    /// First attached plugin of type `T`.
    pub fn peripheral_mut<T: Peripheral + 'static>(&mut self) -> Option<&mut T> {
        self.peripherals.iter_mut().find_map(|p| p.as_any_mut().downcast_mut::<T>())
    }

    /// Run `f` on the first plugin of type `T` with access to the bus,
    /// for host-side stimulus such as driving a pin or feeding serial input.
    pub fn with_peripheral<T, R>(&mut self, f: impl FnOnce(&mut T, &mut IoContext<'_>) -> R) -> Option<R>
    where
        T: Peripheral + 'static,
    {
        let Avr { peripherals, mem, irq, cpu, .. } = self;
        let plugin = peripherals.iter_mut().find_map(|p| p.as_any_mut().downcast_mut::<T>())?;
        let mut io = IoContext::new(&mut mem.data, &mut mem.eeprom, irq, cpu.cycles, cpu.clock_hz);
        let r = f(plugin, &mut io);
        cpu.stall += io.stalled();
        Some(r)
    }

    pub fn peripheral_names(&self) -> Vec<&'static str> {
        self.peripherals.iter().map(|p| p.name()).collect()
    }

    pub(crate) fn peripherals(&self) -> &[Box<dyn Peripheral>] {
        &self.peripherals
    }

    pub(crate) fn peripherals_mut(&mut self) -> &mut [Box<dyn Peripheral>] {
        &mut self.peripherals
    }

    /// Split borrow of the plugin arena and an [`IoContext`] over memory.
    fn with_io<R>(&mut self, f: impl FnOnce(&mut Vec<Box<dyn Peripheral>>, &mut IoContext<'_>) -> R) -> R {
        let Avr { peripherals, mem, irq, cpu, .. } = self;
        let mut io = IoContext::new(&mut mem.data, &mut mem.eeprom, irq, cpu.cycles, cpu.clock_hz);
        let r = f(peripherals, &mut io);
        cpu.stall += io.stalled();
        r
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Power-on reset. Registers and I/O are cleared, SRAM and EEPROM kept.
    pub fn reset(&mut self) {
        let ram_start = self.variant.ram_start() as usize;
        self.mem.data[..ram_start].fill(0);
        let ramend = (self.mem.data.len() - 1) as u16;
        self.set_sp(ramend);
        self.mem.data[self.variant.mcusr as usize] = 1 << PORF;

        self.cpu.pc = 0;
        self.cpu.sleeping = false;
        self.cpu.watchdog = 0;
        self.cpu.irq_inhibit = false;
        self.cpu.stall = 0;
        self.cpu.break_hit = false;
        self.irq.reset();
        self.spm_buffer.fill(0xFFFF);

        self.with_io(|peripherals, io| {
            for p in peripherals.iter_mut() {
                p.reset(io);
            }
        });
        self.cpu.stall = 0;
    }

    // ---- Program loading ----

    /// Load an Intel HEX image into flash. Returns the number of bytes placed.
    pub fn load_hex(&mut self, text: &str) -> Result<usize, LoadError> {
        let mut total = 0;
        for (addr, bytes) in hex::parse_hex(text)? {
            self.mem.write_region(Region::Flash, addr, &bytes)?;
            total += bytes.len();
        }
        log::info!("loaded {} bytes of flash from hex", total);
        Ok(total)
    }

    /// Load an ELF image: segments into their memories, symbols and line
    /// info into the debug tables. The entry point becomes the PC.
    pub fn load_elf(&mut self, data: &[u8]) -> Result<elf::ElfImage, LoadError> {
        let image = elf::ElfImage::parse(data)?;
        for seg in &image.segments {
            let (region, offset) = Region::classify(seg.addr);
            self.mem.write_region(region, offset, &seg.data)?;
        }
        self.symbols = image.symbol_table();
        self.lines = image.lines.clone();
        self.cpu.pc = (image.entry / 2) as u16;
        log::info!(
            "loaded elf: {} segments, {} symbols, {} line entries",
            image.segments.len(),
            image.symbols.len(),
            image.lines.len()
        );
        Ok(image)
    }

    // ---- Data bus ----

    /// Unclaimed reserved I/O reads as zero and drops writes.
    fn io_hole(&self, addr: u16) -> bool {
        self.variant.is_reserved_io(addr) && !self.dispatch.is_claimed(addr)
    }

    /// Data-space read as the CPU sees it: raw byte, then every reader
    /// registered for the address in list order.
    pub fn read_data(&mut self, addr: u16) -> u8 {
        let mut value = self.mem.read_raw(addr);
        if addr <= self.variant.io_top {
            if self.io_hole(addr) {
                value = 0;
            } else {
                value = self.dispatch_read(addr, value);
            }
        }
        if !self.watchpoints.is_empty() {
            self.watchpoints.on_read(addr, value, self.cpu.fetch_pc);
        }
        if self.symbols.instrumented() {
            self.symbols.note_data(addr, false);
        }
        value
    }

    /// Data-space write as the CPU sees it: raw store first, then every
    /// writer registered for the address in list order.
    pub fn write_data(&mut self, addr: u16, value: u8) {
        if addr as usize >= self.mem.data.len() {
            return;
        }
        let old = self.mem.read_raw(addr);
        if addr <= self.variant.io_top {
            if self.io_hole(addr) {
                return;
            }
            let stored = self.core_register_store(addr, old, value);
            self.mem.write_raw(addr, stored);
            self.dispatch_write(addr, value);
        } else {
            self.mem.write_raw(addr, value);
        }
        if !self.watchpoints.is_empty() {
            self.watchpoints.on_write(addr, old, value, self.cpu.fetch_pc);
        }
        if self.symbols.instrumented() {
            self.symbols.note_data(addr, true);
        }
    }

    /// Store rules for registers the core itself owns.
    fn core_register_store(&mut self, addr: u16, old: u8, value: u8) -> u8 {
        if let Some(wd) = self.variant.watchdog {
            if addr == wd.wdtcsr {
                // WDIF is write-one-to-clear
                let flag = 1 << WDIF;
                return (value & !flag) | (old & flag & !value);
            }
        }
        value
    }

    fn dispatch_read(&mut self, addr: u16, raw: u8) -> u8 {
        let Avr { dispatch, peripherals, mem, irq, cpu, .. } = self;
        let readers = dispatch.readers_at(addr);
        if readers.is_empty() {
            return raw;
        }
        let mut value = raw;
        let mut io = IoContext::new(&mut mem.data, &mut mem.eeprom, irq, cpu.cycles, cpu.clock_hz);
        for id in readers {
            if let Some(p) = peripherals.get_mut(id.0) {
                p.read(addr, &mut value, &mut io);
            }
        }
        cpu.stall += io.stalled();
        value
    }

    fn dispatch_write(&mut self, addr: u16, value: u8) {
        let Avr { dispatch, peripherals, mem, irq, cpu, .. } = self;
        let writers = dispatch.writers_at(addr);
        if writers.is_empty() {
            return;
        }
        let mut io = IoContext::new(&mut mem.data, &mut mem.eeprom, irq, cpu.cycles, cpu.clock_hz);
        for id in writers {
            if let Some(p) = peripherals.get_mut(id.0) {
                p.write(addr, value, &mut io);
            }
        }
        cpu.stall += io.stalled();
    }

    fn dispatch_clock(&mut self) {
        let Avr { dispatch, peripherals, mem, irq, cpu, .. } = self;
        let clocks = dispatch.clocks();
        if clocks.is_empty() {
            return;
        }
        let mut io = IoContext::new(&mut mem.data, &mut mem.eeprom, irq, cpu.cycles, cpu.clock_hz);
        for id in clocks {
            if let Some(p) = peripherals.get_mut(id.0) {
                p.clock(&mut io);
            }
        }
        cpu.stall += io.stalled();
    }

    /// Run the acknowledge hook a plugin registered for `vector`.
    pub(crate) fn acknowledge(&mut self, id: PeripheralId, vector: u8) {
        self.with_io(|peripherals, io| {
            if let Some(p) = peripherals.get_mut(id.0) {
                p.acknowledge(vector, io);
            }
        });
    }

    // ---- Execution ----

    /// Let `cycles` cycles elapse: clock every subscriber once per cycle,
    /// tick the watchdog, then re-evaluate interrupt candidates.
    fn advance(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.cpu.cycles += 1;
            self.dispatch_clock();
        }
        self.watchdog_tick(cycles);
        self.irq.evaluate();
    }

    /// Process one engine step: interrupt entry, one idle sleep cycle, or
    /// one instruction.
    pub fn step(&mut self) -> Result<StepOutcome, EngineError> {
        let inhibit = std::mem::take(&mut self.cpu.irq_inhibit);
        if !inhibit && self.flag(SREG_I) {
            if let Some(v) = self.irq.highest() {
                let cycles = self.enter_interrupt(v);
                self.advance(cycles);
                return Ok(StepOutcome::Interrupt(v));
            }
        }

        if self.cpu.sleeping {
            if !self.irq.any_pending() {
                self.advance(1);
                return Ok(StepOutcome::Sleeping);
            }
            self.cpu.sleeping = false;
        }

        let pc = self.cpu.pc;
        let word = self
            .mem
            .program_word(pc as usize)
            .ok_or(EngineError::PcOutOfRange { pc, words: self.mem.flash.len() })?;
        let next = self.mem.program_word(pc as usize + 1).unwrap_or(0);
        let (inst, size) = opcodes::decode(word, next);

        if self.profiler.enabled {
            self.profile(pc, inst);
        }
        if self.symbols.instrumented() {
            self.symbols.note_fetch(pc);
        }

        self.cpu.fetch_pc = pc;
        let cycles = self.execute_inst(inst, size) as u32 + std::mem::take(&mut self.cpu.stall);
        self.cpu.instructions += 1;
        self.advance(cycles as u64);
        // Stalls raised by clock callbacks belong to the next instruction
        if std::mem::take(&mut self.cpu.break_hit) {
            return Ok(StepOutcome::Break);
        }
        Ok(StepOutcome::Executed(cycles))
    }

    fn profile(&mut self, pc: u16, inst: opcodes::Instruction) {
        use opcodes::Instruction;
        self.profiler.record(pc);
        match inst {
            Instruction::Call { k } => self.profiler.record_call(pc, k as u16),
            Instruction::Rcall { k } => self.profiler.record_call(pc, pc.wrapping_add(1).wrapping_add(k as u16)),
            Instruction::Icall => self.profiler.record_call(pc, self.mem.z()),
            Instruction::Ret | Instruction::Reti => self.profiler.record_ret(),
            _ => {}
        }
    }

    /// Run until something stops the machine. The breakpoint at the
    /// starting PC is not checked, so a stopped session can continue.
    pub fn run_until_breakpoint(&mut self, max_cycles: Option<u64>) -> Result<StopReason, EngineError> {
        let start = self.cpu.cycles;
        let mut first = true;
        loop {
            if self.pause.take() {
                return Ok(StopReason::Paused);
            }
            if let Some(limit) = max_cycles {
                if self.cpu.cycles - start >= limit {
                    return Ok(StopReason::CycleLimit);
                }
            }
            if !first && !self.cpu.sleeping && self.breakpoints.is_set(self.cpu.pc) {
                return Ok(StopReason::Breakpoint(self.cpu.pc));
            }
            first = false;

            if self.step()? == StepOutcome::Break {
                return Ok(StopReason::BreakInstruction);
            }
            if let Some(hit) = self.watchpoints.take_hit() {
                return Ok(StopReason::Watchpoint(hit));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Attach, IoContext};
    use std::any::Any;
    use std::cell::RefCell;
    use std::ops::RangeInclusive;
    use std::rc::Rc;

    fn avr(mcu: &str) -> Avr {
        Avr::new(&MachineConfig::new(mcu)).unwrap()
    }

    fn load(a: &mut Avr, words: &[u16]) {
        a.mem.flash[..words.len()].copy_from_slice(words);
    }

    #[test]
    fn test_creation() {
        let a = avr("atmega328p");
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.sp(), 0x08FF);
        assert_eq!(a.mem.data.len(), 0x900);
        assert_eq!(a.mem.flash.len(), 16 * 1024);
        assert_eq!(a.mem.data[0x54], 1 << PORF);
    }

    #[test]
    fn test_config_bounds() {
        let mut c = MachineConfig::new("atmega328p");
        c.flash_size = Some(256 * 1024);
        assert!(matches!(c.resolve(), Err(ConfigError::SizeOutOfBounds { region: Region::Flash, .. })));
        c.flash_size = Some(1001);
        assert_eq!(c.resolve().unwrap_err(), ConfigError::OddFlashSize(1001));
        c.flash_size = None;
        c.sram_size = Some(64);
        assert!(matches!(c.resolve(), Err(ConfigError::SizeOutOfBounds { region: Region::Data, .. })));
        c.sram_size = None;
        c.clock_hz = 0;
        assert_eq!(c.resolve().unwrap_err(), ConfigError::BadClock(0));
        assert!(matches!(
            MachineConfig::new("pic16").resolve(),
            Err(ConfigError::UnknownVariant(_))
        ));
    }

    #[test]
    fn test_cold_boot_nop_then_illegal() {
        let mut a = avr("atmega328p");
        load(&mut a, &[0x0000, 0xFFFF]);
        let regs_before = a.mem.data[..32].to_vec();
        let sreg_before = a.sreg();
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert_eq!(a.cpu.pc, 2);
        assert_eq!(a.cpu.cycles, 2);
        assert_eq!(&a.mem.data[..32], &regs_before[..]);
        assert_eq!(a.sreg(), sreg_before);
    }

    #[test]
    fn test_pc_past_flash_is_fatal() {
        let mut a = avr("atmega328p");
        a.cpu.pc = 0x4000;
        assert_eq!(a.step(), Err(EngineError::PcOutOfRange { pc: 0x4000, words: 0x4000 }));
    }

    #[test]
    fn test_reserved_io_reads_zero() {
        let mut a = avr("atmega328p");
        a.mem.data[0x20] = 0x55;
        assert_eq!(a.read_data(0x20), 0);
        a.write_data(0x20, 0xAA);
        assert_eq!(a.mem.data[0x20], 0x55);
        // Past the end of data space
        assert_eq!(a.read_data(0xF000), 0);
        a.write_data(0xF000, 1);
    }

    #[test]
    fn test_watchpoint_reports_old_and_new() {
        let mut a = avr("atmega328p");
        // LDI r16,0x5A ; STS 0x0200,r16 ; NOP
        load(&mut a, &[0xE50A, 0x9300, 0x0200, 0x0000]);
        a.mem.data[0x200] = 0x11;
        a.watchpoints.insert(0x200, WatchKind::Write);
        let stop = a.run_until_breakpoint(Some(100)).unwrap();
        match stop {
            StopReason::Watchpoint(hit) => {
                assert_eq!(hit.addr, 0x200);
                assert_eq!(hit.old, 0x11);
                assert_eq!(hit.new, 0x5A);
                assert_eq!(hit.pc, 1);
            }
            other => panic!("unexpected stop {:?}", other),
        }
        // Reported before the next fetch
        assert_eq!(a.cpu.pc, 3);
    }

    #[test]
    fn test_breakpoint_stops_run() {
        let mut a = avr("atmega328p");
        load(&mut a, &[0x0000, 0x0000, 0x0000, 0xCFFF]);
        a.breakpoints.insert(2);
        assert_eq!(a.run_until_breakpoint(None), Ok(StopReason::Breakpoint(2)));
        // Continuing from the breakpoint does not stop on it immediately
        assert_eq!(a.run_until_breakpoint(Some(4)), Ok(StopReason::CycleLimit));
    }

    #[test]
    fn test_break_instruction_and_pause() {
        let mut a = avr("atmega328p");
        load(&mut a, &[0x0000, 0x9598]);
        assert_eq!(a.run_until_breakpoint(None), Ok(StopReason::BreakInstruction));
        assert_eq!(a.cpu.pc, 2);
        a.pause_handle().request();
        assert_eq!(a.run_until_breakpoint(None), Ok(StopReason::Paused));
    }

    #[test]
    fn test_sleep_wakes_into_interrupt() {
        let mut a = avr("atmega328p");
        // SLEEP at 0 with SE set and I on
        load(&mut a, &[0x9588, 0x0000]);
        a.mem.data[0x53] = 0x01;
        a.set_flag(SREG_I, true);
        a.step().unwrap();
        assert!(a.cpu.sleeping);
        assert_eq!(a.step(), Ok(StepOutcome::Sleeping));
        assert_eq!(a.step(), Ok(StepOutcome::Sleeping));

        a.irq.raise(16);
        let sp = a.sp();
        assert_eq!(a.step(), Ok(StepOutcome::Interrupt(16)));
        assert!(!a.cpu.sleeping);
        assert_eq!(a.cpu.pc, 0x20);
        assert!(!a.flag(SREG_I));
        assert_eq!(a.sp(), sp - 2);
    }

    struct Flagger {
        vectors: [u8; 2],
        acked: Rc<RefCell<Vec<u8>>>,
    }

    impl Peripheral for Flagger {
        fn name(&self) -> &'static str {
            "flagger"
        }
        fn claimed(&self) -> RangeInclusive<u16> {
            0x100..=0xFF
        }
        fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
            for v in self.vectors {
                bus.acknowledge(v)?;
            }
            Ok(())
        }
        fn acknowledge(&mut self, vector: u8, io: &mut IoContext<'_>) {
            self.acked.borrow_mut().push(vector);
            io.clear(vector);
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_interrupt_tie_break_with_ack() {
        let mut a = avr("atmega328p");
        let acked = Rc::new(RefCell::new(Vec::new()));
        a.attach(Box::new(Flagger { vectors: [14, 18], acked: acked.clone() })).unwrap();
        // Handlers at 14 and 18 are RETI; main code is NOPs
        for v in [14u16, 18] {
            a.mem.flash[(v * 2) as usize] = 0x9518;
        }
        a.cpu.pc = 0x100;
        a.set_flag(SREG_I, true);
        a.irq.raise(18);
        a.irq.raise(14);

        assert_eq!(a.step(), Ok(StepOutcome::Interrupt(14)));
        assert_eq!(*acked.borrow(), vec![14]);
        assert!(a.irq.is_pending(18));
        // RETI, then one instruction before the next entry
        a.step().unwrap();
        assert_eq!(a.cpu.pc, 0x100);
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert_eq!(a.step(), Ok(StepOutcome::Interrupt(18)));
        assert_eq!(*acked.borrow(), vec![14, 18]);
        assert!(!a.irq.any_pending());
    }

    #[test]
    fn test_cli_and_clc_clear_flags() {
        let mut a = avr("atmega328p");
        // CLI ; CLC ; NOP ; NOP
        load(&mut a, &[0x94F8, 0x9488, 0x0000, 0x0000]);
        a.set_flag(SREG_I, true);
        a.set_flag(SREG_C, true);
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert!(!a.flag(SREG_I));
        a.irq.raise(16);
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert!(!a.flag(SREG_C));
        // Interrupts stay off after CLI
        assert_eq!(a.step(), Ok(StepOutcome::Executed(1)));
        assert_eq!(a.cpu.pc, 3);
        assert!(a.irq.is_pending(16));
    }

    #[test]
    fn test_masked_candidate_waits() {
        let mut a = avr("atmega328p");
        a.irq.raise(3);
        assert!(matches!(a.step(), Ok(StepOutcome::Executed(_))));
        assert!(a.irq.is_pending(3));
        assert_eq!(a.irq.state(), IrqState::Candidate(3));
    }

    struct Recorder {
        tag: char,
        log: Rc<RefCell<Vec<(char, u8)>>>,
    }

    impl Peripheral for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn claimed(&self) -> RangeInclusive<u16> {
            0x40..=0x4F
        }
        fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
            bus.writer(0x4A)?;
            bus.reader(0x4A)
        }
        fn read(&mut self, _addr: u16, value: &mut u8, _io: &mut IoContext<'_>) {
            self.log.borrow_mut().push((self.tag, *value));
            *value = self.tag as u8;
        }
        fn write(&mut self, _addr: u16, value: u8, io: &mut IoContext<'_>) {
            // Raw store has already happened
            assert_eq!(io.get(0x4A), value);
            self.log.borrow_mut().push((self.tag, value));
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_dispatch_order_most_recent_first() {
        let mut a = avr("atmega328p");
        let log = Rc::new(RefCell::new(Vec::new()));
        a.attach(Box::new(Recorder { tag: 'A', log: log.clone() })).unwrap();
        a.attach(Box::new(Recorder { tag: 'B', log: log.clone() })).unwrap();

        a.write_data(0x4A, 0x77);
        assert_eq!(*log.borrow(), vec![('B', 0x77), ('A', 0x77)]);

        log.borrow_mut().clear();
        // B reads the raw byte, A sees B's result and wins
        assert_eq!(a.read_data(0x4A), b'A');
        assert_eq!(*log.borrow(), vec![('B', 0x77), ('A', b'B')]);
    }

    #[test]
    fn test_attach_outside_claim_fails() {
        struct Greedy;
        impl Peripheral for Greedy {
            fn name(&self) -> &'static str {
                "greedy"
            }
            fn claimed(&self) -> RangeInclusive<u16> {
                0x40..=0x41
            }
            fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
                bus.writer(0x60)
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        let mut a = avr("atmega328p");
        assert_eq!(
            a.attach(Box::new(Greedy)),
            Err(DispatchError::Unclaimed { name: "greedy", addr: 0x60 })
        );
        assert!(a.peripheral_names().is_empty());
    }

    #[test]
    fn test_wdif_write_one_to_clear() {
        let mut a = avr("atmega328p");
        a.mem.data[0x60] = 0x80;
        a.write_data(0x60, 0x40);
        assert_eq!(a.mem.data[0x60], 0xC0);
        a.write_data(0x60, 0x80);
        assert_eq!(a.mem.data[0x60], 0x00);
    }

    #[test]
    fn test_hex_round_trip() {
        let mut a = avr("atmega328p");
        let hex = ":100000000C9434000C944E000C944E000C944E0052\n:00000001FF\n";
        assert_eq!(a.load_hex(hex).unwrap(), 16);
        let bytes = a.read_memory(Region::Flash, 0, 16).unwrap();
        assert_eq!(
            bytes,
            vec![0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94, 0x4E, 0x00, 0x0C, 0x94, 0x4E, 0x00, 0x0C, 0x94, 0x4E, 0x00]
        );
        assert_eq!(a.mem.flash[0], 0x940C);
    }
}
