//! Peripheral dispatch table.
//!
//! Every I/O address has its own reader list and writer list; a single
//! clock list collects per-cycle subscribers. Entries are
//! [`PeripheralId`]s into the machine's plugin arena, so each registration
//! is bound to a typed plugin instance rather than a raw context pointer.
//!
//! Reader and writer registrations prepend: the most recently registered
//! callback for an address runs first. Readers see the value produced by
//! the callbacks before them and may replace it, so the last reader wins.

use std::any::Any;
use std::ops::RangeInclusive;

use crate::error::{DispatchError, SaveStateError};
use crate::interrupt::InterruptUnit;
use crate::variant::Variant;

/// Index of a plugin in the machine's peripheral arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub usize);

/// Per-address reader/writer lists plus the clock list.
pub struct DispatchTable {
    readers: Vec<Vec<PeripheralId>>,
    writers: Vec<Vec<PeripheralId>>,
    clocks: Vec<PeripheralId>,
}

impl DispatchTable {
    /// Table covering data addresses `0..=io_top`.
    pub fn new(io_top: u16) -> Self {
        let n = io_top as usize + 1;
        DispatchTable {
            readers: vec![Vec::new(); n],
            writers: vec![Vec::new(); n],
            clocks: Vec::new(),
        }
    }

    /// Last address that dispatches.
    pub fn io_top(&self) -> u16 {
        (self.readers.len() - 1) as u16
    }

    fn prepend(list: &mut Vec<PeripheralId>, id: PeripheralId) -> Result<(), DispatchError> {
        list.try_reserve(1).map_err(|_| DispatchError::Exhausted)?;
        list.insert(0, id);
        Ok(())
    }

    pub fn register_reader(&mut self, addr: u16, id: PeripheralId) -> Result<(), DispatchError> {
        let list = self.readers.get_mut(addr as usize).ok_or(DispatchError::NotIoSpace(addr))?;
        Self::prepend(list, id)
    }

    pub fn register_writer(&mut self, addr: u16, id: PeripheralId) -> Result<(), DispatchError> {
        let list = self.writers.get_mut(addr as usize).ok_or(DispatchError::NotIoSpace(addr))?;
        Self::prepend(list, id)
    }

    /// Clock subscribers run in registration order.
    pub fn register_clock(&mut self, id: PeripheralId) -> Result<(), DispatchError> {
        self.clocks.try_reserve(1).map_err(|_| DispatchError::Exhausted)?;
        self.clocks.push(id);
        Ok(())
    }

    #[inline]
    pub fn readers_at(&self, addr: u16) -> &[PeripheralId] {
        self.readers.get(addr as usize).map(|l| l.as_slice()).unwrap_or(&[])
    }

    #[inline]
    pub fn writers_at(&self, addr: u16) -> &[PeripheralId] {
        self.writers.get(addr as usize).map(|l| l.as_slice()).unwrap_or(&[])
    }

    #[inline]
    pub fn clocks(&self) -> &[PeripheralId] {
        &self.clocks
    }

    /// True if any plugin reads or writes `addr`.
    pub fn is_claimed(&self, addr: u16) -> bool {
        !self.readers_at(addr).is_empty() || !self.writers_at(addr).is_empty()
    }
}

/// Machine state a plugin may touch from inside a callback.
///
/// Plugins talk to each other only through data memory; `IoContext`
/// exposes exactly that, plus the interrupt lines and EEPROM.
pub struct IoContext<'a> {
    data: &'a mut [u8],
    eeprom: &'a mut [u8],
    irq: &'a mut InterruptUnit,
    cycles: u64,
    clock_hz: u32,
    stall: u32,
}

impl<'a> IoContext<'a> {
    pub fn new(
        data: &'a mut [u8],
        eeprom: &'a mut [u8],
        irq: &'a mut InterruptUnit,
        cycles: u64,
        clock_hz: u32,
    ) -> Self {
        IoContext { data, eeprom, irq, cycles, clock_hz, stall: 0 }
    }

    /// Raw data-memory byte; no dispatch.
    #[inline]
    pub fn get(&self, addr: u16) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    /// Raw data-memory store; no dispatch.
    #[inline]
    pub fn set(&mut self, addr: u16, v: u8) {
        if let Some(b) = self.data.get_mut(addr as usize) {
            *b = v;
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn eeprom(&self) -> &[u8] {
        self.eeprom
    }

    pub fn eeprom_mut(&mut self) -> &mut [u8] {
        self.eeprom
    }

    /// Mark a vector as a candidate.
    pub fn raise(&mut self, vector: u8) {
        self.irq.raise(vector);
    }

    /// Retract a candidate.
    pub fn clear(&mut self, vector: u8) {
        self.irq.clear(vector);
    }

    /// Raise or clear according to `cond`.
    pub fn set_candidate(&mut self, vector: u8, cond: bool) {
        if cond { self.irq.raise(vector) } else { self.irq.clear(vector) }
    }

    /// Cycle counter at the time of the callback.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Halt the CPU for `cycles` extra cycles after the current instruction.
    pub fn stall(&mut self, cycles: u32) {
        self.stall += cycles;
    }

    pub fn stalled(&self) -> u32 {
        self.stall
    }
}

/// Registration handle passed to [`Peripheral::init`].
pub struct Attach<'a> {
    id: PeripheralId,
    name: &'static str,
    claimed: RangeInclusive<u16>,
    dispatch: &'a mut DispatchTable,
    irq: &'a mut InterruptUnit,
    variant: &'static Variant,
}

impl<'a> Attach<'a> {
    pub(crate) fn new(
        id: PeripheralId,
        name: &'static str,
        claimed: RangeInclusive<u16>,
        dispatch: &'a mut DispatchTable,
        irq: &'a mut InterruptUnit,
        variant: &'static Variant,
    ) -> Self {
        Attach { id, name, claimed, dispatch, irq, variant }
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    pub fn variant(&self) -> &'static Variant {
        self.variant
    }

    fn check(&self, addr: u16) -> Result<(), DispatchError> {
        if addr > self.dispatch.io_top() {
            return Err(DispatchError::NotIoSpace(addr));
        }
        if !self.claimed.contains(&addr) {
            return Err(DispatchError::Unclaimed { name: self.name, addr });
        }
        Ok(())
    }

    pub fn reader(&mut self, addr: u16) -> Result<(), DispatchError> {
        self.check(addr)?;
        self.dispatch.register_reader(addr, self.id)
    }

    pub fn writer(&mut self, addr: u16) -> Result<(), DispatchError> {
        self.check(addr)?;
        self.dispatch.register_writer(addr, self.id)
    }

    pub fn clock(&mut self) -> Result<(), DispatchError> {
        self.dispatch.register_clock(self.id)
    }

    /// Ask to be called when the CPU enters `vector`.
    pub fn acknowledge(&mut self, vector: u8) -> Result<(), DispatchError> {
        self.irq.register_ack(vector, self.id)
    }
}

/// A pluggable peripheral model.
///
/// All hooks run on the engine thread between instructions. Default
/// implementations do nothing, so a plugin only overrides what it
/// registered for.
pub trait Peripheral {
    fn name(&self) -> &'static str;

    /// I/O addresses this plugin may register for.
    fn claimed(&self) -> RangeInclusive<u16>;

    /// Register readers, writers, clock and acknowledge hooks.
    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError>;

    /// Restore power-on register values.
    fn reset(&mut self, _io: &mut IoContext<'_>) {}

    /// `value` holds the raw byte (or an earlier reader's result) and may be replaced.
    fn read(&mut self, _addr: u16, _value: &mut u8, _io: &mut IoContext<'_>) {}

    /// Called after `value` has been stored at `addr`.
    fn write(&mut self, _addr: u16, _value: u8, _io: &mut IoContext<'_>) {}

    /// Called once per CPU cycle.
    fn clock(&mut self, _io: &mut IoContext<'_>) {}

    /// Called when the CPU enters a vector this plugin acknowledged.
    fn acknowledge(&mut self, _vector: u8, _io: &mut IoContext<'_>) {}

    fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        Ok(Vec::new())
    }

    fn load_state(&mut self, _state: &[u8]) -> Result<(), SaveStateError> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
