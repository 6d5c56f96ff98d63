//! Debug symbol table.
//!
//! Symbols come from the ELF loader and are addressed in the unified
//! debugger address space, so one table covers functions in flash and
//! objects in data memory or EEPROM. The table is read-only to the engine
//! apart from the instrumentation counters, which only move while
//! instrumentation is switched on.

use std::fmt::Write as _;

use crate::memory::{Region, DATA_BASE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Start in the unified address space (flash bytes, 0x800000 data, 0x810000 EEPROM)
    pub addr: u32,
    /// Length in bytes
    pub size: u32,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn region(&self) -> Region {
        Region::classify(self.addr).0
    }

    fn contains(&self, addr: u32) -> bool {
        addr == self.addr || (addr > self.addr && addr - self.addr < self.size)
    }
}

/// Per-symbol instrumentation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolCounters {
    /// Times execution arrived at a function's first instruction
    pub entries: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Symbols sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    counters: Vec<SymbolCounters>,
    instrument: bool,
}

impl SymbolTable {
    /// Add a symbol. A symbol already at the same start keeps its place
    /// unless the new one is sized and the old one is not.
    pub fn insert(&mut self, sym: Symbol) {
        match self.symbols.binary_search_by_key(&sym.addr, |s| s.addr) {
            Ok(i) => {
                if self.symbols[i].size == 0 && sym.size > 0 {
                    self.symbols[i] = sym;
                }
            }
            Err(i) => {
                self.symbols.insert(i, sym);
                self.counters.insert(i, SymbolCounters::default());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    fn index_containing(&self, addr: u32) -> Option<usize> {
        let i = self.symbols.partition_point(|s| s.addr <= addr).checked_sub(1)?;
        self.symbols[i].contains(addr).then_some(i)
    }

    /// Symbol whose range contains the unified address `addr`.
    pub fn containing(&self, addr: u32) -> Option<&Symbol> {
        self.index_containing(addr).map(|i| &self.symbols[i])
    }

    /// `name` or `name+0xN` for a program word address.
    pub fn describe_code(&self, word: u16) -> Option<String> {
        self.describe(word as u32 * 2)
    }

    /// `name` or `name+N` for a data-space address.
    pub fn describe_data(&self, addr: u16) -> Option<String> {
        self.describe(DATA_BASE + addr as u32)
    }

    fn describe(&self, addr: u32) -> Option<String> {
        let s = self.containing(addr)?;
        let off = addr - s.addr;
        Some(if off == 0 { s.name.clone() } else { format!("{}+0x{:X}", s.name, off) })
    }

    /// Name of a function starting exactly at `word`.
    pub fn label_at(&self, word: u16) -> Option<&str> {
        let addr = word as u32 * 2;
        let i = self.symbols.binary_search_by_key(&addr, |s| s.addr).ok()?;
        let s = &self.symbols[i];
        (s.kind == SymbolKind::Function).then_some(s.name.as_str())
    }

    // ---- Instrumentation ----

    pub fn set_instrumentation(&mut self, on: bool) {
        self.instrument = on;
    }

    #[inline]
    pub fn instrumented(&self) -> bool {
        self.instrument && !self.symbols.is_empty()
    }

    /// Count a function entry when `pc` is a function's first word.
    pub fn note_fetch(&mut self, pc: u16) {
        let addr = pc as u32 * 2;
        if let Ok(i) = self.symbols.binary_search_by_key(&addr, |s| s.addr) {
            if self.symbols[i].kind == SymbolKind::Function {
                self.counters[i].entries += 1;
            }
        }
    }

    /// Count a data access falling inside an object.
    pub fn note_data(&mut self, addr: u16, write: bool) {
        let Some(i) = self.index_containing(DATA_BASE + addr as u32) else { return };
        if self.symbols[i].kind != SymbolKind::Object {
            return;
        }
        let c = &mut self.counters[i];
        if write {
            c.writes += 1;
        } else {
            c.reads += 1;
        }
    }

    pub fn counters(&self, name: &str) -> Option<SymbolCounters> {
        let i = self.symbols.iter().position(|s| s.name == name)?;
        Some(self.counters[i])
    }

    pub fn reset_counters(&mut self) {
        self.counters.fill(SymbolCounters::default());
    }

    /// Symbols with any recorded activity, busiest first.
    pub fn counter_report(&self) -> String {
        let mut rows: Vec<_> = self
            .symbols
            .iter()
            .zip(&self.counters)
            .filter(|(_, c)| c.entries + c.reads + c.writes > 0)
            .collect();
        rows.sort_by_key(|(_, c)| std::cmp::Reverse(c.entries + c.reads + c.writes));
        let mut s = String::new();
        for (sym, c) in rows {
            let _ = writeln!(
                s,
                "  {:<24} 0x{:06X}  calls={:<8} reads={:<8} writes={}",
                sym.name, sym.addr, c.entries, c.reads, c.writes
            );
        }
        if s.is_empty() {
            s.push_str("  (no activity)\n");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        let mut t = SymbolTable::default();
        t.insert(Symbol { name: "main".into(), addr: 0x100, size: 0x40, kind: SymbolKind::Function });
        t.insert(Symbol { name: "__vectors".into(), addr: 0, size: 0x68, kind: SymbolKind::Function });
        t.insert(Symbol { name: "counter".into(), addr: DATA_BASE + 0x100, size: 2, kind: SymbolKind::Object });
        t
    }

    #[test]
    fn test_lookup_by_containing_address() {
        let t = table();
        assert_eq!(t.containing(0x110).map(|s| s.name.as_str()), Some("main"));
        assert_eq!(t.containing(0x140), None);
        assert_eq!(t.describe_code(0x88).as_deref(), Some("main+0x10"));
        assert_eq!(t.describe_data(0x101).as_deref(), Some("counter+0x1"));
        assert_eq!(t.label_at(0x80), Some("main"));
        assert_eq!(t.label_at(0x81), None);
        assert_eq!(t.by_name("counter").map(|s| s.region()), Some(Region::Data));
    }

    #[test]
    fn test_sorted_insert() {
        let t = table();
        let addrs: Vec<u32> = t.iter().map(|s| s.addr).collect();
        assert_eq!(addrs, vec![0, 0x100, DATA_BASE + 0x100]);
    }

    #[test]
    fn test_counters_only_when_enabled() {
        let mut t = table();
        assert!(!t.instrumented());
        t.set_instrumentation(true);
        t.note_fetch(0x80);
        t.note_fetch(0x81);
        t.note_data(0x100, true);
        t.note_data(0x101, false);
        t.note_data(0x200, false);
        assert_eq!(t.counters("main"), Some(SymbolCounters { entries: 1, reads: 0, writes: 0 }));
        assert_eq!(t.counters("counter"), Some(SymbolCounters { entries: 0, reads: 1, writes: 1 }));
        assert!(t.counter_report().contains("main"));
        t.reset_counters();
        assert_eq!(t.counters("main"), Some(SymbolCounters::default()));
    }
}
