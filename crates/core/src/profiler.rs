//! Execution profiler.
//!
//! Fed from the engine's fetch step while enabled:
//! - per-PC hit counts
//! - call edges (CALL/RCALL/ICALL → target) and call depth
//! - hot regions (runs of nearby addresses) and, with symbols, hot functions
//!
//! Nothing is recorded while disabled.

use std::collections::HashMap;
use std::fmt::Write;

use crate::symbols::SymbolTable;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Default)]
pub struct Profiler {
    pub enabled: bool,
    /// Word address → executions
    pc_hits: HashMap<u16, u64>,
    pub total_instructions: u64,
    pub total_cycles: u64,
    start_tick: u64,
    /// (caller, callee) word addresses → count
    call_graph: HashMap<(u16, u16), u64>,
    call_stack: Vec<u16>,
    max_depth: usize,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start or restart, clearing everything collected so far.
    pub fn start(&mut self, tick: u64) {
        *self = Profiler { enabled: true, start_tick: tick, ..Profiler::default() };
    }

    pub fn stop(&mut self, tick: u64) {
        self.total_cycles = tick.saturating_sub(self.start_tick);
        self.enabled = false;
    }

    #[inline]
    pub fn record(&mut self, pc: u16) {
        *self.pc_hits.entry(pc).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    #[inline]
    pub fn record_call(&mut self, caller: u16, target: u16) {
        *self.call_graph.entry((caller, target)).or_insert(0) += 1;
        if self.call_stack.len() < MAX_DEPTH {
            self.call_stack.push(caller);
            self.max_depth = self.max_depth.max(self.call_stack.len());
        }
    }

    #[inline]
    pub fn record_ret(&mut self) {
        self.call_stack.pop();
    }

    pub fn unique_addresses(&self) -> usize {
        self.pc_hits.len()
    }

    pub fn hits_at(&self, pc: u16) -> u64 {
        self.pc_hits.get(&pc).copied().unwrap_or(0)
    }

    /// Deepest call nesting seen.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Hottest addresses, most executed first; ties by address.
    pub fn top_hits(&self, n: usize) -> Vec<(u16, u64)> {
        let mut v: Vec<_> = self.pc_hits.iter().map(|(&pc, &cnt)| (pc, cnt)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        v.truncate(n);
        v
    }

    pub fn top_calls(&self, n: usize) -> Vec<((u16, u16), u64)> {
        let mut v: Vec<_> = self.call_graph.iter().map(|(&edge, &cnt)| (edge, cnt)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        v.truncate(n);
        v
    }

    /// Executed addresses grouped into runs with gaps of at most one word
    /// (two-word instructions), hottest first: `(first, last, hits)`.
    pub fn flat_profile(&self) -> Vec<(u16, u16, u64)> {
        let mut addrs: Vec<_> = self.pc_hits.keys().copied().collect();
        addrs.sort_unstable();
        let mut ranges: Vec<(u16, u16, u64)> = Vec::new();
        for pc in addrs {
            let hits = self.hits_at(pc);
            match ranges.last_mut() {
                Some((_, end, total)) if pc <= end.saturating_add(2) => {
                    *end = pc;
                    *total += hits;
                }
                _ => ranges.push((pc, pc, hits)),
            }
        }
        ranges.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        ranges
    }

    /// Hits attributed to the function symbol containing each address.
    pub fn by_function(&self, symbols: &SymbolTable) -> Vec<(String, u64)> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for (&pc, &cnt) in &self.pc_hits {
            let name = symbols
                .containing(pc as u32 * 2)
                .map_or_else(|| "?".to_string(), |s| s.name.clone());
            *totals.entry(name).or_insert(0) += cnt;
        }
        let mut v: Vec<_> = totals.into_iter().collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        v
    }

    fn pct(&self, n: u64) -> f64 {
        if self.total_instructions == 0 {
            0.0
        } else {
            n as f64 / self.total_instructions as f64 * 100.0
        }
    }

    /// Text report over the given program image.
    pub fn report(&self, flash: &[u16], symbols: Option<&SymbolTable>) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "=== Profile ===");
        let _ = writeln!(s, "Instructions: {}", self.total_instructions);
        let _ = writeln!(s, "Cycles: {}", self.total_cycles);
        let _ = writeln!(s, "Unique addresses: {}", self.unique_addresses());
        let _ = writeln!(s, "Max call depth: {}", self.max_depth);
        if self.total_instructions > 0 {
            let cpi = self.total_cycles as f64 / self.total_instructions as f64;
            let _ = writeln!(s, "Cycles/instruction: {:.2}", cpi);
        }

        let _ = writeln!(s, "\n--- Top 20 hotspots ---");
        let _ = writeln!(s, "{:>8}  {:>8}  {:>7}  Instruction", "Addr", "Hits", "%");
        for (pc, cnt) in self.top_hits(20) {
            let word = flash.get(pc as usize).copied().unwrap_or(0);
            let next = flash.get(pc as usize + 1).copied().unwrap_or(0);
            let (inst, _) = crate::opcodes::decode(word, next);
            let asm = crate::disasm::disassemble_with(inst, pc, symbols);
            let _ = writeln!(s, "0x{:06X}  {:>8}  {:>6.2}%  {}", pc as u32 * 2, cnt, self.pct(cnt), asm);
        }

        if let Some(sym) = symbols.filter(|t| !t.is_empty()) {
            let funcs = self.by_function(sym);
            let _ = writeln!(s, "\n--- Top 10 functions ---");
            for (name, cnt) in funcs.iter().take(10) {
                let _ = writeln!(s, "{:<24}  {:>8}  ({:.1}%)", name, cnt, self.pct(*cnt));
            }
        }

        let calls = self.top_calls(10);
        if !calls.is_empty() {
            let _ = writeln!(s, "\n--- Top 10 call edges ---");
            for ((from, to), cnt) in calls {
                let target = symbols
                    .and_then(|t| t.label_at(to))
                    .map(|n| format!(" <{}>", n))
                    .unwrap_or_default();
                let _ = writeln!(s, "0x{:06X} -> 0x{:06X}{}  {:>8}", from as u32 * 2, to as u32 * 2, target, cnt);
            }
        }

        let blocks = self.flat_profile();
        if !blocks.is_empty() {
            let _ = writeln!(s, "\n--- Top 10 hot regions ---");
            for (start, end, hits) in blocks.iter().take(10) {
                let _ = writeln!(
                    s,
                    "0x{:06X}-0x{:06X}  {:>8} hits  ({:.1}%)",
                    *start as u32 * 2,
                    *end as u32 * 2,
                    hits,
                    self.pct(*hits)
                );
            }
        }
        s
    }
}
