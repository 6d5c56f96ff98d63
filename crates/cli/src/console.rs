//! Interactive debugger console.
//!
//! One command per line; the machine only runs while a `step` or
//! `continue` is in progress. Addresses are byte addresses, numbers are
//! decimal or `0x` hex, and code/data locations may be given by symbol
//! name (or `file:line` for code when the ELF has line info).

use std::fmt::Write as _;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use avrsim_core::debugger::{dump_bytes, REG_SPH, REG_SPL, REG_SREG};
use avrsim_core::memory::{Region, DATA_BASE};
use avrsim_core::savestate::state_path;
use avrsim_core::symbols::SymbolKind;
use avrsim_core::{Avr, EngineError, StepOutcome, StopReason, WatchKind};

const HELP: &str = "\
Commands:
  s, step [N]             execute N instructions (default 1)
  c, continue [CYCLES]    run until a breakpoint, watchpoint or BREAK
  b, break LOC            set a breakpoint (address, symbol or file:line)
  d, delete LOC           remove a breakpoint
  watch ADDR[:r|w|a]      watch a data address (write by default)
  unwatch ADDR            remove a watchpoint
  l, list                 list breakpoints and watchpoints
  r, regs                 show registers
  m, mem ADDR [LEN]       dump memory (0x800000 data, 0x810000 eeprom)
  set REG VALUE           set r0..r31, sreg, sp or pc
  x, disasm [ADDR] [N]    disassemble N instructions
  io [all]                show named I/O registers
  sym NAME|ADDR           look up a symbol
  irq                     show pending interrupts
  reset                   reset the machine
  save [FILE]             write a save state
  load [FILE]             restore a save state
  q, quit                 leave the console";

/// Failure of one console command.
#[derive(Debug)]
pub enum ConsoleError {
    /// Bad arguments or a failed request; the session goes on
    Command(String),
    /// The engine cannot continue
    Engine(EngineError),
}

impl From<String> for ConsoleError {
    fn from(msg: String) -> Self {
        ConsoleError::Command(msg)
    }
}

/// Result of a successfully executed command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Output(String),
    Quit,
}

pub struct Console<'a> {
    avr: &'a mut Avr,
    state_file: PathBuf,
    uart_stdout: bool,
    last: String,
}

impl<'a> Console<'a> {
    pub fn new(avr: &'a mut Avr, program: &Path, uart_stdout: bool) -> Self {
        Console { avr, state_file: state_path(program), uart_stdout, last: String::new() }
    }

    /// Read commands from stdin until `quit` or end of input.
    pub fn run(&mut self) -> Result<(), EngineError> {
        println!("avrsim console on {}. Type 'help' for commands.", self.avr.variant.name);
        println!("{}", self.next_line());
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("avr> ");
            let _ = io::stdout().flush();
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            match self.execute(&line) {
                Ok(Reply::Output(text)) => print!("{}", text),
                Ok(Reply::Quit) => break,
                Err(ConsoleError::Command(msg)) => println!("error: {}", msg),
                Err(ConsoleError::Engine(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Execute one command line. An empty line repeats the previous command.
    pub fn execute(&mut self, line: &str) -> Result<Reply, ConsoleError> {
        let line = match line.trim() {
            "" => self.last.clone(),
            cmd => {
                self.last = cmd.to_string();
                cmd.to_string()
            }
        };
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            return Ok(Reply::Output(String::new()));
        };
        let args: Vec<&str> = words.collect();

        let out = match cmd {
            "q" | "quit" | "exit" => return Ok(Reply::Quit),
            "h" | "help" | "?" => format!("{}\n", HELP),
            "s" | "step" => self.step(arg_count(args.first(), 1)?)?,
            "c" | "continue" => {
                let limit = args.first().map(|a| parse_num(a)).transpose()?.map(u64::from);
                self.cont(limit)?
            }
            "b" | "break" => {
                let pc = resolve_code(self.avr, required(&args, 0, "location")?)?;
                self.avr.breakpoints.insert(pc);
                format!("breakpoint at 0x{:04X}{}\n", pc as u32 * 2, self.label(pc))
            }
            "d" | "delete" => {
                let pc = resolve_code(self.avr, required(&args, 0, "location")?)?;
                if self.avr.breakpoints.remove(pc) {
                    format!("deleted breakpoint at 0x{:04X}\n", pc as u32 * 2)
                } else {
                    format!("no breakpoint at 0x{:04X}\n", pc as u32 * 2)
                }
            }
            "watch" => {
                let (addr, kind) = parse_watch(self.avr, required(&args, 0, "address")?)?;
                self.avr.watchpoints.insert(addr, kind);
                format!("{} watchpoint at 0x{:04X}\n", kind_name(kind), addr)
            }
            "unwatch" => {
                let addr = resolve_data(self.avr, required(&args, 0, "address")?)?;
                if self.avr.watchpoints.remove(addr) {
                    format!("removed watchpoint at 0x{:04X}\n", addr)
                } else {
                    format!("no watchpoint at 0x{:04X}\n", addr)
                }
            }
            "l" | "list" => self.list(),
            "r" | "regs" => self.avr.dump_registers(),
            "m" | "mem" => {
                let addr = resolve_unified(self.avr, required(&args, 0, "address")?)?;
                let len = arg_count(args.get(1), 64)?;
                let bytes = self.avr.read_unified(addr, len).map_err(|e| e.to_string())?;
                dump_bytes(&bytes, addr)
            }
            "set" => self.set(required(&args, 0, "register")?, required(&args, 1, "value")?)?,
            "x" | "disasm" => {
                let start = match args.first() {
                    Some(a) => resolve_code(self.avr, a)?,
                    None => self.avr.cpu.pc,
                };
                self.disasm(start, arg_count(args.get(1), 8)?)
            }
            "io" => self.avr.dump_io(args.first() == Some(&"all")),
            "sym" => self.symbol(required(&args, 0, "name or address")?)?,
            "irq" => {
                let pending = self.avr.pending_interrupts();
                if pending.is_empty() {
                    "no interrupts pending\n".to_string()
                } else {
                    pending.iter().map(|(v, name)| format!("  {:>2} {}\n", v, name)).collect()
                }
            }
            "reset" => {
                self.avr.reset();
                format!("reset\n{}\n", self.next_line())
            }
            "save" => {
                let path = args.first().map_or_else(|| self.state_file.clone(), PathBuf::from);
                self.avr.save_state_file(&path).map_err(|e| e.to_string())?;
                format!("state saved to {}\n", path.display())
            }
            "load" => {
                let path = args.first().map_or_else(|| self.state_file.clone(), PathBuf::from);
                self.avr.load_state_file(&path).map_err(|e| e.to_string())?;
                format!("state loaded from {}\n{}\n", path.display(), self.next_line())
            }
            other => return Err(format!("unknown command '{}' (try 'help')", other).into()),
        };
        Ok(Reply::Output(out))
    }

    fn step(&mut self, count: usize) -> Result<String, ConsoleError> {
        let mut s = String::new();
        for i in 0..count {
            if i > 0 && self.avr.breakpoints.is_set(self.avr.cpu.pc) {
                let _ = writeln!(s, "*** breakpoint at 0x{:04X}", self.avr.cpu.pc as u32 * 2);
                break;
            }
            let pc = self.avr.cpu.pc;
            let asm = self.avr.disassemble_at(pc).unwrap_or_else(|_| "??".to_string());
            let outcome = self.avr.step().map_err(ConsoleError::Engine)?;
            if count <= 20 || i + 1 == count {
                match outcome {
                    StepOutcome::Executed(cycles) => {
                        let _ = writeln!(s, "  {:04X}: {:<32} ({} cyc)", pc as u32 * 2, asm, cycles);
                    }
                    StepOutcome::Interrupt(v) => {
                        let name = self.avr.variant.vector_name(v).unwrap_or("?");
                        let _ = writeln!(s, "  interrupt {} ({})", v, name);
                    }
                    StepOutcome::Sleeping => s.push_str("  sleeping\n"),
                    StepOutcome::Break => {
                        let _ = writeln!(s, "  {:04X}: BREAK", pc as u32 * 2);
                        break;
                    }
                }
            }
            if let Some(hit) = self.avr.watchpoints.take_hit() {
                let _ = writeln!(s, "*** {}", describe_stop(self.avr, &StopReason::Watchpoint(hit)));
                break;
            }
        }
        self.drain_uart(&mut s);
        let _ = writeln!(s, "{}", self.next_line());
        Ok(s)
    }

    fn cont(&mut self, limit: Option<u64>) -> Result<String, ConsoleError> {
        let start = self.avr.cpu.cycles;
        let reason = self.avr.run_until_breakpoint(limit).map_err(ConsoleError::Engine)?;
        let mut s = String::new();
        self.drain_uart(&mut s);
        let _ = writeln!(
            s,
            "*** {} after {} cycles",
            describe_stop(self.avr, &reason),
            self.avr.cpu.cycles - start
        );
        let _ = writeln!(s, "{}", self.next_line());
        Ok(s)
    }

    fn list(&self) -> String {
        let mut s = String::new();
        if self.avr.breakpoints.is_empty() && self.avr.watchpoints.is_empty() {
            return "no breakpoints or watchpoints\n".to_string();
        }
        for pc in self.avr.breakpoints.iter() {
            let _ = writeln!(s, "  break 0x{:04X}{}", pc as u32 * 2, self.label(pc));
        }
        for w in self.avr.watchpoints.iter() {
            let name = self.avr.symbols.describe_data(w.addr).unwrap_or_default();
            let _ = writeln!(s, "  watch 0x{:04X} {:<6} hits={} {}", w.addr, kind_name(w.kind), w.hits, name);
        }
        s
    }

    fn set(&mut self, target: &str, value: &str) -> Result<String, ConsoleError> {
        let value = parse_num(value)?;
        let target = target.to_ascii_lowercase();
        match target.as_str() {
            "pc" => {
                if value % 2 != 0 || (value / 2) as usize >= self.avr.mem.flash.len() {
                    return Err(format!("0x{:X} is not a flash word address", value).into());
                }
                self.avr.cpu.pc = (value / 2) as u16;
            }
            "sp" => {
                let v = u16::try_from(value).map_err(|_| format!("0x{:X} does not fit SP", value))?;
                self.avr.write_register(REG_SPL, v as u8).map_err(|e| e.to_string())?;
                self.avr.write_register(REG_SPH, (v >> 8) as u8).map_err(|e| e.to_string())?;
            }
            _ => {
                let index = match target.as_str() {
                    "sreg" => REG_SREG,
                    r => r
                        .strip_prefix('r')
                        .and_then(|n| n.parse::<u8>().ok())
                        .filter(|&n| n < 32)
                        .ok_or_else(|| format!("unknown register '{}'", r))?,
                };
                let v = u8::try_from(value).map_err(|_| format!("0x{:X} does not fit a register", value))?;
                self.avr.write_register(index, v).map_err(|e| e.to_string())?;
            }
        }
        Ok(format!("{} = 0x{:X}\n", target, value))
    }

    fn disasm(&self, start: u16, count: usize) -> String {
        let mut s = String::new();
        let mut pc = start;
        for _ in 0..count {
            let Ok(asm) = self.avr.disassemble_at(pc) else { break };
            if let Some(label) = self.avr.symbols.label_at(pc) {
                let _ = writeln!(s, "<{}>:", label);
            }
            let marker = if pc == self.avr.cpu.pc { "=>" } else { "  " };
            let brk = if self.avr.breakpoints.is_set(pc) { "*" } else { " " };
            let _ = writeln!(s, "{}{}{:04X}: {}", marker, brk, pc as u32 * 2, asm);
            pc = pc.wrapping_add(instruction_words(self.avr, pc));
        }
        s
    }

    fn symbol(&self, query: &str) -> Result<String, ConsoleError> {
        let found = match self.avr.symbols.by_name(query) {
            Some(sym) => Some(sym),
            None => {
                let addr = parse_num(query)?;
                self.avr.symbols.containing(addr)
            }
        };
        let sym = found.ok_or_else(|| format!("no symbol matches '{}'", query))?;
        let kind = match sym.kind {
            SymbolKind::Function => "function",
            SymbolKind::Object => "object",
            SymbolKind::Other => "symbol",
        };
        let mut s = format!("{} {} at 0x{:06X} size {}", kind, sym.name, sym.addr, sym.size);
        if let Some(c) = self.avr.symbols.counters(&sym.name) {
            if self.avr.symbols.instrumented() {
                let _ = write!(s, " (entries {}, reads {}, writes {})", c.entries, c.reads, c.writes);
            }
        }
        s.push('\n');
        Ok(s)
    }

    fn label(&self, pc: u16) -> String {
        self.avr.symbols.describe_code(pc).map(|d| format!(" <{}>", d)).unwrap_or_default()
    }

    /// `PC=0x0010 <main+4>  ldi r16, 0xFF  [blink.c:12]`
    fn next_line(&self) -> String {
        let pc = self.avr.cpu.pc;
        let asm = self.avr.disassemble_at(pc).unwrap_or_else(|e| e.to_string());
        let mut s = format!("PC=0x{:04X}{}  {}", pc as u32 * 2, self.label(pc), asm);
        if let Some(src) = self.avr.source_line(pc) {
            let _ = write!(s, "  [{}]", src);
        }
        if self.avr.cpu.sleeping {
            s.push_str("  (sleeping)");
        }
        s
    }

    fn drain_uart(&mut self, s: &mut String) {
        let out = self.avr.uart_output();
        if out.is_empty() {
            return;
        }
        if self.uart_stdout {
            let mut stdout = io::stdout();
            let _ = stdout.write_all(&out);
            let _ = stdout.flush();
        } else {
            let _ = writeln!(s, "uart: {:?}", String::from_utf8_lossy(&out));
        }
    }
}

/// One-line description of why a run stopped.
pub fn describe_stop(avr: &Avr, reason: &StopReason) -> String {
    match reason {
        StopReason::Breakpoint(pc) => {
            let label = avr.symbols.describe_code(*pc).map(|d| format!(" <{}>", d)).unwrap_or_default();
            format!("breakpoint at 0x{:04X}{}", *pc as u32 * 2, label)
        }
        StopReason::Watchpoint(hit) => {
            let name = avr.symbols.describe_data(hit.addr).map(|d| format!(" <{}>", d)).unwrap_or_default();
            format!(
                "watchpoint: {} 0x{:04X}{} 0x{:02X} -> 0x{:02X} by instruction at 0x{:04X}",
                kind_name(hit.kind),
                hit.addr,
                name,
                hit.old,
                hit.new,
                hit.pc as u32 * 2
            )
        }
        StopReason::BreakInstruction => format!("BREAK instruction at 0x{:04X}", avr.cpu.pc.wrapping_sub(1) as u32 * 2),
        StopReason::Paused => "paused".to_string(),
        StopReason::CycleLimit => "cycle limit reached".to_string(),
    }
}

fn kind_name(kind: WatchKind) -> &'static str {
    match kind {
        WatchKind::Write => "write",
        WatchKind::Read => "read",
        WatchKind::Access => "access",
    }
}

/// Decimal or `0x`/`$` hex.
pub fn parse_num(s: &str) -> Result<u32, String> {
    let parsed = if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).or_else(|| s.strip_prefix('$')) {
        u32::from_str_radix(h, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("'{}' is not a number", s))
}

/// Code location to a word address: byte address, symbol or `file:line`.
pub fn resolve_code(avr: &Avr, loc: &str) -> Result<u16, String> {
    let byte = if let Some(sym) = avr.symbols.by_name(loc) {
        if sym.region() != Region::Flash {
            return Err(format!("'{}' is not in flash", loc));
        }
        sym.addr
    } else if let Some((file, line)) = loc.rsplit_once(':').filter(|(_, l)| l.parse::<u32>().is_ok()) {
        let line: u32 = line.parse().map_err(|_| format!("bad line in '{}'", loc))?;
        avr.lines.address_of(file, line).ok_or_else(|| format!("no code for {}:{}", file, line))?
    } else {
        parse_num(loc).map_err(|_| format!("'{}' is neither an address nor a known symbol", loc))?
    };
    if byte % 2 != 0 || (byte / 2) as usize >= avr.mem.flash.len() {
        return Err(format!("0x{:X} is not a flash word address", byte));
    }
    Ok((byte / 2) as u16)
}

/// Data location to a data-space address: number (with or without the
/// 0x800000 offset) or object symbol.
pub fn resolve_data(avr: &Avr, loc: &str) -> Result<u16, String> {
    let addr = match avr.symbols.by_name(loc) {
        Some(sym) if sym.region() == Region::Data => sym.addr - DATA_BASE,
        Some(_) => return Err(format!("'{}' is not in data memory", loc)),
        None => {
            let n = parse_num(loc)?;
            if n >= DATA_BASE {
                n - DATA_BASE
            } else {
                n
            }
        }
    };
    if addr as usize >= avr.mem.data.len() {
        return Err(format!("0x{:X} is outside data memory", addr));
    }
    Ok(addr as u16)
}

/// Address in the unified space: number or any symbol.
fn resolve_unified(avr: &Avr, loc: &str) -> Result<u32, String> {
    match avr.symbols.by_name(loc) {
        Some(sym) => Ok(sym.addr),
        None => parse_num(loc),
    }
}

/// `ADDR`, `ADDR:r`, `ADDR:w` or `ADDR:a`.
pub fn parse_watch(avr: &Avr, spec: &str) -> Result<(u16, WatchKind), String> {
    let (loc, kind) = match spec.rsplit_once(':') {
        Some((loc, "w")) => (loc, WatchKind::Write),
        Some((loc, "r")) => (loc, WatchKind::Read),
        Some((loc, "a")) => (loc, WatchKind::Access),
        Some((_, k)) => return Err(format!("unknown watch kind '{}' (use r, w or a)", k)),
        None => (spec, WatchKind::Write),
    };
    Ok((resolve_data(avr, loc)?, kind))
}

fn required<'s>(args: &[&'s str], i: usize, what: &str) -> Result<&'s str, String> {
    args.get(i).copied().ok_or_else(|| format!("missing {}", what))
}

fn arg_count(arg: Option<&&str>, default: usize) -> Result<usize, String> {
    arg.map_or(Ok(default), |a| parse_num(a).map(|n| n as usize))
}

fn instruction_words(avr: &Avr, pc: u16) -> u16 {
    let word = avr.mem.program_word(pc as usize).unwrap_or(0);
    let next = avr.mem.program_word(pc as usize + 1).unwrap_or(0);
    avrsim_core::opcodes::decode(word, next).1 as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrsim_core::symbols::Symbol;
    use avrsim_core::MachineConfig;

    fn avr() -> Avr {
        let mut a = Avr::new(&MachineConfig::new("atmega328p")).unwrap().with_standard_peripherals().unwrap();
        a.mem.flash.fill(0x0000);
        a
    }

    fn output(c: &mut Console<'_>, line: &str) -> String {
        match c.execute(line) {
            Ok(Reply::Output(s)) => s,
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num("0x1F"), Ok(0x1F));
        assert_eq!(parse_num("$10"), Ok(0x10));
        assert_eq!(parse_num("42"), Ok(42));
        assert!(parse_num("zz").is_err());
    }

    #[test]
    fn test_step_and_repeat() {
        let mut a = avr();
        let mut c = Console::new(&mut a, Path::new("t.hex"), false);
        let out = output(&mut c, "step 3");
        assert!(out.contains("0004: NOP"));
        output(&mut c, "");
        drop(c);
        assert_eq!(a.cpu.pc, 6);
    }

    #[test]
    fn test_break_and_continue() {
        let mut a = avr();
        let mut c = Console::new(&mut a, Path::new("t.hex"), false);
        output(&mut c, "break 0x20");
        assert!(output(&mut c, "list").contains("break 0x0020"));
        let out = output(&mut c, "continue");
        assert!(out.contains("breakpoint at 0x0020"));
        drop(c);
        assert_eq!(a.cpu.pc, 0x10);
    }

    #[test]
    fn test_continue_with_limit() {
        let mut a = avr();
        let mut c = Console::new(&mut a, Path::new("t.hex"), false);
        assert!(output(&mut c, "c 10").contains("cycle limit"));
        drop(c);
        assert_eq!(a.cpu.cycles, 10);
    }

    #[test]
    fn test_set_registers() {
        let mut a = avr();
        let mut c = Console::new(&mut a, Path::new("t.hex"), false);
        output(&mut c, "set r16 0xAB");
        output(&mut c, "set sp 0x0400");
        output(&mut c, "set pc 0x100");
        assert!(matches!(c.execute("set r32 1"), Err(ConsoleError::Command(_))));
        assert!(matches!(c.execute("set pc 3"), Err(ConsoleError::Command(_))));
        drop(c);
        assert_eq!(a.mem.data[16], 0xAB);
        assert_eq!(a.sp(), 0x0400);
        assert_eq!(a.cpu.pc, 0x80);
    }

    #[test]
    fn test_watch_by_symbol() {
        let mut a = avr();
        a.symbols.insert(Symbol { name: "counter".into(), addr: DATA_BASE + 0x100, size: 1, kind: SymbolKind::Object });
        assert_eq!(parse_watch(&a, "counter:r"), Ok((0x100, WatchKind::Read)));
        assert_eq!(parse_watch(&a, "0x800120"), Ok((0x120, WatchKind::Write)));
        assert!(parse_watch(&a, "counter:x").is_err());
    }

    #[test]
    fn test_resolve_code_symbol() {
        let mut a = avr();
        a.symbols.insert(Symbol { name: "main".into(), addr: 0x68, size: 16, kind: SymbolKind::Function });
        assert_eq!(resolve_code(&a, "main"), Ok(0x34));
        assert!(resolve_code(&a, "0x69").is_err());
        assert!(resolve_code(&a, "nowhere").is_err());
    }

    #[test]
    fn test_memory_dump_and_quit() {
        let mut a = avr();
        a.mem.data[0x100] = 0x41;
        let mut c = Console::new(&mut a, Path::new("t.hex"), false);
        let out = output(&mut c, "mem 0x800100 16");
        assert!(out.starts_with("800100: 41"));
        assert_eq!(c.execute("quit").unwrap(), Reply::Quit);
        assert!(matches!(c.execute("frobnicate"), Err(ConsoleError::Command(_))));
    }
}
