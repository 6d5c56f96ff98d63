//! AVR instruction disassembler.
//!
//! Converts decoded [`Instruction`] values back to assembly text for the
//! console's `disasm`/`step` views and the profiler report. Branch targets
//! are resolved to byte addresses, and to symbol names when a table is given.

use crate::opcodes::{self, Instruction, Mode, Ptr};
use crate::symbols::SymbolTable;

const SET_NAMES: [&str; 8] = ["SEC", "SEZ", "SEN", "SEV", "SES", "SEH", "SET", "SEI"];
const CLR_NAMES: [&str; 8] = ["CLC", "CLZ", "CLN", "CLV", "CLS", "CLH", "CLT", "CLI"];
const BRBS_NAMES: [&str; 8] = ["BRCS", "BREQ", "BRMI", "BRVS", "BRLT", "BRHS", "BRTS", "BRIE"];
const BRBC_NAMES: [&str; 8] = ["BRCC", "BRNE", "BRPL", "BRVC", "BRGE", "BRHC", "BRTC", "BRID"];

fn ptr_name(ptr: Ptr) -> char {
    match ptr {
        Ptr::X => 'X',
        Ptr::Y => 'Y',
        Ptr::Z => 'Z',
    }
}

fn indirect(ptr: Ptr, mode: Mode) -> String {
    let p = ptr_name(ptr);
    match mode {
        Mode::Plain => format!("{}", p),
        Mode::PostInc => format!("{}+", p),
        Mode::PreDec => format!("-{}", p),
        Mode::Disp(q) => format!("{}+{}", p, q),
    }
}

/// I/O-space address for IN/OUT/SBI/CBI operands.
fn io(a: u8) -> u8 {
    a.wrapping_sub(0x20)
}

fn relative(pc: u16, k: i32) -> u16 {
    (pc as i32 + 1 + k) as u16
}

/// Format a decoded instruction as an assembly string.
///
/// `pc` is the word address of the instruction and is used to resolve
/// relative branch targets.
pub fn disassemble(inst: Instruction, pc: u16) -> String {
    disassemble_with(inst, pc, None)
}

/// Like [`disassemble`], naming branch and call targets from `symbols`.
pub fn disassemble_with(inst: Instruction, pc: u16, symbols: Option<&SymbolTable>) -> String {
    let target = |word: u16| -> String {
        let label = symbols.and_then(|s| s.describe_code(word));
        match label {
            Some(l) => format!("0x{:04X} <{}>", word as u32 * 2, l),
            None => format!("0x{:04X}", word as u32 * 2),
        }
    };
    match inst {
        Instruction::Nop => "NOP".into(),
        Instruction::Add { d, r }  => format!("ADD R{}, R{}", d, r),
        Instruction::Adc { d, r }  => format!("ADC R{}, R{}", d, r),
        Instruction::Sub { d, r }  => format!("SUB R{}, R{}", d, r),
        Instruction::Subi { d, k } => format!("SUBI R{}, 0x{:02X}", d, k),
        Instruction::Sbc { d, r }  => format!("SBC R{}, R{}", d, r),
        Instruction::Sbci { d, k } => format!("SBCI R{}, 0x{:02X}", d, k),
        Instruction::And { d, r }  => format!("AND R{}, R{}", d, r),
        Instruction::Andi { d, k } => format!("ANDI R{}, 0x{:02X}", d, k),
        Instruction::Or { d, r }   => format!("OR R{}, R{}", d, r),
        Instruction::Ori { d, k }  => format!("ORI R{}, 0x{:02X}", d, k),
        Instruction::Eor { d, r }  => format!("EOR R{}, R{}", d, r),
        Instruction::Com { d }     => format!("COM R{}", d),
        Instruction::Neg { d }     => format!("NEG R{}", d),
        Instruction::Inc { d }     => format!("INC R{}", d),
        Instruction::Dec { d }     => format!("DEC R{}", d),
        Instruction::Adiw { d, k } => format!("ADIW R{}:R{}, {}", d + 1, d, k),
        Instruction::Sbiw { d, k } => format!("SBIW R{}:R{}, {}", d + 1, d, k),
        Instruction::Mul { d, r }  => format!("MUL R{}, R{}", d, r),
        Instruction::Muls { d, r } => format!("MULS R{}, R{}", d, r),
        Instruction::Mulsu { d, r } => format!("MULSU R{}, R{}", d, r),
        Instruction::Fmul { d, r } => format!("FMUL R{}, R{}", d, r),
        Instruction::Fmuls { d, r } => format!("FMULS R{}, R{}", d, r),
        Instruction::Fmulsu { d, r } => format!("FMULSU R{}, R{}", d, r),
        Instruction::Cp { d, r }   => format!("CP R{}, R{}", d, r),
        Instruction::Cpc { d, r }  => format!("CPC R{}, R{}", d, r),
        Instruction::Cpi { d, k }  => format!("CPI R{}, 0x{:02X}", d, k),
        Instruction::Cpse { d, r } => format!("CPSE R{}, R{}", d, r),
        Instruction::Mov { d, r }  => format!("MOV R{}, R{}", d, r),
        Instruction::Movw { d, r } => format!("MOVW R{}:R{}, R{}:R{}", d + 1, d, r + 1, r),
        Instruction::Ldi { d, k }  => format!("LDI R{}, 0x{:02X}", d, k),
        Instruction::Lds { d, k }  => {
            let name = symbols.and_then(|s| s.describe_data(k));
            match name {
                Some(n) => format!("LDS R{}, 0x{:04X} <{}>", d, k, n),
                None => format!("LDS R{}, 0x{:04X}", d, k),
            }
        }
        Instruction::Sts { k, r }  => {
            let name = symbols.and_then(|s| s.describe_data(k));
            match name {
                Some(n) => format!("STS 0x{:04X} <{}>, R{}", k, n, r),
                None => format!("STS 0x{:04X}, R{}", k, r),
            }
        }
        Instruction::Ld { d, ptr, mode } => match mode {
            Mode::Disp(_) => format!("LDD R{}, {}", d, indirect(ptr, mode)),
            _ => format!("LD R{}, {}", d, indirect(ptr, mode)),
        },
        Instruction::St { r, ptr, mode } => match mode {
            Mode::Disp(_) => format!("STD {}, R{}", indirect(ptr, mode), r),
            _ => format!("ST {}, R{}", indirect(ptr, mode), r),
        },
        Instruction::Push { r }    => format!("PUSH R{}", r),
        Instruction::Pop { d }     => format!("POP R{}", d),
        Instruction::Lpm { d, inc } => format!("LPM R{}, Z{}", d, if inc { "+" } else { "" }),
        Instruction::Elpm { d, inc } => format!("ELPM R{}, Z{}", d, if inc { "+" } else { "" }),
        Instruction::Spm => "SPM".into(),
        Instruction::In { d, a }   => format!("IN R{}, 0x{:02X}", d, io(a)),
        Instruction::Out { a, r }  => format!("OUT 0x{:02X}, R{}", io(a), r),
        Instruction::Lsr { d }     => format!("LSR R{}", d),
        Instruction::Asr { d }     => format!("ASR R{}", d),
        Instruction::Ror { d }     => format!("ROR R{}", d),
        Instruction::Swap { d }    => format!("SWAP R{}", d),
        Instruction::Bst { d, b }  => format!("BST R{}, {}", d, b),
        Instruction::Bld { d, b }  => format!("BLD R{}, {}", d, b),
        Instruction::Sbi { a, b }  => format!("SBI 0x{:02X}, {}", io(a), b),
        Instruction::Cbi { a, b }  => format!("CBI 0x{:02X}, {}", io(a), b),
        Instruction::Bset { s }    => SET_NAMES[(s & 7) as usize].into(),
        Instruction::Bclr { s }    => CLR_NAMES[(s & 7) as usize].into(),
        Instruction::Rjmp { k }  => format!("RJMP .{:+} ; {}", k, target(relative(pc, k as i32))),
        Instruction::Rcall { k } => format!("RCALL .{:+} ; {}", k, target(relative(pc, k as i32))),
        Instruction::Jmp { k }   => format!("JMP {}", target(k as u16)),
        Instruction::Call { k }  => format!("CALL {}", target(k as u16)),
        Instruction::Ijmp   => "IJMP".into(),
        Instruction::Icall  => "ICALL".into(),
        Instruction::Eijmp  => "EIJMP".into(),
        Instruction::Eicall => "EICALL".into(),
        Instruction::Ret  => "RET".into(),
        Instruction::Reti => "RETI".into(),
        Instruction::Sbrc { r, b } => format!("SBRC R{}, {}", r, b),
        Instruction::Sbrs { r, b } => format!("SBRS R{}, {}", r, b),
        Instruction::Sbic { a, b } => format!("SBIC 0x{:02X}, {}", io(a), b),
        Instruction::Sbis { a, b } => format!("SBIS 0x{:02X}, {}", io(a), b),
        Instruction::Brbs { s, k } => {
            format!("{} .{:+} ; {}", BRBS_NAMES[(s & 7) as usize], k, target(relative(pc, k as i32)))
        }
        Instruction::Brbc { s, k } => {
            format!("{} .{:+} ; {}", BRBC_NAMES[(s & 7) as usize], k, target(relative(pc, k as i32)))
        }
        Instruction::Sleep => "SLEEP".into(),
        Instruction::Wdr   => "WDR".into(),
        Instruction::Break => "BREAK".into(),
        Instruction::Unknown(w) => format!(".dw 0x{:04X}", w),
    }
}

/// Format the SREG byte as a flag string like "ithsvnzc" (lowercase=clear, UPPER=set).
pub fn format_sreg(sreg: u8) -> String {
    let flags = ['I', 'T', 'H', 'S', 'V', 'N', 'Z', 'C'];
    flags
        .iter()
        .enumerate()
        .map(|(i, &f)| if sreg & (1 << (7 - i)) != 0 { f } else { f.to_ascii_lowercase() })
        .collect()
}

/// Disassemble `count` instructions of program memory starting at word
/// address `start`. Lines carry the byte address, raw words and text;
/// symbol names are emitted as labels where a function starts.
pub fn disassemble_range(flash: &[u16], start: u16, count: usize, symbols: Option<&SymbolTable>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pc = start as usize;
    for _ in 0..count {
        let Some(&word) = flash.get(pc) else { break };
        let next = flash.get(pc + 1).copied().unwrap_or(0);
        if let Some(label) = symbols.and_then(|s| s.label_at(pc as u16)) {
            lines.push(format!("{}:", label));
        }
        let (inst, size) = opcodes::decode(word, next);
        let asm = disassemble_with(inst, pc as u16, symbols);
        if size == 2 {
            lines.push(format!("  0x{:04X}: {:04X} {:04X}  {}", pc * 2, word, next, asm));
        } else {
            lines.push(format!("  0x{:04X}: {:04X}       {}", pc * 2, word, asm));
        }
        pc += size as usize;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Symbol, SymbolKind};

    #[test]
    fn test_disasm_basic() {
        assert_eq!(disassemble(Instruction::Nop, 0), "NOP");
        assert_eq!(disassemble(Instruction::Add { d: 1, r: 2 }, 0), "ADD R1, R2");
        assert_eq!(disassemble(Instruction::Ldi { d: 16, k: 0xFF }, 0), "LDI R16, 0xFF");
        assert_eq!(disassemble(Instruction::Bset { s: 7 }, 0), "SEI");
        assert_eq!(disassemble(Instruction::Bclr { s: 0 }, 0), "CLC");
    }

    #[test]
    fn test_disasm_io_operands_in_io_space() {
        assert_eq!(disassemble(Instruction::Out { a: 0x3F, r: 0 }, 0), "OUT 0x1F, R0");
        assert_eq!(disassemble(Instruction::Sbi { a: 0x25, b: 5 }, 0), "SBI 0x05, 5");
    }

    #[test]
    fn test_disasm_indirect() {
        let ld = Instruction::Ld { d: 4, ptr: Ptr::Y, mode: Mode::Disp(3) };
        assert_eq!(disassemble(ld, 0), "LDD R4, Y+3");
        let st = Instruction::St { r: 2, ptr: Ptr::X, mode: Mode::PreDec };
        assert_eq!(disassemble(st, 0), "ST -X, R2");
        assert_eq!(disassemble(Instruction::Lpm { d: 0, inc: false }, 0), "LPM R0, Z");
    }

    #[test]
    fn test_disasm_branch() {
        // RJMP +2 at PC=0x10 → target = 0x11+2 = 0x13, byte addr 0x26
        let s = disassemble(Instruction::Rjmp { k: 2 }, 0x10);
        assert_eq!(s, "RJMP .+2 ; 0x0026");
        let s = disassemble(Instruction::Brbc { s: 1, k: -3 }, 0x10);
        assert_eq!(s, "BRNE .-3 ; 0x001C");
    }

    #[test]
    fn test_disasm_symbolic_call() {
        let mut syms = SymbolTable::default();
        syms.insert(Symbol { name: "main".into(), addr: 0x80, size: 10, kind: SymbolKind::Function });
        let s = disassemble_with(Instruction::Call { k: 0x40 }, 0, Some(&syms));
        assert_eq!(s, "CALL 0x0080 <main>");
    }

    #[test]
    fn test_format_sreg() {
        assert_eq!(format_sreg(0xFF), "ITHSVNZC");
        assert_eq!(format_sreg(0x00), "ithsvnzc");
        // 0x83 = 1000_0011 → bit7=I, bit1=Z, bit0=C
        assert_eq!(format_sreg(0x83), "IthsvnZC");
    }

    #[test]
    fn test_disassemble_range_two_word() {
        let flash = [0x940C, 0x0034, 0x0000];
        let lines = disassemble_range(&flash, 0, 2, None);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("940C 0034"));
        assert!(lines[0].contains("JMP 0x0068"));
        assert!(lines[1].contains("0x0004"));
        assert!(lines[1].contains("NOP"));
    }
}
