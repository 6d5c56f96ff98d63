//! AVR instruction decoder.
//!
//! Turns one opcode word (plus the following word for the four 32-bit
//! instructions) into an [`Instruction`] with its operands resolved:
//! register indices 0–31, immediates, bit numbers, signed displacements
//! and data-space I/O addresses. Decoding covers the full classic AVR
//! instruction set; whether a model actually implements an instruction
//! (MUL, JMP, ELPM...) is the engine's concern.

/// Pointer register used by LD/ST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ptr {
    X,
    Y,
    Z,
}

/// Addressing mode of an indirect load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Plain,
    PostInc,
    PreDec,
    /// Y+q / Z+q, q in 0..=63
    Disp(u8),
}

/// Decoded instruction.
///
/// `a` fields are data-space addresses (I/O address + 0x20). Branch
/// displacements are in words relative to the following instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    // Arithmetic and logic
    Add { d: u8, r: u8 },
    Adc { d: u8, r: u8 },
    Sub { d: u8, r: u8 },
    Subi { d: u8, k: u8 },
    Sbc { d: u8, r: u8 },
    Sbci { d: u8, k: u8 },
    And { d: u8, r: u8 },
    Andi { d: u8, k: u8 },
    Or { d: u8, r: u8 },
    Ori { d: u8, k: u8 },
    Eor { d: u8, r: u8 },
    Com { d: u8 },
    Neg { d: u8 },
    Inc { d: u8 },
    Dec { d: u8 },
    Adiw { d: u8, k: u8 },
    Sbiw { d: u8, k: u8 },
    Mul { d: u8, r: u8 },
    Muls { d: u8, r: u8 },
    Mulsu { d: u8, r: u8 },
    Fmul { d: u8, r: u8 },
    Fmuls { d: u8, r: u8 },
    Fmulsu { d: u8, r: u8 },
    // Compare
    Cp { d: u8, r: u8 },
    Cpc { d: u8, r: u8 },
    Cpi { d: u8, k: u8 },
    Cpse { d: u8, r: u8 },
    // Data transfer
    Mov { d: u8, r: u8 },
    Movw { d: u8, r: u8 },
    Ldi { d: u8, k: u8 },
    Lds { d: u8, k: u16 },
    Sts { k: u16, r: u8 },
    Ld { d: u8, ptr: Ptr, mode: Mode },
    St { r: u8, ptr: Ptr, mode: Mode },
    Push { r: u8 },
    Pop { d: u8 },
    Lpm { d: u8, inc: bool },
    Elpm { d: u8, inc: bool },
    Spm,
    In { d: u8, a: u8 },
    Out { a: u8, r: u8 },
    // Bit and shift
    Lsr { d: u8 },
    Asr { d: u8 },
    Ror { d: u8 },
    Swap { d: u8 },
    Bst { d: u8, b: u8 },
    Bld { d: u8, b: u8 },
    Sbi { a: u8, b: u8 },
    Cbi { a: u8, b: u8 },
    Bset { s: u8 },
    Bclr { s: u8 },
    // Control flow
    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u32 },
    Call { k: u32 },
    Ijmp,
    Icall,
    Eijmp,
    Eicall,
    Ret,
    Reti,
    Sbrc { r: u8, b: u8 },
    Sbrs { r: u8, b: u8 },
    Sbic { a: u8, b: u8 },
    Sbis { a: u8, b: u8 },
    Brbs { s: u8, k: i8 },
    Brbc { s: u8, k: i8 },
    // MCU control
    Sleep,
    Wdr,
    Break,
    Unknown(u16),
}

/// True for JMP, CALL, LDS and STS.
#[inline]
pub fn is_two_word(word: u16) -> bool {
    word & 0xFC0F == 0x9000 || word & 0xFE0C == 0x940C
}

/// Decode an opcode word. Returns the instruction and its size in words.
pub fn decode(word: u16, next: u16) -> (Instruction, u8) {
    use Instruction::*;

    let d5 = ((word >> 4) & 0x1F) as u8;
    let (rd, rr) = regs_5_5(word);

    let inst = match word >> 12 {
        0x0 => match word >> 10 {
            0 => match word >> 8 {
                0x00 if word == 0 => Nop,
                0x01 => Movw { d: (((word >> 4) & 0xF) * 2) as u8, r: ((word & 0xF) * 2) as u8 },
                0x02 => Muls { d: (((word >> 4) & 0xF) + 16) as u8, r: ((word & 0xF) + 16) as u8 },
                0x03 => {
                    let d = (((word >> 4) & 0x7) + 16) as u8;
                    let r = ((word & 0x7) + 16) as u8;
                    match word & 0x88 {
                        0x00 => Mulsu { d, r },
                        0x08 => Fmul { d, r },
                        0x80 => Fmuls { d, r },
                        _ => Fmulsu { d, r },
                    }
                }
                _ => Unknown(word),
            },
            1 => Cpc { d: rd, r: rr },
            2 => Sbc { d: rd, r: rr },
            _ => Add { d: rd, r: rr },
        },
        0x1 => match (word >> 10) & 3 {
            0 => Cpse { d: rd, r: rr },
            1 => Cp { d: rd, r: rr },
            2 => Sub { d: rd, r: rr },
            _ => Adc { d: rd, r: rr },
        },
        0x2 => match (word >> 10) & 3 {
            0 => And { d: rd, r: rr },
            1 => Eor { d: rd, r: rr },
            2 => Or { d: rd, r: rr },
            _ => Mov { d: rd, r: rr },
        },
        0x3 => { let (d, k) = reg_imm(word); Cpi { d, k } }
        0x4 => { let (d, k) = reg_imm(word); Sbci { d, k } }
        0x5 => { let (d, k) = reg_imm(word); Subi { d, k } }
        0x6 => { let (d, k) = reg_imm(word); Ori { d, k } }
        0x7 => { let (d, k) = reg_imm(word); Andi { d, k } }
        0x8 | 0xA => {
            // 10q0 qqsd dddd yqqq
            let q = ((((word >> 13) & 1) << 5) | (((word >> 10) & 3) << 3) | (word & 7)) as u8;
            let ptr = if word & 0x0008 != 0 { Ptr::Y } else { Ptr::Z };
            let mode = if q == 0 { Mode::Plain } else { Mode::Disp(q) };
            if word & 0x0200 != 0 {
                St { r: d5, ptr, mode }
            } else {
                Ld { d: d5, ptr, mode }
            }
        }
        0x9 => return decode_1001(word, next),
        0xB => {
            let a = ((((word >> 9) & 3) << 4) | (word & 0xF)) as u8 + 0x20;
            if word & 0x0800 == 0 { In { d: d5, a } } else { Out { a, r: d5 } }
        }
        0xC => Rjmp { k: sign_extend_12(word) },
        0xD => Rcall { k: sign_extend_12(word) },
        0xE => { let (d, k) = reg_imm(word); Ldi { d, k } }
        _ => decode_1111(word),
    };
    (inst, 1)
}

/// 1001 xxxx: loads/stores, one-operand ops, jumps, I/O bit ops, MUL.
fn decode_1001(word: u16, next: u16) -> (Instruction, u8) {
    use Instruction::*;

    let d5 = ((word >> 4) & 0x1F) as u8;
    let io_bit = || (((word >> 3) & 0x1F) as u8 + 0x20, (word & 7) as u8);

    let inst = match (word >> 8) & 0xF {
        0x0 | 0x1 => match word & 0xF {
            0x0 => return (Lds { d: d5, k: next }, 2),
            0x1 => Ld { d: d5, ptr: Ptr::Z, mode: Mode::PostInc },
            0x2 => Ld { d: d5, ptr: Ptr::Z, mode: Mode::PreDec },
            0x4 => Lpm { d: d5, inc: false },
            0x5 => Lpm { d: d5, inc: true },
            0x6 => Elpm { d: d5, inc: false },
            0x7 => Elpm { d: d5, inc: true },
            0x9 => Ld { d: d5, ptr: Ptr::Y, mode: Mode::PostInc },
            0xA => Ld { d: d5, ptr: Ptr::Y, mode: Mode::PreDec },
            0xC => Ld { d: d5, ptr: Ptr::X, mode: Mode::Plain },
            0xD => Ld { d: d5, ptr: Ptr::X, mode: Mode::PostInc },
            0xE => Ld { d: d5, ptr: Ptr::X, mode: Mode::PreDec },
            0xF => Pop { d: d5 },
            _ => Unknown(word),
        },
        0x2 | 0x3 => match word & 0xF {
            0x0 => return (Sts { k: next, r: d5 }, 2),
            0x1 => St { r: d5, ptr: Ptr::Z, mode: Mode::PostInc },
            0x2 => St { r: d5, ptr: Ptr::Z, mode: Mode::PreDec },
            0x9 => St { r: d5, ptr: Ptr::Y, mode: Mode::PostInc },
            0xA => St { r: d5, ptr: Ptr::Y, mode: Mode::PreDec },
            0xC => St { r: d5, ptr: Ptr::X, mode: Mode::Plain },
            0xD => St { r: d5, ptr: Ptr::X, mode: Mode::PostInc },
            0xE => St { r: d5, ptr: Ptr::X, mode: Mode::PreDec },
            0xF => Push { r: d5 },
            _ => Unknown(word),
        },
        0x4 | 0x5 => match word & 0xF {
            0x0 => Com { d: d5 },
            0x1 => Neg { d: d5 },
            0x2 => Swap { d: d5 },
            0x3 => Inc { d: d5 },
            0x5 => Asr { d: d5 },
            0x6 => Lsr { d: d5 },
            0x7 => Ror { d: d5 },
            0x8 => decode_misc(word),
            0x9 => match word {
                0x9409 => Ijmp,
                0x9419 => Eijmp,
                0x9509 => Icall,
                0x9519 => Eicall,
                _ => Unknown(word),
            },
            0xA => Dec { d: d5 },
            0xC..=0xF => {
                let k = ((((word as u32 >> 3) & 0x3E) | (word as u32 & 1)) << 16) | next as u32;
                let inst = if word & 0x2 == 0 { Jmp { k } } else { Call { k } };
                return (inst, 2);
            }
            _ => Unknown(word),
        },
        0x6 | 0x7 => {
            let d = ((((word >> 4) & 3) * 2) + 24) as u8;
            let k = ((((word >> 6) & 3) << 4) | (word & 0xF)) as u8;
            if word & 0x0100 == 0 { Adiw { d, k } } else { Sbiw { d, k } }
        }
        0x8 => { let (a, b) = io_bit(); Cbi { a, b } }
        0x9 => { let (a, b) = io_bit(); Sbic { a, b } }
        0xA => { let (a, b) = io_bit(); Sbi { a, b } }
        0xB => { let (a, b) = io_bit(); Sbis { a, b } }
        _ => {
            let (d, r) = regs_5_5(word);
            Mul { d, r }
        }
    };
    (inst, 1)
}

/// 1001 010x xxxx 1000: SREG bit ops and zero-operand instructions.
fn decode_misc(word: u16) -> Instruction {
    use Instruction::*;

    if word & 0xFF8F == 0x9408 {
        return Bset { s: ((word >> 4) & 7) as u8 };
    }
    if word & 0xFF8F == 0x9488 {
        return Bclr { s: ((word >> 4) & 7) as u8 };
    }
    match word {
        0x9508 => Ret,
        0x9518 => Reti,
        0x9588 => Sleep,
        0x9598 => Break,
        0x95A8 => Wdr,
        0x95C8 => Lpm { d: 0, inc: false },
        0x95D8 => Elpm { d: 0, inc: false },
        0x95E8 => Spm,
        _ => Unknown(word),
    }
}

/// 1111 xxxx: conditional branches, BLD/BST, SBRC/SBRS.
fn decode_1111(word: u16) -> Instruction {
    use Instruction::*;

    let s = (word & 7) as u8;
    let reg = ((word >> 4) & 0x1F) as u8;
    match (word >> 9) & 7 {
        0 | 1 => Brbs { s, k: branch_offset(word) },
        2 | 3 => Brbc { s, k: branch_offset(word) },
        _ if word & 0x0008 != 0 => Unknown(word),
        4 => Bld { d: reg, b: s },
        5 => Bst { d: reg, b: s },
        6 => Sbrc { r: reg, b: s },
        _ => Sbrs { r: reg, b: s },
    }
}

// --- Operand field helpers ---

/// xxxx xxrd dddd rrrr
#[inline(always)]
fn regs_5_5(word: u16) -> (u8, u8) {
    let d = ((word >> 4) & 0x1F) as u8;
    let r = ((word & 0x0F) | ((word >> 5) & 0x10)) as u8;
    (d, r)
}

/// xxxx KKKK dddd KKKK, d in R16..R31
#[inline(always)]
fn reg_imm(word: u16) -> (u8, u8) {
    let d = ((word >> 4) & 0x0F) as u8 + 16;
    let k = (((word >> 4) & 0xF0) | (word & 0x0F)) as u8;
    (d, k)
}

#[inline(always)]
fn sign_extend_12(word: u16) -> i16 {
    ((word << 4) as i16) >> 4
}

/// 7-bit signed branch offset in bits 9:3.
#[inline(always)]
fn branch_offset(word: u16) -> i8 {
    (((word >> 3) & 0x7F) as u8 as i8) << 1 >> 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use Instruction::*;

    #[test]
    fn test_decode_nop_and_unknown() {
        assert_eq!(decode(0x0000, 0), (Nop, 1));
        assert_eq!(decode(0xFFFF, 0), (Unknown(0xFFFF), 1));
        assert_eq!(decode(0x0001, 0), (Unknown(0x0001), 1));
    }

    #[test]
    fn test_decode_ldi() {
        // LDI R16, 0xFF
        assert_eq!(decode(0xEF0F, 0), (Ldi { d: 16, k: 0xFF }, 1));
    }

    #[test]
    fn test_decode_rjmp() {
        assert_eq!(decode(0xC000, 0).0, Rjmp { k: 0 });
        assert_eq!(decode(0xCFFF, 0).0, Rjmp { k: -1 });
        assert_eq!(decode(0xD800, 0).0, Rcall { k: -2048 });
    }

    #[test]
    fn test_decode_jmp_call() {
        assert_eq!(decode(0x940C, 0x0034), (Jmp { k: 0x34 }, 2));
        assert_eq!(decode(0x940E, 0x1234), (Call { k: 0x1234 }, 2));
        // k bit 16 lives in bit 0 of the first word
        assert_eq!(decode(0x940D, 0x0000), (Jmp { k: 0x10000 }, 2));
        assert!(is_two_word(0x940C) && is_two_word(0x940F));
        assert!(is_two_word(0x9000) && is_two_word(0x93F0));
        assert!(!is_two_word(0x9001) && !is_two_word(0x9409));
    }

    #[test]
    fn test_decode_add_and_friends() {
        assert_eq!(decode(0x0C01, 0).0, Add { d: 0, r: 1 });
        // ADD R31, R31 (LSL)
        assert_eq!(decode(0x0FFF, 0).0, Add { d: 31, r: 31 });
        assert_eq!(decode(0x1F01, 0).0, Adc { d: 16, r: 17 });
        // ADC R17, R17 (ROL)
        assert_eq!(decode(0x1F11, 0).0, Adc { d: 17, r: 17 });
        assert_eq!(decode(0x2411, 0).0, Eor { d: 1, r: 1 });
        assert_eq!(decode(0x0145, 0).0, Movw { d: 8, r: 10 });
    }

    #[test]
    fn test_decode_multiply_group() {
        assert_eq!(decode(0x9C23, 0).0, Mul { d: 2, r: 3 });
        assert_eq!(decode(0x0223, 0).0, Muls { d: 18, r: 19 });
        assert_eq!(decode(0x0312, 0).0, Mulsu { d: 17, r: 18 });
        assert_eq!(decode(0x031A, 0).0, Fmul { d: 17, r: 18 });
        assert_eq!(decode(0x0392, 0).0, Fmuls { d: 17, r: 18 });
        assert_eq!(decode(0x039A, 0).0, Fmulsu { d: 17, r: 18 });
    }

    #[test]
    fn test_decode_push_pop() {
        assert_eq!(decode(0x920F, 0).0, Push { r: 0 });
        assert_eq!(decode(0x900F, 0).0, Pop { d: 0 });
    }

    #[test]
    fn test_decode_std_ldd() {
        // STD Y+1, R0
        assert_eq!(decode(0x8209, 0).0, St { r: 0, ptr: Ptr::Y, mode: Mode::Disp(1) });
        // LDD R0, Y+1
        assert_eq!(decode(0x8009, 0).0, Ld { d: 0, ptr: Ptr::Y, mode: Mode::Disp(1) });
        // STD Z+1, R0
        assert_eq!(decode(0x8201, 0).0, St { r: 0, ptr: Ptr::Z, mode: Mode::Disp(1) });
        // STD Y+63, R31
        assert_eq!(decode(0xAFFF, 0).0, St { r: 31, ptr: Ptr::Y, mode: Mode::Disp(63) });
        // LD R24, Z
        assert_eq!(decode(0x8180, 0).0, Ld { d: 24, ptr: Ptr::Z, mode: Mode::Plain });
    }

    #[test]
    fn test_decode_pointer_modes() {
        assert_eq!(decode(0x918D, 0).0, Ld { d: 24, ptr: Ptr::X, mode: Mode::PostInc });
        assert_eq!(decode(0x93EE, 0).0, St { r: 30, ptr: Ptr::X, mode: Mode::PreDec });
        assert_eq!(decode(0x9201, 0).0, St { r: 0, ptr: Ptr::Z, mode: Mode::PostInc });
        assert_eq!(decode(0x9005, 0).0, Lpm { d: 0, inc: true });
        assert_eq!(decode(0x95C8, 0).0, Lpm { d: 0, inc: false });
        assert_eq!(decode(0x9007, 0).0, Elpm { d: 0, inc: true });
    }

    #[test]
    fn test_decode_lds_sts() {
        assert_eq!(decode(0x9180, 0x0100), (Lds { d: 24, k: 0x100 }, 2));
        assert_eq!(decode(0x9380, 0x0100), (Sts { k: 0x100, r: 24 }, 2));
    }

    #[test]
    fn test_decode_adiw_sbiw() {
        assert_eq!(decode(0x9611, 0).0, Adiw { d: 26, k: 1 });
        assert_eq!(decode(0x96F0, 0).0, Adiw { d: 30, k: 48 });
        assert_eq!(decode(0x9721, 0).0, Sbiw { d: 28, k: 1 });
        assert_eq!(decode(0x97CF, 0).0, Sbiw { d: 24, k: 63 });
    }

    #[test]
    fn test_decode_sreg_ops() {
        assert_eq!(decode(0x9478, 0).0, Bset { s: 7 }); // SEI
        assert_eq!(decode(0x94F8, 0).0, Bclr { s: 7 }); // CLI
        assert_eq!(decode(0x9408, 0).0, Bset { s: 0 }); // SEC
        assert_eq!(decode(0x9498, 0).0, Bclr { s: 1 }); // CLZ
        assert_eq!(decode(0x9488, 0).0, Bclr { s: 0 }); // CLC
        assert_eq!(decode(0x9468, 0).0, Bset { s: 6 }); // SET
    }

    #[test]
    fn test_decode_control() {
        assert_eq!(decode(0x9508, 0).0, Ret);
        assert_eq!(decode(0x9518, 0).0, Reti);
        assert_eq!(decode(0x9588, 0).0, Sleep);
        assert_eq!(decode(0x9598, 0).0, Break);
        assert_eq!(decode(0x95A8, 0).0, Wdr);
        assert_eq!(decode(0x95E8, 0).0, Spm);
        assert_eq!(decode(0x9409, 0).0, Ijmp);
        assert_eq!(decode(0x9519, 0).0, Eicall);
    }

    #[test]
    fn test_decode_io() {
        // OUT 0x3F, R0 (SREG)
        assert_eq!(decode(0xBE0F, 0).0, Out { a: 0x5F, r: 0 });
        // IN R16, 0x3E (SPH)
        assert_eq!(decode(0xB70E, 0).0, In { d: 16, a: 0x5E });
        // SBI 0x05, 5 (PORTB bit 5 on mega328)
        assert_eq!(decode(0x9A2D, 0).0, Sbi { a: 0x25, b: 5 });
        assert_eq!(decode(0x9B9D, 0).0, Sbis { a: 0x33, b: 5 });
    }

    #[test]
    fn test_decode_branches_and_bits() {
        // BREQ .-2
        assert_eq!(decode(0xF3F1, 0).0, Brbs { s: 1, k: -2 });
        // BRNE .+4
        assert_eq!(decode(0xF411, 0).0, Brbc { s: 1, k: 2 });
        assert_eq!(decode(0xFD87, 0).0, Sbrc { r: 24, b: 7 });
        assert_eq!(decode(0xFB07, 0).0, Bst { d: 16, b: 7 });
        assert_eq!(decode(0xF807, 0).0, Bld { d: 0, b: 7 });
        assert_eq!(decode(0xF808, 0).0, Unknown(0xF808));
    }
}
