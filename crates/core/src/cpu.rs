//! AVR CPU core.
//!
//! [`Cpu`] holds only the engine's bookkeeping: program counter, cycle
//! and instruction counters, sleep state and the watchdog counter. The
//! register file, SREG and the stack pointer live in data memory, so every
//! instruction reads and writes them through [`Memory`](crate::Memory) and
//! the named I/O addresses. The execute loop runs on [`Avr`] to reach the
//! peripheral bus.
//!
//! Flag computation follows the AVR instruction set manual, including the
//! carry-chain behavior of SBC/SBCI/CPC where Z is only ever cleared so
//! multi-byte compares work.

use serde::{Deserialize, Serialize};

use crate::opcodes::{is_two_word, Instruction, Mode, Ptr};
use crate::regs::{BLBSET, PGERS, PGWRT, RWWSB, RWWSRE, SIGRD, SPMEN, WDE, WDIE, WDIF, WDP3, WDRF};
use crate::{Avr, SPH_ADDR, SPL_ADDR, SREG_ADDR, SREG_C, SREG_I, SREG_T};

/// Engine bookkeeping that is not memory mapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cpu {
    /// Program counter (word address)
    pub pc: u16,
    /// Address of the instruction currently executing
    pub fetch_pc: u16,
    /// Elapsed CPU cycles
    pub cycles: u64,
    /// Retired instructions
    pub instructions: u64,
    pub sleeping: bool,
    pub clock_hz: u32,
    /// Cycles since the last WDR
    pub watchdog: u64,
    /// Set by SEI/RETI: the next instruction runs before any interrupt
    pub(crate) irq_inhibit: bool,
    /// Extra cycles requested by peripherals or SPM during this instruction
    pub(crate) stall: u32,
    pub(crate) break_hit: bool,
}

impl Cpu {
    pub fn new(clock_hz: u32) -> Self {
        Cpu {
            pc: 0,
            fetch_pc: 0,
            cycles: 0,
            instructions: 0,
            sleeping: false,
            clock_hz,
            watchdog: 0,
            irq_inhibit: false,
            stall: 0,
            break_hit: false,
        }
    }
}

// --- Flag helpers ---
//
// Each takes the current SREG and returns the updated one.

/// ADD/ADC.
pub fn flags_add(sreg: u8, rd: u8, rr: u8, r: u8) -> u8 {
    let carries = (rd & rr) | (rr & !r) | (!r & rd);
    let h = (carries >> 3) & 1;
    let c = (carries >> 7) & 1;
    let v = (((rd & rr & !r) | (!rd & !rr & r)) >> 7) & 1;
    let n = r >> 7;
    let z = (r == 0) as u8;
    (sreg & 0b1100_0000) | (h << 5) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1) | c
}

/// SUB/SUBI/SBC/SBCI/CP/CPC/CPI/NEG.
///
/// With `keep_z` (the carry-in forms) a zero result leaves Z unchanged
/// instead of setting it.
pub fn flags_sub(sreg: u8, rd: u8, rr: u8, r: u8, keep_z: bool) -> u8 {
    let borrows = (!rd & rr) | (rr & r) | (r & !rd);
    let h = (borrows >> 3) & 1;
    let c = (borrows >> 7) & 1;
    let v = (((rd & !rr & !r) | (!rd & rr & r)) >> 7) & 1;
    let n = r >> 7;
    let z = match (r == 0, keep_z) {
        (false, _) => 0,
        (true, false) => 1,
        (true, true) => (sreg >> 1) & 1,
    };
    (sreg & 0b1100_0000) | (h << 5) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1) | c
}

/// AND/OR/EOR and immediates: V cleared, C and H kept.
pub fn flags_logic(sreg: u8, r: u8) -> u8 {
    let n = r >> 7;
    let z = (r == 0) as u8;
    (sreg & 0b1110_0001) | (n << 4) | (n << 2) | (z << 1)
}

/// LSR/ASR/ROR: C from the bit shifted out, V = N ^ C.
fn flags_shift(sreg: u8, rd: u8, r: u8) -> u8 {
    let c = rd & 1;
    let n = r >> 7;
    let v = n ^ c;
    let z = (r == 0) as u8;
    (sreg & 0b1110_0000) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1) | c
}

/// INC/DEC: C kept; V set on the signed wrap value.
fn flags_incdec(sreg: u8, r: u8, overflow_at: u8) -> u8 {
    let n = r >> 7;
    let v = (r == overflow_at) as u8;
    let z = (r == 0) as u8;
    (sreg & 0b1110_0001) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1)
}

/// ADIW/SBIW on the high-byte sign bits.
fn flags_word(sreg: u8, old: u16, r: u16, sub: bool) -> u8 {
    let rdh7 = (old >> 15) as u8;
    let r15 = (r >> 15) as u8;
    let (v, c) = if sub {
        (rdh7 & (r15 ^ 1), r15 & (rdh7 ^ 1))
    } else {
        ((rdh7 ^ 1) & r15, (r15 ^ 1) & rdh7)
    };
    let z = (r == 0) as u8;
    (sreg & 0b1110_0000) | ((r15 ^ v) << 4) | (v << 3) | (r15 << 2) | (z << 1) | c
}

// ---- Instruction execution ----

impl Avr {
    #[inline(always)]
    pub fn sreg(&self) -> u8 {
        self.mem.data[SREG_ADDR as usize]
    }

    #[inline(always)]
    pub fn set_sreg(&mut self, v: u8) {
        self.mem.data[SREG_ADDR as usize] = v;
    }

    #[inline(always)]
    pub fn flag(&self, bit: u8) -> bool {
        self.sreg() & (1 << bit) != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, bit: u8, v: bool) {
        let s = self.sreg();
        self.set_sreg(if v { s | (1 << bit) } else { s & !(1 << bit) });
    }

    /// Stack pointer from SPH:SPL.
    #[inline(always)]
    pub fn sp(&self) -> u16 {
        self.mem.data[SPL_ADDR as usize] as u16 | ((self.mem.data[SPH_ADDR as usize] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_sp(&mut self, v: u16) {
        self.mem.data[SPL_ADDR as usize] = v as u8;
        self.mem.data[SPH_ADDR as usize] = (v >> 8) as u8;
    }

    fn push_byte(&mut self, v: u8) {
        let sp = self.sp();
        self.write_data(sp, v);
        self.set_sp(sp.wrapping_sub(1));
    }

    fn pop_byte(&mut self) -> u8 {
        let sp = self.sp().wrapping_add(1);
        self.set_sp(sp);
        self.read_data(sp)
    }

    /// Push a return address; the high byte ends up at the lower address.
    pub(crate) fn push_word(&mut self, v: u16) {
        self.push_byte(v as u8);
        self.push_byte((v >> 8) as u8);
    }

    pub(crate) fn pop_word(&mut self) -> u16 {
        let hi = self.pop_byte();
        let lo = self.pop_byte();
        (hi as u16) << 8 | lo as u16
    }

    /// Whether this model has the instruction at all.
    fn implements(&self, inst: &Instruction) -> bool {
        use Instruction::*;
        let f = &self.variant.features;
        match inst {
            Mul { .. } | Muls { .. } | Mulsu { .. } | Fmul { .. } | Fmuls { .. } | Fmulsu { .. } => f.mul,
            Jmp { .. } | Call { .. } => f.jmp_call,
            Elpm { .. } => f.elpm && self.variant.rampz.is_some(),
            Spm => f.spm_page_words > 0 && self.variant.spmcsr.is_some(),
            // No supported model has EIND
            Eijmp | Eicall => false,
            Unknown(_) => false,
            _ => true,
        }
    }

    /// Skip the instruction at PC. Returns the number of words skipped.
    fn skip_next(&mut self) -> u8 {
        let next = self.mem.program_word(self.cpu.pc as usize).unwrap_or(0);
        let words = if is_two_word(next) { 2 } else { 1 };
        self.cpu.pc = self.cpu.pc.wrapping_add(words);
        words as u8
    }

    fn pointer(&self, ptr: Ptr) -> u16 {
        match ptr {
            Ptr::X => self.mem.x(),
            Ptr::Y => self.mem.y(),
            Ptr::Z => self.mem.z(),
        }
    }

    fn set_pointer(&mut self, ptr: Ptr, v: u16) {
        match ptr {
            Ptr::X => self.mem.set_x(v),
            Ptr::Y => self.mem.set_y(v),
            Ptr::Z => self.mem.set_z(v),
        }
    }

    /// Effective address of LD/ST, applying the pointer update.
    fn indirect(&mut self, ptr: Ptr, mode: Mode) -> u16 {
        let p = self.pointer(ptr);
        match mode {
            Mode::Plain => p,
            Mode::Disp(q) => p.wrapping_add(q as u16),
            Mode::PostInc => {
                self.set_pointer(ptr, p.wrapping_add(1));
                p
            }
            Mode::PreDec => {
                let a = p.wrapping_sub(1);
                self.set_pointer(ptr, a);
                a
            }
        }
    }

    fn alu_add(&mut self, d: u8, rr: u8, carry: bool) {
        let rd = self.mem.reg(d);
        let c = if carry { self.sreg() & 1 } else { 0 };
        let r = rd.wrapping_add(rr).wrapping_add(c);
        self.mem.set_reg(d, r);
        self.set_sreg(flags_add(self.sreg(), rd, rr, r));
    }

    /// Subtract or compare. Flags use the original operand; the carry-in
    /// forms only ever clear Z.
    fn alu_sub(&mut self, d: u8, rr: u8, carry: bool, store: bool) {
        let rd = self.mem.reg(d);
        let c = if carry { self.sreg() & 1 } else { 0 };
        let r = rd.wrapping_sub(rr).wrapping_sub(c);
        if store {
            self.mem.set_reg(d, r);
        }
        self.set_sreg(flags_sub(self.sreg(), rd, rr, r, carry));
    }

    fn alu_logic(&mut self, d: u8, r: u8) {
        self.mem.set_reg(d, r);
        self.set_sreg(flags_logic(self.sreg(), r));
    }

    fn shift(&mut self, d: u8, r: u8) {
        let rd = self.mem.reg(d);
        self.mem.set_reg(d, r);
        self.set_sreg(flags_shift(self.sreg(), rd, r));
    }

    /// MUL family into R1:R0. C is bit 15 of the product before the
    /// fractional shift.
    fn multiply(&mut self, d: u8, r: u8, signed_d: bool, signed_r: bool, fractional: bool) {
        let operand = |v: u8, signed: bool| if signed { v as i8 as i32 } else { v as i32 };
        let product = (operand(self.mem.reg(d), signed_d) * operand(self.mem.reg(r), signed_r)) as u16;
        let res = if fractional { product << 1 } else { product };
        self.mem.set_reg_word(0, res);
        let c = (product >> 15) as u8;
        let z = (res == 0) as u8;
        self.set_sreg((self.sreg() & 0b1111_1100) | (z << 1) | c);
    }

    /// Program-memory byte for LPM/ELPM, or a signature byte while
    /// SPMCSR has SIGRD armed.
    fn lpm_byte(&mut self, addr: u32) -> u8 {
        if let Some(csr) = self.variant.spmcsr {
            let armed = (1 << SIGRD) | (1 << SPMEN);
            let v = self.mem.data[csr as usize];
            if v & armed == armed {
                self.mem.data[csr as usize] = v & !armed;
                return match addr {
                    0 => self.variant.signature[0],
                    2 => self.variant.signature[1],
                    4 => self.variant.signature[2],
                    _ => 0xFF,
                };
            }
        }
        self.mem.read_flash_byte(addr)
    }

    fn rampz(&self) -> u32 {
        self.variant.rampz.map_or(0, |a| self.mem.data[a as usize] as u32)
    }

    /// Execute a decoded instruction and return its cycle cost.
    ///
    /// PC is advanced past the instruction first; jumps and branches then
    /// overwrite or offset it. Instructions the model lacks run as a
    /// one-word, one-cycle no-op.
    pub fn execute_inst(&mut self, inst: Instruction, size: u8) -> u8 {
        use Instruction::*;

        if !self.implements(&inst) {
            log::debug!(
                "illegal instruction {:?} at 0x{:04X} on {}",
                inst,
                self.cpu.pc as u32 * 2,
                self.variant.name
            );
            self.cpu.pc = self.cpu.pc.wrapping_add(1);
            return 1;
        }
        self.cpu.pc = self.cpu.pc.wrapping_add(size as u16);

        match inst {
            Nop => 1,

            // -- Arithmetic --
            Add { d, r } => { let rr = self.mem.reg(r); self.alu_add(d, rr, false); 1 }
            Adc { d, r } => { let rr = self.mem.reg(r); self.alu_add(d, rr, true); 1 }
            Sub { d, r } => { let rr = self.mem.reg(r); self.alu_sub(d, rr, false, true); 1 }
            Subi { d, k } => { self.alu_sub(d, k, false, true); 1 }
            Sbc { d, r } => { let rr = self.mem.reg(r); self.alu_sub(d, rr, true, true); 1 }
            Sbci { d, k } => { self.alu_sub(d, k, true, true); 1 }
            And { d, r } => { let v = self.mem.reg(d) & self.mem.reg(r); self.alu_logic(d, v); 1 }
            Andi { d, k } => { let v = self.mem.reg(d) & k; self.alu_logic(d, v); 1 }
            Or { d, r } => { let v = self.mem.reg(d) | self.mem.reg(r); self.alu_logic(d, v); 1 }
            Ori { d, k } => { let v = self.mem.reg(d) | k; self.alu_logic(d, v); 1 }
            Eor { d, r } => { let v = self.mem.reg(d) ^ self.mem.reg(r); self.alu_logic(d, v); 1 }
            Com { d } => {
                let r = !self.mem.reg(d);
                self.mem.set_reg(d, r);
                let s = flags_logic(self.sreg(), r) | (1 << SREG_C);
                self.set_sreg(s);
                1
            }
            Neg { d } => {
                let rd = self.mem.reg(d);
                let r = 0u8.wrapping_sub(rd);
                self.mem.set_reg(d, r);
                self.set_sreg(flags_sub(self.sreg(), 0, rd, r, false));
                1
            }
            Inc { d } => {
                let r = self.mem.reg(d).wrapping_add(1);
                self.mem.set_reg(d, r);
                self.set_sreg(flags_incdec(self.sreg(), r, 0x80));
                1
            }
            Dec { d } => {
                let r = self.mem.reg(d).wrapping_sub(1);
                self.mem.set_reg(d, r);
                self.set_sreg(flags_incdec(self.sreg(), r, 0x7F));
                1
            }
            Adiw { d, k } => {
                let old = self.mem.reg_word(d);
                let r = old.wrapping_add(k as u16);
                self.mem.set_reg_word(d, r);
                self.set_sreg(flags_word(self.sreg(), old, r, false));
                2
            }
            Sbiw { d, k } => {
                let old = self.mem.reg_word(d);
                let r = old.wrapping_sub(k as u16);
                self.mem.set_reg_word(d, r);
                self.set_sreg(flags_word(self.sreg(), old, r, true));
                2
            }
            Mul { d, r } => { self.multiply(d, r, false, false, false); 2 }
            Muls { d, r } => { self.multiply(d, r, true, true, false); 2 }
            Mulsu { d, r } => { self.multiply(d, r, true, false, false); 2 }
            Fmul { d, r } => { self.multiply(d, r, false, false, true); 2 }
            Fmuls { d, r } => { self.multiply(d, r, true, true, true); 2 }
            Fmulsu { d, r } => { self.multiply(d, r, true, false, true); 2 }

            // -- Compare --
            Cp { d, r } => { let rr = self.mem.reg(r); self.alu_sub(d, rr, false, false); 1 }
            Cpc { d, r } => { let rr = self.mem.reg(r); self.alu_sub(d, rr, true, false); 1 }
            Cpi { d, k } => { self.alu_sub(d, k, false, false); 1 }
            Cpse { d, r } => {
                if self.mem.reg(d) == self.mem.reg(r) { 1 + self.skip_next() } else { 1 }
            }

            // -- Data transfer --
            Mov { d, r } => { let v = self.mem.reg(r); self.mem.set_reg(d, v); 1 }
            Movw { d, r } => { let v = self.mem.reg_word(r); self.mem.set_reg_word(d, v); 1 }
            Ldi { d, k } => { self.mem.set_reg(d, k); 1 }
            Lds { d, k } => { let v = self.read_data(k); self.mem.set_reg(d, v); 2 }
            Sts { k, r } => { let v = self.mem.reg(r); self.write_data(k, v); 2 }
            Ld { d, ptr, mode } => {
                let a = self.indirect(ptr, mode);
                let v = self.read_data(a);
                self.mem.set_reg(d, v);
                if mode == Mode::PreDec { 3 } else { 2 }
            }
            St { r, ptr, mode } => {
                let v = self.mem.reg(r);
                let a = self.indirect(ptr, mode);
                self.write_data(a, v);
                2
            }
            Push { r } => { let v = self.mem.reg(r); self.push_byte(v); 2 }
            Pop { d } => { let v = self.pop_byte(); self.mem.set_reg(d, v); 2 }
            Lpm { d, inc } => {
                let z = self.mem.z();
                let v = self.lpm_byte(z as u32);
                self.mem.set_reg(d, v);
                if inc {
                    self.mem.set_z(z.wrapping_add(1));
                }
                3
            }
            Elpm { d, inc } => {
                let addr = (self.rampz() << 16) | self.mem.z() as u32;
                let v = self.lpm_byte(addr);
                self.mem.set_reg(d, v);
                if inc {
                    let next = addr.wrapping_add(1);
                    self.mem.set_z(next as u16);
                    if let Some(rampz) = self.variant.rampz {
                        self.mem.data[rampz as usize] = (next >> 16) as u8;
                    }
                }
                3
            }
            Spm => { self.spm(); 1 }
            In { d, a } => { let v = self.read_data(a as u16); self.mem.set_reg(d, v); 1 }
            Out { a, r } => { let v = self.mem.reg(r); self.write_data(a as u16, v); 1 }

            // -- Bit and shift --
            Lsr { d } => { let r = self.mem.reg(d) >> 1; self.shift(d, r); 1 }
            Asr { d } => { let rd = self.mem.reg(d); self.shift(d, (rd >> 1) | (rd & 0x80)); 1 }
            Ror { d } => {
                let rd = self.mem.reg(d);
                let c = (self.sreg() & 1) << 7;
                self.shift(d, (rd >> 1) | c);
                1
            }
            Swap { d } => { let v = self.mem.reg(d).rotate_left(4); self.mem.set_reg(d, v); 1 }
            Bst { d, b } => { let t = self.mem.reg(d) & (1 << b) != 0; self.set_flag(SREG_T, t); 1 }
            Bld { d, b } => {
                let v = self.mem.reg(d);
                let v = if self.flag(SREG_T) { v | (1 << b) } else { v & !(1 << b) };
                self.mem.set_reg(d, v);
                1
            }
            Sbi { a, b } => { let v = self.read_data(a as u16); self.write_data(a as u16, v | (1 << b)); 2 }
            Cbi { a, b } => { let v = self.read_data(a as u16); self.write_data(a as u16, v & !(1 << b)); 2 }
            Bset { s } => {
                if s == SREG_I && !self.flag(SREG_I) {
                    self.cpu.irq_inhibit = true;
                }
                self.set_flag(s, true);
                1
            }
            Bclr { s } => { self.set_flag(s, false); 1 }

            // -- Control flow --
            Rjmp { k } => { self.cpu.pc = self.cpu.pc.wrapping_add(k as u16); 2 }
            Rcall { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = ret.wrapping_add(k as u16);
                3
            }
            Jmp { k } => { self.cpu.pc = k as u16; 3 }
            Call { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = k as u16;
                4
            }
            Ijmp => { self.cpu.pc = self.mem.z(); 2 }
            Icall => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = self.mem.z();
                3
            }
            Ret => { self.cpu.pc = self.pop_word(); 4 }
            Reti => {
                self.cpu.pc = self.pop_word();
                self.set_flag(SREG_I, true);
                self.cpu.irq_inhibit = true;
                4
            }
            Sbrc { r, b } => {
                if self.mem.reg(r) & (1 << b) == 0 { 1 + self.skip_next() } else { 1 }
            }
            Sbrs { r, b } => {
                if self.mem.reg(r) & (1 << b) != 0 { 1 + self.skip_next() } else { 1 }
            }
            Sbic { a, b } => {
                if self.read_data(a as u16) & (1 << b) == 0 { 1 + self.skip_next() } else { 1 }
            }
            Sbis { a, b } => {
                if self.read_data(a as u16) & (1 << b) != 0 { 1 + self.skip_next() } else { 1 }
            }
            Brbs { s, k } => {
                if self.flag(s) { self.cpu.pc = self.cpu.pc.wrapping_add(k as i16 as u16); 2 } else { 1 }
            }
            Brbc { s, k } => {
                if !self.flag(s) { self.cpu.pc = self.cpu.pc.wrapping_add(k as i16 as u16); 2 } else { 1 }
            }

            // -- MCU control --
            Sleep => {
                if self.variant.sleep_enable.is_set(&self.mem.data) {
                    self.cpu.sleeping = true;
                }
                1
            }
            Wdr => { self.cpu.watchdog = 0; 1 }
            Break => { self.cpu.break_hit = true; 1 }

            // Filtered by `implements`
            Eijmp | Eicall | Unknown(_) => 1,
        }
    }

    /// Self-programming: page buffer fill, page erase, page write and
    /// RWW re-enable, selected by SPMCSR.
    fn spm(&mut self) {
        let Some(csr_addr) = self.variant.spmcsr else { return };
        let csr = self.mem.data[csr_addr as usize];
        let page_words = self.variant.features.spm_page_words as usize;
        let word = ((self.rampz() << 16) | self.mem.z() as u32) as usize / 2;
        let page = word & !(page_words - 1);
        // Erase and write both take ~4.5 ms
        let busy = (self.cpu.clock_hz as u64 * 45 / 10_000) as u32;

        match csr & 0x1F {
            0x01 => {
                let v = self.mem.reg_word(0);
                self.spm_buffer[word % page_words] = v;
            }
            0x03 => {
                for w in self.mem.flash.iter_mut().skip(page).take(page_words) {
                    *w = 0xFFFF;
                }
                self.mem.data[csr_addr as usize] |= 1 << RWWSB;
                self.cpu.stall += busy;
            }
            0x05 => {
                for (i, v) in self.spm_buffer.iter_mut().enumerate() {
                    if let Some(w) = self.mem.flash.get_mut(page + i) {
                        *w = *v;
                    }
                    *v = 0xFFFF;
                }
                self.mem.data[csr_addr as usize] |= 1 << RWWSB;
                self.cpu.stall += busy;
            }
            0x11 => {
                self.mem.data[csr_addr as usize] &= !(1 << RWWSB);
            }
            other => {
                log::warn!("ignoring SPM with SPMCSR=0x{:02X} at 0x{:04X}", other, self.cpu.fetch_pc as u32 * 2);
            }
        }
        let mask = (1 << SPMEN) | (1 << PGERS) | (1 << PGWRT) | (1 << RWWSRE) | (1 << SIGRD) | (1 << BLBSET);
        self.mem.data[csr_addr as usize] &= !mask;
    }

    /// Interrupt entry: push PC, clear I, run the acknowledge hook and
    /// jump to the vector. Returns the cycles consumed.
    pub(crate) fn enter_interrupt(&mut self, vector: u8) -> u64 {
        let woke = std::mem::replace(&mut self.cpu.sleeping, false);
        let ret = self.cpu.pc;
        self.push_word(ret);
        self.set_flag(SREG_I, false);

        if let Some(id) = self.irq.begin_dispatch(vector) {
            self.acknowledge(id, vector);
        }
        self.watchdog_acknowledge(vector);

        self.cpu.pc = self.variant.vector_address(vector);
        log::debug!(
            "interrupt {} ({}) from 0x{:04X}",
            vector,
            self.variant.vector_name(vector).unwrap_or("?"),
            ret as u32 * 2
        );
        if woke { 8 } else { 4 }
    }

    /// Watchdog timeout period in CPU cycles for the given control byte.
    fn watchdog_period(&self, csr: u8) -> u64 {
        let wdp = (csr & 0x07) as u32 | if csr & (1 << WDP3) != 0 { 8 } else { 0 };
        let osc_cycles = 2048u64 << wdp.min(9);
        self.cpu.clock_hz as u64 * osc_cycles / 128_000
    }

    /// Advance the watchdog by `cycles`.
    pub(crate) fn watchdog_tick(&mut self, cycles: u64) {
        let Some(wd) = self.variant.watchdog else { return };
        let addr = wd.wdtcsr as usize;
        let csr = self.mem.data[addr];
        let interrupt_mode = wd.vector.is_some() && csr & (1 << WDIE) != 0;

        if interrupt_mode || csr & (1 << WDE) != 0 {
            self.cpu.watchdog += cycles;
            if self.cpu.watchdog >= self.watchdog_period(csr) {
                self.cpu.watchdog = 0;
                if interrupt_mode && csr & (1 << WDIF) == 0 {
                    self.mem.data[addr] |= 1 << WDIF;
                } else if csr & (1 << WDE) != 0 {
                    self.watchdog_reset();
                    return;
                }
            }
        }

        if let Some(v) = wd.vector {
            let csr = self.mem.data[addr];
            if csr & (1 << WDIF) != 0 && csr & (1 << WDIE) != 0 {
                self.irq.raise(v);
            } else {
                self.irq.clear(v);
            }
        }
    }

    /// Entering the WDT vector clears WDIF; in interrupt-and-reset mode it
    /// also clears WDIE so the next timeout resets.
    fn watchdog_acknowledge(&mut self, vector: u8) {
        let Some(wd) = self.variant.watchdog else { return };
        if wd.vector != Some(vector) {
            return;
        }
        let csr = &mut self.mem.data[wd.wdtcsr as usize];
        *csr &= !(1 << WDIF);
        if *csr & (1 << WDE) != 0 {
            *csr &= !(1 << WDIE);
        }
        self.irq.clear(vector);
    }

    fn watchdog_reset(&mut self) {
        log::info!("watchdog reset at 0x{:04X}", self.cpu.pc as u32 * 2);
        let mcusr = self.mem.data[self.variant.mcusr as usize];
        self.reset();
        self.mem.data[self.variant.mcusr as usize] = mcusr | (1 << WDRF);
        if let Some(wd) = self.variant.watchdog {
            self.mem.data[wd.wdtcsr as usize] = 1 << WDE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::Instruction;
    use crate::{MachineConfig, SREG_Z};

    fn avr(mcu: &str) -> Avr {
        Avr::new(&MachineConfig::new(mcu)).unwrap()
    }

    #[test]
    fn test_add() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(0, 10);
        a.mem.set_reg(1, 20);
        a.execute_inst(Instruction::Add { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 30);
    }

    #[test]
    fn test_add_overflow() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(0, 200);
        a.mem.set_reg(1, 100);
        a.execute_inst(Instruction::Add { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 44);
        assert!(a.flag(SREG_C));
        // SREG is only in data memory
        assert_eq!(a.mem.data[0x5F] & 1, 1);
    }

    #[test]
    fn test_signed_overflow_flags() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(16, 0x7F);
        a.execute_inst(Instruction::Subi { d: 16, k: 0xFF }, 1);
        // 0x7F - (-1) = 0x80: V and N set, S = N ^ V = 0
        assert_eq!(a.mem.reg(16), 0x80);
        assert_eq!(a.sreg() & 0b0001_1100, 0b0000_1100);
    }

    #[test]
    fn test_sub() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(0, 30);
        a.mem.set_reg(1, 20);
        a.execute_inst(Instruction::Sub { d: 0, r: 1 }, 1);
        assert_eq!(a.mem.reg(0), 10);
        assert!(!a.flag(SREG_C));
    }

    #[test]
    fn test_push_pop() {
        let mut a = avr("atmega328p");
        let sp0 = a.sp();
        assert_eq!(sp0, 0x08FF);
        a.mem.set_reg(5, 0x42);
        a.execute_inst(Instruction::Push { r: 5 }, 1);
        assert_eq!(a.sp(), sp0 - 1);
        assert_eq!(a.mem.data[sp0 as usize], 0x42);
        a.execute_inst(Instruction::Pop { d: 10 }, 1);
        assert_eq!(a.sp(), sp0);
        assert_eq!(a.mem.reg(10), 0x42);
    }

    #[test]
    fn test_rcall_ret() {
        let mut a = avr("atmega328p");
        a.cpu.pc = 0x120;
        let sp0 = a.sp();
        assert_eq!(a.execute_inst(Instruction::Rcall { k: 5 }, 1), 3);
        assert_eq!(a.cpu.pc, 0x126);
        // Return address 0x0121, high byte at the lower address
        assert_eq!(a.mem.data[sp0 as usize - 1], 0x01);
        assert_eq!(a.mem.data[sp0 as usize], 0x21);
        a.execute_inst(Instruction::Ret, 1);
        assert_eq!(a.cpu.pc, 0x121);
        assert_eq!(a.sp(), sp0);
    }

    #[test]
    fn test_branch_taken() {
        let mut a = avr("atmega328p");
        a.cpu.pc = 0x50;
        a.set_flag(SREG_Z, true);
        let c = a.execute_inst(Instruction::Brbs { s: SREG_Z, k: 3 }, 1);
        assert_eq!(c, 2);
        assert_eq!(a.cpu.pc, 0x54);
    }

    #[test]
    fn test_branch_not_taken() {
        let mut a = avr("atmega328p");
        a.cpu.pc = 0x50;
        a.set_flag(SREG_Z, false);
        let c = a.execute_inst(Instruction::Brbs { s: SREG_Z, k: 3 }, 1);
        assert_eq!(c, 1);
        assert_eq!(a.cpu.pc, 0x51);
    }

    #[test]
    fn test_skip_two_word_instruction() {
        let mut a = avr("atmega328p");
        // CPSE at 0, JMP at 1..2, NOP at 3
        a.mem.flash[1] = 0x940C;
        a.mem.flash[2] = 0x0000;
        a.mem.set_reg(4, 7);
        a.mem.set_reg(5, 7);
        let c = a.execute_inst(Instruction::Cpse { d: 4, r: 5 }, 1);
        assert_eq!(c, 3);
        assert_eq!(a.cpu.pc, 3);
    }

    #[test]
    fn test_lpm() {
        let mut a = avr("atmega328p");
        a.mem.flash[0x80] = 0x0042;
        a.mem.set_z(0x100);
        a.execute_inst(Instruction::Lpm { d: 5, inc: true }, 1);
        assert_eq!(a.mem.reg(5), 0x42);
        assert_eq!(a.mem.z(), 0x101);
    }

    #[test]
    fn test_signature_read() {
        let mut a = avr("atmega328p");
        a.mem.data[0x57] = (1 << SIGRD) | (1 << SPMEN);
        a.mem.set_z(2);
        a.execute_inst(Instruction::Lpm { d: 0, inc: false }, 1);
        assert_eq!(a.mem.reg(0), 0x95);
        assert_eq!(a.mem.data[0x57] & 0x21, 0);
    }

    #[test]
    fn test_elpm_uses_rampz() {
        let mut a = avr("atmega1284p");
        a.mem.flash[0x8000] = 0xBEEF;
        a.mem.data[0x5B] = 1;
        a.mem.set_z(0x0000);
        a.execute_inst(Instruction::Elpm { d: 2, inc: true }, 1);
        assert_eq!(a.mem.reg(2), 0xEF);
        a.execute_inst(Instruction::Elpm { d: 3, inc: false }, 1);
        assert_eq!(a.mem.reg(3), 0xBE);
    }

    #[test]
    fn test_mul() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(2, 10);
        a.mem.set_reg(3, 20);
        a.execute_inst(Instruction::Mul { d: 2, r: 3 }, 1);
        assert_eq!(a.mem.reg(0), 0xC8);
        assert_eq!(a.mem.reg(1), 0x00);
    }

    #[test]
    fn test_fmul_carry_before_shift() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(16, 0xC0);
        a.mem.set_reg(17, 0xC0);
        // 0xC0 * 0xC0 = 0x9000, shifted 0x2000
        a.execute_inst(Instruction::Fmul { d: 16, r: 17 }, 1);
        assert_eq!(a.mem.reg_word(0), 0x2000);
        assert!(a.flag(SREG_C));
    }

    #[test]
    fn test_mul_missing_on_tiny() {
        let mut a = avr("attiny85");
        a.mem.set_reg(2, 10);
        a.mem.set_reg(3, 20);
        let c = a.execute_inst(Instruction::Mul { d: 2, r: 3 }, 1);
        assert_eq!(c, 1);
        assert_eq!(a.mem.reg_word(0), 0);
        assert_eq!(a.cpu.pc, 1);
    }

    #[test]
    fn test_adiw() {
        let mut a = avr("atmega328p");
        a.mem.set_z(0x1000);
        a.execute_inst(Instruction::Adiw { d: 30, k: 5 }, 1);
        assert_eq!(a.mem.z(), 0x1005);
    }

    #[test]
    fn test_io_in_out() {
        let mut a = avr("atmega328p");
        a.mem.set_reg(16, 0x42);
        a.execute_inst(Instruction::Out { a: 0x5F, r: 16 }, 1);
        assert_eq!(a.sreg(), 0x42);
        a.execute_inst(Instruction::In { d: 17, a: 0x5F }, 1);
        assert_eq!(a.mem.reg(17), 0x42);
    }

    #[test]
    fn test_sbci_carry_propagation() {
        // 32-bit increment via SUBI/SBCI chain on r27:r24 = 0x000000FF
        let mut a = avr("atmega328p");
        a.mem.set_reg(24, 0xFF);
        a.execute_inst(Instruction::Subi { d: 24, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 25, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 26, k: 0xFF }, 1);
        a.execute_inst(Instruction::Sbci { d: 27, k: 0xFF }, 1);
        assert_eq!(a.mem.reg(24), 0x00);
        assert_eq!(a.mem.reg(25), 0x01);
        assert_eq!(a.mem.reg(26), 0x00);
        assert_eq!(a.mem.reg(27), 0x00);
    }

    #[test]
    fn test_cpc_16bit_compare() {
        let mut a = avr("atmega328p");
        a.mem.set_reg_word(20, 0x0100);
        a.mem.set_reg_word(22, 0x00FF);
        a.execute_inst(Instruction::Cp { d: 20, r: 22 }, 1);
        a.execute_inst(Instruction::Cpc { d: 21, r: 23 }, 1);
        assert!(!a.flag(SREG_C), "0x0100 > 0x00FF");
        assert!(!a.flag(SREG_Z));

        a.mem.set_reg_word(22, 0x0100);
        a.execute_inst(Instruction::Cp { d: 20, r: 22 }, 1);
        a.execute_inst(Instruction::Cpc { d: 21, r: 23 }, 1);
        assert!(a.flag(SREG_Z));
    }

    #[test]
    fn test_sei_sets_inhibit() {
        let mut a = avr("atmega328p");
        a.execute_inst(Instruction::Bset { s: SREG_I }, 1);
        assert!(a.flag(SREG_I));
        assert!(a.cpu.irq_inhibit);
    }

    #[test]
    fn test_sleep_needs_enable_bit() {
        let mut a = avr("atmega328p");
        a.execute_inst(Instruction::Sleep, 1);
        assert!(!a.cpu.sleeping);
        a.mem.data[0x53] = 0x01;
        a.execute_inst(Instruction::Sleep, 1);
        assert!(a.cpu.sleeping);
    }

    #[test]
    fn test_spm_page_write() {
        let mut a = avr("atmega328p");
        a.mem.set_reg_word(0, 0x1234);
        a.mem.set_z(0x0082);
        a.mem.data[0x57] = 0x01;
        a.execute_inst(Instruction::Spm, 1);
        assert_eq!(a.mem.data[0x57], 0);

        a.mem.set_z(0x0080);
        a.mem.data[0x57] = 0x03;
        a.execute_inst(Instruction::Spm, 1);
        a.mem.data[0x57] = 0x05;
        a.execute_inst(Instruction::Spm, 1);
        assert_eq!(a.mem.flash[0x41], 0x1234);
        assert_eq!(a.mem.flash[0x40], 0xFFFF);
        assert_ne!(a.mem.data[0x57] & (1 << RWWSB), 0);
        assert!(a.cpu.stall > 0);
    }

    #[test]
    fn test_watchdog_interrupt_mode() {
        let mut a = avr("atmega328p");
        a.mem.data[0x60] = 1 << WDIE;
        let period = a.watchdog_period(a.mem.data[0x60]);
        assert_eq!(period, 16_000_000 * 2048 / 128_000);
        a.watchdog_tick(period);
        assert_ne!(a.mem.data[0x60] & (1 << WDIF), 0);
        assert!(a.irq.is_pending(6));
    }

    #[test]
    fn test_watchdog_system_reset() {
        let mut a = avr("atmega328p");
        a.cpu.pc = 0x200;
        a.mem.data[0x300] = 0xAA;
        a.mem.data[0x60] = 1 << WDE;
        let period = a.watchdog_period(a.mem.data[0x60]);
        a.watchdog_tick(period);
        assert_eq!(a.cpu.pc, 0);
        assert_ne!(a.mem.data[0x54] & (1 << WDRF), 0);
        assert_eq!(a.mem.data[0x300], 0xAA);
    }
}
