//! 8-bit Timer/Counter0.
//!
//! Supports Normal, CTC, Fast PWM and Phase Correct PWM with prescalers
//! 1/8/64/256/1024 (external clock selections stop the counter). Overflow
//! and compare-match flags live in TIFR and are cleared by writing a 1 or
//! by entering the matching vector.
//!
//! TCNT is kept in data memory, so firmware writes take effect at the
//! next timer tick. In the PWM modes OCRx writes are double-buffered and
//! latched at TOP.

use std::any::Any;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::dispatch::{Attach, IoContext, Peripheral};
use crate::error::{DispatchError, SaveStateError};
use crate::variant::{Timer8Addrs, TimerControl};

const PRESCALE: [u32; 8] = [0, 1, 8, 64, 256, 1024, 0, 0];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TimerState {
    /// CPU cycles since the last timer tick
    div: u32,
    /// Counting down (phase correct only)
    down: bool,
    /// Active compare values
    ocra: u8,
    ocrb: u8,
    /// TIFR bits owned by this timer
    flags: u8,
    overflows: u64,
}

pub struct Timer8 {
    addrs: Timer8Addrs,
    st: TimerState,
}

impl Timer8 {
    pub fn new(addrs: Timer8Addrs) -> Self {
        Timer8 { addrs, st: TimerState::default() }
    }

    /// Number of overflows since reset.
    pub fn overflows(&self) -> u64 {
        self.st.overflows
    }

    fn cs(&self, io: &IoContext<'_>) -> u8 {
        match self.addrs.control {
            TimerControl::Split { tccrb, .. } => io.get(tccrb) & 0x07,
            TimerControl::Single { tccr } => io.get(tccr) & 0x07,
        }
    }

    /// WGM2:0
    fn mode(&self, io: &IoContext<'_>) -> u8 {
        match self.addrs.control {
            TimerControl::Split { tccra, tccrb } => (io.get(tccra) & 0x03) | ((io.get(tccrb) >> 1) & 0x04),
            TimerControl::Single { tccr } => {
                let v = io.get(tccr);
                ((v >> 6) & 0x01) | ((v >> 2) & 0x02)
            }
        }
    }

    fn is_pwm(mode: u8) -> bool {
        matches!(mode, 1 | 3 | 5 | 7)
    }

    fn top(&self, mode: u8) -> u8 {
        match mode {
            2 | 5 | 7 => self.st.ocra,
            _ => 0xFF,
        }
    }

    /// TIFR bits belonging to this timer; the rest may be another timer's.
    fn owned(&self) -> u8 {
        let a = &self.addrs;
        let mut mask = 1 << a.tov_bit;
        if a.ocra.is_some() {
            mask |= 1 << a.ocfa_bit;
        }
        if a.ocrb.is_some() {
            mask |= 1 << a.ocfb_bit;
        }
        mask
    }

    fn publish_flags(&self, io: &mut IoContext<'_>) {
        let owned = self.owned();
        let other = io.get(self.addrs.tifr) & !owned;
        io.set(self.addrs.tifr, other | (self.st.flags & owned));
    }

    fn flag(&mut self, bit: u8, io: &mut IoContext<'_>) {
        self.st.flags |= 1 << bit;
        self.publish_flags(io);
    }

    fn latch_ocr(&mut self, io: &IoContext<'_>) {
        if let Some(a) = self.addrs.ocra {
            self.st.ocra = io.get(a);
        }
        if let Some(b) = self.addrs.ocrb {
            self.st.ocrb = io.get(b);
        }
    }

    fn compare(&mut self, tcnt: u8, io: &mut IoContext<'_>) {
        if self.addrs.ocra.is_some() && tcnt == self.st.ocra {
            self.flag(self.addrs.ocfa_bit, io);
        }
        if self.addrs.ocrb.is_some() && tcnt == self.st.ocrb {
            self.flag(self.addrs.ocfb_bit, io);
        }
    }

    fn tick(&mut self, io: &mut IoContext<'_>) {
        let mode = self.mode(io);
        let top = self.top(mode);
        let mut tcnt = io.get(self.addrs.tcnt);

        if matches!(mode, 1 | 5) {
            // Phase correct: up to TOP, down to BOTTOM
            if self.st.down {
                tcnt = tcnt.wrapping_sub(1);
                if tcnt == 0 {
                    self.st.down = false;
                    self.st.overflows += 1;
                    self.flag(self.addrs.tov_bit, io);
                }
            } else if tcnt >= top {
                self.latch_ocr(io);
                self.st.down = true;
                tcnt = tcnt.wrapping_sub(1);
            } else {
                tcnt += 1;
            }
        } else if tcnt == top {
            tcnt = 0;
            // CTC sets TOV only when TOP is MAX
            if mode != 2 || top == 0xFF {
                self.st.overflows += 1;
                self.flag(self.addrs.tov_bit, io);
            }
            if Self::is_pwm(mode) {
                self.latch_ocr(io);
            }
        } else {
            tcnt = tcnt.wrapping_add(1);
        }

        io.set(self.addrs.tcnt, tcnt);
        self.compare(tcnt, io);
    }

    fn update_irq(&self, io: &mut IoContext<'_>) {
        let mask = io.get(self.addrs.timsk);
        let on = |bit: u8| self.st.flags & mask & (1 << bit) != 0;
        io.set_candidate(self.addrs.ovf_vector, on(self.addrs.tov_bit));
        if let Some(v) = self.addrs.compa_vector {
            io.set_candidate(v, on(self.addrs.ocfa_bit));
        }
        if let Some(v) = self.addrs.compb_vector {
            io.set_candidate(v, on(self.addrs.ocfb_bit));
        }
    }
}

impl Peripheral for Timer8 {
    fn name(&self) -> &'static str {
        "timer0"
    }

    fn claimed(&self) -> RangeInclusive<u16> {
        let a = &self.addrs;
        let control = match a.control {
            TimerControl::Split { tccra, tccrb } => [tccra, tccrb],
            TimerControl::Single { tccr } => [tccr, tccr],
        };
        super::span(
            control
                .into_iter()
                .chain([a.tcnt, a.timsk, a.tifr])
                .chain(a.ocra)
                .chain(a.ocrb),
        )
    }

    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
        bus.writer(self.addrs.tifr)?;
        if let Some(a) = self.addrs.ocra {
            bus.writer(a)?;
        }
        if let Some(b) = self.addrs.ocrb {
            bus.writer(b)?;
        }
        bus.clock()?;
        bus.acknowledge(self.addrs.ovf_vector)?;
        for v in [self.addrs.compa_vector, self.addrs.compb_vector].into_iter().flatten() {
            bus.acknowledge(v)?;
        }
        Ok(())
    }

    fn reset(&mut self, io: &mut IoContext<'_>) {
        self.st = TimerState::default();
        io.set(self.addrs.tcnt, 0);
        self.publish_flags(io);
        self.update_irq(io);
    }

    fn write(&mut self, addr: u16, value: u8, io: &mut IoContext<'_>) {
        if addr == self.addrs.tifr {
            // Write one to clear
            self.st.flags &= !value;
            self.publish_flags(io);
        } else if !Self::is_pwm(self.mode(io)) {
            if Some(addr) == self.addrs.ocra {
                self.st.ocra = value;
            } else if Some(addr) == self.addrs.ocrb {
                self.st.ocrb = value;
            }
        }
        self.update_irq(io);
    }

    fn clock(&mut self, io: &mut IoContext<'_>) {
        let prescale = PRESCALE[self.cs(io) as usize];
        if prescale != 0 {
            self.st.div += 1;
            if self.st.div >= prescale {
                self.st.div = 0;
                self.tick(io);
            }
        }
        self.update_irq(io);
    }

    fn acknowledge(&mut self, vector: u8, io: &mut IoContext<'_>) {
        let bit = if vector == self.addrs.ovf_vector {
            self.addrs.tov_bit
        } else if Some(vector) == self.addrs.compa_vector {
            self.addrs.ocfa_bit
        } else {
            self.addrs.ocfb_bit
        };
        self.st.flags &= !(1 << bit);
        self.publish_flags(io);
        io.clear(vector);
    }

    fn save_state(&self) -> Result<Vec<u8>, SaveStateError> {
        super::encode(&self.st)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<(), SaveStateError> {
        self.st = super::decode(state)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
