//! USART in asynchronous 8N1 mode.
//!
//! Frames take `10 * 16 * (UBRR + 1)` cycles (half that with U2X). The
//! transmitter has a one-byte buffer in front of the shift register;
//! finished bytes go to a host-side output buffer. Receive data comes
//! from a host-side input queue and is delivered one frame time apart,
//! only while the receive register is empty.
//!
//! RXC and UDRE are level conditions; TXC is cleared on vector entry.

use std::any::Any;
use std::collections::VecDeque;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::dispatch::{Attach, IoContext, Peripheral};
use crate::error::{DispatchError, SaveStateError};
use crate::variant::UsartAddrs;
use crate::Avr;

const RXC: u8 = 1 << 7;
const TXC: u8 = 1 << 6;
const UDRE: u8 = 1 << 5;
const U2X: u8 = 1 << 1;
const MPCM: u8 = 1 << 0;

const RXCIE: u8 = 1 << 7;
const TXCIE: u8 = 1 << 6;
const UDRIE: u8 = 1 << 5;
const RXEN: u8 = 1 << 4;
const TXEN: u8 = 1 << 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsartState {
    /// Byte in the shift register and cycles until it is out
    tx_shift: Option<u8>,
    tx_remaining: u32,
    /// UDR transmit buffer
    tx_buffer: Option<u8>,
    /// UDR receive register
    rx_data: Option<u8>,
    rx_remaining: u32,
    txc: bool,
    /// Host-side queues
    input: VecDeque<u8>,
    output: Vec<u8>,
}

pub struct Usart {
    addrs: UsartAddrs,
    st: UsartState,
}

impl Usart {
    pub fn new(addrs: UsartAddrs) -> Self {
        Usart { addrs, st: UsartState::default() }
    }

    /// Queue bytes for the receiver.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.st.input.extend(bytes);
    }

    /// Transmitted bytes since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.st.output)
    }

    pub fn pending_input(&self) -> usize {
        self.st.input.len()
    }

    fn frame(&self, io: &IoContext<'_>) -> u32 {
        let hi = self.addrs.ubrrh.map_or(0, |a| io.get(a) & 0x0F);
        let ubrr = u16::from_le_bytes([io.get(self.addrs.ubrrl), hi]);
        super::frame_cycles(ubrr, io.get(self.addrs.ucsra) & U2X != 0)
    }

    fn status(&self, io: &IoContext<'_>) -> u8 {
        let mut v = io.get(self.addrs.ucsra) & (U2X | MPCM);
        if self.st.rx_data.is_some() {
            v |= RXC;
        }
        if self.st.txc {
            v |= TXC;
        }
        if self.st.tx_buffer.is_none() {
            v |= UDRE;
        }
        v
    }

    fn sync(&self, io: &mut IoContext<'_>) {
        let status = self.status(io);
        io.set(self.addrs.ucsra, status);
        let ctrl = io.get(self.addrs.ucsrb);
        io.set_candidate(self.addrs.rx_vector, ctrl & RXCIE != 0 && status & RXC != 0);
        io.set_candidate(self.addrs.udre_vector, ctrl & UDRIE != 0 && status & UDRE != 0);
        io.set_candidate(self.addrs.tx_vector, ctrl & TXCIE != 0 && status & TXC != 0);
    }

    fn start_shift(&mut self, byte: u8, io: &IoContext<'_>) {
        self.st.tx_shift = Some(byte);
        self.st.tx_remaining = self.frame(io);
    }
}

impl Peripheral for Usart {
    fn name(&self) -> &'static str {
        "usart"
    }

    fn claimed(&self) -> RangeInclusive<u16> {
        let a = &self.addrs;
        super::span([a.udr, a.ucsra, a.ucsrb, a.ubrrl].into_iter().chain(a.ucsrc).chain(a.ubrrh))
    }

    fn init(&mut self, bus: &mut Attach<'_>) -> Result<(), DispatchError> {
        bus.reader(self.addrs.udr)?;
        bus.writer(self.addrs.udr)?;
        bus.writer(self.addrs.ucsra)?;
        bus.writer(self.addrs.ucsrb)?;
        bus.clock()?;
        bus.acknowledge(self.addrs.tx_vector)
    }

    fn reset(&mut self, io: &mut IoContext<'_>) {
        let input = std::mem::take(&mut self.st.input);
        self.st = UsartState { input, ..UsartState::default() };
        io.set(self.addrs.ucsra, 0);
        io.set(self.addrs.ucsrb, 0);
        if let Some(c) = self.addrs.ucsrc {
            io.set(c, 0x06);
        }
        self.sync(io);
    }

    fn read(&mut self, addr: u16, value: &mut u8, io: &mut IoContext<'_>) {
        if addr == self.addrs.udr {
            if let Some(b) = self.st.rx_data.take() {
                *value = b;
                self.sync(io);
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8, io: &mut IoContext<'_>) {
        if addr == self.addrs.udr {
            if io.get(self.addrs.ucsrb) & TXEN != 0 {
                if self.st.tx_shift.is_none() {
                    self.start_shift(value, io);
                } else if self.st.tx_buffer.is_none() {
                    self.st.tx_buffer = Some(value);
                }
            }
        } else if addr == self.addrs.ucsra && value & TXC != 0 {
            self.st.txc = false;
        } else if addr == self.addrs.ucsrb && value & RXEN == 0 {
            self.st.rx_data = None;
        }
        self.sync(io);
    }

    fn clock(&mut self, io: &mut IoContext<'_>) {
        let ctrl = io.get(self.addrs.ucsrb);

        if self.st.tx_shift.is_some() {
            self.st.tx_remaining = self.st.tx_remaining.saturating_sub(1);
            if self.st.tx_remaining == 0 {
                if let Some(b) = self.st.tx_shift.take() {
                    log::trace!("usart tx 0x{:02X}", b);
                    self.st.output.push(b);
                }
                match self.st.tx_buffer.take() {
                    Some(next) => self.start_shift(next, io),
                    None => self.st.txc = true,
                }
            }
        }

        if ctrl & RXEN != 0 && self.st.rx_data.is_none() && !self.st.input.is_empty() {
            if self.st.rx_remaining == 0 {
                self.st.rx_remaining = self.frame(io);
            }
            self.st.rx_remaining -= 1;
            if self.st.rx_remaining == 0 {
                self.st.rx_data = self.st.input.pop_front();
            }
        }

        self.sync(io);
    }

    fn acknowledge(&mut self, _vector: u8, io: &mut IoContext<'_>) {
        self.st.txc = false;
        self.sync(io);
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

impl Avr {
    /// Feed bytes to the serial receiver. False if the model has no USART.
    pub fn uart_input(&mut self, bytes: &[u8]) -> bool {
        self.peripheral_mut::<Usart>().map(|u| u.push_input(bytes)).is_some()
    }

    /// Drain transmitted serial bytes.
    pub fn uart_output(&mut self) -> Vec<u8> {
        self.peripheral_mut::<Usart>().map(Usart::take_output).unwrap_or_default()
    }
}
