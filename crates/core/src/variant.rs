//! Per-model configuration tables.
//!
//! A [`Variant`] is immutable and selected once by name. It fixes memory
//! sizes, the interrupt vector table, instruction-set features and where
//! each stock peripheral's registers live on that chip.

use std::ops::RangeInclusive;

use crate::error::ConfigError;
use crate::regs::BitField;

/// Optional instruction-set features.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    /// MUL, MULS, MULSU, FMUL*
    pub mul: bool,
    /// 32-bit JMP and CALL
    pub jmp_call: bool,
    /// ELPM with RAMPZ
    pub elpm: bool,
    /// SPM page size in words (0 = no self-programming)
    pub spm_page_words: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct PortAddrs {
    pub name: char,
    pub pin: u16,
    pub ddr: u16,
    pub port: u16,
}

/// Timer control register layout.
#[derive(Debug, Clone, Copy)]
pub enum TimerControl {
    /// TCCRxA holds WGM1:0, TCCRxB holds WGM2 and CS2:0.
    Split { tccra: u16, tccrb: u16 },
    /// One TCCRx: CS2:0 in bits 2:0, WGM00 in bit 6, WGM01 in bit 3.
    Single { tccr: u16 },
}

/// 8-bit timer/counter 0.
#[derive(Debug, Clone, Copy)]
pub struct Timer8Addrs {
    pub control: TimerControl,
    pub tcnt: u16,
    pub ocra: Option<u16>,
    pub ocrb: Option<u16>,
    pub timsk: u16,
    pub tifr: u16,
    /// Bit positions shared by TIMSK (enable) and TIFR (flag)
    pub tov_bit: u8,
    pub ocfa_bit: u8,
    pub ocfb_bit: u8,
    pub ovf_vector: u8,
    pub compa_vector: Option<u8>,
    pub compb_vector: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct UsartAddrs {
    pub udr: u16,
    pub ucsra: u16,
    pub ucsrb: u16,
    pub ucsrc: Option<u16>,
    pub ubrrl: u16,
    pub ubrrh: Option<u16>,
    pub rx_vector: u8,
    pub udre_vector: u8,
    pub tx_vector: u8,
}

/// One external interrupt line.
#[derive(Debug, Clone, Copy)]
pub struct ExtIntLine {
    /// Two-bit sense control field
    pub isc: BitField,
    /// Bit in the mask and flag registers
    pub bit: u8,
    /// Input pin the line samples
    pub pin: BitField,
    pub vector: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtIntAddrs {
    pub mask: u16,
    pub flags: u16,
    pub lines: &'static [ExtIntLine],
}

#[derive(Debug, Clone, Copy)]
pub struct EepromAddrs {
    pub eecr: u16,
    pub eedr: u16,
    pub eearl: u16,
    pub eearh: Option<u16>,
    pub ready_vector: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogAddrs {
    pub wdtcsr: u16,
    /// Vector used in interrupt mode; `None` on parts without WDIE
    pub vector: Option<u8>,
}

/// Immutable description of one microcontroller model.
#[derive(Debug)]
pub struct Variant {
    pub name: &'static str,
    pub signature: [u8; 3],
    pub flash_size: usize,
    pub sram_size: usize,
    pub eeprom_size: usize,
    /// Last data address of I/O space (0x5F or 0xFF)
    pub io_top: u16,
    /// Words per vector slot
    pub vector_words: u8,
    /// Vector names indexed by vector number; 0 is RESET
    pub vectors: &'static [&'static str],
    pub features: Features,
    /// I/O addresses that read as zero and drop writes unless claimed
    pub reserved_io: &'static [RangeInclusive<u16>],
    pub io_names: &'static [(u16, &'static str)],
    pub sleep_enable: BitField,
    pub mcusr: u16,
    pub spmcsr: Option<u16>,
    pub rampz: Option<u16>,
    pub watchdog: Option<WatchdogAddrs>,
    pub ports: &'static [PortAddrs],
    pub timer0: Option<Timer8Addrs>,
    pub usart: Option<UsartAddrs>,
    pub ext_int: Option<ExtIntAddrs>,
    pub eeprom: Option<EepromAddrs>,
}

impl Variant {
    /// Find a model by name (case-insensitive).
    pub fn lookup(name: &str) -> Result<&'static Variant, ConfigError> {
        VARIANTS
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConfigError::UnknownVariant(name.to_string()))
    }

    pub fn all() -> &'static [Variant] {
        VARIANTS
    }

    /// First SRAM address.
    pub fn ram_start(&self) -> u16 {
        self.io_top + 1
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    /// Word address of a vector slot.
    pub fn vector_address(&self, vector: u8) -> u16 {
        vector as u16 * self.vector_words as u16
    }

    pub fn vector_name(&self, vector: u8) -> Option<&'static str> {
        self.vectors.get(vector as usize).copied()
    }

    pub fn vector_by_name(&self, name: &str) -> Option<u8> {
        self.vectors.iter().position(|n| n.eq_ignore_ascii_case(name)).map(|i| i as u8)
    }

    pub fn is_reserved_io(&self, addr: u16) -> bool {
        self.reserved_io.iter().any(|r| r.contains(&addr))
    }

    pub fn io_name(&self, addr: u16) -> Option<&'static str> {
        self.io_names.iter().find(|(a, _)| *a == addr).map(|(_, n)| *n)
    }

    pub fn io_addr(&self, name: &str) -> Option<u16> {
        self.io_names.iter().find(|(_, n)| n.eq_ignore_ascii_case(name)).map(|(a, _)| *a)
    }
}

// ─── Vector tables ───

const TINY85_VECTORS: &[&str] = &[
    "RESET", "INT0", "PCINT0", "TIMER1_COMPA", "TIMER1_OVF", "TIMER0_OVF", "EE_RDY",
    "ANA_COMP", "ADC", "TIMER1_COMPB", "TIMER0_COMPA", "TIMER0_COMPB", "WDT", "USI_START",
    "USI_OVF",
];

const MEGA8_VECTORS: &[&str] = &[
    "RESET", "INT0", "INT1", "TIMER2_COMP", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA",
    "TIMER1_COMPB", "TIMER1_OVF", "TIMER0_OVF", "SPI_STC", "USART_RXC", "USART_UDRE",
    "USART_TXC", "ADC", "EE_RDY", "ANA_COMP", "TWI", "SPM_RDY",
];

const MEGA16_VECTORS: &[&str] = &[
    "RESET", "INT0", "INT1", "TIMER2_COMP", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA",
    "TIMER1_COMPB", "TIMER1_OVF", "TIMER0_OVF", "SPI_STC", "USART_RXC", "USART_UDRE",
    "USART_TXC", "ADC", "EE_RDY", "ANA_COMP", "TWI", "INT2", "TIMER0_COMP", "SPM_RDY",
];

const MEGA328_VECTORS: &[&str] = &[
    "RESET", "INT0", "INT1", "PCINT0", "PCINT1", "PCINT2", "WDT", "TIMER2_COMPA",
    "TIMER2_COMPB", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA", "TIMER1_COMPB",
    "TIMER1_OVF", "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF", "SPI_STC", "USART_RX",
    "USART_UDRE", "USART_TX", "ADC", "EE_READY", "ANALOG_COMP", "TWI", "SPM_READY",
];

const MEGA32U4_VECTORS: &[&str] = &[
    "RESET", "INT0", "INT1", "INT2", "INT3", "RESERVED5", "RESERVED6", "INT6", "RESERVED8",
    "PCINT0", "USB_GEN", "USB_COM", "WDT", "RESERVED13", "RESERVED14", "RESERVED15",
    "TIMER1_CAPT", "TIMER1_COMPA", "TIMER1_COMPB", "TIMER1_COMPC", "TIMER1_OVF",
    "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF", "SPI_STC", "USART1_RX", "USART1_UDRE",
    "USART1_TX", "ANALOG_COMP", "ADC", "EE_READY", "TIMER3_CAPT", "TIMER3_COMPA",
    "TIMER3_COMPB", "TIMER3_COMPC", "TIMER3_OVF", "TWI", "SPM_READY", "TIMER4_COMPA",
    "TIMER4_COMPB", "TIMER4_COMPD", "TIMER4_OVF", "TIMER4_FPF",
];

const MEGA1284_VECTORS: &[&str] = &[
    "RESET", "INT0", "INT1", "INT2", "PCINT0", "PCINT1", "PCINT2", "PCINT3", "WDT",
    "TIMER2_COMPA", "TIMER2_COMPB", "TIMER2_OVF", "TIMER1_CAPT", "TIMER1_COMPA",
    "TIMER1_COMPB", "TIMER1_OVF", "TIMER0_COMPA", "TIMER0_COMPB", "TIMER0_OVF", "SPI_STC",
    "USART0_RX", "USART0_UDRE", "USART0_TX", "ANALOG_COMP", "ADC", "EE_READY", "TWI",
    "SPM_READY", "USART1_RX", "USART1_UDRE", "USART1_TX", "TIMER3_CAPT", "TIMER3_COMPA",
    "TIMER3_COMPB", "TIMER3_OVF",
];

// ─── I/O register names ───

const TINY85_IO: &[(u16, &str)] = &[
    (0x23, "ADCSRB"), (0x24, "ADCL"), (0x25, "ADCH"), (0x26, "ADCSRA"), (0x27, "ADMUX"),
    (0x28, "ACSR"), (0x2D, "USICR"), (0x2E, "USISR"), (0x2F, "USIDR"), (0x30, "USIBR"),
    (0x31, "GPIOR0"), (0x32, "GPIOR1"), (0x33, "GPIOR2"), (0x34, "DIDR0"), (0x35, "PCMSK"),
    (0x36, "PINB"), (0x37, "DDRB"), (0x38, "PORTB"), (0x3C, "EECR"), (0x3D, "EEDR"),
    (0x3E, "EEARL"), (0x3F, "EEARH"), (0x40, "PRR"), (0x41, "WDTCR"), (0x46, "CLKPR"),
    (0x47, "PLLCSR"), (0x48, "OCR0B"), (0x49, "OCR0A"), (0x4A, "TCCR0A"), (0x4B, "OCR1B"),
    (0x4C, "GTCCR"), (0x4D, "OCR1C"), (0x4E, "OCR1A"), (0x4F, "TCNT1"), (0x50, "TCCR1"),
    (0x51, "OSCCAL"), (0x52, "TCNT0"), (0x53, "TCCR0B"), (0x54, "MCUSR"), (0x55, "MCUCR"),
    (0x57, "SPMCSR"), (0x58, "TIFR"), (0x59, "TIMSK"), (0x5A, "GIFR"), (0x5B, "GIMSK"),
    (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"),
];

const MEGA8_IO: &[(u16, &str)] = &[
    (0x20, "TWBR"), (0x21, "TWSR"), (0x22, "TWAR"), (0x23, "TWDR"), (0x24, "ADCL"),
    (0x25, "ADCH"), (0x26, "ADCSRA"), (0x27, "ADMUX"), (0x28, "ACSR"), (0x29, "UBRRL"),
    (0x2A, "UCSRB"), (0x2B, "UCSRA"), (0x2C, "UDR"), (0x2D, "SPCR"), (0x2E, "SPSR"),
    (0x2F, "SPDR"), (0x30, "PIND"), (0x31, "DDRD"), (0x32, "PORTD"), (0x33, "PINC"),
    (0x34, "DDRC"), (0x35, "PORTC"), (0x36, "PINB"), (0x37, "DDRB"), (0x38, "PORTB"),
    (0x3C, "EECR"), (0x3D, "EEDR"), (0x3E, "EEARL"), (0x3F, "EEARH"), (0x40, "UBRRH"),
    (0x41, "WDTCR"), (0x42, "ASSR"), (0x43, "OCR2"), (0x44, "TCNT2"), (0x45, "TCCR2"),
    (0x46, "ICR1L"), (0x47, "ICR1H"), (0x48, "OCR1BL"), (0x49, "OCR1BH"), (0x4A, "OCR1AL"),
    (0x4B, "OCR1AH"), (0x4C, "TCNT1L"), (0x4D, "TCNT1H"), (0x4E, "TCCR1B"), (0x4F, "TCCR1A"),
    (0x50, "SFIOR"), (0x51, "OSCCAL"), (0x52, "TCNT0"), (0x53, "TCCR0"), (0x54, "MCUCSR"),
    (0x55, "MCUCR"), (0x56, "TWCR"), (0x57, "SPMCR"), (0x58, "TIFR"), (0x59, "TIMSK"),
    (0x5A, "GIFR"), (0x5B, "GICR"), (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"),
];

const MEGA16_IO: &[(u16, &str)] = &[
    (0x20, "TWBR"), (0x21, "TWSR"), (0x22, "TWAR"), (0x23, "TWDR"), (0x24, "ADCL"),
    (0x25, "ADCH"), (0x26, "ADCSRA"), (0x27, "ADMUX"), (0x28, "ACSR"), (0x29, "UBRRL"),
    (0x2A, "UCSRB"), (0x2B, "UCSRA"), (0x2C, "UDR"), (0x2D, "SPCR"), (0x2E, "SPSR"),
    (0x2F, "SPDR"), (0x30, "PIND"), (0x31, "DDRD"), (0x32, "PORTD"), (0x33, "PINC"),
    (0x34, "DDRC"), (0x35, "PORTC"), (0x36, "PINB"), (0x37, "DDRB"), (0x38, "PORTB"),
    (0x39, "PINA"), (0x3A, "DDRA"), (0x3B, "PORTA"), (0x3C, "EECR"), (0x3D, "EEDR"),
    (0x3E, "EEARL"), (0x3F, "EEARH"), (0x40, "UBRRH"), (0x41, "WDTCR"), (0x42, "ASSR"),
    (0x43, "OCR2"), (0x44, "TCNT2"), (0x45, "TCCR2"), (0x46, "ICR1L"), (0x47, "ICR1H"),
    (0x48, "OCR1BL"), (0x49, "OCR1BH"), (0x4A, "OCR1AL"), (0x4B, "OCR1AH"), (0x4C, "TCNT1L"),
    (0x4D, "TCNT1H"), (0x4E, "TCCR1B"), (0x4F, "TCCR1A"), (0x50, "SFIOR"), (0x51, "OSCCAL"),
    (0x52, "TCNT0"), (0x53, "TCCR0"), (0x54, "MCUCSR"), (0x55, "MCUCR"), (0x56, "TWCR"),
    (0x57, "SPMCR"), (0x58, "TIFR"), (0x59, "TIMSK"), (0x5A, "GIFR"), (0x5B, "GICR"),
    (0x5C, "OCR0"), (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"),
];

const MEGA328_IO: &[(u16, &str)] = &[
    (0x23, "PINB"), (0x24, "DDRB"), (0x25, "PORTB"), (0x26, "PINC"), (0x27, "DDRC"),
    (0x28, "PORTC"), (0x29, "PIND"), (0x2A, "DDRD"), (0x2B, "PORTD"), (0x35, "TIFR0"),
    (0x36, "TIFR1"), (0x37, "TIFR2"), (0x3B, "PCIFR"), (0x3C, "EIFR"), (0x3D, "EIMSK"),
    (0x3E, "GPIOR0"), (0x3F, "EECR"), (0x40, "EEDR"), (0x41, "EEARL"), (0x42, "EEARH"),
    (0x43, "GTCCR"), (0x44, "TCCR0A"), (0x45, "TCCR0B"), (0x46, "TCNT0"), (0x47, "OCR0A"),
    (0x48, "OCR0B"), (0x4A, "GPIOR1"), (0x4B, "GPIOR2"), (0x4C, "SPCR"), (0x4D, "SPSR"),
    (0x4E, "SPDR"), (0x50, "ACSR"), (0x53, "SMCR"), (0x54, "MCUSR"), (0x55, "MCUCR"),
    (0x57, "SPMCSR"), (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"), (0x60, "WDTCSR"),
    (0x61, "CLKPR"), (0x64, "PRR"), (0x66, "OSCCAL"), (0x68, "PCICR"), (0x69, "EICRA"),
    (0x6B, "PCMSK0"), (0x6C, "PCMSK1"), (0x6D, "PCMSK2"), (0x6E, "TIMSK0"), (0x6F, "TIMSK1"),
    (0x70, "TIMSK2"), (0x78, "ADCL"), (0x79, "ADCH"), (0x7A, "ADCSRA"), (0x7B, "ADCSRB"),
    (0x7C, "ADMUX"), (0x7E, "DIDR0"), (0x7F, "DIDR1"), (0x80, "TCCR1A"), (0x81, "TCCR1B"),
    (0x82, "TCCR1C"), (0x84, "TCNT1L"), (0x85, "TCNT1H"), (0x86, "ICR1L"), (0x87, "ICR1H"),
    (0x88, "OCR1AL"), (0x89, "OCR1AH"), (0x8A, "OCR1BL"), (0x8B, "OCR1BH"), (0xB0, "TCCR2A"),
    (0xB1, "TCCR2B"), (0xB2, "TCNT2"), (0xB3, "OCR2A"), (0xB4, "OCR2B"), (0xB6, "ASSR"),
    (0xB8, "TWBR"), (0xB9, "TWSR"), (0xBA, "TWAR"), (0xBB, "TWDR"), (0xBC, "TWCR"),
    (0xBD, "TWAMR"), (0xC0, "UCSR0A"), (0xC1, "UCSR0B"), (0xC2, "UCSR0C"), (0xC4, "UBRR0L"),
    (0xC5, "UBRR0H"), (0xC6, "UDR0"),
];

const MEGA32U4_IO: &[(u16, &str)] = &[
    (0x23, "PINB"), (0x24, "DDRB"), (0x25, "PORTB"), (0x26, "PINC"), (0x27, "DDRC"),
    (0x28, "PORTC"), (0x29, "PIND"), (0x2A, "DDRD"), (0x2B, "PORTD"), (0x2C, "PINE"),
    (0x2D, "DDRE"), (0x2E, "PORTE"), (0x2F, "PINF"), (0x30, "DDRF"), (0x31, "PORTF"),
    (0x35, "TIFR0"), (0x36, "TIFR1"), (0x38, "TIFR3"), (0x39, "TIFR4"), (0x3B, "PCIFR"),
    (0x3C, "EIFR"), (0x3D, "EIMSK"), (0x3E, "GPIOR0"), (0x3F, "EECR"), (0x40, "EEDR"),
    (0x41, "EEARL"), (0x42, "EEARH"), (0x43, "GTCCR"), (0x44, "TCCR0A"), (0x45, "TCCR0B"),
    (0x46, "TCNT0"), (0x47, "OCR0A"), (0x48, "OCR0B"), (0x49, "PLLCSR"), (0x4A, "GPIOR1"),
    (0x4B, "GPIOR2"), (0x4C, "SPCR"), (0x4D, "SPSR"), (0x4E, "SPDR"), (0x50, "ACSR"),
    (0x51, "OCDR"), (0x52, "PLLFRQ"), (0x53, "SMCR"), (0x54, "MCUSR"), (0x55, "MCUCR"),
    (0x57, "SPMCSR"), (0x5B, "RAMPZ"), (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"),
    (0x60, "WDTCSR"), (0x61, "CLKPR"), (0x64, "PRR0"), (0x65, "PRR1"), (0x66, "OSCCAL"),
    (0x67, "RCCTRL"), (0x68, "PCICR"), (0x69, "EICRA"), (0x6A, "EICRB"), (0x6B, "PCMSK0"),
    (0x6E, "TIMSK0"), (0x6F, "TIMSK1"), (0x71, "TIMSK3"), (0x72, "TIMSK4"), (0x78, "ADCL"),
    (0x79, "ADCH"), (0x7A, "ADCSRA"), (0x7B, "ADCSRB"), (0x7C, "ADMUX"), (0x80, "TCCR1A"),
    (0x81, "TCCR1B"), (0x82, "TCCR1C"), (0x84, "TCNT1L"), (0x85, "TCNT1H"), (0x88, "OCR1AL"),
    (0x89, "OCR1AH"), (0xC8, "UCSR1A"), (0xC9, "UCSR1B"), (0xCA, "UCSR1C"), (0xCC, "UBRR1L"),
    (0xCD, "UBRR1H"), (0xCE, "UDR1"),
];

const MEGA1284_IO: &[(u16, &str)] = &[
    (0x20, "PINA"), (0x21, "DDRA"), (0x22, "PORTA"), (0x23, "PINB"), (0x24, "DDRB"),
    (0x25, "PORTB"), (0x26, "PINC"), (0x27, "DDRC"), (0x28, "PORTC"), (0x29, "PIND"),
    (0x2A, "DDRD"), (0x2B, "PORTD"), (0x35, "TIFR0"), (0x36, "TIFR1"), (0x37, "TIFR2"),
    (0x38, "TIFR3"), (0x3B, "PCIFR"), (0x3C, "EIFR"), (0x3D, "EIMSK"), (0x3E, "GPIOR0"),
    (0x3F, "EECR"), (0x40, "EEDR"), (0x41, "EEARL"), (0x42, "EEARH"), (0x43, "GTCCR"),
    (0x44, "TCCR0A"), (0x45, "TCCR0B"), (0x46, "TCNT0"), (0x47, "OCR0A"), (0x48, "OCR0B"),
    (0x4A, "GPIOR1"), (0x4B, "GPIOR2"), (0x4C, "SPCR"), (0x4D, "SPSR"), (0x4E, "SPDR"),
    (0x50, "ACSR"), (0x53, "SMCR"), (0x54, "MCUSR"), (0x55, "MCUCR"), (0x57, "SPMCSR"),
    (0x5B, "RAMPZ"), (0x5D, "SPL"), (0x5E, "SPH"), (0x5F, "SREG"), (0x60, "WDTCSR"),
    (0x61, "CLKPR"), (0x64, "PRR0"), (0x66, "OSCCAL"), (0x68, "PCICR"), (0x69, "EICRA"),
    (0x6B, "PCMSK0"), (0x6C, "PCMSK1"), (0x6D, "PCMSK2"), (0x6E, "TIMSK0"), (0x6F, "TIMSK1"),
    (0x70, "TIMSK2"), (0x71, "TIMSK3"), (0x73, "PCMSK3"), (0x78, "ADCL"), (0x79, "ADCH"),
    (0x7A, "ADCSRA"), (0x7B, "ADCSRB"), (0x7C, "ADMUX"), (0x80, "TCCR1A"), (0x81, "TCCR1B"),
    (0x82, "TCCR1C"), (0x84, "TCNT1L"), (0x85, "TCNT1H"), (0xB0, "TCCR2A"), (0xB1, "TCCR2B"),
    (0xB2, "TCNT2"), (0xB3, "OCR2A"), (0xB4, "OCR2B"), (0xC0, "UCSR0A"), (0xC1, "UCSR0B"),
    (0xC2, "UCSR0C"), (0xC4, "UBRR0L"), (0xC5, "UBRR0H"), (0xC6, "UDR0"), (0xC8, "UCSR1A"),
    (0xC9, "UCSR1B"), (0xCA, "UCSR1C"), (0xCC, "UBRR1L"), (0xCD, "UBRR1H"), (0xCE, "UDR1"),
];

const MEGA328_RESERVED: &[RangeInclusive<u16>] = &[
    0x20..=0x22, 0x2C..=0x34, 0x38..=0x3A, 0x49..=0x49, 0x4F..=0x4F, 0x51..=0x52,
    0x56..=0x56, 0x58..=0x5C, 0x62..=0x63, 0x65..=0x65, 0x67..=0x67, 0x6A..=0x6A,
    0x71..=0x77, 0x7D..=0x7D, 0x83..=0x83, 0x8C..=0xAF, 0xB5..=0xB5, 0xB7..=0xB7,
    0xBE..=0xBF, 0xC3..=0xC3, 0xC7..=0xFF,
];

const MEGA8_RESERVED: &[RangeInclusive<u16>] = &[0x39..=0x3B, 0x5C..=0x5C];

// ─── Ports ───

const TINY85_PORTS: &[PortAddrs] = &[PortAddrs { name: 'B', pin: 0x36, ddr: 0x37, port: 0x38 }];

const MEGA8_PORTS: &[PortAddrs] = &[
    PortAddrs { name: 'B', pin: 0x36, ddr: 0x37, port: 0x38 },
    PortAddrs { name: 'C', pin: 0x33, ddr: 0x34, port: 0x35 },
    PortAddrs { name: 'D', pin: 0x30, ddr: 0x31, port: 0x32 },
];

const MEGA16_PORTS: &[PortAddrs] = &[
    PortAddrs { name: 'A', pin: 0x39, ddr: 0x3A, port: 0x3B },
    PortAddrs { name: 'B', pin: 0x36, ddr: 0x37, port: 0x38 },
    PortAddrs { name: 'C', pin: 0x33, ddr: 0x34, port: 0x35 },
    PortAddrs { name: 'D', pin: 0x30, ddr: 0x31, port: 0x32 },
];

const MEGA328_PORTS: &[PortAddrs] = &[
    PortAddrs { name: 'B', pin: 0x23, ddr: 0x24, port: 0x25 },
    PortAddrs { name: 'C', pin: 0x26, ddr: 0x27, port: 0x28 },
    PortAddrs { name: 'D', pin: 0x29, ddr: 0x2A, port: 0x2B },
];

const MEGA32U4_PORTS: &[PortAddrs] = &[
    PortAddrs { name: 'B', pin: 0x23, ddr: 0x24, port: 0x25 },
    PortAddrs { name: 'C', pin: 0x26, ddr: 0x27, port: 0x28 },
    PortAddrs { name: 'D', pin: 0x29, ddr: 0x2A, port: 0x2B },
    PortAddrs { name: 'E', pin: 0x2C, ddr: 0x2D, port: 0x2E },
    PortAddrs { name: 'F', pin: 0x2F, ddr: 0x30, port: 0x31 },
];

const MEGA1284_PORTS: &[PortAddrs] = &[
    PortAddrs { name: 'A', pin: 0x20, ddr: 0x21, port: 0x22 },
    PortAddrs { name: 'B', pin: 0x23, ddr: 0x24, port: 0x25 },
    PortAddrs { name: 'C', pin: 0x26, ddr: 0x27, port: 0x28 },
    PortAddrs { name: 'D', pin: 0x29, ddr: 0x2A, port: 0x2B },
];

// ─── External interrupt lines ───

const TINY85_INT: &[ExtIntLine] = &[ExtIntLine {
    isc: BitField::new(0x55, 0, 2), bit: 6, pin: BitField::bit(0x36, 2), vector: 1,
}];

const MEGA8_INT: &[ExtIntLine] = &[
    ExtIntLine { isc: BitField::new(0x55, 0, 2), bit: 6, pin: BitField::bit(0x30, 2), vector: 1 },
    ExtIntLine { isc: BitField::new(0x55, 2, 2), bit: 7, pin: BitField::bit(0x30, 3), vector: 2 },
];

const MEGA328_INT: &[ExtIntLine] = &[
    ExtIntLine { isc: BitField::new(0x69, 0, 2), bit: 0, pin: BitField::bit(0x29, 2), vector: 1 },
    ExtIntLine { isc: BitField::new(0x69, 2, 2), bit: 1, pin: BitField::bit(0x29, 3), vector: 2 },
];

const MEGA32U4_INT: &[ExtIntLine] = &[
    ExtIntLine { isc: BitField::new(0x69, 0, 2), bit: 0, pin: BitField::bit(0x29, 0), vector: 1 },
    ExtIntLine { isc: BitField::new(0x69, 2, 2), bit: 1, pin: BitField::bit(0x29, 1), vector: 2 },
    ExtIntLine { isc: BitField::new(0x69, 4, 2), bit: 2, pin: BitField::bit(0x29, 2), vector: 3 },
    ExtIntLine { isc: BitField::new(0x69, 6, 2), bit: 3, pin: BitField::bit(0x29, 3), vector: 4 },
];

const MEGA1284_INT: &[ExtIntLine] = &[
    ExtIntLine { isc: BitField::new(0x69, 0, 2), bit: 0, pin: BitField::bit(0x29, 2), vector: 1 },
    ExtIntLine { isc: BitField::new(0x69, 2, 2), bit: 1, pin: BitField::bit(0x29, 3), vector: 2 },
    ExtIntLine { isc: BitField::new(0x69, 4, 2), bit: 2, pin: BitField::bit(0x23, 2), vector: 3 },
];

// ─── Shared peripheral layouts ───

const fn mega328_timer0(ovf: u8, compa: u8, compb: u8) -> Timer8Addrs {
    Timer8Addrs {
        control: TimerControl::Split { tccra: 0x44, tccrb: 0x45 },
        tcnt: 0x46, ocra: Some(0x47), ocrb: Some(0x48), timsk: 0x6E, tifr: 0x35,
        tov_bit: 0, ocfa_bit: 1, ocfb_bit: 2,
        ovf_vector: ovf, compa_vector: Some(compa), compb_vector: Some(compb),
    }
}

const fn mega8_timer0(compa: Option<u8>) -> Timer8Addrs {
    Timer8Addrs {
        control: TimerControl::Single { tccr: 0x53 },
        tcnt: 0x52, ocra: if compa.is_some() { Some(0x5C) } else { None }, ocrb: None,
        timsk: 0x59, tifr: 0x58, tov_bit: 0, ocfa_bit: 1, ocfb_bit: 2,
        ovf_vector: 9, compa_vector: compa, compb_vector: None,
    }
}

const fn usart0(base: u16, rx: u8) -> UsartAddrs {
    UsartAddrs {
        udr: base + 6, ucsra: base, ucsrb: base + 1, ucsrc: Some(base + 2),
        ubrrl: base + 4, ubrrh: Some(base + 5),
        rx_vector: rx, udre_vector: rx + 1, tx_vector: rx + 2,
    }
}

const MEGA8_USART: UsartAddrs = UsartAddrs {
    udr: 0x2C, ucsra: 0x2B, ucsrb: 0x2A, ucsrc: None, ubrrl: 0x29, ubrrh: None,
    rx_vector: 11, udre_vector: 12, tx_vector: 13,
};

const fn mega328_eeprom(ready: u8) -> EepromAddrs {
    EepromAddrs { eecr: 0x3F, eedr: 0x40, eearl: 0x41, eearh: Some(0x42), ready_vector: ready }
}

const fn mega8_eeprom(ready: u8) -> EepromAddrs {
    EepromAddrs { eecr: 0x3C, eedr: 0x3D, eearl: 0x3E, eearh: Some(0x3F), ready_vector: ready }
}

const fn mega328_family(
    name: &'static str,
    signature: [u8; 3],
    flash_size: usize,
    sram_size: usize,
    eeprom_size: usize,
    vector_words: u8,
    spm_page_words: u16,
) -> Variant {
    Variant {
        name, signature, flash_size, sram_size, eeprom_size,
        io_top: 0xFF,
        vector_words,
        vectors: MEGA328_VECTORS,
        features: Features { mul: true, jmp_call: vector_words == 2, elpm: false, spm_page_words },
        reserved_io: MEGA328_RESERVED,
        io_names: MEGA328_IO,
        sleep_enable: BitField::bit(0x53, 0),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: None,
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x60, vector: Some(6) }),
        ports: MEGA328_PORTS,
        timer0: Some(mega328_timer0(16, 14, 15)),
        usart: Some(usart0(0xC0, 18)),
        ext_int: Some(ExtIntAddrs { mask: 0x3D, flags: 0x3C, lines: MEGA328_INT }),
        eeprom: Some(mega328_eeprom(22)),
    }
}

const fn mega16_family(name: &'static str, signature: [u8; 3], flash_size: usize, sram_size: usize, eeprom_size: usize) -> Variant {
    Variant {
        name, signature, flash_size, sram_size, eeprom_size,
        io_top: 0x5F,
        vector_words: 2,
        vectors: MEGA16_VECTORS,
        features: Features { mul: true, jmp_call: true, elpm: false, spm_page_words: 64 },
        reserved_io: &[],
        io_names: MEGA16_IO,
        sleep_enable: BitField::bit(0x55, 6),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: None,
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x41, vector: None }),
        ports: MEGA16_PORTS,
        timer0: Some(mega8_timer0(Some(19))),
        usart: Some(MEGA8_USART),
        ext_int: Some(ExtIntAddrs { mask: 0x5B, flags: 0x5A, lines: MEGA8_INT }),
        eeprom: Some(mega8_eeprom(15)),
    }
}

// ─── Table ───

static VARIANTS: &[Variant] = &[
    Variant {
        name: "attiny85",
        signature: [0x1E, 0x93, 0x0B],
        flash_size: 8 * 1024,
        sram_size: 512,
        eeprom_size: 512,
        io_top: 0x5F,
        vector_words: 1,
        vectors: TINY85_VECTORS,
        features: Features { mul: false, jmp_call: false, elpm: false, spm_page_words: 32 },
        reserved_io: &[],
        io_names: TINY85_IO,
        sleep_enable: BitField::bit(0x55, 5),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: None,
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x41, vector: Some(12) }),
        ports: TINY85_PORTS,
        timer0: Some(Timer8Addrs {
            control: TimerControl::Split { tccra: 0x4A, tccrb: 0x53 },
            tcnt: 0x52, ocra: Some(0x49), ocrb: Some(0x48), timsk: 0x59, tifr: 0x58,
            tov_bit: 1, ocfa_bit: 4, ocfb_bit: 3,
            ovf_vector: 5, compa_vector: Some(10), compb_vector: Some(11),
        }),
        usart: None,
        ext_int: Some(ExtIntAddrs { mask: 0x5B, flags: 0x5A, lines: TINY85_INT }),
        eeprom: Some(mega8_eeprom(6)),
    },
    Variant {
        name: "atmega8",
        signature: [0x1E, 0x93, 0x07],
        flash_size: 8 * 1024,
        sram_size: 1024,
        eeprom_size: 512,
        io_top: 0x5F,
        vector_words: 1,
        vectors: MEGA8_VECTORS,
        features: Features { mul: true, jmp_call: false, elpm: false, spm_page_words: 32 },
        reserved_io: MEGA8_RESERVED,
        io_names: MEGA8_IO,
        sleep_enable: BitField::bit(0x55, 7),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: None,
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x41, vector: None }),
        ports: MEGA8_PORTS,
        timer0: Some(mega8_timer0(None)),
        usart: Some(MEGA8_USART),
        ext_int: Some(ExtIntAddrs { mask: 0x5B, flags: 0x5A, lines: MEGA8_INT }),
        eeprom: Some(mega8_eeprom(15)),
    },
    mega16_family("atmega16", [0x1E, 0x94, 0x03], 16 * 1024, 1024, 512),
    mega16_family("atmega32", [0x1E, 0x95, 0x02], 32 * 1024, 2048, 1024),
    mega328_family("atmega48", [0x1E, 0x92, 0x05], 4 * 1024, 512, 256, 1, 32),
    mega328_family("atmega88", [0x1E, 0x93, 0x0A], 8 * 1024, 1024, 512, 1, 32),
    mega328_family("atmega168", [0x1E, 0x94, 0x06], 16 * 1024, 1024, 512, 2, 64),
    mega328_family("atmega328p", [0x1E, 0x95, 0x0F], 32 * 1024, 2048, 1024, 2, 64),
    Variant {
        name: "atmega32u4",
        signature: [0x1E, 0x95, 0x87],
        flash_size: 32 * 1024,
        sram_size: 2560,
        eeprom_size: 1024,
        io_top: 0xFF,
        vector_words: 2,
        vectors: MEGA32U4_VECTORS,
        features: Features { mul: true, jmp_call: true, elpm: true, spm_page_words: 64 },
        reserved_io: &[],
        io_names: MEGA32U4_IO,
        sleep_enable: BitField::bit(0x53, 0),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: Some(0x5B),
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x60, vector: Some(12) }),
        ports: MEGA32U4_PORTS,
        timer0: Some(mega328_timer0(23, 21, 22)),
        usart: Some(usart0(0xC8, 25)),
        ext_int: Some(ExtIntAddrs { mask: 0x3D, flags: 0x3C, lines: MEGA32U4_INT }),
        eeprom: Some(mega328_eeprom(30)),
    },
    Variant {
        name: "atmega1284p",
        signature: [0x1E, 0x97, 0x05],
        flash_size: 128 * 1024,
        sram_size: 16 * 1024,
        eeprom_size: 4096,
        io_top: 0xFF,
        vector_words: 2,
        vectors: MEGA1284_VECTORS,
        features: Features { mul: true, jmp_call: true, elpm: true, spm_page_words: 128 },
        reserved_io: &[],
        io_names: MEGA1284_IO,
        sleep_enable: BitField::bit(0x53, 0),
        mcusr: 0x54,
        spmcsr: Some(0x57),
        rampz: Some(0x5B),
        watchdog: Some(WatchdogAddrs { wdtcsr: 0x60, vector: Some(8) }),
        ports: MEGA1284_PORTS,
        timer0: Some(mega328_timer0(18, 16, 17)),
        usart: Some(usart0(0xC0, 20)),
        ext_int: Some(ExtIntAddrs { mask: 0x3D, flags: 0x3C, lines: MEGA1284_INT }),
        eeprom: Some(mega328_eeprom(25)),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let v = Variant::lookup("ATmega328P").unwrap();
        assert_eq!(v.name, "atmega328p");
        assert_eq!(v.ram_start(), 0x100);
        assert!(matches!(Variant::lookup("z80"), Err(ConfigError::UnknownVariant(_))));
    }

    #[test]
    fn test_vector_addresses() {
        let m328 = Variant::lookup("atmega328p").unwrap();
        assert_eq!(m328.vector_count(), 26);
        assert_eq!(m328.vector_address(16), 0x20);
        assert_eq!(m328.vector_by_name("timer0_ovf"), Some(16));

        let m8 = Variant::lookup("atmega8").unwrap();
        assert_eq!(m8.vector_address(9), 9);
        assert_eq!(m8.vector_name(9), Some("TIMER0_OVF"));

        // Two-word slots
        let u4 = Variant::lookup("atmega32u4").unwrap();
        assert_eq!(u4.vector_address(23), 0x2E);
    }

    #[test]
    fn test_peripheral_vectors_exist() {
        for v in Variant::all() {
            let n = v.vector_count() as u8;
            if let Some(t) = v.timer0 {
                assert!(t.ovf_vector < n, "{}", v.name);
                assert_eq!(v.vector_name(t.ovf_vector).map(|s| s.contains("OVF")), Some(true), "{}", v.name);
            }
            if let Some(u) = v.usart {
                assert!(u.tx_vector < n, "{}", v.name);
            }
            if let Some(e) = v.eeprom {
                assert!(v.vector_name(e.ready_vector).unwrap().starts_with("EE"), "{}", v.name);
            }
            if let Some(ei) = v.ext_int {
                for line in ei.lines {
                    assert!(v.vector_name(line.vector).unwrap().starts_with("INT"), "{}", v.name);
                }
            }
            if let Some(w) = v.watchdog {
                if let Some(vec) = w.vector {
                    assert_eq!(v.vector_name(vec), Some("WDT"), "{}", v.name);
                }
            }
            assert_eq!(v.io_name(0x5F), Some("SREG"), "{}", v.name);
        }
    }

    #[test]
    fn test_reserved_io() {
        let v = Variant::lookup("atmega328p").unwrap();
        assert!(v.is_reserved_io(0x20));
        assert!(v.is_reserved_io(0xC7));
        assert!(!v.is_reserved_io(0x25));
        assert_eq!(v.io_addr("portb"), Some(0x25));
    }
}
