//! Error types for configuration, loading, memory access, execution and
//! peripheral registration.

use thiserror::Error;

use crate::memory::Region;

/// Problems detected while resolving a [`MachineConfig`](crate::MachineConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown microcontroller '{0}' (use --list-mcus to see supported models)")]
    UnknownVariant(String),
    #[error("{region} size {size} bytes is outside the supported range {min}..={max}")]
    SizeOutOfBounds { region: Region, size: usize, min: usize, max: usize },
    #[error("flash size {0} must be a whole number of 16-bit words")]
    OddFlashSize(usize),
    #[error("clock frequency {0} Hz is outside the supported range")]
    BadClock(u32),
}

/// Program image loading failures.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hex line {line}: {msg}")]
    Hex { line: usize, msg: String },
    #[error("elf: {0}")]
    Elf(String),
    #[error("image does not fit: {0}")]
    Range(#[from] AccessError),
}

/// Debugger-facing access outside a region or register set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("{region} access at 0x{addr:04X} (+{len}) exceeds region size 0x{size:X}")]
    OutOfRange { region: Region, addr: u32, len: usize, size: usize },
    #[error("no register with index {0}")]
    BadRegister(u8),
}

/// Fatal conditions raised by the execution engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("program counter 0x{pc:04X} (word) ran past the end of flash (0x{words:04X} words)")]
    PcOutOfRange { pc: u16, words: usize },
}

/// Peripheral registration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("address 0x{0:04X} is not in I/O space")]
    NotIoSpace(u16),
    #[error("peripheral '{name}' registered 0x{addr:04X} outside its claimed range")]
    Unclaimed { name: &'static str, addr: u16 },
    #[error("vector {0} does not exist on this model")]
    BadVector(u8),
    #[error("vector {0} already has an acknowledge hook")]
    AckTaken(u8),
    #[error("out of memory registering dispatch entry")]
    Exhausted,
}

/// Save state encode/decode failures.
#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a save state file")]
    BadMagic,
    #[error("unsupported save state version {0}")]
    Version(u32),
    #[error("save state is for {found}, machine is {expected}")]
    VariantMismatch { expected: String, found: String },
    #[error("decompression failed")]
    Inflate,
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("save state does not match machine layout: {0}")]
    Layout(String),
}
