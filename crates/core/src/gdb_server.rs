//! GDB Remote Serial Protocol server.
//!
//! Implements the GDB RSP over TCP, enabling connection from `avr-gdb` or
//! any GDB-compatible client. Supports:
//!
//! - Register read/write (`g`/`G`/`p`/`P`)
//! - Memory read/write (`m`/`M`) through the unified address space
//! - Single step (`s`) and continue (`c`), with Ctrl-C (0x03) interrupt
//! - Breakpoints (`Z0`/`Z1`) and watchpoints (`Z2` write, `Z3` read, `Z4` access)
//! - Detach (`D`), kill (`k`), `QStartNoAckMode` and `monitor reset`
//!
//! ## Usage
//!
//! ```text
//! avrsim blink.elf --gdb 1234
//! avr-gdb blink.elf -ex "target remote :1234"
//! ```
//!
//! The AVR register layout for GDB: R0-R31 (32 bytes), SREG (1), SP (2 LE),
//! PC (byte address, 4 LE).

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::debugger::{StopReason, WatchKind, REG_SPH, REG_SPL};
use crate::memory::DATA_BASE;
use crate::{Avr, EngineError, StepOutcome, REG_COUNT};

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
const INTERRUPT: u8 = 0x03;
const SIGINT: u8 = 2;
const SIGTRAP: u8 = 5;
const SIGSEGV: u8 = 11;
/// Bytes in a `g` reply: 32 registers, SREG, SP, PC
const G_LEN: usize = 32 + 1 + 2 + 4;
const RESEND_LIMIT: usize = 3;

pub struct GdbServer {
    listener: TcpListener,
    port: u16,
}

impl GdbServer {
    /// Listen on 127.0.0.1:`port` (0 picks a free port).
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        log::info!("gdb server listening on 127.0.0.1:{}", port);
        Ok(GdbServer { listener, port })
    }

    /// Wait for a client (blocking).
    pub fn accept(&self) -> io::Result<GdbSession<TcpStream>> {
        let (stream, addr) = self.listener.accept()?;
        log::info!("gdb client connected from {}", addr);
        stream.set_nodelay(true)?;
        Ok(GdbSession::new(stream))
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// One inbound item from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Vec<u8>),
    /// Out-of-band 0x03
    Interrupt,
}

/// What the session loop does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reply(String),
    /// Reply, then stop acknowledging packets
    ReplyNoAck(String),
    Continue,
    Step,
    Detach,
    Kill,
}

/// A connected client.
pub struct GdbSession<S> {
    stream: S,
    buf: Vec<u8>,
    no_ack: bool,
}

impl<S: Read + Write> GdbSession<S> {
    pub fn new(stream: S) -> Self {
        GdbSession { stream, buf: Vec::with_capacity(4096), no_ack: false }
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.stream.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Read one packet. Bad checksums are NAKed with `-` and the client is
    /// expected to resend.
    pub fn read_packet(&mut self) -> io::Result<Packet> {
        loop {
            // Skip acks and noise until '$' or an interrupt
            loop {
                match self.read_byte()? {
                    INTERRUPT => return Ok(Packet::Interrupt),
                    b'$' => break,
                    _ => {}
                }
            }
            self.buf.clear();
            loop {
                match self.read_byte()? {
                    b'#' => break,
                    b => self.buf.push(b),
                }
            }
            let hi = self.read_byte()?;
            let lo = self.read_byte()?;
            let expected = hex_nibble(hi).zip(hex_nibble(lo)).map(|(h, l)| (h << 4) | l);
            let sum = checksum(&self.buf);

            if self.no_ack {
                return Ok(Packet::Data(self.buf.clone()));
            }
            if expected == Some(sum) {
                self.stream.write_all(b"+")?;
                self.stream.flush()?;
                return Ok(Packet::Data(self.buf.clone()));
            }
            log::debug!("gdb: checksum mismatch (got {:02x}, computed {:02x})", expected.unwrap_or(0), sum);
            self.stream.write_all(b"-")?;
            self.stream.flush()?;
        }
    }

    /// Send `$data#cs`, resending on `-` until acknowledged.
    pub fn send_packet(&mut self, data: &[u8]) -> io::Result<()> {
        let cs = checksum(data);
        let mut pkt = Vec::with_capacity(data.len() + 4);
        pkt.push(b'$');
        pkt.extend_from_slice(data);
        pkt.push(b'#');
        pkt.push(HEX_CHARS[(cs >> 4) as usize]);
        pkt.push(HEX_CHARS[(cs & 0xF) as usize]);

        for _ in 0..RESEND_LIMIT {
            self.stream.write_all(&pkt)?;
            self.stream.flush()?;
            if self.no_ack || self.read_byte()? != b'-' {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn no_ack(&self) -> bool {
        self.no_ack
    }
}

impl GdbSession<TcpStream> {
    /// Serve the client until it detaches, kills or disconnects.
    /// `after_resume` runs after every step or continue, e.g. to flush
    /// serial output.
    pub fn serve(&mut self, avr: &mut Avr, mut after_resume: impl FnMut(&mut Avr)) -> io::Result<()> {
        loop {
            let packet = match self.read_packet() {
                Ok(Packet::Data(p)) => p,
                Ok(Packet::Interrupt) => {
                    self.send_packet(format!("S{:02x}", SIGINT).as_bytes())?;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::info!("gdb client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let text = String::from_utf8_lossy(&packet);
            log::trace!("gdb <- {}", text);

            match handle_packet(avr, &text) {
                Action::Reply(r) => self.send_packet(r.as_bytes())?,
                Action::ReplyNoAck(r) => {
                    self.send_packet(r.as_bytes())?;
                    self.no_ack = true;
                }
                Action::Step => {
                    let reply = stop_reply_for_step(avr.step());
                    after_resume(avr);
                    self.send_packet(reply.as_bytes())?;
                }
                Action::Continue => {
                    let result = self.run_interruptible(avr)?;
                    after_resume(avr);
                    self.send_packet(stop_reply(result).as_bytes())?;
                }
                Action::Detach => {
                    self.send_packet(b"OK")?;
                    return Ok(());
                }
                Action::Kill => return Ok(()),
            }
        }
    }

    /// Continue with a side thread watching the socket for 0x03.
    fn run_interruptible(&mut self, avr: &mut Avr) -> io::Result<Result<StopReason, EngineError>> {
        let mut watcher = self.stream.try_clone()?;
        watcher.set_read_timeout(Some(Duration::from_millis(50)))?;
        let pause = avr.pause_handle();
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);

        let handle = thread::spawn(move || {
            let mut b = [0u8; 1];
            while !done.load(Ordering::SeqCst) {
                match watcher.read(&mut b) {
                    Ok(1) if b[0] == INTERRUPT => {
                        pause.request();
                        break;
                    }
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                    Err(_) => break,
                }
            }
        });

        let result = avr.run_until_breakpoint(None);
        finished.store(true, Ordering::SeqCst);
        let _ = handle.join();
        self.stream.set_read_timeout(None)?;
        Ok(result)
    }
}

/// Execute one command packet against the machine.
pub fn handle_packet(avr: &mut Avr, packet: &str) -> Action {
    let reply = |s: &str| Action::Reply(s.to_string());
    let Some(cmd) = packet.chars().next() else { return reply("") };
    let args = &packet[cmd.len_utf8()..];

    match cmd {
        '?' => Action::Reply(format!("S{:02x}", SIGTRAP)),
        'g' => Action::Reply(hex_encode(&read_all_registers(avr))),
        'G' => match parse_hex_bytes(args) {
            Some(bytes) if bytes.len() >= G_LEN - 4 => {
                write_all_registers(avr, &bytes);
                reply("OK")
            }
            _ => reply("E01"),
        },
        'p' => match parse_hex_u32(args.as_bytes()).and_then(|n| read_register(avr, n)) {
            Some(bytes) => Action::Reply(hex_encode(&bytes)),
            None => reply("E01"),
        },
        'P' => {
            let parsed = args.split_once('=').and_then(|(n, v)| {
                Some((parse_hex_u32(n.as_bytes())?, parse_hex_bytes(v)?))
            });
            match parsed {
                Some((n, v)) if write_register(avr, n, &v) => reply("OK"),
                _ => reply("E01"),
            }
        }
        'm' => {
            let parsed = args.split_once(',').and_then(|(a, l)| {
                Some((parse_hex_u32(a.as_bytes())?, parse_hex_u32(l.as_bytes())?))
            });
            match parsed.and_then(|(addr, len)| avr.read_unified(addr, len as usize).ok()) {
                Some(bytes) => Action::Reply(hex_encode(&bytes)),
                None => reply("E01"),
            }
        }
        'M' => {
            let parsed = args.split_once(':').and_then(|(head, data)| {
                let (a, _len) = head.split_once(',')?;
                Some((parse_hex_u32(a.as_bytes())?, parse_hex_bytes(data)?))
            });
            match parsed.map(|(addr, bytes)| avr.write_unified(addr, &bytes)) {
                Some(Ok(())) => reply("OK"),
                _ => reply("E01"),
            }
        }
        'c' | 's' => {
            if let Some(addr) = parse_hex_u32(args.as_bytes()) {
                avr.cpu.pc = (addr / 2) as u16;
            }
            if cmd == 'c' { Action::Continue } else { Action::Step }
        }
        'Z' | 'z' => set_point(avr, cmd == 'Z', args),
        'D' => Action::Detach,
        'k' => Action::Kill,
        'H' | 'T' => reply("OK"),
        'q' => query(avr, args),
        'Q' if args == "StartNoAckMode" => Action::ReplyNoAck("OK".into()),
        'v' => {
            if args == "Cont?" {
                reply("vCont;c;s")
            } else if args.starts_with("Cont;c") {
                Action::Continue
            } else if args.starts_with("Cont;s") {
                Action::Step
            } else {
                // vMustReplyEmpty and everything unsupported
                reply("")
            }
        }
        _ => reply(""),
    }
}

fn query(avr: &mut Avr, q: &str) -> Action {
    let r = match q {
        _ if q.starts_with("Supported") => "PacketSize=1000;QStartNoAckMode+",
        "Attached" => "1",
        "C" => "QC1",
        "fThreadInfo" => "m1",
        "sThreadInfo" => "l",
        "Offsets" => "Text=0;Data=0;Bss=0",
        _ if q.starts_with("Rcmd,") => {
            let cmd = parse_hex_bytes(&q[5..]).map(|b| String::from_utf8_lossy(&b).trim().to_string());
            return match cmd.as_deref() {
                Some("reset") => {
                    avr.reset();
                    Action::Reply("OK".into())
                }
                Some(other) => Action::Reply(hex_encode(format!("unknown monitor command '{}'\n", other).as_bytes())),
                None => Action::Reply("E01".into()),
            };
        }
        _ => "",
    };
    Action::Reply(r.to_string())
}

/// `Z`/`z` type,addr,kind
fn set_point(avr: &mut Avr, insert: bool, args: &str) -> Action {
    let mut parts = args.splitn(3, ',');
    let ty = parts.next().and_then(|t| parse_hex_u32(t.as_bytes()));
    let addr = parts.next().and_then(|a| parse_hex_u32(a.as_bytes()));
    let len = parts.next().and_then(|k| parse_hex_u32(k.as_bytes())).unwrap_or(1).max(1);
    let (Some(ty), Some(addr)) = (ty, addr) else { return Action::Reply("E01".into()) };

    let kind = match ty {
        0 | 1 => {
            let pc = (addr / 2) as u16;
            if insert {
                avr.breakpoints.insert(pc);
            } else {
                avr.breakpoints.remove(pc);
            }
            return Action::Reply("OK".into());
        }
        2 => WatchKind::Write,
        3 => WatchKind::Read,
        4 => WatchKind::Access,
        _ => return Action::Reply(String::new()),
    };
    let Some(offset) = addr.checked_sub(DATA_BASE).filter(|&o| (o as usize) < avr.mem.data.len()) else {
        return Action::Reply("E01".into());
    };
    for i in 0..len.min(8) {
        let a = (offset + i) as u16;
        if insert {
            avr.watchpoints.insert(a, kind);
        } else {
            avr.watchpoints.remove(a);
        }
    }
    Action::Reply("OK".into())
}

fn read_all_registers(avr: &Avr) -> Vec<u8> {
    let mut out = Vec::with_capacity(G_LEN);
    out.extend_from_slice(&avr.mem.data[..REG_COUNT]);
    out.push(avr.mem.data[crate::SREG_ADDR as usize]);
    out.extend_from_slice(&avr.sp().to_le_bytes());
    out.extend_from_slice(&(avr.cpu.pc as u32 * 2).to_le_bytes());
    out
}

fn write_all_registers(avr: &mut Avr, bytes: &[u8]) {
    avr.mem.data[..REG_COUNT].copy_from_slice(&bytes[..REG_COUNT]);
    avr.mem.data[crate::SREG_ADDR as usize] = bytes[32];
    avr.set_sp(u16::from_le_bytes([bytes[33], bytes[34]]));
    if let Some(pc) = bytes.get(35..39) {
        avr.cpu.pc = (u32::from_le_bytes([pc[0], pc[1], pc[2], pc[3]]) / 2) as u16;
    }
}

/// GDB register numbering: 0-31, 32 SREG, 33 SP, 34 PC.
fn read_register(avr: &Avr, n: u32) -> Option<Vec<u8>> {
    match n {
        0..=32 => avr.fetch_register(n as u8).ok().map(|v| vec![v]),
        33 => Some(avr.sp().to_le_bytes().to_vec()),
        34 => Some((avr.cpu.pc as u32 * 2).to_le_bytes().to_vec()),
        _ => None,
    }
}

fn write_register(avr: &mut Avr, n: u32, v: &[u8]) -> bool {
    match (n, v) {
        (0..=32, [b, ..]) => avr.write_register(n as u8, *b).is_ok(),
        (33, [lo, hi, ..]) => {
            avr.write_register(REG_SPL, *lo).is_ok() && avr.write_register(REG_SPH, *hi).is_ok()
        }
        (34, [a, b, c, d, ..]) => {
            avr.cpu.pc = (u32::from_le_bytes([*a, *b, *c, *d]) / 2) as u16;
            true
        }
        _ => false,
    }
}

/// Stop reply for a finished continue.
pub fn stop_reply(result: Result<StopReason, EngineError>) -> String {
    match result {
        Ok(StopReason::Watchpoint(hit)) => {
            let tag = match hit.kind {
                WatchKind::Read => "rwatch",
                _ => "watch",
            };
            format!("T{:02x}{}:{:x};", SIGTRAP, tag, DATA_BASE + hit.addr as u32)
        }
        Ok(StopReason::Paused) => format!("S{:02x}", SIGINT),
        Ok(_) => format!("S{:02x}", SIGTRAP),
        Err(e) => {
            log::warn!("gdb: {}", e);
            format!("S{:02x}", SIGSEGV)
        }
    }
}

fn stop_reply_for_step(result: Result<StepOutcome, EngineError>) -> String {
    match result {
        Ok(_) => format!("S{:02x}", SIGTRAP),
        Err(e) => stop_reply(Err(e)),
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0xF) as usize] as char);
    }
    s
}

fn parse_hex_u32(s: &[u8]) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut val = 0u32;
    for &b in s {
        val = val.checked_mul(16)?.checked_add(hex_nibble(b)? as u32)?;
    }
    Some(val)
}

fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    let s = s.as_bytes();
    if s.len() % 2 != 0 {
        return None;
    }
    s.chunks(2).map(|p| Some((hex_nibble(p[0])? << 4) | hex_nibble(p[1])?)).collect()
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::WatchHit;
    use crate::MachineConfig;
    use std::io::Cursor;

    /// In-memory duplex stream.
    struct Pipe {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn session(input: &[u8]) -> GdbSession<Pipe> {
        GdbSession::new(Pipe { input: Cursor::new(input.to_vec()), output: Vec::new() })
    }

    fn avr() -> Avr {
        Avr::new(&MachineConfig::new("atmega328p")).unwrap()
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32(b"1234"), Some(0x1234));
        assert_eq!(parse_hex_u32(b"FF"), Some(0xFF));
        assert_eq!(parse_hex_u32(b""), None);
        assert_eq!(parse_hex_bytes("48656C6C6F"), Some(b"Hello".to_vec()));
        assert_eq!(parse_hex_bytes("4"), None);
    }

    #[test]
    fn test_packet_ack_and_nak() {
        // "?" checksums to 0x3f; first copy is corrupted
        let mut s = session(b"+$?#00$?#3f");
        assert_eq!(s.read_packet().unwrap(), Packet::Data(b"?".to_vec()));
        assert_eq!(s.stream.output, b"-+".to_vec());
    }

    #[test]
    fn test_interrupt_byte() {
        let mut s = session(&[INTERRUPT]);
        assert_eq!(s.read_packet().unwrap(), Packet::Interrupt);
    }

    #[test]
    fn test_send_packet_framing_and_resend() {
        let mut s = session(b"-+");
        s.send_packet(b"OK").unwrap();
        assert_eq!(s.stream.output, b"$OK#9a$OK#9a".to_vec());
    }

    #[test]
    fn test_register_layout() {
        let mut a = avr();
        a.mem.data[1] = 0xAB;
        a.mem.data[crate::SREG_ADDR as usize] = 0x80;
        a.cpu.pc = 0x0102;
        let Action::Reply(g) = handle_packet(&mut a, "g") else { panic!() };
        assert_eq!(g.len(), G_LEN * 2);
        assert_eq!(&g[2..4], "ab");
        assert_eq!(&g[64..66], "80");
        // SP = RAMEND 0x08FF little-endian
        assert_eq!(&g[66..70], "ff08");
        assert_eq!(&g[70..78], "04020000");
        assert_eq!(handle_packet(&mut a, "p22"), Action::Reply("04020000".into()));
        assert_eq!(handle_packet(&mut a, "p99"), Action::Reply("E01".into()));
    }

    #[test]
    fn test_write_registers() {
        let mut a = avr();
        assert_eq!(handle_packet(&mut a, "P10=7f"), Action::Reply("OK".into()));
        assert_eq!(a.mem.data[16], 0x7F);
        assert_eq!(handle_packet(&mut a, "P21=0004"), Action::Reply("OK".into()));
        assert_eq!(a.sp(), 0x0400);
        assert_eq!(handle_packet(&mut a, "P22=10000000"), Action::Reply("OK".into()));
        assert_eq!(a.cpu.pc, 8);

        let Action::Reply(g) = handle_packet(&mut a, "g") else { panic!() };
        let mut a2 = avr();
        assert_eq!(handle_packet(&mut a2, &format!("G{}", g)), Action::Reply("OK".into()));
        assert_eq!(a2.mem.data[16], 0x7F);
        assert_eq!(a2.cpu.pc, 8);
    }

    #[test]
    fn test_memory_access() {
        let mut a = avr();
        assert_eq!(handle_packet(&mut a, "M800100,2:beef"), Action::Reply("OK".into()));
        assert_eq!(handle_packet(&mut a, "m800100,2"), Action::Reply("beef".into()));
        // Erased flash
        assert_eq!(handle_packet(&mut a, "m0,2"), Action::Reply("ffff".into()));
        assert_eq!(handle_packet(&mut a, "m810000,1"), Action::Reply("ff".into()));
        assert_eq!(handle_packet(&mut a, "m80ffff,4"), Action::Reply("E01".into()));
    }

    #[test]
    fn test_breakpoints_and_watchpoints() {
        let mut a = avr();
        assert_eq!(handle_packet(&mut a, "Z0,100,2"), Action::Reply("OK".into()));
        assert!(a.breakpoints.is_set(0x80));
        handle_packet(&mut a, "z0,100,2");
        assert!(!a.breakpoints.is_set(0x80));

        assert_eq!(handle_packet(&mut a, "Z2,800200,2"), Action::Reply("OK".into()));
        assert!(a.watchpoints.is_set(0x200) && a.watchpoints.is_set(0x201));
        assert_eq!(a.watchpoints.get(0x200).map(|w| w.kind), Some(WatchKind::Write));
        handle_packet(&mut a, "z2,800200,2");
        assert!(a.watchpoints.is_empty());
        // Watchpoints only cover data space
        assert_eq!(handle_packet(&mut a, "Z3,100,1"), Action::Reply("E01".into()));
    }

    #[test]
    fn test_queries_and_control() {
        let mut a = avr();
        assert_eq!(handle_packet(&mut a, "qAttached"), Action::Reply("1".into()));
        assert_eq!(handle_packet(&mut a, "qfThreadInfo"), Action::Reply("m1".into()));
        assert_eq!(handle_packet(&mut a, "vMustReplyEmpty"), Action::Reply(String::new()));
        assert_eq!(handle_packet(&mut a, "QStartNoAckMode"), Action::ReplyNoAck("OK".into()));
        assert_eq!(handle_packet(&mut a, "c"), Action::Continue);
        assert_eq!(handle_packet(&mut a, "s20"), Action::Step);
        assert_eq!(a.cpu.pc, 0x10);
        assert_eq!(handle_packet(&mut a, "D"), Action::Detach);
        assert_eq!(handle_packet(&mut a, "k"), Action::Kill);
    }

    #[test]
    fn test_monitor_reset() {
        let mut a = avr();
        a.cpu.pc = 0x40;
        // "reset" hex-encoded
        assert_eq!(handle_packet(&mut a, "qRcmd,7265736574"), Action::Reply("OK".into()));
        assert_eq!(a.cpu.pc, 0);
    }

    #[test]
    fn test_stop_replies() {
        let hit = WatchHit { addr: 0x100, kind: WatchKind::Write, old: 0, new: 1, pc: 0 };
        assert_eq!(stop_reply(Ok(StopReason::Watchpoint(hit))), "T05watch:800100;");
        assert_eq!(stop_reply(Ok(StopReason::Paused)), "S02");
        assert_eq!(stop_reply(Ok(StopReason::Breakpoint(4))), "S05");
        assert_eq!(stop_reply(Err(EngineError::PcOutOfRange { pc: 0, words: 0 })), "S0b");
    }
}
