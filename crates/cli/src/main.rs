//! avrsim: run AVR firmware from the command line.
//!
//! Modes:
//! - batch (default): run until a stop condition, optionally echoing the UART
//! - `--interactive`: line-oriented debugger console
//! - `--gdb PORT`: GDB remote protocol stub

mod console;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueEnum};

use avrsim_core::gdb_server::GdbServer;
use avrsim_core::hex::parse_hex;
use avrsim_core::memory::Region;
use avrsim_core::{Avr, EngineError, MachineConfig, StopReason, Variant, DEFAULT_CLOCK_HZ, DEFAULT_MCU};

use console::{describe_stop, parse_watch, resolve_code, Console};

/// Cycles per batch slice; UART output is flushed between slices.
const SLICE_CYCLES: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// ELF if the file starts with the ELF magic, Intel HEX otherwise
    Auto,
    Hex,
    Elf,
}

#[derive(Parser, Debug)]
#[command(name = "avrsim", version)]
#[command(about = "Cycle-accurate AVR microcontroller simulator", long_about = None)]
struct Args {
    /// Firmware image (Intel HEX or ELF)
    #[arg(value_name = "PROGRAM", required_unless_present = "list_mcus")]
    program: Option<PathBuf>,

    /// Microcontroller model
    #[arg(short, long, default_value = DEFAULT_MCU)]
    mcu: String,

    /// Core clock in Hz
    #[arg(short, long, default_value_t = DEFAULT_CLOCK_HZ)]
    frequency: u32,

    #[arg(long, value_enum, default_value_t = Format::Auto)]
    format: Format,

    /// Override the model's flash size in bytes
    #[arg(long, value_name = "BYTES")]
    flash_size: Option<usize>,

    /// Override the model's SRAM size in bytes
    #[arg(long, value_name = "BYTES")]
    sram_size: Option<usize>,

    /// Override the model's EEPROM size in bytes
    #[arg(long, value_name = "BYTES")]
    eeprom_size: Option<usize>,

    /// Serve the GDB remote protocol on this TCP port
    #[arg(long, value_name = "PORT", conflicts_with = "interactive")]
    gdb: Option<u16>,

    /// Start the interactive debugger console
    #[arg(short, long, action = ArgAction::SetTrue)]
    interactive: bool,

    /// Breakpoint: byte address, symbol or file:line (repeatable)
    #[arg(short = 'b', long = "break", value_name = "LOC")]
    breakpoints: Vec<String>,

    /// Watchpoint: data address or symbol, optional :r, :w or :a (repeatable)
    #[arg(short = 'w', long = "watch", value_name = "ADDR[:KIND]")]
    watchpoints: Vec<String>,

    /// Stop a batch run after this many cycles
    #[arg(long, value_name = "CYCLES")]
    max_cycles: Option<u64>,

    /// Copy UART transmit output to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    uart_stdout: bool,

    /// Feed this file's bytes to the UART receiver
    #[arg(long, value_name = "FILE")]
    uart_input: Option<PathBuf>,

    /// Initial EEPROM contents (raw binary, or Intel HEX by .hex/.eep extension)
    #[arg(long, value_name = "FILE")]
    eeprom: Option<PathBuf>,

    /// Restore a save state before running
    #[arg(long, value_name = "FILE")]
    load_state: Option<PathBuf>,

    /// Write a save state when the run ends
    #[arg(long, value_name = "FILE")]
    save_state: Option<PathBuf>,

    /// Print an execution profile when the run ends
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// List supported microcontroller models and exit
    #[arg(long, action = ArgAction::SetTrue)]
    list_mcus: bool,
}

/// Why the process exits unsuccessfully.
enum Failure {
    /// Configuration or image problem (exit 2)
    Setup(String),
    /// Fatal engine condition (exit 1)
    Engine(EngineError),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

fn setup<E: std::fmt::Display>(context: impl std::fmt::Display) -> impl FnOnce(E) -> Failure {
    move |e| Failure::Setup(format!("{}: {}", context, e))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if args.list_mcus {
        list_mcus();
        return ExitCode::SUCCESS;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Setup(msg)) => {
            eprintln!("error: {}", msg);
            ExitCode::from(2)
        }
        Err(Failure::Engine(e)) => {
            eprintln!("fatal: {}", e);
            ExitCode::from(1)
        }
    }
}

fn list_mcus() {
    println!("{:<12} {:>7} {:>6} {:>7}  vectors", "model", "flash", "sram", "eeprom");
    for v in Variant::all() {
        println!(
            "{:<12} {:>7} {:>6} {:>7}  {}",
            v.name,
            v.flash_size,
            v.sram_size,
            v.eeprom_size,
            v.vector_count()
        );
    }
}

fn run(args: &Args) -> Result<(), Failure> {
    let program = args.program.as_deref().ok_or_else(|| Failure::Setup("no program given".into()))?;
    let mut avr = build_machine(args)?;
    load_program(&mut avr, program, args.format)?;

    if let Some(path) = &args.eeprom {
        load_eeprom(&mut avr, path)?;
    }
    if let Some(path) = &args.load_state {
        avr.load_state_file(path).map_err(setup(path.display()))?;
    }
    if let Some(path) = &args.uart_input {
        let bytes = std::fs::read(path).map_err(setup(path.display()))?;
        if !avr.uart_input(&bytes) {
            log::warn!("{} has no USART; --uart-input ignored", avr.variant.name);
        }
    }
    for loc in &args.breakpoints {
        let pc = resolve_code(&avr, loc).map_err(|e| Failure::Setup(format!("--break {}: {}", loc, e)))?;
        avr.breakpoints.insert(pc);
    }
    for spec in &args.watchpoints {
        let (addr, kind) = parse_watch(&avr, spec).map_err(|e| Failure::Setup(format!("--watch {}: {}", spec, e)))?;
        avr.watchpoints.insert(addr, kind);
    }
    if args.profile {
        avr.profiler.start(avr.cpu.cycles);
    }

    let result = if let Some(port) = args.gdb {
        run_gdb(&mut avr, port, args.uart_stdout)
    } else if args.interactive {
        Console::new(&mut avr, program, args.uart_stdout).run().map_err(Failure::from)
    } else {
        run_batch(&mut avr, args.max_cycles, args.uart_stdout)
    };

    flush_uart(&mut avr, args.uart_stdout);
    if args.profile {
        avr.profiler.stop(avr.cpu.cycles);
        eprint!("{}", avr.profiler.report(&avr.mem.flash, Some(&avr.symbols)));
    }
    if let Some(path) = &args.save_state {
        match avr.save_state_file(path) {
            Ok(()) => log::info!("state saved to {}", path.display()),
            Err(e) => eprintln!("warning: could not save state to {}: {}", path.display(), e),
        }
    }
    result
}

fn build_machine(args: &Args) -> Result<Avr, Failure> {
    let config = MachineConfig {
        variant: args.mcu.clone(),
        clock_hz: args.frequency,
        flash_size: args.flash_size,
        sram_size: args.sram_size,
        eeprom_size: args.eeprom_size,
    };
    let avr = Avr::new(&config).map_err(|e| Failure::Setup(e.to_string()))?;
    avr.with_standard_peripherals().map_err(|e| Failure::Setup(e.to_string()))
}

fn load_program(avr: &mut Avr, path: &Path, format: Format) -> Result<(), Failure> {
    let data = std::fs::read(path).map_err(setup(path.display()))?;
    let is_elf = match format {
        Format::Auto => data.starts_with(b"\x7fELF"),
        Format::Hex => false,
        Format::Elf => true,
    };
    if is_elf {
        avr.load_elf(&data).map_err(setup(path.display()))?;
    } else {
        let text = String::from_utf8(data).map_err(|_| Failure::Setup(format!("{}: not a text HEX file", path.display())))?;
        avr.load_hex(&text).map_err(setup(path.display()))?;
    }
    Ok(())
}

fn load_eeprom(avr: &mut Avr, path: &Path) -> Result<(), Failure> {
    let data = std::fs::read(path).map_err(setup(path.display()))?;
    let is_hex = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("hex") || e.eq_ignore_ascii_case("eep"));
    if is_hex {
        let text = String::from_utf8_lossy(&data);
        for (addr, bytes) in parse_hex(&text).map_err(setup(path.display()))? {
            avr.write_memory(Region::Eeprom, addr, &bytes).map_err(setup(path.display()))?;
        }
    } else {
        avr.write_memory(Region::Eeprom, 0, &data).map_err(setup(path.display()))?;
    }
    Ok(())
}

fn flush_uart(avr: &mut Avr, to_stdout: bool) {
    let out = avr.uart_output();
    if to_stdout && !out.is_empty() {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&out);
        let _ = stdout.flush();
    }
}

/// Run in slices until something other than the slice limit stops the
/// machine, or the overall cycle budget is spent.
fn run_batch(avr: &mut Avr, max_cycles: Option<u64>, uart_stdout: bool) -> Result<(), Failure> {
    let start = avr.cpu.cycles;
    let reason = loop {
        let used = avr.cpu.cycles - start;
        let slice = match max_cycles {
            Some(max) if used >= max => break StopReason::CycleLimit,
            Some(max) => SLICE_CYCLES.min(max - used),
            None => SLICE_CYCLES,
        };
        // A slice boundary may land on a breakpoint the next slice would skip
        if used > 0 && avr.breakpoints.is_set(avr.cpu.pc) && !avr.cpu.sleeping {
            break StopReason::Breakpoint(avr.cpu.pc);
        }
        let stop = avr.run_until_breakpoint(Some(slice));
        flush_uart(avr, uart_stdout);
        match stop? {
            StopReason::CycleLimit => continue,
            other => break other,
        }
    };
    eprintln!("*** {} after {} cycles", describe_stop(avr, &reason), avr.cpu.cycles - start);
    if reason != StopReason::CycleLimit {
        eprint!("{}", avr.dump_registers());
    }
    Ok(())
}

fn run_gdb(avr: &mut Avr, port: u16, uart_stdout: bool) -> Result<(), Failure> {
    let server = GdbServer::bind(port).map_err(setup(format!("gdb port {}", port)))?;
    eprintln!("waiting for gdb on 127.0.0.1:{}", server.port());
    let mut session = server.accept().map_err(setup("gdb accept"))?;
    if let Err(e) = session.serve(avr, |a| flush_uart(a, uart_stdout)) {
        log::warn!("gdb session ended: {}", e);
    }
    Ok(())
}
