//! Minimal ELF and DWARF reader for AVR images.
//!
//! Extracts from a 32-bit little-endian ELF (EM_AVR = 83) as produced by
//! avr-gcc:
//! - Loadable segments, placed by physical address band: below 0x800000
//!   flash, 0x800000 data, 0x810000 EEPROM. A segment whose virtual
//!   address lies in the data band is also preloaded into data memory.
//! - `.symtab` functions and objects for the [`SymbolTable`]
//! - DWARF `.debug_line` (versions 2–4) for PC ↔ source line lookup
//!
//! Malformed input yields [`LoadError::Elf`]; nothing here panics on
//! truncated files.

use std::collections::BTreeMap;

use crate::error::LoadError;
use crate::memory::{DATA_BASE, EEPROM_BASE};
use crate::symbols::{Symbol, SymbolKind, SymbolTable};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EM_AVR: u16 = 83;
const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

/// Bytes destined for one place in the unified address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

/// Everything the machine takes from an ELF file.
#[derive(Debug, Clone)]
pub struct ElfImage {
    /// Entry point (byte address)
    pub entry: u32,
    pub segments: Vec<Segment>,
    pub symbols: Vec<Symbol>,
    pub lines: LineTable,
}

/// Byte address → (file, line) map from `.debug_line`.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    files: Vec<String>,
    /// (address, file index, line), sorted by address
    rows: Vec<(u32, usize, u32)>,
}

impl LineTable {
    fn from_map(map: BTreeMap<u32, (String, u32)>) -> Self {
        let mut t = LineTable::default();
        for (addr, (file, line)) in map {
            let idx = match t.files.iter().position(|f| *f == file) {
                Some(i) => i,
                None => {
                    t.files.push(file);
                    t.files.len() - 1
                }
            };
            t.rows.push((addr, idx, line));
        }
        t
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Source line for a byte address (nearest entry at or below).
    pub fn lookup(&self, byte_addr: u32) -> Option<(&str, u32)> {
        let i = self.rows.partition_point(|r| r.0 <= byte_addr).checked_sub(1)?;
        let (_, file, line) = self.rows[i];
        Some((short_name(&self.files[file]), line))
    }

    /// Lowest byte address generated for `file:line`. `file` matches the
    /// end of the recorded path.
    pub fn address_of(&self, file: &str, line: u32) -> Option<u32> {
        self.rows
            .iter()
            .filter(|(_, f, l)| *l == line && self.files[*f].ends_with(file))
            .map(|(a, _, _)| *a)
            .min()
    }
}

fn short_name(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

/// Bounds-checked little-endian reader.
struct Cursor<'a> {
    d: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(d: &'a [u8], pos: usize) -> Self {
        Cursor { d, pos }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.d.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let b = self.d.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.d.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uleb(&mut self) -> Option<u32> {
        let mut r = 0u32;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            if shift < 32 {
                r |= ((b & 0x7F) as u32) << shift;
            }
            if b & 0x80 == 0 {
                return Some(r);
            }
            shift += 7;
        }
    }

    fn sleb(&mut self) -> Option<i32> {
        let mut r = 0i32;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            if shift < 32 {
                r |= ((b & 0x7F) as i32) << shift;
            }
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 32 && b & 0x40 != 0 {
                    r |= !0i32 << shift;
                }
                return Some(r);
            }
        }
    }

    fn cstr(&mut self) -> Option<String> {
        let rest = self.d.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(String::from_utf8_lossy(&rest[..end]).into_owned())
    }
}

fn read_str(d: &[u8], off: usize) -> String {
    Cursor::at(d, off).cstr().unwrap_or_default()
}

fn bad(msg: &str) -> LoadError {
    LoadError::Elf(msg.to_string())
}

struct Section {
    name: u32,
    kind: u32,
    offset: usize,
    size: usize,
    link: usize,
    entsize: usize,
}

impl ElfImage {
    pub fn parse(data: &[u8]) -> Result<Self, LoadError> {
        if data.len() < 52 {
            return Err(bad("file too small for an ELF header"));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(bad("not an ELF file"));
        }
        if data[4] != 1 || data[5] != 1 {
            return Err(bad("only 32-bit little-endian ELF is supported"));
        }
        let mut h = Cursor::at(data, 18);
        let machine = h.u16().ok_or_else(|| bad("truncated header"))?;
        if machine != EM_AVR {
            return Err(LoadError::Elf(format!("not an AVR image (machine {})", machine)));
        }
        let header = (|| {
            let mut h = Cursor::at(data, 24);
            let entry = h.u32()?;
            let phoff = h.u32()? as usize;
            let shoff = h.u32()? as usize;
            h.pos = 42;
            let phentsize = h.u16()? as usize;
            let phnum = h.u16()? as usize;
            let shentsize = h.u16()? as usize;
            let shnum = h.u16()? as usize;
            let shstrndx = h.u16()? as usize;
            Some((entry, phoff, shoff, phentsize, phnum, shentsize, shnum, shstrndx))
        })();
        let (entry, phoff, shoff, phentsize, phnum, shentsize, shnum, shstrndx) =
            header.ok_or_else(|| bad("truncated header"))?;

        let segments = Self::segments(data, phoff, phentsize, phnum)?;

        let sections: Vec<Section> = (0..shnum)
            .filter_map(|i| {
                let mut c = Cursor::at(data, shoff + i * shentsize);
                let name = c.u32()?;
                let kind = c.u32()?;
                c.pos += 8;
                let offset = c.u32()? as usize;
                let size = c.u32()? as usize;
                let link = c.u32()? as usize;
                c.pos += 8;
                let entsize = c.u32()? as usize;
                Some(Section { name, kind, offset, size, link, entsize })
            })
            .collect();
        let shstr_off = sections.get(shstrndx).map(|s| s.offset).unwrap_or(0);

        let mut symbols = Vec::new();
        if let Some(symtab) = sections.iter().find(|s| s.kind == SHT_SYMTAB) {
            let strtab = sections.get(symtab.link).map(|s| s.offset).unwrap_or(0);
            symbols = Self::symbols(data, symtab, strtab);
        }

        let lines = sections
            .iter()
            .find(|s| read_str(data, shstr_off + s.name as usize) == ".debug_line")
            .and_then(|s| data.get(s.offset..s.offset + s.size))
            .map(|sec| LineTable::from_map(parse_debug_line(sec)))
            .unwrap_or_default();

        Ok(ElfImage { entry, segments, symbols, lines })
    }

    fn segments(data: &[u8], phoff: usize, phentsize: usize, phnum: usize) -> Result<Vec<Segment>, LoadError> {
        let mut out = Vec::new();
        for i in 0..phnum {
            let mut c = Cursor::at(data, phoff + i * phentsize);
            let fields = (|| Some((c.u32()?, c.u32()? as usize, c.u32()?, c.u32()?, c.u32()? as usize)))();
            let (p_type, offset, vaddr, paddr, filesz) = fields.ok_or_else(|| bad("truncated program header"))?;
            if p_type != PT_LOAD || filesz == 0 {
                continue;
            }
            let bytes = data
                .get(offset..offset + filesz)
                .ok_or_else(|| bad("segment extends past end of file"))?;
            out.push(Segment { addr: paddr, data: bytes.to_vec() });
            if (DATA_BASE..EEPROM_BASE).contains(&vaddr) && vaddr != paddr {
                out.push(Segment { addr: vaddr, data: bytes.to_vec() });
            }
        }
        Ok(out)
    }

    fn symbols(data: &[u8], symtab: &Section, strtab: usize) -> Vec<Symbol> {
        let entsize = if symtab.entsize > 0 { symtab.entsize } else { 16 };
        (0..symtab.size / entsize)
            .filter_map(|i| {
                let mut c = Cursor::at(data, symtab.offset + i * entsize);
                let name_off = c.u32()? as usize;
                let value = c.u32()?;
                let size = c.u32()?;
                let info = c.u8()?;
                let kind = match info & 0xF {
                    STT_FUNC => SymbolKind::Function,
                    STT_OBJECT => SymbolKind::Object,
                    0 if info >> 4 != 0 => SymbolKind::Other,
                    _ => return None,
                };
                let name = read_str(data, strtab + name_off);
                (name_off != 0 && !name.is_empty()).then_some(Symbol { name, addr: value, size, kind })
            })
            .collect()
    }

    pub fn symbol_table(&self) -> SymbolTable {
        let mut t = SymbolTable::default();
        for s in &self.symbols {
            t.insert(s.clone());
        }
        t
    }
}

/// Parse DWARF .debug_line section (version 2–4).
fn parse_debug_line(section: &[u8]) -> BTreeMap<u32, (String, u32)> {
    let mut result = BTreeMap::new();
    let mut pos = 0;
    while pos + 10 < section.len() {
        match parse_line_unit(section, pos, &mut result) {
            Some(next) if next > pos => pos = next,
            _ => break,
        }
    }
    result
}

/// One line-number program unit; returns the offset of the next unit.
fn parse_line_unit(section: &[u8], start: usize, result: &mut BTreeMap<u32, (String, u32)>) -> Option<usize> {
    let mut c = Cursor::at(section, start);
    let unit_length = c.u32()? as usize;
    if unit_length == 0 {
        return None;
    }
    let unit_end = (start + 4 + unit_length).min(section.len());
    let version = c.u16()?;
    if !(2..=4).contains(&version) {
        return Some(unit_end);
    }
    let header_length = c.u32()? as usize;
    let prog_start = c.pos + header_length;
    let min_inst_len = c.u8()? as u32;
    if version >= 4 {
        c.u8()?; // max_ops_per_instruction
    }
    c.u8()?; // default_is_stmt
    let line_base = c.u8()? as i8 as i32;
    let line_range = (c.u8()? as u32).max(1);
    let opcode_base = c.u8()?;
    let mut std_lens = vec![0u8; opcode_base as usize];
    for len in std_lens.iter_mut().skip(1) {
        *len = c.u8()?;
    }

    let mut dirs: Vec<String> = vec![String::new()];
    loop {
        let s = c.cstr()?;
        if s.is_empty() {
            break;
        }
        dirs.push(s);
    }
    let mut files: Vec<String> = vec!["<unknown>".into()];
    loop {
        let name = c.cstr()?;
        if name.is_empty() {
            break;
        }
        let dir = c.uleb()? as usize;
        c.uleb()?;
        c.uleb()?;
        files.push(match dirs.get(dir) {
            Some(d) if dir > 0 && !d.is_empty() => format!("{}/{}", d, name),
            _ => name,
        });
    }

    c.pos = prog_start;
    let mut address = 0u32;
    let mut file = 1usize;
    let mut line = 1u32;
    let emit = |result: &mut BTreeMap<u32, (String, u32)>, address: u32, file: usize, line: u32| {
        let f = files.get(file).cloned().unwrap_or_default();
        result.insert(address, (f, line));
    };

    while c.pos < unit_end {
        let op = c.u8()?;
        if op == 0 {
            let len = c.uleb()? as usize;
            let ext_end = c.pos + len;
            match c.u8()? {
                1 => {
                    address = 0;
                    file = 1;
                    line = 1;
                }
                2 => address = c.u32()?,
                _ => {}
            }
            c.pos = ext_end;
        } else if op < opcode_base {
            match op {
                1 => emit(result, address, file, line),
                2 => address = address.wrapping_add(c.uleb()? * min_inst_len),
                3 => line = (line as i32 + c.sleb()?) as u32,
                4 => file = c.uleb()? as usize,
                5 => {
                    c.uleb()?;
                }
                6 | 7 | 10 | 11 => {}
                8 => address += ((255 - opcode_base) as u32 / line_range) * min_inst_len,
                9 => address += c.u16()? as u32,
                _ => {
                    for _ in 0..std_lens[op as usize] {
                        c.uleb()?;
                    }
                }
            }
        } else {
            let adjusted = (op - opcode_base) as u32;
            address += (adjusted / line_range) * min_inst_len;
            line = (line as i32 + line_base + (adjusted % line_range) as i32) as u32;
            emit(result, address, file, line);
        }
    }
    Some(unit_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put16(v: &mut [u8], o: usize, x: u16) {
        v[o..o + 2].copy_from_slice(&x.to_le_bytes());
    }

    fn put32(v: &mut [u8], o: usize, x: u32) {
        v[o..o + 4].copy_from_slice(&x.to_le_bytes());
    }

    /// Text at 0 (NOP; RJMP .-1), .data with VMA 0x800100 and LMA 4,
    /// symbols `main` and `counter`.
    fn sample_elf() -> Vec<u8> {
        let mut v = vec![0u8; 376];
        v[0..4].copy_from_slice(&ELF_MAGIC);
        v[4] = 1;
        v[5] = 1;
        v[6] = 1;
        put16(&mut v, 16, 2);
        put16(&mut v, 18, EM_AVR);
        put32(&mut v, 20, 1);
        put32(&mut v, 24, 0);
        put32(&mut v, 28, 52);
        put32(&mut v, 32, 216);
        put16(&mut v, 40, 52);
        put16(&mut v, 42, 32);
        put16(&mut v, 44, 2);
        put16(&mut v, 46, 40);
        put16(&mut v, 48, 4);
        put16(&mut v, 50, 3);

        // Program headers
        for (i, (off, vaddr, paddr, size)) in [(116u32, 0u32, 0u32, 4u32), (120, 0x80_0100, 4, 2)].iter().enumerate() {
            let p = 52 + i * 32;
            put32(&mut v, p, PT_LOAD);
            put32(&mut v, p + 4, *off);
            put32(&mut v, p + 8, *vaddr);
            put32(&mut v, p + 12, *paddr);
            put32(&mut v, p + 16, *size);
            put32(&mut v, p + 20, *size);
        }
        v[116..120].copy_from_slice(&[0x00, 0x00, 0xFF, 0xCF]);
        v[120..122].copy_from_slice(&[0x12, 0x34]);

        v[124..138].copy_from_slice(b"\0main\0counter\0");
        v[138..165].copy_from_slice(b"\0.symtab\0.strtab\0.shstrtab\0");

        // Symbols: null, main, counter
        put32(&mut v, 184, 1);
        put32(&mut v, 188, 0);
        put32(&mut v, 192, 4);
        v[196] = 0x12;
        put32(&mut v, 200, 6);
        put32(&mut v, 204, 0x80_0100);
        put32(&mut v, 208, 2);
        v[212] = 0x11;

        // Section headers: null, .symtab, .strtab, .shstrtab
        let sh = |v: &mut Vec<u8>, i: usize, name: u32, kind: u32, off: u32, size: u32, link: u32, ent: u32| {
            let b = 216 + i * 40;
            put32(v, b, name);
            put32(v, b + 4, kind);
            put32(v, b + 16, off);
            put32(v, b + 20, size);
            put32(v, b + 24, link);
            put32(v, b + 36, ent);
        };
        sh(&mut v, 1, 1, SHT_SYMTAB, 168, 48, 2, 16);
        sh(&mut v, 2, 9, 3, 124, 14, 0, 0);
        sh(&mut v, 3, 17, 3, 138, 27, 0, 0);
        v
    }

    #[test]
    fn test_leb128() {
        assert_eq!(Cursor::at(&[0x80, 0x01], 0).uleb(), Some(128));
        assert_eq!(Cursor::at(&[0x7F], 0).sleb(), Some(-1));
        assert_eq!(Cursor::at(&[0x80], 0).uleb(), None);
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(ElfImage::parse(&[0u8; 64]), Err(LoadError::Elf(_))));
    }

    #[test]
    fn test_too_short() {
        assert!(ElfImage::parse(&[0x7F, b'E', b'L', b'F']).is_err());
    }

    #[test]
    fn test_segments_by_band() {
        let img = ElfImage::parse(&sample_elf()).unwrap();
        assert_eq!(
            img.segments,
            vec![
                Segment { addr: 0, data: vec![0x00, 0x00, 0xFF, 0xCF] },
                Segment { addr: 4, data: vec![0x12, 0x34] },
                Segment { addr: 0x80_0100, data: vec![0x12, 0x34] },
            ]
        );
    }

    #[test]
    fn test_symbols() {
        let img = ElfImage::parse(&sample_elf()).unwrap();
        assert_eq!(img.symbols.len(), 2);
        let t = img.symbol_table();
        assert_eq!(t.by_name("main").map(|s| s.kind), Some(SymbolKind::Function));
        assert_eq!(t.describe_data(0x101).as_deref(), Some("counter+0x1"));
    }

    #[test]
    fn test_truncated_segment() {
        let mut elf = sample_elf();
        put32(&mut elf, 52 + 16, 4000);
        assert!(matches!(ElfImage::parse(&elf), Err(LoadError::Elf(_))));
    }

    #[test]
    fn test_line_program() {
        // v2 unit: one file "main.c", set_address 0x100, copy, special opcode +2 bytes +1 line
        let mut unit = Vec::new();
        unit.extend_from_slice(&2u16.to_le_bytes());
        let mut hdr = vec![1u8, 1, (-5i8) as u8, 14, 13];
        hdr.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
        hdr.push(0); // no include dirs
        hdr.extend_from_slice(b"main.c\0");
        hdr.extend_from_slice(&[0, 0, 0]);
        hdr.push(0);
        unit.extend_from_slice(&(hdr.len() as u32).to_le_bytes());
        unit.extend_from_slice(&hdr);
        unit.extend_from_slice(&[0, 5, 2, 0x00, 0x01, 0x00, 0x00]); // set_address 0x100
        unit.push(1); // copy
        // special: addr +2, line +1 → adjusted = (1 - -5) + 14*2 = 34; op = 34 + 13 = 47
        unit.push(47);
        unit.extend_from_slice(&[0, 1, 1]); // end_sequence
        let mut sec = (unit.len() as u32).to_le_bytes().to_vec();
        sec.extend_from_slice(&unit);

        let t = LineTable::from_map(parse_debug_line(&sec));
        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup(0x100), Some(("main.c", 1)));
        assert_eq!(t.lookup(0x103), Some(("main.c", 2)));
        assert_eq!(t.lookup(0x0FF), None);
        assert_eq!(t.address_of("main.c", 2), Some(0x102));
    }
}
