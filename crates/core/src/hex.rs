//! Intel HEX file parser.
//!
//! Parses Intel HEX text (`:LLAAAATT[DD...]CC`) into `(byte address, data)`
//! chunks. Record types 00 (data), 01 (EOF), 02 (extended segment
//! address) and 04 (extended linear address) are interpreted; 03 and 05
//! (start addresses) are accepted and ignored. Every record's checksum is
//! verified.

use crate::error::LoadError;

/// One data record, placed at its absolute byte address.
pub type Chunk = (u32, Vec<u8>);

fn err(line: usize, msg: impl Into<String>) -> LoadError {
    LoadError::Hex { line, msg: msg.into() }
}

/// Parse Intel HEX text. Lines not starting with `:` are skipped; parsing
/// stops at the EOF record.
pub fn parse_hex(text: &str) -> Result<Vec<Chunk>, LoadError> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut base: u32 = 0;

    for (i, line) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = line.trim();
        let Some(body) = line.strip_prefix(':') else { continue };

        let bytes = hex_bytes(body).map_err(|m| err(lineno, m))?;
        if bytes.len() < 5 {
            return Err(err(lineno, "record too short"));
        }
        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(err(lineno, format!("length byte says {} but record holds {}", count, bytes.len() - 5)));
        }
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(err(lineno, format!("checksum mismatch (sum 0x{:02X})", sum)));
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
        let data = &bytes[4..4 + count];
        match bytes[3] {
            0x00 => {
                let addr = base + offset;
                // Extend the previous chunk when contiguous
                match chunks.last_mut() {
                    Some((start, buf)) if *start + buf.len() as u32 == addr => buf.extend_from_slice(data),
                    _ => chunks.push((addr, data.to_vec())),
                }
            }
            0x01 => break,
            0x02 | 0x04 => {
                if count != 2 {
                    return Err(err(lineno, "address record must carry two bytes"));
                }
                let v = u16::from_be_bytes([data[0], data[1]]) as u32;
                base = if bytes[3] == 0x02 { v << 4 } else { v << 16 };
            }
            0x03 | 0x05 => {}
            t => return Err(err(lineno, format!("unsupported record type 0x{:02X}", t))),
        }
    }

    Ok(chunks)
}

fn hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex characters".into());
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_digit(c: u8) -> Result<u8, String> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(format!("invalid hex character '{}'", c as char)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_hex() {
        let hex = ":100000000C9434000C944E000C944E000C944E0052\n:00000001FF\n";
        let chunks = parse_hex(hex).unwrap();
        assert_eq!(chunks.len(), 1);
        let (addr, data) = &chunks[0];
        assert_eq!(*addr, 0);
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..6], &[0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94]);
    }

    #[test]
    fn test_checksum_error() {
        let hex = ":100000000C9434000C944E000C944E000C944E00FF\n:00000001FF\n";
        assert!(matches!(parse_hex(hex), Err(LoadError::Hex { line: 1, .. })));
    }

    #[test]
    fn test_empty_hex() {
        assert!(parse_hex(":00000001FF\n").unwrap().is_empty());
    }

    #[test]
    fn test_extended_linear_address() {
        // Base 0x10000, two bytes at 0x10004; then a start record
        let hex = ":020000040001F9\n:02000400AABB95\n:0400000500000000F7\n:00000001FF\n";
        assert_eq!(parse_hex(hex).unwrap(), vec![(0x10004, vec![0xAA, 0xBB])]);
    }

    #[test]
    fn test_extended_segment_and_odd_address() {
        // Segment 0x1000 → base 0x10000; data at odd offset 1
        let hex = ":020000021000EC\n:0100010055A9\n:00000001FF\n";
        assert_eq!(parse_hex(hex).unwrap(), vec![(0x10001, vec![0x55])]);
    }

    #[test]
    fn test_contiguous_records_merge() {
        let hex = ":020000000102FB\n:020002000304F5\n:00000001FF\n";
        assert_eq!(parse_hex(hex).unwrap(), vec![(0, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_bad_record_type() {
        assert!(matches!(parse_hex(":00000006FA\n"), Err(LoadError::Hex { line: 1, .. })));
    }
}
