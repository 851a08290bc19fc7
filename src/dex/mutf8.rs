//! Modified UTF-8 as used by the DEX string table: `U+0000` is `C0 80`, supplementary
//! characters are surrogate pairs of 3-byte sequences, and the length prefix counts UTF-16
//! code units.

use cesu8::{from_java_cesu8, to_java_cesu8};
use log::warn;

use crate::dex::{read_u1, read_uleb128, write_u1, write_uleb128, write_x};
use crate::error::{DexError, Result};

pub fn encode_mutf8(s: &str) -> Vec<u8> {
    to_java_cesu8(s).into_owned()
}

/// Decodes a MUTF-8 byte sequence (without the terminating zero). Unpaired surrogates, which
/// real DEX files occasionally carry, are replaced by U+FFFD with a warning.
pub fn decode_mutf8(bytes: &[u8]) -> Result<String> {
    match from_java_cesu8(bytes) {
        Ok(s) => Ok(s.into_owned()),
        Err(_) => decode_lossy(bytes),
    }
}

pub fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

/// Writes a `string_data_item`.
pub fn write_string_data(buffer: &mut Vec<u8>, s: &str) -> usize {
    let mut c = write_uleb128(buffer, utf16_len(s));
    c += write_x(buffer, &encode_mutf8(s));
    c += write_u1(buffer, 0);
    c
}

/// Reads a `string_data_item` at `ix`.
pub fn read_string_data(bytes: &[u8], ix: &mut usize) -> Result<String> {
    let start = *ix;
    let units = read_uleb128(bytes, ix)?;
    let data_start = *ix;
    while read_u1(bytes, ix)? != 0 {}
    let s = decode_mutf8(&bytes[data_start..*ix - 1])?;
    if utf16_len(&s) != units {
        warn!("[mutf8] string at 0x{:x} declares {} UTF-16 units but holds {}", start, units, utf16_len(&s));
    }
    Ok(s)
}

fn decode_lossy(bytes: &[u8]) -> Result<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        let b0 = bytes[ix] as u16;
        let (unit, len) = if b0 & 0x80 == 0 {
            (b0, 1)
        } else if b0 & 0xe0 == 0xc0 && ix + 1 < bytes.len() {
            (((b0 & 0x1f) << 6) | (bytes[ix + 1] as u16 & 0x3f), 2)
        } else if b0 & 0xf0 == 0xe0 && ix + 2 < bytes.len() {
            (((b0 & 0x0f) << 12) | ((bytes[ix + 1] as u16 & 0x3f) << 6) | (bytes[ix + 2] as u16 & 0x3f), 3)
        } else {
            return Err(DexError::malformed(ix, "invalid MUTF-8 lead byte"));
        };
        units.push(unit);
        ix += len;
    }
    warn!("[mutf8] string contains unpaired surrogates; replacing them");
    Ok(char::decode_utf16(units.into_iter())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nul_is_two_bytes() {
        assert_eq!(encode_mutf8("\u{0}"), vec![0xC0, 0x80]);
        assert_eq!(encode_mutf8("a\u{0}b"), vec![b'a', 0xC0, 0x80, b'b']);
    }

    #[test]
    fn test_supplementary_as_surrogate_pair() {
        let enc = encode_mutf8("\u{1F600}");
        assert_eq!(enc.len(), 6);
        assert_eq!(enc[0], 0xED);
        assert_eq!(enc[3], 0xED);
        assert_eq!(utf16_len("\u{1F600}"), 2);
        assert_eq!(decode_mutf8(&enc).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_roundtrip_samples() {
        for s in ["", "hello", "caf\u{e9}", "\u{4e2d}\u{6587}", "x\u{0}y", "\u{10FFFF}\u{7ff}\u{800}"] {
            let mut buf = vec![];
            write_string_data(&mut buf, s);
            let mut ix = 0;
            assert_eq!(read_string_data(&buf, &mut ix).unwrap(), s);
            assert_eq!(ix, buf.len());
        }
    }

    #[test]
    fn test_lone_surrogate_is_replaced() {
        // ED A0 80 is a lone high surrogate
        let s = decode_mutf8(&[b'a', 0xED, 0xA0, 0x80]).unwrap();
        assert_eq!(s, "a\u{FFFD}");
    }
}
