pub mod mutf8;
pub mod encoded_values;
pub mod annotations;
pub mod dex_file;
pub mod opcodes;
pub mod instruction_codec;
pub mod loader;
pub mod lowering;
pub mod writer;

use crate::error::{DexError, Result};
use crate::ir::interner::{CallSiteId, FieldId, MethodHandleId, MethodId, ProtoId, StringId, TypeId};

/// Maps raw DEX table indices of one input file to interned ids.
pub(crate) trait RefResolver
{
    fn string(&self, idx: u32) -> Result<StringId>;
    fn type_id(&self, idx: u32) -> Result<TypeId>;
    fn proto(&self, idx: u32) -> Result<ProtoId>;
    fn field(&self, idx: u32) -> Result<FieldId>;
    fn method(&self, idx: u32) -> Result<MethodId>;
    fn method_handle(&self, idx: u32) -> Result<MethodHandleId>;
    fn call_site(&self, idx: u32) -> Result<CallSiteId>;
}

/// Maps interned ids to the table indices of the DEX being written.
pub(crate) trait IndexResolver
{
    fn string_idx(&self, id: StringId) -> Result<u32>;
    fn type_idx(&self, id: TypeId) -> Result<u32>;
    fn proto_idx(&self, id: ProtoId) -> Result<u32>;
    fn field_idx(&self, id: FieldId) -> Result<u32>;
    fn method_idx(&self, id: MethodId) -> Result<u32>;
    fn method_handle_idx(&self, id: MethodHandleId) -> Result<u32>;
    fn call_site_idx(&self, id: CallSiteId) -> Result<u32>;
}

/// Receives every symbol a structure references; the writer uses it to size its id pools.
pub(crate) trait RefVisitor
{
    fn visit_string(&mut self, id: StringId);
    fn visit_type(&mut self, id: TypeId);
    fn visit_proto(&mut self, id: ProtoId);
    fn visit_field(&mut self, id: FieldId);
    fn visit_method(&mut self, id: MethodId);
    fn visit_method_handle(&mut self, id: MethodHandleId);
    fn visit_call_site(&mut self, id: CallSiteId);
}

// Basic type reading and writing
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8>
{
    if bytes.len() < *ix + 1
    {
        return Err(DexError::malformed(*ix, format!("unexpected end of stream reading u1 at index {}", *ix)));
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16>
{
    if bytes.len() < *ix + 2
    {
        return Err(DexError::malformed(*ix, format!("unexpected end of stream reading u2 at index {}", *ix)));
    }
    let result = ((bytes[*ix + 1] as u16) << 8) | (bytes[*ix] as u16);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32>
{
    if bytes.len() < *ix + 4
    {
        return Err(DexError::malformed(*ix, format!("unexpected end of stream reading u4 at index {}", *ix)));
    }
    let result =
        ((bytes[*ix + 3] as u32) << 24) | ((bytes[*ix + 2] as u32) << 16) | ((bytes[*ix + 1] as u32) << 8) | (bytes[*ix] as u32);
    *ix += 4;
    Ok(result)
}

/// Collects the 7-bit groups of one LEB128 value. At most five groups are read; a fifth
/// group with its continuation bit set is malformed. Returns the payload and its bit width.
fn read_leb_groups(bytes: &[u8], ix: &mut usize, what: &str) -> Result<(u64, u32)>
{
    let start = *ix;
    let mut at = start;
    let mut value = 0u64;
    let mut width = 0u32;
    loop
    {
        let byte = *bytes
            .get(at)
            .ok_or_else(|| DexError::malformed(start, format!("unexpected end of stream reading {}", what)))?;
        at += 1;
        value |= u64::from(byte & 0x7f) << width;
        width += 7;
        if byte & 0x80 == 0
        {
            break;
        }
        if width == 35
        {
            return Err(DexError::malformed(start, "unterminated LEB128 sequence"));
        }
    }
    *ix = at;
    Ok((value, width))
}

pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32>
{
    let (value, _) = read_leb_groups(bytes, ix, "uleb128")?;
    Ok(value as u32)
}

/// Returns `None` for the `NO_INDEX` sentinel.
pub(crate) fn read_uleb128p1(bytes: &[u8], ix: &mut usize) -> Result<Option<u32>>
{
    let v = read_uleb128(bytes, ix)?;
    Ok(v.checked_sub(1))
}

pub(crate) fn read_sleb128(bytes: &[u8], ix: &mut usize) -> Result<i32>
{
    let (value, width) = read_leb_groups(bytes, ix, "sleb128")?;
    // the top bit of the last group carries the sign
    let unused = 64 - width;
    Ok((((value << unused) as i64) >> unused) as i32)
}

pub(crate) fn read_x(bytes: &[u8], ix: &mut usize, length: usize) -> Result<Vec<u8>>
{
    if bytes.len() >= *ix && bytes.len() - *ix >= length
    {
        let v = bytes[*ix..*ix + length].to_vec();
        *ix += length;
        Ok(v)
    }
    else
    {
        Err(DexError::malformed(*ix, "buffer too short for array read"))
    }
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize
{
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.push(val as u8);
    buffer.push((val >> 8) as u8);
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    for i in 0..4
    {
        buffer.push((val >> (i * 8)) as u8);
    }
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let mut rest = val;
    let mut c = 0;
    loop
    {
        let group = (rest & 0x7f) as u8;
        rest >>= 7;
        c += 1;
        if rest == 0
        {
            buffer.push(group);
            return c;
        }
        buffer.push(group | 0x80);
    }
}

pub(crate) fn write_uleb128p1(buffer: &mut Vec<u8>, val: Option<u32>) -> usize
{
    write_uleb128(buffer, val.map_or(0, |v| v.wrapping_add(1)))
}

pub(crate) fn write_sleb128(buffer: &mut Vec<u8>, val: i32) -> usize
{
    let mut rest = val;
    let mut c = 0;
    loop
    {
        let group = (rest & 0x7f) as u8;
        rest >>= 7;
        c += 1;
        // stop once the remaining bits are all copies of the group's sign bit
        let sign_set = group & 0x40 != 0;
        if (rest == 0 && !sign_set) || (rest == -1 && sign_set)
        {
            buffer.push(group);
            return c;
        }
        buffer.push(group | 0x80);
    }
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    let len = val.len();
    buffer.extend(val);
    len
}

/// Bounds check for an index into one of the id tables.
pub(crate) fn check_index(table: &str, idx: u32, size: usize) -> Result<usize>
{
    if (idx as usize) < size
    {
        Ok(idx as usize)
    }
    else
    {
        Err(DexError::index_out_of_bound(table, idx, size))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_truncated_leb_is_malformed()
    {
        let mut ix = 0;
        let e = read_uleb128(&[0x80, 0x80], &mut ix).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::MalformedDex);
        assert_eq!(e.extra_info().get("offset").map(String::as_str), Some("0x0"));

        let mut ix = 1;
        assert_eq!(read_uleb128(&[0xff, 0x7f], &mut ix).unwrap(), 0x7f);
        assert_eq!(ix, 2);
    }

    fn uleb(v: u32) -> Vec<u8>
    {
        let mut buf = vec![];
        assert_eq!(write_uleb128(&mut buf, v), buf.len());
        buf
    }

    fn sleb(v: i32) -> Vec<u8>
    {
        let mut buf = vec![];
        assert_eq!(write_sleb128(&mut buf, v), buf.len());
        buf
    }

    #[test]
    fn test_leb128_known_encodings()
    {
        assert_eq!(uleb(0), vec![0x00]);
        assert_eq!(uleb(127), vec![0x7f]);
        assert_eq!(uleb(128), vec![0x80, 0x01]);
        assert_eq!(uleb(624485), vec![0xe5, 0x8e, 0x26]);
        assert_eq!(uleb(u32::MAX), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(sleb(-1), vec![0x7f]);
        assert_eq!(sleb(-128), vec![0x80, 0x7f]);
        // 64 needs a second group so its sign bit reads as positive
        assert_eq!(sleb(64), vec![0xc0, 0x00]);
        assert_eq!(sleb(-64), vec![0x40]);

        let mut ix = 0;
        assert_eq!(read_sleb128(&[0xc0, 0xbb, 0x78], &mut ix).unwrap(), -123456);
        assert_eq!(ix, 3);
    }

    #[test]
    fn test_leb128_boundaries_read_back()
    {
        for v in [0, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x1f_ffff, 0x20_0000, 0x0fff_ffff, 0x1000_0000, u32::MAX]
        {
            let mut ix = 0;
            assert_eq!(read_uleb128(&uleb(v), &mut ix).unwrap(), v);
        }
        for v in [0, 63, 64, -64, -65, 8191, -8192, i32::MAX, i32::MIN]
        {
            let bytes = sleb(v);
            let mut ix = 0;
            assert_eq!(read_sleb128(&bytes, &mut ix).unwrap(), v, "{:?}", bytes);
            assert_eq!(ix, bytes.len());
        }
    }

    #[test]
    fn test_overlong_leb_is_malformed()
    {
        let mut ix = 2;
        let e = read_sleb128(&[0, 0, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00], &mut ix).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::MalformedDex);
        assert_eq!(e.extra_info().get("offset").map(String::as_str), Some("0x2"));
        assert_eq!(ix, 2);
    }

    #[test]
    fn test_uleb128p1_sentinel()
    {
        let mut buf = vec![];
        write_uleb128p1(&mut buf, None);
        write_uleb128p1(&mut buf, Some(5));
        let mut ix = 0;
        assert_eq!(read_uleb128p1(&buf, &mut ix).unwrap(), None);
        assert_eq!(read_uleb128p1(&buf, &mut ix).unwrap(), Some(5));
    }

    #[test]
    fn test_fixed_width()
    {
        let mut buf = vec![];
        write_u2(&mut buf, 0xbeef);
        write_u4(&mut buf, 0x12345678);
        let mut ix = 0;
        assert_eq!(read_u2(&buf, &mut ix).unwrap(), 0xbeef);
        assert_eq!(read_u4(&buf, &mut ix).unwrap(), 0x12345678);
        assert!(read_u1(&buf, &mut ix).is_err());
        assert_eq!(check_index("string", 3, 3).unwrap_err().kind(), ErrorKind::CacheIndexOutOfBound);
    }
}
