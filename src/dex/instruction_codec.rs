//! Decoding and encoding of Dalvik code units.
//!
//! An instruction is read into a format-neutral [`RawInsn`]: registers in the order the
//! format lists them, plus at most one literal, one or two pool indices and one branch offset.

use std::sync::Arc;

use crate::dex::opcodes::{self, Format, Opcode, ARRAY_PAYLOAD, PACKED_SWITCH_PAYLOAD, SPARSE_SWITCH_PAYLOAD};
use crate::error::{DexError, Result};
use crate::ir::instruction::ArrayData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInsn {
    pub op: u8,
    pub regs: Vec<u32>,
    pub literal: i64,
    pub index: u32,
    /// Proto index of `invoke-polymorphic`.
    pub index2: u32,
    /// Branch or payload offset in code units, relative to this instruction.
    pub offset: i32,
}

impl RawInsn {
    pub fn new(op: u8) -> RawInsn {
        RawInsn { op, regs: Vec::new(), literal: 0, index: 0, index2: 0, offset: 0 }
    }

    pub fn opcode(&self) -> Result<&'static Opcode> {
        opcodes::lookup(self.op).ok_or_else(|| DexError::new(format!("unknown opcode 0x{:02x}", self.op)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PackedSwitch { first_key: i32, targets: Vec<i32> },
    SparseSwitch { keys: Vec<i32>, targets: Vec<i32> },
    Array(Arc<ArrayData>),
}

impl Payload {
    pub fn units(&self) -> usize {
        match self {
            Payload::PackedSwitch { targets, .. } => 4 + targets.len() * 2,
            Payload::SparseSwitch { keys, .. } => 2 + keys.len() * 4,
            Payload::Array(d) => 4 + (d.data.len() + 1) / 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Insn(RawInsn),
    Payload(Payload),
}

#[inline]
fn unit(code: &[u16], pc: usize, k: usize) -> Result<u16> {
    code.get(pc + k)
        .copied()
        .ok_or_else(|| DexError::malformed(pc * 2, format!("instruction at 0x{:x} runs past the end of code", pc)))
}

#[inline]
fn u32_at(code: &[u16], pc: usize, k: usize) -> Result<u32> {
    Ok(unit(code, pc, k)? as u32 | ((unit(code, pc, k + 1)? as u32) << 16))
}

fn decode_payload(code: &[u16], pc: usize, ident: u16) -> Result<(Payload, usize)> {
    match ident {
        PACKED_SWITCH_PAYLOAD => {
            let size = unit(code, pc, 1)? as usize;
            let first_key = u32_at(code, pc, 2)? as i32;
            let targets = (0..size).map(|i| u32_at(code, pc, 4 + i * 2).map(|v| v as i32)).collect::<Result<_>>()?;
            let p = Payload::PackedSwitch { first_key, targets };
            let n = p.units();
            Ok((p, n))
        }
        SPARSE_SWITCH_PAYLOAD => {
            let size = unit(code, pc, 1)? as usize;
            let keys = (0..size).map(|i| u32_at(code, pc, 2 + i * 2).map(|v| v as i32)).collect::<Result<_>>()?;
            let targets =
                (0..size).map(|i| u32_at(code, pc, 2 + size * 2 + i * 2).map(|v| v as i32)).collect::<Result<_>>()?;
            let p = Payload::SparseSwitch { keys, targets };
            let n = p.units();
            Ok((p, n))
        }
        ARRAY_PAYLOAD => {
            let element_width = unit(code, pc, 1)?;
            let element_count = u32_at(code, pc, 2)?;
            let len = element_width as usize * element_count as usize;
            if len > (code.len().saturating_sub(pc + 4)) * 2 {
                return Err(DexError::malformed(pc * 2, "array payload runs past the end of code"));
            }
            let mut data = Vec::with_capacity(len);
            for i in 0..len {
                let u = code[pc + 4 + i / 2];
                data.push(if i % 2 == 0 { u as u8 } else { (u >> 8) as u8 });
            }
            let p = Payload::Array(Arc::new(ArrayData { element_width, element_count, data }));
            let n = p.units();
            Ok((p, n))
        }
        _ => Err(DexError::malformed(pc * 2, format!("unknown payload identifier 0x{:04x}", ident))),
    }
}

/// Decodes the instruction at `pc`; returns it with its size in code units.
pub fn decode_at(code: &[u16], pc: usize) -> Result<(Decoded, usize)> {
    let u0 = unit(code, pc, 0)?;
    let op = (u0 & 0xff) as u8;
    let aa = (u0 >> 8) as u32;
    if op == 0 && aa != 0 {
        let (p, n) = decode_payload(code, pc, u0)?;
        return Ok((Decoded::Payload(p), n));
    }
    let opcode = opcodes::lookup(op)
        .ok_or_else(|| DexError::malformed(pc * 2, format!("unused opcode 0x{:02x} at 0x{:x}", op, pc)))?;
    let a4 = aa & 0xf;
    let b4 = aa >> 4;
    let mut insn = RawInsn::new(op);
    match opcode.format {
        Format::Format10x => {}
        Format::Format12x => insn.regs = vec![a4, b4],
        Format::Format11n => {
            insn.regs = vec![a4];
            insn.literal = (((b4 as u8) << 4) as i8 >> 4) as i64;
        }
        Format::Format11x => insn.regs = vec![aa],
        Format::Format10t => insn.offset = aa as u8 as i8 as i32,
        Format::Format20t => insn.offset = unit(code, pc, 1)? as i16 as i32,
        Format::Format22x => insn.regs = vec![aa, unit(code, pc, 1)? as u32],
        Format::Format21t => {
            insn.regs = vec![aa];
            insn.offset = unit(code, pc, 1)? as i16 as i32;
        }
        Format::Format21s => {
            insn.regs = vec![aa];
            insn.literal = unit(code, pc, 1)? as i16 as i64;
        }
        Format::Format21ih => {
            insn.regs = vec![aa];
            insn.literal = ((unit(code, pc, 1)? as u32) << 16) as i32 as i64;
        }
        Format::Format21lh => {
            insn.regs = vec![aa];
            insn.literal = ((unit(code, pc, 1)? as u64) << 48) as i64;
        }
        Format::Format21c => {
            insn.regs = vec![aa];
            insn.index = unit(code, pc, 1)? as u32;
        }
        Format::Format23x => {
            let u1 = unit(code, pc, 1)?;
            insn.regs = vec![aa, (u1 & 0xff) as u32, (u1 >> 8) as u32];
        }
        Format::Format22b => {
            let u1 = unit(code, pc, 1)?;
            insn.regs = vec![aa, (u1 & 0xff) as u32];
            insn.literal = (u1 >> 8) as u8 as i8 as i64;
        }
        Format::Format22t => {
            insn.regs = vec![a4, b4];
            insn.offset = unit(code, pc, 1)? as i16 as i32;
        }
        Format::Format22s => {
            insn.regs = vec![a4, b4];
            insn.literal = unit(code, pc, 1)? as i16 as i64;
        }
        Format::Format22c => {
            insn.regs = vec![a4, b4];
            insn.index = unit(code, pc, 1)? as u32;
        }
        Format::Format30t => insn.offset = u32_at(code, pc, 1)? as i32,
        Format::Format32x => insn.regs = vec![unit(code, pc, 1)? as u32, unit(code, pc, 2)? as u32],
        Format::Format31i => {
            insn.regs = vec![aa];
            insn.literal = u32_at(code, pc, 1)? as i32 as i64;
        }
        Format::Format31t => {
            insn.regs = vec![aa];
            insn.offset = u32_at(code, pc, 1)? as i32;
        }
        Format::Format31c => {
            insn.regs = vec![aa];
            insn.index = u32_at(code, pc, 1)?;
        }
        Format::Format35c | Format::Format45cc => {
            let count = b4 as usize;
            if count > 5 {
                return Err(DexError::malformed(pc * 2, format!("{} with {} arguments", opcode.name, count)));
            }
            insn.index = unit(code, pc, 1)? as u32;
            let u2 = unit(code, pc, 2)? as u32;
            let all = [u2 & 0xf, (u2 >> 4) & 0xf, (u2 >> 8) & 0xf, (u2 >> 12) & 0xf, a4];
            insn.regs = all[..count].to_vec();
            if opcode.format == Format::Format45cc {
                insn.index2 = unit(code, pc, 3)? as u32;
            }
        }
        Format::Format3rc | Format::Format4rcc => {
            insn.index = unit(code, pc, 1)? as u32;
            let first = unit(code, pc, 2)? as u32;
            insn.regs = (first..first + aa).collect();
            if opcode.format == Format::Format4rcc {
                insn.index2 = unit(code, pc, 3)? as u32;
            }
        }
        Format::Format51l => {
            let mut v = 0u64;
            for k in 0..4 {
                v |= (unit(code, pc, 1 + k)? as u64) << (16 * k);
            }
            insn.regs = vec![aa];
            insn.literal = v as i64;
        }
        Format::ArrayPayload | Format::PackedSwitchPayload | Format::SparseSwitchPayload => {
            return Err(DexError::malformed(pc * 2, "payload format on a real opcode"));
        }
    }
    Ok((Decoded::Insn(insn), opcode.format.units()))
}

/// Decodes a whole `insns` array into `(address, instruction)` pairs.
pub fn decode_all(code: &[u16]) -> Result<Vec<(u32, Decoded)>> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let (d, n) = decode_at(code, pc).map_err(|e| e.context(format!("decoding instruction at 0x{:x}", pc)))?;
        out.push((pc as u32, d));
        pc += n;
    }
    Ok(out)
}

fn reg_fits(r: u32, bits: u32) -> bool {
    r < (1 << bits)
}

fn check_regs(insn: &RawInsn, op: &Opcode, bits: &[u32]) -> Result<()> {
    if insn.regs.len() != bits.len() {
        return Err(DexError::new(format!("{} takes {} registers, got {}", op.name, bits.len(), insn.regs.len())));
    }
    for (r, b) in insn.regs.iter().zip(bits) {
        if !reg_fits(*r, *b) {
            return Err(DexError::new(format!("register v{} does not fit {} in {} bits", r, op.name, b)));
        }
    }
    Ok(())
}

fn check_lit(insn: &RawInsn, op: &Opcode, lo: i64, hi: i64) -> Result<()> {
    if insn.literal < lo || insn.literal > hi {
        return Err(DexError::new(format!("literal {} out of range for {}", insn.literal, op.name)));
    }
    Ok(())
}

fn check_offset(insn: &RawInsn, op: &Opcode, lo: i32, hi: i32) -> Result<()> {
    if insn.offset < lo || insn.offset > hi {
        return Err(DexError::new(format!("branch offset {} out of range for {}", insn.offset, op.name)));
    }
    Ok(())
}

fn push_u32(out: &mut Vec<u16>, v: u32) {
    out.push(v as u16);
    out.push((v >> 16) as u16);
}

/// Appends the encoding of `insn`. Fails if an operand does not fit the opcode's format.
pub fn encode(insn: &RawInsn, out: &mut Vec<u16>) -> Result<()> {
    let op = insn.opcode()?;
    let o = insn.op as u16;
    let r = |i: usize| insn.regs[i] as u16;
    match op.format {
        Format::Format10x => out.push(o),
        Format::Format12x => {
            check_regs(insn, op, &[4, 4])?;
            out.push(o | (r(0) << 8) | (r(1) << 12));
        }
        Format::Format11n => {
            check_regs(insn, op, &[4])?;
            check_lit(insn, op, -8, 7)?;
            out.push(o | (r(0) << 8) | (((insn.literal as u16) & 0xf) << 12));
        }
        Format::Format11x => {
            check_regs(insn, op, &[8])?;
            out.push(o | (r(0) << 8));
        }
        Format::Format10t => {
            check_offset(insn, op, i8::MIN as i32, i8::MAX as i32)?;
            if insn.offset == 0 {
                return Err(DexError::new("goto with a zero offset"));
            }
            out.push(o | (((insn.offset as i8 as u8) as u16) << 8));
        }
        Format::Format20t => {
            check_offset(insn, op, i16::MIN as i32, i16::MAX as i32)?;
            out.push(o);
            out.push(insn.offset as i16 as u16);
        }
        Format::Format22x => {
            check_regs(insn, op, &[8, 16])?;
            out.push(o | (r(0) << 8));
            out.push(r(1));
        }
        Format::Format21t => {
            check_regs(insn, op, &[8])?;
            check_offset(insn, op, i16::MIN as i32, i16::MAX as i32)?;
            out.push(o | (r(0) << 8));
            out.push(insn.offset as i16 as u16);
        }
        Format::Format21s => {
            check_regs(insn, op, &[8])?;
            check_lit(insn, op, i16::MIN as i64, i16::MAX as i64)?;
            out.push(o | (r(0) << 8));
            out.push(insn.literal as i16 as u16);
        }
        Format::Format21ih => {
            check_regs(insn, op, &[8])?;
            if insn.literal & 0xffff != 0 || insn.literal != insn.literal as i32 as i64 {
                return Err(DexError::new(format!("literal {} unsuitable for {}", insn.literal, op.name)));
            }
            out.push(o | (r(0) << 8));
            out.push((insn.literal >> 16) as u16);
        }
        Format::Format21lh => {
            check_regs(insn, op, &[8])?;
            if insn.literal & 0x0000_ffff_ffff_ffff != 0 {
                return Err(DexError::new(format!("literal {} unsuitable for {}", insn.literal, op.name)));
            }
            out.push(o | (r(0) << 8));
            out.push((insn.literal as u64 >> 48) as u16);
        }
        Format::Format21c => {
            check_regs(insn, op, &[8])?;
            if insn.index > 0xffff {
                return Err(DexError::new(format!("index {} needs a jumbo form of {}", insn.index, op.name)));
            }
            out.push(o | (r(0) << 8));
            out.push(insn.index as u16);
        }
        Format::Format23x => {
            check_regs(insn, op, &[8, 8, 8])?;
            out.push(o | (r(0) << 8));
            out.push(r(1) | (r(2) << 8));
        }
        Format::Format22b => {
            check_regs(insn, op, &[8, 8])?;
            check_lit(insn, op, i8::MIN as i64, i8::MAX as i64)?;
            out.push(o | (r(0) << 8));
            out.push(r(1) | (((insn.literal as i8 as u8) as u16) << 8));
        }
        Format::Format22t => {
            check_regs(insn, op, &[4, 4])?;
            check_offset(insn, op, i16::MIN as i32, i16::MAX as i32)?;
            out.push(o | (r(0) << 8) | (r(1) << 12));
            out.push(insn.offset as i16 as u16);
        }
        Format::Format22s => {
            check_regs(insn, op, &[4, 4])?;
            check_lit(insn, op, i16::MIN as i64, i16::MAX as i64)?;
            out.push(o | (r(0) << 8) | (r(1) << 12));
            out.push(insn.literal as i16 as u16);
        }
        Format::Format22c => {
            check_regs(insn, op, &[4, 4])?;
            if insn.index > 0xffff {
                return Err(DexError::new(format!("index {} out of range for {}", insn.index, op.name)));
            }
            out.push(o | (r(0) << 8) | (r(1) << 12));
            out.push(insn.index as u16);
        }
        Format::Format30t => {
            out.push(o);
            push_u32(out, insn.offset as u32);
        }
        Format::Format32x => {
            check_regs(insn, op, &[16, 16])?;
            out.push(o);
            out.push(r(0));
            out.push(r(1));
        }
        Format::Format31i => {
            check_regs(insn, op, &[8])?;
            check_lit(insn, op, i32::MIN as i64, i32::MAX as i64)?;
            out.push(o | (r(0) << 8));
            push_u32(out, insn.literal as i32 as u32);
        }
        Format::Format31t => {
            check_regs(insn, op, &[8])?;
            out.push(o | (r(0) << 8));
            push_u32(out, insn.offset as u32);
        }
        Format::Format31c => {
            check_regs(insn, op, &[8])?;
            out.push(o | (r(0) << 8));
            push_u32(out, insn.index);
        }
        Format::Format35c | Format::Format45cc => {
            let n = insn.regs.len();
            if n > 5 || insn.regs.iter().any(|r| !reg_fits(*r, 4)) {
                return Err(DexError::new(format!("{} needs the range form", op.name)));
            }
            if insn.index > 0xffff {
                return Err(DexError::new(format!("index {} out of range for {}", insn.index, op.name)));
            }
            let reg = |i: usize| if i < n { insn.regs[i] as u16 } else { 0 };
            out.push(o | (reg(4) << 8) | ((n as u16) << 12));
            out.push(insn.index as u16);
            out.push(reg(0) | (reg(1) << 4) | (reg(2) << 8) | (reg(3) << 12));
            if op.format == Format::Format45cc {
                out.push(insn.index2 as u16);
            }
        }
        Format::Format3rc | Format::Format4rcc => {
            let n = insn.regs.len();
            let first = insn.regs.first().copied().unwrap_or(0);
            if n > 255 || insn.regs.iter().enumerate().any(|(i, r)| *r != first + i as u32) || first + n as u32 > 0x10000
            {
                return Err(DexError::new(format!("{} needs {} contiguous registers", op.name, n)));
            }
            out.push(o | ((n as u16) << 8));
            out.push(insn.index as u16);
            out.push(first as u16);
            if op.format == Format::Format4rcc {
                out.push(insn.index2 as u16);
            }
        }
        Format::Format51l => {
            check_regs(insn, op, &[8])?;
            out.push(o | (r(0) << 8));
            let v = insn.literal as u64;
            for k in 0..4 {
                out.push((v >> (16 * k)) as u16);
            }
        }
        Format::ArrayPayload | Format::PackedSwitchPayload | Format::SparseSwitchPayload => {
            return Err(DexError::new("payload formats are encoded with encode_payload"));
        }
    }
    Ok(())
}

pub fn encode_payload(p: &Payload, out: &mut Vec<u16>) {
    match p {
        Payload::PackedSwitch { first_key, targets } => {
            out.push(PACKED_SWITCH_PAYLOAD);
            out.push(targets.len() as u16);
            push_u32(out, *first_key as u32);
            for t in targets {
                push_u32(out, *t as u32);
            }
        }
        Payload::SparseSwitch { keys, targets } => {
            out.push(SPARSE_SWITCH_PAYLOAD);
            out.push(keys.len() as u16);
            for k in keys {
                push_u32(out, *k as u32);
            }
            for t in targets {
                push_u32(out, *t as u32);
            }
        }
        Payload::Array(d) => {
            out.push(ARRAY_PAYLOAD);
            out.push(d.element_width);
            push_u32(out, d.element_count);
            for pair in d.data.chunks(2) {
                let hi = pair.get(1).copied().unwrap_or(0);
                out.push(pair[0] as u16 | ((hi as u16) << 8));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(insn: RawInsn) {
        let mut code = vec![];
        encode(&insn, &mut code).unwrap();
        let (back, n) = decode_at(&code, 0).unwrap();
        assert_eq!(n, code.len());
        assert_eq!(back, Decoded::Insn(insn));
    }

    #[test]
    fn test_sign_extension() {
        let (d, _) = decode_at(&[0xf012], 0).unwrap();
        match d {
            Decoded::Insn(i) => {
                assert_eq!(i.regs, vec![0]);
                assert_eq!(i.literal, -1);
            }
            _ => panic!("not an instruction"),
        }
        roundtrip(RawInsn { regs: vec![3], literal: -8, ..RawInsn::new(0x12) });
        roundtrip(RawInsn { regs: vec![200], literal: 0x12340000, ..RawInsn::new(0x15) });
        roundtrip(RawInsn { regs: vec![2], literal: i64::MIN, ..RawInsn::new(0x18) });
        roundtrip(RawInsn { regs: vec![1, 2], literal: -128, ..RawInsn::new(0xd8) });
        roundtrip(RawInsn { offset: -3, ..RawInsn::new(0x28) });
    }

    #[test]
    fn test_invoke_forms() {
        roundtrip(RawInsn { regs: vec![1, 2, 3, 4, 5], index: 9, ..RawInsn::new(0x6e) });
        roundtrip(RawInsn { regs: vec![20, 21, 22], index: 0x1234, ..RawInsn::new(0x77) });
        roundtrip(RawInsn { regs: vec![0, 1], index: 3, index2: 4, ..RawInsn::new(0xfa) });
        let mut out = vec![];
        assert!(encode(&RawInsn { regs: vec![16], index: 1, ..RawInsn::new(0x71) }, &mut out).is_err());
    }

    #[test]
    fn test_out_of_range_operands() {
        let mut out = vec![];
        assert!(encode(&RawInsn { regs: vec![0], literal: 8, ..RawInsn::new(0x12) }, &mut out).is_err());
        assert!(encode(&RawInsn { regs: vec![16, 0], ..RawInsn::new(0x01) }, &mut out).is_err());
        assert!(encode(&RawInsn { regs: vec![0], index: 0x10000, ..RawInsn::new(0x1a) }, &mut out).is_err());
    }

    #[test]
    fn test_payloads() {
        let packed = Payload::PackedSwitch { first_key: 10, targets: vec![4, 6, 8] };
        let sparse = Payload::SparseSwitch { keys: vec![-1, 100], targets: vec![3, 5] };
        let array = Payload::Array(Arc::new(ArrayData { element_width: 1, element_count: 3, data: vec![1, 2, 3] }));
        for p in [packed, sparse, array] {
            let mut code = vec![];
            encode_payload(&p, &mut code);
            assert_eq!(code.len(), p.units());
            let (back, n) = decode_at(&code, 0).unwrap();
            assert_eq!(n, code.len());
            assert_eq!(back, Decoded::Payload(p));
        }
    }

    #[test]
    fn test_truncated_and_unused() {
        assert_eq!(decode_at(&[0x0014], 0).unwrap_err().kind(), crate::error::ErrorKind::MalformedDex);
        assert!(decode_at(&[0x003e], 0).is_err());
        let all = decode_all(&[0x0012, 0x000e]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].0, 1);
    }
}
