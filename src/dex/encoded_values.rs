use std::hash::{Hash, Hasher};

use log::warn;

use crate::dex::{read_u1, read_uleb128, write_u1, write_uleb128, write_x, IndexResolver, RefResolver, RefVisitor};
use crate::error::{DexError, Result};
use crate::ir::interner::{FieldId, Interner, MethodHandleId, MethodId, ProtoId, StringId, TypeId};

pub const VALUE_BYTE: u8 = 0x00;
pub const VALUE_SHORT: u8 = 0x02;
pub const VALUE_CHAR: u8 = 0x03;
pub const VALUE_INT: u8 = 0x04;
pub const VALUE_LONG: u8 = 0x06;
pub const VALUE_FLOAT: u8 = 0x10;
pub const VALUE_DOUBLE: u8 = 0x11;
pub const VALUE_METHOD_TYPE: u8 = 0x15;
pub const VALUE_METHOD_HANDLE: u8 = 0x16;
pub const VALUE_STRING: u8 = 0x17;
pub const VALUE_TYPE: u8 = 0x18;
pub const VALUE_FIELD: u8 = 0x19;
pub const VALUE_METHOD: u8 = 0x1a;
pub const VALUE_ENUM: u8 = 0x1b;
pub const VALUE_ARRAY: u8 = 0x1c;
pub const VALUE_ANNOTATION: u8 = 0x1d;
pub const VALUE_NULL: u8 = 0x1e;
pub const VALUE_BOOLEAN: u8 = 0x1f;

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct EncodedAnnotation {
    pub ty: TypeId,
    pub elements: Vec<AnnotationElement>,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct AnnotationElement {
    pub name: StringId,
    pub value: EncodedValue,
}

/// One `encoded_value`, with all indices already resolved to interned ids.
#[derive(Debug, Clone)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(ProtoId),
    MethodHandle(MethodHandleId),
    String(StringId),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    Enum(FieldId),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

/// Controls what the reader does with a value tag it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownTagPolicy {
    /// Skip the payload, warn, and yield a null (callers with a known slot type turn it into
    /// that type's zero).
    Substitute,
    Fail,
}

impl PartialEq for EncodedValue {
    fn eq(&self, other: &Self) -> bool {
        use EncodedValue::*;
        match (self, other) {
            (Byte(a), Byte(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (MethodType(a), MethodType(b)) => a == b,
            (MethodHandle(a), MethodHandle(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Type(a), Type(b)) => a == b,
            (Field(a), Field(b)) => a == b,
            (Method(a), Method(b)) => a == b,
            (Enum(a), Enum(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Annotation(a), Annotation(b)) => a == b,
            (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for EncodedValue {}

impl Hash for EncodedValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use EncodedValue::*;
        self.tag().hash(state);
        match self {
            Byte(v) => v.hash(state),
            Short(v) => v.hash(state),
            Char(v) => v.hash(state),
            Int(v) => v.hash(state),
            Long(v) => v.hash(state),
            Float(v) => v.to_bits().hash(state),
            Double(v) => v.to_bits().hash(state),
            MethodType(v) => v.hash(state),
            MethodHandle(v) => v.hash(state),
            String(v) => v.hash(state),
            Type(v) => v.hash(state),
            Field(v) | Enum(v) => v.hash(state),
            Method(v) => v.hash(state),
            Array(v) => v.hash(state),
            Annotation(v) => v.hash(state),
            Null => {}
            Boolean(v) => v.hash(state),
        }
    }
}

impl EncodedValue {
    pub fn tag(&self) -> u8 {
        match self {
            EncodedValue::Byte(_) => VALUE_BYTE,
            EncodedValue::Short(_) => VALUE_SHORT,
            EncodedValue::Char(_) => VALUE_CHAR,
            EncodedValue::Int(_) => VALUE_INT,
            EncodedValue::Long(_) => VALUE_LONG,
            EncodedValue::Float(_) => VALUE_FLOAT,
            EncodedValue::Double(_) => VALUE_DOUBLE,
            EncodedValue::MethodType(_) => VALUE_METHOD_TYPE,
            EncodedValue::MethodHandle(_) => VALUE_METHOD_HANDLE,
            EncodedValue::String(_) => VALUE_STRING,
            EncodedValue::Type(_) => VALUE_TYPE,
            EncodedValue::Field(_) => VALUE_FIELD,
            EncodedValue::Method(_) => VALUE_METHOD,
            EncodedValue::Enum(_) => VALUE_ENUM,
            EncodedValue::Array(_) => VALUE_ARRAY,
            EncodedValue::Annotation(_) => VALUE_ANNOTATION,
            EncodedValue::Null => VALUE_NULL,
            EncodedValue::Boolean(_) => VALUE_BOOLEAN,
        }
    }

    /// The default value a field of type `desc` holds before `<clinit>` runs.
    pub fn zero_for_type(desc: &str) -> EncodedValue {
        match desc {
            "Z" => EncodedValue::Boolean(false),
            "B" => EncodedValue::Byte(0),
            "S" => EncodedValue::Short(0),
            "C" => EncodedValue::Char(0),
            "I" => EncodedValue::Int(0),
            "J" => EncodedValue::Long(0),
            "F" => EncodedValue::Float(0.0),
            "D" => EncodedValue::Double(0.0),
            _ => EncodedValue::Null,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            EncodedValue::Byte(v) => *v == 0,
            EncodedValue::Short(v) => *v == 0,
            EncodedValue::Char(v) => *v == 0,
            EncodedValue::Int(v) => *v == 0,
            EncodedValue::Long(v) => *v == 0,
            EncodedValue::Float(v) => v.to_bits() == 0,
            EncodedValue::Double(v) => v.to_bits() == 0,
            EncodedValue::Null => true,
            EncodedValue::Boolean(b) => !*b,
            _ => false,
        }
    }

    /// Integral payload widened to 64 bits, for constant seeding of static fields.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            EncodedValue::Byte(v) => Some(*v as i64),
            EncodedValue::Short(v) => Some(*v as i64),
            EncodedValue::Char(v) => Some(*v as i64),
            EncodedValue::Int(v) => Some(*v as i64),
            EncodedValue::Long(v) => Some(*v),
            EncodedValue::Boolean(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub(crate) fn read(bytes: &[u8], ix: &mut usize, refs: &dyn RefResolver, policy: UnknownTagPolicy) -> Result<EncodedValue> {
        let start = *ix;
        let header_byte = read_u1(bytes, ix)?;
        let value_arg = header_byte >> 5;
        let value_type = header_byte & 0x1F;
        let size = (value_arg + 1) as usize;

        let check_size = |max: usize| -> Result<()> {
            if size > max {
                return Err(DexError::malformed(start, format!("encoded value 0x{:02x} with {} bytes", value_type, size)));
            }
            Ok(())
        };

        Ok(match value_type {
            VALUE_BYTE => {
                check_size(1)?;
                EncodedValue::Byte(read_u1(bytes, ix)? as i8)
            }
            VALUE_SHORT => {
                check_size(2)?;
                EncodedValue::Short(read_signed(bytes, ix, size)? as i16)
            }
            VALUE_CHAR => {
                check_size(2)?;
                EncodedValue::Char(read_unsigned(bytes, ix, size)? as u16)
            }
            VALUE_INT => {
                check_size(4)?;
                EncodedValue::Int(read_signed(bytes, ix, size)? as i32)
            }
            VALUE_LONG => {
                check_size(8)?;
                EncodedValue::Long(read_signed(bytes, ix, size)?)
            }
            VALUE_FLOAT => {
                check_size(4)?;
                let raw = read_unsigned(bytes, ix, size)? << (8 * (4 - size));
                EncodedValue::Float(f32::from_bits(raw as u32))
            }
            VALUE_DOUBLE => {
                check_size(8)?;
                let raw = read_unsigned(bytes, ix, size)? << (8 * (8 - size));
                EncodedValue::Double(f64::from_bits(raw))
            }
            VALUE_METHOD_TYPE => EncodedValue::MethodType(refs.proto(read_index(bytes, ix, size)?)?),
            VALUE_METHOD_HANDLE => EncodedValue::MethodHandle(refs.method_handle(read_index(bytes, ix, size)?)?),
            VALUE_STRING => EncodedValue::String(refs.string(read_index(bytes, ix, size)?)?),
            VALUE_TYPE => EncodedValue::Type(refs.type_id(read_index(bytes, ix, size)?)?),
            VALUE_FIELD => EncodedValue::Field(refs.field(read_index(bytes, ix, size)?)?),
            VALUE_METHOD => EncodedValue::Method(refs.method(read_index(bytes, ix, size)?)?),
            VALUE_ENUM => EncodedValue::Enum(refs.field(read_index(bytes, ix, size)?)?),
            VALUE_ARRAY => EncodedValue::Array(read_encoded_array(bytes, ix, refs, policy)?),
            VALUE_ANNOTATION => EncodedValue::Annotation(EncodedAnnotation::read(bytes, ix, refs, policy)?),
            VALUE_NULL => EncodedValue::Null,
            VALUE_BOOLEAN => EncodedValue::Boolean(value_arg != 0),
            _ => match policy {
                UnknownTagPolicy::Fail => {
                    return Err(DexError::malformed(start, format!("unknown encoded value tag 0x{:02x}", value_type)));
                }
                UnknownTagPolicy::Substitute => {
                    warn!("[loader] unknown encoded value tag 0x{:02x} at 0x{:x}; substituting a zero value", value_type, start);
                    *ix += size;
                    EncodedValue::Null
                }
            },
        })
    }

    pub(crate) fn write(&self, bytes: &mut Vec<u8>, idx: &dyn IndexResolver) -> Result<usize> {
        let mut c = 0;
        match self {
            EncodedValue::Byte(v) => {
                c += write_u1(bytes, VALUE_BYTE);
                c += write_u1(bytes, *v as u8);
            }
            EncodedValue::Short(v) => c += write_signed(bytes, VALUE_SHORT, *v as i64),
            EncodedValue::Char(v) => c += write_unsigned(bytes, VALUE_CHAR, *v as u64),
            EncodedValue::Int(v) => c += write_signed(bytes, VALUE_INT, *v as i64),
            EncodedValue::Long(v) => c += write_signed(bytes, VALUE_LONG, *v),
            EncodedValue::Float(v) => c += write_right_zero_extended(bytes, VALUE_FLOAT, v.to_bits() as u64, 4),
            EncodedValue::Double(v) => c += write_right_zero_extended(bytes, VALUE_DOUBLE, v.to_bits(), 8),
            EncodedValue::MethodType(p) => c += write_unsigned(bytes, VALUE_METHOD_TYPE, idx.proto_idx(*p)? as u64),
            EncodedValue::MethodHandle(h) => {
                c += write_unsigned(bytes, VALUE_METHOD_HANDLE, idx.method_handle_idx(*h)? as u64)
            }
            EncodedValue::String(s) => c += write_unsigned(bytes, VALUE_STRING, idx.string_idx(*s)? as u64),
            EncodedValue::Type(t) => c += write_unsigned(bytes, VALUE_TYPE, idx.type_idx(*t)? as u64),
            EncodedValue::Field(f) => c += write_unsigned(bytes, VALUE_FIELD, idx.field_idx(*f)? as u64),
            EncodedValue::Method(m) => c += write_unsigned(bytes, VALUE_METHOD, idx.method_idx(*m)? as u64),
            EncodedValue::Enum(f) => c += write_unsigned(bytes, VALUE_ENUM, idx.field_idx(*f)? as u64),
            EncodedValue::Array(values) => {
                c += write_u1(bytes, VALUE_ARRAY);
                c += write_encoded_array(values, bytes, idx)?;
            }
            EncodedValue::Annotation(a) => {
                c += write_u1(bytes, VALUE_ANNOTATION);
                c += a.write(bytes, idx)?;
            }
            EncodedValue::Null => c += write_u1(bytes, VALUE_NULL),
            EncodedValue::Boolean(b) => c += write_u1(bytes, VALUE_BOOLEAN | ((*b as u8) << 5)),
        }
        Ok(c)
    }

    /// Reports every symbol the value references.
    pub(crate) fn visit_refs(&self, v: &mut dyn RefVisitor) {
        match self {
            EncodedValue::MethodType(p) => v.visit_proto(*p),
            EncodedValue::MethodHandle(h) => v.visit_method_handle(*h),
            EncodedValue::String(s) => v.visit_string(*s),
            EncodedValue::Type(t) => v.visit_type(*t),
            EncodedValue::Field(f) | EncodedValue::Enum(f) => v.visit_field(*f),
            EncodedValue::Method(m) => v.visit_method(*m),
            EncodedValue::Array(values) => values.iter().for_each(|e| e.visit_refs(v)),
            EncodedValue::Annotation(a) => a.visit_refs(v),
            _ => {}
        }
    }

    pub fn gather_strings(&self, out: &mut Vec<StringId>) {
        match self {
            EncodedValue::String(s) => out.push(*s),
            EncodedValue::Array(values) => values.iter().for_each(|e| e.gather_strings(out)),
            EncodedValue::Annotation(a) => {
                for e in &a.elements {
                    out.push(e.name);
                    e.value.gather_strings(out);
                }
            }
            _ => {}
        }
    }

    pub fn gather_types(&self, out: &mut Vec<TypeId>) {
        match self {
            EncodedValue::Type(t) => out.push(*t),
            EncodedValue::Array(values) => values.iter().for_each(|e| e.gather_types(out)),
            EncodedValue::Annotation(a) => {
                out.push(a.ty);
                a.elements.iter().for_each(|e| e.value.gather_types(out));
            }
            _ => {}
        }
    }

    pub fn gather_fields(&self, out: &mut Vec<FieldId>) {
        match self {
            EncodedValue::Field(f) | EncodedValue::Enum(f) => out.push(*f),
            EncodedValue::Array(values) => values.iter().for_each(|e| e.gather_fields(out)),
            EncodedValue::Annotation(a) => a.elements.iter().for_each(|e| e.value.gather_fields(out)),
            _ => {}
        }
    }

    pub fn gather_methods(&self, out: &mut Vec<MethodId>) {
        match self {
            EncodedValue::Method(m) => out.push(*m),
            EncodedValue::Array(values) => values.iter().for_each(|e| e.gather_methods(out)),
            EncodedValue::Annotation(a) => a.elements.iter().for_each(|e| e.value.gather_methods(out)),
            _ => {}
        }
    }

    pub fn show(&self, g: &Interner) -> String {
        match self {
            EncodedValue::Byte(x) => format!("{}", x),
            EncodedValue::Short(x) => format!("{}", x),
            EncodedValue::Char(x) => format!("'\\u{:04x}'", x),
            EncodedValue::Int(x) => format!("{}", x),
            EncodedValue::Long(x) => format!("{}L", x),
            EncodedValue::Float(x) => format!("{}f", x),
            EncodedValue::Double(x) => format!("{}", x),
            EncodedValue::MethodType(p) => g.show_proto(*p),
            EncodedValue::MethodHandle(h) => format!("{:?}", g.method_handle(*h)),
            EncodedValue::String(s) => format!("{:?}", &*g.string(*s)),
            EncodedValue::Type(t) => g.descriptor(*t).to_string(),
            EncodedValue::Field(f) => g.show_field(*f),
            EncodedValue::Method(m) => g.show_method(*m),
            EncodedValue::Enum(f) => format!(".enum {}", g.show_field(*f)),
            EncodedValue::Array(v) => {
                let items: Vec<String> = v.iter().map(|i| i.show(g)).collect();
                format!("{{ {} }}", items.join(", "))
            }
            EncodedValue::Annotation(a) => a.show(g),
            EncodedValue::Null => "null".to_string(),
            EncodedValue::Boolean(b) => b.to_string(),
        }
    }
}

impl EncodedAnnotation {
    pub(crate) fn read(bytes: &[u8], ix: &mut usize, refs: &dyn RefResolver, policy: UnknownTagPolicy) -> Result<EncodedAnnotation> {
        let ty = refs.type_id(read_uleb128(bytes, ix)?)?;
        let size = read_uleb128(bytes, ix)? as usize;
        let mut elements = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            let name = refs.string(read_uleb128(bytes, ix)?)?;
            let value = EncodedValue::read(bytes, ix, refs, policy)?;
            elements.push(AnnotationElement { name, value });
        }
        Ok(EncodedAnnotation { ty, elements })
    }

    /// Elements are written in string-index order, as the format requires.
    pub(crate) fn write(&self, bytes: &mut Vec<u8>, idx: &dyn IndexResolver) -> Result<usize> {
        let mut c = 0;
        c += write_uleb128(bytes, idx.type_idx(self.ty)?);
        c += write_uleb128(bytes, self.elements.len() as u32);
        let mut sorted = Vec::with_capacity(self.elements.len());
        for e in &self.elements {
            sorted.push((idx.string_idx(e.name)?, &e.value));
        }
        sorted.sort_by_key(|(name_idx, _)| *name_idx);
        for (name_idx, value) in sorted {
            c += write_uleb128(bytes, name_idx);
            c += value.write(bytes, idx)?;
        }
        Ok(c)
    }

    pub(crate) fn visit_refs(&self, v: &mut dyn RefVisitor) {
        v.visit_type(self.ty);
        for e in &self.elements {
            v.visit_string(e.name);
            e.value.visit_refs(v);
        }
    }

    pub fn show(&self, g: &Interner) -> String {
        let elems: Vec<String> = self
            .elements
            .iter()
            .map(|e| format!("{}={}", g.string(e.name), e.value.show(g)))
            .collect();
        format!("@{}({})", g.descriptor(self.ty), elems.join(", "))
    }
}

fn read_index(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u32> {
    if size > 4 {
        return Err(DexError::malformed(*ix, format!("index payload of {} bytes", size)));
    }
    Ok(read_unsigned(bytes, ix, size)? as u32)
}

fn read_unsigned(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u64> {
    let mut result = 0u64;
    for i in 0..size {
        result |= (read_u1(bytes, ix)? as u64) << (8 * i);
    }
    Ok(result)
}

fn read_signed(bytes: &[u8], ix: &mut usize, size: usize) -> Result<i64> {
    let raw = read_unsigned(bytes, ix, size)?;
    let shift = 64 - 8 * size as u32;
    Ok(((raw << shift) as i64) >> shift)
}

/// Smallest byte count whose sign extension reproduces `v`.
fn signed_size(v: i64) -> usize {
    for n in 1..8 {
        let shift = 64 - 8 * n as u32;
        if (v << shift) >> shift == v {
            return n;
        }
    }
    8
}

fn unsigned_size(v: u64) -> usize {
    std::cmp::max(1, 8 - (v.leading_zeros() / 8) as usize)
}

fn write_signed(bytes: &mut Vec<u8>, tag: u8, v: i64) -> usize {
    let size = signed_size(v);
    let c = write_u1(bytes, (((size - 1) as u8) << 5) | tag);
    c + write_x(bytes, &v.to_le_bytes()[..size])
}

fn write_unsigned(bytes: &mut Vec<u8>, tag: u8, v: u64) -> usize {
    let size = unsigned_size(v);
    let c = write_u1(bytes, (((size - 1) as u8) << 5) | tag);
    c + write_x(bytes, &v.to_le_bytes()[..size])
}

/// Floating point values keep their high-order bytes; trailing zero bytes are dropped.
fn write_right_zero_extended(bytes: &mut Vec<u8>, tag: u8, bits: u64, width: usize) -> usize {
    let zero_bytes = if bits == 0 { width } else { (bits.trailing_zeros() / 8) as usize };
    let size = std::cmp::max(1, width - zero_bytes.min(width));
    let shifted = bits >> (8 * (width - size));
    let c = write_u1(bytes, (((size - 1) as u8) << 5) | tag);
    c + write_x(bytes, &shifted.to_le_bytes()[..size])
}

pub(crate) fn write_encoded_array(values: &[EncodedValue], bytes: &mut Vec<u8>, idx: &dyn IndexResolver) -> Result<usize> {
    let mut c = write_uleb128(bytes, values.len() as u32);
    for value in values {
        c += value.write(bytes, idx)?;
    }
    Ok(c)
}

pub(crate) fn read_encoded_array(bytes: &[u8], ix: &mut usize, refs: &dyn RefResolver, policy: UnknownTagPolicy) -> Result<Vec<EncodedValue>> {
    let size = read_uleb128(bytes, ix)? as usize;
    let mut values = Vec::with_capacity(size.min(4096));
    for _ in 0..size {
        values.push(EncodedValue::read(bytes, ix, refs, policy)?);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ir::interner::{CallSiteId, MethodHandleId};

    /// Identity mapping between interned ids and table indices, for codec tests.
    pub(crate) struct IdentityIndex;

    impl RefResolver for IdentityIndex {
        fn string(&self, idx: u32) -> Result<StringId> {
            Ok(raw_id(idx))
        }
        fn type_id(&self, idx: u32) -> Result<TypeId> {
            Ok(raw_id(idx))
        }
        fn proto(&self, idx: u32) -> Result<ProtoId> {
            Ok(raw_id(idx))
        }
        fn field(&self, idx: u32) -> Result<FieldId> {
            Ok(raw_id(idx))
        }
        fn method(&self, idx: u32) -> Result<MethodId> {
            Ok(raw_id(idx))
        }
        fn method_handle(&self, idx: u32) -> Result<MethodHandleId> {
            Ok(raw_id(idx))
        }
        fn call_site(&self, idx: u32) -> Result<CallSiteId> {
            Ok(raw_id(idx))
        }
    }

    impl IndexResolver for IdentityIndex {
        fn string_idx(&self, id: StringId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn type_idx(&self, id: TypeId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn proto_idx(&self, id: ProtoId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn field_idx(&self, id: FieldId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn method_idx(&self, id: MethodId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn method_handle_idx(&self, id: MethodHandleId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn call_site_idx(&self, id: CallSiteId) -> Result<u32> {
            Ok(id.index() as u32)
        }
    }

    fn raw_id<T: From<u32>>(idx: u32) -> T {
        T::from(idx)
    }

    fn roundtrip(v: &EncodedValue) -> (EncodedValue, Vec<u8>) {
        let mut buf = vec![];
        v.write(&mut buf, &IdentityIndex).unwrap();
        let mut ix = 0;
        let back = EncodedValue::read(&buf, &mut ix, &IdentityIndex, UnknownTagPolicy::Fail).unwrap();
        assert_eq!(ix, buf.len());
        (back, buf)
    }

    #[test]
    fn test_minimal_integral_widths() {
        assert_eq!(roundtrip(&EncodedValue::Int(-1)).1, vec![0x04, 0xff]);
        assert_eq!(roundtrip(&EncodedValue::Int(128)).1, vec![0x24, 0x80, 0x00]);
        assert_eq!(roundtrip(&EncodedValue::Long(i64::MIN)).1.len(), 9);
        assert_eq!(roundtrip(&EncodedValue::Char(0xffff)).1, vec![0x23, 0xff, 0xff]);
        let (v, _) = roundtrip(&EncodedValue::Short(-300));
        assert_eq!(v, EncodedValue::Short(-300));
    }

    #[test]
    fn test_float_keeps_high_bytes() {
        // 1.0f is 0x3f800000: only the top two bytes are emitted
        let (v, buf) = roundtrip(&EncodedValue::Float(1.0));
        assert_eq!(buf, vec![0x30, 0x80, 0x3f]);
        assert_eq!(v, EncodedValue::Float(1.0));
        let (v, buf) = roundtrip(&EncodedValue::Double(0.0));
        assert_eq!(buf, vec![0x11, 0x00]);
        assert_eq!(v, EncodedValue::Double(0.0));
        let (v, _) = roundtrip(&EncodedValue::Double(-3.141592653589793));
        assert_eq!(v, EncodedValue::Double(-3.141592653589793));
    }

    #[test]
    fn test_unknown_tag_policy() {
        let bytes = [0x25u8, 0xaa, 0xbb, 0x1f];
        let mut ix = 0;
        assert!(EncodedValue::read(&bytes, &mut ix, &IdentityIndex, UnknownTagPolicy::Fail).is_err());
        let mut ix = 0;
        let arr = [0x02u8, 0x25, 0xaa, 0xbb, 0x3f];
        let values = read_encoded_array(&arr, &mut ix, &IdentityIndex, UnknownTagPolicy::Substitute).unwrap();
        assert_eq!(values, vec![EncodedValue::Null, EncodedValue::Boolean(true)]);
    }

    #[test]
    fn test_gather() {
        let g = Interner::new();
        let s = g.make_string("x");
        let t = g.make_type("LAnno;");
        let v = EncodedValue::Array(vec![
            EncodedValue::String(s),
            EncodedValue::Annotation(EncodedAnnotation {
                ty: t,
                elements: vec![AnnotationElement { name: g.make_string("value"), value: EncodedValue::Int(3) }],
            }),
        ]);
        let mut strings = vec![];
        v.gather_strings(&mut strings);
        assert_eq!(strings.len(), 2);
        let mut types = vec![];
        v.gather_types(&mut types);
        assert_eq!(types, vec![t]);
    }
}
