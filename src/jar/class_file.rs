//! Java class-file reader. Only the parts needed to declare a class are kept: the constant
//! pool, the header, and the field and method tables. Code and every other attribute are
//! skipped, except `ConstantValue` on fields.

use nom::bytes::complete::{tag, take};
use nom::error::{Error as NomError, ErrorKind as NomErrorKind};
use nom::number::complete::{be_f32, be_f64, be_i32, be_i64, be_u16, be_u32, be_u8};
use nom::IResult;

use crate::dex::mutf8::decode_mutf8;
use crate::error::{DexError, ErrorKind, Result};

pub const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

/// `ACC_SUPER` shares its bit with `ACC_SYNCHRONIZED` and means nothing outside the JVM.
pub const ACC_SUPER: u16 = 0x0020;

#[derive(Debug, Clone, PartialEq)]
enum Constant<'a> {
    Utf8(&'a [u8]),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    /// Field, method and interface-method refs, name-and-type, method handles, dynamic
    /// constants, modules and packages: nothing here needs their contents.
    Other,
    /// Second slot of a long or double.
    Unusable,
}

/// Value of a `ConstantValue` attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum JavaConstant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub constant_value: Option<JavaConstant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub access: u16,
    /// Internal name, e.g. `java/lang/String`.
    pub this_class: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
}

fn skip(i: &[u8], n: usize) -> IResult<&[u8], (Constant<'_>, bool)> {
    let (i, _) = take(n)(i)?;
    Ok((i, (Constant::Other, false)))
}

/// One pool entry, and whether it takes two slots.
fn constant(i: &[u8]) -> IResult<&[u8], (Constant<'_>, bool)> {
    let (i, t) = be_u8(i)?;
    match t {
        1 => {
            let (i, len) = be_u16(i)?;
            let (i, bytes) = take(len)(i)?;
            Ok((i, (Constant::Utf8(bytes), false)))
        }
        3 => be_i32(i).map(|(i, v)| (i, (Constant::Integer(v), false))),
        4 => be_f32(i).map(|(i, v)| (i, (Constant::Float(v), false))),
        5 => be_i64(i).map(|(i, v)| (i, (Constant::Long(v), true))),
        6 => be_f64(i).map(|(i, v)| (i, (Constant::Double(v), true))),
        7 => be_u16(i).map(|(i, v)| (i, (Constant::Class(v), false))),
        8 => be_u16(i).map(|(i, v)| (i, (Constant::String(v), false))),
        16 | 19 | 20 => skip(i, 2),
        15 => skip(i, 3),
        9 | 10 | 11 | 12 | 17 | 18 => skip(i, 4),
        _ => Err(nom::Err::Failure(NomError::new(i, NomErrorKind::Tag))),
    }
}

type RawMember<'a> = (u16, u16, u16, Vec<(u16, &'a [u8])>);

fn attribute(i: &[u8]) -> IResult<&[u8], (u16, &[u8])> {
    let (i, name) = be_u16(i)?;
    let (i, len) = be_u32(i)?;
    let (i, data) = take(len)(i)?;
    Ok((i, (name, data)))
}

fn attributes(mut i: &[u8]) -> IResult<&[u8], Vec<(u16, &[u8])>> {
    let (rest, n) = be_u16(i)?;
    i = rest;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (rest, a) = attribute(i)?;
        out.push(a);
        i = rest;
    }
    Ok((i, out))
}

fn members(mut i: &[u8]) -> IResult<&[u8], Vec<RawMember<'_>>> {
    let (rest, n) = be_u16(i)?;
    i = rest;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (rest, access) = be_u16(i)?;
        let (rest, name) = be_u16(rest)?;
        let (rest, desc) = be_u16(rest)?;
        let (rest, attrs) = attributes(rest)?;
        out.push((access, name, desc, attrs));
        i = rest;
    }
    Ok((i, out))
}

struct ConstantPool<'a> {
    entries: Vec<Constant<'a>>,
}

impl<'a> ConstantPool<'a> {
    fn parse(mut i: &'a [u8]) -> IResult<&'a [u8], ConstantPool<'a>> {
        let (rest, count) = be_u16(i)?;
        i = rest;
        // index 0 is never valid
        let mut entries = vec![Constant::Unusable];
        while entries.len() < count as usize {
            let (rest, (c, wide)) = constant(i)?;
            entries.push(c);
            if wide {
                entries.push(Constant::Unusable);
            }
            i = rest;
        }
        Ok((i, ConstantPool { entries }))
    }

    fn get(&self, index: u16) -> Result<&Constant<'a>> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(DexError::with_kind(
                ErrorKind::InvalidJava,
                format!("bad constant pool index {}", index),
            )),
            Some(c) => Ok(c),
        }
    }

    fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Utf8(bytes) => decode_mutf8(bytes),
            other => Err(DexError::with_kind(
                ErrorKind::InvalidJava,
                format!("constant {} is not a string: {:?}", index, other),
            )),
        }
    }

    fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            other => Err(DexError::with_kind(
                ErrorKind::InvalidJava,
                format!("constant {} is not a class: {:?}", index, other),
            )),
        }
    }

    fn value(&self, index: u16) -> Result<JavaConstant> {
        Ok(match self.get(index)? {
            Constant::Integer(v) => JavaConstant::Int(*v),
            Constant::Long(v) => JavaConstant::Long(*v),
            Constant::Float(v) => JavaConstant::Float(*v),
            Constant::Double(v) => JavaConstant::Double(*v),
            Constant::String(s) => JavaConstant::String(self.utf8(*s)?),
            other => {
                return Err(DexError::with_kind(
                    ErrorKind::InvalidJava,
                    format!("constant {} is not a field value: {:?}", index, other),
                ))
            }
        })
    }

    fn member(&self, raw: &RawMember<'_>) -> Result<MemberInfo> {
        let (access, name, desc, attrs) = raw;
        let mut constant_value = None;
        for (attr_name, data) in attrs {
            if self.utf8(*attr_name)? == "ConstantValue" && data.len() == 2 {
                constant_value = Some(self.value(u16::from_be_bytes([data[0], data[1]]))?);
            }
        }
        Ok(MemberInfo { access: *access, name: self.utf8(*name)?, descriptor: self.utf8(*desc)?, constant_value })
    }
}

fn nom_error(input: &[u8], e: nom::Err<NomError<&[u8]>>) -> DexError {
    let at = match &e {
        nom::Err::Error(err) | nom::Err::Failure(err) => input.len() - err.input.len(),
        nom::Err::Incomplete(_) => input.len(),
    };
    DexError::with_kind(ErrorKind::InvalidJava, format!("malformed class file at offset {}", at))
        .extra("offset", at.to_string())
}

fn header(i: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (i, _) = tag(&MAGIC[..])(i)?;
    let (i, minor) = be_u16(i)?;
    let (i, major) = be_u16(i)?;
    Ok((i, (minor, major)))
}

/// Access flags, this class, super class and interface indices.
fn class_info(i: &[u8]) -> IResult<&[u8], (u16, u16, u16, Vec<u16>)> {
    let (i, access) = be_u16(i)?;
    let (i, this) = be_u16(i)?;
    let (i, sup) = be_u16(i)?;
    let (mut i, n) = be_u16(i)?;
    let mut ifaces = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (rest, x) = be_u16(i)?;
        ifaces.push(x);
        i = rest;
    }
    Ok((i, (access, this, sup, ifaces)))
}

pub fn parse_class_file(input: &[u8]) -> Result<ClassFile> {
    let (i, (minor_version, major_version)) = header(input).map_err(|e| nom_error(input, e))?;
    let (i, pool) = ConstantPool::parse(i).map_err(|e| nom_error(input, e))?;
    let (i, (access, this, sup, ifaces)) = class_info(i).map_err(|e| nom_error(input, e))?;
    let (i, fields) = members(i).map_err(|e| nom_error(input, e))?;
    let (i, methods) = members(i).map_err(|e| nom_error(input, e))?;
    attributes(i).map_err(|e| nom_error(input, e))?;

    Ok(ClassFile {
        minor_version,
        major_version,
        access,
        this_class: pool.class_name(this)?,
        super_class: if sup == 0 { None } else { Some(pool.class_name(sup)?) },
        interfaces: ifaces.into_iter().map(|x| pool.class_name(x)).collect::<Result<_>>()?,
        fields: fields.iter().map(|m| pool.member(m)).collect::<Result<_>>()?,
        methods: methods.iter().map(|m| pool.member(m)).collect::<Result<_>>()?,
    })
}

/// Builds class files for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::{JavaConstant, MAGIC};
    use crate::dex::mutf8::encode_mutf8;

    pub struct Member<'a> {
        pub access: u16,
        pub name: &'a str,
        pub descriptor: &'a str,
        pub constant: Option<JavaConstant>,
    }

    #[derive(Default)]
    struct Pool {
        bytes: Vec<u8>,
        count: u16,
    }

    impl Pool {
        fn utf8(&mut self, s: &str) -> u16 {
            let data = encode_mutf8(s);
            self.bytes.push(1);
            self.bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
            self.bytes.extend_from_slice(&data);
            self.count += 1;
            self.count
        }

        fn class(&mut self, name: &str) -> u16 {
            let n = self.utf8(name);
            self.bytes.push(7);
            self.bytes.extend_from_slice(&n.to_be_bytes());
            self.count += 1;
            self.count
        }

        fn value(&mut self, v: &JavaConstant) -> u16 {
            match v {
                JavaConstant::Int(x) => {
                    self.bytes.push(3);
                    self.bytes.extend_from_slice(&x.to_be_bytes());
                }
                JavaConstant::Float(x) => {
                    self.bytes.push(4);
                    self.bytes.extend_from_slice(&x.to_be_bytes());
                }
                JavaConstant::Long(x) => {
                    self.bytes.push(5);
                    self.bytes.extend_from_slice(&x.to_be_bytes());
                    self.count += 2;
                    return self.count - 1;
                }
                JavaConstant::Double(x) => {
                    self.bytes.push(6);
                    self.bytes.extend_from_slice(&x.to_be_bytes());
                    self.count += 2;
                    return self.count - 1;
                }
                JavaConstant::String(s) => {
                    let n = self.utf8(s);
                    self.bytes.push(8);
                    self.bytes.extend_from_slice(&n.to_be_bytes());
                }
            }
            self.count += 1;
            self.count
        }
    }

    pub fn class_file(access: u16, this: &str, sup: Option<&str>, ifaces: &[&str], fields: &[Member], methods: &[Member]) -> Vec<u8> {
        let mut pool = Pool::default();
        let mut body = Vec::new();
        let this = pool.class(this);
        let sup = sup.map_or(0, |s| pool.class(s));
        body.extend_from_slice(&access.to_be_bytes());
        body.extend_from_slice(&this.to_be_bytes());
        body.extend_from_slice(&sup.to_be_bytes());
        body.extend_from_slice(&(ifaces.len() as u16).to_be_bytes());
        for i in ifaces {
            let x = pool.class(i);
            body.extend_from_slice(&x.to_be_bytes());
        }
        let code_attr = pool.utf8("Code");
        let cv_attr = pool.utf8("ConstantValue");
        for (list, is_method) in [(fields, false), (methods, true)] {
            body.extend_from_slice(&(list.len() as u16).to_be_bytes());
            for m in list {
                let name = pool.utf8(m.name);
                let desc = pool.utf8(m.descriptor);
                body.extend_from_slice(&m.access.to_be_bytes());
                body.extend_from_slice(&name.to_be_bytes());
                body.extend_from_slice(&desc.to_be_bytes());
                match (&m.constant, is_method) {
                    (Some(v), false) => {
                        let idx = pool.value(v);
                        body.extend_from_slice(&1u16.to_be_bytes());
                        body.extend_from_slice(&cv_attr.to_be_bytes());
                        body.extend_from_slice(&2u32.to_be_bytes());
                        body.extend_from_slice(&idx.to_be_bytes());
                    }
                    (_, true) => {
                        // an opaque body the reader must skip
                        body.extend_from_slice(&1u16.to_be_bytes());
                        body.extend_from_slice(&code_attr.to_be_bytes());
                        body.extend_from_slice(&3u32.to_be_bytes());
                        body.extend_from_slice(&[0xB1, 0, 0]);
                    }
                    _ => body.extend_from_slice(&0u16.to_be_bytes()),
                }
            }
        }
        body.extend_from_slice(&0u16.to_be_bytes());

        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&(pool.count + 1).to_be_bytes());
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{class_file, Member};
    use super::*;

    #[test]
    fn test_parse_declarations() {
        let bytes = class_file(
            0x0021,
            "a/b/Foo",
            Some("java/lang/Object"),
            &["java/lang/Runnable"],
            &[
                Member { access: 0x19, name: "MAX", descriptor: "J", constant: Some(JavaConstant::Long(1 << 40)) },
                Member { access: 0x19, name: "NAME", descriptor: "Ljava/lang/String;", constant: Some(JavaConstant::String("foo".into())) },
                Member { access: 0x2, name: "count", descriptor: "I", constant: None },
            ],
            &[
                Member { access: 0x1, name: "<init>", descriptor: "()V", constant: None },
                Member { access: 0x1, name: "run", descriptor: "()V", constant: None },
            ],
        );
        let cf = parse_class_file(&bytes).unwrap();
        assert_eq!(cf.major_version, 52);
        assert_eq!(cf.this_class, "a/b/Foo");
        assert_eq!(cf.super_class.as_deref(), Some("java/lang/Object"));
        assert_eq!(cf.interfaces, vec!["java/lang/Runnable".to_string()]);
        assert_eq!(cf.fields.len(), 3);
        assert_eq!(cf.fields[0].constant_value, Some(JavaConstant::Long(1 << 40)));
        assert_eq!(cf.fields[1].constant_value, Some(JavaConstant::String("foo".into())));
        assert_eq!(cf.fields[2].constant_value, None);
        let names: Vec<&str> = cf.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["<init>", "run"]);
    }

    #[test]
    fn test_malformed_input() {
        let err = parse_class_file(&[0xCA, 0xFE, 0xBA, 0xBF, 0, 0, 0, 52]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidJava);

        let mut bytes = class_file(0x1, "A", None, &[], &[], &[]);
        bytes.truncate(bytes.len() - 3);
        assert_eq!(parse_class_file(&bytes).unwrap_err().kind(), ErrorKind::InvalidJava);
    }
}
