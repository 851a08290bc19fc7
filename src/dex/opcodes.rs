//! The Dalvik opcode table: encoding format, reference kind, flags and the IR opcode each
//! DEX opcode lifts to.

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::ir::opcode::IROpcode;

/// What kind of pool index an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    None,
    String,
    Type,
    Field,
    Method,
    CallSite,
    MethodProto,
    MethodHandle,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpcodeFlags: u32 {
        const CAN_THROW = 0x1;
        const CAN_CONTINUE = 0x4;
        const SETS_RESULT = 0x8;
        const SETS_REGISTER = 0x10;
        const SETS_WIDE_REGISTER = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Format10t,
    Format10x,
    Format11n,
    Format11x,
    Format12x,
    Format20t,
    Format21c,
    Format21ih,
    Format21lh,
    Format21s,
    Format21t,
    Format22b,
    Format22c,
    Format22s,
    Format22t,
    Format22x,
    Format23x,
    Format30t,
    Format31c,
    Format31i,
    Format31t,
    Format32x,
    Format35c,
    Format3rc,
    Format45cc,
    Format4rcc,
    Format51l,
    ArrayPayload,
    PackedSwitchPayload,
    SparseSwitchPayload,
}

impl Format {
    /// Size in 16-bit code units; payloads are variable and report 0.
    pub const fn units(&self) -> usize {
        match self {
            Format::Format10t | Format::Format10x | Format::Format11n | Format::Format11x | Format::Format12x => 1,
            Format::Format20t
            | Format::Format21c
            | Format::Format21ih
            | Format::Format21lh
            | Format::Format21s
            | Format::Format21t
            | Format::Format22b
            | Format::Format22c
            | Format::Format22s
            | Format::Format22t
            | Format::Format22x
            | Format::Format23x => 2,
            Format::Format30t
            | Format::Format31c
            | Format::Format31i
            | Format::Format31t
            | Format::Format32x
            | Format::Format35c
            | Format::Format3rc => 3,
            Format::Format45cc | Format::Format4rcc => 4,
            Format::Format51l => 5,
            Format::ArrayPayload | Format::PackedSwitchPayload | Format::SparseSwitchPayload => 0,
        }
    }

    pub const fn is_payload_format(&self) -> bool {
        matches!(self, Format::ArrayPayload | Format::PackedSwitchPayload | Format::SparseSwitchPayload)
    }

    pub const fn is_range(&self) -> bool {
        matches!(self, Format::Format3rc | Format::Format4rcc)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub value: u8,
    pub name: &'static str,
    pub format: Format,
    pub reference_type: ReferenceType,
    pub flags: OpcodeFlags,
    /// The IR opcode this lifts to.
    pub ir: IROpcode,
}

impl Opcode {
    pub fn can_throw(&self) -> bool {
        self.flags.contains(OpcodeFlags::CAN_THROW)
    }

    pub fn can_continue(&self) -> bool {
        self.flags.contains(OpcodeFlags::CAN_CONTINUE)
    }

    /// Sets the hidden result register.
    pub fn sets_result(&self) -> bool {
        self.flags.contains(OpcodeFlags::SETS_RESULT)
    }

    pub fn sets_register(&self) -> bool {
        self.flags.contains(OpcodeFlags::SETS_REGISTER)
    }

    pub fn sets_wide_register(&self) -> bool {
        self.flags.contains(OpcodeFlags::SETS_WIDE_REGISTER)
    }

    /// `/2addr` arithmetic: `vA = vA op vB`.
    pub fn is_2addr(&self) -> bool {
        (0xb0..=0xcf).contains(&self.value)
    }
}

const C: OpcodeFlags = OpcodeFlags::CAN_CONTINUE;
const T: OpcodeFlags = OpcodeFlags::CAN_THROW;
const R: OpcodeFlags = OpcodeFlags::SETS_REGISTER;
const W: OpcodeFlags = OpcodeFlags::SETS_WIDE_REGISTER;
const S: OpcodeFlags = OpcodeFlags::SETS_RESULT;

const fn f(a: OpcodeFlags, b: OpcodeFlags) -> OpcodeFlags {
    a.union(b)
}

const fn f3(a: OpcodeFlags, b: OpcodeFlags, c: OpcodeFlags) -> OpcodeFlags {
    a.union(b).union(c)
}

const fn f4(a: OpcodeFlags, b: OpcodeFlags, c: OpcodeFlags, d: OpcodeFlags) -> OpcodeFlags {
    a.union(b).union(c).union(d)
}

const NONE: OpcodeFlags = OpcodeFlags::empty();

use Format::*;
use IROpcode as I;
use ReferenceType as Ref;

#[rustfmt::skip]
static TABLE: &[(u8, &str, Format, ReferenceType, IROpcode, OpcodeFlags)] = &[
    (0x00, "nop", Format10x, Ref::None, I::Nop, C),
    (0x01, "move", Format12x, Ref::None, I::Move, f(C, R)),
    (0x02, "move/from16", Format22x, Ref::None, I::Move, f(C, R)),
    (0x03, "move/16", Format32x, Ref::None, I::Move, f(C, R)),
    (0x04, "move-wide", Format12x, Ref::None, I::MoveWide, f3(C, R, W)),
    (0x05, "move-wide/from16", Format22x, Ref::None, I::MoveWide, f3(C, R, W)),
    (0x06, "move-wide/16", Format32x, Ref::None, I::MoveWide, f3(C, R, W)),
    (0x07, "move-object", Format12x, Ref::None, I::MoveObject, f(C, R)),
    (0x08, "move-object/from16", Format22x, Ref::None, I::MoveObject, f(C, R)),
    (0x09, "move-object/16", Format32x, Ref::None, I::MoveObject, f(C, R)),
    (0x0a, "move-result", Format11x, Ref::None, I::MoveResult, f(C, R)),
    (0x0b, "move-result-wide", Format11x, Ref::None, I::MoveResultWide, f3(C, R, W)),
    (0x0c, "move-result-object", Format11x, Ref::None, I::MoveResultObject, f(C, R)),
    (0x0d, "move-exception", Format11x, Ref::None, I::MoveException, f(C, R)),
    (0x0e, "return-void", Format10x, Ref::None, I::ReturnVoid, NONE),
    (0x0f, "return", Format11x, Ref::None, I::Return, NONE),
    (0x10, "return-wide", Format11x, Ref::None, I::ReturnWide, NONE),
    (0x11, "return-object", Format11x, Ref::None, I::ReturnObject, NONE),
    (0x12, "const/4", Format11n, Ref::None, I::Const, f(C, R)),
    (0x13, "const/16", Format21s, Ref::None, I::Const, f(C, R)),
    (0x14, "const", Format31i, Ref::None, I::Const, f(C, R)),
    (0x15, "const/high16", Format21ih, Ref::None, I::Const, f(C, R)),
    (0x16, "const-wide/16", Format21s, Ref::None, I::ConstWide, f3(C, R, W)),
    (0x17, "const-wide/32", Format31i, Ref::None, I::ConstWide, f3(C, R, W)),
    (0x18, "const-wide", Format51l, Ref::None, I::ConstWide, f3(C, R, W)),
    (0x19, "const-wide/high16", Format21lh, Ref::None, I::ConstWide, f3(C, R, W)),
    (0x1a, "const-string", Format21c, Ref::String, I::ConstString, f3(T, C, S)),
    (0x1b, "const-string/jumbo", Format31c, Ref::String, I::ConstString, f3(T, C, S)),
    (0x1c, "const-class", Format21c, Ref::Type, I::ConstClass, f3(T, C, S)),
    (0x1d, "monitor-enter", Format11x, Ref::None, I::MonitorEnter, f(T, C)),
    (0x1e, "monitor-exit", Format11x, Ref::None, I::MonitorExit, f(T, C)),
    (0x1f, "check-cast", Format21c, Ref::Type, I::CheckCast, f3(T, C, S)),
    (0x20, "instance-of", Format22c, Ref::Type, I::InstanceOf, f3(T, C, S)),
    (0x21, "array-length", Format12x, Ref::None, I::ArrayLength, f3(T, C, S)),
    (0x22, "new-instance", Format21c, Ref::Type, I::NewInstance, f3(T, C, S)),
    (0x23, "new-array", Format22c, Ref::Type, I::NewArray, f3(T, C, S)),
    (0x24, "filled-new-array", Format35c, Ref::Type, I::FilledNewArray, f3(T, C, S)),
    (0x25, "filled-new-array/range", Format3rc, Ref::Type, I::FilledNewArray, f3(T, C, S)),
    (0x26, "fill-array-data", Format31t, Ref::None, I::FillArrayData, f(T, C)),
    (0x27, "throw", Format11x, Ref::None, I::Throw, T),
    (0x28, "goto", Format10t, Ref::None, I::Goto, NONE),
    (0x29, "goto/16", Format20t, Ref::None, I::Goto, NONE),
    (0x2a, "goto/32", Format30t, Ref::None, I::Goto, NONE),
    (0x2b, "packed-switch", Format31t, Ref::None, I::Switch, C),
    (0x2c, "sparse-switch", Format31t, Ref::None, I::Switch, C),
    (0x2d, "cmpl-float", Format23x, Ref::None, I::CmplFloat, f(C, R)),
    (0x2e, "cmpg-float", Format23x, Ref::None, I::CmpgFloat, f(C, R)),
    (0x2f, "cmpl-double", Format23x, Ref::None, I::CmplDouble, f(C, R)),
    (0x30, "cmpg-double", Format23x, Ref::None, I::CmpgDouble, f(C, R)),
    (0x31, "cmp-long", Format23x, Ref::None, I::CmpLong, f(C, R)),
    (0x32, "if-eq", Format22t, Ref::None, I::IfEq, C),
    (0x33, "if-ne", Format22t, Ref::None, I::IfNe, C),
    (0x34, "if-lt", Format22t, Ref::None, I::IfLt, C),
    (0x35, "if-ge", Format22t, Ref::None, I::IfGe, C),
    (0x36, "if-gt", Format22t, Ref::None, I::IfGt, C),
    (0x37, "if-le", Format22t, Ref::None, I::IfLe, C),
    (0x38, "if-eqz", Format21t, Ref::None, I::IfEqz, C),
    (0x39, "if-nez", Format21t, Ref::None, I::IfNez, C),
    (0x3a, "if-ltz", Format21t, Ref::None, I::IfLtz, C),
    (0x3b, "if-gez", Format21t, Ref::None, I::IfGez, C),
    (0x3c, "if-gtz", Format21t, Ref::None, I::IfGtz, C),
    (0x3d, "if-lez", Format21t, Ref::None, I::IfLez, C),
    (0x44, "aget", Format23x, Ref::None, I::Aget, f3(T, C, S)),
    (0x45, "aget-wide", Format23x, Ref::None, I::AgetWide, f3(T, C, S)),
    (0x46, "aget-object", Format23x, Ref::None, I::AgetObject, f3(T, C, S)),
    (0x47, "aget-boolean", Format23x, Ref::None, I::AgetBoolean, f3(T, C, S)),
    (0x48, "aget-byte", Format23x, Ref::None, I::AgetByte, f3(T, C, S)),
    (0x49, "aget-char", Format23x, Ref::None, I::AgetChar, f3(T, C, S)),
    (0x4a, "aget-short", Format23x, Ref::None, I::AgetShort, f3(T, C, S)),
    (0x4b, "aput", Format23x, Ref::None, I::Aput, f(T, C)),
    (0x4c, "aput-wide", Format23x, Ref::None, I::AputWide, f(T, C)),
    (0x4d, "aput-object", Format23x, Ref::None, I::AputObject, f(T, C)),
    (0x4e, "aput-boolean", Format23x, Ref::None, I::AputBoolean, f(T, C)),
    (0x4f, "aput-byte", Format23x, Ref::None, I::AputByte, f(T, C)),
    (0x50, "aput-char", Format23x, Ref::None, I::AputChar, f(T, C)),
    (0x51, "aput-short", Format23x, Ref::None, I::AputShort, f(T, C)),
    (0x52, "iget", Format22c, Ref::Field, I::Iget, f3(T, C, S)),
    (0x53, "iget-wide", Format22c, Ref::Field, I::IgetWide, f3(T, C, S)),
    (0x54, "iget-object", Format22c, Ref::Field, I::IgetObject, f3(T, C, S)),
    (0x55, "iget-boolean", Format22c, Ref::Field, I::IgetBoolean, f3(T, C, S)),
    (0x56, "iget-byte", Format22c, Ref::Field, I::IgetByte, f3(T, C, S)),
    (0x57, "iget-char", Format22c, Ref::Field, I::IgetChar, f3(T, C, S)),
    (0x58, "iget-short", Format22c, Ref::Field, I::IgetShort, f3(T, C, S)),
    (0x59, "iput", Format22c, Ref::Field, I::Iput, f(T, C)),
    (0x5a, "iput-wide", Format22c, Ref::Field, I::IputWide, f(T, C)),
    (0x5b, "iput-object", Format22c, Ref::Field, I::IputObject, f(T, C)),
    (0x5c, "iput-boolean", Format22c, Ref::Field, I::IputBoolean, f(T, C)),
    (0x5d, "iput-byte", Format22c, Ref::Field, I::IputByte, f(T, C)),
    (0x5e, "iput-char", Format22c, Ref::Field, I::IputChar, f(T, C)),
    (0x5f, "iput-short", Format22c, Ref::Field, I::IputShort, f(T, C)),
    (0x60, "sget", Format21c, Ref::Field, I::Sget, f3(T, C, S)),
    (0x61, "sget-wide", Format21c, Ref::Field, I::SgetWide, f3(T, C, S)),
    (0x62, "sget-object", Format21c, Ref::Field, I::SgetObject, f3(T, C, S)),
    (0x63, "sget-boolean", Format21c, Ref::Field, I::SgetBoolean, f3(T, C, S)),
    (0x64, "sget-byte", Format21c, Ref::Field, I::SgetByte, f3(T, C, S)),
    (0x65, "sget-char", Format21c, Ref::Field, I::SgetChar, f3(T, C, S)),
    (0x66, "sget-short", Format21c, Ref::Field, I::SgetShort, f3(T, C, S)),
    (0x67, "sput", Format21c, Ref::Field, I::Sput, f(T, C)),
    (0x68, "sput-wide", Format21c, Ref::Field, I::SputWide, f(T, C)),
    (0x69, "sput-object", Format21c, Ref::Field, I::SputObject, f(T, C)),
    (0x6a, "sput-boolean", Format21c, Ref::Field, I::SputBoolean, f(T, C)),
    (0x6b, "sput-byte", Format21c, Ref::Field, I::SputByte, f(T, C)),
    (0x6c, "sput-char", Format21c, Ref::Field, I::SputChar, f(T, C)),
    (0x6d, "sput-short", Format21c, Ref::Field, I::SputShort, f(T, C)),
    (0x6e, "invoke-virtual", Format35c, Ref::Method, I::InvokeVirtual, f3(T, C, S)),
    (0x6f, "invoke-super", Format35c, Ref::Method, I::InvokeSuper, f3(T, C, S)),
    (0x70, "invoke-direct", Format35c, Ref::Method, I::InvokeDirect, f3(T, C, S)),
    (0x71, "invoke-static", Format35c, Ref::Method, I::InvokeStatic, f3(T, C, S)),
    (0x72, "invoke-interface", Format35c, Ref::Method, I::InvokeInterface, f3(T, C, S)),
    (0x74, "invoke-virtual/range", Format3rc, Ref::Method, I::InvokeVirtual, f3(T, C, S)),
    (0x75, "invoke-super/range", Format3rc, Ref::Method, I::InvokeSuper, f3(T, C, S)),
    (0x76, "invoke-direct/range", Format3rc, Ref::Method, I::InvokeDirect, f3(T, C, S)),
    (0x77, "invoke-static/range", Format3rc, Ref::Method, I::InvokeStatic, f3(T, C, S)),
    (0x78, "invoke-interface/range", Format3rc, Ref::Method, I::InvokeInterface, f3(T, C, S)),
    (0x7b, "neg-int", Format12x, Ref::None, I::NegInt, f(C, R)),
    (0x7c, "not-int", Format12x, Ref::None, I::NotInt, f(C, R)),
    (0x7d, "neg-long", Format12x, Ref::None, I::NegLong, f3(C, R, W)),
    (0x7e, "not-long", Format12x, Ref::None, I::NotLong, f3(C, R, W)),
    (0x7f, "neg-float", Format12x, Ref::None, I::NegFloat, f(C, R)),
    (0x80, "neg-double", Format12x, Ref::None, I::NegDouble, f3(C, R, W)),
    (0x81, "int-to-long", Format12x, Ref::None, I::IntToLong, f3(C, R, W)),
    (0x82, "int-to-float", Format12x, Ref::None, I::IntToFloat, f(C, R)),
    (0x83, "int-to-double", Format12x, Ref::None, I::IntToDouble, f3(C, R, W)),
    (0x84, "long-to-int", Format12x, Ref::None, I::LongToInt, f(C, R)),
    (0x85, "long-to-float", Format12x, Ref::None, I::LongToFloat, f(C, R)),
    (0x86, "long-to-double", Format12x, Ref::None, I::LongToDouble, f3(C, R, W)),
    (0x87, "float-to-int", Format12x, Ref::None, I::FloatToInt, f(C, R)),
    (0x88, "float-to-long", Format12x, Ref::None, I::FloatToLong, f3(C, R, W)),
    (0x89, "float-to-double", Format12x, Ref::None, I::FloatToDouble, f3(C, R, W)),
    (0x8a, "double-to-int", Format12x, Ref::None, I::DoubleToInt, f(C, R)),
    (0x8b, "double-to-long", Format12x, Ref::None, I::DoubleToLong, f3(C, R, W)),
    (0x8c, "double-to-float", Format12x, Ref::None, I::DoubleToFloat, f(C, R)),
    (0x8d, "int-to-byte", Format12x, Ref::None, I::IntToByte, f(C, R)),
    (0x8e, "int-to-char", Format12x, Ref::None, I::IntToChar, f(C, R)),
    (0x8f, "int-to-short", Format12x, Ref::None, I::IntToShort, f(C, R)),
    (0x90, "add-int", Format23x, Ref::None, I::AddInt, f(C, R)),
    (0x91, "sub-int", Format23x, Ref::None, I::SubInt, f(C, R)),
    (0x92, "mul-int", Format23x, Ref::None, I::MulInt, f(C, R)),
    (0x93, "div-int", Format23x, Ref::None, I::DivInt, f3(T, C, R)),
    (0x94, "rem-int", Format23x, Ref::None, I::RemInt, f3(T, C, R)),
    (0x95, "and-int", Format23x, Ref::None, I::AndInt, f(C, R)),
    (0x96, "or-int", Format23x, Ref::None, I::OrInt, f(C, R)),
    (0x97, "xor-int", Format23x, Ref::None, I::XorInt, f(C, R)),
    (0x98, "shl-int", Format23x, Ref::None, I::ShlInt, f(C, R)),
    (0x99, "shr-int", Format23x, Ref::None, I::ShrInt, f(C, R)),
    (0x9a, "ushr-int", Format23x, Ref::None, I::UshrInt, f(C, R)),
    (0x9b, "add-long", Format23x, Ref::None, I::AddLong, f3(C, R, W)),
    (0x9c, "sub-long", Format23x, Ref::None, I::SubLong, f3(C, R, W)),
    (0x9d, "mul-long", Format23x, Ref::None, I::MulLong, f3(C, R, W)),
    (0x9e, "div-long", Format23x, Ref::None, I::DivLong, f4(T, C, R, W)),
    (0x9f, "rem-long", Format23x, Ref::None, I::RemLong, f4(T, C, R, W)),
    (0xa0, "and-long", Format23x, Ref::None, I::AndLong, f3(C, R, W)),
    (0xa1, "or-long", Format23x, Ref::None, I::OrLong, f3(C, R, W)),
    (0xa2, "xor-long", Format23x, Ref::None, I::XorLong, f3(C, R, W)),
    (0xa3, "shl-long", Format23x, Ref::None, I::ShlLong, f3(C, R, W)),
    (0xa4, "shr-long", Format23x, Ref::None, I::ShrLong, f3(C, R, W)),
    (0xa5, "ushr-long", Format23x, Ref::None, I::UshrLong, f3(C, R, W)),
    (0xa6, "add-float", Format23x, Ref::None, I::AddFloat, f(C, R)),
    (0xa7, "sub-float", Format23x, Ref::None, I::SubFloat, f(C, R)),
    (0xa8, "mul-float", Format23x, Ref::None, I::MulFloat, f(C, R)),
    (0xa9, "div-float", Format23x, Ref::None, I::DivFloat, f(C, R)),
    (0xaa, "rem-float", Format23x, Ref::None, I::RemFloat, f(C, R)),
    (0xab, "add-double", Format23x, Ref::None, I::AddDouble, f3(C, R, W)),
    (0xac, "sub-double", Format23x, Ref::None, I::SubDouble, f3(C, R, W)),
    (0xad, "mul-double", Format23x, Ref::None, I::MulDouble, f3(C, R, W)),
    (0xae, "div-double", Format23x, Ref::None, I::DivDouble, f3(C, R, W)),
    (0xaf, "rem-double", Format23x, Ref::None, I::RemDouble, f3(C, R, W)),
    (0xb0, "add-int/2addr", Format12x, Ref::None, I::AddInt, f(C, R)),
    (0xb1, "sub-int/2addr", Format12x, Ref::None, I::SubInt, f(C, R)),
    (0xb2, "mul-int/2addr", Format12x, Ref::None, I::MulInt, f(C, R)),
    (0xb3, "div-int/2addr", Format12x, Ref::None, I::DivInt, f3(T, C, R)),
    (0xb4, "rem-int/2addr", Format12x, Ref::None, I::RemInt, f3(T, C, R)),
    (0xb5, "and-int/2addr", Format12x, Ref::None, I::AndInt, f(C, R)),
    (0xb6, "or-int/2addr", Format12x, Ref::None, I::OrInt, f(C, R)),
    (0xb7, "xor-int/2addr", Format12x, Ref::None, I::XorInt, f(C, R)),
    (0xb8, "shl-int/2addr", Format12x, Ref::None, I::ShlInt, f(C, R)),
    (0xb9, "shr-int/2addr", Format12x, Ref::None, I::ShrInt, f(C, R)),
    (0xba, "ushr-int/2addr", Format12x, Ref::None, I::UshrInt, f(C, R)),
    (0xbb, "add-long/2addr", Format12x, Ref::None, I::AddLong, f3(C, R, W)),
    (0xbc, "sub-long/2addr", Format12x, Ref::None, I::SubLong, f3(C, R, W)),
    (0xbd, "mul-long/2addr", Format12x, Ref::None, I::MulLong, f3(C, R, W)),
    (0xbe, "div-long/2addr", Format12x, Ref::None, I::DivLong, f4(T, C, R, W)),
    (0xbf, "rem-long/2addr", Format12x, Ref::None, I::RemLong, f4(T, C, R, W)),
    (0xc0, "and-long/2addr", Format12x, Ref::None, I::AndLong, f3(C, R, W)),
    (0xc1, "or-long/2addr", Format12x, Ref::None, I::OrLong, f3(C, R, W)),
    (0xc2, "xor-long/2addr", Format12x, Ref::None, I::XorLong, f3(C, R, W)),
    (0xc3, "shl-long/2addr", Format12x, Ref::None, I::ShlLong, f3(C, R, W)),
    (0xc4, "shr-long/2addr", Format12x, Ref::None, I::ShrLong, f3(C, R, W)),
    (0xc5, "ushr-long/2addr", Format12x, Ref::None, I::UshrLong, f3(C, R, W)),
    (0xc6, "add-float/2addr", Format12x, Ref::None, I::AddFloat, f(C, R)),
    (0xc7, "sub-float/2addr", Format12x, Ref::None, I::SubFloat, f(C, R)),
    (0xc8, "mul-float/2addr", Format12x, Ref::None, I::MulFloat, f(C, R)),
    (0xc9, "div-float/2addr", Format12x, Ref::None, I::DivFloat, f(C, R)),
    (0xca, "rem-float/2addr", Format12x, Ref::None, I::RemFloat, f(C, R)),
    (0xcb, "add-double/2addr", Format12x, Ref::None, I::AddDouble, f3(C, R, W)),
    (0xcc, "sub-double/2addr", Format12x, Ref::None, I::SubDouble, f3(C, R, W)),
    (0xcd, "mul-double/2addr", Format12x, Ref::None, I::MulDouble, f3(C, R, W)),
    (0xce, "div-double/2addr", Format12x, Ref::None, I::DivDouble, f3(C, R, W)),
    (0xcf, "rem-double/2addr", Format12x, Ref::None, I::RemDouble, f3(C, R, W)),
    (0xd0, "add-int/lit16", Format22s, Ref::None, I::AddIntLit16, f(C, R)),
    (0xd1, "rsub-int", Format22s, Ref::None, I::RsubInt, f(C, R)),
    (0xd2, "mul-int/lit16", Format22s, Ref::None, I::MulIntLit16, f(C, R)),
    (0xd3, "div-int/lit16", Format22s, Ref::None, I::DivIntLit16, f3(T, C, R)),
    (0xd4, "rem-int/lit16", Format22s, Ref::None, I::RemIntLit16, f3(T, C, R)),
    (0xd5, "and-int/lit16", Format22s, Ref::None, I::AndIntLit16, f(C, R)),
    (0xd6, "or-int/lit16", Format22s, Ref::None, I::OrIntLit16, f(C, R)),
    (0xd7, "xor-int/lit16", Format22s, Ref::None, I::XorIntLit16, f(C, R)),
    (0xd8, "add-int/lit8", Format22b, Ref::None, I::AddIntLit8, f(C, R)),
    (0xd9, "rsub-int/lit8", Format22b, Ref::None, I::RsubIntLit8, f(C, R)),
    (0xda, "mul-int/lit8", Format22b, Ref::None, I::MulIntLit8, f(C, R)),
    (0xdb, "div-int/lit8", Format22b, Ref::None, I::DivIntLit8, f3(T, C, R)),
    (0xdc, "rem-int/lit8", Format22b, Ref::None, I::RemIntLit8, f3(T, C, R)),
    (0xdd, "and-int/lit8", Format22b, Ref::None, I::AndIntLit8, f(C, R)),
    (0xde, "or-int/lit8", Format22b, Ref::None, I::OrIntLit8, f(C, R)),
    (0xdf, "xor-int/lit8", Format22b, Ref::None, I::XorIntLit8, f(C, R)),
    (0xe0, "shl-int/lit8", Format22b, Ref::None, I::ShlIntLit8, f(C, R)),
    (0xe1, "shr-int/lit8", Format22b, Ref::None, I::ShrIntLit8, f(C, R)),
    (0xe2, "ushr-int/lit8", Format22b, Ref::None, I::UshrIntLit8, f(C, R)),
    (0xfa, "invoke-polymorphic", Format45cc, Ref::Method, I::InvokePolymorphic, f3(T, C, S)),
    (0xfb, "invoke-polymorphic/range", Format4rcc, Ref::Method, I::InvokePolymorphic, f3(T, C, S)),
    (0xfc, "invoke-custom", Format35c, Ref::CallSite, I::InvokeCustom, f3(T, C, S)),
    (0xfd, "invoke-custom/range", Format3rc, Ref::CallSite, I::InvokeCustom, f3(T, C, S)),
    (0xfe, "const-method-handle", Format21c, Ref::MethodHandle, I::ConstMethodHandle, f3(T, C, S)),
    (0xff, "const-method-type", Format21c, Ref::MethodProto, I::ConstMethodType, f3(T, C, S)),
];

/// Indexed by opcode value; `None` for unused values.
pub static OPCODES: Lazy<Vec<Option<Opcode>>> = Lazy::new(|| {
    let mut v = vec![None; 256];
    for &(value, name, format, reference_type, ir, flags) in TABLE {
        v[value as usize] = Some(Opcode { value, name, format, reference_type, flags, ir });
    }
    v
});

pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const ARRAY_PAYLOAD: u16 = 0x0300;

pub fn lookup(value: u8) -> Option<&'static Opcode> {
    OPCODES[value as usize].as_ref()
}

pub fn by_name(name: &str) -> Option<&'static Opcode> {
    OPCODES.iter().flatten().find(|o| o.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        assert_eq!(OPCODES.iter().flatten().count(), TABLE.len());
        assert!(lookup(0x3e).is_none());
        assert!(lookup(0x73).is_none());
        let op = lookup(0x6e).unwrap();
        assert_eq!(op.name, "invoke-virtual");
        assert_eq!(op.format.units(), 3);
        assert!(op.sets_result() && op.can_throw());
        assert_eq!(by_name("add-int/2addr").unwrap().ir, IROpcode::AddInt);
        assert!(by_name("add-int/2addr").unwrap().is_2addr());
    }

    #[test]
    fn test_ir_flags_agree() {
        for op in OPCODES.iter().flatten() {
            assert_eq!(op.can_throw(), op.ir.can_throw(), "{}", op.name);
        }
    }
}
