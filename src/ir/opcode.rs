//! IR opcodes.
//!
//! The IR drops the size variants of the DEX instruction set (`move/from16`, `const/4`,
//! `goto/32`, `/range` invokes, `/2addr` arithmetic). Operations that write the hidden result
//! register are followed by a `move-result-pseudo*`, and parameters are introduced by
//! `load-param*` pseudo instructions.

macro_rules! ir_opcodes {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum IROpcode {
            $($variant),*
        }

        impl IROpcode {
            pub const ALL: &'static [IROpcode] = &[$(IROpcode::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(IROpcode::$variant => $name),*
                }
            }

            pub fn from_name(name: &str) -> Option<IROpcode> {
                match name {
                    $($name => Some(IROpcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

ir_opcodes! {
    Nop => "nop",
    Move => "move",
    MoveWide => "move-wide",
    MoveObject => "move-object",
    MoveResult => "move-result",
    MoveResultWide => "move-result-wide",
    MoveResultObject => "move-result-object",
    MoveException => "move-exception",
    ReturnVoid => "return-void",
    Return => "return",
    ReturnWide => "return-wide",
    ReturnObject => "return-object",
    Const => "const",
    ConstWide => "const-wide",
    ConstString => "const-string",
    ConstClass => "const-class",
    MonitorEnter => "monitor-enter",
    MonitorExit => "monitor-exit",
    CheckCast => "check-cast",
    InstanceOf => "instance-of",
    ArrayLength => "array-length",
    NewInstance => "new-instance",
    NewArray => "new-array",
    FilledNewArray => "filled-new-array",
    FillArrayData => "fill-array-data",
    Throw => "throw",
    Goto => "goto",
    Switch => "switch",
    CmplFloat => "cmpl-float",
    CmpgFloat => "cmpg-float",
    CmplDouble => "cmpl-double",
    CmpgDouble => "cmpg-double",
    CmpLong => "cmp-long",
    IfEq => "if-eq",
    IfNe => "if-ne",
    IfLt => "if-lt",
    IfGe => "if-ge",
    IfGt => "if-gt",
    IfLe => "if-le",
    IfEqz => "if-eqz",
    IfNez => "if-nez",
    IfLtz => "if-ltz",
    IfGez => "if-gez",
    IfGtz => "if-gtz",
    IfLez => "if-lez",
    Aget => "aget",
    AgetWide => "aget-wide",
    AgetObject => "aget-object",
    AgetBoolean => "aget-boolean",
    AgetByte => "aget-byte",
    AgetChar => "aget-char",
    AgetShort => "aget-short",
    Aput => "aput",
    AputWide => "aput-wide",
    AputObject => "aput-object",
    AputBoolean => "aput-boolean",
    AputByte => "aput-byte",
    AputChar => "aput-char",
    AputShort => "aput-short",
    Iget => "iget",
    IgetWide => "iget-wide",
    IgetObject => "iget-object",
    IgetBoolean => "iget-boolean",
    IgetByte => "iget-byte",
    IgetChar => "iget-char",
    IgetShort => "iget-short",
    Iput => "iput",
    IputWide => "iput-wide",
    IputObject => "iput-object",
    IputBoolean => "iput-boolean",
    IputByte => "iput-byte",
    IputChar => "iput-char",
    IputShort => "iput-short",
    Sget => "sget",
    SgetWide => "sget-wide",
    SgetObject => "sget-object",
    SgetBoolean => "sget-boolean",
    SgetByte => "sget-byte",
    SgetChar => "sget-char",
    SgetShort => "sget-short",
    Sput => "sput",
    SputWide => "sput-wide",
    SputObject => "sput-object",
    SputBoolean => "sput-boolean",
    SputByte => "sput-byte",
    SputChar => "sput-char",
    SputShort => "sput-short",
    InvokeVirtual => "invoke-virtual",
    InvokeSuper => "invoke-super",
    InvokeDirect => "invoke-direct",
    InvokeStatic => "invoke-static",
    InvokeInterface => "invoke-interface",
    InvokePolymorphic => "invoke-polymorphic",
    InvokeCustom => "invoke-custom",
    NegInt => "neg-int",
    NotInt => "not-int",
    NegLong => "neg-long",
    NotLong => "not-long",
    NegFloat => "neg-float",
    NegDouble => "neg-double",
    IntToLong => "int-to-long",
    IntToFloat => "int-to-float",
    IntToDouble => "int-to-double",
    LongToInt => "long-to-int",
    LongToFloat => "long-to-float",
    LongToDouble => "long-to-double",
    FloatToInt => "float-to-int",
    FloatToLong => "float-to-long",
    FloatToDouble => "float-to-double",
    DoubleToInt => "double-to-int",
    DoubleToLong => "double-to-long",
    DoubleToFloat => "double-to-float",
    IntToByte => "int-to-byte",
    IntToChar => "int-to-char",
    IntToShort => "int-to-short",
    AddInt => "add-int",
    SubInt => "sub-int",
    MulInt => "mul-int",
    DivInt => "div-int",
    RemInt => "rem-int",
    AndInt => "and-int",
    OrInt => "or-int",
    XorInt => "xor-int",
    ShlInt => "shl-int",
    ShrInt => "shr-int",
    UshrInt => "ushr-int",
    AddLong => "add-long",
    SubLong => "sub-long",
    MulLong => "mul-long",
    DivLong => "div-long",
    RemLong => "rem-long",
    AndLong => "and-long",
    OrLong => "or-long",
    XorLong => "xor-long",
    ShlLong => "shl-long",
    ShrLong => "shr-long",
    UshrLong => "ushr-long",
    AddFloat => "add-float",
    SubFloat => "sub-float",
    MulFloat => "mul-float",
    DivFloat => "div-float",
    RemFloat => "rem-float",
    AddDouble => "add-double",
    SubDouble => "sub-double",
    MulDouble => "mul-double",
    DivDouble => "div-double",
    RemDouble => "rem-double",
    AddIntLit16 => "add-int/lit16",
    RsubInt => "rsub-int",
    MulIntLit16 => "mul-int/lit16",
    DivIntLit16 => "div-int/lit16",
    RemIntLit16 => "rem-int/lit16",
    AndIntLit16 => "and-int/lit16",
    OrIntLit16 => "or-int/lit16",
    XorIntLit16 => "xor-int/lit16",
    AddIntLit8 => "add-int/lit8",
    RsubIntLit8 => "rsub-int/lit8",
    MulIntLit8 => "mul-int/lit8",
    DivIntLit8 => "div-int/lit8",
    RemIntLit8 => "rem-int/lit8",
    AndIntLit8 => "and-int/lit8",
    OrIntLit8 => "or-int/lit8",
    XorIntLit8 => "xor-int/lit8",
    ShlIntLit8 => "shl-int/lit8",
    ShrIntLit8 => "shr-int/lit8",
    UshrIntLit8 => "ushr-int/lit8",
    ConstMethodHandle => "const-method-handle",
    ConstMethodType => "const-method-type",
    LoadParam => "load-param",
    LoadParamWide => "load-param-wide",
    LoadParamObject => "load-param-object",
    MoveResultPseudo => "move-result-pseudo",
    MoveResultPseudoWide => "move-result-pseudo-wide",
    MoveResultPseudoObject => "move-result-pseudo-object",
}

/// What kind of immediate an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Literal,
    String,
    Type,
    Field,
    Method,
    MethodAndProto,
    Proto,
    CallSite,
    MethodHandle,
    Data,
}

use IROpcode::*;

impl IROpcode {
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Const | ConstWide => OperandKind::Literal,
            op if op.is_binop_lit() => OperandKind::Literal,
            ConstString => OperandKind::String,
            ConstClass | CheckCast | InstanceOf | NewInstance | NewArray | FilledNewArray => OperandKind::Type,
            op if op.is_field_op() => OperandKind::Field,
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface => OperandKind::Method,
            InvokePolymorphic => OperandKind::MethodAndProto,
            InvokeCustom => OperandKind::CallSite,
            ConstMethodHandle => OperandKind::MethodHandle,
            ConstMethodType => OperandKind::Proto,
            FillArrayData => OperandKind::Data,
            _ => OperandKind::None,
        }
    }

    pub fn is_load_param(self) -> bool {
        matches!(self, LoadParam | LoadParamWide | LoadParamObject)
    }

    pub fn is_move_result_pseudo(self) -> bool {
        matches!(self, MoveResultPseudo | MoveResultPseudoWide | MoveResultPseudoObject)
    }

    pub fn is_move_result(self) -> bool {
        matches!(self, MoveResult | MoveResultWide | MoveResultObject)
    }

    pub fn is_move_result_any(self) -> bool {
        self.is_move_result() || self.is_move_result_pseudo()
    }

    pub fn is_move(self) -> bool {
        matches!(self, Move | MoveWide | MoveObject)
    }

    pub fn is_return(self) -> bool {
        matches!(self, ReturnVoid | Return | ReturnWide | ReturnObject)
    }

    pub fn is_goto(self) -> bool {
        self == Goto
    }

    pub fn is_switch(self) -> bool {
        self == Switch
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(self, IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez)
    }

    pub fn is_testz_branch(self) -> bool {
        matches!(self, IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez)
    }

    pub fn is_branch(self) -> bool {
        self.is_goto() || self.is_switch() || self.is_conditional_branch()
    }

    /// Ends a basic block: control never falls through to the next item unconditionally.
    pub fn is_block_end(self) -> bool {
        self.is_branch() || self.is_return() || self == Throw
    }

    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface | InvokePolymorphic | InvokeCustom
        )
    }

    pub fn is_aget(self) -> bool {
        matches!(self, Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort)
    }

    pub fn is_aput(self) -> bool {
        matches!(self, Aput | AputWide | AputObject | AputBoolean | AputByte | AputChar | AputShort)
    }

    pub fn is_iget(self) -> bool {
        matches!(self, Iget | IgetWide | IgetObject | IgetBoolean | IgetByte | IgetChar | IgetShort)
    }

    pub fn is_iput(self) -> bool {
        matches!(self, Iput | IputWide | IputObject | IputBoolean | IputByte | IputChar | IputShort)
    }

    pub fn is_sget(self) -> bool {
        matches!(self, Sget | SgetWide | SgetObject | SgetBoolean | SgetByte | SgetChar | SgetShort)
    }

    pub fn is_sput(self) -> bool {
        matches!(self, Sput | SputWide | SputObject | SputBoolean | SputByte | SputChar | SputShort)
    }

    pub fn is_field_op(self) -> bool {
        self.is_iget() || self.is_iput() || self.is_sget() || self.is_sput()
    }

    pub fn is_binop(self) -> bool {
        matches!(
            self,
            AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt | ShrInt | UshrInt
                | AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong | ShlLong | ShrLong
                | UshrLong | AddFloat | SubFloat | MulFloat | DivFloat | RemFloat | AddDouble | SubDouble | MulDouble
                | DivDouble | RemDouble
        )
    }

    pub fn is_binop_lit16(self) -> bool {
        matches!(
            self,
            AddIntLit16 | RsubInt | MulIntLit16 | DivIntLit16 | RemIntLit16 | AndIntLit16 | OrIntLit16 | XorIntLit16
        )
    }

    pub fn is_binop_lit8(self) -> bool {
        matches!(
            self,
            AddIntLit8
                | RsubIntLit8
                | MulIntLit8
                | DivIntLit8
                | RemIntLit8
                | AndIntLit8
                | OrIntLit8
                | XorIntLit8
                | ShlIntLit8
                | ShrIntLit8
                | UshrIntLit8
        )
    }

    pub fn is_binop_lit(self) -> bool {
        self.is_binop_lit16() || self.is_binop_lit8()
    }

    pub fn is_unop(self) -> bool {
        matches!(
            self,
            NegInt | NotInt | NegLong | NotLong | NegFloat | NegDouble | IntToLong | IntToFloat | IntToDouble
                | LongToInt | LongToFloat | LongToDouble | FloatToInt | FloatToLong | FloatToDouble | DoubleToInt
                | DoubleToLong | DoubleToFloat | IntToByte | IntToChar | IntToShort
        )
    }

    pub fn is_cmp(self) -> bool {
        matches!(self, CmplFloat | CmpgFloat | CmplDouble | CmpgDouble | CmpLong)
    }

    pub fn is_div_or_rem(self) -> bool {
        matches!(
            self,
            DivInt | RemInt | DivLong | RemLong | DivIntLit16 | RemIntLit16 | DivIntLit8 | RemIntLit8
        )
    }

    /// The op writes the hidden result register that a following `move-result-pseudo*`
    /// picks up.
    pub fn has_move_result_pseudo(self) -> bool {
        matches!(
            self,
            ConstString | ConstClass | CheckCast | InstanceOf | ArrayLength | NewInstance | NewArray
                | ConstMethodHandle | ConstMethodType
        ) || self.is_aget()
            || self.is_iget()
            || self.is_sget()
    }

    /// Source count of an op that writes through `move-result-pseudo*`. Such ops never name a
    /// destination.
    pub fn pseudo_result_srcs(self) -> Option<usize> {
        if !self.has_move_result_pseudo() {
            return None;
        }
        Some(match self {
            CheckCast | InstanceOf | ArrayLength | NewArray => 1,
            _ if self.is_iget() => 1,
            _ if self.is_aget() => 2,
            _ => 0,
        })
    }

    /// The op's result may be read with a real `move-result*`.
    pub fn has_move_result(self) -> bool {
        self.is_invoke() || self == FilledNewArray
    }

    pub fn can_throw(self) -> bool {
        matches!(
            self,
            ConstString
                | ConstClass
                | MonitorEnter
                | MonitorExit
                | CheckCast
                | InstanceOf
                | ArrayLength
                | NewInstance
                | NewArray
                | FilledNewArray
                | FillArrayData
                | Throw
                | ConstMethodHandle
                | ConstMethodType
        ) || self.is_aget()
            || self.is_aput()
            || self.is_field_op()
            || self.is_invoke()
            || self.is_div_or_rem()
    }

    /// The op writes a register named in its `dest` slot.
    pub fn has_dest(self) -> bool {
        !(self.has_move_result_pseudo()
            || self.has_move_result()
            || self.is_return()
            || self.is_branch()
            || self.is_aput()
            || self.is_iput()
            || self.is_sput()
            || matches!(self, Nop | MonitorEnter | MonitorExit | FillArrayData | Throw))
    }

    pub fn dest_is_wide(self) -> bool {
        matches!(
            self,
            MoveWide
                | MoveResultWide
                | ConstWide
                | NegLong
                | NotLong
                | NegDouble
                | IntToLong
                | IntToDouble
                | LongToDouble
                | FloatToLong
                | FloatToDouble
                | DoubleToLong
                | AddLong
                | SubLong
                | MulLong
                | DivLong
                | RemLong
                | AndLong
                | OrLong
                | XorLong
                | ShlLong
                | ShrLong
                | UshrLong
                | AddDouble
                | SubDouble
                | MulDouble
                | DivDouble
                | RemDouble
                | LoadParamWide
                | MoveResultPseudoWide
        )
    }

    pub fn dest_is_object(self) -> bool {
        matches!(self, MoveObject | MoveResultObject | MoveException | LoadParamObject | MoveResultPseudoObject)
    }

    /// Whether source `i` names a register pair. Invokes depend on the callee prototype and
    /// are answered by `IRInstruction::src_is_wide`.
    pub fn src_is_wide(self, i: usize) -> bool {
        match self {
            MoveWide | ReturnWide => i == 0,
            CmpLong | CmplDouble | CmpgDouble => i < 2,
            AputWide | IputWide | SputWide => i == 0,
            NegLong | NotLong | NegDouble | LongToInt | LongToFloat | LongToDouble | DoubleToInt | DoubleToLong
            | DoubleToFloat => i == 0,
            ShlLong | ShrLong | UshrLong => i == 0,
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong => i < 2,
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => i < 2,
            _ => false,
        }
    }

    /// `move-result-pseudo*` variant matching an op whose result lands in the hidden register.
    pub fn move_result_pseudo_for(self, wide: bool, object: bool) -> IROpcode {
        if wide {
            MoveResultPseudoWide
        } else if object {
            MoveResultPseudoObject
        } else {
            MoveResultPseudo
        }
    }

    /// `if-eq` <-> `if-ne`, etc.
    pub fn invert_conditional_branch(self) -> Option<IROpcode> {
        Some(match self {
            IfEq => IfNe,
            IfNe => IfEq,
            IfLt => IfGe,
            IfGe => IfLt,
            IfGt => IfLe,
            IfLe => IfGt,
            IfEqz => IfNez,
            IfNez => IfEqz,
            IfLtz => IfGez,
            IfGez => IfLtz,
            IfGtz => IfLez,
            IfLez => IfGtz,
            _ => return None,
        })
    }

    pub fn load_param_for(desc: &str) -> IROpcode {
        match desc.as_bytes().first() {
            Some(b'J') | Some(b'D') => LoadParamWide,
            Some(b'L') | Some(b'[') => LoadParamObject,
            _ => LoadParam,
        }
    }

    pub fn move_result_for(desc: &str) -> IROpcode {
        match desc.as_bytes().first() {
            Some(b'J') | Some(b'D') => MoveResultWide,
            Some(b'L') | Some(b'[') => MoveResultObject,
            _ => MoveResult,
        }
    }

    pub fn return_for(desc: &str) -> IROpcode {
        match desc.as_bytes().first() {
            Some(b'V') => ReturnVoid,
            Some(b'J') | Some(b'D') => ReturnWide,
            Some(b'L') | Some(b'[') => ReturnObject,
            _ => Return,
        }
    }
}

impl std::fmt::Display for IROpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for op in IROpcode::ALL {
            assert_eq!(IROpcode::from_name(op.name()), Some(*op));
        }
        assert_eq!(IROpcode::from_name("add-int/2addr"), None);
    }

    #[test]
    fn test_classification() {
        assert!(IROpcode::Sget.has_move_result_pseudo());
        assert!(!IROpcode::Sget.has_dest());
        assert!(IROpcode::Const.has_dest());
        assert!(IROpcode::InvokeStatic.has_move_result());
        assert!(IROpcode::DivIntLit8.can_throw());
        assert!(!IROpcode::AddIntLit8.can_throw());
        assert!(IROpcode::IfEqz.is_block_end());
        assert_eq!(IROpcode::IfLt.invert_conditional_branch(), Some(IROpcode::IfGe));
        assert!(IROpcode::ShlLong.src_is_wide(0) && !IROpcode::ShlLong.src_is_wide(1));
        assert_eq!(IROpcode::load_param_for("[I"), IROpcode::LoadParamObject);
    }
}
