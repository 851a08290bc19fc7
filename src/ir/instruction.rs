use std::sync::Arc;

use crate::ir::interner::{CallSiteId, FieldId, Interner, MethodHandleId, MethodId, ProtoId, StringId, TypeId};
use crate::ir::assembler;
use crate::ir::opcode::{IROpcode, OperandKind};
use crate::ir::types;

pub type Reg = u32;

/// Stands for the hidden result register in analyses that model it as a variable.
pub const RESULT_REGISTER: Reg = u32::MAX - 1;

/// Payload of a `fill-array-data`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayData {
    pub element_width: u16,
    pub element_count: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    None,
    Literal(i64),
    String(StringId),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    MethodAndProto(MethodId, ProtoId),
    Proto(ProtoId),
    CallSite(CallSiteId),
    MethodHandle(MethodHandleId),
    Data(Arc<ArrayData>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IRInstruction {
    opcode: IROpcode,
    dest: Option<Reg>,
    srcs: Vec<Reg>,
    operand: Operand,
}

impl IRInstruction {
    pub fn new(opcode: IROpcode) -> Self {
        IRInstruction { opcode, dest: None, srcs: Vec::new(), operand: Operand::None }
    }

    pub fn opcode(&self) -> IROpcode {
        self.opcode
    }

    /// Changes the opcode in place; the caller keeps operands consistent.
    pub fn set_opcode(&mut self, opcode: IROpcode) -> &mut Self {
        self.opcode = opcode;
        self
    }

    pub fn with_dest(mut self, reg: Reg) -> Self {
        self.dest = Some(reg);
        self
    }

    pub fn with_srcs(mut self, srcs: Vec<Reg>) -> Self {
        self.srcs = srcs;
        self
    }

    pub fn with_literal(mut self, lit: i64) -> Self {
        self.operand = Operand::Literal(lit);
        self
    }

    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operand = operand;
        self
    }

    pub fn with_string(self, s: StringId) -> Self {
        self.with_operand(Operand::String(s))
    }

    pub fn with_type(self, t: TypeId) -> Self {
        self.with_operand(Operand::Type(t))
    }

    pub fn with_field(self, f: FieldId) -> Self {
        self.with_operand(Operand::Field(f))
    }

    pub fn with_method(self, m: MethodId) -> Self {
        self.with_operand(Operand::Method(m))
    }

    pub fn has_dest(&self) -> bool {
        self.dest.is_some()
    }

    pub fn dest(&self) -> Option<Reg> {
        self.dest
    }

    pub fn set_dest(&mut self, reg: Reg) {
        self.dest = Some(reg);
    }

    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    pub fn src(&self, i: usize) -> Reg {
        self.srcs[i]
    }

    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    pub fn set_src(&mut self, i: usize, reg: Reg) {
        self.srcs[i] = reg;
    }

    pub fn set_srcs(&mut self, srcs: Vec<Reg>) {
        self.srcs = srcs;
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    pub fn set_operand(&mut self, operand: Operand) {
        self.operand = operand;
    }

    pub fn literal(&self) -> Option<i64> {
        match self.operand {
            Operand::Literal(v) => Some(v),
            _ => None,
        }
    }

    pub fn set_literal(&mut self, lit: i64) {
        self.operand = Operand::Literal(lit);
    }

    pub fn string(&self) -> Option<StringId> {
        match self.operand {
            Operand::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_ref(&self) -> Option<TypeId> {
        match self.operand {
            Operand::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<FieldId> {
        match self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<MethodId> {
        match self.operand {
            Operand::Method(m) | Operand::MethodAndProto(m, _) => Some(m),
            _ => None,
        }
    }

    pub fn set_method(&mut self, m: MethodId) {
        self.operand = match self.operand {
            Operand::MethodAndProto(_, p) => Operand::MethodAndProto(m, p),
            _ => Operand::Method(m),
        };
    }

    pub fn proto(&self) -> Option<ProtoId> {
        match self.operand {
            Operand::Proto(p) | Operand::MethodAndProto(_, p) => Some(p),
            _ => None,
        }
    }

    pub fn call_site(&self) -> Option<CallSiteId> {
        match self.operand {
            Operand::CallSite(c) => Some(c),
            _ => None,
        }
    }

    pub fn method_handle(&self) -> Option<MethodHandleId> {
        match self.operand {
            Operand::MethodHandle(h) => Some(h),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Arc<ArrayData>> {
        match &self.operand {
            Operand::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn dest_is_wide(&self) -> bool {
        self.opcode.dest_is_wide()
    }

    /// Argument types of an invoke in source order, `this` included for instance calls.
    pub fn invoke_arg_types(&self, g: &Interner) -> Vec<TypeId> {
        let proto = match (self.opcode, &self.operand) {
            (IROpcode::InvokeCustom, Operand::CallSite(cs)) => g.call_site(*cs).proto,
            (IROpcode::InvokePolymorphic, Operand::MethodAndProto(_, p)) => *p,
            (_, Operand::Method(m)) => g.method(*m).proto,
            _ => return Vec::new(),
        };
        let mut args = Vec::new();
        if matches!(
            self.opcode,
            IROpcode::InvokeVirtual
                | IROpcode::InvokeSuper
                | IROpcode::InvokeDirect
                | IROpcode::InvokeInterface
                | IROpcode::InvokePolymorphic
        ) {
            if let Some(m) = self.method() {
                args.push(g.method(m).class);
            }
        }
        args.extend(g.proto(proto).args.iter().copied());
        args
    }

    pub fn src_is_wide(&self, i: usize, g: &Interner) -> bool {
        if self.opcode.is_invoke() {
            return self
                .invoke_arg_types(g)
                .get(i)
                .map_or(false, |t| types::is_wide(&g.descriptor(*t)));
        }
        self.opcode.src_is_wide(i)
    }

    /// Number of 16-bit register slots the sources take when encoded.
    pub fn src_words(&self, g: &Interner) -> usize {
        (0..self.srcs.len()).map(|i| if self.src_is_wide(i, g) { 2 } else { 1 }).sum()
    }

    pub fn show(&self, g: &Interner) -> String {
        let mut out = format!("({}", self.opcode.name());
        if let Some(d) = self.dest {
            out.push_str(&format!(" v{}", d));
        }
        if self.opcode.is_invoke() || self.opcode == IROpcode::FilledNewArray {
            let regs: Vec<String> = self.srcs.iter().map(|r| format!("v{}", r)).collect();
            out.push_str(&format!(" ({})", regs.join(" ")));
        } else {
            for r in &self.srcs {
                out.push_str(&format!(" v{}", r));
            }
        }
        match &self.operand {
            Operand::None => {}
            Operand::Literal(v) => out.push_str(&format!(" {}", v)),
            Operand::String(s) => out.push_str(&format!(" {:?}", &*g.string(*s))),
            Operand::Type(t) => out.push_str(&format!(" \"{}\"", g.descriptor(*t))),
            Operand::Field(f) => out.push_str(&format!(" \"{}\"", g.show_field(*f))),
            Operand::Method(m) => out.push_str(&format!(" \"{}\"", g.show_method(*m))),
            Operand::MethodAndProto(m, p) => {
                out.push_str(&format!(" \"{}\" \"{}\"", g.show_method(*m), g.show_proto(*p)))
            }
            Operand::Proto(p) => out.push_str(&format!(" \"{}\"", g.show_proto(*p))),
            Operand::CallSite(c) => out.push_str(&format!(" {}", assembler::show_call_site(g, *c))),
            Operand::MethodHandle(h) => out.push_str(&format!(" {}", assembler::show_method_handle(g, *h))),
            Operand::Data(d) => {
                out.push_str(&format!(" (data {} {}", d.element_width, d.element_count));
                for b in &d.data {
                    out.push_str(&format!(" {}", b));
                }
                out.push(')');
            }
        }
        out.push(')');
        out
    }

    /// Whether the operand kind matches what the opcode expects.
    pub fn operand_matches_opcode(&self) -> bool {
        matches!(
            (self.opcode.operand_kind(), &self.operand),
            (OperandKind::None, Operand::None)
                | (OperandKind::Literal, Operand::Literal(_))
                | (OperandKind::String, Operand::String(_))
                | (OperandKind::Type, Operand::Type(_))
                | (OperandKind::Field, Operand::Field(_))
                | (OperandKind::Method, Operand::Method(_))
                | (OperandKind::MethodAndProto, Operand::MethodAndProto(_, _))
                | (OperandKind::Proto, Operand::Proto(_))
                | (OperandKind::CallSite, Operand::CallSite(_))
                | (OperandKind::MethodHandle, Operand::MethodHandle(_))
                | (OperandKind::Data, Operand::Data(_))
        )
    }
}

/// Shorthand constructors used by creators and transforms.
pub fn const_insn(dest: Reg, lit: i64) -> IRInstruction {
    IRInstruction::new(IROpcode::Const).with_dest(dest).with_literal(lit)
}

pub fn const_wide_insn(dest: Reg, lit: i64) -> IRInstruction {
    IRInstruction::new(IROpcode::ConstWide).with_dest(dest).with_literal(lit)
}

pub fn move_insn(op: IROpcode, dest: Reg, src: Reg) -> IRInstruction {
    IRInstruction::new(op).with_dest(dest).with_srcs(vec![src])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_wide_args() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.bar:(JI)V").unwrap();
        let insn = IRInstruction::new(IROpcode::InvokeVirtual).with_srcs(vec![0, 1, 3]).with_method(m);
        assert!(!insn.src_is_wide(0, &g));
        assert!(insn.src_is_wide(1, &g));
        assert!(!insn.src_is_wide(2, &g));
        assert_eq!(insn.src_words(&g), 4);
        assert_eq!(insn.show(&g), "(invoke-virtual (v0 v1 v3) \"LFoo;.bar:(JI)V\")");
    }

    #[test]
    fn test_operand_accessors() {
        let insn = const_insn(1, 42);
        assert_eq!(insn.literal(), Some(42));
        assert!(insn.operand_matches_opcode());
        assert!(IRInstruction::new(IROpcode::ConstString).operand().eq(&Operand::None));
        assert!(!IRInstruction::new(IROpcode::ConstString).operand_matches_opcode());
    }
}
