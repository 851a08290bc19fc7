//! Builders for synthesizing method bodies.
//!
//! A `MethodCreator` owns the code under construction. Emission happens through
//! `MethodBlock` handles, each with its own insertion point, so nested control flow can be
//! written in source order while branch targets stay symbolic.

use std::collections::BTreeMap;

use crate::error::{DexError, Result};
use crate::ir::class::{AccessFlags, DexMethod};
use crate::ir::code::{BranchTarget, BranchTargetKind, IRCode, ItemId, MethodItemEntry};
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::interner::{FieldId, Interner, MethodId, TypeId};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

/// A typed register. Wide types own `reg` and `reg + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    ty: TypeId,
    reg: Reg,
    wide: bool,
}

impl Location {
    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn is_wide(&self) -> bool {
        self.wide
    }
}

/// Handle to an insertion point of a `MethodCreator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodBlock(usize);

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Front,
    After(ItemId),
}

pub struct MethodCreator<'g> {
    g: &'g Interner,
    method: MethodId,
    access: AccessFlags,
    code: IRCode,
    params: Vec<Location>,
    cursors: Vec<Cursor>,
}

impl<'g> MethodCreator<'g> {
    /// Starts a body for `method`; parameters (and `this` unless static) get the first
    /// registers and their `load-param*` instructions.
    pub fn new(g: &'g Interner, method: MethodId, access: AccessFlags) -> Self {
        let mut mc = MethodCreator {
            g,
            method,
            access,
            code: IRCode::new(0),
            params: Vec::new(),
            cursors: vec![Cursor::Front],
        };
        let m = g.method(method);
        let mut param_types = Vec::new();
        if !access.contains(AccessFlags::STATIC) {
            param_types.push(m.class);
        }
        param_types.extend(g.proto(m.proto).args.iter().copied());
        let main = mc.main_block();
        for ty in param_types {
            let loc = mc.make_local(ty);
            let op = IROpcode::load_param_for(&g.descriptor(ty));
            mc.emit(main, IRInstruction::new(op).with_dest(loc.reg));
            mc.params.push(loc);
        }
        mc
    }

    pub fn main_block(&self) -> MethodBlock {
        MethodBlock(0)
    }

    /// Parameter `i`; for instance methods `0` is `this`.
    pub fn get_local(&self, i: usize) -> Result<Location> {
        self.params
            .get(i)
            .copied()
            .ok_or_else(|| DexError::new(format!("no parameter {} in {}", i, self.g.show_method(self.method))))
    }

    pub fn make_local(&mut self, ty: TypeId) -> Location {
        let wide = types::is_wide(&self.g.descriptor(ty));
        let reg = if wide { self.code.allocate_wide_temp() } else { self.code.allocate_temp() };
        Location { ty, reg, wide }
    }

    fn new_block(&mut self, cursor: Cursor) -> MethodBlock {
        self.cursors.push(cursor);
        MethodBlock(self.cursors.len() - 1)
    }

    fn insert(&mut self, block: MethodBlock, entry: MethodItemEntry) -> ItemId {
        let id = match self.cursors[block.0] {
            Cursor::Front => self.code.push_front(entry),
            Cursor::After(pos) => self.code.insert_after(pos, entry),
        };
        self.cursors[block.0] = Cursor::After(id);
        id
    }

    fn emit(&mut self, block: MethodBlock, insn: IRInstruction) -> ItemId {
        self.insert(block, MethodItemEntry::Opcode(insn))
    }

    /// Emits an op that writes the hidden result register, then moves it to `dest`.
    fn emit_with_result(&mut self, block: MethodBlock, insn: IRInstruction, dest: Location) {
        let object = types::is_object(&self.g.descriptor(dest.ty));
        let pseudo = insn.opcode().move_result_pseudo_for(dest.wide, object);
        self.emit(block, insn);
        self.emit(block, IRInstruction::new(pseudo).with_dest(dest.reg));
    }

    // Constants and moves

    pub fn load_const(&mut self, block: MethodBlock, dest: Location, value: i64) {
        let op = if dest.wide { IROpcode::ConstWide } else { IROpcode::Const };
        self.emit(block, IRInstruction::new(op).with_dest(dest.reg).with_literal(value));
    }

    pub fn load_null(&mut self, block: MethodBlock, dest: Location) {
        self.load_const(block, dest, 0);
    }

    pub fn load_const_string(&mut self, block: MethodBlock, dest: Location, s: &str) {
        let insn = IRInstruction::new(IROpcode::ConstString).with_string(self.g.make_string(s));
        self.emit_with_result(block, insn, dest);
    }

    pub fn load_const_class(&mut self, block: MethodBlock, dest: Location, ty: TypeId) {
        self.emit_with_result(block, IRInstruction::new(IROpcode::ConstClass).with_type(ty), dest);
    }

    pub fn move_value(&mut self, block: MethodBlock, src: Location, dest: Location) {
        let desc = self.g.descriptor(dest.ty);
        let op = if dest.wide {
            IROpcode::MoveWide
        } else if types::is_object(&desc) {
            IROpcode::MoveObject
        } else {
            IROpcode::Move
        };
        self.emit(block, IRInstruction::new(op).with_dest(dest.reg).with_srcs(vec![src.reg]));
    }

    pub fn move_result(&mut self, block: MethodBlock, dest: Location) {
        let op = IROpcode::move_result_for(&self.g.descriptor(dest.ty));
        self.emit(block, IRInstruction::new(op).with_dest(dest.reg));
    }

    // Objects and fields

    pub fn new_instance(&mut self, block: MethodBlock, ty: TypeId, dest: Location) {
        self.emit_with_result(block, IRInstruction::new(IROpcode::NewInstance).with_type(ty), dest);
    }

    pub fn new_array(&mut self, block: MethodBlock, array_ty: TypeId, size: Location, dest: Location) {
        let insn = IRInstruction::new(IROpcode::NewArray).with_srcs(vec![size.reg]).with_type(array_ty);
        self.emit_with_result(block, insn, dest);
    }

    pub fn check_cast(&mut self, block: MethodBlock, src: Location, ty: TypeId, dest: Location) {
        let insn = IRInstruction::new(IROpcode::CheckCast).with_srcs(vec![src.reg]).with_type(ty);
        self.emit_with_result(block, insn, dest);
    }

    pub fn instance_of(&mut self, block: MethodBlock, src: Location, ty: TypeId, dest: Location) {
        let insn = IRInstruction::new(IROpcode::InstanceOf).with_srcs(vec![src.reg]).with_type(ty);
        self.emit_with_result(block, insn, dest);
    }

    fn field_op(&self, field: FieldId, base: IROpcode) -> IROpcode {
        let desc = self.g.descriptor(self.g.field(field).ty);
        let offset = match desc.as_bytes().first() {
            Some(b'J') | Some(b'D') => 1,
            Some(b'L') | Some(b'[') => 2,
            Some(b'Z') => 3,
            Some(b'B') => 4,
            Some(b'C') => 5,
            Some(b'S') => 6,
            _ => 0,
        };
        let base_ix = IROpcode::ALL.iter().position(|o| *o == base).unwrap_or(0);
        IROpcode::ALL.get(base_ix + offset).copied().unwrap_or(base)
    }

    pub fn iget(&mut self, block: MethodBlock, field: FieldId, obj: Location, dest: Location) {
        let op = self.field_op(field, IROpcode::Iget);
        let insn = IRInstruction::new(op).with_srcs(vec![obj.reg]).with_field(field);
        self.emit_with_result(block, insn, dest);
    }

    pub fn iput(&mut self, block: MethodBlock, field: FieldId, obj: Location, src: Location) {
        let op = self.field_op(field, IROpcode::Iput);
        self.emit(block, IRInstruction::new(op).with_srcs(vec![src.reg, obj.reg]).with_field(field));
    }

    pub fn sget(&mut self, block: MethodBlock, field: FieldId, dest: Location) {
        let op = self.field_op(field, IROpcode::Sget);
        self.emit_with_result(block, IRInstruction::new(op).with_field(field), dest);
    }

    pub fn sput(&mut self, block: MethodBlock, field: FieldId, src: Location) {
        let op = self.field_op(field, IROpcode::Sput);
        self.emit(block, IRInstruction::new(op).with_srcs(vec![src.reg]).with_field(field));
    }

    // Calls and exits

    pub fn invoke(&mut self, block: MethodBlock, op: IROpcode, method: MethodId, args: &[Location]) {
        let insn = IRInstruction::new(op).with_srcs(args.iter().map(|a| a.reg).collect()).with_method(method);
        self.emit(block, insn);
    }

    pub fn binop(&mut self, block: MethodBlock, op: IROpcode, dest: Location, a: Location, b: Location) {
        self.emit(block, IRInstruction::new(op).with_dest(dest.reg).with_srcs(vec![a.reg, b.reg]));
    }

    pub fn binop_lit(&mut self, block: MethodBlock, op: IROpcode, dest: Location, src: Location, lit: i64) {
        let insn = IRInstruction::new(op).with_dest(dest.reg).with_srcs(vec![src.reg]).with_literal(lit);
        self.emit(block, insn);
    }

    pub fn ret(&mut self, block: MethodBlock, value: Location) {
        let op = IROpcode::return_for(&self.g.descriptor(value.ty));
        self.emit(block, IRInstruction::new(op).with_srcs(vec![value.reg]));
    }

    pub fn ret_void(&mut self, block: MethodBlock) {
        self.emit(block, IRInstruction::new(IROpcode::ReturnVoid));
    }

    pub fn throw(&mut self, block: MethodBlock, ex: Location) {
        self.emit(block, IRInstruction::new(IROpcode::Throw).with_srcs(vec![ex.reg]));
    }

    pub fn push_instruction(&mut self, block: MethodBlock, insn: IRInstruction) {
        self.emit(block, insn);
    }

    // Control flow

    fn branch(op: IROpcode, srcs: &[Location]) -> IRInstruction {
        IRInstruction::new(op).with_srcs(srcs.iter().map(|l| l.reg).collect())
    }

    /// Emits `op` on `srcs`. `block` continues on the taken path, placed at the end of the
    /// method; the returned block is the fallthrough.
    pub fn if_test(&mut self, block: MethodBlock, op: IROpcode, srcs: &[Location]) -> MethodBlock {
        let br = self.emit(block, Self::branch(op, srcs));
        let fallthrough = self.new_block(Cursor::After(br));
        let target = self.code.push_back(MethodItemEntry::Target(BranchTarget { src: br, kind: BranchTargetKind::Simple }));
        self.cursors[block.0] = Cursor::After(target);
        fallthrough
    }

    /// Emits `op` on `srcs` and returns `(taken, fallthrough)` blocks. Both rejoin `block`,
    /// which continues after them.
    pub fn if_else_test(&mut self, block: MethodBlock, op: IROpcode, srcs: &[Location]) -> (MethodBlock, MethodBlock) {
        let br = self.emit(block, Self::branch(op, srcs));
        let goto_join = self.emit(block, IRInstruction::new(IROpcode::Goto));
        let join = self.insert(block, MethodItemEntry::Target(BranchTarget { src: goto_join, kind: BranchTargetKind::Simple }));
        let fallthrough = self.new_block(Cursor::After(br));

        let taken_target = self.code.push_back(MethodItemEntry::Target(BranchTarget { src: br, kind: BranchTargetKind::Simple }));
        let back = self.code.push_back(MethodItemEntry::Opcode(IRInstruction::new(IROpcode::Goto)));
        let taken = self.new_block(Cursor::After(taken_target));
        let back_target = self
            .code
            .insert_after(join, MethodItemEntry::Target(BranchTarget { src: back, kind: BranchTargetKind::Simple }));
        self.cursors[block.0] = Cursor::After(back_target);
        (taken, fallthrough)
    }

    /// Emits a switch on `src`. One block per key is added to `cases`; each rejoins `block`
    /// like the returned default block does.
    pub fn switch_op(
        &mut self,
        block: MethodBlock,
        src: Location,
        keys: &[i32],
        cases: &mut BTreeMap<i32, MethodBlock>,
    ) -> MethodBlock {
        let sw = self.emit(block, IRInstruction::new(IROpcode::Switch).with_srcs(vec![src.reg]));
        let goto_join = self.emit(block, IRInstruction::new(IROpcode::Goto));
        let mut join = self.insert(block, MethodItemEntry::Target(BranchTarget { src: goto_join, kind: BranchTargetKind::Simple }));
        let default = self.new_block(Cursor::After(sw));
        for key in keys {
            if cases.contains_key(key) {
                continue;
            }
            let target = self.code.push_back(MethodItemEntry::Target(BranchTarget { src: sw, kind: BranchTargetKind::Case(*key) }));
            let back = self.code.push_back(MethodItemEntry::Opcode(IRInstruction::new(IROpcode::Goto)));
            let case = self.new_block(Cursor::After(target));
            cases.insert(*key, case);
            join = self
                .code
                .insert_after(join, MethodItemEntry::Target(BranchTarget { src: back, kind: BranchTargetKind::Simple }));
        }
        self.cursors[block.0] = Cursor::After(join);
        default
    }

    pub fn code(&self) -> &IRCode {
        &self.code
    }

    pub fn into_code(self) -> IRCode {
        self.code
    }

    /// Finishes the method definition.
    pub fn create(self) -> DexMethod {
        DexMethod::new(self.method, self.access).with_code(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::{parse_code, print_code};

    #[test]
    fn test_params_and_locals() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.f:(JI)V").unwrap();
        let mut mc = MethodCreator::new(&g, m, AccessFlags::PUBLIC);
        assert_eq!(mc.get_local(0).unwrap().reg(), 0);
        assert!(mc.get_local(1).unwrap().is_wide());
        assert_eq!(mc.get_local(2).unwrap().reg(), 3);
        assert!(mc.get_local(3).is_err());
        let d = mc.make_local(g.make_type("D"));
        assert_eq!(d.reg(), 4);
        let main = mc.main_block();
        mc.ret_void(main);
        assert_eq!(mc.code().registers_size(), 6);
        let ops: Vec<IROpcode> = mc.code().instructions().map(|(_, i)| i.opcode()).collect();
        assert_eq!(
            ops,
            vec![IROpcode::LoadParamObject, IROpcode::LoadParamWide, IROpcode::LoadParam, IROpcode::ReturnVoid]
        );
    }

    #[test]
    fn test_if_else_rejoins() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.f:(I)I").unwrap();
        let mut mc = MethodCreator::new(&g, m, AccessFlags::STATIC);
        let x = mc.get_local(0).unwrap();
        let main = mc.main_block();
        let (taken, fallthrough) = mc.if_else_test(main, IROpcode::IfEqz, &[x]);
        mc.load_const(taken, x, 1);
        mc.load_const(fallthrough, x, 2);
        mc.ret(main, x);
        let expected = parse_code(
            &g,
            "((load-param v0) (if-eqz v0 :t) (const v0 2) (goto :join) (:join) (return v0)
              (:t) (const v0 1) (goto :join))",
        )
        .unwrap();
        assert_eq!(print_code(mc.code(), &g), print_code(&expected, &g));
    }

    #[test]
    fn test_switch_cases() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.f:(I)V").unwrap();
        let mut mc = MethodCreator::new(&g, m, AccessFlags::STATIC);
        let x = mc.get_local(0).unwrap();
        let main = mc.main_block();
        let mut cases = BTreeMap::new();
        let default = mc.switch_op(main, x, &[1, 3], &mut cases);
        assert_eq!(cases.len(), 2);
        mc.load_const(default, x, 0);
        mc.load_const(cases[&3], x, 30);
        mc.ret_void(main);
        let printed = print_code(mc.code(), &g);
        assert!(printed.contains("(switch v0 ("));
        assert!(printed.contains("(const v0 30)"));
        let reparsed = parse_code(&g, &printed).unwrap();
        assert_eq!(print_code(&reparsed, &g), printed);
    }

    #[test]
    fn test_field_ops_pick_width() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.f:()V").unwrap();
        let mut mc = MethodCreator::new(&g, m, AccessFlags::STATIC);
        let f = g.make_field_from_str("LFoo;.x:J").unwrap();
        let o = g.make_field_from_str("LFoo;.o:Ljava/lang/String;").unwrap();
        let wide = mc.make_local(g.make_type("J"));
        let s = mc.make_local(g.make_type("Ljava/lang/String;"));
        let main = mc.main_block();
        mc.sget(main, f, wide);
        mc.sget(main, o, s);
        mc.sput(main, f, wide);
        let ops: Vec<IROpcode> = mc.code().instructions().map(|(_, i)| i.opcode()).collect();
        assert_eq!(
            ops,
            vec![
                IROpcode::SgetWide,
                IROpcode::MoveResultPseudoWide,
                IROpcode::SgetObject,
                IROpcode::MoveResultPseudoObject,
                IROpcode::SputWide
            ]
        );
    }
}
