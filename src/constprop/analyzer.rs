//! Intraprocedural constant propagation.
//!
//! A register holds either a signed constant (sign interval plus exact value) or one known
//! non-null object: an interned string, a class literal, or a boxed integer whose `intValue`
//! is known. Unknown objects are top. Conditional branches refine the state flowing along
//! each successor edge, and an edge whose refined state is bottom is infeasible.

use std::collections::HashMap;
use std::fmt;

use crate::cfg::graph::{ControlFlowGraph, Edge, EdgeType, InsnRef};
use crate::config::ConstPropConfig;
use crate::domains::constant::ConstantDomain;
use crate::domains::disjoint_union::DisjointUnion;
use crate::domains::environment::Environment;
use crate::domains::sign::Sign;
use crate::domains::signed_constant::SignedConstantDomain;
use crate::domains::AbstractDomain;
use crate::fixpoint::iterator::{FixpointAnalyzer, FixpointIterator};
use crate::ir::instruction::{IRInstruction, Reg, RESULT_REGISTER};
use crate::ir::interner::{FieldId, Interner, StringId, TypeId};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

/// A non-null object whose identity or immutable contents are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectValue {
    String(StringId),
    Class(TypeId),
    /// `java.lang.Integer` with a known `intValue()`.
    BoxedInt(i64),
}

#[derive(Clone, PartialEq)]
pub struct ConstantValue(DisjointUnion<SignedConstantDomain, ConstantDomain<ObjectValue>>);

impl ConstantValue {
    pub fn from_constant(v: i64) -> Self {
        Self::signed(SignedConstantDomain::from_constant(v))
    }

    pub fn from_sign(s: Sign) -> Self {
        Self::signed(SignedConstantDomain::from_sign(s))
    }

    pub fn nez() -> Self {
        Self::from_sign(Sign::Nez)
    }

    pub fn signed(s: SignedConstantDomain) -> Self {
        ConstantValue(DisjointUnion::left(s))
    }

    pub fn object(o: ObjectValue) -> Self {
        ConstantValue(DisjointUnion::right(ConstantDomain::value(o)))
    }

    pub fn get_constant(&self) -> Option<i64> {
        self.0.get_left().and_then(|s| s.get_constant())
    }

    pub fn get_object(&self) -> Option<ObjectValue> {
        self.0.get_right().and_then(|o| o.get_constant().copied())
    }

    /// The value as a signed constant; a known object is a non-zero reference.
    pub fn as_signed(&self) -> SignedConstantDomain {
        match &self.0 {
            DisjointUnion::Bottom => SignedConstantDomain::bottom(),
            DisjointUnion::Left(s) => s.clone(),
            DisjointUnion::Right(_) => SignedConstantDomain::nez(),
            DisjointUnion::Top => SignedConstantDomain::top(),
        }
    }

    pub fn interval(&self) -> Sign {
        self.as_signed().interval()
    }
}

impl fmt::Debug for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            DisjointUnion::Bottom => f.write_str("_|_"),
            DisjointUnion::Top => f.write_str("T"),
            DisjointUnion::Left(s) => write!(f, "{:?}", s),
            DisjointUnion::Right(o) => write!(f, "{:?}", o),
        }
    }
}

impl AbstractDomain for ConstantValue {
    fn bottom() -> Self {
        ConstantValue(DisjointUnion::Bottom)
    }

    fn top() -> Self {
        ConstantValue(DisjointUnion::Top)
    }

    fn is_bottom(&self) -> bool {
        self.0.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.0.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (DisjointUnion::Right(_), DisjointUnion::Left(s)) => Sign::Nez.leq(s.interval()) && s.get_constant().is_none(),
            (a, b) => a.leq(b),
        }
    }

    fn join_with(&mut self, other: &Self) {
        let next = match (&self.0, &other.0) {
            (DisjointUnion::Right(a), DisjointUnion::Right(b)) if a != b => Self::nez(),
            (DisjointUnion::Right(_), DisjointUnion::Left(s)) | (DisjointUnion::Left(s), DisjointUnion::Right(_)) => {
                Self::signed(s.join(&SignedConstantDomain::nez()))
            }
            _ => {
                self.0.join_with(&other.0);
                return;
            }
        };
        *self = next;
    }

    fn meet_with(&mut self, other: &Self) {
        let next = match (&self.0, &other.0) {
            (DisjointUnion::Right(o), DisjointUnion::Left(s)) | (DisjointUnion::Left(s), DisjointUnion::Right(o)) => {
                if Sign::Nez.leq(s.interval()) && s.get_constant().is_none() {
                    ConstantValue(DisjointUnion::Right(o.clone()))
                } else {
                    Self::bottom()
                }
            }
            _ => {
                self.0.meet_with(&other.0);
                return;
            }
        };
        *self = next;
    }
}

pub type ConstantEnvironment = Environment<Reg, ConstantValue>;
/// Values of static fields, as seen by every method.
pub type FieldEnvironment = Environment<FieldId, ConstantValue>;
/// Parameter index (counting `this`) to value.
pub type ArgumentDomain = Environment<u32, ConstantValue>;

pub struct ConstantPropagationAnalyzer<'a> {
    g: &'a Interner,
    config: ConstPropConfig,
    fields: Option<&'a FieldEnvironment>,
    args: ArgumentDomain,
    params: HashMap<InsnRef, u32>,
}

impl<'a> ConstantPropagationAnalyzer<'a> {
    pub fn new(g: &'a Interner, cfg: &ControlFlowGraph, config: ConstPropConfig) -> Self {
        let mut params = HashMap::new();
        if let Some(entry) = cfg.block(cfg.entry_block()) {
            for (index, insn) in entry.instructions() {
                if !insn.opcode().is_load_param() {
                    break;
                }
                let n = params.len() as u32;
                params.insert(InsnRef { block: cfg.entry_block(), index }, n);
            }
        }
        ConstantPropagationAnalyzer { g, config, fields: None, args: ArgumentDomain::top(), params }
    }

    pub fn with_fields(mut self, fields: &'a FieldEnvironment) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Values the parameters are known to take on entry.
    pub fn with_args(mut self, args: ArgumentDomain) -> Self {
        self.args = args;
        self
    }

    pub fn config(&self) -> &ConstPropConfig {
        &self.config
    }

    /// Runs to a fixpoint. The initial state is bottom when the arguments are.
    pub fn run<'c>(self, cfg: &'c ControlFlowGraph) -> FixpointIterator<'c, Self> {
        let initial = if self.args.is_bottom() { ConstantEnvironment::bottom() } else { ConstantEnvironment::top() };
        let mut it = FixpointIterator::new(cfg, self);
        it.run(initial);
        it
    }

    fn set_dest(&self, insn: &IRInstruction, state: &mut ConstantEnvironment, value: ConstantValue) {
        let op = insn.opcode();
        if let Some(d) = insn.dest() {
            state.set(d, value);
            if op.dest_is_wide() {
                state.set(d + 1, ConstantValue::top());
            }
        }
    }

    fn analyze_invoke(&self, insn: &IRInstruction, state: &mut ConstantEnvironment) {
        let g = self.g;
        let mut result = ConstantValue::top();
        if let Some(m) = insn.method() {
            let data = g.method(m);
            if &*g.descriptor(data.class) == types::JAVA_LANG_INTEGER {
                let name = g.string(data.name);
                let shown = g.show_proto(data.proto);
                match (&*name, shown.as_str()) {
                    ("valueOf", "(I)Ljava/lang/Integer;") => {
                        if let Some(v) = state.get(insn.src(0)).get_constant() {
                            result = ConstantValue::object(ObjectValue::BoxedInt(v));
                        }
                    }
                    ("intValue", "()I") => {
                        if let Some(ObjectValue::BoxedInt(v)) = state.get(insn.src(0)).get_object() {
                            result = ConstantValue::from_constant(v);
                        }
                    }
                    _ => {}
                }
            }
        }
        state.set(RESULT_REGISTER, result);
    }
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// Folds an int op in 64-bit arithmetic; a result outside the int range is not folded.
fn fold_int(op: IROpcode, a: i64, b: i64) -> Option<i64> {
    use IROpcode::*;
    let (a32, b32) = (a as i32, b as i32);
    let v = match op {
        AddInt | AddIntLit16 | AddIntLit8 => a.checked_add(b)?,
        SubInt => a.checked_sub(b)?,
        RsubInt | RsubIntLit8 => b.checked_sub(a)?,
        MulInt | MulIntLit16 | MulIntLit8 => a.checked_mul(b)?,
        DivInt | DivIntLit16 | DivIntLit8 => a32.checked_div(b32)? as i64,
        RemInt | RemIntLit16 | RemIntLit8 => a32.checked_rem(b32)? as i64,
        AndInt | AndIntLit16 | AndIntLit8 => (a32 & b32) as i64,
        OrInt | OrIntLit16 | OrIntLit8 => (a32 | b32) as i64,
        XorInt | XorIntLit16 | XorIntLit8 => (a32 ^ b32) as i64,
        ShlInt | ShlIntLit8 => a32.wrapping_shl((b32 & 0x1f) as u32) as i64,
        ShrInt | ShrIntLit8 => (a32 >> (b32 & 0x1f)) as i64,
        UshrInt | UshrIntLit8 => ((a32 as u32) >> (b32 & 0x1f)) as i64,
        _ => return None,
    };
    fits_i32(v).then_some(v)
}

fn fold_long(op: IROpcode, a: i64, b: i64) -> Option<i64> {
    use IROpcode::*;
    Some(match op {
        AddLong => a.checked_add(b)?,
        SubLong => a.checked_sub(b)?,
        MulLong => a.checked_mul(b)?,
        DivLong => a.checked_div(b)?,
        RemLong => a.checked_rem(b)?,
        AndLong => a & b,
        OrLong => a | b,
        XorLong => a ^ b,
        ShlLong => a.wrapping_shl((b & 0x3f) as u32),
        ShrLong => a >> (b & 0x3f),
        UshrLong => ((a as u64) >> (b & 0x3f)) as i64,
        _ => return None,
    })
}

fn fold_unop(op: IROpcode, a: i64) -> Option<i64> {
    use IROpcode::*;
    let a32 = a as i32;
    Some(match op {
        NegInt => a32.checked_neg()? as i64,
        NotInt => !a32 as i64,
        NegLong => a.checked_neg()?,
        NotLong => !a,
        IntToLong => a32 as i64,
        LongToInt => a as i32 as i64,
        IntToByte => a32 as i8 as i64,
        IntToChar => a32 as u16 as i64,
        IntToShort => a32 as i16 as i64,
        _ => return None,
    })
}

/// -1, 0 or 1 as the compare ops produce; literals of float ops are raw bit patterns.
fn fold_cmp(op: IROpcode, a: i64, b: i64) -> Option<i64> {
    use std::cmp::Ordering;
    use IROpcode::*;
    let ord = match op {
        CmpLong => Some(a.cmp(&b)),
        CmplFloat | CmpgFloat => f32::from_bits(a as u32).partial_cmp(&f32::from_bits(b as u32)),
        CmplDouble | CmpgDouble => f64::from_bits(a as u64).partial_cmp(&f64::from_bits(b as u64)),
        _ => return None,
    };
    Some(match ord {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None if matches!(op, CmpgFloat | CmpgDouble) => 1,
        None => -1,
    })
}

impl<'a> FixpointAnalyzer for ConstantPropagationAnalyzer<'a> {
    type Domain = ConstantEnvironment;

    fn analyze_instruction(&self, at: InsnRef, insn: &IRInstruction, state: &mut ConstantEnvironment) {
        use IROpcode::*;

        let op = insn.opcode();
        match op {
            LoadParam | LoadParamWide | LoadParamObject => {
                let v = self.params.get(&at).map_or_else(ConstantValue::top, |ix| self.args.get(*ix));
                self.set_dest(insn, state, v);
            }
            Const | ConstWide => {
                let v = insn.literal().map_or_else(ConstantValue::top, ConstantValue::from_constant);
                self.set_dest(insn, state, v);
            }
            ConstString => {
                let v = insn.string().map_or_else(ConstantValue::top, |s| ConstantValue::object(ObjectValue::String(s)));
                state.set(RESULT_REGISTER, v);
            }
            ConstClass => {
                let v = insn.type_ref().map_or_else(ConstantValue::top, |t| ConstantValue::object(ObjectValue::Class(t)));
                state.set(RESULT_REGISTER, v);
            }
            Move | MoveWide | MoveObject => {
                let v = state.get(insn.src(0));
                self.set_dest(insn, state, v);
            }
            _ if op.is_move_result_any() => {
                let v = state.get(RESULT_REGISTER);
                self.set_dest(insn, state, v);
            }
            _ if op.is_sget() => {
                let v = match (self.fields, insn.field()) {
                    (Some(env), Some(f)) => env.get(f),
                    _ => ConstantValue::top(),
                };
                state.set(RESULT_REGISTER, v);
            }
            NewInstance | NewArray | FilledNewArray => state.set(RESULT_REGISTER, ConstantValue::nez()),
            ArrayLength => state.set(RESULT_REGISTER, ConstantValue::from_sign(Sign::Gez)),
            CheckCast => {
                let v = state.get(insn.src(0));
                state.set(RESULT_REGISTER, v);
            }
            _ if op.is_invoke() => self.analyze_invoke(insn, state),
            _ if op.is_binop_lit() => {
                let folded = match (state.get(insn.src(0)).get_constant(), insn.literal()) {
                    (Some(a), Some(b)) if self.config.fold_arithmetic => fold_int(op, a, b),
                    _ => None,
                };
                self.set_dest(insn, state, folded.map_or_else(ConstantValue::top, ConstantValue::from_constant));
            }
            _ if op.is_binop() || op.is_cmp() => {
                let folded = match (state.get(insn.src(0)).get_constant(), state.get(insn.src(1)).get_constant()) {
                    (Some(a), Some(b)) if self.config.fold_arithmetic => {
                        if op.is_cmp() {
                            fold_cmp(op, a, b)
                        } else if op.dest_is_wide() {
                            fold_long(op, a, b)
                        } else {
                            fold_int(op, a, b)
                        }
                    }
                    _ => None,
                };
                self.set_dest(insn, state, folded.map_or_else(ConstantValue::top, ConstantValue::from_constant));
            }
            _ if op.is_unop() => {
                let folded = match state.get(insn.src(0)).get_constant() {
                    Some(a) if self.config.fold_arithmetic => fold_unop(op, a),
                    _ => None,
                };
                self.set_dest(insn, state, folded.map_or_else(ConstantValue::top, ConstantValue::from_constant));
            }
            _ => {
                if op.has_move_result_pseudo() {
                    state.set(RESULT_REGISTER, ConstantValue::top());
                } else {
                    self.set_dest(insn, state, ConstantValue::top());
                }
            }
        }
    }

    fn analyze_edge(&self, cfg: &ControlFlowGraph, edge: &Edge, exit_state: &ConstantEnvironment) -> ConstantEnvironment {
        let mut state = exit_state.clone();
        if edge.kind == EdgeType::Throw || edge.kind == EdgeType::Ghost {
            return state;
        }
        let Some((_, insn)) = cfg.block(edge.src).and_then(|b| b.last_insn()) else {
            return state;
        };
        let op = insn.opcode();
        if op.is_switch() {
            refine_switch(cfg, edge, insn, &mut state);
        } else if op.is_conditional_branch() {
            refine_branch(insn, edge.kind == EdgeType::Branch, &mut state);
        }
        state
    }
}

fn meet_reg(state: &mut ConstantEnvironment, reg: Reg, with: ConstantValue) {
    let v = state.get(reg).meet(&with);
    state.set(reg, v);
}

/// Sign that the test `if-<op>z` being `taken` implies.
fn testz_sign(op: IROpcode, taken: bool) -> Sign {
    use IROpcode::*;
    let (yes, no) = match op {
        IfEqz => (Sign::Eqz, Sign::Nez),
        IfNez => (Sign::Nez, Sign::Eqz),
        IfLtz => (Sign::Ltz, Sign::Gez),
        IfGez => (Sign::Gez, Sign::Ltz),
        IfGtz => (Sign::Gtz, Sign::Lez),
        _ => (Sign::Lez, Sign::Gtz),
    };
    if taken {
        yes
    } else {
        no
    }
}

fn refine_branch(insn: &IRInstruction, taken: bool, state: &mut ConstantEnvironment) {
    use IROpcode::*;
    let op = insn.opcode();
    if op.is_testz_branch() {
        let sign = testz_sign(op, taken);
        let with = if sign == Sign::Eqz { ConstantValue::from_constant(0) } else { ConstantValue::from_sign(sign) };
        meet_reg(state, insn.src(0), with);
        return;
    }
    let (a, b) = (insn.src(0), insn.src(1));
    let (va, vb) = (state.get(a), state.get(b));
    // normalize to the condition that holds on this edge
    let op = if taken { op } else { op.invert_conditional_branch().unwrap_or(op) };
    match (va.get_constant(), vb.get_constant()) {
        (Some(x), Some(y)) => {
            let holds = match op {
                IfEq => x == y,
                IfNe => x != y,
                IfLt => x < y,
                IfGe => x >= y,
                IfGt => x > y,
                _ => x <= y,
            };
            if !holds {
                state.set_to_bottom();
            }
        }
        _ if op == IfEq => {
            let m = va.meet(&vb);
            state.set(a, m.clone());
            state.set(b, m);
        }
        // comparisons against zero tighten the other operand's sign
        (None, Some(0)) => {
            let s = match op {
                IfLt => Some(Sign::Ltz),
                IfGe => Some(Sign::Gez),
                IfGt => Some(Sign::Gtz),
                IfLe => Some(Sign::Lez),
                IfNe => Some(Sign::Nez),
                _ => None,
            };
            if let Some(s) = s {
                meet_reg(state, a, ConstantValue::from_sign(s));
            }
        }
        (Some(0), None) => {
            let s = match op {
                IfLt => Some(Sign::Gtz),
                IfGe => Some(Sign::Lez),
                IfGt => Some(Sign::Ltz),
                IfLe => Some(Sign::Gez),
                IfNe => Some(Sign::Nez),
                _ => None,
            };
            if let Some(s) = s {
                meet_reg(state, b, ConstantValue::from_sign(s));
            }
        }
        _ => {}
    }
}

fn refine_switch(cfg: &ControlFlowGraph, edge: &Edge, insn: &IRInstruction, state: &mut ConstantEnvironment) {
    let reg = insn.src(0);
    let value = state.get(reg);
    match (edge.kind, edge.case_key) {
        (EdgeType::Branch, Some(k)) => meet_reg(state, reg, ConstantValue::from_constant(k as i64)),
        (EdgeType::Goto, _) => {
            // default: infeasible when the value is one of the cases
            if let Some(v) = value.get_constant() {
                let is_case = cfg
                    .succ_edges(edge.src)
                    .iter()
                    .any(|e| e.kind == EdgeType::Branch && e.case_key.map(|k| k as i64) == Some(v));
                if is_case {
                    state.set_to_bottom();
                }
            }
        }
        _ => {}
    }
}

/// Edge states of `b`'s successors given the fixpoint `it`.
pub fn feasible_successors<'c>(
    it: &FixpointIterator<'c, ConstantPropagationAnalyzer<'_>>,
    b: usize,
) -> Vec<(&'c Edge, bool)> {
    let cfg = it.cfg();
    let exit = it.get_exit_state_at(b);
    cfg.succ_edges(b)
        .into_iter()
        .map(|e| {
            let feasible = !exit.is_bottom() && !it.analyzer().analyze_edge(cfg, e, &exit).is_bottom();
            (e, feasible)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::parse_code;

    fn analyze(g: &Interner, body: &str) -> (ControlFlowGraph, ConstantEnvironment) {
        let code = parse_code(g, body).unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let exit = {
            let it = ConstantPropagationAnalyzer::new(g, &cfg, ConstPropConfig::default()).run(&cfg);
            let last = *cfg.block_order().last().unwrap();
            it.get_exit_state_at(last)
        };
        (cfg, exit)
    }

    #[test]
    fn test_value_lattice() {
        let s = ConstantValue::object(ObjectValue::String(StringId::from(1)));
        let c = ConstantValue::object(ObjectValue::Class(TypeId::from(2)));
        assert_eq!(s.join(&c), ConstantValue::nez());
        assert_eq!(s.meet(&ConstantValue::nez()), s);
        assert!(s.meet(&ConstantValue::from_constant(0)).is_bottom());
        assert!(s.meet(&c).is_bottom());
        assert!(s.join(&ConstantValue::from_constant(0)).is_top());
        assert_eq!(s.join(&ConstantValue::from_constant(3)), ConstantValue::nez());
        assert!(s.leq(&ConstantValue::nez()));
        crate::domains::check_lattice_laws(&[
            ConstantValue::bottom(),
            ConstantValue::top(),
            s,
            c,
            ConstantValue::nez(),
            ConstantValue::from_constant(0),
            ConstantValue::from_constant(-4),
            ConstantValue::from_sign(Sign::Gez),
        ]);
    }

    #[test]
    fn test_folding() {
        assert_eq!(fold_int(IROpcode::AddIntLit8, 41, 1), Some(42));
        assert_eq!(fold_int(IROpcode::AddIntLit8, i32::MAX as i64, 1), None);
        assert_eq!(fold_int(IROpcode::DivInt, 1, 0), None);
        assert_eq!(fold_int(IROpcode::UshrInt, -1, 28), Some(15));
        assert_eq!(fold_int(IROpcode::RsubIntLit8, 3, 10), Some(7));
        assert_eq!(fold_long(IROpcode::ShlLong, 1, 40), Some(1 << 40));
        assert_eq!(fold_unop(IROpcode::IntToByte, 0x1ff), Some(-1));
        assert_eq!(fold_cmp(IROpcode::CmpLong, 3, 9), Some(-1));
        let nan = f32::NAN.to_bits() as i64;
        assert_eq!(fold_cmp(IROpcode::CmpgFloat, nan, 0), Some(1));
        assert_eq!(fold_cmp(IROpcode::CmplFloat, nan, 0), Some(-1));
    }

    #[test]
    fn test_branch_refinement() {
        let g = Interner::new();
        let code = parse_code(&g, "((load-param v0) (if-nez v0 :nz) (return v0) (:nz) (return v0))").unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let m = cfg.entry_block();
        let it = ConstantPropagationAnalyzer::new(&g, &cfg, ConstPropConfig::default()).run(&cfg);
        let taken = cfg.get_succ_edge_of_type(m, EdgeType::Branch).unwrap().target;
        let fall = cfg.get_succ_edge_of_type(m, EdgeType::Goto).unwrap().target;
        assert_eq!(it.get_entry_state_at(taken).get(0), ConstantValue::nez());
        assert_eq!(it.get_entry_state_at(fall).get(0), ConstantValue::from_constant(0));
    }

    #[test]
    fn test_infeasible_branch_and_loop() {
        let g = Interner::new();
        let (_, exit) = analyze(
            &g,
            "((const v0 0) (const v1 5) (:top) (add-int/lit8 v0 v0 1) (if-lt v0 v1 :top) (return v0))",
        );
        assert_eq!(exit.get(0).get_constant(), None);
        assert_eq!(exit.get(1), ConstantValue::from_constant(5));

        let code = parse_code(&g, "((const v0 0) (if-eqz v0 :t) (const v1 1) (:t) (return-void))").unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let it = ConstantPropagationAnalyzer::new(&g, &cfg, ConstPropConfig::default()).run(&cfg);
        let feasible: Vec<bool> = feasible_successors(&it, cfg.entry_block()).into_iter().map(|(_, f)| f).collect();
        assert_eq!(feasible.iter().filter(|f| **f).count(), 1);
    }

    #[test]
    fn test_boxed_integer_round_trip() {
        let g = Interner::new();
        let (_, exit) = analyze(
            &g,
            r#"((const v0 7)
                (invoke-static (v0) "Ljava/lang/Integer;.valueOf:(I)Ljava/lang/Integer;") (move-result-object v1)
                (invoke-virtual (v1) "Ljava/lang/Integer;.intValue:()I") (move-result v2)
                (return v2))"#,
        );
        assert_eq!(exit.get(1).get_object(), Some(ObjectValue::BoxedInt(7)));
        assert_eq!(exit.get(2).get_constant(), Some(7));
    }

    #[test]
    fn test_switch_on_constant() {
        let g = Interner::new();
        let code = parse_code(&g, "((const v0 5) (switch v0 (:a :b)) (return-void) (:a 1) (return-void) (:b 5) (return-void))")
            .unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let it = ConstantPropagationAnalyzer::new(&g, &cfg, ConstPropConfig::default()).run(&cfg);
        let live: Vec<Option<i32>> = feasible_successors(&it, cfg.entry_block())
            .into_iter()
            .filter(|(_, f)| *f)
            .map(|(e, _)| e.case_key)
            .collect();
        assert_eq!(live, vec![Some(5)]);
    }
}
