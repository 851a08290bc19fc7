//! Register type inference.
//!
//! Every register gets an `IRType` from a 16-element lattice. A zero literal is `ZERO`,
//! which sits below both `REFERENCE` and `INT`. Wide values occupy a pair of registers
//! tagged `*1` then `*2`. Reference registers also carry their concrete `TypeId` when known.
//!
//! The same transfer function serves inference and checking: in checking mode every operand
//! is compared against what its opcode expects and the first mismatch is reported.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;

use crate::cfg::graph::{ControlFlowGraph, InsnRef};
use crate::config::TypeCheckerConfig;
use crate::domains::constant::ConstantDomain;
use crate::domains::environment::Environment;
use crate::domains::finite_lattice::{FiniteDomain, FiniteLattice, LatticeSpec};
use crate::domains::reduced_product::ReducedProduct;
use crate::domains::AbstractDomain;
use crate::fixpoint::iterator::{FixpointAnalyzer, FixpointIterator};
use crate::ir::instruction::{IRInstruction, Reg, RESULT_REGISTER};
use crate::ir::interner::{Interner, MethodId, TypeId};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum IRType {
    Bottom,
    Zero,
    Const,
    Const1,
    Const2,
    Reference,
    Int,
    Float,
    Long1,
    Long2,
    Double1,
    Double2,
    Scalar,
    Scalar1,
    Scalar2,
    Top,
}

impl fmt::Display for IRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IRType::Bottom => "BOTTOM",
            IRType::Zero => "ZERO",
            IRType::Const => "CONST",
            IRType::Const1 => "CONST1",
            IRType::Const2 => "CONST2",
            IRType::Reference => "REFERENCE",
            IRType::Int => "INT",
            IRType::Float => "FLOAT",
            IRType::Long1 => "LONG1",
            IRType::Long2 => "LONG2",
            IRType::Double1 => "DOUBLE1",
            IRType::Double2 => "DOUBLE2",
            IRType::Scalar => "SCALAR",
            IRType::Scalar1 => "SCALAR1",
            IRType::Scalar2 => "SCALAR2",
            IRType::Top => "TOP",
        };
        f.write_str(s)
    }
}

impl fmt::Debug for IRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

const IR_TYPES: [IRType; 16] = [
    IRType::Bottom,
    IRType::Zero,
    IRType::Const,
    IRType::Const1,
    IRType::Const2,
    IRType::Reference,
    IRType::Int,
    IRType::Float,
    IRType::Long1,
    IRType::Long2,
    IRType::Double1,
    IRType::Double2,
    IRType::Scalar,
    IRType::Scalar1,
    IRType::Scalar2,
    IRType::Top,
];

const IR_TYPE_ORDER: [(IRType, IRType); 21] = [
    (IRType::Bottom, IRType::Zero),
    (IRType::Bottom, IRType::Const1),
    (IRType::Bottom, IRType::Const2),
    (IRType::Zero, IRType::Reference),
    (IRType::Zero, IRType::Const),
    (IRType::Const, IRType::Int),
    (IRType::Const, IRType::Float),
    (IRType::Const1, IRType::Long1),
    (IRType::Const1, IRType::Double1),
    (IRType::Const2, IRType::Long2),
    (IRType::Const2, IRType::Double2),
    (IRType::Int, IRType::Scalar),
    (IRType::Float, IRType::Scalar),
    (IRType::Long1, IRType::Scalar1),
    (IRType::Double1, IRType::Scalar1),
    (IRType::Long2, IRType::Scalar2),
    (IRType::Double2, IRType::Scalar2),
    (IRType::Reference, IRType::Top),
    (IRType::Scalar, IRType::Top),
    (IRType::Scalar1, IRType::Top),
    (IRType::Scalar2, IRType::Top),
];

static IR_TYPE_LATTICE: Lazy<FiniteLattice<IRType>> =
    Lazy::new(|| FiniteLattice::from_trusted(&IR_TYPES, &IR_TYPE_ORDER));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IRTypeLattice;

impl LatticeSpec for IRTypeLattice {
    type Element = IRType;

    fn lattice() -> &'static FiniteLattice<IRType> {
        &IR_TYPE_LATTICE
    }
}

pub type TypeDomain = FiniteDomain<IRTypeLattice>;

impl IRType {
    pub fn leq(self, other: IRType) -> bool {
        IR_TYPE_LATTICE.leq(self, other)
    }

    pub fn join(self, other: IRType) -> IRType {
        IR_TYPE_LATTICE.join(self, other)
    }

    pub fn meet(self, other: IRType) -> IRType {
        IR_TYPE_LATTICE.meet(self, other)
    }

    /// Type of a value of descriptor `desc` in one register, or the low half for wide ones.
    pub fn of_descriptor(desc: &str) -> IRType {
        match desc.as_bytes().first() {
            Some(b'L') | Some(b'[') => IRType::Reference,
            Some(b'F') => IRType::Float,
            Some(b'J') => IRType::Long1,
            Some(b'D') => IRType::Double1,
            Some(b'V') | None => IRType::Top,
            _ => IRType::Int,
        }
    }

    /// The high half that goes with a wide low half.
    pub fn high_half(self) -> IRType {
        match self {
            IRType::Long1 => IRType::Long2,
            IRType::Double1 => IRType::Double2,
            IRType::Const1 => IRType::Const2,
            IRType::Scalar1 => IRType::Scalar2,
            other => other,
        }
    }

    pub fn is_wide_low(self) -> bool {
        matches!(self, IRType::Long1 | IRType::Double1 | IRType::Const1 | IRType::Scalar1)
    }
}

pub type TypeEnvironment = ReducedProduct<Environment<Reg, TypeDomain>, Environment<Reg, ConstantDomain<TypeId>>>;

pub trait TypeEnvironmentExt {
    fn get_type(&self, reg: Reg) -> IRType;
    fn get_dex_type(&self, reg: Reg) -> Option<TypeId>;
    fn set_type(&mut self, reg: Reg, ty: IRType);
    fn set_reference(&mut self, reg: Reg, dex_type: Option<TypeId>);
}

impl TypeEnvironmentExt for TypeEnvironment {
    fn get_type(&self, reg: Reg) -> IRType {
        self.first().get(reg).element()
    }

    fn get_dex_type(&self, reg: Reg) -> Option<TypeId> {
        self.second().get(reg).get_constant().copied()
    }

    fn set_type(&mut self, reg: Reg, ty: IRType) {
        let mut types = self.first().clone();
        types.set(reg, TypeDomain::new(ty));
        self.set_first(types);
        let mut dex = self.second().clone();
        dex.set(reg, ConstantDomain::Top);
        self.set_second(dex);
    }

    fn set_reference(&mut self, reg: Reg, dex_type: Option<TypeId>) {
        self.set_type(reg, IRType::Reference);
        if let Some(t) = dex_type {
            let mut dex = self.second().clone();
            dex.set(reg, ConstantDomain::value(t));
            self.set_second(dex);
        }
    }
}

/// A type error found in checking mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub at: InsnRef,
    pub message: String,
}

struct Checking<'a> {
    errors: &'a mut Vec<TypeError>,
    at: InsnRef,
}

pub struct TypeInference<'g> {
    g: &'g Interner,
    method: MethodId,
    is_static: bool,
    config: TypeCheckerConfig,
    /// Load-param instructions mapped to the parameter type they bind.
    params: HashMap<InsnRef, TypeId>,
    this_reg: Option<Reg>,
}

impl<'g> TypeInference<'g> {
    pub fn new(g: &'g Interner, method: MethodId, is_static: bool, cfg: &ControlFlowGraph, config: TypeCheckerConfig) -> Self {
        let data = g.method(method);
        let mut arg_types: Vec<TypeId> = Vec::new();
        if !is_static {
            arg_types.push(data.class);
        }
        arg_types.extend(g.proto(data.proto).args.iter().copied());

        let mut params = HashMap::new();
        let mut this_reg = None;
        let mut next = arg_types.into_iter();
        if let Some(entry) = cfg.block(cfg.entry_block()) {
            for (index, insn) in entry.instructions() {
                if !insn.opcode().is_load_param() {
                    break;
                }
                if let Some(t) = next.next() {
                    if !is_static && this_reg.is_none() {
                        this_reg = insn.dest();
                    }
                    params.insert(InsnRef { block: cfg.entry_block(), index }, t);
                }
            }
        }
        TypeInference { g, method, is_static, config, params, this_reg }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Runs the analysis to a fixpoint over `cfg`.
    pub fn run<'c>(self, cfg: &'c ControlFlowGraph) -> FixpointIterator<'c, Self> {
        let mut it = FixpointIterator::new(cfg, self);
        it.run(TypeEnvironment::top());
        it
    }

    /// Transfer with checks; returns the errors found at `insn`.
    pub fn check_instruction(&self, at: InsnRef, insn: &IRInstruction, state: &mut TypeEnvironment) -> Vec<TypeError> {
        let mut errors = Vec::new();
        self.transfer(insn, state, Some(Checking { errors: &mut errors, at }), at);
        errors
    }

    fn transfer(&self, insn: &IRInstruction, state: &mut TypeEnvironment, mut check: Option<Checking<'_>>, at: InsnRef) {
        use IROpcode::*;

        let g = self.g;
        let op = insn.opcode();
        let src = |i: usize| insn.srcs().get(i).copied();

        if let (Some(c), Some(d), Some(this)) = (check.as_mut(), insn.dest(), self.this_reg) {
            if self.config.check_no_overwrite_this && d == this && !op.is_load_param() {
                report(c, format!("register v{} holds `this` and is overwritten", d));
            }
        }
        if let Some(c) = check.as_mut() {
            let expected = expected_srcs(insn, g);
            if let Some(n) = expected {
                if insn.srcs().len() != n {
                    report(c, format!("{} expects {} source registers, found {}", op.name(), n, insn.srcs().len()));
                    return;
                }
            }
        }

        let check_moves = self.config.verify_moves;

        match op {
            Nop | Goto | ReturnVoid => {}
            LoadParam | LoadParamWide | LoadParamObject => {
                let (Some(d), Some(t)) = (insn.dest(), self.params.get(&at)) else {
                    if let Some(c) = check.as_mut() {
                        report(c, "load-param does not match the method signature".to_string());
                    }
                    return;
                };
                let desc = g.descriptor(*t);
                let ty = IRType::of_descriptor(&desc);
                let matches = match op {
                    LoadParamObject => ty == IRType::Reference,
                    LoadParamWide => ty.is_wide_low(),
                    _ => ty == IRType::Int || ty == IRType::Float,
                };
                if !matches {
                    if let Some(c) = check.as_mut() {
                        report(c, format!("{} cannot load a parameter of type {}", op.name(), desc));
                    }
                }
                set_desc(state, d, &desc, Some(*t), g);
            }
            Move => {
                if let (Some(d), Some(s)) = (insn.dest(), src(0)) {
                    if check_moves {
                        assume(state, &mut check, s, IRType::Scalar);
                    }
                    let t = state.get_type(s);
                    state.set_type(d, t);
                }
            }
            MoveWide => {
                if let (Some(d), Some(s)) = (insn.dest(), src(0)) {
                    if check_moves {
                        assume(state, &mut check, s, IRType::Scalar1);
                        assume(state, &mut check, s + 1, IRType::Scalar2);
                    }
                    let (lo, hi) = (state.get_type(s), state.get_type(s + 1));
                    state.set_type(d, lo);
                    state.set_type(d + 1, hi);
                }
            }
            MoveObject => {
                if let (Some(d), Some(s)) = (insn.dest(), src(0)) {
                    if check_moves {
                        assume(state, &mut check, s, IRType::Reference);
                    }
                    let (t, dex) = (state.get_type(s), state.get_dex_type(s));
                    if t == IRType::Reference {
                        state.set_reference(d, dex);
                    } else {
                        state.set_type(d, t);
                    }
                }
            }
            MoveResult | MoveResultPseudo => {
                if let Some(d) = insn.dest() {
                    assume(state, &mut check, RESULT_REGISTER, IRType::Scalar);
                    let t = state.get_type(RESULT_REGISTER);
                    state.set_type(d, t);
                }
            }
            MoveResultWide | MoveResultPseudoWide => {
                if let Some(d) = insn.dest() {
                    assume(state, &mut check, RESULT_REGISTER, IRType::Scalar1);
                    let (lo, hi) = (state.get_type(RESULT_REGISTER), state.get_type(RESULT_REGISTER + 1));
                    state.set_type(d, lo);
                    state.set_type(d + 1, hi);
                }
            }
            MoveResultObject | MoveResultPseudoObject => {
                if let Some(d) = insn.dest() {
                    assume(state, &mut check, RESULT_REGISTER, IRType::Reference);
                    let dex = state.get_dex_type(RESULT_REGISTER);
                    if state.get_type(RESULT_REGISTER) == IRType::Zero {
                        state.set_type(d, IRType::Zero);
                    } else {
                        state.set_reference(d, dex);
                    }
                }
            }
            MoveException => {
                if let Some(d) = insn.dest() {
                    state.set_reference(d, Some(g.make_type(types::JAVA_LANG_THROWABLE)));
                }
            }
            Return | ReturnWide | ReturnObject => {
                let rtype = g.descriptor(g.proto(g.method(self.method).proto).rtype);
                if let Some(s) = src(0) {
                    let ok = match op {
                        ReturnObject => types::is_object(&rtype),
                        ReturnWide => types::is_wide(&rtype),
                        _ => !types::is_object(&rtype) && !types::is_wide(&rtype) && !types::is_void(&rtype),
                    };
                    if !ok {
                        if let Some(c) = check.as_mut() {
                            report(c, format!("{} in a method returning {}", op.name(), rtype));
                        }
                    }
                    if op == ReturnObject {
                        assume(state, &mut check, s, IRType::Reference);
                    } else {
                        assume_desc(state, &mut check, s, &rtype);
                    }
                }
            }
            Const => {
                if let Some(d) = insn.dest() {
                    let zero = insn.literal() == Some(0);
                    state.set_type(d, if zero && self.config.enable_polymorphic_constants { IRType::Zero } else { IRType::Const });
                }
            }
            ConstWide => {
                if let Some(d) = insn.dest() {
                    state.set_type(d, IRType::Const1);
                    state.set_type(d + 1, IRType::Const2);
                }
            }
            ConstString => state.set_reference(RESULT_REGISTER, Some(g.make_type(types::JAVA_LANG_STRING))),
            ConstClass => state.set_reference(RESULT_REGISTER, Some(g.make_type(types::JAVA_LANG_CLASS))),
            ConstMethodHandle => state.set_reference(RESULT_REGISTER, Some(g.make_type("Ljava/lang/invoke/MethodHandle;"))),
            ConstMethodType => state.set_reference(RESULT_REGISTER, Some(g.make_type("Ljava/lang/invoke/MethodType;"))),
            MonitorEnter | MonitorExit | Throw | FillArrayData => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Reference);
                }
            }
            CheckCast => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Reference);
                }
                state.set_reference(RESULT_REGISTER, insn.type_ref());
            }
            InstanceOf | ArrayLength => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Reference);
                }
                state.set_type(RESULT_REGISTER, IRType::Int);
            }
            NewInstance => state.set_reference(RESULT_REGISTER, insn.type_ref()),
            NewArray => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Int);
                }
                state.set_reference(RESULT_REGISTER, insn.type_ref());
            }
            FilledNewArray => {
                let component = insn
                    .type_ref()
                    .and_then(|t| types::array_component(&g.descriptor(t)).map(|c| c.to_string()));
                if let Some(component) = component {
                    for s in insn.srcs() {
                        if types::is_object(&component) {
                            assume(state, &mut check, *s, IRType::Reference);
                        } else {
                            assume_desc(state, &mut check, *s, &component);
                        }
                    }
                }
                state.set_reference(RESULT_REGISTER, insn.type_ref());
            }
            Switch => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Int);
                }
            }
            CmplFloat | CmpgFloat | CmplDouble | CmpgDouble | CmpLong => {
                let desc = match op {
                    CmplFloat | CmpgFloat => "F",
                    CmpLong => "J",
                    _ => "D",
                };
                for s in insn.srcs() {
                    assume_desc(state, &mut check, *s, desc);
                }
                if let Some(d) = insn.dest() {
                    state.set_type(d, IRType::Int);
                }
            }
            IfEq | IfNe => {
                if let (Some(a), Some(b)) = (src(0), src(1)) {
                    assume_comparable(state, &mut check, a, b);
                }
            }
            IfLt | IfGe | IfGt | IfLe => {
                for s in insn.srcs() {
                    assume(state, &mut check, *s, IRType::Int);
                }
            }
            IfEqz | IfNez => {
                if let Some(s) = src(0) {
                    let t = state.get_type(s);
                    if !t.leq(IRType::Reference) && !t.leq(IRType::Int) {
                        if let Some(c) = check.as_mut() {
                            report(c, format!("register v{}: expected INT or REFERENCE, found {}", s, t));
                        }
                    }
                }
            }
            IfLtz | IfGez | IfGtz | IfLez => {
                if let Some(s) = src(0) {
                    assume(state, &mut check, s, IRType::Int);
                }
            }
            Aget | AgetWide | AgetObject | AgetBoolean | AgetByte | AgetChar | AgetShort => {
                if let (Some(arr), Some(ix)) = (src(0), src(1)) {
                    assume(state, &mut check, arr, IRType::Reference);
                    assume(state, &mut check, ix, IRType::Int);
                    match op {
                        Aget => state.set_type(RESULT_REGISTER, IRType::Scalar),
                        AgetWide => {
                            state.set_type(RESULT_REGISTER, IRType::Scalar1);
                            state.set_type(RESULT_REGISTER + 1, IRType::Scalar2);
                        }
                        AgetObject => {
                            let component = state
                                .get_dex_type(arr)
                                .and_then(|t| types::array_component(&g.descriptor(t)).and_then(|c| g.get_type(c)));
                            state.set_reference(RESULT_REGISTER, component);
                        }
                        _ => state.set_type(RESULT_REGISTER, IRType::Int),
                    }
                }
            }
            Aput | AputWide | AputObject | AputBoolean | AputByte | AputChar | AputShort => {
                if let (Some(v), Some(arr), Some(ix)) = (src(0), src(1), src(2)) {
                    match op {
                        Aput => assume(state, &mut check, v, IRType::Scalar),
                        AputWide => {
                            assume(state, &mut check, v, IRType::Scalar1);
                            assume(state, &mut check, v + 1, IRType::Scalar2);
                        }
                        AputObject => assume(state, &mut check, v, IRType::Reference),
                        _ => assume(state, &mut check, v, IRType::Int),
                    }
                    assume(state, &mut check, arr, IRType::Reference);
                    assume(state, &mut check, ix, IRType::Int);
                }
            }
            _ if op.is_iget() || op.is_sget() => {
                if op.is_iget() {
                    if let Some(obj) = src(0) {
                        assume(state, &mut check, obj, IRType::Reference);
                    }
                }
                if let Some(f) = insn.field() {
                    let ty = g.field(f).ty;
                    set_desc(state, RESULT_REGISTER, &g.descriptor(ty), Some(ty), g);
                }
            }
            _ if op.is_iput() || op.is_sput() => {
                if let (Some(v), Some(f)) = (src(0), insn.field()) {
                    let desc = g.descriptor(g.field(f).ty);
                    if types::is_object(&desc) {
                        assume(state, &mut check, v, IRType::Reference);
                    } else {
                        assume_desc(state, &mut check, v, &desc);
                    }
                }
                if op.is_iput() {
                    if let Some(obj) = src(1) {
                        assume(state, &mut check, obj, IRType::Reference);
                    }
                }
            }
            _ if op.is_invoke() => {
                let arg_types = insn.invoke_arg_types(g);
                for (s, t) in insn.srcs().iter().zip(arg_types.iter()) {
                    let desc = g.descriptor(*t);
                    if types::is_object(&desc) {
                        assume(state, &mut check, *s, IRType::Reference);
                    } else {
                        assume_desc(state, &mut check, *s, &desc);
                    }
                }
                let rtype = match (insn.method(), insn.proto(), insn.call_site()) {
                    (_, Some(p), _) => Some(g.proto(p).rtype),
                    (_, _, Some(cs)) => Some(g.proto(g.call_site(cs).proto).rtype),
                    (Some(m), _, _) => Some(g.proto(g.method(m).proto).rtype),
                    _ => None,
                };
                if let Some(r) = rtype {
                    let desc = g.descriptor(r);
                    if !types::is_void(&desc) {
                        set_desc(state, RESULT_REGISTER, &desc, Some(r), g);
                    }
                }
            }
            _ => self.transfer_arith(insn, state, &mut check),
        }
    }

    fn transfer_arith(&self, insn: &IRInstruction, state: &mut TypeEnvironment, check: &mut Option<Checking<'_>>) {
        use IROpcode::*;

        let op = insn.opcode();
        // (operand descriptors, result descriptor)
        let (operands, result): (&[&str], &str) = match op {
            NegInt | NotInt | IntToByte | IntToChar | IntToShort => (&["I"], "I"),
            NegLong | NotLong => (&["J"], "J"),
            NegFloat => (&["F"], "F"),
            NegDouble => (&["D"], "D"),
            IntToLong => (&["I"], "J"),
            IntToFloat => (&["I"], "F"),
            IntToDouble => (&["I"], "D"),
            LongToInt => (&["J"], "I"),
            LongToFloat => (&["J"], "F"),
            LongToDouble => (&["J"], "D"),
            FloatToInt => (&["F"], "I"),
            FloatToLong => (&["F"], "J"),
            FloatToDouble => (&["F"], "D"),
            DoubleToInt => (&["D"], "I"),
            DoubleToLong => (&["D"], "J"),
            DoubleToFloat => (&["D"], "F"),
            AddInt | SubInt | MulInt | DivInt | RemInt | AndInt | OrInt | XorInt | ShlInt | ShrInt | UshrInt => {
                (&["I", "I"], "I")
            }
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong => (&["J", "J"], "J"),
            ShlLong | ShrLong | UshrLong => (&["J", "I"], "J"),
            AddFloat | SubFloat | MulFloat | DivFloat | RemFloat => (&["F", "F"], "F"),
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => (&["D", "D"], "D"),
            _ if op.is_binop_lit() => (&["I"], "I"),
            _ => return,
        };
        for (s, desc) in insn.srcs().iter().zip(operands.iter()) {
            let t = IRType::of_descriptor(desc);
            assume(state, check, *s, t);
            if t.is_wide_low() {
                assume(state, check, *s + 1, t.high_half());
            }
        }
        if let Some(d) = insn.dest() {
            set_desc(state, d, result, None, self.g);
        }
    }
}

fn report(c: &mut Checking<'_>, message: String) {
    c.errors.push(TypeError { at: c.at, message });
}

fn assume(state: &TypeEnvironment, check: &mut Option<Checking<'_>>, reg: Reg, expected: IRType) {
    if let Some(c) = check.as_mut() {
        let actual = state.get_type(reg);
        if actual != IRType::Bottom && !actual.leq(expected) {
            report(c, format!("register v{}: expected {}, found {}", reg, expected, actual));
        }
    }
}

/// Checks `reg` against the primitive descriptor `desc`, both halves when wide.
fn assume_desc(state: &TypeEnvironment, check: &mut Option<Checking<'_>>, reg: Reg, desc: &str) {
    let t = IRType::of_descriptor(desc);
    if t.is_wide_low() {
        assume(state, check, reg, t);
        assume(state, check, reg + 1, t.high_half());
    } else {
        assume(state, check, reg, if t == IRType::Top { IRType::Scalar } else { t });
    }
}

fn assume_comparable(state: &TypeEnvironment, check: &mut Option<Checking<'_>>, a: Reg, b: Reg) {
    if let Some(c) = check.as_mut() {
        let (ta, tb) = (state.get_type(a), state.get_type(b));
        let refs = ta.leq(IRType::Reference) && tb.leq(IRType::Reference);
        let ints = ta.leq(IRType::Int) && tb.leq(IRType::Int);
        if !refs && !ints {
            report(c, format!("registers v{} and v{} are not comparable: {} and {}", a, b, ta, tb));
        }
    }
}

/// Writes the type of a value of descriptor `desc` to `reg` (and `reg + 1` when wide).
fn set_desc(state: &mut TypeEnvironment, reg: Reg, desc: &str, dex_type: Option<TypeId>, g: &Interner) {
    let t = IRType::of_descriptor(desc);
    match t {
        IRType::Reference => state.set_reference(reg, dex_type.or_else(|| g.get_type(desc))),
        t if t.is_wide_low() => {
            state.set_type(reg, t);
            state.set_type(reg + 1, t.high_half());
        }
        t => state.set_type(reg, t),
    }
}

/// Number of sources an opcode takes, when fixed.
fn expected_srcs(insn: &IRInstruction, g: &Interner) -> Option<usize> {
    use IROpcode::*;
    let op = insn.opcode();
    let n = match op {
        Nop | Goto | ReturnVoid | Const | ConstWide | ConstString | ConstClass | ConstMethodHandle
        | ConstMethodType | NewInstance | MoveException => 0,
        _ if op.is_load_param() || op.is_move_result() || op.is_move_result_pseudo() => 0,
        _ if op.is_sget() => 0,
        Move | MoveWide | MoveObject | Return | ReturnWide | ReturnObject | MonitorEnter | MonitorExit
        | CheckCast | InstanceOf | ArrayLength | NewArray | FillArrayData | Throw | Switch => 1,
        _ if op.is_testz_branch() || op.is_unop() || op.is_binop_lit() || op.is_sput() || op.is_iget() => 1,
        _ if op.is_conditional_branch() || op.is_cmp() || op.is_binop() || op.is_iput() || op.is_aget() => 2,
        _ if op.is_aput() => 3,
        InvokeVirtual | InvokeSuper | InvokeDirect | InvokeStatic | InvokeInterface => insn.invoke_arg_types(g).len(),
        _ => return None,
    };
    Some(n)
}

impl<'g> FixpointAnalyzer for TypeInference<'g> {
    type Domain = TypeEnvironment;

    fn analyze_instruction(&self, at: InsnRef, insn: &IRInstruction, state: &mut TypeEnvironment) {
        self.transfer(insn, state, None, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::parse_code;

    #[test]
    fn test_lattice_shape() {
        let l = FiniteLattice::new(&IR_TYPES, &IR_TYPE_ORDER).unwrap();
        assert_eq!(l.elements().len(), 16);
        assert_eq!(l.encode(IRType::Bottom).count_ones(), 1);
        assert_eq!(l.encode(IRType::Top).count_ones(), 16);
        assert_eq!(IRType::Reference.meet(IRType::Int), IRType::Zero);
        assert_eq!(IRType::Long1.meet(IRType::Double1), IRType::Const1);
        assert_eq!(IRType::Int.join(IRType::Float), IRType::Scalar);
        assert_eq!(IRType::Zero.join(IRType::Const1), IRType::Top);
        assert!(IRType::Zero.leq(IRType::Reference) && IRType::Zero.leq(IRType::Int));
        assert!(!IRType::Const.leq(IRType::Reference));
        let values: Vec<TypeDomain> = IR_TYPES.iter().map(|t| TypeDomain::new(*t)).collect();
        crate::domains::check_lattice_laws(&values);
    }

    #[test]
    fn test_infers_params_and_results() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.bar:(JLjava/lang/String;)I").unwrap();
        let code = parse_code(
            &g,
            r#"((load-param-object v0) (load-param-wide v1) (load-param-object v3)
                (invoke-virtual (v3) "Ljava/lang/String;.length:()I") (move-result v4)
                (return v4))"#,
        )
        .unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let it = TypeInference::new(&g, m, false, &cfg, TypeCheckerConfig::default()).run(&cfg);
        let exit = it.get_exit_state_at(cfg.entry_block());
        assert_eq!(exit.get_type(0), IRType::Reference);
        assert_eq!(exit.get_dex_type(0), Some(g.make_type("LFoo;")));
        assert_eq!(exit.get_type(1), IRType::Long1);
        assert_eq!(exit.get_type(2), IRType::Long2);
        assert_eq!(exit.get_dex_type(3), Some(g.make_type("Ljava/lang/String;")));
        assert_eq!(exit.get_type(4), IRType::Int);
    }

    #[test]
    fn test_join_at_merge() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.bar:(I)V").unwrap();
        let code = parse_code(
            &g,
            "((load-param v0) (if-eqz v0 :a) (int-to-float v1 v0) (goto :b) (:a) (const v1 0) (:b) (return-void))",
        )
        .unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let it = TypeInference::new(&g, m, true, &cfg, TypeCheckerConfig::default()).run(&cfg);
        let last = cfg.blocks().find(|b| b.last_insn().map(|(_, i)| i.opcode()) == Some(IROpcode::ReturnVoid)).unwrap();
        // FLOAT joined with ZERO
        assert_eq!(it.get_entry_state_at(last.id()).get_type(1), IRType::Float);
    }
}
