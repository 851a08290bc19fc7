//! Tracks the objects flowing into reflection APIs.
//!
//! Each register holds an abstract object (a string literal, a class, a field or method
//! looked up by name, an int literal, or an opaque object of known type). Class values also
//! record whether they came out of a reflective call. Arrays of `Class` allocated in the
//! method are modelled per allocation site so that `getMethod(name, new Class[] {..})`
//! resolves.

use std::collections::HashMap;

use log::trace;

use crate::cfg::graph::{ControlFlowGraph, InsnRef};
use crate::domains::constant::ConstantDomain;
use crate::domains::environment::Environment;
use crate::domains::reduced_product::ReducedProduct;
use crate::domains::AbstractDomain;
use crate::fixpoint::iterator::{FixpointAnalyzer, FixpointIterator};
use crate::ir::instruction::{IRInstruction, Reg, RESULT_REGISTER};
use crate::ir::interner::{Interner, MethodId, StringId, TypeId};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractObjectKind {
    Object,
    String,
    Class,
    Field,
    Method,
    Int,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbstractObject {
    Object(TypeId),
    String(StringId),
    Class(TypeId),
    Field(TypeId, StringId),
    Method(TypeId, StringId),
    Int(i64),
    /// A `Class[]` allocated at the given site.
    ClassArray(u32),
}

impl AbstractObject {
    pub fn kind(&self) -> AbstractObjectKind {
        match self {
            AbstractObject::Object(_) | AbstractObject::ClassArray(_) => AbstractObjectKind::Object,
            AbstractObject::String(_) => AbstractObjectKind::String,
            AbstractObject::Class(_) => AbstractObjectKind::Class,
            AbstractObject::Field(..) => AbstractObjectKind::Field,
            AbstractObject::Method(..) => AbstractObjectKind::Method,
            AbstractObject::Int(_) => AbstractObjectKind::Int,
        }
    }

    pub fn show(&self, g: &Interner) -> String {
        match self {
            AbstractObject::Object(t) => format!("OBJECT{{{}}}", g.descriptor(*t)),
            AbstractObject::String(s) => format!("STRING{{\"{}\"}}", g.string(*s)),
            AbstractObject::Class(t) => format!("CLASS{{{}}}", g.descriptor(*t)),
            AbstractObject::Field(t, n) => format!("FIELD{{{}:{}}}", g.descriptor(*t), g.string(*n)),
            AbstractObject::Method(t, n) => format!("METHOD{{{}:{}}}", g.descriptor(*t), g.string(*n)),
            AbstractObject::Int(v) => format!("INT{{{}}}", v),
            AbstractObject::ClassArray(site) => format!("CLASS[]{{@{}}}", site),
        }
    }
}

/// Where a class value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassObjectSource {
    NonReflection,
    Reflection,
}

pub type AbstractObjectDomain = ConstantDomain<AbstractObject>;
pub type ClassSourceDomain = ConstantDomain<ClassObjectSource>;
type ObjectEnvironment = Environment<Reg, AbstractObjectDomain>;
type ClassSourceEnvironment = Environment<Reg, ClassSourceDomain>;
/// Known elements of each `Class[]` allocation site.
type ClassArrayHeap = Environment<u32, ConstantDomain<Vec<Option<TypeId>>>>;

pub type ReflectionEnvironment =
    ReducedProduct<ReducedProduct<ObjectEnvironment, ClassSourceEnvironment>, ClassArrayHeap>;

fn get_object(state: &ReflectionEnvironment, reg: Reg) -> Option<AbstractObject> {
    state.first().first().get(reg).get_constant().cloned()
}

fn get_source(state: &ReflectionEnvironment, reg: Reg) -> Option<ClassObjectSource> {
    state.first().second().get(reg).get_constant().copied()
}

fn set_register(state: &mut ReflectionEnvironment, reg: Reg, obj: Option<AbstractObject>, source: Option<ClassObjectSource>) {
    let mut regs = state.first().clone();
    let mut objects = regs.first().clone();
    objects.set(reg, obj.map_or(ConstantDomain::Top, ConstantDomain::value));
    let mut sources = regs.second().clone();
    sources.set(reg, source.map_or(ConstantDomain::Top, ConstantDomain::value));
    regs = ReducedProduct::new(objects, sources);
    state.set_first(regs);
}

fn update_heap(state: &mut ReflectionEnvironment, site: u32, f: impl FnOnce(&ConstantDomain<Vec<Option<TypeId>>>) -> ConstantDomain<Vec<Option<TypeId>>>) {
    let mut heap = state.second().clone();
    heap.update(site, f);
    state.set_second(heap);
}

pub struct ReflectionAnalyzer<'g> {
    g: &'g Interner,
    params: HashMap<InsnRef, TypeId>,
    /// `new-array` instructions of `Class[]`, numbered.
    array_sites: HashMap<InsnRef, u32>,
    java_lang_class: TypeId,
    class_array: TypeId,
}

impl<'g> ReflectionAnalyzer<'g> {
    pub fn new(g: &'g Interner, method: MethodId, is_static: bool, cfg: &ControlFlowGraph) -> Self {
        let data = g.method(method);
        let mut arg_types = Vec::new();
        if !is_static {
            arg_types.push(data.class);
        }
        arg_types.extend(g.proto(data.proto).args.iter().copied());
        let mut args = arg_types.into_iter();

        let mut params = HashMap::new();
        let mut array_sites = HashMap::new();
        let class_array = g.make_type("[Ljava/lang/Class;");
        for (at, insn) in cfg.linear_instructions() {
            if insn.opcode().is_load_param() && at.block == cfg.entry_block() {
                if let Some(t) = args.next() {
                    params.insert(at, t);
                }
            }
            if insn.opcode() == IROpcode::NewArray && insn.type_ref() == Some(class_array) {
                let n = array_sites.len() as u32;
                array_sites.insert(at, n);
            }
        }
        ReflectionAnalyzer { g, params, array_sites, java_lang_class: g.make_type(types::JAVA_LANG_CLASS), class_array }
    }

    /// Opaque object of type `t`; class-typed values are unknown classes read from a
    /// non-reflective source.
    fn opaque(&self, state: &mut ReflectionEnvironment, reg: Reg, t: TypeId) {
        if t == self.java_lang_class {
            set_register(state, reg, None, Some(ClassObjectSource::NonReflection));
        } else if types::is_object(&self.g.descriptor(t)) {
            set_register(state, reg, Some(AbstractObject::Object(t)), None);
        } else {
            set_register(state, reg, None, None);
        }
    }

    fn analyze_invoke(&self, insn: &IRInstruction, state: &mut ReflectionEnvironment) {
        let g = self.g;
        let Some(m) = insn.method() else {
            set_register(state, RESULT_REGISTER, None, None);
            return;
        };
        let callee = g.method(m);
        let class = g.descriptor(callee.class);
        let name = g.string(callee.name);
        let arg = |i: usize| insn.srcs().get(i).and_then(|r| get_object(state, *r));

        let result = match (&*class, &*name) {
            (_, "getClass") if insn.srcs().len() == 1 => match arg(0) {
                Some(AbstractObject::Object(t)) => Some((AbstractObject::Class(t), ClassObjectSource::Reflection)),
                _ => None,
            },
            (types::JAVA_LANG_CLASS, "forName") => match arg(0) {
                Some(AbstractObject::String(s)) => {
                    let desc = types::descriptor_from_java_name(&g.string(s));
                    Some((AbstractObject::Class(g.make_type(&desc)), ClassObjectSource::Reflection))
                }
                _ => None,
            },
            (types::JAVA_LANG_CLASS, "getMethod" | "getDeclaredMethod") => match (arg(0), arg(1)) {
                (Some(AbstractObject::Class(t)), Some(AbstractObject::String(n))) => {
                    Some((AbstractObject::Method(t, n), ClassObjectSource::Reflection))
                }
                _ => None,
            },
            (types::JAVA_LANG_CLASS, "getField" | "getDeclaredField") => match (arg(0), arg(1)) {
                (Some(AbstractObject::Class(t)), Some(AbstractObject::String(n))) => {
                    Some((AbstractObject::Field(t, n), ClassObjectSource::Reflection))
                }
                _ => None,
            },
            (types::JAVA_LANG_CLASS, "getName" | "getSimpleName") => match arg(0) {
                Some(AbstractObject::Class(t)) => {
                    let desc = g.descriptor(t);
                    let s = if &*name == "getName" {
                        types::java_name(&desc)
                    } else {
                        types::simple_name(&desc).to_string()
                    };
                    Some((AbstractObject::String(g.make_string(&s)), ClassObjectSource::Reflection))
                }
                _ => None,
            },
            (types::JAVA_LANG_REFLECT_METHOD | types::JAVA_LANG_REFLECT_FIELD, "getName") => match arg(0) {
                Some(AbstractObject::Method(_, n)) | Some(AbstractObject::Field(_, n)) => {
                    Some((AbstractObject::String(n), ClassObjectSource::Reflection))
                }
                _ => None,
            },
            _ => None,
        };
        match result {
            Some((obj, source)) => {
                let source = if obj.kind() == AbstractObjectKind::Class { Some(source) } else { None };
                set_register(state, RESULT_REGISTER, Some(obj), source);
            }
            None => {
                let rtype = g.proto(callee.proto).rtype;
                self.opaque(state, RESULT_REGISTER, rtype);
            }
        }
    }
}

impl<'g> FixpointAnalyzer for ReflectionAnalyzer<'g> {
    type Domain = ReflectionEnvironment;

    fn analyze_instruction(&self, at: InsnRef, insn: &IRInstruction, state: &mut ReflectionEnvironment) {
        use IROpcode::*;

        let g = self.g;
        let op = insn.opcode();
        match op {
            LoadParam | LoadParamWide | LoadParamObject => {
                if let (Some(d), Some(t)) = (insn.dest(), self.params.get(&at)) {
                    self.opaque(state, d, *t);
                }
            }
            Const => {
                if let (Some(d), Some(v)) = (insn.dest(), insn.literal()) {
                    set_register(state, d, Some(AbstractObject::Int(v)), None);
                }
            }
            ConstString => {
                let s = insn.string().map(AbstractObject::String);
                set_register(state, RESULT_REGISTER, s, None);
            }
            ConstClass => {
                let t = insn.type_ref().map(AbstractObject::Class);
                set_register(state, RESULT_REGISTER, t, Some(ClassObjectSource::Reflection));
            }
            Move | MoveObject => {
                if let Some(d) = insn.dest() {
                    let s = insn.src(0);
                    set_register(state, d, get_object(state, s), get_source(state, s));
                }
            }
            MoveResult | MoveResultObject | MoveResultPseudo | MoveResultPseudoObject => {
                if let Some(d) = insn.dest() {
                    let (obj, source) = (get_object(state, RESULT_REGISTER), get_source(state, RESULT_REGISTER));
                    set_register(state, d, obj, source);
                }
            }
            CheckCast => {
                let s = insn.src(0);
                let obj = match (get_object(state, s), insn.type_ref()) {
                    (Some(AbstractObject::Object(_)), Some(t)) | (None, Some(t)) if t != self.java_lang_class => {
                        Some(AbstractObject::Object(t))
                    }
                    (other, _) => other,
                };
                set_register(state, RESULT_REGISTER, obj, get_source(state, s));
            }
            NewInstance => {
                let obj = insn.type_ref().map(AbstractObject::Object);
                set_register(state, RESULT_REGISTER, obj, None);
            }
            NewArray => {
                let len = get_object(state, insn.src(0));
                match (self.array_sites.get(&at), len) {
                    (Some(site), Some(AbstractObject::Int(n))) if (0..=255).contains(&n) => {
                        let site = *site;
                        update_heap(state, site, |_| ConstantDomain::value(vec![None; n as usize]));
                        set_register(state, RESULT_REGISTER, Some(AbstractObject::ClassArray(site)), None);
                    }
                    _ => {
                        let obj = insn.type_ref().map(AbstractObject::Object);
                        set_register(state, RESULT_REGISTER, obj, None);
                    }
                }
            }
            AputObject => {
                let (value, array, index) = (insn.src(0), insn.src(1), insn.src(2));
                if let Some(AbstractObject::ClassArray(site)) = get_object(state, array) {
                    let element = match get_object(state, value) {
                        Some(AbstractObject::Class(t)) => Some(t),
                        _ => None,
                    };
                    let index = match get_object(state, index) {
                        Some(AbstractObject::Int(i)) => Some(i),
                        _ => None,
                    };
                    update_heap(state, site, |slots| match (slots.get_constant(), index) {
                        (Some(v), Some(i)) if (i as usize) < v.len() && i >= 0 => {
                            let mut v = v.clone();
                            v[i as usize] = element;
                            ConstantDomain::value(v)
                        }
                        _ => ConstantDomain::Top,
                    });
                }
            }
            AgetObject => {
                let (array, index) = (insn.src(0), insn.src(1));
                let found = match (get_object(state, array), get_object(state, index)) {
                    (Some(AbstractObject::ClassArray(site)), Some(AbstractObject::Int(i))) => state
                        .second()
                        .get(site)
                        .get_constant()
                        .and_then(|v| usize::try_from(i).ok().and_then(|i| v.get(i).copied().flatten())),
                    _ => None,
                };
                match found {
                    Some(t) => set_register(state, RESULT_REGISTER, Some(AbstractObject::Class(t)), Some(ClassObjectSource::NonReflection)),
                    None => set_register(state, RESULT_REGISTER, None, None),
                }
            }
            _ if op.is_iget() || op.is_sget() => {
                if let Some(f) = insn.field() {
                    self.opaque(state, RESULT_REGISTER, g.field(f).ty);
                }
            }
            _ if op.is_invoke() => self.analyze_invoke(insn, state),
            FilledNewArray => {
                let obj = insn.type_ref().map(AbstractObject::Object);
                set_register(state, RESULT_REGISTER, obj, None);
            }
            _ => {
                if op.has_move_result_pseudo() {
                    set_register(state, RESULT_REGISTER, None, None);
                } else if let Some(d) = insn.dest() {
                    set_register(state, d, None, None);
                    if op.dest_is_wide() {
                        set_register(state, d + 1, None, None);
                    }
                }
            }
        }
    }
}

/// A register holding a reflective value in front of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionSite {
    pub at: InsnRef,
    pub reg: Reg,
    pub object: AbstractObject,
    pub source: Option<ClassObjectSource>,
}

/// Reflection facts of one method.
pub struct ReflectionAnalysis {
    states: HashMap<InsnRef, ReflectionEnvironment>,
    sites: Vec<ReflectionSite>,
}

impl ReflectionAnalysis {
    pub fn run(g: &Interner, method: MethodId, is_static: bool, cfg: &ControlFlowGraph) -> Self {
        let analyzer = ReflectionAnalyzer::new(g, method, is_static, cfg);
        let mut it = FixpointIterator::new(cfg, analyzer);
        it.run(ReflectionEnvironment::top());

        let mut states = HashMap::new();
        let mut sites = Vec::new();
        for b in cfg.block_order() {
            it.replay_block(b, |at, insn, state| {
                for r in insn.srcs() {
                    if let Some(obj) = get_object(state, *r) {
                        if !matches!(obj.kind(), AbstractObjectKind::Object | AbstractObjectKind::Int) {
                            sites.push(ReflectionSite { at, reg: *r, object: obj, source: get_source(state, *r) });
                        }
                    }
                }
                states.insert(at, state.clone());
            });
        }
        trace!("[reflection] {} reflection sites in {}", sites.len(), g.show_method(method));
        ReflectionAnalysis { states, sites }
    }

    /// Abstract object in `reg` just before the instruction at `at`.
    pub fn get_abstract_object(&self, at: InsnRef, reg: Reg) -> Option<AbstractObject> {
        self.states.get(&at).and_then(|s| get_object(s, reg))
    }

    pub fn get_class_source(&self, at: InsnRef, reg: Reg) -> Option<ClassObjectSource> {
        self.states.get(&at).and_then(|s| get_source(s, reg))
    }

    pub fn reflection_sites(&self) -> &[ReflectionSite] {
        &self.sites
    }

    pub fn has_found_reflection(&self) -> bool {
        !self.sites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::parse_code;

    fn analyze(g: &Interner, sig: &str, body: &str) -> (ControlFlowGraph, ReflectionAnalysis) {
        let m = g.make_method_from_str(sig).unwrap();
        let code = parse_code(g, body).unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let a = ReflectionAnalysis::run(g, m, true, &cfg);
        (cfg, a)
    }

    fn at_last(cfg: &ControlFlowGraph) -> InsnRef {
        let insns = cfg.linear_instructions();
        insns[insns.len() - 1].0
    }

    #[test]
    fn test_for_name_then_get_method() {
        let g = Interner::new();
        let (cfg, a) = analyze(
            &g,
            "LFoo;.bar:()V",
            r#"((const-string "com.example.Target") (move-result-pseudo-object v0)
                (invoke-static (v0) "Ljava/lang/Class;.forName:(Ljava/lang/String;)Ljava/lang/Class;")
                (move-result-object v1)
                (const-string "run") (move-result-pseudo-object v2)
                (const v3 0)
                (invoke-virtual (v1 v2 v3) "Ljava/lang/Class;.getMethod:(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;")
                (move-result-object v4)
                (invoke-virtual (v4) "Ljava/lang/reflect/Method;.getName:()Ljava/lang/String;")
                (move-result-object v5)
                (return-void))"#,
        );
        let end = at_last(&cfg);
        let target = g.make_type("Lcom/example/Target;");
        assert_eq!(a.get_abstract_object(end, 1), Some(AbstractObject::Class(target)));
        assert_eq!(a.get_class_source(end, 1), Some(ClassObjectSource::Reflection));
        assert_eq!(a.get_abstract_object(end, 4), Some(AbstractObject::Method(target, g.make_string("run"))));
        assert_eq!(a.get_abstract_object(end, 5), Some(AbstractObject::String(g.make_string("run"))));
        assert_eq!(a.get_abstract_object(end, 3), Some(AbstractObject::Int(0)));
        assert!(a.has_found_reflection());
    }

    #[test]
    fn test_get_class_and_check_cast() {
        let g = Interner::new();
        let (cfg, a) = analyze(
            &g,
            "LFoo;.bar:(Ljava/lang/Object;Ljava/lang/Class;)V",
            r#"((load-param-object v0) (load-param-object v1)
                (check-cast v0 "LBar;") (move-result-pseudo-object v2)
                (invoke-virtual (v2) "Ljava/lang/Object;.getClass:()Ljava/lang/Class;")
                (move-result-object v3)
                (return-void))"#,
        );
        let end = at_last(&cfg);
        let bar = g.make_type("LBar;");
        assert_eq!(a.get_abstract_object(end, 0), Some(AbstractObject::Object(g.make_type(types::JAVA_LANG_OBJECT))));
        assert_eq!(a.get_abstract_object(end, 2), Some(AbstractObject::Object(bar)));
        assert_eq!(a.get_abstract_object(end, 3), Some(AbstractObject::Class(bar)));
        // a Class parameter is an unknown class, but not a reflective one
        assert_eq!(a.get_abstract_object(end, 1), None);
        assert_eq!(a.get_class_source(end, 1), Some(ClassObjectSource::NonReflection));
    }

    #[test]
    fn test_class_array_elements() {
        let g = Interner::new();
        let (cfg, a) = analyze(
            &g,
            "LFoo;.bar:()V",
            r#"((const v0 2)
                (new-array v0 "[Ljava/lang/Class;") (move-result-pseudo-object v1)
                (const-class "LA;") (move-result-pseudo-object v2)
                (const v3 1)
                (aput-object v2 v1 v3)
                (aget-object v1 v3) (move-result-pseudo-object v4)
                (const v5 0)
                (aget-object v1 v5) (move-result-pseudo-object v6)
                (return-void))"#,
        );
        let end = at_last(&cfg);
        assert_eq!(a.get_abstract_object(end, 4), Some(AbstractObject::Class(g.make_type("LA;"))));
        assert_eq!(a.get_abstract_object(end, 6), None);
        assert_eq!(a.get_abstract_object(end, 1).map(|o| o.kind()), Some(AbstractObjectKind::Object));
    }

    #[test]
    fn test_join_of_different_strings_is_unknown() {
        let g = Interner::new();
        let (cfg, a) = analyze(
            &g,
            "LFoo;.bar:(I)V",
            r#"((load-param v0)
                (if-eqz v0 :b)
                (const-string "a") (move-result-pseudo-object v1)
                (goto :end)
                (:b)
                (const-string "b") (move-result-pseudo-object v1)
                (:end)
                (return-void))"#,
        );
        assert_eq!(a.get_abstract_object(at_last(&cfg), 1), None);
        assert_eq!(AbstractObject::Int(3).show(&g), "INT{3}");
    }
}
