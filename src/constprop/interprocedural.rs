//! Whole-program constant propagation.
//!
//! Static final fields are summarized first, from their encoded initial values and from the
//! writes in their class initializer. Then argument values flow along the call graph: every
//! root method starts with unknown arguments, every other method with bottom (never called),
//! and each round joins the values seen at resolved call sites into the callee's arguments
//! until nothing changes. Each method is finally optimized with its arguments seeded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info, warn};

use crate::analysis::call_graph::CallGraph;
use crate::cfg::graph::ControlFlowGraph;
use crate::config::InterproceduralConfig;
use crate::constprop::analyzer::{
    ArgumentDomain, ConstantPropagationAnalyzer, ConstantValue, FieldEnvironment, ObjectValue,
};
use crate::constprop::assertions::insert_assertions;
use crate::constprop::optimize_code;
use crate::constprop::transform::TransformStats;
use crate::dex::encoded_values::EncodedValue;
use crate::domains::AbstractDomain;
use crate::error::Result;
use crate::fixpoint::iterator::FixpointIterator;
use crate::ir::class::{AccessFlags, DexClass, DexMethod, Scope};
use crate::ir::code::IRCode;
use crate::ir::interner::{FieldId, Interner, MethodId};
use crate::ir::opcode::IROpcode;

#[derive(Debug, Default)]
pub struct InterproceduralResult {
    pub args: HashMap<MethodId, ArgumentDomain>,
    pub fields: FieldEnvironment,
    pub stats: TransformStats,
    pub rounds: u32,
    pub assertions: usize,
}

impl InterproceduralResult {
    pub fn report(&self, metrics: &mut BTreeMap<String, i64>) {
        self.stats.report("interprocedural_cp", metrics);
        *metrics.entry("interprocedural_cp.rounds".to_string()).or_insert(0) += self.rounds as i64;
        *metrics.entry("interprocedural_cp.num_assertions".to_string()).or_insert(0) += self.assertions as i64;
        let known = self.args.values().filter(|a| !a.is_top() && !a.is_bottom()).count();
        *metrics.entry("interprocedural_cp.methods_with_known_args".to_string()).or_insert(0) += known as i64;
    }
}

pub struct InterproceduralConstantPropagation<'g> {
    g: &'g Interner,
    config: InterproceduralConfig,
}

/// Value of an encoded static initializer, as the analysis sees it.
fn encoded_value(v: &EncodedValue) -> ConstantValue {
    match v {
        EncodedValue::Byte(x) => ConstantValue::from_constant(*x as i64),
        EncodedValue::Short(x) => ConstantValue::from_constant(*x as i64),
        EncodedValue::Char(x) => ConstantValue::from_constant(*x as i64),
        EncodedValue::Int(x) => ConstantValue::from_constant(*x as i64),
        EncodedValue::Long(x) => ConstantValue::from_constant(*x),
        EncodedValue::Float(x) => ConstantValue::from_constant(x.to_bits() as i32 as i64),
        EncodedValue::Double(x) => ConstantValue::from_constant(x.to_bits() as i64),
        EncodedValue::Boolean(b) => ConstantValue::from_constant(*b as i64),
        EncodedValue::Null => ConstantValue::from_constant(0),
        EncodedValue::String(s) => ConstantValue::object(ObjectValue::String(*s)),
        EncodedValue::Type(t) => ConstantValue::object(ObjectValue::Class(*t)),
        _ => ConstantValue::top(),
    }
}

fn is_final_static(access: AccessFlags) -> bool {
    access.contains(AccessFlags::STATIC | AccessFlags::FINAL)
}

fn code_of(method: &DexMethod) -> Option<&IRCode> {
    method.code().filter(|c| !c.is_empty() || c.cfg_built())
}

impl<'g> InterproceduralConstantPropagation<'g> {
    pub fn new(g: &'g Interner, config: InterproceduralConfig) -> Self {
        InterproceduralConstantPropagation { g, config }
    }

    /// Analyzes the whole scope and rewrites every internal method body.
    pub fn run(&self, scope: &mut Scope) -> Result<InterproceduralResult> {
        scope.materialize_all(self.g)?;
        let fields = self.analyze_static_fields(scope)?;
        let cg = CallGraph::build(self.g, scope, self.config.include_virtuals);
        let (args, rounds) = self.analyze_arguments(scope, &cg, &fields)?;
        info!("[cp] interprocedural analysis converged after {} rounds", rounds);

        let mut result = InterproceduralResult { fields, rounds, ..InterproceduralResult::default() };
        for class in scope.classes_mut().iter_mut().filter(|c| !c.external) {
            for method in class.methods_mut() {
                let m = method.reference;
                let Some(code) = method.code_mut(self.g)? else { continue };
                let seeded = args.get(&m).filter(|a| !a.is_bottom()).cloned();
                result.stats += optimize_code(self.g, &self.config.intra, code, Some(&result.fields), seeded.clone())?;
                if self.config.create_runtime_asserts {
                    if let Some(a) = &seeded {
                        result.assertions += insert_assertions(self.g, code, a, &self.config.assertion_handler)?;
                    }
                }
            }
        }
        result.args = args;
        debug!("[cp] interprocedural rewrites: {:?}", result.stats);
        Ok(result)
    }

    /// Summaries of the static final fields of internal classes.
    pub fn analyze_static_fields(&self, scope: &Scope) -> Result<FieldEnvironment> {
        let g = self.g;
        let mut env = FieldEnvironment::top();
        for class in scope.internal_classes() {
            for f in class.sfields.iter().filter(|f| is_final_static(f.access)) {
                let v = f.static_value.as_ref().map_or_else(|| ConstantValue::from_constant(0), encoded_value);
                env.set(f.reference, v);
            }
        }

        for round in 0..self.config.max_heap_analysis_iterations {
            let mut next = env.clone();
            for class in scope.internal_classes() {
                let Some(clinit) = class.dmethods.iter().find(|m| &*g.string(g.method(m.reference).name) == "<clinit>")
                else {
                    continue;
                };
                let Some(code) = code_of(clinit) else { continue };
                for (f, v) in self.clinit_writes(class, code, &env)? {
                    next.set(f, v);
                }
            }
            if next == env {
                break;
            }
            debug!("[cp] static field round {} changed {} bindings", round, next.len());
            env = next;
        }
        Ok(env)
    }

    /// Join of the values each own final static field is assigned in `<clinit>`.
    fn clinit_writes(&self, class: &DexClass, code: &IRCode, env: &FieldEnvironment) -> Result<BTreeMap<FieldId, ConstantValue>> {
        let owned: BTreeSet<FieldId> =
            class.sfields.iter().filter(|f| is_final_static(f.access)).map(|f| f.reference).collect();
        let cfg = match code.cfg() {
            Some(cfg) => cfg.clone(),
            None => ControlFlowGraph::build(code)?,
        };
        let analyzer = ConstantPropagationAnalyzer::new(self.g, &cfg, self.config.intra.clone()).with_fields(env);
        let it = analyzer.run(&cfg);
        let mut writes: BTreeMap<FieldId, ConstantValue> = BTreeMap::new();
        for b in cfg.block_order() {
            it.replay_block(b, |_, insn, state| {
                if !insn.opcode().is_sput() || state.is_bottom() {
                    return;
                }
                if let Some(f) = insn.field().filter(|f| owned.contains(f)) {
                    let v = state.get(insn.src(0));
                    writes.entry(f).and_modify(|w| w.join_with(&v)).or_insert(v);
                }
            });
        }
        Ok(writes)
    }

    fn is_root(&self, g: &Interner, cg: &CallGraph, method: &DexMethod) -> bool {
        let name = g.string(g.method(method.reference).name);
        if &*name == "<clinit>" || !cg.has_callers(method.reference) {
            return true;
        }
        if self.config.public_methods_are_roots && !method.access.contains(AccessFlags::PRIVATE) {
            return true;
        }
        method.is_virtual(g) && (!self.config.include_virtuals || cg.is_overridden(method.reference))
    }

    /// Argument values of every method with code, and the number of rounds it took.
    pub fn analyze_arguments(
        &self,
        scope: &Scope,
        cg: &CallGraph,
        fields: &FieldEnvironment,
    ) -> Result<(HashMap<MethodId, ArgumentDomain>, u32)> {
        let g = self.g;
        let mut args: HashMap<MethodId, ArgumentDomain> = HashMap::new();
        let mut bodies: Vec<(MethodId, ControlFlowGraph)> = Vec::new();
        let mut roots: BTreeSet<MethodId> = BTreeSet::new();
        for class in scope.internal_classes() {
            for method in class.methods() {
                let Some(code) = code_of(method) else { continue };
                let cfg = match code.cfg() {
                    Some(cfg) => cfg.clone(),
                    None => ControlFlowGraph::build(code)?,
                };
                let root = self.is_root(g, cg, method);
                if root {
                    roots.insert(method.reference);
                }
                args.insert(method.reference, if root { ArgumentDomain::top() } else { ArgumentDomain::bottom() });
                bodies.push((method.reference, cfg));
            }
        }
        // callers before callees
        let order: HashMap<MethodId, usize> = cg.postorder().into_iter().rev().enumerate().map(|(i, m)| (m, i)).collect();
        bodies.sort_by_key(|(m, _)| order.get(m).copied().unwrap_or(usize::MAX));

        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed: BTreeSet<MethodId> = BTreeSet::new();
            for (m, cfg) in &bodies {
                let Some(a) = args.get(m).filter(|a| !a.is_bottom()).cloned() else { continue };
                let analyzer = ConstantPropagationAnalyzer::new(g, cfg, self.config.intra.clone())
                    .with_fields(fields)
                    .with_args(a);
                let it = analyzer.run(cfg);
                for (callee, outgoing) in self.call_site_arguments(scope, cg, &it) {
                    if roots.contains(&callee) {
                        continue;
                    }
                    let current = args.entry(callee).or_insert_with(ArgumentDomain::bottom);
                    let joined = current.join(&outgoing);
                    if joined != *current {
                        *current = joined;
                        changed.insert(callee);
                    }
                }
            }
            if changed.is_empty() {
                break;
            }
            if rounds >= self.config.max_iterations {
                warn!("[cp] argument analysis stopped after {} rounds; {} methods left unknown", rounds, changed.len());
                for m in changed {
                    args.insert(m, ArgumentDomain::top());
                }
                break;
            }
        }
        Ok((args, rounds))
    }

    /// Values passed at every resolved call site of an analyzed body.
    fn call_site_arguments(
        &self,
        scope: &Scope,
        cg: &CallGraph,
        it: &FixpointIterator<'_, ConstantPropagationAnalyzer<'_>>,
    ) -> Vec<(MethodId, ArgumentDomain)> {
        let mut out = Vec::new();
        for b in it.cfg().block_order() {
            it.replay_block(b, |_, insn, state| {
                if state.is_bottom() || !insn.opcode().is_invoke() || insn.opcode() == IROpcode::InvokeCustom {
                    return;
                }
                let Some(callee) = cg.resolve_callee(self.g, scope, insn) else { return };
                let mut outgoing = ArgumentDomain::top();
                for (i, reg) in insn.srcs().iter().enumerate() {
                    outgoing.set(i as u32, state.get(*reg));
                }
                out.push((callee, outgoing));
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::{parse_code, print_code};

    fn method(g: &Interner, class: &mut DexClass, sig: &str, access: AccessFlags, body: &str) -> MethodId {
        let m = g.make_method_from_str(sig).unwrap();
        class.add_method(g, DexMethod::new(m, access).with_code(parse_code(g, body).unwrap())).unwrap();
        m
    }

    fn body(g: &Interner, scope: &Scope, m: MethodId) -> String {
        print_code(scope.method_def(m, g).unwrap().code().unwrap(), g)
    }

    #[test]
    fn test_argument_flows_into_private_callee() {
        let g = Interner::new();
        let mut foo = DexClass::new(g.make_type("LFoo;"), None, AccessFlags::PUBLIC);
        method(
            &g,
            &mut foo,
            "LFoo;.bar:()V",
            AccessFlags::PUBLIC,
            r#"((load-param-object v0) (const v1 0) (invoke-direct (v0 v1) "LFoo;.baz:(I)V") (return-void))"#,
        );
        let baz = method(
            &g,
            &mut foo,
            "LFoo;.baz:(I)V",
            AccessFlags::PRIVATE,
            "((load-param-object v0) (load-param v1) (if-eqz v1 :L) (const v2 1) (:L) (return-void))",
        );
        let mut scope = Scope::new();
        scope.add_class(&g, foo).unwrap();

        let ipcp = InterproceduralConstantPropagation::new(&g, InterproceduralConfig::default());
        let result = ipcp.run(&mut scope).unwrap();
        assert_eq!(result.args[&baz].get(1), ConstantValue::from_constant(0));
        assert!(result.args[&baz].get(0).is_top());
        assert_eq!(result.stats.branches_removed, 1);
        let expected = print_code(
            &parse_code(&g, "((load-param-object v0) (load-param v1) (goto :L) (const v2 1) (:L) (return-void))").unwrap(),
            &g,
        );
        assert_eq!(body(&g, &scope, baz), expected);
    }

    #[test]
    fn test_conflicting_call_sites_join() {
        let g = Interner::new();
        let mut foo = DexClass::new(g.make_type("LFoo;"), None, AccessFlags::PUBLIC);
        method(
            &g,
            &mut foo,
            "LFoo;.main:()V",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            r#"((const v0 1) (invoke-static (v0) "LFoo;.f:(I)V") (const v0 2) (invoke-static (v0) "LFoo;.f:(I)V") (return-void))"#,
        );
        let f = method(
            &g,
            &mut foo,
            "LFoo;.f:(I)V",
            AccessFlags::PRIVATE | AccessFlags::STATIC,
            "((load-param v0) (if-gtz v0 :pos) (const v1 0) (:pos) (return-void))",
        );
        let mut scope = Scope::new();
        scope.add_class(&g, foo).unwrap();
        let result = InterproceduralConstantPropagation::new(&g, InterproceduralConfig::default()).run(&mut scope).unwrap();
        let v = result.args[&f].get(0);
        assert_eq!(v.get_constant(), None);
        assert_eq!(v.interval(), crate::domains::sign::Sign::Gtz);
        // positive on every path, so the test always succeeds
        assert!(!body(&g, &scope, f).contains("if-gtz"));
    }

    #[test]
    fn test_public_callee_is_a_root() {
        let g = Interner::new();
        let mut foo = DexClass::new(g.make_type("LFoo;"), None, AccessFlags::PUBLIC);
        method(
            &g,
            &mut foo,
            "LFoo;.main:()V",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            r#"((const v0 0) (invoke-static (v0) "LFoo;.f:(I)V") (return-void))"#,
        );
        let f = method(&g, &mut foo, "LFoo;.f:(I)V", AccessFlags::PUBLIC | AccessFlags::STATIC, "((load-param v0) (return-void))");
        let mut scope = Scope::new();
        scope.add_class(&g, foo.clone()).unwrap();
        let result = InterproceduralConstantPropagation::new(&g, InterproceduralConfig::default()).run(&mut scope).unwrap();
        assert!(result.args[&f].is_top());

        let mut scope = Scope::new();
        scope.add_class(&g, foo).unwrap();
        let closed = InterproceduralConfig { public_methods_are_roots: false, ..InterproceduralConfig::default() };
        let result = InterproceduralConstantPropagation::new(&g, closed).run(&mut scope).unwrap();
        assert_eq!(result.args[&f].get(0), ConstantValue::from_constant(0));
    }

    #[test]
    fn test_static_final_fields() {
        let g = Interner::new();
        let mut foo = DexClass::new(g.make_type("LFoo;"), None, AccessFlags::PUBLIC);
        let x = g.make_field_from_str("LFoo;.X:I").unwrap();
        let y = g.make_field_from_str("LFoo;.Y:I").unwrap();
        let z = g.make_field_from_str("LFoo;.Z:I").unwrap();
        let mut fx = crate::ir::class::DexField::new(x, AccessFlags::STATIC | AccessFlags::FINAL);
        fx.static_value = Some(EncodedValue::Int(7));
        foo.sfields.push(fx);
        foo.sfields.push(crate::ir::class::DexField::new(y, AccessFlags::STATIC | AccessFlags::FINAL));
        foo.sfields.push(crate::ir::class::DexField::new(z, AccessFlags::STATIC));
        method(
            &g,
            &mut foo,
            "LFoo;.<clinit>:()V",
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
            r#"((const v0 3) (sput v0 "LFoo;.Y:I") (sput v0 "LFoo;.Z:I") (return-void))"#,
        );
        let use_it = method(
            &g,
            &mut foo,
            "LFoo;.get:()I",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            r#"((sget "LFoo;.Y:I") (move-result-pseudo v0) (return v0))"#,
        );
        let mut scope = Scope::new();
        scope.add_class(&g, foo).unwrap();
        let ipcp = InterproceduralConstantPropagation::new(&g, InterproceduralConfig::default());
        let fields = ipcp.analyze_static_fields(&scope).unwrap();
        assert_eq!(fields.get(x), ConstantValue::from_constant(7));
        assert_eq!(fields.get(y), ConstantValue::from_constant(3));
        assert!(fields.get(z).is_top());

        let result = ipcp.run(&mut scope).unwrap();
        assert_eq!(result.stats.sgets_replaced, 1);
        assert_eq!(body(&g, &scope, use_it), print_code(&parse_code(&g, "((const v0 3) (return v0))").unwrap(), &g));
    }
}
