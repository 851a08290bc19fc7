//! Static call graph over the internal methods that have code.
//!
//! Direct, static and super calls resolve to their single target. A virtual or interface
//! call is an edge only when virtuals are included and the resolved definition has no
//! override anywhere below its class; otherwise the call site has no known callee.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::debug;

use crate::ir::class::{DexMethod, MethodSearch, Scope};
use crate::ir::instruction::IRInstruction;
use crate::ir::interner::{Interner, MethodId, TypeId};
use crate::ir::opcode::IROpcode;

#[derive(Debug, Default, Clone)]
pub struct CallGraph {
    nodes: BTreeSet<MethodId>,
    callees: BTreeMap<MethodId, BTreeSet<MethodId>>,
    callers: BTreeMap<MethodId, BTreeSet<MethodId>>,
    overridden: HashSet<MethodId>,
    include_virtuals: bool,
}

impl CallGraph {
    pub fn build(g: &Interner, scope: &Scope, include_virtuals: bool) -> CallGraph {
        let mut cg = CallGraph { overridden: overridden_methods(g, scope), include_virtuals, ..CallGraph::default() };

        for class in scope.internal_classes() {
            for method in class.methods().filter(|m| m.code().is_some()) {
                cg.nodes.insert(method.reference);
            }
        }
        for class in scope.internal_classes() {
            for method in class.methods() {
                let Some(code) = method.code() else { continue };
                for (_, insn) in code.instructions() {
                    if let Some(callee) = cg.resolve_callee(g, scope, insn) {
                        cg.add_edge(method.reference, callee);
                    }
                }
            }
        }
        debug!(
            "[cp] call graph: {} methods, {} edges",
            cg.nodes.len(),
            cg.callees.values().map(|s| s.len()).sum::<usize>()
        );
        cg
    }

    fn add_edge(&mut self, caller: MethodId, callee: MethodId) {
        self.callees.entry(caller).or_default().insert(callee);
        self.callers.entry(callee).or_default().insert(caller);
    }

    /// The method body an invoke is known to run, if it is one of the graph's nodes.
    pub fn resolve_callee(&self, g: &Interner, scope: &Scope, insn: &IRInstruction) -> Option<MethodId> {
        let op = insn.opcode();
        if !op.is_invoke() || matches!(op, IROpcode::InvokeCustom | IROpcode::InvokePolymorphic) {
            return None;
        }
        let callee = scope.resolve_method(g, insn.method()?, MethodSearch::for_invoke(op))?;
        if matches!(op, IROpcode::InvokeVirtual | IROpcode::InvokeInterface)
            && (!self.include_virtuals || self.overridden.contains(&callee))
        {
            return None;
        }
        self.nodes.contains(&callee).then_some(callee)
    }

    pub fn nodes(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.nodes.iter().copied()
    }

    pub fn contains(&self, m: MethodId) -> bool {
        self.nodes.contains(&m)
    }

    pub fn callees(&self, m: MethodId) -> impl Iterator<Item = MethodId> + '_ {
        self.callees.get(&m).into_iter().flatten().copied()
    }

    pub fn callers(&self, m: MethodId) -> impl Iterator<Item = MethodId> + '_ {
        self.callers.get(&m).into_iter().flatten().copied()
    }

    pub fn has_callers(&self, m: MethodId) -> bool {
        self.callers.get(&m).map_or(false, |s| !s.is_empty())
    }

    /// Whether some subclass or implementor redefines `m`.
    pub fn is_overridden(&self, m: MethodId) -> bool {
        self.overridden.contains(&m)
    }

    /// Nodes with callees listed before their callers, where cycles allow it.
    pub fn postorder(&self) -> Vec<MethodId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for root in &self.nodes {
            if !visited.insert(*root) {
                continue;
            }
            let mut stack: Vec<(MethodId, Vec<MethodId>)> = vec![(*root, self.callees(*root).collect())];
            while let Some((m, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => {
                        if visited.insert(next) {
                            let succs = self.callees(next).collect();
                            stack.push((next, succs));
                        }
                    }
                    None => {
                        order.push(*m);
                        stack.pop();
                    }
                }
            }
        }
        order
    }
}

/// Virtual methods that some subtype redefines with the same name and prototype.
fn overridden_methods(g: &Interner, scope: &Scope) -> HashSet<MethodId> {
    let children = scope.children_index();
    let mut overridden = HashSet::new();
    for class in scope.classes() {
        let sigs: HashMap<_, MethodId> = class
            .vmethods
            .iter()
            .map(|m: &DexMethod| {
                let d = g.method(m.reference);
                ((d.name, d.proto), m.reference)
            })
            .collect();
        if sigs.is_empty() {
            continue;
        }
        let mut seen: HashSet<TypeId> = HashSet::new();
        let mut work: Vec<TypeId> = children.get(&class.ty).cloned().unwrap_or_default();
        while let Some(t) = work.pop() {
            if !seen.insert(t) {
                continue;
            }
            if let Some(sub) = scope.class(t) {
                for m in &sub.vmethods {
                    let d = g.method(m.reference);
                    if let Some(base) = sigs.get(&(d.name, d.proto)) {
                        overridden.insert(*base);
                    }
                }
            }
            work.extend(children.get(&t).into_iter().flatten().copied());
        }
    }
    overridden
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::parse_code;
    use crate::ir::class::{AccessFlags, DexClass};

    fn add(g: &Interner, class: &mut DexClass, sig: &str, access: AccessFlags, body: Option<&str>) -> MethodId {
        let m = g.make_method_from_str(sig).unwrap();
        let mut def = DexMethod::new(m, access);
        if let Some(body) = body {
            def = def.with_code(parse_code(g, body).unwrap());
        }
        class.add_method(g, def).unwrap();
        m
    }

    #[test]
    fn test_edges_and_overrides() {
        let g = Interner::new();
        let mut scope = Scope::new();
        let mut a = DexClass::new(g.make_type("LA;"), None, AccessFlags::PUBLIC);
        let run = add(
            &g,
            &mut a,
            "LA;.run:()V",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            Some(
                r#"((new-instance "LB;") (move-result-pseudo-object v0)
                    (invoke-static () "LA;.helper:()V")
                    (invoke-virtual (v0) "LB;.f:()V")
                    (invoke-virtual (v0) "LB;.g:()V")
                    (return-void))"#,
            ),
        );
        let helper = add(&g, &mut a, "LA;.helper:()V", AccessFlags::PRIVATE | AccessFlags::STATIC, Some("((return-void))"));
        let af = add(&g, &mut a, "LA;.f:()V", AccessFlags::PUBLIC, Some("((load-param-object v0) (return-void))"));
        let ag = add(&g, &mut a, "LA;.g:()V", AccessFlags::PUBLIC, Some("((load-param-object v0) (return-void))"));
        let mut b = DexClass::new(g.make_type("LB;"), Some(g.make_type("LA;")), AccessFlags::PUBLIC);
        let bg = add(&g, &mut b, "LB;.g:()V", AccessFlags::PUBLIC, Some("((load-param-object v0) (return-void))"));
        scope.add_class(&g, a).unwrap();
        scope.add_class(&g, b).unwrap();

        let cg = CallGraph::build(&g, &scope, true);
        assert!(cg.is_overridden(ag));
        assert!(!cg.is_overridden(af));
        let callees: Vec<MethodId> = cg.callees(run).collect();
        assert!(callees.contains(&helper));
        // B.f resolves to A.f, which nothing overrides
        assert!(callees.contains(&af));
        // B.g resolves to B.g itself, a leaf
        assert!(callees.contains(&bg));
        assert_eq!(cg.callers(helper).collect::<Vec<_>>(), vec![run]);

        let post = cg.postorder();
        let pos = |m| post.iter().position(|x| *x == m).unwrap();
        assert!(pos(helper) < pos(run));

        let direct_only = CallGraph::build(&g, &scope, false);
        assert_eq!(direct_only.callees(run).collect::<Vec<_>>(), vec![helper]);
    }
}
