//! Renames virtual methods while keeping dispatch intact.
//!
//! Every virtual method definition is a node of a union-find. Overrides, interface methods
//! and their implementations (including ones inherited from a superclass) end up in one
//! set, and a set is renamed as a unit. A set keeps its old name when any member does: methods
//! of external or annotation classes, native and keep-annotated methods, overrides of
//! `java.lang.Object` methods, and everything in a class with an undefined supertype.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::{debug, info};

use crate::config::RenamerConfig;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::class::{DexMethod, MethodSearch, Scope};
use crate::ir::interner::{Interner, MethodId, ProtoId, StringId, TypeId};
use crate::ir::types;
use crate::renamer::names::{name_for_index, StackTraceNames};
use crate::renamer::union_find::UnionFind;

/// Candidates tried for one set before giving up.
const MAX_CANDIDATES: u64 = 1 << 20;

/// Virtual methods every class inherits from `java.lang.Object`.
const OBJECT_METHODS: &[(&str, &str)] = &[
    ("equals", "(Ljava/lang/Object;)Z"),
    ("hashCode", "()I"),
    ("toString", "()Ljava/lang/String;"),
    ("finalize", "()V"),
    ("clone", "()Ljava/lang/Object;"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenameStats {
    pub methods_renamed: usize,
    pub refs_rewritten: usize,
    pub pinned_sets: usize,
    pub renamed_sets: usize,
}

impl RenameStats {
    pub fn report(&self, metrics: &mut BTreeMap<String, i64>) {
        for (k, v) in [
            ("renamer.methods_renamed", self.methods_renamed),
            ("renamer.refs_rewritten", self.refs_rewritten),
            ("renamer.pinned_sets", self.pinned_sets),
            ("renamer.renamed_sets", self.renamed_sets),
        ] {
            *metrics.entry(k.to_string()).or_insert(0) += v as i64;
        }
    }
}

/// A set of definitions that must share one name.
#[derive(Debug)]
struct NameSet {
    members: Vec<MethodId>,
    proto: ProtoId,
    renamable: bool,
}

pub struct VirtualRenamer<'g> {
    g: &'g Interner,
    config: RenamerConfig,
    keep_types: Vec<TypeId>,
}

impl<'g> VirtualRenamer<'g> {
    pub fn new(g: &'g Interner, config: RenamerConfig) -> Self {
        let keep_types = config.keep_annotations.iter().filter_map(|d| g.get_type(d)).collect();
        VirtualRenamer { g, config, keep_types }
    }

    pub fn run(&self, scope: &mut Scope) -> Result<RenameStats> {
        let g = self.g;
        scope.materialize_all(g)?;
        let mut stats = RenameStats::default();

        let sets = self.link(scope);
        let refs = self.resolve_refs(scope);

        let mut stack_traces = StackTraceNames::new();
        for class in scope.classes() {
            for m in class.methods() {
                stack_traces.add(class.ty, g.method(m.reference).name);
            }
        }

        let children = scope.children_index();
        let mut counters: HashMap<TypeId, u64> = HashMap::new();
        for set in &sets {
            if !set.renamable {
                stats.pinned_sets += 1;
                continue;
            }
            let related = self.related_types(scope, &children, set);
            let top = g.method(set.members[0]).class;
            let start = counters.get(&top).copied().unwrap_or(0);
            let (index, name) = self.pick_name(set, &related, &stack_traces, start)?;
            counters.insert(top, index + 1);

            for m in &set.members {
                let data = g.method(*m);
                stack_traces.remove(data.class, data.name);
                stack_traces.add(data.class, name);
                g.rename_method(*m, name).map_err(|c| {
                    DexError::with_kind(ErrorKind::InternalError, "rename collides with an existing method")
                        .extra("method", g.show_method(*m))
                        .extra("existing", g.show_method(c.0))
                })?;
                stats.methods_renamed += 1;
            }
            stats.renamed_sets += 1;
        }

        stats.refs_rewritten = self.rewrite_refs(scope, &refs)?;
        if !has_unique_signatures(g, scope) {
            return Err(DexError::with_kind(ErrorKind::InternalError, "renaming left two methods with one signature"));
        }
        info!(
            "[renamer] renamed {} methods in {} sets, {} sets pinned, {} references rewritten",
            stats.methods_renamed, stats.renamed_sets, stats.pinned_sets, stats.refs_rewritten
        );
        Ok(stats)
    }

    fn is_pinned(&self, scope: &Scope, class_ty: TypeId, method: &DexMethod) -> bool {
        let g = self.g;
        let Some(class) = scope.class(class_ty) else { return true };
        if class.external || class.is_annotation() || method.is_native() {
            return true;
        }
        if self.keep_types.iter().any(|t| method.has_annotation(*t)) {
            return true;
        }
        let data = g.method(method.reference);
        let name = g.string(data.name);
        if name.starts_with('<') {
            return true;
        }
        // an undefined supertype may declare anything
        let unknown_super = scope
            .super_chain(class_ty)
            .last()
            .map_or(false, |t| scope.class(*t).is_none() && &*g.descriptor(*t) != types::JAVA_LANG_OBJECT);
        let unknown_iface = scope.transitive_interfaces(class_ty).iter().any(|i| scope.class(*i).is_none());
        if unknown_super || unknown_iface {
            return true;
        }
        let proto = g.show_proto(data.proto);
        OBJECT_METHODS.iter().any(|(n, p)| *n == &*name && *p == proto)
    }

    /// Groups the virtual methods of the scope into sets that must share a name, ordered so
    /// that sets rooted higher in the hierarchy come first.
    fn link(&self, scope: &Scope) -> Vec<NameSet> {
        let g = self.g;
        let mut uf = UnionFind::new();
        let mut nodes: Vec<MethodId> = Vec::new();
        let mut node_of: HashMap<MethodId, usize> = HashMap::new();
        let mut pinned: HashSet<usize> = HashSet::new();
        let order = scope.hierarchy_order();

        for ty in &order {
            let Some(class) = scope.class(*ty) else { continue };
            for m in &class.vmethods {
                let n = uf.make_set();
                nodes.push(m.reference);
                node_of.insert(m.reference, n);
                if self.is_pinned(scope, *ty, m) {
                    pinned.insert(n);
                }
            }
        }

        let sig = |m: MethodId| {
            let d = g.method(m);
            (d.name, d.proto)
        };
        let find_virtual = |ty: TypeId, key: (StringId, ProtoId)| {
            scope
                .class(ty)
                .and_then(|c| c.vmethods.iter().find(|m| sig(m.reference) == key))
                .map(|m| m.reference)
        };

        for ty in &order {
            let Some(class) = scope.class(*ty) else { continue };
            let chain = scope.super_chain(*ty);
            let ifaces = scope.transitive_interfaces(*ty);
            for m in &class.vmethods {
                let key = sig(m.reference);
                let n = node_of[&m.reference];
                for sup in chain.iter().skip(1) {
                    if let Some(o) = find_virtual(*sup, key) {
                        uf.union(n, node_of[&o]);
                    }
                }
                for i in &ifaces {
                    if let Some(o) = find_virtual(*i, key) {
                        uf.union(n, node_of[&o]);
                    }
                }
            }
            // interface methods implemented by an inherited definition
            if !class.is_interface() {
                for i in &ifaces {
                    let Some(iface) = scope.class(*i) else { continue };
                    for im in &iface.vmethods {
                        let key = sig(im.reference);
                        if let Some(imp) = chain.iter().find_map(|t| find_virtual(*t, key)) {
                            uf.union(node_of[&imp], node_of[&im.reference]);
                        }
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, NameSet> = BTreeMap::new();
        let mut first_seen: Vec<usize> = Vec::new();
        for (n, m) in nodes.iter().enumerate() {
            let root = uf.find(n);
            let set = groups.entry(root).or_insert_with(|| {
                first_seen.push(root);
                NameSet { members: Vec::new(), proto: g.method(*m).proto, renamable: true }
            });
            set.members.push(*m);
            if pinned.contains(&n) {
                set.renamable = false;
            }
        }
        debug!("[renamer] {} virtual methods in {} sets", nodes.len(), groups.len());
        first_seen.into_iter().filter_map(|r| groups.remove(&r)).collect()
    }

    /// Every class whose methods could clash with a member of `set` after renaming.
    fn related_types(&self, scope: &Scope, children: &HashMap<TypeId, Vec<TypeId>>, set: &NameSet) -> BTreeSet<TypeId> {
        let g = self.g;
        let mut related = BTreeSet::new();
        for m in &set.members {
            let class = g.method(*m).class;
            let mut work = vec![class];
            while let Some(t) = work.pop() {
                if !related.insert(t) {
                    continue;
                }
                work.extend(children.get(&t).into_iter().flatten().copied());
            }
        }
        let below: Vec<TypeId> = related.iter().copied().collect();
        for t in below {
            related.extend(scope.super_chain(t));
            related.extend(scope.transitive_interfaces(t));
        }
        related
    }

    fn pick_name(
        &self,
        set: &NameSet,
        related: &BTreeSet<TypeId>,
        stack_traces: &StackTraceNames,
        start: u64,
    ) -> Result<(u64, StringId)> {
        let g = self.g;
        let members: HashSet<MethodId> = set.members.iter().copied().collect();
        for index in start..start + MAX_CANDIDATES {
            let candidate = name_for_index(index);
            let Some(existing) = g.get_string(&candidate) else {
                return Ok((index, g.make_string(&candidate)));
            };
            // any method known under this name and proto, definition or reference
            let clashes = related
                .iter()
                .any(|t| g.get_method(*t, existing, set.proto).map_or(false, |m| !members.contains(&m)));
            if clashes {
                continue;
            }
            if self.config.avoid_stack_trace_collision
                && set.members.iter().any(|m| stack_traces.is_live(g.method(*m).class, existing))
            {
                continue;
            }
            return Ok((index, existing));
        }
        Err(DexError::with_kind(ErrorKind::InternalError, "no free method name")
            .extra("method", g.show_method(set.members[0])))
    }

    /// The definition every method reference in code resolves to, for references that do
    /// not name a definition themselves.
    fn resolve_refs(&self, scope: &Scope) -> HashMap<MethodId, MethodId> {
        let g = self.g;
        let mut refs = HashMap::new();
        for class in scope.internal_classes() {
            for m in class.methods() {
                let Some(code) = m.code() else { continue };
                for (_, insn) in code.instructions() {
                    let Some(r) = insn.method() else { continue };
                    if refs.contains_key(&r) || scope.method_def(r, g).is_some() {
                        continue;
                    }
                    if let Some(def) = scope.resolve_method(g, r, MethodSearch::Any) {
                        if def != r {
                            refs.insert(r, def);
                        }
                    }
                }
            }
        }
        refs
    }

    /// Points references at the new names of the definitions they resolved to.
    fn rewrite_refs(&self, scope: &mut Scope, refs: &HashMap<MethodId, MethodId>) -> Result<usize> {
        let g = self.g;
        let mut renamed: HashMap<MethodId, MethodId> = HashMap::new();
        for (r, def) in refs {
            let (rd, dd) = (g.method(*r), g.method(*def));
            if rd.name != dd.name {
                renamed.insert(*r, g.make_method(rd.class, dd.name, rd.proto));
            }
        }
        if renamed.is_empty() {
            return Ok(0);
        }
        let mut count = 0;
        for class in scope.classes_mut().iter_mut().filter(|c| !c.external) {
            for m in class.methods_mut() {
                let Some(code) = m.code_mut(g)? else { continue };
                for id in code.ids() {
                    let Some(insn) = code.insn_mut(id) else { continue };
                    if let Some(new) = insn.method().and_then(|r| renamed.get(&r)) {
                        insn.set_method(*new);
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }
}

/// `true` when no class defines two methods with the same name and prototype.
pub fn has_unique_signatures(g: &Interner, scope: &Scope) -> bool {
    scope.classes().iter().all(|c| {
        let mut seen = HashSet::new();
        c.methods().all(|m| {
            let d = g.method(m.reference);
            seen.insert((d.name, d.proto))
        })
    })
}
