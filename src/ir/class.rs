//! Class, field and method definitions, and the `Scope` that owns them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bitflags::bitflags;
use log::warn;

use crate::dex::annotations::AnnotationSet;
use crate::dex::encoded_values::EncodedValue;
use crate::dex::loader::PendingCode;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::code::IRCode;
use crate::ir::interner::{FieldId, Interner, MethodId, StringId, TypeId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

#[derive(Debug, Clone)]
pub struct DexField {
    pub reference: FieldId,
    pub access: AccessFlags,
    pub annotations: Option<AnnotationSet>,
    pub static_value: Option<EncodedValue>,
}

impl DexField {
    pub fn new(reference: FieldId, access: AccessFlags) -> Self {
        DexField { reference, access, annotations: None, static_value: None }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug, Clone)]
pub struct DexMethod {
    pub reference: MethodId,
    pub access: AccessFlags,
    pub annotations: Option<AnnotationSet>,
    pub param_annotations: BTreeMap<u32, AnnotationSet>,
    code: Option<IRCode>,
    pending: Option<PendingCode>,
}

impl DexMethod {
    pub fn new(reference: MethodId, access: AccessFlags) -> Self {
        DexMethod {
            reference,
            access,
            annotations: None,
            param_annotations: BTreeMap::new(),
            code: None,
            pending: None,
        }
    }

    pub fn with_code(mut self, code: IRCode) -> Self {
        self.code = Some(code);
        self
    }

    pub(crate) fn with_pending(mut self, pending: PendingCode) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(AccessFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(AccessFlags::ABSTRACT)
    }

    pub fn is_constructor(&self, g: &Interner) -> bool {
        let name = g.string(g.method(self.reference).name);
        &*name == "<init>" || &*name == "<clinit>"
    }

    /// Virtual dispatch applies: not static, private or a constructor.
    pub fn is_virtual(&self, g: &Interner) -> bool {
        !self.access.intersects(AccessFlags::STATIC | AccessFlags::PRIVATE) && !self.is_constructor(g)
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some() || self.pending.is_some()
    }

    /// Already-materialized code, if any.
    pub fn code(&self) -> Option<&IRCode> {
        self.code.as_ref()
    }

    /// Materializes pending DEX code on first access.
    pub fn code_mut(&mut self, g: &Interner) -> Result<Option<&mut IRCode>> {
        if let Some(pending) = self.pending.take() {
            let code = pending
                .materialize(g)
                .map_err(|e| e.context(g.show_method(self.reference)))?;
            self.code = Some(code);
        }
        Ok(self.code.as_mut())
    }

    pub fn get_code(&mut self, g: &Interner) -> Result<Option<&IRCode>> {
        Ok(self.code_mut(g)?.map(|c| &*c))
    }

    pub fn set_code(&mut self, code: Option<IRCode>) {
        self.pending = None;
        self.code = code;
    }

    pub fn take_code(&mut self, g: &Interner) -> Result<Option<IRCode>> {
        self.code_mut(g)?;
        Ok(self.code.take())
    }

    pub fn has_annotation(&self, ty: TypeId) -> bool {
        self.annotations.as_ref().map_or(false, |s| s.contains(ty))
    }
}

#[derive(Debug, Clone)]
pub struct DexClass {
    pub ty: TypeId,
    pub super_class: Option<TypeId>,
    pub interfaces: Vec<TypeId>,
    pub access: AccessFlags,
    pub annotations: Option<AnnotationSet>,
    pub sfields: Vec<DexField>,
    pub ifields: Vec<DexField>,
    pub dmethods: Vec<DexMethod>,
    pub vmethods: Vec<DexMethod>,
    pub source_file: Option<StringId>,
    /// Which input the class came from (a DEX or JAR path).
    pub location: String,
    /// Loaded for reference resolution only; its members are not editable.
    pub external: bool,
}

impl DexClass {
    pub fn new(ty: TypeId, super_class: Option<TypeId>, access: AccessFlags) -> Self {
        DexClass {
            ty,
            super_class,
            interfaces: Vec::new(),
            access,
            annotations: None,
            sfields: Vec::new(),
            ifields: Vec::new(),
            dmethods: Vec::new(),
            vmethods: Vec::new(),
            source_file: None,
            location: String::new(),
            external: false,
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }

    pub fn is_annotation(&self) -> bool {
        self.access.contains(AccessFlags::ANNOTATION)
    }

    pub fn methods(&self) -> impl Iterator<Item = &DexMethod> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut DexMethod> {
        self.dmethods.iter_mut().chain(self.vmethods.iter_mut())
    }

    pub fn fields(&self) -> impl Iterator<Item = &DexField> {
        self.sfields.iter().chain(self.ifields.iter())
    }

    pub fn find_method(&self, m: MethodId) -> Option<&DexMethod> {
        self.methods().find(|d| d.reference == m)
    }

    pub fn find_method_mut(&mut self, m: MethodId) -> Option<&mut DexMethod> {
        self.methods_mut().find(|d| d.reference == m)
    }

    pub fn find_field(&self, f: FieldId) -> Option<&DexField> {
        self.fields().find(|d| d.reference == f)
    }

    /// Adds a method to the direct or virtual list, keeping name order unchanged.
    pub fn add_method(&mut self, g: &Interner, method: DexMethod) -> Result<()> {
        if self.find_method(method.reference).is_some() {
            return Err(DexError::with_kind(
                ErrorKind::DuplicateMethods,
                format!("duplicate method {}", g.show_method(method.reference)),
            )
            .extra("method", g.show_method(method.reference))
            .extra("class", g.descriptor(self.ty).to_string()));
        }
        if method.is_virtual(g) {
            self.vmethods.push(method);
        } else {
            self.dmethods.push(method);
        }
        Ok(())
    }
}

/// How `Scope::resolve_method` searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSearch {
    Direct,
    Static,
    Virtual,
    Super,
    Interface,
    Any,
}

impl MethodSearch {
    pub fn for_invoke(op: crate::ir::opcode::IROpcode) -> MethodSearch {
        use crate::ir::opcode::IROpcode::*;
        match op {
            InvokeDirect => MethodSearch::Direct,
            InvokeStatic => MethodSearch::Static,
            InvokeSuper => MethodSearch::Super,
            InvokeInterface => MethodSearch::Interface,
            InvokeVirtual => MethodSearch::Virtual,
            _ => MethodSearch::Any,
        }
    }
}

/// Every class of the program, internal and external, indexed by type.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    classes: Vec<DexClass>,
    by_type: HashMap<TypeId, usize>,
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    /// Adds an internal class; a second definition of the same type is fatal.
    pub fn add_class(&mut self, g: &Interner, class: DexClass) -> Result<()> {
        if let Some(ix) = self.by_type.get(&class.ty) {
            let existing = &self.classes[*ix];
            if existing.external && !class.external {
                // An input definition shadows a library one.
                self.classes[*ix] = class;
                return Ok(());
            }
            let name = g.descriptor(class.ty).to_string();
            return Err(DexError::with_kind(ErrorKind::DuplicateClasses, format!("duplicate class {}", name))
                .extra("class", name)
                .extra("dex1", existing.location.clone())
                .extra("dex2", class.location.clone()));
        }
        self.by_type.insert(class.ty, self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    /// Adds a library class; duplicates keep the first definition.
    pub fn add_external_class(&mut self, g: &Interner, class: DexClass, whitelisted: bool) -> bool {
        if let Some(ix) = self.by_type.get(&class.ty) {
            if !whitelisted {
                warn!(
                    "[jar] duplicate class {} in {} (first seen in {}); keeping the first",
                    g.descriptor(class.ty),
                    class.location,
                    self.classes[*ix].location
                );
            }
            return false;
        }
        self.by_type.insert(class.ty, self.classes.len());
        self.classes.push(class);
        true
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[DexClass] {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut [DexClass] {
        &mut self.classes
    }

    pub fn internal_classes(&self) -> impl Iterator<Item = &DexClass> {
        self.classes.iter().filter(|c| !c.external)
    }

    pub fn class(&self, ty: TypeId) -> Option<&DexClass> {
        self.by_type.get(&ty).map(|ix| &self.classes[*ix])
    }

    pub fn class_mut(&mut self, ty: TypeId) -> Option<&mut DexClass> {
        match self.by_type.get(&ty) {
            Some(ix) => Some(&mut self.classes[*ix]),
            None => None,
        }
    }

    pub fn is_external(&self, ty: TypeId) -> bool {
        self.class(ty).map_or(true, |c| c.external)
    }

    pub fn method_def(&self, m: MethodId, g: &Interner) -> Option<&DexMethod> {
        self.class(g.method(m).class).and_then(|c| c.find_method(m))
    }

    pub fn method_def_mut(&mut self, m: MethodId, g: &Interner) -> Option<&mut DexMethod> {
        let owner = g.method(m).class;
        self.class_mut(owner).and_then(|c| c.find_method_mut(m))
    }

    pub fn field_def(&self, f: FieldId, g: &Interner) -> Option<&DexField> {
        self.class(g.field(f).class).and_then(|c| c.find_field(f))
    }

    /// `ty`, its superclass, and so on, as far as definitions are known.
    pub fn super_chain(&self, ty: TypeId) -> Vec<TypeId> {
        let mut chain = vec![ty];
        let mut cur = ty;
        while let Some(sup) = self.class(cur).and_then(|c| c.super_class) {
            if chain.contains(&sup) {
                break;
            }
            chain.push(sup);
            cur = sup;
        }
        chain
    }

    /// All interfaces implemented by `ty`, directly, through superclasses or through
    /// super-interfaces.
    pub fn transitive_interfaces(&self, ty: TypeId) -> BTreeSet<TypeId> {
        let mut out = BTreeSet::new();
        let mut work: VecDeque<TypeId> = VecDeque::new();
        for t in self.super_chain(ty) {
            if let Some(c) = self.class(t) {
                work.extend(c.interfaces.iter().copied());
            }
        }
        while let Some(i) = work.pop_front() {
            if out.insert(i) {
                if let Some(c) = self.class(i) {
                    work.extend(c.interfaces.iter().copied());
                }
            }
        }
        out
    }

    pub fn is_subclass(&self, parent: TypeId, child: TypeId) -> bool {
        self.super_chain(child).contains(&parent)
    }

    /// Direct subclasses (for classes) or direct sub-interfaces and implementors (for interfaces).
    pub fn children_index(&self) -> HashMap<TypeId, Vec<TypeId>> {
        let mut children: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for c in &self.classes {
            if let Some(sup) = c.super_class {
                children.entry(sup).or_default().push(c.ty);
            }
            for i in &c.interfaces {
                children.entry(*i).or_default().push(c.ty);
            }
        }
        children
    }

    /// Non-interface classes that implement `iface`.
    pub fn implementors(&self, iface: TypeId) -> Vec<TypeId> {
        self.classes
            .iter()
            .filter(|c| !c.is_interface() && self.transitive_interfaces(c.ty).contains(&iface))
            .map(|c| c.ty)
            .collect()
    }

    /// Classes ordered so that every class comes after its superclass and interfaces.
    pub fn hierarchy_order(&self) -> Vec<TypeId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::with_capacity(self.classes.len());
        for c in &self.classes {
            self.visit_hierarchy(c.ty, &mut visited, &mut order);
        }
        order
    }

    fn visit_hierarchy(&self, ty: TypeId, visited: &mut BTreeSet<TypeId>, order: &mut Vec<TypeId>) {
        if !visited.insert(ty) {
            return;
        }
        if let Some(c) = self.class(ty) {
            if let Some(sup) = c.super_class {
                self.visit_hierarchy(sup, visited, order);
            }
            for i in &c.interfaces {
                self.visit_hierarchy(*i, visited, order);
            }
            order.push(ty);
        }
    }

    /// Finds the definition a method reference dispatches to statically.
    pub fn resolve_method(&self, g: &Interner, mref: MethodId, search: MethodSearch) -> Option<MethodId> {
        let data = g.method(mref);
        let matches = |m: &DexMethod| {
            let d = g.method(m.reference);
            d.name == data.name && d.proto == data.proto
        };
        let start = match search {
            MethodSearch::Super => self.class(data.class).and_then(|c| c.super_class)?,
            _ => data.class,
        };
        if search == MethodSearch::Direct {
            return self.class(start)?.dmethods.iter().find(|m| matches(m)).map(|m| m.reference);
        }
        for t in self.super_chain(start) {
            let Some(c) = self.class(t) else { break };
            let found = match search {
                MethodSearch::Static => c.dmethods.iter().find(|m| m.is_static() && matches(m)),
                MethodSearch::Virtual | MethodSearch::Super | MethodSearch::Interface => {
                    c.vmethods.iter().find(|m| matches(m))
                }
                _ => c.methods().find(|m| matches(m)),
            };
            if let Some(m) = found {
                return Some(m.reference);
            }
        }
        if matches!(search, MethodSearch::Interface | MethodSearch::Virtual | MethodSearch::Any) {
            for i in self.transitive_interfaces(start) {
                if let Some(m) = self.class(i).and_then(|c| c.vmethods.iter().find(|m| matches(m))) {
                    return Some(m.reference);
                }
            }
        }
        None
    }

    pub fn resolve_field(&self, g: &Interner, fref: FieldId, is_static: bool) -> Option<FieldId> {
        let data = g.field(fref);
        for t in self.super_chain(data.class) {
            let c = self.class(t)?;
            let list = if is_static { &c.sfields } else { &c.ifields };
            if let Some(f) = list.iter().find(|f| {
                let d = g.field(f.reference);
                d.name == data.name && d.ty == data.ty
            }) {
                return Some(f.reference);
            }
        }
        None
    }

    /// Materializes every pending method body, in parallel over classes.
    pub fn materialize_all(&mut self, g: &Interner) -> Result<()> {
        use rayon::prelude::*;
        self.classes
            .par_iter_mut()
            .filter(|c| !c.external)
            .try_for_each(|c| -> Result<()> {
                for m in c.methods_mut() {
                    m.code_mut(g)?;
                }
                Ok(())
            })
    }
}

/// Classes grouped by the DEX file they are written to.
#[derive(Debug, Clone, Default)]
pub struct DexStore {
    pub dexes: Vec<(String, Vec<TypeId>)>,
}

impl DexStore {
    pub fn all(&self) -> impl Iterator<Item = &TypeId> {
        self.dexes.iter().flat_map(|(_, v)| v.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(g: &Interner, name: &str, sup: Option<&str>, ifaces: &[&str], access: AccessFlags) -> DexClass {
        let mut c = DexClass::new(g.make_type(name), sup.map(|s| g.make_type(s)), access);
        c.interfaces = ifaces.iter().map(|i| g.make_type(i)).collect();
        c
    }

    #[test]
    fn test_duplicate_class_reports_locations() {
        let g = Interner::new();
        let mut scope = Scope::new();
        let mut a = class(&g, "LA;", None, &[], AccessFlags::PUBLIC);
        a.location = "classes.dex".into();
        let mut b = a.clone();
        b.location = "classes2.dex".into();
        scope.add_class(&g, a).unwrap();
        let e = scope.add_class(&g, b).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DuplicateClasses);
        assert_eq!(e.extra_info()["class"], "LA;");
        assert_eq!(e.extra_info()["dex1"], "classes.dex");
        assert_eq!(e.extra_info()["dex2"], "classes2.dex");
    }

    #[test]
    fn test_hierarchy_queries() {
        let g = Interner::new();
        let mut scope = Scope::new();
        scope.add_class(&g, class(&g, "LB;", Some("LA;"), &["LJ;"], AccessFlags::PUBLIC)).unwrap();
        scope.add_class(&g, class(&g, "LA;", None, &["LI;"], AccessFlags::PUBLIC)).unwrap();
        scope
            .add_class(&g, class(&g, "LI;", None, &[], AccessFlags::INTERFACE | AccessFlags::ABSTRACT))
            .unwrap();
        scope
            .add_class(&g, class(&g, "LJ;", None, &["LI;"], AccessFlags::INTERFACE | AccessFlags::ABSTRACT))
            .unwrap();
        let b = g.make_type("LB;");
        let a = g.make_type("LA;");
        let i = g.make_type("LI;");
        assert_eq!(scope.super_chain(b), vec![b, a]);
        assert_eq!(scope.transitive_interfaces(b).len(), 2);
        let order = scope.hierarchy_order();
        let pos = |t| order.iter().position(|x| *x == t).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(i) < pos(a));
        assert_eq!(scope.implementors(i), vec![b, a]);
    }

    #[test]
    fn test_resolve_virtual_through_super() {
        let g = Interner::new();
        let mut scope = Scope::new();
        let mut a = class(&g, "LA;", None, &[], AccessFlags::PUBLIC);
        let def = g.make_method_from_str("LA;.f:()V").unwrap();
        a.add_method(&g, DexMethod::new(def, AccessFlags::PUBLIC)).unwrap();
        scope.add_class(&g, a).unwrap();
        scope.add_class(&g, class(&g, "LB;", Some("LA;"), &[], AccessFlags::PUBLIC)).unwrap();
        let r = g.make_method_from_str("LB;.f:()V").unwrap();
        assert_eq!(scope.resolve_method(&g, r, MethodSearch::Virtual), Some(def));
        assert_eq!(scope.resolve_method(&g, r, MethodSearch::Direct), None);
    }
}
