//! Hash-consed tables for every symbol the IR refers to.
//!
//! Ids are plain indices; two ids of the same kind are equal exactly when their structural keys
//! are equal. Entries are never removed. The only in-place update is `rename_method`, which
//! rewrites a method ref's name (and its lookup key) for the renamer.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use crate::dex::encoded_values::EncodedValue;
use crate::error::{DexError, Result};
use crate::ir::types;

macro_rules! interned_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
            pub struct $name(u32);

            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl From<u32> for $name {
                fn from(raw: u32) -> Self {
                    $name(raw)
                }
            }
        )*
    };
}

interned_id!(
    /// A MUTF-8 string, stored decoded.
    StringId,
    /// A type descriptor.
    TypeId,
    ProtoId,
    FieldId,
    MethodId,
    MethodHandleId,
    CallSiteId,
);

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProtoData {
    pub rtype: TypeId,
    pub args: Arc<[TypeId]>,
    pub shorty: StringId,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldData {
    pub class: TypeId,
    pub name: StringId,
    pub ty: TypeId,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MethodData {
    pub class: TypeId,
    pub name: StringId,
    pub proto: ProtoId,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum MethodHandleKind {
    StaticPut = 0,
    StaticGet = 1,
    InstancePut = 2,
    InstanceGet = 3,
    InvokeStatic = 4,
    InvokeInstance = 5,
    InvokeConstructor = 6,
    InvokeDirect = 7,
    InvokeInterface = 8,
}

impl MethodHandleKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => MethodHandleKind::StaticPut,
            1 => MethodHandleKind::StaticGet,
            2 => MethodHandleKind::InstancePut,
            3 => MethodHandleKind::InstanceGet,
            4 => MethodHandleKind::InvokeStatic,
            5 => MethodHandleKind::InvokeInstance,
            6 => MethodHandleKind::InvokeConstructor,
            7 => MethodHandleKind::InvokeDirect,
            8 => MethodHandleKind::InvokeInterface,
            _ => return None,
        })
    }

    pub fn is_invoke(self) -> bool {
        self as u16 >= MethodHandleKind::InvokeStatic as u16
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MethodHandleTarget {
    Method(MethodId),
    Field(FieldId),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MethodHandleData {
    pub kind: MethodHandleKind,
    pub target: MethodHandleTarget,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CallSiteData {
    pub bootstrap: MethodHandleId,
    pub name: StringId,
    pub proto: ProtoId,
    pub args: Vec<EncodedValue>,
}

/// Outcome of `Interner::rename_method` when the new key is already taken.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RenameCollision(pub MethodId);

struct Table<K> {
    lookup: DashMap<K, u32>,
    entries: RwLock<Vec<K>>,
}

impl<K: Eq + Hash + Clone> Table<K> {
    fn new() -> Self {
        Table {
            lookup: DashMap::new(),
            entries: RwLock::new(Vec::new()),
        }
    }

    fn intern(&self, key: K) -> u32 {
        if let Some(id) = self.lookup.get(&key) {
            return *id;
        }
        // The entries lock is always taken last, after the shard lock, and never the other way
        // round.
        match self.lookup.entry(key) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(v) => {
                let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
                let id = entries.len() as u32;
                entries.push(v.key().clone());
                v.insert(id);
                id
            }
        }
    }

    fn find(&self, key: &K) -> Option<u32> {
        self.lookup.get(key).map(|r| *r)
    }

    fn get(&self, id: u32) -> K {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries[id as usize].clone()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn replace(&self, id: u32, key: K) -> std::result::Result<(), u32> {
        let old = self.get(id);
        if old == key {
            return Ok(());
        }
        match self.lookup.entry(key.clone()) {
            Entry::Occupied(e) => return Err(*e.get()),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        self.lookup.remove(&old);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries[id as usize] = key;
        Ok(())
    }
}

/// Symbol tables for one run. `Interner::global()` is the process-wide instance used by the
/// driver; tests build their own with `Interner::new()` to get fresh state.
pub struct Interner {
    strings: Table<Arc<str>>,
    types: Table<StringId>,
    protos: Table<ProtoData>,
    fields: Table<FieldData>,
    methods: Table<MethodData>,
    method_handles: Table<MethodHandleData>,
    call_sites: Table<CallSiteData>,
}

static GLOBAL: Lazy<Arc<Interner>> = Lazy::new(|| Arc::new(Interner::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternerStats {
    pub strings: usize,
    pub types: usize,
    pub protos: usize,
    pub fields: usize,
    pub methods: usize,
    pub method_handles: usize,
    pub call_sites: usize,
}

impl Default for Interner {
    fn default() -> Self {
        Interner::new()
    }
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            strings: Table::new(),
            types: Table::new(),
            protos: Table::new(),
            fields: Table::new(),
            methods: Table::new(),
            method_handles: Table::new(),
            call_sites: Table::new(),
        }
    }

    pub fn global() -> Arc<Interner> {
        GLOBAL.clone()
    }

    pub fn stats(&self) -> InternerStats {
        InternerStats {
            strings: self.strings.len(),
            types: self.types.len(),
            protos: self.protos.len(),
            fields: self.fields.len(),
            methods: self.methods.len(),
            method_handles: self.method_handles.len(),
            call_sites: self.call_sites.len(),
        }
    }

    // Strings

    pub fn make_string(&self, s: &str) -> StringId {
        StringId(self.strings.intern(Arc::from(s)))
    }

    pub fn get_string(&self, s: &str) -> Option<StringId> {
        self.strings.find(&Arc::from(s)).map(StringId)
    }

    pub fn string(&self, id: StringId) -> Arc<str> {
        self.strings.get(id.0)
    }

    // Types

    pub fn make_type(&self, descriptor: &str) -> TypeId {
        let name = self.make_string(descriptor);
        TypeId(self.types.intern(name))
    }

    pub fn get_type(&self, descriptor: &str) -> Option<TypeId> {
        let name = self.get_string(descriptor)?;
        self.types.find(&name).map(TypeId)
    }

    pub fn type_name(&self, id: TypeId) -> StringId {
        self.types.get(id.0)
    }

    pub fn descriptor(&self, id: TypeId) -> Arc<str> {
        self.string(self.type_name(id))
    }

    // Prototypes

    pub fn make_proto(&self, rtype: TypeId, args: &[TypeId]) -> ProtoId {
        let mut shorty = String::with_capacity(args.len() + 1);
        shorty.push(types::shorty_char(&self.descriptor(rtype)));
        for a in args {
            shorty.push(types::shorty_char(&self.descriptor(*a)));
        }
        let shorty = self.make_string(&shorty);
        ProtoId(self.protos.intern(ProtoData {
            rtype,
            args: Arc::from(args),
            shorty,
        }))
    }

    pub fn proto(&self, id: ProtoId) -> ProtoData {
        self.protos.get(id.0)
    }

    /// Parses `(IJLjava/lang/String;)V`.
    pub fn make_proto_from_descriptor(&self, descriptor: &str) -> Result<ProtoId> {
        let (args, rtype) = types::split_method_descriptor(descriptor)?;
        let args: Vec<TypeId> = args.iter().map(|a| self.make_type(a)).collect();
        Ok(self.make_proto(self.make_type(rtype), &args))
    }

    // Fields

    pub fn make_field(&self, class: TypeId, name: StringId, ty: TypeId) -> FieldId {
        FieldId(self.fields.intern(FieldData { class, name, ty }))
    }

    pub fn get_field(&self, class: TypeId, name: StringId, ty: TypeId) -> Option<FieldId> {
        self.fields.find(&FieldData { class, name, ty }).map(FieldId)
    }

    pub fn field(&self, id: FieldId) -> FieldData {
        self.fields.get(id.0)
    }

    /// Parses `LFoo;.name:I`.
    pub fn make_field_from_str(&self, s: &str) -> Result<FieldId> {
        let (class, rest) = split_member(s)?;
        let (name, ty) = rest
            .split_once(':')
            .ok_or_else(|| DexError::new(format!("malformed field reference {}", s)))?;
        Ok(self.make_field(self.make_type(class), self.make_string(name), self.make_type(ty)))
    }

    // Methods

    pub fn make_method(&self, class: TypeId, name: StringId, proto: ProtoId) -> MethodId {
        MethodId(self.methods.intern(MethodData { class, name, proto }))
    }

    pub fn get_method(&self, class: TypeId, name: StringId, proto: ProtoId) -> Option<MethodId> {
        self.methods.find(&MethodData { class, name, proto }).map(MethodId)
    }

    pub fn method(&self, id: MethodId) -> MethodData {
        self.methods.get(id.0)
    }

    /// Parses `LFoo;.bar:(I)V`.
    pub fn make_method_from_str(&self, s: &str) -> Result<MethodId> {
        let (class, rest) = split_member(s)?;
        let (name, proto) = rest
            .split_once(':')
            .ok_or_else(|| DexError::new(format!("malformed method reference {}", s)))?;
        let proto = self.make_proto_from_descriptor(proto)?;
        Ok(self.make_method(self.make_type(class), self.make_string(name), proto))
    }

    /// Rewrites the name of an existing method ref in place. Every holder of `id` observes the
    /// new name. Fails if a ref with the new key already exists.
    pub fn rename_method(&self, id: MethodId, name: StringId) -> std::result::Result<(), RenameCollision> {
        let mut data = self.method(id);
        data.name = name;
        self.methods
            .replace(id.0, data)
            .map_err(|existing| RenameCollision(MethodId(existing)))
    }

    // Method handles and call sites

    pub fn make_method_handle(&self, kind: MethodHandleKind, target: MethodHandleTarget) -> MethodHandleId {
        MethodHandleId(self.method_handles.intern(MethodHandleData { kind, target }))
    }

    pub fn method_handle(&self, id: MethodHandleId) -> MethodHandleData {
        self.method_handles.get(id.0)
    }

    pub fn make_call_site(&self, data: CallSiteData) -> CallSiteId {
        CallSiteId(self.call_sites.intern(data))
    }

    pub fn call_site(&self, id: CallSiteId) -> CallSiteData {
        self.call_sites.get(id.0)
    }

    // Display

    pub fn show_proto(&self, id: ProtoId) -> String {
        let p = self.proto(id);
        let mut s = String::from("(");
        for a in p.args.iter() {
            s.push_str(&self.descriptor(*a));
        }
        s.push(')');
        s.push_str(&self.descriptor(p.rtype));
        s
    }

    pub fn show_method(&self, id: MethodId) -> String {
        let m = self.method(id);
        format!("{}.{}:{}", self.descriptor(m.class), self.string(m.name), self.show_proto(m.proto))
    }

    pub fn show_field(&self, id: FieldId) -> String {
        let f = self.field(id);
        format!("{}.{}:{}", self.descriptor(f.class), self.string(f.name), self.descriptor(f.ty))
    }
}

fn split_member(s: &str) -> Result<(&str, &str)> {
    // The class descriptor ends at the first ";." (arrays of classes never own members).
    match s.find(";.") {
        Some(ix) => Ok((&s[..ix + 1], &s[ix + 2..])),
        None => Err(DexError::new(format!("malformed member reference {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_hash_consing() {
        let g = Interner::new();
        let a = g.make_type("Ljava/lang/Object;");
        let b = g.make_type("Ljava/lang/Object;");
        assert_eq!(a, b);
        assert_eq!(&*g.descriptor(a), "Ljava/lang/Object;");

        let m1 = g.make_method_from_str("LFoo;.bar:(IJ)V").unwrap();
        let m2 = g.make_method_from_str("LFoo;.bar:(IJ)V").unwrap();
        assert_eq!(m1, m2);
        assert_eq!(g.show_method(m1), "LFoo;.bar:(IJ)V");
        assert_eq!(&*g.string(g.proto(g.method(m1).proto).shorty), "VIJ");
        assert!(g.get_type("LMissing;").is_none());
    }

    #[test]
    fn test_rename_method() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.bar:()V").unwrap();
        let other = g.make_method_from_str("LFoo;.baz:()V").unwrap();
        g.rename_method(m, g.make_string("A")).unwrap();
        assert_eq!(g.show_method(m), "LFoo;.A:()V");
        assert_eq!(g.make_method_from_str("LFoo;.A:()V").unwrap(), m);
        // the old key is free again
        assert_ne!(g.make_method_from_str("LFoo;.bar:()V").unwrap(), m);
        assert_eq!(g.rename_method(m, g.make_string("baz")), Err(RenameCollision(other)));
    }

    #[test]
    fn test_concurrent_interning() {
        let g = Arc::new(Interner::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let g = g.clone();
                thread::spawn(move || {
                    (0..200).map(|i| g.make_type(&format!("LC{};", (i + t) % 50))).collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            for id in h.join().unwrap() {
                let d = g.descriptor(id);
                assert_eq!(g.make_type(&d), id);
            }
        }
        assert_eq!(g.stats().types, 50);
    }
}
