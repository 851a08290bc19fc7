//! Serializes a set of classes into one DEX file.
//!
//! Layout: header, id tables, then the data section (string data, type lists, annotations,
//! encoded arrays, debug info, code, class data) and finally the map list. Every data item
//! is placed before anything that points at it, so offsets are known when they are needed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use adler::adler32_slice;
use log::{debug, info};
use rayon::prelude::*;
use sha1::{Digest, Sha1};

use crate::dex::annotations::{AnnotationSet, AnnotationSetItem, AnnotationSetRefList, AnnotationsDirectoryItem, MemberAnnotations};
use crate::dex::dex_file::*;
use crate::dex::encoded_values::{write_encoded_array, EncodedValue};
use crate::dex::lowering::{LoweredCode, Lowering};
use crate::dex::mutf8::write_string_data;
use crate::dex::{write_u2, write_u4, IndexResolver, RefVisitor};
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::class::{DexClass, DexMethod};
use crate::ir::code::{DexDebugInstruction, IRCode, MethodItemEntry};
use crate::ir::instruction::Operand;
use crate::ir::interner::{
    CallSiteId, FieldId, Interner, MethodHandleId, MethodHandleTarget, MethodId, ProtoId, StringId, TypeId,
};
use crate::ir::opcode::IROpcode;

/// Gathers every symbol the output references, following ids into their components.
struct PoolCollector<'g> {
    g: &'g Interner,
    strings: HashSet<StringId>,
    types: HashSet<TypeId>,
    protos: HashSet<ProtoId>,
    fields: HashSet<FieldId>,
    methods: HashSet<MethodId>,
    method_handles: HashSet<MethodHandleId>,
    call_sites: HashSet<CallSiteId>,
}

impl RefVisitor for PoolCollector<'_> {
    fn visit_string(&mut self, id: StringId) {
        self.strings.insert(id);
    }

    fn visit_type(&mut self, id: TypeId) {
        if self.types.insert(id) {
            self.visit_string(self.g.type_name(id));
        }
    }

    fn visit_proto(&mut self, id: ProtoId) {
        if self.protos.insert(id) {
            let p = self.g.proto(id);
            self.visit_string(p.shorty);
            self.visit_type(p.rtype);
            for a in p.args.iter() {
                self.visit_type(*a);
            }
        }
    }

    fn visit_field(&mut self, id: FieldId) {
        if self.fields.insert(id) {
            let f = self.g.field(id);
            self.visit_type(f.class);
            self.visit_string(f.name);
            self.visit_type(f.ty);
        }
    }

    fn visit_method(&mut self, id: MethodId) {
        if self.methods.insert(id) {
            let m = self.g.method(id);
            self.visit_type(m.class);
            self.visit_string(m.name);
            self.visit_proto(m.proto);
        }
    }

    fn visit_method_handle(&mut self, id: MethodHandleId) {
        if self.method_handles.insert(id) {
            match self.g.method_handle(id).target {
                MethodHandleTarget::Method(m) => self.visit_method(m),
                MethodHandleTarget::Field(f) => self.visit_field(f),
            }
        }
    }

    fn visit_call_site(&mut self, id: CallSiteId) {
        if self.call_sites.insert(id) {
            let cs = self.g.call_site(id);
            self.visit_method_handle(cs.bootstrap);
            self.visit_string(cs.name);
            self.visit_proto(cs.proto);
            for a in &cs.args {
                a.visit_refs(self);
            }
        }
    }
}

impl<'g> PoolCollector<'g> {
    fn new(g: &'g Interner) -> Self {
        PoolCollector {
            g,
            strings: HashSet::new(),
            types: HashSet::new(),
            protos: HashSet::new(),
            fields: HashSet::new(),
            methods: HashSet::new(),
            method_handles: HashSet::new(),
            call_sites: HashSet::new(),
        }
    }

    fn visit_code(&mut self, code: &IRCode) {
        for (_, entry) in code.iter() {
            match entry {
                MethodItemEntry::Opcode(insn) => match insn.operand() {
                    Operand::String(s) => self.visit_string(*s),
                    Operand::Type(t) => self.visit_type(*t),
                    Operand::Field(f) => self.visit_field(*f),
                    Operand::Method(m) => self.visit_method(*m),
                    Operand::MethodAndProto(m, p) => {
                        self.visit_method(*m);
                        self.visit_proto(*p);
                    }
                    Operand::Proto(p) => self.visit_proto(*p),
                    Operand::CallSite(c) => self.visit_call_site(*c),
                    Operand::MethodHandle(h) => self.visit_method_handle(*h),
                    Operand::None | Operand::Literal(_) | Operand::Data(_) => {}
                },
                MethodItemEntry::Catch(c) => {
                    if let Some(t) = c.catch_type {
                        self.visit_type(t);
                    }
                }
                MethodItemEntry::Position(p) => {
                    if let Some(f) = p.file {
                        self.visit_string(f);
                    }
                }
                MethodItemEntry::Debug(DexDebugInstruction::StartLocal { name, ty, sig, .. }) => {
                    for s in [name, sig].into_iter().flatten() {
                        self.visit_string(*s);
                    }
                    if let Some(t) = ty {
                        self.visit_type(*t);
                    }
                }
                _ => {}
            }
        }
        for s in code.param_names.iter().flatten() {
            self.visit_string(*s);
        }
    }

    fn visit_annotations(&mut self, set: &Option<AnnotationSet>) {
        if let Some(set) = set {
            set.visit_refs(self);
        }
    }
}

/// Final index of every pooled symbol.
#[derive(Debug, Default)]
struct Indices {
    strings: Vec<StringId>,
    types: Vec<TypeId>,
    protos: Vec<ProtoId>,
    fields: Vec<FieldId>,
    methods: Vec<MethodId>,
    method_handles: Vec<MethodHandleId>,
    call_sites: Vec<CallSiteId>,
    string_idx: HashMap<StringId, u32>,
    type_idx: HashMap<TypeId, u32>,
    proto_idx: HashMap<ProtoId, u32>,
    field_idx: HashMap<FieldId, u32>,
    method_idx: HashMap<MethodId, u32>,
    method_handle_idx: HashMap<MethodHandleId, u32>,
    call_site_idx: HashMap<CallSiteId, u32>,
}

fn positions<K: Copy + Eq + std::hash::Hash>(v: &[K]) -> HashMap<K, u32> {
    v.iter().enumerate().map(|(i, k)| (*k, i as u32)).collect()
}

fn missing(what: &str, id: impl std::fmt::Debug) -> DexError {
    DexError::with_kind(ErrorKind::InternalError, format!("{} {:?} missing from the output pools", what, id))
}

impl Indices {
    /// Sorts the pools the way the DEX format requires.
    fn build(g: &Interner, c: PoolCollector) -> Indices {
        let mut ix = Indices::default();

        let mut strings: Vec<(Vec<u16>, StringId)> =
            c.strings.into_iter().map(|s| (g.string(s).encode_utf16().collect(), s)).collect();
        strings.sort();
        ix.strings = strings.into_iter().map(|(_, s)| s).collect();
        ix.string_idx = positions(&ix.strings);

        let mut types: Vec<TypeId> = c.types.into_iter().collect();
        types.sort_by_key(|t| ix.string_idx[&g.type_name(*t)]);
        ix.types = types;
        ix.type_idx = positions(&ix.types);

        let mut protos: Vec<ProtoId> = c.protos.into_iter().collect();
        protos.sort_by_key(|p| {
            let d = g.proto(*p);
            (ix.type_idx[&d.rtype], d.args.iter().map(|a| ix.type_idx[a]).collect::<Vec<_>>())
        });
        ix.protos = protos;
        ix.proto_idx = positions(&ix.protos);

        let mut fields: Vec<FieldId> = c.fields.into_iter().collect();
        fields.sort_by_key(|f| {
            let d = g.field(*f);
            (ix.type_idx[&d.class], ix.string_idx[&d.name], ix.type_idx[&d.ty])
        });
        ix.fields = fields;
        ix.field_idx = positions(&ix.fields);

        let mut methods: Vec<MethodId> = c.methods.into_iter().collect();
        methods.sort_by_key(|m| {
            let d = g.method(*m);
            (ix.type_idx[&d.class], ix.string_idx[&d.name], ix.proto_idx[&d.proto])
        });
        ix.methods = methods;
        ix.method_idx = positions(&ix.methods);

        let mut handles: Vec<MethodHandleId> = c.method_handles.into_iter().collect();
        handles.sort_by_key(|h| {
            let d = g.method_handle(*h);
            let target = match d.target {
                MethodHandleTarget::Method(m) => ix.method_idx[&m],
                MethodHandleTarget::Field(f) => ix.field_idx[&f],
            };
            (d.kind as u16, target)
        });
        ix.method_handles = handles;
        ix.method_handle_idx = positions(&ix.method_handles);

        let mut call_sites: Vec<CallSiteId> = c.call_sites.into_iter().collect();
        call_sites.sort();
        ix.call_sites = call_sites;
        ix.call_site_idx = positions(&ix.call_sites);
        ix
    }
}

impl IndexResolver for Indices {
    fn string_idx(&self, id: StringId) -> Result<u32> {
        self.string_idx.get(&id).copied().ok_or_else(|| missing("string", id))
    }

    fn type_idx(&self, id: TypeId) -> Result<u32> {
        self.type_idx.get(&id).copied().ok_or_else(|| missing("type", id))
    }

    fn proto_idx(&self, id: ProtoId) -> Result<u32> {
        self.proto_idx.get(&id).copied().ok_or_else(|| missing("proto", id))
    }

    fn field_idx(&self, id: FieldId) -> Result<u32> {
        self.field_idx.get(&id).copied().ok_or_else(|| missing("field", id))
    }

    fn method_idx(&self, id: MethodId) -> Result<u32> {
        self.method_idx.get(&id).copied().ok_or_else(|| missing("method", id))
    }

    fn method_handle_idx(&self, id: MethodHandleId) -> Result<u32> {
        self.method_handle_idx.get(&id).copied().ok_or_else(|| missing("method handle", id))
    }

    fn call_site_idx(&self, id: CallSiteId) -> Result<u32> {
        self.call_site_idx.get(&id).copied().ok_or_else(|| missing("call site", id))
    }
}

/// The data section under construction. Offsets handed out are absolute.
struct DataSection {
    base: u32,
    bytes: Vec<u8>,
    /// item type -> (count, first offset)
    sections: BTreeMap<u16, (u32, u32)>,
}

impl DataSection {
    fn new(base: u32) -> Self {
        DataSection { base, bytes: Vec::new(), sections: BTreeMap::new() }
    }

    fn push(&mut self, ty: u16, align: usize, item: &[u8]) -> u32 {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
        let off = self.base + self.bytes.len() as u32;
        self.bytes.extend_from_slice(item);
        let entry = self.sections.entry(ty).or_insert((0, off));
        entry.0 += 1;
        off
    }

    fn map_items(&self) -> impl Iterator<Item = MapItem> + '_ {
        self.sections.iter().map(|(ty, (size, offset))| MapItem { ty: *ty, size: *size, offset: *offset })
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Serializes classes to DEX bytes.
pub struct DexWriter<'g> {
    g: &'g Interner,
}

impl<'g> DexWriter<'g> {
    pub fn new(g: &'g Interner) -> Self {
        DexWriter { g }
    }

    pub fn write_to_file(&self, classes: &[DexClass], path: &Path) -> Result<()> {
        let bytes = self.write(classes)?;
        std::fs::write(path, &bytes)
            .map_err(|e| DexError::new(format!("cannot write {}: {}", path.display(), e)))?;
        info!("[writer] wrote {} ({} classes, {} bytes)", path.display(), classes.len(), bytes.len());
        Ok(())
    }

    /// Code of `m`, lifting a not yet materialized body on a copy.
    fn method_code(&self, m: &DexMethod) -> Result<Option<IRCode>> {
        if let Some(code) = m.code() {
            return Ok(Some(code.clone()));
        }
        if !m.has_code() {
            return Ok(None);
        }
        m.clone().take_code(self.g)
    }

    pub fn write(&self, classes: &[DexClass]) -> Result<Vec<u8>> {
        let g = self.g;
        let order = class_order(classes);

        // method bodies, lifted once; pending code is materialized in parallel
        let bodies: Vec<Vec<(MethodId, bool, Option<IRCode>)>> = order
            .par_iter()
            .map(|&ci| {
                classes[ci]
                    .methods()
                    .map(|m| Ok((m.reference, m.is_static(), self.method_code(m)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut pools = PoolCollector::new(g);
        for (k, &ci) in order.iter().enumerate() {
            let c = &classes[ci];
            pools.visit_type(c.ty);
            if let Some(s) = c.super_class {
                pools.visit_type(s);
            }
            for i in &c.interfaces {
                pools.visit_type(*i);
            }
            if let Some(f) = c.source_file {
                pools.visit_string(f);
            }
            pools.visit_annotations(&c.annotations);
            for f in c.fields() {
                pools.visit_field(f.reference);
                pools.visit_annotations(&f.annotations);
                if let Some(v) = &f.static_value {
                    v.visit_refs(&mut pools);
                }
            }
            for m in c.methods() {
                pools.visit_method(m.reference);
                pools.visit_annotations(&m.annotations);
                for set in m.param_annotations.values() {
                    set.visit_refs(&mut pools);
                }
            }
            for (_, _, code) in &bodies[k] {
                if let Some(code) = code {
                    pools.visit_code(code);
                }
            }
        }
        let ix = Indices::build(g, pools);

        // fixed-size sections
        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * ix.strings.len() as u32;
        let proto_ids_off = type_ids_off + 4 * ix.types.len() as u32;
        let field_ids_off = proto_ids_off + 12 * ix.protos.len() as u32;
        let method_ids_off = field_ids_off + 8 * ix.fields.len() as u32;
        let class_defs_off = method_ids_off + 8 * ix.methods.len() as u32;
        let call_site_ids_off = class_defs_off + 32 * order.len() as u32;
        let method_handles_off = call_site_ids_off + 4 * ix.call_sites.len() as u32;
        let data_off = align_to(method_handles_off + 8 * ix.method_handles.len() as u32, 4);
        let mut data = DataSection::new(data_off);

        let mut string_data_offs = Vec::with_capacity(ix.strings.len());
        for s in &ix.strings {
            let mut buf = Vec::new();
            write_string_data(&mut buf, &g.string(*s));
            string_data_offs.push(data.push(TYPE_STRING_DATA_ITEM, 1, &buf));
        }

        let mut type_lists: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut type_list = |data: &mut DataSection, list: Vec<u32>| -> u32 {
            if list.is_empty() {
                return 0;
            }
            *type_lists.entry(list).or_insert_with_key(|l| {
                let mut buf = Vec::new();
                write_type_list(&mut buf, l);
                data.push(TYPE_TYPE_LIST, 4, &buf)
            })
        };
        let mut proto_params = Vec::with_capacity(ix.protos.len());
        for p in &ix.protos {
            let args = g.proto(*p).args.iter().map(|a| ix.type_idx(*a)).collect::<Result<Vec<_>>>()?;
            proto_params.push(type_list(&mut data, args));
        }
        let mut interfaces_offs = Vec::with_capacity(order.len());
        for &ci in &order {
            let list = classes[ci].interfaces.iter().map(|t| ix.type_idx(*t)).collect::<Result<Vec<_>>>()?;
            interfaces_offs.push(type_list(&mut data, list));
        }

        let directories = self.write_annotations(&mut data, &ix, classes, &order)?;

        let mut static_values_offs = Vec::with_capacity(order.len());
        for &ci in &order {
            static_values_offs.push(self.write_static_values(&mut data, &ix, &classes[ci])?);
        }
        let mut call_site_offs = Vec::with_capacity(ix.call_sites.len());
        for cs in &ix.call_sites {
            let d = g.call_site(*cs);
            let mut values = vec![
                EncodedValue::MethodHandle(d.bootstrap),
                EncodedValue::String(d.name),
                EncodedValue::MethodType(d.proto),
            ];
            values.extend(d.args.iter().cloned());
            let mut buf = Vec::new();
            write_encoded_array(&values, &mut buf, &ix)?;
            call_site_offs.push(data.push(TYPE_ENCODED_ARRAY_ITEM, 1, &buf));
        }

        // lowering runs in parallel; placement is sequential
        let lowered: Vec<Vec<(MethodId, Option<LoweredCode>)>> = order
            .par_iter()
            .zip(bodies.par_iter())
            .map(|(&ci, methods)| {
                let source_file = classes[ci].source_file;
                methods
                    .iter()
                    .map(|(m, is_static, code)| {
                        let lowered = match code {
                            Some(code) => Some(Lowering::new(g, &ix, *m, *is_static, source_file).lower(code)?),
                            None => None,
                        };
                        Ok((*m, lowered))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let mut needs_038 = !ix.method_handles.is_empty() || !ix.call_sites.is_empty();
        for methods in &bodies {
            for code in methods.iter().filter_map(|(_, _, c)| c.as_ref()) {
                needs_038 |= code.instructions().any(|(_, i)| {
                    matches!(
                        i.opcode(),
                        IROpcode::InvokePolymorphic
                            | IROpcode::InvokeCustom
                            | IROpcode::ConstMethodHandle
                            | IROpcode::ConstMethodType
                    )
                });
            }
        }

        let mut code_offs: HashMap<MethodId, u32> = HashMap::new();
        let mut debug_offs: Vec<Vec<u32>> = Vec::with_capacity(lowered.len());
        for methods in &lowered {
            let mut offs = Vec::with_capacity(methods.len());
            for (_, l) in methods {
                let off = match l.as_ref().and_then(|l| l.debug_info.as_ref()) {
                    Some(info) => data.push(TYPE_DEBUG_INFO_ITEM, 1, info),
                    None => 0,
                };
                offs.push(off);
            }
            debug_offs.push(offs);
        }
        for (methods, dbg) in lowered.into_iter().zip(&debug_offs) {
            for ((m, l), debug_info_off) in methods.into_iter().zip(dbg) {
                if let Some(l) = l {
                    let mut buf = Vec::new();
                    CodeItem { debug_info_off: *debug_info_off, ..l.item }.write(&mut buf);
                    code_offs.insert(m, data.push(TYPE_CODE_ITEM, 4, &buf));
                }
            }
        }

        let mut class_data_offs = Vec::with_capacity(order.len());
        for &ci in &order {
            let c = &classes[ci];
            let mut item = ClassDataItem::default();
            let fields = |list: &[crate::ir::class::DexField]| -> Result<Vec<EncodedField>> {
                let mut out = list
                    .iter()
                    .map(|f| Ok(EncodedField { field_idx: ix.field_idx(f.reference)?, access_flags: f.access.bits() }))
                    .collect::<Result<Vec<_>>>()?;
                out.sort_by_key(|f| f.field_idx);
                Ok(out)
            };
            item.static_fields = fields(&c.sfields)?;
            item.instance_fields = fields(&c.ifields)?;
            let methods = |list: &[DexMethod]| -> Result<Vec<EncodedMethod>> {
                let mut out = list
                    .iter()
                    .map(|m| {
                        Ok(EncodedMethod {
                            method_idx: ix.method_idx(m.reference)?,
                            access_flags: m.access.bits(),
                            code_off: code_offs.get(&m.reference).copied().unwrap_or(0),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                out.sort_by_key(|m| m.method_idx);
                Ok(out)
            };
            item.direct_methods = methods(&c.dmethods)?;
            item.virtual_methods = methods(&c.vmethods)?;
            if item == ClassDataItem::default() {
                class_data_offs.push(0);
                continue;
            }
            let mut buf = Vec::new();
            item.write(&mut buf);
            class_data_offs.push(data.push(TYPE_CLASS_DATA_ITEM, 1, &buf));
        }

        // map list closes the data section
        let mut map = vec![MapItem { ty: TYPE_HEADER_ITEM, size: 1, offset: 0 }];
        for (ty, size, offset) in [
            (TYPE_STRING_ID_ITEM, ix.strings.len(), string_ids_off),
            (TYPE_TYPE_ID_ITEM, ix.types.len(), type_ids_off),
            (TYPE_PROTO_ID_ITEM, ix.protos.len(), proto_ids_off),
            (TYPE_FIELD_ID_ITEM, ix.fields.len(), field_ids_off),
            (TYPE_METHOD_ID_ITEM, ix.methods.len(), method_ids_off),
            (TYPE_CLASS_DEF_ITEM, order.len(), class_defs_off),
            (TYPE_CALL_SITE_ID_ITEM, ix.call_sites.len(), call_site_ids_off),
            (TYPE_METHOD_HANDLE_ITEM, ix.method_handles.len(), method_handles_off),
        ] {
            if size > 0 {
                map.push(MapItem { ty, size: size as u32, offset });
            }
        }
        map.extend(data.map_items());
        while data.bytes.len() % 4 != 0 {
            data.bytes.push(0);
        }
        let map_off = data_off + data.bytes.len() as u32;
        map.push(MapItem { ty: TYPE_MAP_LIST, size: 1, offset: map_off });
        map.sort_by_key(|m| m.offset);
        write_map_list(&mut data.bytes, &map);

        // id tables
        let mut file = vec![0u8; HEADER_SIZE as usize];
        for off in &string_data_offs {
            write_u4(&mut file, *off);
        }
        for t in &ix.types {
            write_u4(&mut file, ix.string_idx(g.type_name(*t))?);
        }
        for (p, params_off) in ix.protos.iter().zip(&proto_params) {
            let d = g.proto(*p);
            write_u4(&mut file, ix.string_idx(d.shorty)?);
            write_u4(&mut file, ix.type_idx(d.rtype)?);
            write_u4(&mut file, *params_off);
        }
        for f in &ix.fields {
            let d = g.field(*f);
            FieldIdItem {
                class_idx: narrow(ix.type_idx(d.class)?, "field class")?,
                type_idx: narrow(ix.type_idx(d.ty)?, "field type")?,
                name_idx: ix.string_idx(d.name)?,
            }
            .write(&mut file);
        }
        for m in &ix.methods {
            let d = g.method(*m);
            MethodIdItem {
                class_idx: narrow(ix.type_idx(d.class)?, "method class")?,
                proto_idx: narrow(ix.proto_idx(d.proto)?, "method proto")?,
                name_idx: ix.string_idx(d.name)?,
            }
            .write(&mut file);
        }
        for (k, &ci) in order.iter().enumerate() {
            let c = &classes[ci];
            ClassDefItem {
                class_idx: ix.type_idx(c.ty)?,
                access_flags: c.access.bits(),
                superclass_idx: match c.super_class {
                    Some(s) => ix.type_idx(s)?,
                    None => NO_INDEX,
                },
                interfaces_off: interfaces_offs[k],
                source_file_idx: match c.source_file {
                    Some(s) => ix.string_idx(s)?,
                    None => NO_INDEX,
                },
                annotations_off: directories[k],
                class_data_off: class_data_offs[k],
                static_values_off: static_values_offs[k],
            }
            .write(&mut file);
        }
        for off in &call_site_offs {
            write_u4(&mut file, *off);
        }
        for h in &ix.method_handles {
            let d = g.method_handle(*h);
            let target = match d.target {
                MethodHandleTarget::Method(m) => ix.method_idx(m)?,
                MethodHandleTarget::Field(f) => ix.field_idx(f)?,
            };
            write_u2(&mut file, d.kind as u16);
            write_u2(&mut file, 0);
            write_u2(&mut file, narrow(target, "method handle target")?);
            write_u2(&mut file, 0);
        }
        file.resize(data_off as usize, 0);
        file.extend_from_slice(&data.bytes);

        let mut header = Header {
            magic: if needs_038 { DEX_MAGIC_038 } else { DEX_MAGIC_035 },
            checksum: 0,
            signature: [0; 20],
            file_size: file.len() as u32,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off,
            string_ids_size: ix.strings.len() as u32,
            string_ids_off: if ix.strings.is_empty() { 0 } else { string_ids_off },
            type_ids_size: ix.types.len() as u32,
            type_ids_off: if ix.types.is_empty() { 0 } else { type_ids_off },
            proto_ids_size: ix.protos.len() as u32,
            proto_ids_off: if ix.protos.is_empty() { 0 } else { proto_ids_off },
            field_ids_size: ix.fields.len() as u32,
            field_ids_off: if ix.fields.is_empty() { 0 } else { field_ids_off },
            method_ids_size: ix.methods.len() as u32,
            method_ids_off: if ix.methods.is_empty() { 0 } else { method_ids_off },
            class_defs_size: order.len() as u32,
            class_defs_off: if order.is_empty() { 0 } else { class_defs_off },
            data_size: file.len() as u32 - data_off,
            data_off,
        };
        overwrite_header(&mut file, &header);
        header.signature = compute_sha1(&file[32..]);
        overwrite_header(&mut file, &header);
        header.checksum = adler32_slice(&file[12..]);
        overwrite_header(&mut file, &header);
        debug!(
            "[writer] {} classes, {} strings, {} methods, version {}",
            order.len(),
            ix.strings.len(),
            ix.methods.len(),
            header.version()
        );
        Ok(file)
    }

    /// Writes annotation items, sets, ref lists and directories; returns each class's
    /// directory offset.
    fn write_annotations(
        &self,
        data: &mut DataSection,
        ix: &Indices,
        classes: &[DexClass],
        order: &[usize],
    ) -> Result<Vec<u32>> {
        let mut items: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut sets: HashMap<Vec<u32>, u32> = HashMap::new();

        // items first, then sets that point at them
        let mut set_entries = |data: &mut DataSection, set: &AnnotationSet| -> Result<Vec<u32>> {
            let mut keyed = Vec::with_capacity(set.annotations.len());
            for a in &set.annotations {
                let mut buf = Vec::new();
                a.write(&mut buf, ix)?;
                let off = *items.entry(buf).or_insert_with_key(|b| data.push(TYPE_ANNOTATION_ITEM, 1, b));
                keyed.push((ix.type_idx(a.annotation.ty)?, off));
            }
            keyed.sort();
            Ok(keyed.into_iter().map(|(_, off)| off).collect())
        };

        struct Pending {
            class: Option<Vec<u32>>,
            fields: Vec<(u32, Vec<u32>)>,
            methods: Vec<(u32, Vec<u32>)>,
            params: Vec<(u32, Vec<Option<Vec<u32>>>)>,
        }
        let mut pending = Vec::with_capacity(order.len());
        for &ci in order {
            let c = &classes[ci];
            let class = match &c.annotations {
                Some(s) if !s.is_empty() => Some(set_entries(data, s)?),
                _ => None,
            };
            let mut fields = Vec::new();
            for f in c.fields() {
                if let Some(s) = f.annotations.as_ref().filter(|s| !s.is_empty()) {
                    fields.push((ix.field_idx(f.reference)?, set_entries(data, s)?));
                }
            }
            let mut methods = Vec::new();
            let mut params = Vec::new();
            for m in c.methods() {
                if let Some(s) = m.annotations.as_ref().filter(|s| !s.is_empty()) {
                    methods.push((ix.method_idx(m.reference)?, set_entries(data, s)?));
                }
                if !m.param_annotations.is_empty() {
                    let n = self.g.proto(self.g.method(m.reference).proto).args.len();
                    let mut list = Vec::with_capacity(n);
                    for i in 0..n as u32 {
                        list.push(match m.param_annotations.get(&i) {
                            Some(s) => Some(set_entries(data, s)?),
                            None => None,
                        });
                    }
                    params.push((ix.method_idx(m.reference)?, list));
                }
            }
            fields.sort_by_key(|(i, _)| *i);
            methods.sort_by_key(|(i, _)| *i);
            params.sort_by_key(|(i, _)| *i);
            pending.push(Pending { class, fields, methods, params });
        }

        let mut set_off = |data: &mut DataSection, entries: Vec<u32>| -> u32 {
            *sets.entry(entries).or_insert_with_key(|e| {
                let mut buf = Vec::new();
                AnnotationSetItem { entries: e.clone() }.write(&mut buf);
                data.push(TYPE_ANNOTATION_SET_ITEM, 4, &buf)
            })
        };
        struct Resolved {
            class: u32,
            fields: Vec<MemberAnnotations>,
            methods: Vec<MemberAnnotations>,
            params: Vec<(u32, Vec<u32>)>,
        }
        let mut resolved = Vec::with_capacity(pending.len());
        for p in pending {
            resolved.push(Resolved {
                class: p.class.map_or(0, |e| set_off(data, e)),
                fields: p
                    .fields
                    .into_iter()
                    .map(|(idx, e)| MemberAnnotations { idx, annotations_off: set_off(data, e) })
                    .collect(),
                methods: p
                    .methods
                    .into_iter()
                    .map(|(idx, e)| MemberAnnotations { idx, annotations_off: set_off(data, e) })
                    .collect(),
                params: p
                    .params
                    .into_iter()
                    .map(|(idx, list)| (idx, list.into_iter().map(|e| e.map_or(0, |e| set_off(data, e))).collect()))
                    .collect(),
            });
        }

        let mut ref_lists = Vec::with_capacity(resolved.len());
        for r in &resolved {
            let mut offs = Vec::with_capacity(r.params.len());
            for (idx, list) in &r.params {
                let mut buf = Vec::new();
                AnnotationSetRefList { list: list.clone() }.write(&mut buf);
                offs.push(MemberAnnotations { idx: *idx, annotations_off: data.push(TYPE_ANNOTATION_SET_REF_LIST, 4, &buf) });
            }
            ref_lists.push(offs);
        }

        let mut out = Vec::with_capacity(resolved.len());
        for (r, params) in resolved.into_iter().zip(ref_lists) {
            let dir = AnnotationsDirectoryItem {
                class_annotations_off: r.class,
                field_annotations: r.fields,
                method_annotations: r.methods,
                parameter_annotations: params,
            };
            if dir.is_empty() {
                out.push(0);
                continue;
            }
            let mut buf = Vec::new();
            dir.write(&mut buf);
            out.push(data.push(TYPE_ANNOTATIONS_DIRECTORY_ITEM, 4, &buf));
        }
        Ok(out)
    }

    /// Static initial values in field-index order; trailing defaults are dropped.
    fn write_static_values(&self, data: &mut DataSection, ix: &Indices, c: &DexClass) -> Result<u32> {
        let g = self.g;
        let mut fields = c
            .sfields
            .iter()
            .map(|f| Ok((ix.field_idx(f.reference)?, f)))
            .collect::<Result<Vec<_>>>()?;
        fields.sort_by_key(|(i, _)| *i);
        let mut values: Vec<EncodedValue> = fields
            .iter()
            .map(|(_, f)| match &f.static_value {
                Some(v) => v.clone(),
                None => EncodedValue::zero_for_type(&g.descriptor(g.field(f.reference).ty)),
            })
            .collect();
        while values.last().map_or(false, |v| v.is_zero()) {
            values.pop();
        }
        if values.is_empty() {
            return Ok(0);
        }
        let mut buf = Vec::new();
        write_encoded_array(&values, &mut buf, ix)?;
        Ok(data.push(TYPE_ENCODED_ARRAY_ITEM, 1, &buf))
    }
}

fn narrow(v: u32, what: &str) -> Result<u16> {
    u16::try_from(v).map_err(|_| DexError::new(format!("{} index {} does not fit in 16 bits", what, v)))
}

/// Superclasses and interfaces defined in the same file come first; otherwise input order.
fn class_order(classes: &[DexClass]) -> Vec<usize> {
    let by_type: HashMap<TypeId, usize> = classes.iter().enumerate().map(|(i, c)| (c.ty, i)).collect();
    let mut placed = vec![false; classes.len()];
    let mut visiting = vec![false; classes.len()];
    let mut out = Vec::with_capacity(classes.len());
    fn visit(
        i: usize,
        classes: &[DexClass],
        by_type: &HashMap<TypeId, usize>,
        placed: &mut Vec<bool>,
        visiting: &mut Vec<bool>,
        out: &mut Vec<usize>,
    ) {
        if placed[i] || visiting[i] {
            return;
        }
        visiting[i] = true;
        let c = &classes[i];
        for parent in c.super_class.iter().chain(c.interfaces.iter()) {
            if let Some(&p) = by_type.get(parent) {
                visit(p, classes, by_type, placed, visiting, out);
            }
        }
        visiting[i] = false;
        placed[i] = true;
        out.push(i);
    }
    for i in 0..classes.len() {
        visit(i, classes, &by_type, &mut placed, &mut visiting, &mut out);
    }
    out
}

fn overwrite_header(buf: &mut [u8], header: &Header) {
    let mut bytes = Vec::with_capacity(HEADER_SIZE as usize);
    header.write(&mut bytes);
    buf[..HEADER_SIZE as usize].copy_from_slice(&bytes);
}

fn compute_sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::loader::DexLoader;
    use crate::ir::assembler::parse_code;
    use crate::ir::class::{AccessFlags, DexField};
    use std::sync::Arc;

    fn simple_class(g: &Interner, name: &str, sup: &str) -> DexClass {
        DexClass::new(g.make_type(name), Some(g.make_type(sup)), AccessFlags::PUBLIC)
    }

    #[test]
    fn test_header_checksums_and_version() {
        let g = Interner::new();
        let bytes = DexWriter::new(&g).write(&[simple_class(&g, "LA;", "Ljava/lang/Object;")]).unwrap();
        let dex = DexFile::from_bytes("mem", Arc::from(bytes.clone())).unwrap();
        assert_eq!(dex.header.version(), "035");
        assert_eq!(dex.header.file_size as usize, bytes.len());
        assert_eq!(dex.header.checksum, adler32_slice(&bytes[12..]));
        assert_eq!(dex.header.signature, compute_sha1(&bytes[32..]));
        assert_eq!(dex.map.first().map(|m| m.ty), Some(TYPE_HEADER_ITEM));
        assert!(dex.map.windows(2).all(|w| w[0].offset <= w[1].offset));
    }

    #[test]
    fn test_superclass_written_first() {
        let g = Interner::new();
        let classes = vec![simple_class(&g, "LB;", "LA;"), simple_class(&g, "LA;", "Ljava/lang/Object;")];
        let bytes = DexWriter::new(&g).write(&classes).unwrap();
        let dex = DexFile::from_bytes("mem", Arc::from(bytes)).unwrap();
        let loaded = DexLoader::new(&g, false).load(&dex).unwrap();
        assert_eq!(loaded[0].ty, g.make_type("LA;"));
        assert_eq!(loaded[1].ty, g.make_type("LB;"));
    }

    #[test]
    fn test_strings_sorted_by_utf16() {
        let g = Interner::new();
        let mut c = simple_class(&g, "LA;", "Ljava/lang/Object;");
        c.source_file = Some(g.make_string("\u{10000}"));
        let f = g.make_field_from_str("LA;.s:Ljava/lang/String;").unwrap();
        let mut field = DexField::new(f, AccessFlags::STATIC);
        field.static_value = Some(EncodedValue::String(g.make_string("\u{ffff}")));
        c.sfields.push(field);
        let bytes = DexWriter::new(&g).write(&[c]).unwrap();
        let dex = DexFile::from_bytes("mem", Arc::from(bytes)).unwrap();
        let pos = |s: &str| {
            dex.string_data_offs
                .iter()
                .position(|off| {
                    let mut ix = *off as usize;
                    crate::dex::mutf8::read_string_data(&dex.bytes, &mut ix).unwrap() == s
                })
                .unwrap()
        };
        // U+10000 is a surrogate pair, which sorts below U+FFFF in UTF-16
        assert!(pos("\u{10000}") < pos("\u{ffff}"));
    }

    #[test]
    fn test_static_values_and_code_survive_reload() {
        let g = Interner::new();
        let mut c = simple_class(&g, "LA;", "Ljava/lang/Object;");
        let f = g.make_field_from_str("LA;.x:I").unwrap();
        let mut field = DexField::new(f, AccessFlags::STATIC | AccessFlags::FINAL);
        field.static_value = Some(EncodedValue::Int(42));
        c.sfields.push(field);
        let m = g.make_method_from_str("LA;.get:()I").unwrap();
        let code = parse_code(&g, r#"((sget "LA;.x:I") (move-result-pseudo v0) (return v0))"#).unwrap();
        c.add_method(&g, DexMethod::new(m, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(code))
            .unwrap();
        let bytes = DexWriter::new(&g).write(&[c]).unwrap();
        let dex = DexFile::from_bytes("mem", Arc::from(bytes)).unwrap();
        let mut loaded = DexLoader::new(&g, false).load(&dex).unwrap();
        let class = &mut loaded[0];
        assert_eq!(class.sfields[0].static_value, Some(EncodedValue::Int(42)));
        let code = class.dmethods[0].code_mut(&g).unwrap().unwrap();
        let ops: Vec<IROpcode> = code.instructions().map(|(_, i)| i.opcode()).collect();
        assert_eq!(ops, vec![IROpcode::Sget, IROpcode::MoveResultPseudo, IROpcode::Return]);
    }
}
