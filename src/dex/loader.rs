//! Turns a parsed [`DexFile`] into interned symbols and [`DexClass`]es.
//!
//! Every id table is interned eagerly. Method bodies are not: each method with a code item
//! gets a [`PendingCode`] that lifts the bytecode to IR on first access.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::dex::annotations::{AnnotationSet, AnnotationSetRefList, AnnotationsDirectoryItem};
use crate::dex::dex_file::*;
use crate::dex::encoded_values::{read_encoded_array, EncodedValue, UnknownTagPolicy};
use crate::dex::instruction_codec::{decode_all, Decoded, Payload, RawInsn};
use crate::dex::mutf8::read_string_data;
use crate::dex::opcodes::ReferenceType;
use crate::dex::{check_index, read_sleb128, read_u1, read_uleb128, read_uleb128p1, RefResolver};
use crate::error::{DexError, Result};
use crate::ir::class::{AccessFlags, DexClass, DexField, DexMethod};
use crate::ir::code::{
    BranchTarget, BranchTargetKind, CatchEntry, DexDebugInstruction, DexPosition, IRCode, ItemId, MethodItemEntry,
};
use crate::ir::instruction::{IRInstruction, Operand, Reg};
use crate::ir::interner::{
    CallSiteData, CallSiteId, FieldId, Interner, MethodHandleId, MethodHandleKind, MethodHandleTarget, MethodId,
    ProtoId, StringId, TypeId,
};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

/// Interned ids for every table of one DEX file.
#[derive(Debug)]
pub(crate) struct DexRefs {
    location: String,
    bytes: Arc<[u8]>,
    strings: Vec<StringId>,
    types: Vec<TypeId>,
    protos: Vec<ProtoId>,
    fields: Vec<FieldId>,
    methods: Vec<MethodId>,
    method_handles: Vec<MethodHandleId>,
    call_sites: Vec<CallSiteId>,
    policy: UnknownTagPolicy,
}

impl RefResolver for DexRefs {
    fn string(&self, idx: u32) -> Result<StringId> {
        Ok(self.strings[check_index("string", idx, self.strings.len())?])
    }

    fn type_id(&self, idx: u32) -> Result<TypeId> {
        Ok(self.types[check_index("type", idx, self.types.len())?])
    }

    fn proto(&self, idx: u32) -> Result<ProtoId> {
        Ok(self.protos[check_index("proto", idx, self.protos.len())?])
    }

    fn field(&self, idx: u32) -> Result<FieldId> {
        Ok(self.fields[check_index("field", idx, self.fields.len())?])
    }

    fn method(&self, idx: u32) -> Result<MethodId> {
        Ok(self.methods[check_index("method", idx, self.methods.len())?])
    }

    fn method_handle(&self, idx: u32) -> Result<MethodHandleId> {
        Ok(self.method_handles[check_index("method_handle", idx, self.method_handles.len())?])
    }

    fn call_site(&self, idx: u32) -> Result<CallSiteId> {
        Ok(self.call_sites[check_index("call_site", idx, self.call_sites.len())?])
    }
}

/// A method body still in DEX form.
#[derive(Debug, Clone)]
pub(crate) struct PendingCode {
    refs: Arc<DexRefs>,
    code_off: u32,
    method: MethodId,
    is_static: bool,
    source_file: Option<StringId>,
}

impl PendingCode {
    pub(crate) fn materialize(self, g: &Interner) -> Result<IRCode> {
        let bytes: &[u8] = &self.refs.bytes;
        let mut ix = self.code_off as usize;
        let item = CodeItem::read(bytes, &mut ix)
            .map_err(|e| e.context(format!("code item at 0x{:x}", self.code_off)))?;
        let lifter = Lifter { g, refs: &self.refs, pending: &self, item: &item };
        lifter.lift()
    }
}

struct Lifter<'a> {
    g: &'a Interner,
    refs: &'a DexRefs,
    pending: &'a PendingCode,
    item: &'a CodeItem,
}

struct Branch {
    src: ItemId,
    target_addr: u32,
    kind: BranchTargetKind,
}

impl<'a> Lifter<'a> {
    fn lift(&self) -> Result<IRCode> {
        let g = self.g;
        let item = self.item;
        let mut code = IRCode::new(item.registers_size as u32);
        let decoded = decode_all(&item.insns)?;
        let payloads: HashMap<u32, &Payload> = decoded
            .iter()
            .filter_map(|(addr, d)| match d {
                Decoded::Payload(p) => Some((*addr, p)),
                _ => None,
            })
            .collect();

        self.emit_load_params(&mut code)?;

        // first and last item emitted for each address
        let mut first_item: BTreeMap<u32, ItemId> = BTreeMap::new();
        let mut last_item: BTreeMap<u32, ItemId> = BTreeMap::new();
        let mut branches = Vec::new();
        for (addr, d) in &decoded {
            let Decoded::Insn(raw) = d else { continue };
            let before = code.last();
            self.lift_insn(&mut code, *addr, raw, &payloads, &mut branches)
                .map_err(|e| e.context(format!("instruction at 0x{:x}", addr)))?;
            let first = match before {
                Some(b) => code.next(b),
                None => code.first(),
            };
            if let (Some(f), Some(l)) = (first, code.last()) {
                if Some(l) != before {
                    first_item.insert(*addr, f);
                    last_item.insert(*addr, l);
                }
            }
        }

        let at = |addr: u32| -> Result<ItemId> {
            first_item.get(&addr).copied().ok_or_else(|| {
                DexError::malformed(
                    self.pending.code_off as usize,
                    format!("reference to address 0x{:x}, which starts no instruction", addr),
                )
            })
        };

        for b in &branches {
            let pos = at(b.target_addr)?;
            code.insert_before(pos, MethodItemEntry::Target(BranchTarget { src: b.src, kind: b.kind }));
        }

        self.lift_tries(&mut code, &first_item, &last_item)?;

        if item.debug_info_off != 0 {
            self.lift_debug_info(&mut code, &first_item)
                .map_err(|e| e.context(format!("debug info at 0x{:x}", item.debug_info_off)))?;
        }
        debug!("[loader] lifted {} ({} items)", g.show_method(self.pending.method), code.len());
        Ok(code)
    }

    fn emit_load_params(&self, code: &mut IRCode) -> Result<()> {
        let g = self.g;
        let m = g.method(self.pending.method);
        let mut descs: Vec<Arc<str>> = Vec::new();
        if !self.pending.is_static {
            descs.push(g.descriptor(m.class));
        }
        descs.extend(g.proto(m.proto).args.iter().map(|t| g.descriptor(*t)));
        let words: u32 = descs.iter().map(|d| if types::is_wide(d) { 2 } else { 1 }).sum();
        if words != self.item.ins_size as u32 || words > self.item.registers_size as u32 {
            return Err(DexError::malformed(
                self.pending.code_off as usize,
                format!(
                    "{} expects {} parameter registers; code item has ins_size {} of {}",
                    g.show_method(self.pending.method),
                    words,
                    self.item.ins_size,
                    self.item.registers_size
                ),
            ));
        }
        let mut reg = self.item.registers_size as u32 - words;
        for d in descs {
            code.push_back(MethodItemEntry::Opcode(IRInstruction::new(IROpcode::load_param_for(&d)).with_dest(reg)));
            reg += if types::is_wide(&d) { 2 } else { 1 };
        }
        Ok(())
    }

    fn operand(&self, raw: &RawInsn, reference: ReferenceType) -> Result<Operand> {
        let r = self.refs;
        Ok(match reference {
            ReferenceType::None => Operand::None,
            ReferenceType::String => Operand::String(r.string(raw.index)?),
            ReferenceType::Type => Operand::Type(r.type_id(raw.index)?),
            ReferenceType::Field => Operand::Field(r.field(raw.index)?),
            ReferenceType::Method => {
                if raw.op == 0xfa || raw.op == 0xfb {
                    Operand::MethodAndProto(r.method(raw.index)?, r.proto(raw.index2)?)
                } else {
                    Operand::Method(r.method(raw.index)?)
                }
            }
            ReferenceType::CallSite => Operand::CallSite(r.call_site(raw.index)?),
            ReferenceType::MethodProto => Operand::Proto(r.proto(raw.index)?),
            ReferenceType::MethodHandle => Operand::MethodHandle(r.method_handle(raw.index)?),
        })
    }

    /// Drops the second register of every wide argument.
    fn collapse_invoke_args(&self, insn: &IRInstruction, regs: &[u32]) -> Result<Vec<Reg>> {
        let g = self.g;
        let mut out = Vec::new();
        let mut i = 0;
        for t in insn.invoke_arg_types(g) {
            let r = *regs.get(i).ok_or_else(|| DexError::new("too few argument registers for invoke"))?;
            out.push(r);
            i += if types::is_wide(&g.descriptor(t)) { 2 } else { 1 };
        }
        if i != regs.len() {
            return Err(DexError::new(format!(
                "invoke of {} passes {} registers, prototype needs {}",
                insn.show(g),
                regs.len(),
                i
            )));
        }
        Ok(out)
    }

    fn lift_insn(
        &self,
        code: &mut IRCode,
        addr: u32,
        raw: &RawInsn,
        payloads: &HashMap<u32, &Payload>,
        branches: &mut Vec<Branch>,
    ) -> Result<()> {
        let op = raw.opcode()?;
        let ir = op.ir;
        let regs = &raw.regs;
        let operand = self.operand(raw, op.reference_type)?;
        let mut insn = IRInstruction::new(ir).with_operand(operand);

        if ir == IROpcode::Nop {
            return Ok(());
        }

        if ir.has_move_result_pseudo() {
            // A is the result register; check-cast also reads it
            if ir == IROpcode::CheckCast {
                insn.set_srcs(vec![regs[0]]);
            } else {
                insn.set_srcs(regs[1..].to_vec());
            }
            code.push_back(MethodItemEntry::Opcode(insn));
            let wide = matches!(ir, IROpcode::AgetWide | IROpcode::IgetWide | IROpcode::SgetWide);
            let object = matches!(
                ir,
                IROpcode::ConstString
                    | IROpcode::ConstClass
                    | IROpcode::CheckCast
                    | IROpcode::NewInstance
                    | IROpcode::NewArray
                    | IROpcode::AgetObject
                    | IROpcode::IgetObject
                    | IROpcode::SgetObject
                    | IROpcode::ConstMethodHandle
                    | IROpcode::ConstMethodType
            );
            let pseudo = IRInstruction::new(ir.move_result_pseudo_for(wide, object)).with_dest(regs[0]);
            code.push_back(MethodItemEntry::Opcode(pseudo));
            return Ok(());
        }

        match ir {
            _ if ir.is_invoke() => {
                let srcs = self.collapse_invoke_args(&insn, regs)?;
                insn.set_srcs(srcs);
            }
            IROpcode::FilledNewArray => insn.set_srcs(regs.clone()),
            IROpcode::FillArrayData => {
                let p = payloads.get(&((addr as i64 + raw.offset as i64) as u32));
                let Some(Payload::Array(data)) = p else {
                    return Err(DexError::new("fill-array-data without an array payload"));
                };
                insn.set_srcs(vec![regs[0]]);
                insn.set_operand(Operand::Data(Arc::clone(data)));
            }
            IROpcode::Goto => {
                let id = code.push_back(MethodItemEntry::Opcode(insn));
                branches.push(Branch { src: id, target_addr: target(addr, raw.offset)?, kind: BranchTargetKind::Simple });
                return Ok(());
            }
            _ if ir.is_conditional_branch() => {
                insn.set_srcs(regs.clone());
                let id = code.push_back(MethodItemEntry::Opcode(insn));
                branches.push(Branch { src: id, target_addr: target(addr, raw.offset)?, kind: BranchTargetKind::Simple });
                return Ok(());
            }
            IROpcode::Switch => {
                insn.set_srcs(vec![regs[0]]);
                let cases: Vec<(i32, i32)> = match payloads.get(&target(addr, raw.offset)?) {
                    Some(Payload::PackedSwitch { first_key, targets }) => targets
                        .iter()
                        .enumerate()
                        .map(|(i, t)| (first_key.wrapping_add(i as i32), *t))
                        .collect(),
                    Some(Payload::SparseSwitch { keys, targets }) => {
                        keys.iter().copied().zip(targets.iter().copied()).collect()
                    }
                    _ => return Err(DexError::new("switch without a switch payload")),
                };
                let id = code.push_back(MethodItemEntry::Opcode(insn));
                for (key, off) in cases {
                    branches.push(Branch { src: id, target_addr: target(addr, off)?, kind: BranchTargetKind::Case(key) });
                }
                return Ok(());
            }
            _ if op.is_2addr() => {
                insn = insn.with_dest(regs[0]).with_srcs(vec![regs[0], regs[1]]);
            }
            _ if ir.is_aput() || ir.is_iput() || ir.is_sput() => insn.set_srcs(regs.clone()),
            IROpcode::Const | IROpcode::ConstWide => {
                insn = insn.with_dest(regs[0]).with_literal(raw.literal);
            }
            _ if ir.is_binop_lit() => {
                insn = insn.with_dest(regs[0]).with_srcs(vec![regs[1]]).with_literal(raw.literal);
            }
            _ if ir.has_dest() => {
                insn = insn.with_dest(regs[0]).with_srcs(regs[1..].to_vec());
            }
            _ => insn.set_srcs(regs.clone()),
        }
        code.push_back(MethodItemEntry::Opcode(insn));
        Ok(())
    }

    fn lift_tries(
        &self,
        code: &mut IRCode,
        first_item: &BTreeMap<u32, ItemId>,
        last_item: &BTreeMap<u32, ItemId>,
    ) -> Result<()> {
        let refs = self.refs;
        let off = self.pending.code_off as usize;
        let at = |addr: u32| -> Result<ItemId> {
            first_item
                .get(&addr)
                .copied()
                .ok_or_else(|| DexError::malformed(off, format!("handler address 0x{:x} starts no instruction", addr)))
        };
        let mut chains: HashMap<u16, ItemId> = HashMap::new();
        for (handler_off, h) in &self.item.handlers {
            let mut next: Option<ItemId> = None;
            let mut entries: Vec<(Option<TypeId>, u32)> = Vec::new();
            for (type_idx, addr) in &h.handlers {
                entries.push((Some(refs.type_id(*type_idx)?), *addr));
            }
            if let Some(addr) = h.catch_all_addr {
                entries.push((None, addr));
            }
            for (catch_type, addr) in entries.into_iter().rev() {
                let pos = at(addr)?;
                next = Some(code.insert_before(pos, MethodItemEntry::Catch(CatchEntry { catch_type, next })));
            }
            if let Some(head) = next {
                chains.insert(*handler_off, head);
            }
        }
        for t in &self.item.tries {
            let Some(head) = chains.get(&t.handler_off).copied() else { continue };
            let end = t.start_addr + t.insn_count as u32;
            let Some((_, last)) = last_item.range(t.start_addr..end).next_back() else {
                warn!("[loader] empty try region at 0x{:x}", t.start_addr);
                continue;
            };
            code.insert_after(*last, MethodItemEntry::TryEnd(head));
            let start = first_item
                .range(t.start_addr..end)
                .next()
                .map(|(_, id)| *id)
                .ok_or_else(|| DexError::malformed(off, "try region covers no instruction"))?;
            code.insert_before(start, MethodItemEntry::TryStart(head));
        }
        Ok(())
    }

    fn lift_debug_info(&self, code: &mut IRCode, first_item: &BTreeMap<u32, ItemId>) -> Result<()> {
        let refs = self.refs;
        let bytes: &[u8] = &refs.bytes;
        let mut ix = self.item.debug_info_off as usize;
        let mut line = read_uleb128(bytes, &mut ix)?;
        let params = read_uleb128(bytes, &mut ix)?;
        let mut names = Vec::with_capacity((params as usize).min(256));
        for _ in 0..params {
            names.push(match read_uleb128p1(bytes, &mut ix)? {
                Some(s) => Some(refs.string(s)?),
                None => None,
            });
        }
        code.param_names = names;

        let method = Some(self.pending.method);
        let mut file = self.pending.source_file;
        let mut addr = 0u32;
        let mut events: Vec<(u32, MethodItemEntry)> = Vec::new();
        let opt_string = |v: Option<u32>| -> Result<Option<StringId>> { v.map(|s| refs.string(s)).transpose() };
        let opt_type = |v: Option<u32>| -> Result<Option<TypeId>> { v.map(|s| refs.type_id(s)).transpose() };
        loop {
            let op = read_u1(bytes, &mut ix)?;
            match op {
                DBG_END_SEQUENCE => break,
                DBG_ADVANCE_PC => addr += read_uleb128(bytes, &mut ix)?,
                DBG_ADVANCE_LINE => line = (line as i64 + read_sleb128(bytes, &mut ix)? as i64) as u32,
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED => {
                    let reg = read_uleb128(bytes, &mut ix)?;
                    let name = opt_string(read_uleb128p1(bytes, &mut ix)?)?;
                    let ty = opt_type(read_uleb128p1(bytes, &mut ix)?)?;
                    let sig = if op == DBG_START_LOCAL_EXTENDED { opt_string(read_uleb128p1(bytes, &mut ix)?)? } else { None };
                    events.push((addr, MethodItemEntry::Debug(DexDebugInstruction::StartLocal { reg, name, ty, sig })));
                }
                DBG_END_LOCAL => {
                    let reg = read_uleb128(bytes, &mut ix)?;
                    events.push((addr, MethodItemEntry::Debug(DexDebugInstruction::EndLocal(reg))));
                }
                DBG_RESTART_LOCAL => {
                    let reg = read_uleb128(bytes, &mut ix)?;
                    events.push((addr, MethodItemEntry::Debug(DexDebugInstruction::RestartLocal(reg))));
                }
                DBG_SET_PROLOGUE_END => events.push((addr, MethodItemEntry::Debug(DexDebugInstruction::SetPrologueEnd))),
                DBG_SET_EPILOGUE_BEGIN => {
                    events.push((addr, MethodItemEntry::Debug(DexDebugInstruction::SetEpilogueBegin)))
                }
                DBG_SET_FILE => file = opt_string(read_uleb128p1(bytes, &mut ix)?)?,
                _ => {
                    let adjusted = (op - DBG_FIRST_SPECIAL) as i32;
                    line = (line as i64 + (DBG_LINE_BASE + adjusted % DBG_LINE_RANGE) as i64) as u32;
                    addr += (adjusted / DBG_LINE_RANGE) as u32;
                    events.push((addr, MethodItemEntry::Position(Arc::new(DexPosition::new(method, file, line)))));
                }
            }
        }
        for (addr, entry) in events {
            // events past the last instruction attach to the next one that exists, or the end
            match first_item.range(addr..).next() {
                Some((_, pos)) => {
                    code.insert_before(*pos, entry);
                }
                None => {
                    code.push_back(entry);
                }
            }
        }
        Ok(())
    }
}

fn target(addr: u32, offset: i32) -> Result<u32> {
    let t = addr as i64 + offset as i64;
    if t < 0 || t > u32::MAX as i64 {
        return Err(DexError::new(format!("branch from 0x{:x} by {} leaves the method", addr, offset)));
    }
    Ok(t as u32)
}

/// Reads the symbol tables and classes of a DEX file.
pub struct DexLoader<'g> {
    g: &'g Interner,
    policy: UnknownTagPolicy,
}

impl<'g> DexLoader<'g> {
    pub fn new(g: &'g Interner, strict_encoded_values: bool) -> Self {
        let policy = if strict_encoded_values { UnknownTagPolicy::Fail } else { UnknownTagPolicy::Substitute };
        DexLoader { g, policy }
    }

    pub fn load_file(&self, path: &Path) -> Result<Vec<DexClass>> {
        let dex = DexFile::from_file(path)?;
        self.load(&dex)
    }

    pub fn load(&self, dex: &DexFile) -> Result<Vec<DexClass>> {
        let refs = Arc::new(self.intern_tables(dex).map_err(|e| e.extra("dex", dex.location.clone()))?);
        let mut classes = Vec::with_capacity(dex.class_defs.len());
        for (i, def) in dex.class_defs.iter().enumerate() {
            let class = self
                .load_class(dex, &refs, def)
                .map_err(|e| e.context(format!("class_def #{}", i)).extra("dex", dex.location.clone()))?;
            classes.push(class);
        }
        debug!("[loader] {}: {} classes", dex.location, classes.len());
        Ok(classes)
    }

    fn intern_tables(&self, dex: &DexFile) -> Result<DexRefs> {
        let g = self.g;
        let bytes: &[u8] = &dex.bytes;
        let mut strings = Vec::with_capacity(dex.string_data_offs.len());
        for off in &dex.string_data_offs {
            let mut ix = *off as usize;
            let s = read_string_data(bytes, &mut ix)?;
            strings.push(g.make_string(&s));
        }
        let mut types = Vec::with_capacity(dex.type_ids.len());
        for s in &dex.type_ids {
            types.push(g.make_type(&g.string(strings[*s as usize])));
        }
        let type_at = |idx: u32| -> Result<TypeId> { Ok(types[check_index("type", idx, types.len())?]) };
        let string_at = |idx: u32| -> Result<StringId> { Ok(strings[check_index("string", idx, strings.len())?]) };

        let mut protos = Vec::with_capacity(dex.proto_ids.len());
        for p in &dex.proto_ids {
            let rtype = type_at(p.return_type_idx)?;
            let args = read_type_list(bytes, p.parameters_off)?
                .into_iter()
                .map(|t| type_at(t))
                .collect::<Result<Vec<_>>>()?;
            protos.push(g.make_proto(rtype, &args));
        }
        let mut fields = Vec::with_capacity(dex.field_ids.len());
        for f in &dex.field_ids {
            fields.push(g.make_field(type_at(f.class_idx as u32)?, string_at(f.name_idx)?, type_at(f.type_idx as u32)?));
        }
        let mut methods = Vec::with_capacity(dex.method_ids.len());
        for m in &dex.method_ids {
            let proto = protos[check_index("proto", m.proto_idx as u32, protos.len())?];
            methods.push(g.make_method(type_at(m.class_idx as u32)?, string_at(m.name_idx)?, proto));
        }
        let mut method_handles = Vec::with_capacity(dex.method_handles.len());
        for h in &dex.method_handles {
            let kind = MethodHandleKind::from_u16(h.kind)
                .ok_or_else(|| DexError::new(format!("bad method handle kind {}", h.kind)))?;
            let target = if kind.is_invoke() {
                MethodHandleTarget::Method(methods[check_index("method", h.target_idx as u32, methods.len())?])
            } else {
                MethodHandleTarget::Field(fields[check_index("field", h.target_idx as u32, fields.len())?])
            };
            method_handles.push(g.make_method_handle(kind, target));
        }
        let mut refs = DexRefs {
            location: dex.location.clone(),
            bytes: Arc::clone(&dex.bytes),
            strings,
            types,
            protos,
            fields,
            methods,
            method_handles,
            call_sites: Vec::new(),
            policy: self.policy,
        };
        let mut call_sites = Vec::with_capacity(dex.call_site_offs.len());
        for off in &dex.call_site_offs {
            let mut ix = *off as usize;
            let values = read_encoded_array(bytes, &mut ix, &refs, self.policy)?;
            let cs = match values.as_slice() {
                [EncodedValue::MethodHandle(bootstrap), EncodedValue::String(name), EncodedValue::MethodType(proto), rest @ ..] => {
                    CallSiteData { bootstrap: *bootstrap, name: *name, proto: *proto, args: rest.to_vec() }
                }
                _ => return Err(DexError::malformed(*off as usize, "call site item lacks handle, name and type")),
            };
            call_sites.push(g.make_call_site(cs));
        }
        refs.call_sites = call_sites;
        Ok(refs)
    }

    fn annotation_set(&self, refs: &DexRefs, off: u32) -> Result<Option<AnnotationSet>> {
        if off == 0 {
            return Ok(None);
        }
        let set = AnnotationSet::read_at(&refs.bytes, off, refs, refs.policy)?;
        Ok(if set.is_empty() { None } else { Some(set) })
    }

    fn load_class(&self, dex: &DexFile, refs: &Arc<DexRefs>, def: &ClassDefItem) -> Result<DexClass> {
        let g = self.g;
        let bytes: &[u8] = &dex.bytes;
        let ty = refs.type_id(def.class_idx)?;
        let super_class = if def.superclass_idx == NO_INDEX { None } else { Some(refs.type_id(def.superclass_idx)?) };
        let mut class = DexClass::new(ty, super_class, AccessFlags::from_bits_retain(def.access_flags));
        class.location = refs.location.clone();
        class.interfaces = read_type_list(bytes, def.interfaces_off)?
            .into_iter()
            .map(|t| refs.type_id(t))
            .collect::<Result<_>>()?;
        if def.source_file_idx != NO_INDEX {
            class.source_file = Some(refs.string(def.source_file_idx)?);
        }

        let mut dir = AnnotationsDirectoryItem::default();
        if def.annotations_off != 0 {
            let mut ix = def.annotations_off as usize;
            dir = AnnotationsDirectoryItem::read(bytes, &mut ix)?;
            class.annotations = self.annotation_set(refs, dir.class_annotations_off)?;
        }
        let field_annos: HashMap<u32, u32> = dir.field_annotations.iter().map(|m| (m.idx, m.annotations_off)).collect();
        let method_annos: HashMap<u32, u32> = dir.method_annotations.iter().map(|m| (m.idx, m.annotations_off)).collect();
        let param_annos: HashMap<u32, u32> = dir.parameter_annotations.iter().map(|m| (m.idx, m.annotations_off)).collect();

        if def.class_data_off != 0 {
            let mut ix = def.class_data_off as usize;
            let data = ClassDataItem::read(bytes, &mut ix)?;
            for (list, out) in [(&data.static_fields, &mut class.sfields), (&data.instance_fields, &mut class.ifields)] {
                for f in list {
                    let mut field = DexField::new(refs.field(f.field_idx)?, AccessFlags::from_bits_retain(f.access_flags));
                    if let Some(off) = field_annos.get(&f.field_idx) {
                        field.annotations = self.annotation_set(refs, *off)?;
                    }
                    out.push(field);
                }
            }
            for (list, is_virtual) in [(&data.direct_methods, false), (&data.virtual_methods, true)] {
                for em in list {
                    let reference = refs.method(em.method_idx)?;
                    if class.find_method(reference).is_some() {
                        return Err(DexError::with_kind(
                            crate::error::ErrorKind::DuplicateMethods,
                            format!("duplicate method {}", g.show_method(reference)),
                        )
                        .extra("method", g.show_method(reference))
                        .extra("class", g.descriptor(ty).to_string()));
                    }
                    let access = AccessFlags::from_bits_retain(em.access_flags);
                    let mut method = DexMethod::new(reference, access);
                    if em.code_off != 0 {
                        method = method.with_pending(PendingCode {
                            refs: Arc::clone(refs),
                            code_off: em.code_off,
                            method: reference,
                            is_static: access.contains(AccessFlags::STATIC),
                            source_file: class.source_file,
                        });
                    }
                    if let Some(off) = method_annos.get(&em.method_idx) {
                        method.annotations = self.annotation_set(refs, *off)?;
                    }
                    if let Some(off) = param_annos.get(&em.method_idx) {
                        let mut ix = *off as usize;
                        let list = AnnotationSetRefList::read(bytes, &mut ix)?;
                        for (i, set_off) in list.list.iter().enumerate() {
                            if let Some(set) = self.annotation_set(refs, *set_off)? {
                                method.param_annotations.insert(i as u32, set);
                            }
                        }
                    }
                    if is_virtual {
                        class.vmethods.push(method);
                    } else {
                        class.dmethods.push(method);
                    }
                }
            }
        }

        if def.static_values_off != 0 {
            let mut ix = def.static_values_off as usize;
            let values = read_encoded_array(bytes, &mut ix, refs.as_ref(), refs.policy)?;
            if values.len() > class.sfields.len() {
                warn!("[loader] {} has more static values than static fields", g.descriptor(ty));
            }
            for (field, value) in class.sfields.iter_mut().zip(values) {
                let desc = g.descriptor(g.field(field.reference).ty);
                // unknown tags come back as null; a primitive slot needs its own zero
                let value = if matches!(value, EncodedValue::Null) && !types::is_object(&desc) {
                    EncodedValue::zero_for_type(&desc)
                } else {
                    value
                };
                field.static_value = Some(value);
            }
        }
        Ok(class)
    }
}

/// Classes of several DEX files, one list per file, in input order.
pub fn load_dex_files(g: &Interner, paths: &[impl AsRef<Path>], strict_encoded_values: bool) -> Result<Vec<(String, Vec<DexClass>)>> {
    let loader = DexLoader::new(g, strict_encoded_values);
    paths
        .iter()
        .map(|p| {
            let p = p.as_ref();
            Ok((p.display().to_string(), loader.load_file(p)?))
        })
        .collect()
}
