//! Lowers [`IRCode`] back to a DEX `code_item` plus its `debug_info_item`.
//!
//! The smallest encoding is chosen for every instruction. Branches start at their short
//! forms and are widened until every offset fits. Payloads go after the last instruction,
//! and try regions are rebuilt from the `TryStart`/`TryEnd` markers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::trace;
use once_cell::sync::Lazy;
use rangemap::RangeMap;

use crate::dex::dex_file::*;
use crate::dex::instruction_codec::{encode, encode_payload, Payload, RawInsn};
use crate::dex::opcodes::{Opcode, OPCODES};
use crate::dex::{write_sleb128, write_u1, write_uleb128, write_uleb128p1, IndexResolver};
use crate::error::{DexError, Result};
use crate::ir::code::{BranchTargetKind, DexDebugInstruction, DexPosition, IRCode, ItemId, MethodItemEntry};
use crate::ir::instruction::{IRInstruction, Operand, Reg};
use crate::ir::interner::{Interner, MethodId, StringId, TypeId};
use crate::ir::opcode::IROpcode;
use crate::ir::types;

/// Encodings of every IR opcode, smallest first.
static CANDIDATES: Lazy<HashMap<IROpcode, Vec<&'static Opcode>>> = Lazy::new(|| {
    let mut map: HashMap<IROpcode, Vec<&'static Opcode>> = HashMap::new();
    for op in OPCODES.iter().flatten() {
        map.entry(op.ir).or_default().push(op);
    }
    // literal arithmetic may switch between the lit8 and lit16 families
    for k in 0..8u8 {
        let (lit16, lit8) = (&OPCODES[0xd0 + k as usize], &OPCODES[0xd8 + k as usize]);
        if let (Some(a), Some(b)) = (lit16.as_ref(), lit8.as_ref()) {
            map.entry(a.ir).or_default().push(b);
            map.entry(b.ir).or_default().push(a);
        }
    }
    for list in map.values_mut() {
        list.sort_by_key(|o| (o.format.units(), o.value));
        list.dedup_by_key(|o| o.value);
    }
    map
});

/// A lowered method body. `item.debug_info_off` is left for the writer to fill in.
#[derive(Debug, Clone)]
pub(crate) struct LoweredCode {
    pub item: CodeItem,
    pub debug_info: Option<Vec<u8>>,
}

struct Op {
    insn: IRInstruction,
    pseudo_dest: Option<Reg>,
    candidates: &'static [&'static Opcode],
    selected: usize,
    index: u32,
    index2: u32,
    /// Op index of a goto/if target.
    branch: Option<usize>,
    payload: Option<usize>,
}

impl Op {
    fn opcode(&self) -> &'static Opcode {
        self.candidates[self.selected]
    }

    fn units(&self) -> usize {
        self.opcode().format.units()
    }
}

enum PendingPayload {
    Switch { cases: Vec<(i32, usize)>, fallthrough: usize, switch_op: usize },
    Array(Arc<crate::ir::instruction::ArrayData>),
}

impl PendingPayload {
    fn is_packed(cases: &[(i32, usize)]) -> bool {
        let (Some(first), Some(last)) = (cases.first(), cases.last()) else { return true };
        let range = last.0 as i64 - first.0 as i64 + 1;
        // packed: 4 + 2 * range units, sparse: 2 + 4 * n
        4 + 2 * range <= 2 + 4 * cases.len() as i64
    }

    fn units(&self) -> usize {
        match self {
            PendingPayload::Switch { cases, .. } => {
                if Self::is_packed(cases) {
                    let range = cases.last().map_or(0, |l| (l.0 as i64 - cases[0].0 as i64 + 1) as usize);
                    4 + 2 * range
                } else {
                    2 + 4 * cases.len()
                }
            }
            PendingPayload::Array(d) => 4 + (d.data.len() + 1) / 2,
        }
    }
}

struct TryRange {
    start: usize,
    end: usize,
    head: ItemId,
}

enum Event {
    Position(Arc<DexPosition>),
    Debug(DexDebugInstruction),
}

pub(crate) struct Lowering<'a> {
    g: &'a Interner,
    idx: &'a dyn IndexResolver,
    method: MethodId,
    is_static: bool,
    source_file: Option<StringId>,
}

impl<'a> Lowering<'a> {
    pub(crate) fn new(
        g: &'a Interner,
        idx: &'a dyn IndexResolver,
        method: MethodId,
        is_static: bool,
        source_file: Option<StringId>,
    ) -> Self {
        Lowering { g, idx, method, is_static, source_file }
    }

    pub(crate) fn lower(&self, code: &IRCode) -> Result<LoweredCode> {
        let linear;
        let code = if code.cfg_built() {
            let mut c = code.clone();
            c.clear_cfg()?;
            linear = c;
            &linear
        } else {
            code
        };
        self.lower_linear(code)
            .map_err(|e| e.context(format!("lowering {}", self.g.show_method(self.method))))
    }

    fn param_types(&self) -> Vec<TypeId> {
        let g = self.g;
        let m = g.method(self.method);
        let mut out = Vec::new();
        if !self.is_static {
            out.push(m.class);
        }
        out.extend(g.proto(m.proto).args.iter().copied());
        out
    }

    fn make_op(&self, insn: IRInstruction) -> Result<Op> {
        let ir = insn.opcode();
        let candidates = CANDIDATES
            .get(&ir)
            .map(Vec::as_slice)
            .ok_or_else(|| DexError::new(format!("{} has no DEX encoding", ir.name())))?;
        let idx = self.idx;
        let (index, index2) = match insn.operand() {
            Operand::String(s) => (idx.string_idx(*s)?, 0),
            Operand::Type(t) => (idx.type_idx(*t)?, 0),
            Operand::Field(f) => (idx.field_idx(*f)?, 0),
            Operand::Method(m) => (idx.method_idx(*m)?, 0),
            Operand::MethodAndProto(m, p) => (idx.method_idx(*m)?, idx.proto_idx(*p)?),
            Operand::Proto(p) => (idx.proto_idx(*p)?, 0),
            Operand::CallSite(c) => (idx.call_site_idx(*c)?, 0),
            Operand::MethodHandle(h) => (idx.method_handle_idx(*h)?, 0),
            Operand::None | Operand::Literal(_) | Operand::Data(_) => (0, 0),
        };
        Ok(Op { insn, pseudo_dest: None, candidates, selected: 0, index, index2, branch: None, payload: None })
    }

    /// Registers in DEX operand order for `op`, or `None` if `op` cannot express `insn`.
    fn dex_regs(&self, insn: &IRInstruction, pseudo_dest: Option<Reg>, op: &Opcode) -> Option<Vec<u32>> {
        let ir = insn.opcode();
        if ir.has_move_result_pseudo() {
            let d = pseudo_dest?;
            let mut regs = vec![d];
            if ir != IROpcode::CheckCast {
                regs.extend_from_slice(insn.srcs());
            }
            return Some(regs);
        }
        if ir.is_invoke() {
            let mut regs = Vec::new();
            for (i, r) in insn.srcs().iter().enumerate() {
                regs.push(*r);
                if insn.src_is_wide(i, self.g) {
                    regs.push(*r + 1);
                }
            }
            return Some(regs);
        }
        if op.is_2addr() {
            let d = insn.dest()?;
            if insn.srcs_size() != 2 || insn.src(0) != d {
                return None;
            }
            return Some(vec![d, insn.src(1)]);
        }
        Some(insn.dest().into_iter().chain(insn.srcs().iter().copied()).collect())
    }

    fn raw(&self, op: &Op, cand: &'static Opcode, offset: i32) -> Option<RawInsn> {
        let regs = self.dex_regs(&op.insn, op.pseudo_dest, cand)?;
        Some(RawInsn {
            regs,
            literal: op.insn.literal().unwrap_or(0),
            index: op.index,
            index2: op.index2,
            offset,
            ..RawInsn::new(cand.value)
        })
    }

    /// Picks the first candidate from `op.selected` on that encodes with `offset`.
    fn select(&self, op: &mut Op, offset: i32) -> Result<bool> {
        let start = op.selected;
        let mut scratch = Vec::new();
        for i in start..op.candidates.len() {
            let cand = op.candidates[i];
            if let Some(raw) = self.raw(op, cand, offset) {
                scratch.clear();
                if encode(&raw, &mut scratch).is_ok() {
                    op.selected = i;
                    return Ok(i != start);
                }
            }
        }
        Err(DexError::new(format!("no encoding of {} fits its operands", op.insn.show(self.g))))
    }

    fn lower_linear(&self, code: &IRCode) -> Result<LoweredCode> {
        let g = self.g;
        let mut registers_size = code.registers_size();

        // parameters
        let params: Vec<(Reg, IROpcode)> = code
            .instructions()
            .filter(|(_, i)| i.opcode().is_load_param())
            .map(|(_, i)| (i.dest().unwrap_or(0), i.opcode()))
            .collect();
        let param_types = self.param_types();
        let ins_size: u32 = param_types.iter().map(|t| if types::is_wide(&g.descriptor(*t)) { 2 } else { 1 }).sum();
        if !params.is_empty() && params.len() != param_types.len() {
            return Err(DexError::new(format!(
                "{} load-param instructions for {} parameters",
                params.len(),
                param_types.len()
            )));
        }
        let mut ops: Vec<Op> = Vec::new();
        let top = registers_size.saturating_sub(ins_size);
        let mut expected = top;
        let mut in_place = registers_size >= ins_size;
        for (reg, op) in &params {
            in_place &= *reg == expected;
            expected += if *op == IROpcode::LoadParamWide { 2 } else { 1 };
        }
        if !in_place {
            // the body writes registers above the incoming ones; copy the params down
            let base = registers_size;
            registers_size += ins_size;
            let mut from = base;
            for (reg, op) in &params {
                let mv = match op {
                    IROpcode::LoadParamWide => IROpcode::MoveWide,
                    IROpcode::LoadParamObject => IROpcode::MoveObject,
                    _ => IROpcode::Move,
                };
                ops.push(self.make_op(IRInstruction::new(mv).with_dest(*reg).with_srcs(vec![from]))?);
                from += if *op == IROpcode::LoadParamWide { 2 } else { 1 };
            }
        }
        if registers_size > u16::MAX as u32 {
            return Err(DexError::new(format!("{} registers exceed the DEX limit", registers_size)));
        }

        // linear pass
        let mut op_of_item: HashMap<ItemId, usize> = HashMap::new();
        let mut pending_labels: Vec<(ItemId, BranchTargetKind)> = Vec::new();
        let mut resolved_labels: Vec<(ItemId, BranchTargetKind, usize)> = Vec::new();
        let mut pending_catches: Vec<ItemId> = Vec::new();
        let mut catch_at: HashMap<ItemId, usize> = HashMap::new();
        let mut open_tries: Vec<(ItemId, usize)> = Vec::new();
        let mut tries: Vec<TryRange> = Vec::new();
        let mut pending_events: Vec<Event> = Vec::new();
        let mut events: Vec<(usize, Event)> = Vec::new();
        let mut awaiting_pseudo: Option<usize> = None;

        for (id, entry) in code.iter() {
            match entry {
                MethodItemEntry::Opcode(insn) => {
                    let ir = insn.opcode();
                    if ir.is_load_param() {
                        continue;
                    }
                    if ir.is_move_result_pseudo() {
                        let Some(prev) = awaiting_pseudo.take() else {
                            return Err(DexError::new(format!("{} follows no result-producing op", ir.name())));
                        };
                        ops[prev].pseudo_dest = insn.dest();
                        self.fix_check_cast(&mut ops, prev)?;
                        continue;
                    }
                    if let Some(prev) = awaiting_pseudo {
                        return Err(DexError::new(format!(
                            "{} lacks its move-result-pseudo",
                            ops[prev].insn.show(g)
                        )));
                    }
                    if ir == IROpcode::Nop {
                        continue;
                    }
                    let at = ops.len();
                    for (src, kind) in pending_labels.drain(..) {
                        resolved_labels.push((src, kind, at));
                    }
                    for c in pending_catches.drain(..) {
                        catch_at.insert(c, at);
                    }
                    for e in pending_events.drain(..) {
                        events.push((at, e));
                    }
                    op_of_item.insert(id, at);
                    ops.push(self.make_op(insn.clone())?);
                    if ir.has_move_result_pseudo() {
                        awaiting_pseudo = Some(at);
                    }
                }
                MethodItemEntry::Target(t) => pending_labels.push((t.src, t.kind)),
                MethodItemEntry::Catch(_) => pending_catches.push(id),
                MethodItemEntry::TryStart(head) => open_tries.push((*head, ops.len())),
                MethodItemEntry::TryEnd(head) => {
                    let pos = open_tries.iter().rposition(|(h, _)| h == head).ok_or_else(|| {
                        DexError::new("try end without a matching try start")
                    })?;
                    let (_, start) = open_tries.remove(pos);
                    tries.push(TryRange { start, end: ops.len(), head: *head });
                }
                MethodItemEntry::Position(p) => pending_events.push(Event::Position(Arc::clone(p))),
                MethodItemEntry::Debug(d) => pending_events.push(Event::Debug(d.clone())),
                MethodItemEntry::Fallthrough | MethodItemEntry::SourceBlock(_) => {}
            }
        }
        if !pending_labels.is_empty() {
            return Err(DexError::new("branch target past the last instruction"));
        }
        if let Some(prev) = awaiting_pseudo {
            return Err(DexError::new(format!("{} lacks its move-result-pseudo", ops[prev].insn.show(g))));
        }
        if !open_tries.is_empty() {
            return Err(DexError::new("unterminated try region"));
        }
        let trailing_events: Vec<Event> = pending_events;

        // branches and payloads
        let mut switch_cases: BTreeMap<usize, Vec<(i32, usize)>> = BTreeMap::new();
        for (src, kind, label) in resolved_labels {
            let src_op = *op_of_item
                .get(&src)
                .ok_or_else(|| DexError::new("branch target refers to a missing instruction"))?;
            match kind {
                BranchTargetKind::Simple => ops[src_op].branch = Some(label),
                BranchTargetKind::Case(k) => switch_cases.entry(src_op).or_default().push((k, label)),
            }
        }
        let mut payloads: Vec<PendingPayload> = Vec::new();
        for i in 0..ops.len() {
            let ir = ops[i].insn.opcode();
            if ir == IROpcode::Switch {
                let mut cases = switch_cases.remove(&i).unwrap_or_default();
                cases.sort_by_key(|(k, _)| *k);
                cases.dedup_by_key(|(k, _)| *k);
                let packed = PendingPayload::is_packed(&cases);
                // packed-switch is the first candidate, sparse-switch the second
                ops[i].selected = if packed { 0 } else { 1 };
                ops[i].payload = Some(payloads.len());
                payloads.push(PendingPayload::Switch { cases, fallthrough: i + 1, switch_op: i });
            } else if ir == IROpcode::FillArrayData {
                let data = ops[i]
                    .insn
                    .data()
                    .cloned()
                    .ok_or_else(|| DexError::new("fill-array-data without data"))?;
                ops[i].payload = Some(payloads.len());
                payloads.push(PendingPayload::Array(data));
            } else if (ir.is_goto() || ir.is_conditional_branch()) && ops[i].branch.is_none() {
                return Err(DexError::new(format!("{} has no target", ops[i].insn.show(g))));
            }
        }

        // format selection; branches only ever grow
        for op in ops.iter_mut().filter(|o| o.branch.is_none() && o.payload.is_none()) {
            self.select(op, 0)?;
        }
        for op in ops.iter_mut().filter(|o| o.payload.is_some()) {
            self.select(op, 0)?;
        }
        let addrs = loop {
            let addrs = addresses(&ops);
            let mut changed = false;
            for i in 0..ops.len() {
                if let Some(t) = ops[i].branch {
                    let offset = addrs[t] as i64 - addrs[i] as i64;
                    changed |= self.select(&mut ops[i], offset as i32)?;
                }
            }
            if !changed {
                break addrs;
            }
        };
        let code_end = addrs[ops.len()];

        // payload addresses, each 4-byte aligned
        let mut payload_addrs = Vec::with_capacity(payloads.len());
        let mut cursor = code_end;
        for p in &payloads {
            if cursor % 2 != 0 {
                cursor += 1;
            }
            payload_addrs.push(cursor);
            cursor += p.units() as u32;
        }

        let mut insns: Vec<u16> = Vec::with_capacity(cursor as usize);
        for (i, op) in ops.iter().enumerate() {
            let offset = match (op.branch, op.payload) {
                (Some(t), _) => addrs[t] as i64 - addrs[i] as i64,
                (_, Some(p)) => payload_addrs[p] as i64 - addrs[i] as i64,
                _ => 0,
            };
            let raw = self
                .raw(op, op.opcode(), offset as i32)
                .ok_or_else(|| DexError::new(format!("cannot encode {}", op.insn.show(g))))?;
            encode(&raw, &mut insns).map_err(|e| e.context(op.insn.show(g)))?;
        }
        for (p, at) in payloads.iter().zip(&payload_addrs) {
            while (insns.len() as u32) < *at {
                insns.push(0);
            }
            let payload = match p {
                PendingPayload::Switch { cases, fallthrough, switch_op } => {
                    let base = addrs[*switch_op] as i64;
                    let rel = |op: usize| (addrs[op] as i64 - base) as i32;
                    if PendingPayload::is_packed(cases) {
                        let first_key = cases.first().map_or(0, |c| c.0);
                        let mut targets = Vec::new();
                        let mut it = cases.iter().peekable();
                        if let Some(last) = cases.last() {
                            for key in first_key as i64..=last.0 as i64 {
                                match it.peek() {
                                    Some((k, op)) if *k as i64 == key => {
                                        targets.push(rel(*op));
                                        it.next();
                                    }
                                    _ => targets.push(rel(*fallthrough)),
                                }
                            }
                        }
                        Payload::PackedSwitch { first_key, targets }
                    } else {
                        Payload::SparseSwitch {
                            keys: cases.iter().map(|c| c.0).collect(),
                            targets: cases.iter().map(|c| rel(c.1)).collect(),
                        }
                    }
                }
                PendingPayload::Array(d) => Payload::Array(Arc::clone(d)),
            };
            encode_payload(&payload, &mut insns);
        }

        let (tries_out, handlers) = self.lower_tries(code, &tries, &catch_at, &addrs)?;

        let outs_size = ops
            .iter()
            .filter(|o| o.insn.opcode().is_invoke())
            .map(|o| o.insn.src_words(g))
            .max()
            .unwrap_or(0);

        let debug_info = self.lower_debug_info(code, &events, trailing_events, &addrs)?;
        trace!("[lower] {}: {} code units", g.show_method(self.method), insns.len());
        Ok(LoweredCode {
            item: CodeItem {
                registers_size: registers_size as u16,
                ins_size: ins_size as u16,
                outs_size: outs_size as u16,
                debug_info_off: 0,
                insns,
                tries: tries_out,
                handlers,
            },
            debug_info,
        })
    }

    /// Check-cast reads and writes the same register in DEX; a differing result register
    /// gets a move in front.
    fn fix_check_cast(&self, ops: &mut Vec<Op>, at: usize) -> Result<()> {
        let op = &ops[at];
        if op.insn.opcode() != IROpcode::CheckCast {
            return Ok(());
        }
        let (Some(dest), Some(src)) = (op.pseudo_dest, op.insn.srcs().first().copied()) else {
            return Ok(());
        };
        if dest == src {
            return Ok(());
        }
        let mv = self.make_op(IRInstruction::new(IROpcode::MoveObject).with_dest(dest).with_srcs(vec![src]))?;
        ops[at].insn.set_srcs(vec![dest]);
        // labels, catches and positions already resolved to `at` now land on the move
        ops.insert(at, mv);
        Ok(())
    }

    fn lower_tries(
        &self,
        code: &IRCode,
        tries: &[TryRange],
        catch_at: &HashMap<ItemId, usize>,
        addrs: &[u32],
    ) -> Result<(Vec<TryItem>, Vec<(u16, EncodedCatchHandler)>)> {
        let idx = self.idx;
        let mut handlers: Vec<EncodedCatchHandler> = Vec::new();
        let mut ranges: RangeMap<u32, usize> = RangeMap::new();
        for t in tries {
            let (start, end) = (addrs[t.start], addrs[t.end]);
            if start >= end {
                continue;
            }
            let mut h = EncodedCatchHandler { handlers: Vec::new(), catch_all_addr: None };
            let mut cur = Some(t.head);
            while let Some(id) = cur {
                let Some(MethodItemEntry::Catch(c)) = code.get(id) else {
                    return Err(DexError::new("try region names a handler that is not a catch"));
                };
                let at = *catch_at.get(&id).ok_or_else(|| DexError::new("catch handler past the last instruction"))?;
                let addr = addrs[at];
                match c.catch_type {
                    Some(ty) => {
                        if h.catch_all_addr.is_some() {
                            return Err(DexError::new("catch-all must end its handler chain"));
                        }
                        h.handlers.push((idx.type_idx(ty)?, addr));
                    }
                    None => h.catch_all_addr = Some(addr),
                }
                cur = c.next;
            }
            let hi = match handlers.iter().position(|x| *x == h) {
                Some(i) => i,
                None => {
                    handlers.push(h);
                    handlers.len() - 1
                }
            };
            ranges.insert(start..end, hi);
        }
        let mut out = Vec::new();
        for (range, hi) in ranges.iter() {
            let mut start = range.start;
            while start < range.end {
                let n = (range.end - start).min(u16::MAX as u32);
                out.push(TryItem { start_addr: start, insn_count: n as u16, handler_off: *hi as u16 });
                start += n;
            }
        }
        let handlers = handlers.into_iter().enumerate().map(|(i, h)| (i as u16, h)).collect();
        Ok((out, handlers))
    }

    fn lower_debug_info(
        &self,
        code: &IRCode,
        events: &[(usize, Event)],
        trailing: Vec<Event>,
        addrs: &[u32],
    ) -> Result<Option<Vec<u8>>> {
        let g = self.g;
        let end = addrs[addrs.len() - 1];
        let all: Vec<(u32, &Event)> = events
            .iter()
            .map(|(op, e)| (addrs[*op], e))
            .chain(trailing.iter().map(|e| (end, e)))
            .collect();
        if all.is_empty() && code.param_names.iter().all(Option::is_none) {
            return Ok(None);
        }
        let idx = self.idx;
        let nparams = g.proto(g.method(self.method).proto).args.len();
        let line_start = all
            .iter()
            .find_map(|(_, e)| match e {
                Event::Position(p) => Some(p.line),
                _ => None,
            })
            .unwrap_or(0);

        let mut out = Vec::new();
        write_uleb128(&mut out, line_start);
        write_uleb128(&mut out, nparams as u32);
        for i in 0..nparams {
            let name = code.param_names.get(i).copied().flatten();
            write_uleb128p1(&mut out, name.map(|s| idx.string_idx(s)).transpose()?);
        }
        let opt_string = |s: Option<StringId>| s.map(|s| idx.string_idx(s)).transpose();
        let mut cur_addr = 0u32;
        let mut cur_line = line_start as i64;
        let mut cur_file = self.source_file;
        for (addr, e) in all {
            match e {
                Event::Position(p) => {
                    if p.file != cur_file {
                        write_u1(&mut out, DBG_SET_FILE);
                        write_uleb128p1(&mut out, opt_string(p.file)?);
                        cur_file = p.file;
                    }
                    let mut line_delta = p.line as i64 - cur_line;
                    let mut addr_delta = (addr - cur_addr) as i64;
                    if line_delta < DBG_LINE_BASE as i64 || line_delta >= (DBG_LINE_BASE + DBG_LINE_RANGE) as i64 {
                        write_u1(&mut out, DBG_ADVANCE_LINE);
                        write_sleb128(&mut out, line_delta as i32);
                        line_delta = 0;
                    }
                    let special = |ld: i64, ad: i64| {
                        (ld - DBG_LINE_BASE as i64) + ad * DBG_LINE_RANGE as i64 + DBG_FIRST_SPECIAL as i64
                    };
                    if special(line_delta, addr_delta) > 0xff {
                        write_u1(&mut out, DBG_ADVANCE_PC);
                        write_uleb128(&mut out, addr_delta as u32);
                        addr_delta = 0;
                    }
                    write_u1(&mut out, special(line_delta, addr_delta) as u8);
                    cur_addr = addr;
                    cur_line = p.line as i64;
                }
                Event::Debug(d) => {
                    if addr > cur_addr {
                        write_u1(&mut out, DBG_ADVANCE_PC);
                        write_uleb128(&mut out, addr - cur_addr);
                        cur_addr = addr;
                    }
                    match d {
                        DexDebugInstruction::StartLocal { reg, name, ty, sig } => {
                            write_u1(&mut out, if sig.is_some() { DBG_START_LOCAL_EXTENDED } else { DBG_START_LOCAL });
                            write_uleb128(&mut out, *reg);
                            write_uleb128p1(&mut out, opt_string(*name)?);
                            write_uleb128p1(&mut out, ty.map(|t| idx.type_idx(t)).transpose()?);
                            if sig.is_some() {
                                write_uleb128p1(&mut out, opt_string(*sig)?);
                            }
                        }
                        DexDebugInstruction::EndLocal(r) => {
                            write_u1(&mut out, DBG_END_LOCAL);
                            write_uleb128(&mut out, *r);
                        }
                        DexDebugInstruction::RestartLocal(r) => {
                            write_u1(&mut out, DBG_RESTART_LOCAL);
                            write_uleb128(&mut out, *r);
                        }
                        DexDebugInstruction::SetPrologueEnd => {
                            write_u1(&mut out, DBG_SET_PROLOGUE_END);
                        }
                        DexDebugInstruction::SetEpilogueBegin => {
                            write_u1(&mut out, DBG_SET_EPILOGUE_BEGIN);
                        }
                    }
                }
            }
        }
        write_u1(&mut out, DBG_END_SEQUENCE);
        Ok(Some(out))
    }
}

/// Start address of every op, plus the end address as the last element.
fn addresses(ops: &[Op]) -> Vec<u32> {
    let mut out = Vec::with_capacity(ops.len() + 1);
    let mut a = 0u32;
    for op in ops {
        out.push(a);
        a += op.units() as u32;
    }
    out.push(a);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::instruction_codec::{decode_all, Decoded};
    use crate::ir::assembler::parse_code;
    use crate::ir::interner::{CallSiteId, FieldId, MethodHandleId, ProtoId};

    /// Hands out index = interned id, which is all the encoder needs.
    struct Identity;

    impl IndexResolver for Identity {
        fn string_idx(&self, id: StringId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn type_idx(&self, id: TypeId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn proto_idx(&self, id: ProtoId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn field_idx(&self, id: FieldId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn method_idx(&self, id: MethodId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn method_handle_idx(&self, id: MethodHandleId) -> Result<u32> {
            Ok(id.index() as u32)
        }
        fn call_site_idx(&self, id: CallSiteId) -> Result<u32> {
            Ok(id.index() as u32)
        }
    }

    fn lower(g: &Interner, method: &str, is_static: bool, body: &str) -> LoweredCode {
        let m = g.make_method_from_str(method).unwrap();
        let code = parse_code(g, body).unwrap();
        Lowering::new(g, &Identity, m, is_static, None).lower(&code).unwrap()
    }

    fn ops(item: &CodeItem) -> Vec<u8> {
        decode_all(&item.insns)
            .unwrap()
            .into_iter()
            .filter_map(|(_, d)| match d {
                Decoded::Insn(i) => Some(i.op),
                Decoded::Payload(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_smallest_const_forms() {
        let g = Interner::new();
        let body = "((const v0 7) (const v0 1000) (const v0 0x120000) (const v0 0x123456) (const-wide v0 1) (return-void))";
        let out = lower(&g, "LFoo;.f:()V", true, body);
        assert_eq!(ops(&out.item), vec![0x12, 0x13, 0x15, 0x14, 0x16, 0x0e]);
        assert_eq!(out.item.registers_size, 2);
        assert_eq!(out.item.ins_size, 0);
    }

    #[test]
    fn test_two_address_and_lit_forms() {
        let g = Interner::new();
        let body = "((load-param v0) (load-param v1) (add-int v0 v0 v1) (add-int v2 v0 v1) \
                    (add-int/lit8 v0 v0 1000) (return v0))";
        let out = lower(&g, "LFoo;.f:(II)I", true, body);
        // lit8 with a wide literal moves to the lit16 family
        assert_eq!(ops(&out.item), vec![0x01, 0x01, 0xb0, 0x90, 0xd0, 0x0f]);
        assert_eq!(out.item.registers_size, 5);
        assert_eq!(out.item.ins_size, 2);
    }

    #[test]
    fn test_params_already_on_top() {
        let g = Interner::new();
        let out = lower(&g, "LFoo;.f:(J)J", true, "((load-param-wide v0) (return-wide v0))");
        assert_eq!(ops(&out.item), vec![0x10]);
        assert_eq!((out.item.registers_size, out.item.ins_size), (2, 2));
    }

    #[test]
    fn test_goto_widens_past_127_units() {
        let g = Interner::new();
        let mut body = String::from("((goto :end)");
        for _ in 0..70 {
            body.push_str(" (const v0 1000)");
        }
        body.push_str(" (:end) (return-void))");
        let out = lower(&g, "LFoo;.f:()V", true, &body);
        assert_eq!(ops(&out.item)[0], 0x29);
    }

    #[test]
    fn test_switch_payload_kinds() {
        let g = Interner::new();
        let dense = "((load-param v0) (switch v0 (:a :b)) (return-void) (:a 1) (:b 2) (return-void))";
        let out = lower(&g, "LFoo;.f:(I)V", true, dense);
        assert_eq!(ops(&out.item)[0], 0x2b);
        let sparse = "((load-param v0) (switch v0 (:a :b)) (return-void) (:a 1) (:b 1000) (return-void))";
        let out = lower(&g, "LFoo;.f:(I)V", true, sparse);
        assert_eq!(ops(&out.item)[0], 0x2c);
        assert_eq!(out.item.insns.len() % 2, 0);
    }

    #[test]
    fn test_try_regions_and_handlers() {
        let g = Interner::new();
        let body = r#"((load-param-object v1)
            (.try_start c0)
            (invoke-virtual (v1) "LFoo;.g:()V")
            (.try_end c0)
            (return-void)
            (.catch (c0) "Ljava/lang/Exception;")
            (move-exception v0)
            (throw v0))"#;
        let out = lower(&g, "LFoo;.f:()V", false, body);
        assert_eq!(out.item.tries.len(), 1);
        assert_eq!(out.item.tries[0].start_addr, 0);
        assert_eq!(out.item.tries[0].insn_count, 3);
        assert_eq!(out.item.handlers.len(), 1);
        assert_eq!(out.item.handlers[0].1.handlers[0].1, 4);
        assert_eq!(out.item.outs_size, 1);
    }

    #[test]
    fn test_missing_pseudo_result_is_rejected() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.f:()V").unwrap();
        let code = parse_code(&g, r#"((new-instance "LFoo;") (return-void))"#).unwrap();
        assert!(Lowering::new(&g, &Identity, m, true, None).lower(&code).is_err());
    }

    #[test]
    fn test_debug_positions() {
        let g = Interner::new();
        let body = r#"((.pos "LFoo;.f:()V" "Foo.java" 10) (const v0 1) (.pos "LFoo;.f:()V" "Foo.java" 30) (return-void))"#;
        let out = lower(&g, "LFoo;.f:()V", true, body);
        let info = out.debug_info.unwrap();
        // line_start 10, no params, set_file, special, advance_line, special, end
        assert_eq!(info[0], 10);
        assert_eq!(info[1], 0);
        assert_eq!(*info.last().unwrap(), DBG_END_SEQUENCE);
        assert!(info.contains(&DBG_ADVANCE_LINE));
    }
}
