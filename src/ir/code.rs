//! Editable method bodies.
//!
//! `IRCode` is a doubly linked list of method items stored in an arena. Item ids stay valid
//! until the item is erased, so branch targets and catch chains can point at other items.
//! While a CFG is built the linear list is empty and the items live in the CFG's blocks.

use std::sync::Arc;

use crate::always_assert_log;
use crate::cfg::graph::ControlFlowGraph;
use crate::error::Result;
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::interner::{Interner, MethodId, StringId, TypeId};
use crate::ir::opcode::IROpcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u32);

impl ItemId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchTargetKind {
    Simple,
    Case(i32),
}

/// Marks the position a branch instruction (`src`) jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchTarget {
    pub src: ItemId,
    pub kind: BranchTargetKind,
}

/// One handler of a catch chain; `None` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatchEntry {
    pub catch_type: Option<TypeId>,
    pub next: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DexPosition {
    pub method: Option<MethodId>,
    pub file: Option<StringId>,
    pub line: u32,
    pub parent: Option<Arc<DexPosition>>,
}

impl DexPosition {
    pub fn new(method: Option<MethodId>, file: Option<StringId>, line: u32) -> Self {
        DexPosition { method, file, line, parent: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DexDebugInstruction {
    StartLocal { reg: Reg, name: Option<StringId>, ty: Option<TypeId>, sig: Option<StringId> },
    EndLocal(Reg),
    RestartLocal(Reg),
    SetPrologueEnd,
    SetEpilogueBegin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodItemEntry {
    Opcode(IRInstruction),
    Target(BranchTarget),
    /// Opens a try region whose handlers start at the given `Catch` item.
    TryStart(ItemId),
    TryEnd(ItemId),
    Catch(CatchEntry),
    Debug(DexDebugInstruction),
    Position(Arc<DexPosition>),
    Fallthrough,
    SourceBlock(u32),
}

impl MethodItemEntry {
    pub fn insn(&self) -> Option<&IRInstruction> {
        match self {
            MethodItemEntry::Opcode(i) => Some(i),
            _ => None,
        }
    }

    pub fn insn_mut(&mut self) -> Option<&mut IRInstruction> {
        match self {
            MethodItemEntry::Opcode(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_opcode(&self) -> bool {
        matches!(self, MethodItemEntry::Opcode(_))
    }
}

#[derive(Debug, Clone)]
struct Node {
    entry: MethodItemEntry,
    prev: Option<ItemId>,
    next: Option<ItemId>,
}

#[derive(Debug, Clone)]
pub struct IRCode {
    nodes: Vec<Option<Node>>,
    head: Option<ItemId>,
    tail: Option<ItemId>,
    len: usize,
    registers_size: u32,
    cfg: Option<ControlFlowGraph>,
    pub param_names: Vec<Option<StringId>>,
}

impl IRCode {
    pub fn new(registers_size: u32) -> Self {
        IRCode {
            nodes: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            registers_size,
            cfg: None,
            param_names: Vec::new(),
        }
    }

    pub fn from_entries<I: IntoIterator<Item = MethodItemEntry>>(registers_size: u32, entries: I) -> Self {
        let mut code = IRCode::new(registers_size);
        for e in entries {
            code.push_back(e);
        }
        code
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    /// Grows the register frame; shrinking is left to register allocation.
    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = self.registers_size.max(size);
    }

    pub fn allocate_temp(&mut self) -> Reg {
        let r = self.registers_size;
        self.registers_size += 1;
        r
    }

    pub fn allocate_wide_temp(&mut self) -> Reg {
        let r = self.registers_size;
        self.registers_size += 2;
        r
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<ItemId> {
        self.head
    }

    pub fn last(&self) -> Option<ItemId> {
        self.tail
    }

    pub fn next(&self, id: ItemId) -> Option<ItemId> {
        self.node(id).and_then(|n| n.next)
    }

    pub fn prev(&self, id: ItemId) -> Option<ItemId> {
        self.node(id).and_then(|n| n.prev)
    }

    fn node(&self, id: ItemId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.node(id).is_some()
    }

    pub fn get(&self, id: ItemId) -> Option<&MethodItemEntry> {
        self.node(id).map(|n| &n.entry)
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut MethodItemEntry> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut()).map(|n| &mut n.entry)
    }

    pub fn insn(&self, id: ItemId) -> Option<&IRInstruction> {
        self.get(id).and_then(|e| e.insn())
    }

    pub fn insn_mut(&mut self, id: ItemId) -> Option<&mut IRInstruction> {
        self.get_mut(id).and_then(|e| e.insn_mut())
    }

    fn alloc(&mut self, entry: MethodItemEntry) -> ItemId {
        let id = ItemId(self.nodes.len() as u32);
        self.nodes.push(Some(Node { entry, prev: None, next: None }));
        self.len += 1;
        id
    }

    /// Reserves an id without linking it; `link_reserved_back` fills it in later. Lets callers
    /// create items that refer to each other.
    pub fn reserve(&mut self) -> ItemId {
        let id = ItemId(self.nodes.len() as u32);
        self.nodes.push(None);
        id
    }

    pub fn link_reserved_back(&mut self, id: ItemId, entry: MethodItemEntry) {
        self.nodes[id.index()] = Some(Node { entry, prev: self.tail, next: None });
        self.len += 1;
        match self.tail {
            Some(t) => self.link_next(t, Some(id)),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn link_next(&mut self, id: ItemId, next: Option<ItemId>) {
        if let Some(Some(n)) = self.nodes.get_mut(id.index()) {
            n.next = next;
        }
    }

    fn link_prev(&mut self, id: ItemId, prev: Option<ItemId>) {
        if let Some(Some(n)) = self.nodes.get_mut(id.index()) {
            n.prev = prev;
        }
    }

    pub fn push_back(&mut self, entry: MethodItemEntry) -> ItemId {
        let id = self.alloc(entry);
        self.link_prev(id, self.tail);
        match self.tail {
            Some(t) => self.link_next(t, Some(id)),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    pub fn push_front(&mut self, entry: MethodItemEntry) -> ItemId {
        match self.head {
            Some(h) => self.insert_before(h, entry),
            None => self.push_back(entry),
        }
    }

    pub fn insert_before(&mut self, pos: ItemId, entry: MethodItemEntry) -> ItemId {
        let prev = self.prev(pos);
        let id = self.alloc(entry);
        self.link_prev(id, prev);
        self.link_next(id, Some(pos));
        self.link_prev(pos, Some(id));
        match prev {
            Some(p) => self.link_next(p, Some(id)),
            None => self.head = Some(id),
        }
        id
    }

    pub fn insert_after(&mut self, pos: ItemId, entry: MethodItemEntry) -> ItemId {
        let next = self.next(pos);
        match next {
            Some(n) => self.insert_before(n, entry),
            None => self.push_back(entry),
        }
    }

    /// Unlinks an item and returns it. Branch targets that point at a removed branch are the
    /// caller's concern; `remove_opcode` handles them.
    pub fn erase(&mut self, id: ItemId) -> Option<MethodItemEntry> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        match node.prev {
            Some(p) => self.link_next(p, node.next),
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.link_prev(n, node.prev),
            None => self.tail = node.prev,
        }
        self.len -= 1;
        Some(node.entry)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { code: self, cur: self.head }
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn entries(&self) -> Vec<MethodItemEntry> {
        self.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn instructions(&self) -> impl Iterator<Item = (ItemId, &IRInstruction)> {
        self.iter().filter_map(|(id, e)| e.insn().map(|i| (id, i)))
    }

    pub fn count_opcodes(&self) -> usize {
        match &self.cfg {
            Some(cfg) => cfg.num_opcodes(),
            None => self.instructions().count(),
        }
    }

    /// Ids of the leading `load-param*` instructions.
    pub fn param_instructions(&self) -> Vec<ItemId> {
        self.instructions()
            .take_while(|(_, i)| i.opcode().is_load_param())
            .map(|(id, _)| id)
            .collect()
    }

    /// Targets pointing at the branch `src`.
    pub fn targets_of(&self, src: ItemId) -> Vec<ItemId> {
        self.iter()
            .filter_map(|(id, e)| match e {
                MethodItemEntry::Target(t) if t.src == src => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Replaces a non-branch instruction by a sequence. The first replacement keeps the
    /// original item id.
    pub fn replace_opcode(&mut self, id: ItemId, mut replacements: Vec<IRInstruction>) -> Result<()> {
        always_assert_log!(!replacements.is_empty(), "empty replacement for item {:?}", id);
        let old = self.insn(id).map(|i| i.opcode());
        always_assert_log!(
            old.map_or(false, |op| !op.is_branch()),
            "replace_opcode on branch or non-opcode item {:?}",
            id
        );
        let rest = replacements.split_off(1);
        if let (Some(slot), Some(first)) = (self.get_mut(id), replacements.pop()) {
            *slot = MethodItemEntry::Opcode(first);
        }
        let mut pos = id;
        for insn in rest {
            pos = self.insert_after(pos, MethodItemEntry::Opcode(insn));
        }
        Ok(())
    }

    /// Replaces a branch. A `goto` replacement keeps the targets (case targets become simple);
    /// any other replacement drops them, and a `nop` replacement erases the branch.
    pub fn replace_branch(&mut self, id: ItemId, replacement: IRInstruction) -> Result<()> {
        let is_branch = self.insn(id).map_or(false, |i| i.opcode().is_branch());
        always_assert_log!(is_branch, "replace_branch on non-branch item {:?}", id);
        let targets = self.targets_of(id);
        if replacement.opcode() == IROpcode::Goto {
            // A switch collapses onto its first case target.
            for (i, t) in targets.iter().enumerate() {
                if i == 0 {
                    if let Some(MethodItemEntry::Target(bt)) = self.get_mut(*t) {
                        bt.kind = BranchTargetKind::Simple;
                    }
                } else {
                    self.erase(*t);
                }
            }
            if let Some(slot) = self.get_mut(id) {
                *slot = MethodItemEntry::Opcode(replacement);
            }
        } else {
            for t in targets {
                self.erase(t);
            }
            if replacement.opcode() == IROpcode::Nop {
                self.erase(id);
            } else if let Some(slot) = self.get_mut(id) {
                *slot = MethodItemEntry::Opcode(replacement);
            }
        }
        Ok(())
    }

    /// Removes an instruction together with any targets of it.
    pub fn remove_opcode(&mut self, id: ItemId) {
        if self.insn(id).map_or(false, |i| i.opcode().is_branch()) {
            for t in self.targets_of(id) {
                self.erase(t);
            }
        }
        self.erase(id);
    }

    // CFG

    pub fn cfg_built(&self) -> bool {
        self.cfg.is_some()
    }

    pub fn cfg(&self) -> Option<&ControlFlowGraph> {
        self.cfg.as_ref()
    }

    pub fn cfg_mut(&mut self) -> Option<&mut ControlFlowGraph> {
        self.cfg.as_mut()
    }

    /// Moves the items into a freshly built CFG. Building twice is a no-op.
    pub fn build_cfg(&mut self) -> Result<()> {
        if self.cfg.is_some() {
            return Ok(());
        }
        let cfg = ControlFlowGraph::build(self)?;
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.cfg = Some(cfg);
        Ok(())
    }

    /// Splices the CFG back into the linear list.
    pub fn clear_cfg(&mut self) -> Result<()> {
        if let Some(cfg) = self.cfg.take() {
            let linear = cfg.linearize()?;
            self.registers_size = self.registers_size.max(cfg.registers_size());
            self.nodes = linear.nodes;
            self.head = linear.head;
            self.tail = linear.tail;
            self.len = linear.len;
        }
        Ok(())
    }

    pub fn show(&self, g: &Interner) -> String {
        crate::ir::assembler::print_code(self, g)
    }
}

pub struct Iter<'a> {
    code: &'a IRCode,
    cur: Option<ItemId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (ItemId, &'a MethodItemEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        let node = self.code.node(id)?;
        self.cur = node.next;
        Some((id, &node.entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::const_insn;

    fn op(insn: IRInstruction) -> MethodItemEntry {
        MethodItemEntry::Opcode(insn)
    }

    #[test]
    fn test_list_edits() {
        let mut code = IRCode::new(2);
        let a = code.push_back(op(const_insn(0, 1)));
        let c = code.push_back(op(IRInstruction::new(IROpcode::ReturnVoid)));
        let b = code.insert_after(a, op(const_insn(1, 2)));
        let z = code.push_front(op(const_insn(0, 0)));
        assert_eq!(code.ids(), vec![z, a, b, c]);
        code.erase(a);
        assert_eq!(code.ids(), vec![z, b, c]);
        assert_eq!(code.prev(b), Some(z));
        assert_eq!(code.len(), 3);
        assert!(!code.contains(a));
        assert_eq!(code.allocate_temp(), 2);
        assert_eq!(code.allocate_wide_temp(), 3);
        assert_eq!(code.registers_size(), 5);
    }

    #[test]
    fn test_replace_branch_with_nop_drops_targets() {
        let mut code = IRCode::new(1);
        code.push_back(op(const_insn(0, 0)));
        let br = code.push_back(op(IRInstruction::new(IROpcode::IfEqz).with_srcs(vec![0])));
        code.push_back(op(const_insn(0, 1)));
        code.push_back(MethodItemEntry::Target(BranchTarget { src: br, kind: BranchTargetKind::Simple }));
        code.push_back(op(IRInstruction::new(IROpcode::ReturnVoid)));
        assert_eq!(code.targets_of(br).len(), 1);
        code.replace_branch(br, IRInstruction::new(IROpcode::Nop)).unwrap();
        assert_eq!(code.len(), 3);
        assert!(code.iter().all(|(_, e)| e.is_opcode()));
    }

    #[test]
    fn test_replace_opcode_sequence() {
        let mut code = IRCode::new(2);
        let a = code.push_back(op(const_insn(0, 1)));
        code.push_back(op(IRInstruction::new(IROpcode::ReturnVoid)));
        code.replace_opcode(a, vec![const_insn(0, 5), const_insn(1, 6)]).unwrap();
        let lits: Vec<i64> = code.instructions().filter_map(|(_, i)| i.literal()).collect();
        assert_eq!(lits, vec![5, 6]);
        assert_eq!(code.insn(a).and_then(|i| i.literal()), Some(5));
    }
}
