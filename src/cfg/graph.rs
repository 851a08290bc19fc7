//! Editable control-flow graph.
//!
//! Building moves the method items into basic blocks. Branch targets, try markers, catch
//! entries and `goto`s are not kept as items; they become edges. Linearizing turns the edges
//! back into items, adding `goto`s only where a successor does not follow its predecessor.
//!
//! A throwing instruction ends its block only inside a try region, where it gets `Throw`
//! edges to its handlers. Exceptions escaping the method are implicit until
//! `calculate_exit_block` adds `Ghost` edges.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::trace;

use crate::error::{DexError, ErrorKind, Result};
use crate::ir::code::{BranchTarget, BranchTargetKind, CatchEntry, IRCode, ItemId, MethodItemEntry};
use crate::ir::instruction::{IRInstruction, Reg};
use crate::ir::interner::TypeId;
use crate::ir::opcode::IROpcode;

pub type BlockId = usize;
pub type EdgeId = usize;

pub const ENTRY_BLOCK_ID: BlockId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    /// Unconditional flow, including the fallthrough of a conditional branch.
    Goto,
    /// Taken side of an `if-*`, or one case of a `switch`.
    Branch,
    Throw,
    /// Joins exit points to the synthetic exit block.
    Ghost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThrowInfo {
    /// `None` catches everything.
    pub catch_type: Option<TypeId>,
    /// Position in the handler chain.
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub src: BlockId,
    pub target: BlockId,
    pub kind: EdgeType,
    pub case_key: Option<i32>,
    pub throw_info: Option<ThrowInfo>,
}

impl Edge {
    pub fn is_throw(&self) -> bool {
        self.kind == EdgeType::Throw
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    id: BlockId,
    items: Vec<MethodItemEntry>,
    preds: Vec<EdgeId>,
    succs: Vec<EdgeId>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn items(&self) -> &[MethodItemEntry] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Vec<MethodItemEntry> {
        &mut self.items
    }

    pub fn preds(&self) -> &[EdgeId] {
        &self.preds
    }

    pub fn succs(&self) -> &[EdgeId] {
        &self.succs
    }

    /// Instructions with their item index.
    pub fn instructions(&self) -> impl DoubleEndedIterator<Item = (usize, &IRInstruction)> {
        self.items.iter().enumerate().filter_map(|(i, e)| e.insn().map(|insn| (i, insn)))
    }

    pub fn first_insn(&self) -> Option<(usize, &IRInstruction)> {
        self.instructions().next()
    }

    pub fn last_insn(&self) -> Option<(usize, &IRInstruction)> {
        self.instructions().next_back()
    }

    pub fn num_opcodes(&self) -> usize {
        self.instructions().count()
    }

    pub fn is_empty(&self) -> bool {
        self.num_opcodes() == 0
    }
}

/// Address of an instruction inside a CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnRef {
    pub block: BlockId,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: BTreeMap<BlockId, Block>,
    edges: Vec<Option<Edge>>,
    entry: BlockId,
    exit: Option<BlockId>,
    ghost_exit: bool,
    next_block_id: BlockId,
    registers_size: u32,
}

fn ends_block(op: IROpcode) -> bool {
    op.is_branch() || op.is_return() || op == IROpcode::Throw
}

struct Builder {
    cfg: ControlFlowGraph,
    cur: Option<BlockId>,
    /// Block that falls into whatever block is created next.
    fallthrough: Option<BlockId>,
    active_try: Option<ItemId>,
    block_of_branch: HashMap<ItemId, BlockId>,
    block_of_goto: HashMap<ItemId, BlockId>,
    block_of_catch: HashMap<ItemId, BlockId>,
    targets: Vec<(BranchTarget, BlockId)>,
    throwing: Vec<(BlockId, ItemId)>,
}

impl Builder {
    fn open(&mut self) -> BlockId {
        if let Some(b) = self.cur {
            return b;
        }
        let b = self.cfg.new_block();
        if let Some(f) = self.fallthrough.take() {
            self.cfg.add_edge(f, b, EdgeType::Goto);
        }
        self.cur = Some(b);
        b
    }

    /// Starts a fresh block at the next item unless the current one holds no opcodes yet.
    fn split(&mut self) {
        if let Some(b) = self.cur {
            if !self.cfg.blocks[&b].is_empty() {
                self.cur = None;
                self.fallthrough = Some(b);
            }
        }
    }

    fn end(&mut self, falls_through: bool) {
        if let Some(b) = self.cur.take() {
            self.fallthrough = falls_through.then_some(b);
        }
    }

    fn push(&mut self, entry: MethodItemEntry) -> BlockId {
        let b = self.open();
        if let Some(block) = self.cfg.blocks.get_mut(&b) {
            block.items.push(entry);
        }
        b
    }
}

impl ControlFlowGraph {
    fn empty(registers_size: u32) -> Self {
        ControlFlowGraph {
            blocks: BTreeMap::new(),
            edges: Vec::new(),
            entry: ENTRY_BLOCK_ID,
            exit: None,
            ghost_exit: false,
            next_block_id: 0,
            registers_size,
        }
    }

    /// Partitions `code` into blocks. The code itself is left untouched.
    pub fn build(code: &IRCode) -> Result<ControlFlowGraph> {
        let mut b = Builder {
            cfg: ControlFlowGraph::empty(code.registers_size()),
            cur: None,
            fallthrough: None,
            active_try: None,
            block_of_branch: HashMap::new(),
            block_of_goto: HashMap::new(),
            block_of_catch: HashMap::new(),
            targets: Vec::new(),
            throwing: Vec::new(),
        };
        b.open();

        for (id, entry) in code.iter() {
            match entry {
                MethodItemEntry::Target(t) => {
                    b.split();
                    let block = b.open();
                    b.targets.push((*t, block));
                }
                MethodItemEntry::Catch(_) => {
                    b.split();
                    let block = b.open();
                    b.block_of_catch.insert(id, block);
                }
                MethodItemEntry::TryStart(c) => {
                    b.split();
                    b.active_try = Some(*c);
                }
                MethodItemEntry::TryEnd(_) => {
                    b.split();
                    b.active_try = None;
                }
                MethodItemEntry::Opcode(insn) => {
                    let op = insn.opcode();
                    if op == IROpcode::Goto {
                        let block = b.open();
                        b.block_of_goto.insert(id, block);
                        b.end(false);
                        continue;
                    }
                    let block = b.push(entry.clone());
                    if op.is_branch() {
                        b.block_of_branch.insert(id, block);
                        b.end(true);
                    } else if ends_block(op) {
                        b.end(false);
                    } else if op.can_throw() {
                        if let Some(c) = b.active_try {
                            b.throwing.push((block, c));
                            b.end(true);
                        }
                    }
                }
                _ => {
                    b.push(entry.clone());
                }
            }
        }
        if let Some(f) = b.fallthrough {
            trace!("[cfg] block {} falls off the end of the method", f);
        }

        let mut cfg = b.cfg;
        for (t, target) in b.targets {
            if let Some(&src) = b.block_of_branch.get(&t.src) {
                match t.kind {
                    BranchTargetKind::Simple => cfg.add_edge(src, target, EdgeType::Branch),
                    BranchTargetKind::Case(k) => cfg.add_branch_edge(src, target, Some(k)),
                };
            } else if let Some(&src) = b.block_of_goto.get(&t.src) {
                cfg.add_edge(src, target, EdgeType::Goto);
            } else {
                return Err(DexError::with_kind(
                    ErrorKind::InternalError,
                    format!("branch target {:?} points at no branch", t.src),
                ));
            }
        }
        for (block, first_catch) in b.throwing {
            let mut cur = Some(first_catch);
            let mut index = 0;
            let mut seen = HashSet::new();
            while let Some(c) = cur {
                if !seen.insert(c) {
                    return Err(DexError::new(format!("catch chain starting at {:?} loops", first_catch)));
                }
                let entry = match code.get(c) {
                    Some(MethodItemEntry::Catch(e)) => *e,
                    _ => return Err(DexError::new(format!("try region refers to {:?}, which is no catch", c))),
                };
                let handler = *b
                    .block_of_catch
                    .get(&c)
                    .ok_or_else(|| DexError::new(format!("catch {:?} has no block", c)))?;
                let e = cfg.add_edge(block, handler, EdgeType::Throw);
                if let Some(Some(edge)) = cfg.edges.get_mut(e) {
                    edge.throw_info = Some(ThrowInfo { catch_type: entry.catch_type, index });
                }
                index += 1;
                if entry.catch_type.is_none() {
                    break;
                }
                cur = entry.next;
            }
        }
        trace!("[cfg] built {} blocks, {} edges", cfg.blocks.len(), cfg.edges.len());
        Ok(cfg)
    }

    fn new_block(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.insert(id, Block { id, ..Block::default() });
        id
    }

    /// Adds an empty block; the caller wires its edges.
    pub fn create_block(&mut self) -> BlockId {
        self.new_block()
    }

    // Queries

    pub fn entry_block(&self) -> BlockId {
        self.entry
    }

    pub fn set_entry_block(&mut self, b: BlockId) {
        self.entry = b;
    }

    pub fn exit_block(&self) -> Option<BlockId> {
        self.exit
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    pub fn set_registers_size(&mut self, size: u32) {
        self.registers_size = self.registers_size.max(size);
    }

    pub fn allocate_temp(&mut self) -> Reg {
        self.registers_size += 1;
        self.registers_size - 1
    }

    pub fn allocate_wide_temp(&mut self) -> Reg {
        self.registers_size += 2;
        self.registers_size - 2
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_opcodes(&self) -> usize {
        self.blocks.values().map(|b| b.num_opcodes()).sum()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn block(&self, b: BlockId) -> Option<&Block> {
        self.blocks.get(&b)
    }

    pub fn block_mut(&mut self, b: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&b)
    }

    pub fn edge(&self, e: EdgeId) -> Option<&Edge> {
        self.edges.get(e).and_then(|e| e.as_ref())
    }

    pub fn insn(&self, at: InsnRef) -> Option<&IRInstruction> {
        self.blocks.get(&at.block)?.items.get(at.index)?.insn()
    }

    pub fn insn_mut(&mut self, at: InsnRef) -> Option<&mut IRInstruction> {
        self.blocks.get_mut(&at.block)?.items.get_mut(at.index)?.insn_mut()
    }

    pub fn succ_edges(&self, b: BlockId) -> Vec<&Edge> {
        self.get_succ_edges_if(b, |_| true)
    }

    pub fn pred_edges(&self, b: BlockId) -> Vec<&Edge> {
        self.get_pred_edges_if(b, |_| true)
    }

    pub fn get_succ_edges_if(&self, b: BlockId, pred: impl Fn(&Edge) -> bool) -> Vec<&Edge> {
        self.blocks
            .get(&b)
            .map(|blk| blk.succs.iter().filter_map(|e| self.edge(*e)).filter(|e| pred(e)).collect())
            .unwrap_or_default()
    }

    pub fn get_pred_edges_if(&self, b: BlockId, pred: impl Fn(&Edge) -> bool) -> Vec<&Edge> {
        self.blocks
            .get(&b)
            .map(|blk| blk.preds.iter().filter_map(|e| self.edge(*e)).filter(|e| pred(e)).collect())
            .unwrap_or_default()
    }

    /// The matching successor edge when there is exactly one.
    pub fn get_succ_edge_if(&self, b: BlockId, pred: impl Fn(&Edge) -> bool) -> Option<&Edge> {
        let edges = self.get_succ_edges_if(b, pred);
        (edges.len() == 1).then(|| edges[0])
    }

    /// The matching predecessor edge when there is exactly one.
    pub fn get_pred_edge_if(&self, b: BlockId, pred: impl Fn(&Edge) -> bool) -> Option<&Edge> {
        let edges = self.get_pred_edges_if(b, pred);
        (edges.len() == 1).then(|| edges[0])
    }

    pub fn get_succ_edge_of_type(&self, b: BlockId, kind: EdgeType) -> Option<&Edge> {
        self.get_succ_edge_if(b, |e| e.kind == kind)
    }

    pub fn succ_edge_ids(&self, b: BlockId) -> Vec<EdgeId> {
        self.blocks.get(&b).map(|blk| blk.succs.clone()).unwrap_or_default()
    }

    pub fn pred_edge_ids(&self, b: BlockId) -> Vec<EdgeId> {
        self.blocks.get(&b).map(|blk| blk.preds.clone()).unwrap_or_default()
    }

    /// Successor blocks, each once, in edge order.
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        self.succ_edges(b).into_iter().map(|e| e.target).filter(|t| seen.insert(*t)).collect()
    }

    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        self.pred_edges(b).into_iter().map(|e| e.src).filter(|s| seen.insert(*s)).collect()
    }

    // Edge editing

    pub fn add_edge(&mut self, src: BlockId, target: BlockId, kind: EdgeType) -> EdgeId {
        self.push_edge(Edge { src, target, kind, case_key: None, throw_info: None })
    }

    /// Branch edge of an `if-*` (`key == None`) or one switch case.
    pub fn add_branch_edge(&mut self, src: BlockId, target: BlockId, key: Option<i32>) -> EdgeId {
        self.push_edge(Edge { src, target, kind: EdgeType::Branch, case_key: key, throw_info: None })
    }

    pub fn add_throw_edge(&mut self, src: BlockId, target: BlockId, catch_type: Option<TypeId>, index: u32) -> EdgeId {
        self.push_edge(Edge {
            src,
            target,
            kind: EdgeType::Throw,
            case_key: None,
            throw_info: Some(ThrowInfo { catch_type, index }),
        })
    }

    fn push_edge(&mut self, edge: Edge) -> EdgeId {
        let id = self.edges.len();
        let (src, target) = (edge.src, edge.target);
        self.edges.push(Some(edge));
        if let Some(b) = self.blocks.get_mut(&src) {
            b.succs.push(id);
        }
        if let Some(b) = self.blocks.get_mut(&target) {
            b.preds.push(id);
        }
        id
    }

    pub fn delete_edge(&mut self, e: EdgeId) {
        if let Some(edge) = self.edges.get_mut(e).and_then(|e| e.take()) {
            if let Some(b) = self.blocks.get_mut(&edge.src) {
                b.succs.retain(|x| *x != e);
            }
            if let Some(b) = self.blocks.get_mut(&edge.target) {
                b.preds.retain(|x| *x != e);
            }
        }
    }

    pub fn delete_succ_edges_if(&mut self, b: BlockId, pred: impl Fn(&Edge) -> bool) {
        for e in self.succ_edge_ids(b) {
            if self.edge(e).map_or(false, &pred) {
                self.delete_edge(e);
            }
        }
    }

    pub fn replace_edge_target(&mut self, e: EdgeId, new_target: BlockId) {
        let old = match self.edges.get_mut(e).and_then(|e| e.as_mut()) {
            Some(edge) => std::mem::replace(&mut edge.target, new_target),
            None => return,
        };
        if let Some(b) = self.blocks.get_mut(&old) {
            b.preds.retain(|x| *x != e);
        }
        if let Some(b) = self.blocks.get_mut(&new_target) {
            b.preds.push(e);
        }
    }

    fn set_edge_kind(&mut self, e: EdgeId, kind: EdgeType) {
        if let Some(Some(edge)) = self.edges.get_mut(e) {
            edge.kind = kind;
            edge.case_key = None;
        }
    }

    // Instruction editing

    /// Replaces the instruction at `at` by `replacements`; an empty list removes it. Branches
    /// are rewritten through `resolve_branch`.
    pub fn replace_insn(&mut self, at: InsnRef, replacements: Vec<IRInstruction>) -> Result<()> {
        let block = self
            .blocks
            .get_mut(&at.block)
            .ok_or_else(|| DexError::new(format!("no block {}", at.block)))?;
        match block.items.get(at.index) {
            Some(MethodItemEntry::Opcode(insn)) if !insn.opcode().is_branch() => {}
            other => {
                return Err(DexError::with_kind(
                    ErrorKind::InternalError,
                    format!("cannot replace {:?} at {:?}", other, at),
                ))
            }
        }
        block
            .items
            .splice(at.index..=at.index, replacements.into_iter().map(MethodItemEntry::Opcode));
        Ok(())
    }

    pub fn insert_before(&mut self, at: InsnRef, insns: Vec<IRInstruction>) -> Result<()> {
        let block = self
            .blocks
            .get_mut(&at.block)
            .ok_or_else(|| DexError::new(format!("no block {}", at.block)))?;
        let ix = at.index.min(block.items.len());
        block.items.splice(ix..ix, insns.into_iter().map(MethodItemEntry::Opcode));
        Ok(())
    }

    pub fn push_back(&mut self, b: BlockId, insn: IRInstruction) -> Result<()> {
        let block = self.blocks.get_mut(&b).ok_or_else(|| DexError::new(format!("no block {}", b)))?;
        block.items.push(MethodItemEntry::Opcode(insn));
        Ok(())
    }

    /// Removes the conditional branch or switch ending `b`. Only the successor chosen by
    /// `taken` survives, as a `Goto` edge: for `if-*`, `Some(_)` keeps the branch edge and
    /// `None` the fallthrough; for a switch, `Some(key)` keeps that case (or the default
    /// when no case matches).
    pub fn resolve_branch(&mut self, b: BlockId, taken: Option<i32>) -> Result<()> {
        let (ix, op) = match self.blocks.get(&b).and_then(|blk| blk.last_insn()) {
            Some((ix, insn)) if insn.opcode().is_branch() => (ix, insn.opcode()),
            _ => return Err(DexError::new(format!("block {} does not end in a branch", b))),
        };
        let keep = if op.is_switch() {
            let case = taken.and_then(|k| {
                self.succ_edge_ids(b)
                    .into_iter()
                    .find(|e| self.edge(*e).map_or(false, |e| e.kind == EdgeType::Branch && e.case_key == Some(k)))
            });
            case.or_else(|| self.succ_edge_ids(b).into_iter().find(|e| self.edge(*e).map_or(false, |e| e.kind == EdgeType::Goto)))
        } else {
            let kind = if taken.is_some() { EdgeType::Branch } else { EdgeType::Goto };
            self.succ_edge_ids(b).into_iter().find(|e| self.edge(*e).map_or(false, |e| e.kind == kind))
        };
        for e in self.succ_edge_ids(b) {
            let flow = self.edge(e).map_or(false, |e| matches!(e.kind, EdgeType::Goto | EdgeType::Branch));
            if flow && Some(e) != keep {
                self.delete_edge(e);
            }
        }
        if let Some(e) = keep {
            self.set_edge_kind(e, EdgeType::Goto);
        }
        if let Some(blk) = self.blocks.get_mut(&b) {
            blk.items.remove(ix);
        }
        Ok(())
    }

    // Whole-graph operations

    /// Adds a synthetic exit block when the method has several exit points. Blocks without
    /// successors get a `Ghost` edge to it.
    pub fn calculate_exit_block(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let exits: Vec<BlockId> = self
            .blocks
            .values()
            .filter(|b| b.succs.is_empty())
            .map(|b| b.id)
            .collect();
        if exits.len() == 1 {
            self.exit = Some(exits[0]);
            return;
        }
        let ghost = self.new_block();
        for b in exits {
            self.add_edge(b, ghost, EdgeType::Ghost);
        }
        self.exit = Some(ghost);
        self.ghost_exit = true;
    }

    pub fn is_ghost(&self, b: BlockId) -> bool {
        self.ghost_exit && self.exit == Some(b)
    }

    fn reachable(&self) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.entry];
        while let Some(b) = stack.pop() {
            if self.blocks.contains_key(&b) && seen.insert(b) {
                stack.extend(self.successors(b));
            }
        }
        seen
    }

    /// Drops blocks the entry cannot reach. Returns the number of instructions removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let reachable = self.reachable();
        let dead: Vec<BlockId> = self
            .blocks
            .keys()
            .copied()
            .filter(|b| !reachable.contains(b) && !self.is_ghost(*b))
            .collect();
        let mut removed = 0;
        for b in dead {
            for e in self.succ_edge_ids(b).into_iter().chain(self.pred_edge_ids(b)) {
                self.delete_edge(e);
            }
            if let Some(blk) = self.blocks.remove(&b) {
                removed += blk.num_opcodes();
            }
        }
        removed
    }

    /// Blocks in reverse postorder from the entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = HashSet::new();
        // iterative DFS: (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited.insert(self.entry);
        while let Some(top) = stack.last_mut() {
            let (b, next) = *top;
            let succs = self.successors(b);
            if next < succs.len() {
                top.1 += 1;
                let s = succs[next];
                if visited.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                order.push(b);
                stack.pop();
            }
        }
        order.reverse();
        order
    }

    /// Output order of `linearize`: entry first, then ascending ids, ghost exit excluded.
    pub fn block_order(&self) -> Vec<BlockId> {
        let mut order = vec![self.entry];
        order.extend(self.blocks.keys().copied().filter(|b| *b != self.entry && !self.is_ghost(*b)));
        order
    }

    /// Instructions in linear order.
    pub fn linear_instructions(&self) -> Vec<(InsnRef, &IRInstruction)> {
        self.block_order()
            .into_iter()
            .filter_map(|b| self.blocks.get(&b))
            .flat_map(|blk| blk.instructions().map(move |(index, i)| (InsnRef { block: blk.id, index }, i)))
            .collect()
    }

    /// The handler chain of a block's throw edges, in chain order.
    fn throw_chain(&self, b: BlockId) -> Vec<(Option<TypeId>, BlockId)> {
        let mut edges: Vec<&Edge> = self.get_succ_edges_if(b, |e| e.is_throw());
        edges.sort_by_key(|e| e.throw_info.map_or(0, |t| t.index));
        edges.iter().map(|e| (e.throw_info.and_then(|t| t.catch_type), e.target)).collect()
    }

    /// Splices the blocks back into a linear item list.
    pub fn linearize(&self) -> Result<IRCode> {
        let order = self.block_order();
        let mut code = IRCode::new(self.registers_size);

        // branch ids are reserved up front so targets may precede their branch
        let mut branch_id: HashMap<BlockId, ItemId> = HashMap::new();
        let mut goto_id: HashMap<BlockId, (ItemId, BlockId)> = HashMap::new();
        for (i, &b) in order.iter().enumerate() {
            let blk = &self.blocks[&b];
            let ends_in_branch = blk.last_insn().map_or(false, |(_, insn)| insn.opcode().is_branch());
            if ends_in_branch {
                branch_id.insert(b, code.reserve());
            }
            let ends_flow = blk.last_insn().map_or(false, |(_, insn)| {
                let op = insn.opcode();
                op.is_return() || op == IROpcode::Throw
            });
            if let Some(next) = self.get_succ_edge_of_type(b, EdgeType::Goto).map(|e| e.target) {
                if !ends_flow && order.get(i + 1) != Some(&next) {
                    goto_id.insert(b, (code.reserve(), next));
                }
            }
        }

        // handler chains, one set of catch items per distinct chain
        let mut chains: Vec<Vec<(Option<TypeId>, BlockId)>> = Vec::new();
        let mut chain_of: HashMap<BlockId, usize> = HashMap::new();
        for &b in &order {
            let chain = self.throw_chain(b);
            if chain.is_empty() {
                continue;
            }
            let ix = match chains.iter().position(|c| *c == chain) {
                Some(ix) => ix,
                None => {
                    chains.push(chain);
                    chains.len() - 1
                }
            };
            chain_of.insert(b, ix);
        }
        let catch_ids: Vec<Vec<ItemId>> = chains.iter().map(|c| c.iter().map(|_| code.reserve()).collect()).collect();
        let mut catches_at: HashMap<BlockId, Vec<(usize, usize)>> = HashMap::new();
        for (ci, chain) in chains.iter().enumerate() {
            for (pos, (_, handler)) in chain.iter().enumerate() {
                catches_at.entry(*handler).or_default().push((ci, pos));
            }
        }

        let mut open_try: Option<usize> = None;
        for (i, &b) in order.iter().enumerate() {
            let blk = &self.blocks[&b];
            let chain = chain_of.get(&b).copied();
            if open_try.is_some() && open_try != chain {
                if let Some(c) = open_try.take() {
                    code.push_back(MethodItemEntry::TryEnd(catch_ids[c][0]));
                }
            }

            for (ci, pos) in catches_at.get(&b).into_iter().flatten() {
                let next = catch_ids[*ci].get(pos + 1).copied();
                let catch_type = chains[*ci][*pos].0;
                code.link_reserved_back(catch_ids[*ci][*pos], MethodItemEntry::Catch(CatchEntry { catch_type, next }));
            }
            for e in blk.preds.iter().filter_map(|e| self.edge(*e)) {
                let src = match e.kind {
                    EdgeType::Branch => branch_id.get(&e.src).copied(),
                    EdgeType::Goto => goto_id.get(&e.src).filter(|(_, t)| *t == b).map(|(id, _)| *id),
                    _ => None,
                };
                if let Some(src) = src {
                    let kind = match e.case_key {
                        Some(k) => BranchTargetKind::Case(k),
                        None => BranchTargetKind::Simple,
                    };
                    code.push_back(MethodItemEntry::Target(BranchTarget { src, kind }));
                }
            }

            if let (Some(c), None) = (chain, open_try) {
                code.push_back(MethodItemEntry::TryStart(catch_ids[c][0]));
                open_try = Some(c);
            }
            let last_branch = blk.last_insn().filter(|(_, insn)| insn.opcode().is_branch()).map(|(ix, _)| ix);
            for (ix, item) in blk.items.iter().enumerate() {
                match (Some(ix) == last_branch, branch_id.get(&b)) {
                    (true, Some(id)) => code.link_reserved_back(*id, item.clone()),
                    _ => {
                        code.push_back(item.clone());
                    }
                }
            }
            if let Some(c) = open_try {
                // the region covers the throwing block only; the move-result that follows
                // lives in the next block
                let next_same = order.get(i + 1).and_then(|n| chain_of.get(n)) == Some(&c);
                if !next_same {
                    code.push_back(MethodItemEntry::TryEnd(catch_ids[c][0]));
                    open_try = None;
                }
            }
            if let Some((id, _)) = goto_id.get(&b) {
                code.link_reserved_back(*id, MethodItemEntry::Opcode(IRInstruction::new(IROpcode::Goto)));
            }
        }
        if let Some(c) = open_try {
            code.push_back(MethodItemEntry::TryEnd(catch_ids[c][0]));
        }
        Ok(code)
    }

    /// Checks that every edge is listed on both of its ends.
    pub fn sanity_check(&self) -> Result<()> {
        for (id, e) in self.edges.iter().enumerate() {
            if let Some(e) = e {
                let ok = self.blocks.get(&e.src).map_or(false, |b| b.succs.contains(&id))
                    && self.blocks.get(&e.target).map_or(false, |b| b.preds.contains(&id));
                if !ok {
                    return Err(DexError::with_kind(
                        ErrorKind::InternalError,
                        format!("edge {} ({} -> {}) is not linked on both ends", id, e.src, e.target),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::{parse_code, print_code};
    use crate::ir::interner::Interner;

    fn cfg_of(g: &Interner, text: &str) -> ControlFlowGraph {
        ControlFlowGraph::build(&parse_code(g, text).unwrap()).unwrap()
    }

    #[test]
    fn test_blocks_and_edges_of_diamond() {
        let g = Interner::new();
        let cfg = cfg_of(
            &g,
            "((load-param v0) (if-eqz v0 :t) (const v1 1) (goto :join) (:t) (const v1 2) (:join) (return v1))",
        );
        cfg.sanity_check().unwrap();
        assert_eq!(cfg.num_blocks(), 4);
        let entry = cfg.entry_block();
        assert_eq!(cfg.successors(entry).len(), 2);
        assert!(cfg.get_succ_edge_of_type(entry, EdgeType::Branch).is_some());
        assert!(cfg.get_succ_edge_of_type(entry, EdgeType::Goto).is_some());
        let join = cfg.blocks().find(|b| b.last_insn().map(|(_, i)| i.opcode()) == Some(IROpcode::Return)).unwrap();
        assert_eq!(cfg.predecessors(join.id()).len(), 2);
        // goto is an edge, not an item
        assert_eq!(cfg.num_opcodes(), 5);
    }

    #[test]
    fn test_linearize_roundtrip() {
        let g = Interner::new();
        let text = "((load-param v0) (if-eqz v0 :t) (const v1 1) (goto :join) (:t) (const v1 2) (:join) (return v1))";
        let code = parse_code(&g, text).unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        assert_eq!(print_code(&cfg.linearize().unwrap(), &g), print_code(&code, &g));
    }

    #[test]
    fn test_throw_edges_only_in_try() {
        let g = Interner::new();
        let cfg = cfg_of(
            &g,
            r#"((invoke-static () "LFoo;.a:()V")
                (.try_start c0) (invoke-static () "LFoo;.b:()V") (.try_end c0)
                (return-void)
                (.catch (c0)) (move-exception v0) (return-void))"#,
        );
        let throws: Vec<&Edge> = cfg.blocks().flat_map(|b| cfg.get_succ_edges_if(b.id(), |e| e.is_throw())).collect();
        assert_eq!(throws.len(), 1);
        assert_eq!(throws[0].throw_info, Some(ThrowInfo { catch_type: None, index: 0 }));
        let src = cfg.block(throws[0].src).unwrap();
        assert_eq!(src.num_opcodes(), 1);
    }

    #[test]
    fn test_catch_chain_order_and_relinearize() {
        let g = Interner::new();
        let text = r#"((.try_start c0) (invoke-static () "LFoo;.b:()V") (.try_end c0) (return-void)
            (.catch (c0 c1) "Ljava/io/IOException;") (return-void) (.catch (c1)) (return-void))"#;
        let code = parse_code(&g, text).unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let b = cfg.blocks().find(|b| !cfg.get_succ_edges_if(b.id(), |e| e.is_throw()).is_empty()).unwrap();
        let chain = cfg.throw_chain(b.id());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].0, Some(g.make_type("Ljava/io/IOException;")));
        assert_eq!(chain[1].0, None);
        let relinear = cfg.linearize().unwrap();
        assert_eq!(print_code(&relinear, &g), print_code(&code, &g));
    }

    #[test]
    fn test_resolve_branch_and_remove_unreachable() {
        let g = Interner::new();
        let mut cfg = cfg_of(&g, "((const v0 0) (if-eqz v0 :L1) (const v0 1) (:L1) (return-void))");
        let entry = cfg.entry_block();
        cfg.resolve_branch(entry, Some(0)).unwrap();
        assert_eq!(cfg.successors(entry).len(), 1);
        assert_eq!(cfg.remove_unreachable_blocks(), 1);
        let code = cfg.linearize().unwrap();
        let expected = parse_code(&g, "((const v0 0) (return-void))").unwrap();
        assert_eq!(print_code(&code, &g), print_code(&expected, &g));
    }

    #[test]
    fn test_ghost_exit_and_rpo() {
        let g = Interner::new();
        let mut cfg = cfg_of(&g, "((load-param v0) (if-eqz v0 :t) (return-void) (:t) (throw v0))");
        cfg.calculate_exit_block();
        let exit = cfg.exit_block().unwrap();
        assert!(cfg.is_ghost(exit));
        assert_eq!(cfg.pred_edges(exit).len(), 2);
        assert!(cfg.pred_edges(exit).iter().all(|e| e.kind == EdgeType::Ghost));
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.first(), Some(&cfg.entry_block()));
        assert_eq!(rpo.last(), Some(&exit));
        // the ghost block never shows up in linear code
        assert_eq!(cfg.linear_instructions().len(), 4);
    }

    #[test]
    fn test_switch_edges() {
        let g = Interner::new();
        let cfg = cfg_of(&g, "((load-param v0) (switch v0 (:a :b)) (return-void) (:a 0) (return-void) (:b 7) (return-void))");
        let keys: BTreeSet<Option<i32>> =
            cfg.get_succ_edges_if(cfg.entry_block(), |e| e.kind == EdgeType::Branch).iter().map(|e| e.case_key).collect();
        assert_eq!(keys, [Some(0), Some(7)].into_iter().collect());
    }
}
