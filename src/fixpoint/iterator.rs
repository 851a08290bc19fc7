//! Monotonic forward fixpoint iteration over a CFG.
//!
//! Blocks are visited in weak topological order. The entry of a loop head joins the
//! incoming states for the first `widening_delay` rounds and widens after that; the loop is
//! stable once the recomputed entry no longer grows.

use std::collections::HashMap;

use log::trace;

use crate::cfg::graph::{BlockId, ControlFlowGraph, Edge, InsnRef};
use crate::domains::AbstractDomain;
use crate::fixpoint::wto::{Wto, WtoComponent};
use crate::ir::instruction::IRInstruction;

pub const DEFAULT_WIDENING_DELAY: u32 = 4;

/// Transfer functions of one analysis.
pub trait FixpointAnalyzer {
    type Domain: AbstractDomain;

    fn analyze_instruction(&self, at: InsnRef, insn: &IRInstruction, state: &mut Self::Domain);

    /// Replays the block's instructions. Bottom stays bottom.
    fn analyze_node(&self, cfg: &ControlFlowGraph, block: BlockId, state: &mut Self::Domain) {
        if state.is_bottom() {
            return;
        }
        if let Some(b) = cfg.block(block) {
            for (index, insn) in b.instructions() {
                self.analyze_instruction(InsnRef { block, index }, insn, state);
            }
        }
    }

    /// State flowing along `edge`, given the exit state of its source. Bottom marks the
    /// edge as infeasible.
    fn analyze_edge(&self, _cfg: &ControlFlowGraph, _edge: &Edge, exit_state: &Self::Domain) -> Self::Domain {
        exit_state.clone()
    }
}

pub struct FixpointIterator<'c, A: FixpointAnalyzer> {
    cfg: &'c ControlFlowGraph,
    analyzer: A,
    wto: Wto<BlockId>,
    entry_states: HashMap<BlockId, A::Domain>,
    exit_states: HashMap<BlockId, A::Domain>,
    widening_delay: u32,
}

impl<'c, A: FixpointAnalyzer> FixpointIterator<'c, A> {
    pub fn new(cfg: &'c ControlFlowGraph, analyzer: A) -> Self {
        let wto = Wto::new(cfg.entry_block(), |b| cfg.successors(b));
        FixpointIterator {
            cfg,
            analyzer,
            wto,
            entry_states: HashMap::new(),
            exit_states: HashMap::new(),
            widening_delay: DEFAULT_WIDENING_DELAY,
        }
    }

    pub fn with_widening_delay(mut self, delay: u32) -> Self {
        self.widening_delay = delay;
        self
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn cfg(&self) -> &'c ControlFlowGraph {
        self.cfg
    }

    pub fn run(&mut self, initial: A::Domain) {
        self.entry_states.clear();
        self.exit_states.clear();
        let components = self.wto.components().to_vec();
        for c in &components {
            self.analyze_component(c, &initial);
        }
        trace!("[fixpoint] analyzed {} blocks", self.entry_states.len());
    }

    /// Entry state of `b`; bottom when unreachable.
    pub fn get_entry_state_at(&self, b: BlockId) -> A::Domain {
        self.entry_states.get(&b).cloned().unwrap_or_else(A::Domain::bottom)
    }

    pub fn get_exit_state_at(&self, b: BlockId) -> A::Domain {
        self.exit_states.get(&b).cloned().unwrap_or_else(A::Domain::bottom)
    }

    /// Calls `f` with the state in front of every instruction of `b`.
    pub fn replay_block(&self, b: BlockId, mut f: impl FnMut(InsnRef, &IRInstruction, &A::Domain)) {
        let mut state = self.get_entry_state_at(b);
        if let Some(block) = self.cfg.block(b) {
            for (index, insn) in block.instructions() {
                let at = InsnRef { block: b, index };
                f(at, insn, &state);
                if !state.is_bottom() {
                    self.analyzer.analyze_instruction(at, insn, &mut state);
                }
            }
        }
    }

    fn incoming(&self, b: BlockId, initial: &A::Domain) -> A::Domain {
        let mut state = if b == self.cfg.entry_block() { initial.clone() } else { A::Domain::bottom() };
        for e in self.cfg.pred_edges(b) {
            if let Some(exit) = self.exit_states.get(&e.src) {
                if exit.is_bottom() {
                    continue;
                }
                state.join_with(&self.analyzer.analyze_edge(self.cfg, e, exit));
            }
        }
        state
    }

    fn analyze_vertex(&mut self, b: BlockId, entry: A::Domain) {
        let mut exit = entry.clone();
        self.analyzer.analyze_node(self.cfg, b, &mut exit);
        self.entry_states.insert(b, entry);
        self.exit_states.insert(b, exit);
    }

    fn analyze_component(&mut self, c: &WtoComponent<BlockId>, initial: &A::Domain) {
        match c {
            WtoComponent::Vertex(b) => {
                let entry = self.incoming(*b, initial);
                self.analyze_vertex(*b, entry);
            }
            WtoComponent::Component(head, body) => {
                let mut iteration = 0u32;
                let mut entry = self.incoming(*head, initial);
                loop {
                    self.analyze_vertex(*head, entry.clone());
                    for inner in body {
                        self.analyze_component(inner, initial);
                    }
                    let next = self.incoming(*head, initial);
                    if next.leq(&entry) {
                        break;
                    }
                    iteration += 1;
                    if iteration < self.widening_delay {
                        entry.join_with(&next);
                    } else {
                        entry.widen_with(&next);
                    }
                }
                trace!("[fixpoint] loop at B{} stable after {} rounds", head, iteration + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::graph::EdgeType;
    use crate::domains::constant::ConstantDomain;
    use crate::domains::environment::Environment;
    use crate::ir::assembler::parse_code;
    use crate::ir::interner::Interner;
    use crate::ir::opcode::IROpcode;

    type Env = Environment<u32, ConstantDomain<i64>>;

    /// Tracks `const` and `add-int/lit8` only; every other write goes to top.
    struct ConstAnalyzer;

    impl FixpointAnalyzer for ConstAnalyzer {
        type Domain = Env;

        fn analyze_instruction(&self, _at: InsnRef, insn: &IRInstruction, state: &mut Env) {
            let Some(dest) = insn.dest() else { return };
            let value = match insn.opcode() {
                IROpcode::Const => ConstantDomain::value(insn.literal().unwrap_or(0)),
                IROpcode::AddIntLit8 => match (state.get(insn.src(0)).get_constant(), insn.literal()) {
                    (Some(a), Some(b)) => ConstantDomain::value(a + b),
                    _ => ConstantDomain::Top,
                },
                _ => ConstantDomain::Top,
            };
            state.set(dest, value);
        }

        fn analyze_edge(&self, cfg: &ControlFlowGraph, edge: &Edge, exit: &Env) -> Env {
            // if-eqz on a known non-zero value never takes its branch
            let last = cfg.block(edge.src).and_then(|b| b.last_insn()).map(|(_, i)| i.clone());
            if let Some(insn) = last {
                if insn.opcode() == IROpcode::IfEqz && edge.kind == EdgeType::Branch {
                    if let Some(v) = exit.get(insn.src(0)).get_constant() {
                        if *v != 0 {
                            return Env::bottom();
                        }
                    }
                }
            }
            exit.clone()
        }
    }

    #[test]
    fn test_straight_line_and_infeasible_edge() {
        let g = Interner::new();
        let code = parse_code(&g, "((const v0 1) (if-eqz v0 :dead) (const v1 2) (return v1) (:dead) (const v1 3) (return v1))")
            .unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let mut it = FixpointIterator::new(&cfg, ConstAnalyzer);
        it.run(Env::top());
        let exit0 = it.get_exit_state_at(cfg.entry_block());
        assert_eq!(exit0.get(0), ConstantDomain::value(1));
        let dead = cfg.get_succ_edge_of_type(cfg.entry_block(), EdgeType::Branch).unwrap().target;
        assert!(it.get_entry_state_at(dead).is_bottom());
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let g = Interner::new();
        // v0 counts up forever; v1 stays 7
        let code = parse_code(
            &g,
            "((const v0 0) (const v1 7) (:top) (add-int/lit8 v0 v0 1) (if-eqz v1 :out) (goto :top) (:out) (return v0))",
        )
        .unwrap();
        let cfg = ControlFlowGraph::build(&code).unwrap();
        let mut it = FixpointIterator::new(&cfg, ConstAnalyzer);
        it.run(Env::top());
        let head = cfg.successors(cfg.entry_block())[0];
        let at_head = it.get_entry_state_at(head);
        assert!(at_head.get(0).is_top());
        assert_eq!(at_head.get(1), ConstantDomain::value(7));

        let mut seen = Vec::new();
        it.replay_block(head, |_, insn, state| seen.push((insn.opcode(), state.get(1))));
        assert_eq!(seen[0], (IROpcode::AddIntLit8, ConstantDomain::value(7)));
    }
}
