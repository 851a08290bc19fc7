//! Rewrites driven by a constant-propagation fixpoint.
//!
//! Rewriting happens in two phases: the plan is collected while the analysis still borrows
//! the graph, then applied. Within a block, replacements are applied from the highest item
//! index down so earlier indices stay valid.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use log::trace;

use crate::cfg::graph::{BlockId, ControlFlowGraph, EdgeType, InsnRef};
use crate::constprop::analyzer::{feasible_successors, ConstantEnvironment, ConstantPropagationAnalyzer};
use crate::domains::AbstractDomain;
use crate::error::Result;
use crate::fixpoint::iterator::{FixpointAnalyzer, FixpointIterator};
use crate::ir::instruction::{const_insn, const_wide_insn, IRInstruction, Reg, RESULT_REGISTER};
use crate::ir::opcode::IROpcode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub branches_removed: usize,
    pub switches_folded: usize,
    pub moves_replaced: usize,
    pub move_results_replaced: usize,
    pub sgets_replaced: usize,
    pub arithmetic_folded: usize,
}

impl TransformStats {
    pub fn total(&self) -> usize {
        self.branches_removed
            + self.switches_folded
            + self.moves_replaced
            + self.move_results_replaced
            + self.sgets_replaced
            + self.arithmetic_folded
    }

    /// Adds the counters to `metrics` under `prefix`.
    pub fn report(&self, prefix: &str, metrics: &mut BTreeMap<String, i64>) {
        let entries = [
            ("num_branch_propagated", self.branches_removed),
            ("num_switch_folded", self.switches_folded),
            ("num_moves_replaced_by_const", self.moves_replaced),
            ("num_move_results_replaced_by_const", self.move_results_replaced),
            ("num_sget_replaced_by_const", self.sgets_replaced),
            ("num_arithmetic_folded", self.arithmetic_folded),
        ];
        for (name, v) in entries {
            *metrics.entry(format!("{}.{}", prefix, name)).or_insert(0) += v as i64;
        }
    }
}

impl AddAssign for TransformStats {
    fn add_assign(&mut self, o: Self) {
        self.branches_removed += o.branches_removed;
        self.switches_folded += o.switches_folded;
        self.moves_replaced += o.moves_replaced;
        self.move_results_replaced += o.move_results_replaced;
        self.sgets_replaced += o.sgets_replaced;
        self.arithmetic_folded += o.arithmetic_folded;
    }
}

/// Pending rewrites of one graph.
#[derive(Debug, Default)]
pub struct Plan {
    replacements: Vec<(InsnRef, Vec<IRInstruction>)>,
    branches: Vec<(BlockId, Option<i32>)>,
    stats: TransformStats,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty() && self.branches.is_empty()
    }

    pub fn apply(mut self, cfg: &mut ControlFlowGraph) -> Result<TransformStats> {
        self.replacements.sort_by(|a, b| b.0.cmp(&a.0));
        for (at, insns) in self.replacements {
            cfg.replace_insn(at, insns)?;
        }
        for (b, taken) in self.branches {
            cfg.resolve_branch(b, taken)?;
        }
        Ok(self.stats)
    }
}

fn exact_const(dest: Reg, wide: bool, v: i64) -> IRInstruction {
    if wide {
        const_wide_insn(dest, v)
    } else {
        const_insn(dest, v)
    }
}

/// Collects the rewrites the fixpoint `it` justifies.
pub fn plan(it: &FixpointIterator<'_, ConstantPropagationAnalyzer<'_>>) -> Plan {
    let cfg = it.cfg();
    let config = it.analyzer().config().clone();
    let mut plan = Plan::default();

    for b in cfg.block_order() {
        if it.get_entry_state_at(b).is_bottom() {
            continue;
        }
        let mut pending_sget: Option<InsnRef> = None;
        let mut steps: Vec<(InsnRef, IRInstruction, ConstantEnvironment, ConstantEnvironment)> = Vec::new();
        it.replay_block(b, |at, insn, before| {
            let mut after = before.clone();
            it.analyzer().analyze_instruction(at, insn, &mut after);
            steps.push((at, insn.clone(), before.clone(), after));
        });

        for (at, insn, before, after) in steps {
            let op = insn.opcode();
            let dest_const = insn.dest().and_then(|d| after.get(d).get_constant().map(|v| (d, v)));
            let prev_sget = pending_sget.take();
            match (op, dest_const) {
                (IROpcode::Move | IROpcode::MoveWide, Some((d, v))) if config.replace_moves_with_consts => {
                    plan.replacements.push((at, vec![exact_const(d, op.dest_is_wide(), v)]));
                    plan.stats.moves_replaced += 1;
                }
                (IROpcode::MoveResult | IROpcode::MoveResultWide, Some((d, v)))
                    if config.replace_move_result_with_consts =>
                {
                    plan.replacements.push((at, vec![exact_const(d, op.dest_is_wide(), v)]));
                    plan.stats.move_results_replaced += 1;
                }
                (IROpcode::MoveResultPseudo | IROpcode::MoveResultPseudoWide, Some((d, v)))
                    if prev_sget.is_some() && config.replace_move_result_with_consts =>
                {
                    if let Some(sget) = prev_sget {
                        plan.replacements.push((sget, Vec::new()));
                    }
                    plan.replacements.push((at, vec![exact_const(d, op.dest_is_wide(), v)]));
                    plan.stats.sgets_replaced += 1;
                }
                (_, Some((d, v)))
                    if config.fold_arithmetic
                        && (op.is_binop() || op.is_binop_lit() || op.is_unop() || op.is_cmp()) =>
                {
                    plan.replacements.push((at, vec![exact_const(d, op.dest_is_wide(), v)]));
                    plan.stats.arithmetic_folded += 1;
                }
                _ if op.is_sget() && op != IROpcode::SgetObject => {
                    if after.get(RESULT_REGISTER).get_constant().is_some() {
                        pending_sget = Some(at);
                    }
                }
                _ if op.is_switch() && config.fold_switches => {
                    if let Some(v) = before.get(insn.src(0)).get_constant() {
                        if let Ok(key) = i32::try_from(v) {
                            plan.branches.push((b, Some(key)));
                            plan.stats.switches_folded += 1;
                        }
                    }
                }
                _ if op.is_conditional_branch() => {
                    let edges = feasible_successors(it, b);
                    let live = |kind: EdgeType| edges.iter().any(|(e, f)| e.kind == kind && *f);
                    match (live(EdgeType::Branch), live(EdgeType::Goto)) {
                        (true, false) => {
                            plan.branches.push((b, Some(0)));
                            plan.stats.branches_removed += 1;
                        }
                        (false, true) => {
                            plan.branches.push((b, None));
                            plan.stats.branches_removed += 1;
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }
    if !plan.is_empty() {
        trace!("[cp] planned {} rewrites", plan.stats.total());
    }
    plan
}

/// Analyzes `cfg` with `analyzer`, then rewrites it.
pub fn optimize(cfg: &mut ControlFlowGraph, analyzer: ConstantPropagationAnalyzer<'_>) -> Result<TransformStats> {
    let plan = {
        let it = analyzer.run(cfg);
        plan(&it)
    };
    plan.apply(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstPropConfig;
    use crate::ir::assembler::{parse_code, print_code};
    use crate::ir::interner::Interner;

    fn run(body: &str, config: ConstPropConfig) -> (String, TransformStats) {
        let g = Interner::new();
        let code = parse_code(&g, body).unwrap();
        let mut cfg = ControlFlowGraph::build(&code).unwrap();
        let analyzer = ConstantPropagationAnalyzer::new(&g, &cfg, config);
        let stats = optimize(&mut cfg, analyzer).unwrap();
        (print_code(&cfg.linearize().unwrap(), &g), stats)
    }

    fn expect(g: &Interner, body: &str) -> String {
        print_code(&parse_code(g, body).unwrap(), g)
    }

    #[test]
    fn test_move_of_constant() {
        let (out, stats) = run("((const v1 0) (move v0 v1) (return-void))", ConstPropConfig::default());
        assert_eq!(out, expect(&Interner::new(), "((const v1 0) (const v0 0) (return-void))"));
        assert_eq!(stats.moves_replaced, 1);

        let off = ConstPropConfig { replace_moves_with_consts: false, ..ConstPropConfig::default() };
        let (out, _) = run("((const v1 0) (move v0 v1) (return-void))", off);
        assert_eq!(out, expect(&Interner::new(), "((const v1 0) (move v0 v1) (return-void))"));
    }

    #[test]
    fn test_never_taken_branch_becomes_goto() {
        let (out, stats) = run("((const v0 0) (if-eqz v0 :L1) (const v0 1) (:L1) (return-void))", ConstPropConfig::default());
        assert_eq!(out, expect(&Interner::new(), "((const v0 0) (goto :L1) (const v0 1) (:L1) (return-void))"));
        assert_eq!(stats.branches_removed, 1);
    }

    #[test]
    fn test_always_false_branch_is_dropped() {
        let (out, _) = run("((const v0 3) (if-eqz v0 :L1) (const v0 1) (:L1) (return-void))", ConstPropConfig::default());
        assert_eq!(out, expect(&Interner::new(), "((const v0 3) (const v0 1) (return-void))"));
    }

    #[test]
    fn test_literal_arithmetic() {
        let (out, stats) = run("((const v0 41) (add-int/lit8 v1 v0 1) (return v1))", ConstPropConfig::default());
        assert_eq!(out, expect(&Interner::new(), "((const v0 41) (const v1 42) (return v1))"));
        assert_eq!(stats.arithmetic_folded, 1);

        let body = "((const v0 2147483647) (add-int/lit8 v1 v0 1) (return v1))";
        let (out, stats) = run(body, ConstPropConfig::default());
        assert_eq!(out, expect(&Interner::new(), body));
        assert_eq!(stats.total(), 0);
    }

    #[test]
    fn test_switch_folding() {
        let body = "((const v0 1) (switch v0 (:a :b)) (const v1 0) (return v1) (:a 1) (const v1 10) (return v1) (:b 2) (const v1 20) (return v1))";
        let (out, stats) = run(body, ConstPropConfig::default());
        assert_eq!(stats.switches_folded, 1);
        assert!(!out.contains("switch"), "{}", out);
        assert!(out.contains("goto"), "{}", out);
    }

    #[test]
    fn test_stats_report() {
        let stats = TransformStats { branches_removed: 2, ..TransformStats::default() };
        let mut m = BTreeMap::new();
        stats.report("cp", &mut m);
        stats.report("cp", &mut m);
        assert_eq!(m.get("cp.num_branch_propagated"), Some(&4));
        assert_eq!(m.get("cp.num_moves_replaced_by_const"), Some(&0));
    }
}
