//! Method verification: structural checks on the item list, then type inference replayed
//! in checking mode.

use log::debug;

use crate::analysis::type_inference::{TypeError, TypeInference};
use crate::cfg::graph::ControlFlowGraph;
use crate::config::TypeCheckerConfig;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::code::{IRCode, MethodItemEntry};
use crate::ir::instruction::IRInstruction;
use crate::ir::interner::{Interner, MethodId};
use crate::ir::opcode::IROpcode;

/// Outcome of checking one method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeCheckReport {
    errors: Vec<String>,
}

impl TypeCheckReport {
    pub fn good(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn fail(&self) -> bool {
        !self.good()
    }

    /// The first error, if any.
    pub fn what(&self) -> Option<&str> {
        self.errors.first().map(|s| s.as_str())
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

pub struct TypeChecker<'g> {
    g: &'g Interner,
    config: TypeCheckerConfig,
}

impl<'g> TypeChecker<'g> {
    pub fn new(g: &'g Interner, config: TypeCheckerConfig) -> Self {
        TypeChecker { g, config }
    }

    /// Checks `code` as the body of `method`. Works on linear code and on code whose CFG is
    /// built.
    pub fn run(&self, method: MethodId, is_static: bool, code: &IRCode) -> Result<TypeCheckReport> {
        let (cfg, linear) = match code.cfg() {
            Some(cfg) => (cfg.clone(), cfg.linearize()?),
            None => (ControlFlowGraph::build(code)?, code.clone()),
        };

        let mut report = TypeCheckReport::default();
        if let Err(msg) = self.check_structure(method, is_static, &linear) {
            report.errors.push(msg);
            return Ok(report);
        }

        let analysis = TypeInference::new(self.g, method, is_static, &cfg, self.config.clone()).run(&cfg);
        let mut errors: Vec<TypeError> = Vec::new();
        for b in cfg.block_order() {
            analysis.replay_block(b, |at, insn, state| {
                let mut state = state.clone();
                errors.extend(analysis.analyzer().check_instruction(at, insn, &mut state));
            });
        }
        errors.sort_by_key(|e| e.at);
        for e in errors {
            let insn = cfg.insn(e.at).map(|i| i.show(self.g)).unwrap_or_default();
            report.errors.push(format!("{} at {} in {}", e.message, insn, self.g.show_method(method)));
        }
        if report.fail() {
            debug!("[typecheck] {} errors in {}", report.errors.len(), self.g.show_method(method));
        }
        Ok(report)
    }

    /// Like `run`, but the first error becomes a `TYPE_CHECK_ERROR`.
    pub fn check(&self, method: MethodId, is_static: bool, code: &IRCode) -> Result<()> {
        let report = self.run(method, is_static, code)?;
        match report.what() {
            None => Ok(()),
            Some(what) => Err(DexError::with_kind(ErrorKind::TypeCheckError, what.to_string())
                .extra("method", self.g.show_method(method))),
        }
    }

    fn check_structure(&self, method: MethodId, is_static: bool, code: &IRCode) -> std::result::Result<(), String> {
        let g = self.g;
        let data = g.method(method);
        let mut expected: Vec<IROpcode> = Vec::new();
        if !is_static {
            expected.push(IROpcode::LoadParamObject);
        }
        for a in g.proto(data.proto).args.iter() {
            expected.push(IROpcode::load_param_for(&g.descriptor(*a)));
        }

        let insns: Vec<&IRInstruction> = code.instructions().map(|(_, i)| i).collect();
        let params = insns.iter().take_while(|i| i.opcode().is_load_param()).count();
        if insns[params..].iter().any(|i| i.opcode().is_load_param()) {
            return Err("load-param instructions must come first".to_string());
        }
        if params != expected.len() {
            return Err(format!("expected {} load-param instructions, found {}", expected.len(), params));
        }
        for (i, (insn, op)) in insns.iter().zip(expected.iter()).enumerate() {
            if insn.opcode() != *op {
                return Err(format!("parameter {} is loaded with {}, expected {}", i, insn.opcode(), op));
            }
        }

        for (i, insn) in insns.iter().enumerate() {
            let op = insn.opcode();
            let prev = if i > 0 { Some(insns[i - 1].opcode()) } else { None };
            if op.is_move_result() && !prev.map_or(false, |p| p.has_move_result()) {
                return Err(format!("{} does not follow an invoke or filled-new-array", insn.show(g)));
            }
            if op.is_move_result_pseudo() && !prev.map_or(false, |p| p.has_move_result_pseudo()) {
                return Err(format!("{} does not follow an op with a pseudo result", insn.show(g)));
            }
            if op.has_move_result_pseudo() {
                let next = insns.get(i + 1).map(|n| n.opcode());
                if !next.map_or(false, |n| n.is_move_result_pseudo()) {
                    return Err(format!("{} is not followed by a move-result-pseudo", insn.show(g)));
                }
            }
        }

        let mut targeted = std::collections::HashSet::new();
        for (_, entry) in code.iter() {
            if let MethodItemEntry::Target(t) = entry {
                match code.insn(t.src) {
                    Some(src) if src.opcode().is_branch() => {
                        targeted.insert(t.src);
                    }
                    _ => return Err(format!("branch target refers to {:?}, which is not a branch", t.src)),
                }
            }
        }
        for (id, insn) in code.instructions() {
            if insn.opcode().is_branch() && !targeted.contains(&id) {
                return Err(format!("{} has no target", insn.show(g)));
            }
        }
        Ok(())
    }
}

/// Shorthand used by passes that only need pass/fail.
pub fn check_method(g: &Interner, config: &TypeCheckerConfig, method: MethodId, is_static: bool, code: &IRCode) -> Result<()> {
    TypeChecker::new(g, config.clone()).check(method, is_static, code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::parse_code;

    fn run(sig: &str, is_static: bool, body: &str) -> TypeCheckReport {
        run_with(sig, is_static, body, TypeCheckerConfig::default())
    }

    fn run_with(sig: &str, is_static: bool, body: &str, config: TypeCheckerConfig) -> TypeCheckReport {
        let g = Interner::new();
        let m = g.make_method_from_str(sig).unwrap();
        let code = parse_code(&g, body).unwrap();
        TypeChecker::new(&g, config).run(m, is_static, &code).unwrap()
    }

    #[test]
    fn test_well_typed_method() {
        let r = run(
            "LFoo;.bar:(ILjava/lang/String;J)J",
            false,
            r#"((load-param-object v0) (load-param v1) (load-param-object v2) (load-param-wide v3)
                (if-eqz v2 :null)
                (invoke-virtual (v2) "Ljava/lang/String;.length:()I") (move-result v5)
                (add-int v1 v1 v5)
                (:null)
                (int-to-long v6 v1)
                (add-long v3 v3 v6)
                (return-wide v3))"#,
        );
        assert!(r.good(), "{:?}", r.errors());
    }

    #[test]
    fn test_use_before_def() {
        let r = run("LFoo;.bar:()I", true, "((add-int/lit8 v0 v1 1) (return v0))");
        assert!(r.fail());
        assert!(r.what().unwrap().contains("register v1: expected INT, found TOP"), "{:?}", r.what());
    }

    #[test]
    fn test_wide_narrow_mismatch() {
        let r = run("LFoo;.bar:(J)I", true, "((load-param-wide v0) (add-int v2 v0 v0) (return v2))");
        assert!(r.what().unwrap().contains("register v0: expected INT, found LONG1"), "{:?}", r.what());
        let r = run("LFoo;.bar:(I)J", true, "((load-param v0) (int-to-long v1 v0) (return-wide v2))");
        assert!(r.what().unwrap().contains("register v2: expected LONG1"), "{:?}", r.what());
    }

    #[test]
    fn test_reference_used_as_int() {
        let r = run(
            "LFoo;.bar:(Ljava/lang/Object;)I",
            true,
            "((load-param-object v0) (add-int/lit8 v1 v0 1) (return v1))",
        );
        assert!(r.what().unwrap().contains("register v0: expected INT, found REFERENCE"), "{:?}", r.what());
    }

    #[test]
    fn test_zero_constant_is_polymorphic() {
        let body = r#"((const v0 0) (add-int/lit8 v1 v0 1) (invoke-static (v0) "LFoo;.use:(Ljava/lang/Object;)V") (return-void))"#;
        assert!(run("LFoo;.bar:()V", true, body).good());
        let strict = TypeCheckerConfig { enable_polymorphic_constants: false, ..TypeCheckerConfig::default() };
        let r = run_with("LFoo;.bar:()V", true, body, strict);
        assert!(r.what().unwrap().contains("register v0: expected REFERENCE, found CONST"), "{:?}", r.what());
    }

    #[test]
    fn test_moves_of_top_only_fail_when_verified() {
        let body = "((move v0 v1) (return-void))";
        assert!(run("LFoo;.bar:()V", true, body).good());
        let verify = TypeCheckerConfig { verify_moves: true, ..TypeCheckerConfig::default() };
        assert!(run_with("LFoo;.bar:()V", true, body, verify).fail());
    }

    #[test]
    fn test_structural_errors() {
        let r = run("LFoo;.bar:(I)V", true, "((const v1 0) (load-param v0) (return-void))");
        assert!(r.what().unwrap().contains("load-param"));
        let r = run("LFoo;.bar:()V", true, "((move-result v0) (return-void))");
        assert!(r.what().unwrap().contains("does not follow"));
        let r = run("LFoo;.bar:(I)V", true, "((load-param-object v0) (return-void))");
        assert!(r.what().unwrap().contains("parameter 0"));
    }

    #[test]
    fn test_overwrite_this() {
        let body = "((load-param-object v0) (const v0 1) (return-void))";
        assert!(run("LFoo;.bar:()V", false, body).good());
        let cfg = TypeCheckerConfig { check_no_overwrite_this: true, ..TypeCheckerConfig::default() };
        let r = run_with("LFoo;.bar:()V", false, body, cfg);
        assert!(r.what().unwrap().contains("`this`"));
    }

    #[test]
    fn test_check_returns_typed_error() {
        let g = Interner::new();
        let m = g.make_method_from_str("LFoo;.bar:()I").unwrap();
        let code = parse_code(&g, "((return v0))").unwrap();
        let err = TypeChecker::new(&g, TypeCheckerConfig::default()).check(m, true, &code).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeCheckError);
        assert_eq!(err.extra_info().get("method").map(|s| s.as_str()), Some("LFoo;.bar:()I"));
    }
}
