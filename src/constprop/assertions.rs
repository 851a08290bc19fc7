//! Runtime checks of inferred argument values.
//!
//! For every parameter whose inferred value is more precise than top, a check is placed
//! right after the `load-param` block. When the actual argument violates the inferred
//! value, the handler's `argumentValueError(I)V` is called with the parameter index.

use log::trace;

use crate::constprop::analyzer::{ArgumentDomain, ConstantValue};
use crate::domains::sign::Sign;
use crate::domains::AbstractDomain;
use crate::error::Result;
use crate::ir::code::{BranchTarget, BranchTargetKind, IRCode, ItemId, MethodItemEntry};
use crate::ir::instruction::{const_insn, const_wide_insn, IRInstruction, Reg};
use crate::ir::interner::Interner;
use crate::ir::opcode::IROpcode;

/// `if-*z` that succeeds exactly for values of `sign`.
fn testz_for(sign: Sign) -> Option<IROpcode> {
    Some(match sign {
        Sign::Ltz => IROpcode::IfLtz,
        Sign::Eqz => IROpcode::IfEqz,
        Sign::Gtz => IROpcode::IfGtz,
        Sign::Lez => IROpcode::IfLez,
        Sign::Gez => IROpcode::IfGez,
        Sign::Nez => IROpcode::IfNez,
        Sign::Bottom | Sign::All => return None,
    })
}

struct Check {
    /// Instructions computing the condition, ending with the branch to the success label.
    insns: Vec<IRInstruction>,
}

fn build_check(code: &mut IRCode, reg: Reg, op: IROpcode, value: &ConstantValue) -> Option<Check> {
    let wide = op == IROpcode::LoadParamWide;
    let object = op == IROpcode::LoadParamObject;
    let sign = value.interval();
    let mut insns = Vec::new();
    match value.get_constant() {
        Some(c) if !object && !wide => {
            let tmp = code.allocate_temp();
            insns.push(const_insn(tmp, c));
            insns.push(IRInstruction::new(IROpcode::IfEq).with_srcs(vec![reg, tmp]));
        }
        Some(c) if wide => {
            let tmp = code.allocate_wide_temp();
            let cmp = code.allocate_temp();
            insns.push(const_wide_insn(tmp, c));
            insns.push(IRInstruction::new(IROpcode::CmpLong).with_dest(cmp).with_srcs(vec![reg, tmp]));
            insns.push(IRInstruction::new(IROpcode::IfEqz).with_srcs(vec![cmp]));
        }
        _ => {
            // references only distinguish null from non-null
            if object && !matches!(sign, Sign::Eqz | Sign::Nez) {
                return None;
            }
            let test = testz_for(sign)?;
            let subject = if wide {
                let zero = code.allocate_wide_temp();
                let cmp = code.allocate_temp();
                insns.push(const_wide_insn(zero, 0));
                insns.push(IRInstruction::new(IROpcode::CmpLong).with_dest(cmp).with_srcs(vec![reg, zero]));
                cmp
            } else {
                reg
            };
            insns.push(IRInstruction::new(test).with_srcs(vec![subject]));
        }
    }
    Some(Check { insns })
}

/// Inserts the checks into `code` and returns how many were added.
pub fn insert_assertions(g: &Interner, code: &mut IRCode, args: &ArgumentDomain, handler: &str) -> Result<usize> {
    if args.is_top() || args.is_bottom() {
        return Ok(0);
    }
    let was_built = code.cfg_built();
    code.clear_cfg()?;

    let handler_method = g.make_method_from_str(&format!("{}.argumentValueError:(I)V", handler))?;
    let params: Vec<(ItemId, Reg, IROpcode)> = code
        .param_instructions()
        .into_iter()
        .filter_map(|id| code.insn(id).and_then(|i| i.dest().map(|d| (id, d, i.opcode()))))
        .collect();
    let Some(mut pos) = params.last().map(|p| p.0) else {
        return Ok(0);
    };

    let mut added = 0;
    for (index, (_, reg, op)) in params.iter().enumerate() {
        let value = args.get(index as u32);
        if value.is_top() || value.is_bottom() {
            continue;
        }
        let Some(check) = build_check(code, *reg, *op, &value) else { continue };
        let mut branch = None;
        for insn in check.insns {
            let is_branch = insn.opcode().is_conditional_branch();
            pos = code.insert_after(pos, MethodItemEntry::Opcode(insn));
            if is_branch {
                branch = Some(pos);
            }
        }
        let idx = code.allocate_temp();
        pos = code.insert_after(pos, MethodItemEntry::Opcode(const_insn(idx, index as i64)));
        pos = code.insert_after(
            pos,
            MethodItemEntry::Opcode(IRInstruction::new(IROpcode::InvokeStatic).with_srcs(vec![idx]).with_method(handler_method)),
        );
        if let Some(src) = branch {
            pos = code.insert_after(pos, MethodItemEntry::Target(BranchTarget { src, kind: BranchTargetKind::Simple }));
        }
        added += 1;
    }
    trace!("[cp] {} argument assertions in {}", added, handler);

    if was_built {
        code.build_cfg()?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::type_checker::TypeChecker;
    use crate::config::TypeCheckerConfig;
    use crate::ir::assembler::{parse_code, print_code};

    #[test]
    fn test_exact_and_interval_checks() {
        let g = Interner::new();
        let mut code = parse_code(&g, "((load-param v0) (load-param v1) (load-param-wide v2) (return-void))").unwrap();
        code.set_registers_size(4);
        let args = ArgumentDomain::top()
            .with(0, ConstantValue::from_constant(5))
            .with(1, ConstantValue::from_sign(Sign::Gez))
            .with(2, ConstantValue::from_constant(1 << 40));
        let n = insert_assertions(&g, &mut code, &args, "LHandler;").unwrap();
        assert_eq!(n, 3);

        let expected = parse_code(
            &g,
            r#"((load-param v0) (load-param v1) (load-param-wide v2)
                (const v4 5) (if-eq v0 v4 :a)
                (const v5 0) (invoke-static (v5) "LHandler;.argumentValueError:(I)V")
                (:a)
                (if-gez v1 :b)
                (const v6 1) (invoke-static (v6) "LHandler;.argumentValueError:(I)V")
                (:b)
                (const-wide v7 1099511627776) (cmp-long v9 v2 v7) (if-eqz v9 :c)
                (const v10 2) (invoke-static (v10) "LHandler;.argumentValueError:(I)V")
                (:c)
                (return-void))"#,
        )
        .unwrap();
        assert_eq!(print_code(&code, &g), print_code(&expected, &g));

        let m = g.make_method_from_str("LFoo;.f:(IIJ)V").unwrap();
        let report = TypeChecker::new(&g, TypeCheckerConfig::default()).run(m, true, &code).unwrap();
        assert!(report.good(), "{:?}", report.errors());
    }

    #[test]
    fn test_unknown_arguments_add_nothing() {
        let g = Interner::new();
        let mut code = parse_code(&g, "((load-param-object v0) (return-void))").unwrap();
        let before = print_code(&code, &g);
        assert_eq!(insert_assertions(&g, &mut code, &ArgumentDomain::top(), "LHandler;").unwrap(), 0);
        // a sign other than zero or non-zero says nothing checkable about a reference
        let args = ArgumentDomain::top().with(0, ConstantValue::from_sign(Sign::Gtz));
        assert_eq!(insert_assertions(&g, &mut code, &args, "LHandler;").unwrap(), 0);
        assert_eq!(print_code(&code, &g), before);
        let args = ArgumentDomain::top().with(0, ConstantValue::nez());
        assert_eq!(insert_assertions(&g, &mut code, &args, "LHandler;").unwrap(), 1);
        assert!(print_code(&code, &g).contains("if-nez v0"));
    }
}
