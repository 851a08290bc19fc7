use super::{body_of, canonical, class, method};
use crate::config::{LoaderConfig, RunConfig};
use crate::dex::encoded_values::EncodedValue;
use crate::ir::class::{AccessFlags, DexField};
use crate::ir::interner::MethodId;
use crate::ir::opcode::IROpcode;
use crate::pass_manager::{DexProgram, PassManager};

const STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

fn pipeline(passes: &[&str]) -> PassManager {
    let mut config = RunConfig::default();
    config.redex.passes = passes.iter().map(|p| p.to_string()).collect();
    config.num_threads = Some(2);
    PassManager::new(config).unwrap()
}

/// A program with one class `LFoo;` holding a single static method `sig`.
fn single_method(sig: &str, body: &str) -> (DexProgram, MethodId) {
    let mut p = DexProgram::new();
    let mut foo = class(&p.g, "LFoo;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
    let m = method(&p.g, &mut foo, sig, STATIC, body);
    p.add_dex("classes.dex", vec![foo]).unwrap();
    (p, m)
}

/// Opcodes of `sig` once `program` has been written out and read back.
fn reloaded_opcodes(program: &DexProgram, sig: &str) -> Vec<IROpcode> {
    let dir = tempfile::tempdir().unwrap();
    let written = program.write(dir.path()).unwrap();
    let mut reloaded = DexProgram::load(&written, &[], &LoaderConfig::default()).unwrap();
    reloaded.scope.materialize_all(&reloaded.g).unwrap();
    let m = reloaded.g.make_method_from_str(sig).unwrap();
    let code = reloaded.scope.method_def(m, &reloaded.g).unwrap().code().unwrap();
    code.instructions().map(|(_, i)| i.opcode()).collect()
}

#[test]
fn move_of_constant_becomes_const() {
    let (mut p, m) = single_method("LFoo;.f:()V", "((const v1 0) (move v0 v1) (return-void))");
    let mut pm = pipeline(&["ConstantPropagationPass"]);
    pm.run(&mut p).unwrap();
    assert_eq!(body_of(&p.g, &p.scope, m), canonical(&p.g, "((const v1 0) (const v0 0) (return-void))"));
    assert_eq!(pm.metrics()["constant_propagation.num_moves_replaced_by_const"], 1);
    assert_eq!(reloaded_opcodes(&p, "LFoo;.f:()V"), vec![IROpcode::Const, IROpcode::Const, IROpcode::ReturnVoid]);
}

#[test]
fn moves_are_kept_when_disabled() {
    let mut config = RunConfig::default();
    config.redex.passes = vec!["ConstantPropagationPass".to_string()];
    config
        .pass_options
        .insert("ConstantPropagationPass".to_string(), serde_json::json!({ "replace_moves_with_consts": false }));
    let body = "((const v1 0) (move v0 v1) (return-void))";
    let (mut p, m) = single_method("LFoo;.f:()V", body);
    let mut pm = PassManager::new(config).unwrap();
    pm.run(&mut p).unwrap();
    assert_eq!(body_of(&p.g, &p.scope, m), canonical(&p.g, body));
    assert_eq!(pm.metrics()["constant_propagation.num_moves_replaced_by_const"], 0);
}

#[test]
fn never_taken_branch_is_folded_then_swept() {
    let body = "((const v0 0) (if-eqz v0 :L1) (const v0 1) (:L1) (return-void))";
    let (mut p, m) = single_method("LFoo;.f:()V", body);
    pipeline(&["ConstantPropagationPass"]).run(&mut p).unwrap();
    assert_eq!(
        body_of(&p.g, &p.scope, m),
        canonical(&p.g, "((const v0 0) (goto :L1) (const v0 1) (:L1) (return-void))")
    );

    let (mut p, m) = single_method("LFoo;.f:()V", body);
    let mut pm = pipeline(&["ConstantPropagationPass", "RemoveUnreachableBlocksPass", "TypeCheckerPass"]);
    pm.run(&mut p).unwrap();
    assert_eq!(body_of(&p.g, &p.scope, m), canonical(&p.g, "((const v0 0) (return-void))"));
    assert_eq!(pm.metrics()["constant_propagation.num_branch_propagated"], 1);
    assert!(pm.metrics()["unreachable_blocks.instructions_removed"] >= 1);
    assert_eq!(reloaded_opcodes(&p, "LFoo;.f:()V"), vec![IROpcode::Const, IROpcode::ReturnVoid]);
}

#[test]
fn literal_arithmetic_folds_and_saturates() {
    let (mut p, m) = single_method("LFoo;.f:()I", "((const v1 41) (add-int/lit8 v0 v1 1) (return v0))");
    let mut pm = pipeline(&["ConstantPropagationPass", "TypeCheckerPass"]);
    pm.run(&mut p).unwrap();
    assert_eq!(body_of(&p.g, &p.scope, m), canonical(&p.g, "((const v1 41) (const v0 42) (return v0))"));

    let body = "((const v1 2147483647) (add-int/lit8 v0 v1 1) (return v0))";
    let (mut p, m) = single_method("LFoo;.f:()I", body);
    pipeline(&["ConstantPropagationPass"]).run(&mut p).unwrap();
    assert_eq!(body_of(&p.g, &p.scope, m), canonical(&p.g, body));
}

#[test]
fn argument_constant_crosses_call() {
    let mut p = DexProgram::new();
    let g = &p.g;
    let mut foo = class(g, "LFoo;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
    method(
        g,
        &mut foo,
        "LFoo;.bar:()V",
        AccessFlags::PUBLIC,
        r#"((load-param-object v0) (const v1 0) (invoke-direct (v0 v1) "LFoo;.baz:(I)V") (return-void))"#,
    );
    let baz = method(
        g,
        &mut foo,
        "LFoo;.baz:(I)V",
        AccessFlags::PRIVATE,
        "((load-param-object v0) (load-param v1) (if-eqz v1 :L) (const v2 1) (:L) (return-void))",
    );
    p.add_dex("classes.dex", vec![foo]).unwrap();

    let mut pm = pipeline(&["InterproceduralConstantPropagationPass"]);
    pm.run(&mut p).unwrap();
    assert_eq!(
        body_of(&p.g, &p.scope, baz),
        canonical(&p.g, "((load-param-object v0) (load-param v1) (goto :L) (const v2 1) (:L) (return-void))")
    );
    assert_eq!(pm.metrics()["interprocedural_cp.num_branch_propagated"], 1);
    assert!(pm.metrics()["interprocedural_cp.methods_with_known_args"] >= 1);
}

#[test]
fn final_static_field_reads_become_consts() {
    let mut p = DexProgram::new();
    let g = &p.g;
    let mut a = class(g, "LA;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
    let x = g.make_field_from_str("LA;.x:I").unwrap();
    let mut field = DexField::new(x, AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL);
    field.static_value = Some(EncodedValue::Int(42));
    a.sfields.push(field);
    method(g, &mut a, "LA;.get:()I", STATIC, r#"((sget "LA;.x:I") (move-result-pseudo v0) (return v0))"#);
    p.add_dex("classes.dex", vec![a]).unwrap();

    // through the written file, so the value comes from the encoded static values
    let dir = tempfile::tempdir().unwrap();
    let written = p.write(dir.path()).unwrap();
    let mut p = DexProgram::load(&written, &[], &LoaderConfig::default()).unwrap();
    let mut pm = pipeline(&["InterproceduralConstantPropagationPass", "TypeCheckerPass"]);
    pm.run(&mut p).unwrap();
    let get = p.g.make_method_from_str("LA;.get:()I").unwrap();
    assert_eq!(body_of(&p.g, &p.scope, get), canonical(&p.g, "((const v0 42) (return v0))"));
    assert_eq!(pm.metrics()["interprocedural_cp.num_sget_replaced_by_const"], 1);
}
