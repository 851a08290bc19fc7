//! Runs a configured list of passes over a whole program.
//!
//! A pass sees the program (interner, scope and dex grouping) and a context with the run
//! configuration, the worker pool and the metrics sink. Per-method passes go through the
//! [`Walker`]; whole-program passes work on the scope directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::analysis::type_checker::check_method;
use crate::cfg::visualizer::CfgVisualizer;
use crate::config::{
    ConstPropConfig, InterproceduralConfig, LoaderConfig, RenamerConfig, RunConfig, TypeCheckerConfig, VisualizerConfig,
};
use crate::constprop::{optimize_code, InterproceduralConstantPropagation, TransformStats};
use crate::dex::loader::load_dex_files;
use crate::dex::writer::DexWriter;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::class::{DexClass, DexStore, Scope};
use crate::ir::interner::Interner;
use crate::jar::load_jar_files;
use crate::renamer::VirtualRenamer;
use crate::walkers::Walker;

/// Everything the passes work on.
pub struct DexProgram {
    pub g: Interner,
    pub scope: Scope,
    pub store: DexStore,
}

impl Default for DexProgram {
    fn default() -> Self {
        DexProgram::new()
    }
}

impl DexProgram {
    pub fn new() -> Self {
        DexProgram { g: Interner::new(), scope: Scope::new(), store: DexStore::default() }
    }

    /// Reads the input DEX files and declares the classes of the library JARs.
    pub fn load(dex_paths: &[PathBuf], jar_paths: &[PathBuf], config: &LoaderConfig) -> Result<Self> {
        let mut program = DexProgram::new();
        for (name, classes) in load_dex_files(&program.g, dex_paths, config.strict_encoded_values)? {
            program.add_dex(&name, classes)?;
        }
        load_jar_files(&program.g, &mut program.scope, jar_paths, config)?;
        info!(
            "[loader] {} classes in {} dex files, {} in scope",
            program.store.all().count(),
            program.store.dexes.len(),
            program.scope.len()
        );
        Ok(program)
    }

    /// Adds the classes of one DEX file. A class defined twice is fatal.
    pub fn add_dex(&mut self, name: &str, classes: Vec<DexClass>) -> Result<()> {
        let types = classes.iter().map(|c| c.ty).collect();
        for mut c in classes {
            if c.location.is_empty() {
                c.location = name.to_string();
            }
            self.scope.add_class(&self.g, c)?;
        }
        self.store.dexes.push((name.to_string(), types));
        Ok(())
    }

    /// Writes one DEX file per input DEX into `dir`: `classes.dex`, `classes2.dex`, ...
    pub fn write(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|e| DexError::new(format!("cannot create {}: {}", dir.display(), e)))?;
        let writer = DexWriter::new(&self.g);
        let mut written = Vec::with_capacity(self.store.dexes.len());
        for (i, (_, types)) in self.store.dexes.iter().enumerate() {
            let classes: Vec<DexClass> = types.iter().filter_map(|t| self.scope.class(*t).cloned()).collect();
            let path = match i {
                0 => dir.join("classes.dex"),
                _ => dir.join(format!("classes{}.dex", i + 1)),
            };
            writer.write_to_file(&classes, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

pub struct PassContext<'a> {
    pub config: &'a RunConfig,
    pub walker: &'a Walker,
    pub metrics: &'a mut BTreeMap<String, i64>,
}

impl PassContext<'_> {
    pub fn incr(&mut self, key: &str, by: i64) {
        *self.metrics.entry(key.to_string()).or_insert(0) += by;
    }
}

pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()>;
}

pub struct ConstantPropagationPass;

impl Pass for ConstantPropagationPass {
    fn name(&self) -> &'static str {
        "ConstantPropagationPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let config: ConstPropConfig = ctx.config.pass_config(self.name())?;
        let DexProgram { g, scope, .. } = program;
        let g = &*g;
        let per_method = ctx.walker.map_methods_parallel(scope, |m| match m.code_mut(g)? {
            Some(code) => optimize_code(g, &config, code, None, None),
            None => Ok(TransformStats::default()),
        })?;
        let mut stats = TransformStats::default();
        for s in per_method {
            stats += s;
        }
        stats.report("constant_propagation", ctx.metrics);
        info!("[cp] {} rewrites", stats.total());
        Ok(())
    }
}

pub struct InterproceduralConstantPropagationPass;

impl Pass for InterproceduralConstantPropagationPass {
    fn name(&self) -> &'static str {
        "InterproceduralConstantPropagationPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let config: InterproceduralConfig = ctx.config.pass_config(self.name())?;
        let result = InterproceduralConstantPropagation::new(&program.g, config).run(&mut program.scope)?;
        result.report(ctx.metrics);
        Ok(())
    }
}

/// Verifies every method body; the first failure aborts the run.
pub struct TypeCheckerPass;

impl Pass for TypeCheckerPass {
    fn name(&self) -> &'static str {
        "TypeCheckerPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let config: TypeCheckerConfig = ctx.config.pass_config(self.name())?;
        let DexProgram { g, scope, .. } = program;
        let g = &*g;
        let checked = ctx.walker.map_methods_parallel(scope, |m| {
            let reference = m.reference;
            let is_static = m.is_static();
            match m.code_mut(g)? {
                Some(code) => check_method(g, &config, reference, is_static, code).map(|_| 1i64),
                None => Ok(0i64),
            }
        })?;
        ctx.incr("type_checker.methods_checked", checked.iter().sum());
        Ok(())
    }
}

pub struct RenameVirtualsPass;

impl Pass for RenameVirtualsPass {
    fn name(&self) -> &'static str {
        "RenameVirtualsPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let config: RenamerConfig = ctx.config.pass_config(self.name())?;
        let stats = VirtualRenamer::new(&program.g, config).run(&mut program.scope)?;
        stats.report(ctx.metrics);
        Ok(())
    }
}

/// Drops the blocks earlier rewrites made unreachable.
pub struct RemoveUnreachableBlocksPass;

impl Pass for RemoveUnreachableBlocksPass {
    fn name(&self) -> &'static str {
        "RemoveUnreachableBlocksPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let DexProgram { g, scope, .. } = program;
        let g = &*g;
        let removed = ctx.walker.map_methods_parallel(scope, |m| {
            let Some(code) = m.code_mut(g)? else { return Ok(0) };
            let was_built = code.cfg_built();
            code.build_cfg()?;
            let n = code.cfg_mut().map_or(0, |cfg| cfg.remove_unreachable_blocks());
            if !was_built {
                code.clear_cfg()?;
            }
            Ok(n as i64)
        })?;
        ctx.incr("unreachable_blocks.instructions_removed", removed.iter().sum());
        Ok(())
    }
}

/// Appends the CFG of every method to the configured C1 visualizer file.
pub struct CfgVisualizerPass;

impl Pass for CfgVisualizerPass {
    fn name(&self) -> &'static str {
        "CfgVisualizerPass"
    }

    fn run(&self, program: &mut DexProgram, ctx: &mut PassContext<'_>) -> Result<()> {
        let config: VisualizerConfig = ctx.config.pass_config(self.name())?;
        let DexProgram { g, scope, .. } = program;
        let g = &*g;
        scope.materialize_all(g)?;
        let mut vis = CfgVisualizer::new(g);
        let mut dumped = 0;
        for class in scope.internal_classes() {
            for m in class.methods() {
                let Some(code) = m.code() else { continue };
                vis.begin_compilation(&g.show_method(m.reference));
                vis.add_code(self.name(), code)?;
                dumped += 1;
            }
        }
        vis.append_to_file(Path::new(&config.output))?;
        ctx.incr("cfg_visualizer.methods_dumped", dumped);
        Ok(())
    }
}

/// The built-in pass called `name`.
pub fn create_pass(name: &str) -> Result<Box<dyn Pass>> {
    Ok(match name {
        "ConstantPropagationPass" => Box::new(ConstantPropagationPass),
        "InterproceduralConstantPropagationPass" => Box::new(InterproceduralConstantPropagationPass),
        "TypeCheckerPass" => Box::new(TypeCheckerPass),
        "RenameVirtualsPass" => Box::new(RenameVirtualsPass),
        "RemoveUnreachableBlocksPass" => Box::new(RemoveUnreachableBlocksPass),
        "CfgVisualizerPass" => Box::new(CfgVisualizerPass),
        _ => {
            return Err(DexError::with_kind(ErrorKind::InternalError, format!("unknown pass {}", name))
                .extra("pass", name))
        }
    })
}

pub struct PassManager {
    config: RunConfig,
    passes: Vec<Box<dyn Pass>>,
    walker: Walker,
    metrics: BTreeMap<String, i64>,
}

impl PassManager {
    /// Resolves every pass of `config.redex.passes` up front.
    pub fn new(config: RunConfig) -> Result<Self> {
        let passes = config.redex.passes.iter().map(|p| create_pass(p)).collect::<Result<Vec<_>>>()?;
        let walker = Walker::new(config.num_threads)?;
        Ok(PassManager { config, passes, walker, metrics: BTreeMap::new() })
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&mut self, program: &mut DexProgram) -> Result<()> {
        for pass in &self.passes {
            info!("[pass] running {}", pass.name());
            let mut ctx = PassContext { config: &self.config, walker: &self.walker, metrics: &mut self.metrics };
            pass.run(program, &mut ctx).map_err(|e| e.context(pass.name()))?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> &BTreeMap<String, i64> {
        &self.metrics
    }

    pub fn write_metrics(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.metrics)
            .map_err(|e| DexError::new(format!("cannot serialize metrics: {}", e)))?;
        fs::write(path, text).map_err(|e| DexError::new(format!("cannot write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::assembler::{parse_code, print_code};
    use crate::ir::class::{AccessFlags, DexMethod};

    fn program(body: &str) -> DexProgram {
        let mut p = DexProgram::new();
        let m = p.g.make_method_from_str("LFoo;.bar:()I").unwrap();
        let mut c = DexClass::new(p.g.make_type("LFoo;"), Some(p.g.make_type("Ljava/lang/Object;")), AccessFlags::PUBLIC);
        c.add_method(&p.g, DexMethod::new(m, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code(parse_code(&p.g, body).unwrap()))
            .unwrap();
        p.add_dex("classes.dex", vec![c]).unwrap();
        p
    }

    fn config(passes: &[&str]) -> RunConfig {
        let mut c = RunConfig::default();
        c.redex.passes = passes.iter().map(|p| p.to_string()).collect();
        c.num_threads = Some(2);
        c
    }

    #[test]
    fn test_pipeline_rewrites_and_counts() {
        let mut p = program("((const v0 0) (if-eqz v0 :t) (const v1 1) (return v1) (:t) (const v1 2) (return v1))");
        let mut pm =
            PassManager::new(config(&["ConstantPropagationPass", "RemoveUnreachableBlocksPass", "TypeCheckerPass"])).unwrap();
        pm.run(&mut p).unwrap();
        let m = p.g.make_method_from_str("LFoo;.bar:()I").unwrap();
        let code = p.scope.method_def(m, &p.g).unwrap().code().unwrap();
        let expected = parse_code(&p.g, "((const v0 0) (const v1 2) (return v1))").unwrap();
        assert_eq!(print_code(code, &p.g), print_code(&expected, &p.g));
        assert_eq!(pm.metrics()["constant_propagation.num_branch_propagated"], 1);
        assert_eq!(pm.metrics()["type_checker.methods_checked"], 1);
        assert!(pm.metrics()["unreachable_blocks.instructions_removed"] >= 2);
    }

    #[test]
    fn test_unknown_pass_is_rejected() {
        let err = PassManager::new(config(&["ConstantPropagationPass", "NoSuchPass"])).err().unwrap();
        assert_eq!(err.extra_info().get("pass").map(String::as_str), Some("NoSuchPass"));
    }

    #[test]
    fn test_type_errors_are_fatal() {
        let mut p = program("((add-int/lit8 v0 v1 1) (return v0))");
        let mut pm = PassManager::new(config(&["TypeCheckerPass"])).unwrap();
        let err = pm.run(&mut p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeCheckError);
    }

    #[test]
    fn test_write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = program("((const v0 7) (return v0))");
        let mut pm = PassManager::new(config(&["CfgVisualizerPass"])).unwrap();
        let vis = dir.path().join("out.cfg");
        pm.config.pass_options.insert(
            "CfgVisualizerPass".to_string(),
            serde_json::json!({ "output": vis.display().to_string() }),
        );
        pm.run(&mut p).unwrap();
        assert!(fs::read_to_string(&vis).unwrap().contains("LFoo;.bar:()I"));

        let out = dir.path().join("out");
        let written = p.write(&out).unwrap();
        assert_eq!(written, vec![out.join("classes.dex")]);
        let metrics = dir.path().join("metrics.json");
        pm.write_metrics(&metrics).unwrap();
        let parsed: BTreeMap<String, i64> = serde_json::from_str(&fs::read_to_string(&metrics).unwrap()).unwrap();
        assert_eq!(parsed["cfg_visualizer.methods_dumped"], 1);

        let reloaded = DexProgram::load(&written, &[], &LoaderConfig::default()).unwrap();
        assert_eq!(reloaded.store.dexes.len(), 1);
        let m = reloaded.g.make_method_from_str("LFoo;.bar:()I").unwrap();
        assert!(reloaded.scope.method_def(m, &reloaded.g).is_some());
    }
}
