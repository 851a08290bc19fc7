//! Constant propagation: the fixpoint analysis, the rewrites it justifies, the
//! whole-program driver and the optional argument assertions.

pub mod analyzer;
pub mod assertions;
pub mod interprocedural;
pub mod transform;

pub use analyzer::{
    ArgumentDomain, ConstantEnvironment, ConstantPropagationAnalyzer, ConstantValue, FieldEnvironment, ObjectValue,
};
pub use interprocedural::{InterproceduralConstantPropagation, InterproceduralResult};
pub use transform::TransformStats;

use crate::config::ConstPropConfig;
use crate::error::{DexError, ErrorKind, Result};
use crate::ir::code::IRCode;
use crate::ir::interner::Interner;

/// Propagates constants through one method body and rewrites it. `args` seeds the
/// parameters; `None` leaves them unknown.
pub fn optimize_code(
    g: &Interner,
    config: &ConstPropConfig,
    code: &mut IRCode,
    fields: Option<&FieldEnvironment>,
    args: Option<ArgumentDomain>,
) -> Result<TransformStats> {
    let was_built = code.cfg_built();
    code.build_cfg()?;
    let cfg = code
        .cfg_mut()
        .ok_or_else(|| DexError::with_kind(ErrorKind::InternalError, "control flow graph missing after build"))?;
    let mut analyzer = ConstantPropagationAnalyzer::new(g, cfg, config.clone());
    if let Some(fields) = fields {
        analyzer = analyzer.with_fields(fields);
    }
    if let Some(args) = args {
        analyzer = analyzer.with_args(args);
    }
    let stats = transform::optimize(cfg, analyzer)?;
    if !was_built {
        code.clear_cfg()?;
    }
    Ok(stats)
}
