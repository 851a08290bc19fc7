//! Run configuration.
//!
//! A run is described by one JSON document: the pass list under `redex.passes`, loader
//! options under `loader`, the worker count under `num_threads`, and one object per pass
//! keyed by the pass name.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DexError, ErrorKind, Result};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct PassList {
    pub passes: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Unknown encoded-value tags are fatal instead of being replaced by a zero value.
    pub strict_encoded_values: bool,
    /// Library classes whose duplicate definitions are expected and not worth a warning.
    pub duplicate_class_whitelist: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ConstPropConfig {
    pub replace_moves_with_consts: bool,
    pub fold_arithmetic: bool,
    pub replace_move_result_with_consts: bool,
    pub fold_switches: bool,
}

impl Default for ConstPropConfig {
    fn default() -> Self {
        Self {
            replace_moves_with_consts: true,
            fold_arithmetic: true,
            replace_move_result_with_consts: true,
            fold_switches: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InterproceduralConfig {
    /// Rounds of static-field analysis over `<clinit>` bodies.
    pub max_heap_analysis_iterations: u32,
    pub include_virtuals: bool,
    pub create_runtime_asserts: bool,
    pub assertion_handler: String,
    /// Cap on call-graph fixpoint rounds.
    pub max_iterations: u32,
    /// Non-private methods have unknown callers and start with top arguments.
    pub public_methods_are_roots: bool,
    #[serde(flatten)]
    pub intra: ConstPropConfig,
}

impl Default for InterproceduralConfig {
    fn default() -> Self {
        Self {
            max_heap_analysis_iterations: 1,
            include_virtuals: true,
            create_runtime_asserts: false,
            assertion_handler: "Ldexopt/ConstantPropagationAssertHandler;".to_string(),
            max_iterations: 10,
            public_methods_are_roots: true,
            intra: ConstPropConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct TypeCheckerConfig {
    /// A `const 0` may be used both as a reference and as an int.
    pub enable_polymorphic_constants: bool,
    pub verify_moves: bool,
    pub check_no_overwrite_this: bool,
}

impl Default for TypeCheckerConfig {
    fn default() -> Self {
        Self { enable_polymorphic_constants: true, verify_moves: false, check_no_overwrite_this: false }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RenamerConfig {
    pub avoid_stack_trace_collision: bool,
    /// Annotation descriptors that pin a method's name.
    pub keep_annotations: Vec<String>,
}

impl Default for RenamerConfig {
    fn default() -> Self {
        Self { avoid_stack_trace_collision: true, keep_annotations: Vec::new() }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub output: String,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self { output: "cfg.cfg".to_string() }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub redex: PassList,
    pub num_threads: Option<usize>,
    pub loader: LoaderConfig,
    /// Everything else, keyed by pass name.
    #[serde(flatten)]
    pub pass_options: BTreeMap<String, serde_json::Value>,
}

impl RunConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DexError::with_kind(ErrorKind::InternalError, format!("invalid config: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| e.context(path.display().to_string()))
    }

    /// Options of `pass`, or the defaults when the document has none.
    pub fn pass_config<T: DeserializeOwned + Default>(&self, pass: &str) -> Result<T> {
        match self.pass_options.get(pass) {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| DexError::new(format!("invalid options for {}: {}", pass, e))),
            None => Ok(T::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let c = RunConfig::from_json("{}").unwrap();
        assert!(c.redex.passes.is_empty());
        assert_eq!(c.num_threads, None);
        assert!(!c.loader.strict_encoded_values);
        let ip: InterproceduralConfig = c.pass_config("InterproceduralConstantPropagationPass").unwrap();
        assert_eq!(ip.max_heap_analysis_iterations, 1);
        assert_eq!(ip.assertion_handler, "Ldexopt/ConstantPropagationAssertHandler;");
        assert!(ip.intra.fold_switches);
        let v: VisualizerConfig = c.pass_config("CfgVisualizerPass").unwrap();
        assert_eq!(v.output, "cfg.cfg");
    }

    #[test]
    fn test_pass_sections() {
        let c = RunConfig::from_json(
            r#"{
                "redex": {"passes": ["ConstantPropagationPass", "RenameVirtualsPass"]},
                "num_threads": 3,
                "loader": {"strict_encoded_values": true},
                "ConstantPropagationPass": {"replace_moves_with_consts": false},
                "RenameVirtualsPass": {"keep_annotations": ["LKeep;"]}
            }"#,
        )
        .unwrap();
        assert_eq!(c.redex.passes.len(), 2);
        assert_eq!(c.num_threads, Some(3));
        assert!(c.loader.strict_encoded_values);
        let cp: ConstPropConfig = c.pass_config("ConstantPropagationPass").unwrap();
        assert!(!cp.replace_moves_with_consts);
        assert!(cp.fold_arithmetic);
        let r: RenamerConfig = c.pass_config("RenameVirtualsPass").unwrap();
        assert_eq!(r.keep_annotations, vec!["LKeep;".to_string()]);
        assert!(r.avoid_stack_trace_collision);
    }

    #[test]
    fn test_bad_option_type_is_an_error() {
        let c = RunConfig::from_json(r#"{"TypeCheckerPass": {"verify_moves": "yes"}}"#).unwrap();
        assert!(c.pass_config::<TypeCheckerConfig>("TypeCheckerPass").is_err());
        assert!(RunConfig::from_json("[1, 2]").is_err());
    }
}
