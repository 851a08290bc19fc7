//! # dexopt
//!
//! A whole-program optimizer for Android DEX bytecode.
//!
//! DEX files are decoded into an editable register IR ([`ir`]) whose method bodies can be
//! viewed as control-flow graphs ([`cfg`]). Analyses are abstract interpretations built from
//! the lattices in [`domains`] and solved by the weak-topological-order iterator in
//! [`fixpoint`]. The passes in [`pass_manager`] then rewrite the program: constant propagation
//! ([`constprop`]), virtual method renaming ([`renamer`]) and type checking ([`analysis`]).
//! Library classes can be read from JAR files ([`jar`]) so that references into the framework
//! resolve.
//!
//! ```no_run
//! use std::path::PathBuf;
//! use dexopt::config::RunConfig;
//! use dexopt::pass_manager::{DexProgram, PassManager};
//!
//! let config = RunConfig::default();
//! let mut program = DexProgram::load(&[PathBuf::from("classes.dex")], &[], &config.loader).unwrap();
//! let mut pm = PassManager::new(config).unwrap();
//! pm.run(&mut program).unwrap();
//! program.write(&PathBuf::from("out")).unwrap();
//! ```

pub mod error;

pub mod analysis;
pub mod cfg;
pub mod config;
pub mod constprop;
pub mod dex;
pub mod domains;
pub mod fixpoint;
pub mod ir;
pub mod jar;
pub mod pass_manager;
pub mod renamer;
pub mod walkers;

#[cfg(test)]
mod tests;
