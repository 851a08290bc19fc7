//! Renaming of virtual methods to short names.

pub mod names;
pub mod union_find;
pub mod virtual_renamer;

pub use virtual_renamer::{RenameStats, VirtualRenamer};
