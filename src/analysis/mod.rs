//! Analyses over method bodies and the class hierarchy.

pub mod call_graph;
pub mod reflection;
pub mod type_checker;
pub mod type_inference;
