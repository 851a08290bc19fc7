//! In-memory representation of classes and method bodies.

pub mod assembler;
pub mod class;
pub mod code;
pub mod creators;
pub mod instruction;
pub mod interner;
pub mod opcode;
pub mod types;
