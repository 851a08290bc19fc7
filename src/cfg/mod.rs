pub mod graph;
pub mod visualizer;

pub use graph::{Block, BlockId, ControlFlowGraph, Edge, EdgeId, EdgeType, InsnRef, ENTRY_BLOCK_ID};
