pub mod iterator;
pub mod wto;

pub use iterator::{FixpointAnalyzer, FixpointIterator};
