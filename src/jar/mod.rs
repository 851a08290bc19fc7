//! Library classes from JAR files, declared for reference resolution only.

pub mod class_file;
pub mod loader;

pub use loader::{load_jar_files, JarLoader};
