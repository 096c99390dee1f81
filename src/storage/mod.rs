//! Durable key/value storage for the consensus log and state cells.

pub mod engine;
pub mod file;
pub mod memory;

pub use engine::{Engine, ScanIterator, Status};
pub use file::File;
pub use memory::Memory;
