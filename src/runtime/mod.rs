//! Runtime kernel shared by the interpreter and the host bridge
//!
//! - Memory allocation and GC (heap.rs)
//! - Error classes and the native return-code convention (error.rs)

pub mod error;
pub mod heap;

pub use error::{EngineError, ErrorKind, ExecStatus};
pub use heap::{CollectStats, Heap, HeapConfig};
