//! SnapHeap Library
//!
//! A versioned, copy-on-write, reference-counted heap for tree-walking
//! interpreters that need to backtrack.
//!
//! The interpreter can fork the whole heap at any point, explore a branch,
//! and later discard or commit it. Forks are cheap: heaps share their pages
//! and only copy the ones a branch writes to. Cells are reference counted and
//! any access to a freed cell is reported as a segmentation fault.
//!
//! ```
//! use snapheap::{MemoryManager, Value};
//!
//! let mut memory = MemoryManager::new();
//! let counter = memory.allocate(Value::Int(0))?;
//! let kept = memory.speculate(|memory| {
//!     memory.write(counter, Value::Int(1))?;
//!     Ok(false)
//! })?;
//! assert!(!kept);
//! assert_eq!(memory.dereference(counter)?, &Value::Int(0));
//! # Ok::<(), snapheap::HeapError>(())
//! ```

mod error;
pub mod memory;
pub mod value;
pub mod workload;

pub use error::{Fault, HeapError, PageKind, Result};
pub use memory::{MemoryConfig, MemoryManager, MemoryStats, VersionId};
pub use value::{Handle, Value};
