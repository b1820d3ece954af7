//! A Scheme-dialect interpreter sized for small machines.
//!
//! Values and list links live in two fixed-size slab pools with reference
//! counting (deferred, so long list collapses never recurse) and a
//! mark-and-sweep pass that reclaims cycles the counters cannot see.
//! Evaluation runs on an explicit frame stack with proper tail-call
//! elimination through `begin` frames, so unbounded tail recursion uses
//! constant stack.

/// Deferred-deletion circular queue
mod defer;
/// Slab heap: pools, chunks, bitmaps, handles
pub mod heap;
/// Compiled-in library of Scheme-defined lambdas and macros
pub mod library;
/// List constructors, association lists, substitution
pub mod list;
/// Tagged value model and printing
pub mod node;
/// Operator table and primitive implementations
pub mod ops;
/// Expression reader
pub mod reader;
/// Tokenizer and token classification
pub mod token;
/// The evaluator
pub mod vm;

pub use self::heap::{Heap, HeapStats, ValueId};
pub use self::node::Value;
pub use self::ops::Op;
pub use self::reader::parse;
pub use self::token::Scanner;
pub use self::vm::Vm;
