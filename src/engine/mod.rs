//! The incremental session engine: compilation chain, state store, execution
//! host and the REPL orchestrator that drives them.

pub mod chain;
pub mod classify;
pub mod console;
pub mod format;
pub mod host;
pub mod references;
pub mod repl;
pub mod state;

pub use chain::{CodeSpace, CompilationChain, CompilationUnit, EntryPoint};
pub use host::{Completion, ExecutionHost, ExecutionResult};
pub use references::{ReferenceSupplier, StandardReferences};
pub use repl::{ReplEngine, SubmissionReport};
pub use state::SubmissionState;
