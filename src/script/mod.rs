//! The submission language: lexer, parser, type checker, bytecode compiler and VM.

#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod diagnostic;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod parser;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod builtins;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod value;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod typeck;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod compiler;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod vm;

use builtins::ReferenceSet;
use compiler::CompiledSubmission;
use diagnostic::Diagnostic;
use parser::{LanguageVersion, ParseOptions};
use typeck::{Declarations, PriorSubmission};

/// Per-session compiler configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub language_version: LanguageVersion,
}

/// Why a submission produced no image.
#[derive(Debug, Clone)]
pub enum CompileFailure {
    /// Error diagnostics, with any warnings and info, in emission order.
    Diagnostics(Vec<Diagnostic>),
    /// Checking succeeded but code generation did not.
    Emit(Diagnostic),
}

/// A successfully compiled submission.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub submission: CompiledSubmission,
    pub declarations: Declarations,
    /// Warnings and info; never contains errors.
    pub diagnostics: Vec<Diagnostic>,
}

/// Compile one submission against the declarations of earlier ones.
///
/// source → lex → parse → type check → compile
pub fn compile_submission(
    source: &str,
    id: u32,
    prior: &[PriorSubmission<'_>],
    refs: &ReferenceSet,
    options: CompileOptions,
) -> Result<CompileOutput, CompileFailure> {
    let tokens = lexer::lex(source).map_err(CompileFailure::Diagnostics)?;
    let parse_options = ParseOptions {
        language_version: options.language_version,
    };
    let script = parser::parse(tokens, parse_options).map_err(CompileFailure::Diagnostics)?;
    let typed = typeck::type_check(&script, id, prior, refs).map_err(CompileFailure::Diagnostics)?;
    let submission = compiler::compile(&typed, source).map_err(CompileFailure::Emit)?;
    Ok(CompileOutput {
        submission,
        declarations: typed.declarations,
        diagnostics: typed.diagnostics,
    })
}
