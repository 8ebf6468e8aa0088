use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::engine::classify::partition;
use crate::error::EngineError;
use crate::script::builtins::ReferenceSet;
use crate::script::compiler::{CompiledSubmission, ENTRY_ROUTINE};
use crate::script::diagnostic::Diagnostic;
use crate::script::typeck::{Declarations, PriorSubmission};
use crate::script::vm::CodeLookup;
use crate::script::{compile_submission, CompileFailure, CompileOptions};

/// Namespace that holds every submission type.
pub const SCRIPT_NAMESPACE: &str = "Script";

/// Stack of the compiler thread. Every front-end pass recurses once per
/// nesting level, up to the parser's `MAX_NESTING`.
const COMPILE_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Where a submission's top-level code lives: `Script.Submission#3.<Main>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub namespace: String,
    pub type_name: String,
    pub method: String,
}

impl EntryPoint {
    pub fn for_submission(id: u32) -> Self {
        Self {
            namespace: SCRIPT_NAMESPACE.to_string(),
            type_name: format!("Submission#{id}"),
            method: ENTRY_ROUTINE.to_string(),
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.type_name, self.method)
    }
}

/// Immutable snapshot of all code accepted so far plus one new submission.
/// Earlier submissions are reached through `previous`.
pub struct CompilationUnit {
    id: u32,
    source: Arc<str>,
    previous: Option<Arc<CompilationUnit>>,
    references: Arc<ReferenceSet>,
    declarations: Declarations,
    entry: EntryPoint,
    image: Arc<CompiledSubmission>,
    /// Warnings and info from compiling this submission.
    diagnostics: Vec<Diagnostic>,
}

impl CompilationUnit {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn previous(&self) -> Option<&Arc<CompilationUnit>> {
        self.previous.as_ref()
    }

    pub fn references(&self) -> &Arc<ReferenceSet> {
        &self.references
    }

    pub fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn image(&self) -> &Arc<CompiledSubmission> {
        &self.image
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// This unit, then each predecessor, newest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &CompilationUnit> {
        std::iter::successors(Some(self), |u| u.previous.as_deref())
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("id", &self.id)
            .field("entry", &self.entry.to_string())
            .field("previous", &self.previous.as_ref().map(|p| p.id))
            .field("globals", &self.declarations.globals.len())
            .field("functions", &self.declarations.functions.len())
            .finish_non_exhaustive()
    }
}

impl Drop for CompilationUnit {
    // Unlink iteratively so a long chain does not recurse on drop.
    fn drop(&mut self) {
        let mut next = self.previous.take();
        while let Some(unit) = next {
            match Arc::try_unwrap(unit) {
                Ok(mut unit) => next = unit.previous.take(),
                Err(_) => break,
            }
        }
    }
}

/// Why a submission did not become a unit.
#[derive(Debug, Clone)]
pub enum CompileRejection {
    /// The submission has errors. All diagnostics, in emission order.
    Diagnostics(Vec<Diagnostic>),
    /// Code generation failed after a clean check.
    Divergence(Diagnostic),
}

/// Everything needed to compile one submission, detached from the chain so
/// it can run on another thread.
#[derive(Debug, Clone)]
pub struct CompileJob {
    id: u32,
    source: Arc<str>,
    previous: Option<Arc<CompilationUnit>>,
    references: Arc<ReferenceSet>,
    options: CompileOptions,
}

impl CompileJob {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Run the job on its own thread, sized so deeply nested input is
    /// rejected by the parser rather than exhausting the stack.
    pub async fn spawn(self) -> Result<Result<Arc<CompilationUnit>, CompileRejection>, EngineError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name(format!("compile-{}", self.id))
            .stack_size(COMPILE_STACK_SIZE)
            .spawn(move || {
                tx.send(self.run()).ok();
            })
            .map_err(|e| EngineError::HostFailure {
                message: format!("Cannot start the compiler thread: {e}"),
            })?;
        rx.await.map_err(|_| EngineError::HostFailure {
            message: "Compiler thread stopped without a result".into(),
        })
    }

    pub fn run(self) -> Result<Arc<CompilationUnit>, CompileRejection> {
        log::debug!(
            "compiling Submission#{} ({} bytes, language {})",
            self.id,
            self.source.len(),
            self.options.language_version.label()
        );
        let output = {
            let prior: Vec<PriorSubmission<'_>> = self
                .previous
                .iter()
                .flat_map(|p| p.ancestors())
                .filter(|u| !u.declarations.is_empty())
                .map(|u| PriorSubmission {
                    id: u.id,
                    declarations: &u.declarations,
                })
                .collect();
            compile_submission(&self.source, self.id, &prior, &self.references, self.options)
        };
        match output {
            Ok(output) => Ok(Arc::new(CompilationUnit {
                id: self.id,
                source: self.source,
                previous: self.previous,
                references: self.references,
                declarations: output.declarations,
                entry: EntryPoint::for_submission(self.id),
                image: Arc::new(output.submission),
                diagnostics: output.diagnostics,
            })),
            Err(CompileFailure::Diagnostics(diagnostics)) => {
                let parts = partition(&diagnostics);
                log::debug!(
                    "Submission#{} rejected: {} errors, {} warnings, {} info",
                    self.id,
                    parts.errors.len(),
                    parts.warnings.len(),
                    parts.info.len()
                );
                Err(CompileRejection::Diagnostics(diagnostics))
            }
            Err(CompileFailure::Emit(diagnostic)) => {
                log::warn!("Submission#{} diverged during emit: {diagnostic}", self.id);
                Err(CompileRejection::Divergence(diagnostic))
            }
        }
    }
}

/// Loaded images, keyed by submission id. Shared with running submissions so
/// calls into earlier submissions resolve.
#[derive(Debug, Clone, Default)]
pub struct CodeSpace {
    images: Arc<RwLock<IndexMap<u32, Arc<CompiledSubmission>>>>,
}

impl CodeSpace {
    /// Load an image. Returns false if one is already loaded for its id.
    pub fn load(&self, image: Arc<CompiledSubmission>) -> bool {
        let mut images = self.images.write();
        if images.contains_key(&image.id) {
            return false;
        }
        images.insert(image.id, image);
        true
    }

    pub fn get(&self, id: u32) -> Option<Arc<CompiledSubmission>> {
        self.images.read().get(&id).cloned()
    }

    /// The loaded image for `unit`, if it is the one the unit was compiled to.
    pub fn resolve(&self, unit: &CompilationUnit) -> Option<Arc<CompiledSubmission>> {
        self.get(unit.id).filter(|image| Arc::ptr_eq(image, &unit.image))
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CodeLookup for CodeSpace {
    fn submission(&self, id: u32) -> Option<Arc<CompiledSubmission>> {
        self.get(id)
    }
}

/// The evolving program: the newest accepted unit, the session's reference
/// set and the submission counter.
#[derive(Debug)]
pub struct CompilationChain {
    head: Option<Arc<CompilationUnit>>,
    references: Arc<ReferenceSet>,
    options: CompileOptions,
    code: CodeSpace,
    submission_count: u32,
}

impl CompilationChain {
    pub fn new(references: ReferenceSet, options: CompileOptions) -> Self {
        Self {
            head: None,
            references: Arc::new(references),
            options,
            code: CodeSpace::default(),
            submission_count: 0,
        }
    }

    pub fn head(&self) -> Option<&Arc<CompilationUnit>> {
        self.head.as_ref()
    }

    /// Entry point of the newest accepted submission.
    pub fn entry_point(&self) -> Option<&EntryPoint> {
        self.head.as_deref().map(CompilationUnit::entry_point)
    }

    /// Number of accepted submissions, and the id of the next one.
    pub fn submission_count(&self) -> u32 {
        self.submission_count
    }

    pub fn references(&self) -> &Arc<ReferenceSet> {
        &self.references
    }

    pub fn code_space(&self) -> &CodeSpace {
        &self.code
    }

    /// Package `source` for compilation against the current head.
    pub fn job(&self, source: &str) -> CompileJob {
        CompileJob {
            id: self.submission_count,
            source: Arc::from(source),
            previous: self.head.clone(),
            references: Arc::clone(&self.references),
            options: self.options,
        }
    }

    /// Compile against the current head without advancing the chain.
    pub fn compile(&self, source: &str) -> Result<Arc<CompilationUnit>, CompileRejection> {
        self.job(source).run()
    }

    /// Load the unit's image into the code space and make it the head.
    pub fn commit(&mut self, unit: Arc<CompilationUnit>) -> Result<(), EngineError> {
        if unit.id != self.submission_count {
            return Err(EngineError::ChainOutOfOrder {
                expected: self.submission_count,
                found: unit.id,
            });
        }
        let on_head = match (&unit.previous, &self.head) {
            (None, None) => true,
            (Some(p), Some(h)) => Arc::ptr_eq(p, h),
            _ => false,
        };
        if !on_head || !self.code.load(Arc::clone(&unit.image)) {
            return Err(EngineError::ChainOutOfOrder {
                expected: self.submission_count,
                found: unit.id,
            });
        }
        self.submission_count += 1;
        log::debug!(
            "chain advanced to {} ({} submissions loaded)",
            unit.entry,
            self.code.len()
        );
        self.head = Some(unit);
        Ok(())
    }
}
