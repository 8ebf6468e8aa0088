use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use ts_rs::TS;

use crate::engine::chain::{CodeSpace, CompilationUnit, EntryPoint};
use crate::engine::console::OutputRedirect;
use crate::engine::format::{format_fault, format_value};
use crate::engine::state::SubmissionState;
use crate::error::EngineError;
use crate::script::compiler::CompiledSubmission;
use crate::script::value::Value;
use crate::script::vm::{self, ExecutionLimits, Fault, Trap};

/// What a submission's entry routine produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    Value(Value),
    NoValue,
    Fault(Fault),
}

/// A callable entry routine. `invoke` assigns the submission's own state
/// slot and runs its top-level code against the store.
pub trait Submission: Send + Sync {
    fn entry_point(&self) -> &EntryPoint;

    fn invoke(
        &self,
        state: &mut SubmissionState,
        code: &CodeSpace,
        limits: &ExecutionLimits,
    ) -> Result<Outcome, EngineError>;
}

/// A compiled image loaded in the code space.
struct LoadedSubmission {
    id: u32,
    entry: EntryPoint,
    image: Arc<CompiledSubmission>,
}

impl Submission for LoadedSubmission {
    fn entry_point(&self) -> &EntryPoint {
        &self.entry
    }

    fn invoke(
        &self,
        state: &mut SubmissionState,
        code: &CodeSpace,
        limits: &ExecutionLimits,
    ) -> Result<Outcome, EngineError> {
        state.install(self.id, &self.image.globals)?;
        match vm::run(Arc::clone(&self.image), code, state, limits) {
            Ok(value) if value.is_null() => Ok(Outcome::NoValue),
            Ok(value) => Ok(Outcome::Value(value)),
            Err(Trap::Thrown(fault)) => Ok(Outcome::Fault(fault)),
            Err(Trap::Internal(message)) => Err(EngineError::HostFailure {
                message: format!("{}: {message}", self.entry),
            }),
        }
    }
}

/// Formatted result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
#[ts(export)]
pub enum Completion {
    Value(String),
    NoValue,
    Fault(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct ExecutionResult {
    /// Text written to the output channel during the call, if any.
    pub output: Option<String>,
    pub completion: Completion,
}

impl ExecutionResult {
    fn new(output: String, outcome: Outcome) -> Self {
        let completion = match outcome {
            Outcome::Value(value) => format_value(&value).map_or(Completion::NoValue, Completion::Value),
            Outcome::NoValue => Completion::NoValue,
            Outcome::Fault(fault) => Completion::Fault(format_fault(&fault)),
        };
        Self {
            output: (!output.is_empty()).then_some(output),
            completion,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "submission panicked".to_string())
}

/// Runs compiled units on the blocking pool with the output channel captured.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHost {
    limits: ExecutionLimits,
}

impl ExecutionHost {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Find the unit's entry routine in the code space.
    pub fn resolve(&self, unit: &CompilationUnit, code: &CodeSpace) -> Result<Arc<dyn Submission>, EngineError> {
        let image = code
            .resolve(unit)
            .ok_or(EngineError::EntryPointMissing { submission: unit.id() })?;
        Ok(Arc::new(LoadedSubmission {
            id: unit.id(),
            entry: unit.entry_point().clone(),
            image,
        }))
    }

    /// Execute a committed unit. The state store is moved to the blocking pool
    /// and handed back with the result.
    pub async fn execute(
        &self,
        unit: &CompilationUnit,
        code: &CodeSpace,
        state: SubmissionState,
    ) -> Result<(SubmissionState, ExecutionResult), EngineError> {
        let submission = self.resolve(unit, code)?;
        self.execute_submission(unit.id(), submission, code.clone(), state).await
    }

    pub async fn execute_submission(
        &self,
        id: u32,
        submission: Arc<dyn Submission>,
        code: CodeSpace,
        mut state: SubmissionState,
    ) -> Result<(SubmissionState, ExecutionResult), EngineError> {
        state.ensure_capacity(id);
        let limits = self.limits;
        log::debug!("executing {}", submission.entry_point());

        tokio::task::spawn_blocking(move || -> Result<(SubmissionState, ExecutionResult), EngineError> {
            let redirect = OutputRedirect::begin();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                submission.invoke(&mut state, &code, &limits)
            }));
            let output = redirect.finish();
            let outcome = outcome.map_err(|payload| EngineError::HostFailure {
                message: panic_message(payload.as_ref()),
            })??;
            Ok((state, ExecutionResult::new(output, outcome)))
        })
        .await?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::chain::CompilationChain;
    use crate::engine::console;
    use crate::engine::references::{ReferenceSupplier, StandardReferences};
    use crate::script::CompileOptions;

    fn chain() -> CompilationChain {
        CompilationChain::new(StandardReferences::default().supply(), CompileOptions::default())
    }

    async fn run(
        chain: &mut CompilationChain,
        state: SubmissionState,
        src: &str,
    ) -> (SubmissionState, ExecutionResult) {
        let unit = chain.compile(src).unwrap();
        chain.commit(Arc::clone(&unit)).unwrap();
        ExecutionHost::default()
            .execute(&unit, chain.code_space(), state)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn values_and_no_values() {
        let mut chain = chain();
        let state = SubmissionState::with_capacity(2);
        let (state, result) = run(&mut chain, state, "1 + 1").await;
        assert_eq!(result.completion, Completion::Value("2".into()));
        assert_eq!(result.output, None);
        let (state, result) = run(&mut chain, state, "var x = 10;").await;
        assert_eq!(result.completion, Completion::NoValue);
        let (_, result) = run(&mut chain, state, "string s = null; s").await;
        assert_eq!(result.completion, Completion::NoValue);
    }

    #[tokio::test]
    async fn output_is_captured_with_the_value() {
        let mut chain = chain();
        let state = SubmissionState::with_capacity(2);
        let (_, result) = run(&mut chain, state, r#"Console.WriteLine("hi"); 3"#).await;
        assert_eq!(result.output.as_deref(), Some("hi\n"));
        assert_eq!(result.completion, Completion::Value("3".into()));
        assert!(!console::is_redirected());
    }

    #[tokio::test]
    async fn faults_are_formatted() {
        let mut chain = chain();
        let state = SubmissionState::with_capacity(2);
        let (state, result) = run(&mut chain, state, r#"throw new Exception("boom");"#).await;
        let Completion::Fault(text) = result.completion else {
            panic!("expected fault");
        };
        assert!(text.starts_with("System.Exception: boom"));
        assert!(text.contains("at Submission#0.<Main> (line 1)"));
        assert!(state.slot(0).is_some());
    }

    #[tokio::test]
    async fn unloaded_units_have_no_entry_point() {
        let chain = chain();
        let unit = chain.compile("1").unwrap();
        let err = ExecutionHost::default()
            .execute(&unit, chain.code_space(), SubmissionState::with_capacity(2))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::EntryPointMissing { submission: 0 });
    }

    struct Panicking(EntryPoint);

    impl Submission for Panicking {
        fn entry_point(&self) -> &EntryPoint {
            &self.0
        }

        fn invoke(
            &self,
            _state: &mut SubmissionState,
            _code: &CodeSpace,
            _limits: &ExecutionLimits,
        ) -> Result<Outcome, EngineError> {
            console::write("partial");
            panic!("entry routine exploded");
        }
    }

    #[tokio::test]
    async fn panics_become_host_failures_and_restore_output() {
        let host = ExecutionHost::default();
        let err = host
            .execute_submission(
                0,
                Arc::new(Panicking(EntryPoint::for_submission(0))),
                CodeSpace::default(),
                SubmissionState::with_capacity(2),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::HostFailure {
                message: "entry routine exploded".into()
            }
        );
        assert!(!console::is_redirected());
    }

    #[tokio::test]
    async fn capacity_is_ensured_before_running() {
        let host = ExecutionHost::default();
        let mut chain = chain();
        let mut state = SubmissionState::with_capacity(1);
        for _ in 0..5 {
            let unit = chain.compile("var n = 1;").unwrap();
            chain.commit(Arc::clone(&unit)).unwrap();
            state = host.execute(&unit, chain.code_space(), state).await.unwrap().0;
        }
        assert!(state.capacity() >= 5);
        assert_eq!(state.occupied(), 5);
    }
}
