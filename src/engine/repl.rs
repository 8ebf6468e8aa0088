use std::sync::Arc;

use serde::Serialize;
use ts_rs::TS;

use crate::engine::chain::{CompilationChain, CompilationUnit, CompileRejection};
use crate::engine::classify::classify;
use crate::engine::format::format_diagnostic;
use crate::engine::host::{Completion, ExecutionHost, ExecutionResult};
use crate::engine::references::{ReferenceSupplier, StandardReferences};
use crate::engine::state::SubmissionState;
use crate::error::EngineError;
use crate::script::diagnostic::{Diagnostic, Severity};
use crate::settings::EngineSettings;
use crate::transcript::{EntryKind, TranscriptEntry, TranscriptSink};

/// What one `submit` call produced. The same entries were appended to the
/// sink as a single batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct SubmissionReport {
    /// Id the text was compiled as. Rejected text does not consume its id.
    pub submission: u32,
    /// True when the text compiled and the chain advanced.
    pub accepted: bool,
    pub entries: Vec<TranscriptEntry>,
}

impl SubmissionReport {
    pub fn completion(&self) -> Option<&TranscriptEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| matches!(e.kind, EntryKind::Value | EntryKind::Fault))
    }

    pub fn value(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Value)
            .map(|e| e.text.as_str())
    }

    pub fn output(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Output)
            .map(|e| e.text.as_str())
    }

    pub fn errors(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Error)
    }

    pub fn fault(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Fault)
            .map(|e| e.text.as_str())
    }
}

/// Interactive session: compiles each submission on top of everything
/// accepted before it, runs it, and reports to the sink.
pub struct ReplEngine<S: TranscriptSink> {
    chain: CompilationChain,
    /// `None` only while a submission is executing, or after a fatal error.
    state: Option<SubmissionState>,
    host: ExecutionHost,
    settings: EngineSettings,
    sink: S,
    poisoned: Option<String>,
}

impl<S: TranscriptSink> ReplEngine<S> {
    pub fn new(settings: EngineSettings, references: &dyn ReferenceSupplier, sink: S) -> Self {
        let chain = CompilationChain::new(references.supply(), settings.compile_options());
        log::debug!(
            "session started (language {}, {} usings, state capacity {})",
            settings.language_version.label(),
            chain.references().usings().len(),
            settings.initial_state_capacity
        );
        Self {
            chain,
            state: Some(SubmissionState::with_capacity(settings.initial_state_capacity)),
            host: ExecutionHost::new(settings.limits()),
            settings,
            sink,
            poisoned: None,
        }
    }

    /// Session over the standard library, importing `settings.usings`.
    pub fn with_standard_references(settings: EngineSettings, sink: S) -> Self {
        let references = StandardReferences::new(settings.usings.iter().cloned());
        Self::new(settings, &references, sink)
    }

    pub fn chain(&self) -> &CompilationChain {
        &self.chain
    }

    /// Read-only view of the state store.
    pub fn state(&self) -> Option<&SubmissionState> {
        self.state.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Compile and run one submission. Returns once the sink has the batch.
    ///
    /// Compile errors and runtime faults are reported, not returned. An `Err`
    /// means the engine itself failed; fatal errors poison the session and
    /// every later call reports and returns [`EngineError::SessionPoisoned`].
    pub async fn submit(&mut self, text: &str) -> Result<SubmissionReport, EngineError> {
        let submission = self.chain.submission_count();
        if let Some(reason) = &self.poisoned {
            let e = EngineError::SessionPoisoned {
                reason: reason.clone(),
            };
            self.sink.append(&[
                TranscriptEntry::new(submission, EntryKind::Echo, text),
                TranscriptEntry::new(submission, EntryKind::Error, e.to_string()),
            ]);
            return Err(e);
        }

        let mut entries = vec![TranscriptEntry::new(submission, EntryKind::Echo, text)];
        let result = self.cycle(submission, text, &mut entries).await;

        match result {
            Ok(accepted) => {
                self.sink.append(&entries);
                Ok(SubmissionReport {
                    submission,
                    accepted,
                    entries,
                })
            }
            Err(e) => {
                if e.is_fatal() {
                    log::error!("Submission#{submission} poisoned the session: {e}");
                    self.poisoned = Some(e.to_string());
                }
                entries.push(TranscriptEntry::new(submission, EntryKind::Error, e.to_string()));
                self.sink.append(&entries);
                Err(e)
            }
        }
    }

    /// Compiling → Executing → Reported. Returns whether the chain advanced.
    async fn cycle(
        &mut self,
        submission: u32,
        text: &str,
        entries: &mut Vec<TranscriptEntry>,
    ) -> Result<bool, EngineError> {
        let job = self.chain.job(text);
        let compiled = job.spawn().await?;

        let unit = match compiled {
            Ok(unit) => unit,
            Err(CompileRejection::Diagnostics(diagnostics)) if !classify(&diagnostics).is_empty() => {
                self.report_diagnostics(submission, text, &diagnostics, entries);
                return Ok(false);
            }
            Err(CompileRejection::Diagnostics(diagnostics)) => {
                // Rejected without a blocking diagnostic
                self.report_diagnostics(submission, text, &diagnostics, entries);
                entries.push(TranscriptEntry::new(
                    submission,
                    EntryKind::Fault,
                    "Compilation failed without reporting an error",
                ));
                return Ok(false);
            }
            Err(CompileRejection::Divergence(diagnostic)) => {
                entries.push(TranscriptEntry::new(
                    submission,
                    EntryKind::Fault,
                    format!(
                        "Compilation produced no code: {}",
                        format_diagnostic(&diagnostic, text)
                    ),
                ));
                return Ok(false);
            }
        };

        self.report_diagnostics(submission, text, unit.diagnostics(), entries);
        self.chain.commit(Arc::clone(&unit))?;
        let result = self.execute(&unit).await?;

        if let Some(output) = result.output {
            entries.push(TranscriptEntry::new(submission, EntryKind::Output, output));
        }
        match result.completion {
            Completion::Value(text) => {
                entries.push(TranscriptEntry::new(submission, EntryKind::Value, text));
            }
            Completion::Fault(text) => {
                log::debug!("Submission#{submission} faulted");
                entries.push(TranscriptEntry::new(submission, EntryKind::Fault, text));
            }
            Completion::NoValue => {}
        }
        Ok(true)
    }

    async fn execute(&mut self, unit: &CompilationUnit) -> Result<ExecutionResult, EngineError> {
        let state = self.state.take().ok_or(EngineError::StateSlotMissing {
            submission: unit.id(),
        })?;
        let (state, result) = self.host.execute(unit, self.chain.code_space(), state).await?;
        self.state = Some(state);
        Ok(result)
    }

    fn report_diagnostics(
        &self,
        submission: u32,
        source: &str,
        diagnostics: &[Diagnostic],
        entries: &mut Vec<TranscriptEntry>,
    ) {
        for d in diagnostics {
            let kind = match d.severity {
                Severity::Error => EntryKind::Error,
                Severity::Warning if self.settings.show_warnings => EntryKind::Warning,
                Severity::Info if self.settings.show_info => EntryKind::Info,
                Severity::Warning | Severity::Info => continue,
            };
            entries.push(TranscriptEntry::new(submission, kind, format_diagnostic(d, source)));
        }
    }
}
