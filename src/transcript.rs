use serde::Serialize;
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum EntryKind {
    /// The submitted text, as typed.
    Echo,
    Error,
    Warning,
    Info,
    /// Text the submission wrote to the output channel.
    Output,
    Value,
    Fault,
}

/// One line of the session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct TranscriptEntry {
    pub submission: u32,
    pub kind: EntryKind,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(submission: u32, kind: EntryKind, text: impl Into<String>) -> Self {
        Self {
            submission,
            kind,
            text: text.into(),
        }
    }
}

/// Receives one ordered batch per submission: the echo, then its outcome.
pub trait TranscriptSink {
    fn append(&mut self, batch: &[TranscriptEntry]);
}

/// In-memory sink that keeps every batch.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    batches: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Entries of a single submission, in order.
    pub fn for_submission(&self, submission: u32) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter().filter(move |e| e.submission == submission)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }
}

impl TranscriptSink for Transcript {
    fn append(&mut self, batch: &[TranscriptEntry]) {
        self.entries.extend_from_slice(batch);
        self.batches += 1;
    }
}

impl<S: TranscriptSink + ?Sized> TranscriptSink for Box<S> {
    fn append(&mut self, batch: &[TranscriptEntry]) {
        (**self).append(batch);
    }
}
