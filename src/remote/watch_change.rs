use crate::error::FirestoreError;
use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// One message received on the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Only meaningful on a change addressed to all targets, where it marks a
    /// consistent snapshot of everything sent so far.
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered, changed in, or left the listed targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: Document,
}

/// A document was deleted on the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// A document no longer matches the listed targets; its contents are unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

/// The number of documents the backend holds for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

impl WatchChange {
    /// Snapshot version a listen response establishes, `min` unless it is a
    /// global target change.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) if change.target_ids.is_empty() => change.read_time,
            _ => SnapshotVersion::min(),
        }
    }
}
