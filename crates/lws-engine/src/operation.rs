//! Requests going into the engine and the operations coming out.

use std::path::PathBuf;

use lws_baseline::{ContentHash, Uuid};
use lws_pathtree::RecursionType;
use lws_tables::{ChangeType, ItemType, LockLevel, PropertyValue, RowId, ENCODING_UNCHANGED};

use crate::failure::Failure;

/// A server or absolute local path plus how far below it to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSpec {
    pub item: String,
    pub recursion: RecursionType,
    pub deletion_id: i32,
}

impl ItemSpec {
    pub fn new(item: impl Into<String>, recursion: RecursionType) -> Self {
        Self {
            item: item.into(),
            recursion,
            deletion_id: 0,
        }
    }

    pub fn local(path: impl Into<PathBuf>, recursion: RecursionType) -> Self {
        Self::new(path.into().to_string_lossy().into_owned(), recursion)
    }
}

/// One pend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    pub spec: ItemSpec,
    pub item_type: ItemType,
    /// `ENCODING_UNCHANGED` keeps the current encoding
    pub encoding: i32,
    /// Rename destination
    pub target_item: Option<String>,
    pub target_item_type: ItemType,
    pub properties: Vec<PropertyValue>,
    pub lock_level: LockLevel,
}

impl ChangeRequest {
    pub fn new(spec: ItemSpec) -> Self {
        Self {
            spec,
            item_type: ItemType::Any,
            encoding: ENCODING_UNCHANGED,
            target_item: None,
            target_item_type: ItemType::Any,
            properties: Vec::new(),
            lock_level: LockLevel::None,
        }
    }

    pub fn item(item: impl Into<String>, recursion: RecursionType) -> Self {
        Self::new(ItemSpec::new(item, recursion))
    }

    pub fn rename(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target_item: Some(target.into()),
            ..Self::item(source, RecursionType::None)
        }
    }

    pub fn with_item_type(mut self, item_type: ItemType) -> Self {
        self.item_type = item_type;
        self
    }

    pub fn with_encoding(mut self, encoding: i32) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_properties(mut self, properties: Vec<PropertyValue>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_target_item_type(mut self, item_type: ItemType) -> Self {
        self.target_item_type = item_type;
        self
    }
}

/// What the caller must do on disk for one item.
///
/// A `None` target local item means the item leaves the disk; a `None`
/// source local item means it is not there yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetOperation {
    pub source_server_item: String,
    pub target_server_item: String,
    pub source_local_item: Option<PathBuf>,
    pub target_local_item: Option<PathBuf>,
    pub change_type: ChangeType,
    pub item_type: ItemType,
    pub item_id: i32,
    pub version_local: i32,
    pub version_server: i32,
    pub encoding: i32,
    pub hash: Option<ContentHash>,
    pub length: i64,
    pub baseline_file_guid: Option<Uuid>,
    pub pending_change_id: Option<RowId>,
    pub deletion_id: i32,
    pub properties: Vec<PropertyValue>,
}

impl GetOperation {
    pub fn is_delete(&self) -> bool {
        self.target_local_item.is_none()
    }
}

/// Operations to carry out plus the requests that were refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendResult {
    pub operations: Vec<GetOperation>,
    pub failures: Vec<Failure>,
}

impl PendResult {
    pub fn has_errors(&self) -> bool {
        self.failures.iter().any(Failure::is_error)
    }
}

/// Result of a batch pend or undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendOutcome {
    /// The tables were updated (possibly with some requests refused)
    Applied(PendResult),
    /// Every request failed; nothing changed
    Rejected(Vec<Failure>),
    /// The batch cannot be done offline; nothing changed
    RequiresServer,
}

impl PendOutcome {
    /// Classify a finished batch.
    pub(crate) fn from_result(result: PendResult, changed: bool) -> Self {
        if !changed && result.operations.is_empty() && result.has_errors() {
            PendOutcome::Rejected(result.failures)
        } else {
            PendOutcome::Applied(result)
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, PendOutcome::Applied(_))
    }

    pub fn operations(&self) -> &[GetOperation] {
        match self {
            PendOutcome::Applied(r) => &r.operations,
            _ => &[],
        }
    }

    pub fn failures(&self) -> &[Failure] {
        match self {
            PendOutcome::Applied(r) => &r.failures,
            PendOutcome::Rejected(f) => f,
            PendOutcome::RequiresServer => &[],
        }
    }
}
