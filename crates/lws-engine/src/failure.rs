//! Per-request failure records.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ItemNotFound,
    ItemExists,
    ItemCloaked,
    ItemNotMapped,
    ItemNotCheckedOut,
    ChangeAlreadyPending,
    IncompatibleChange,
    PendingParentDelete,
    PendingDeleteConflict,
    PendingChildException,
    RepositoryPathTooLong,
    NotAllowedOnFolder,
    WildcardNotAllowed,
    CannotChangeRootFolder,
    RenameWorkingFolder,
    TargetCloaked,
    BaselineUnavailable,
    InvalidPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

/// Why one request (or one item of it) was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub severity: Severity,
    /// The offending path, server or local
    pub item: String,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, item: impl Into<String>) -> Self {
        let item = item.into();
        Self {
            message: describe(kind, &item),
            kind,
            severity: Severity::Error,
            item,
        }
    }

    pub fn warning(kind: FailureKind, item: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::new(kind, item)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn describe(kind: FailureKind, item: &str) -> String {
    match kind {
        FailureKind::ItemNotFound => format!("No matching items found in {}", item),
        FailureKind::ItemExists => format!("The item {} already exists", item),
        FailureKind::ItemCloaked => format!("The item {} is cloaked", item),
        FailureKind::ItemNotMapped => format!("There is no working folder mapping for {}", item),
        FailureKind::ItemNotCheckedOut => format!("No pending changes were found for {}", item),
        FailureKind::ChangeAlreadyPending => format!("{} already has a pending change", item),
        FailureKind::IncompatibleChange => {
            format!("The requested change is incompatible with the pending change on {}", item)
        }
        FailureKind::PendingParentDelete => format!("A parent of {} is pending delete", item),
        FailureKind::PendingDeleteConflict => {
            format!("{} has a pending change that conflicts with a delete", item)
        }
        FailureKind::PendingChildException => {
            format!("A child of {} has a pending rename", item)
        }
        FailureKind::RepositoryPathTooLong => format!("The server path {} is too long", item),
        FailureKind::NotAllowedOnFolder => format!("The change is not allowed on folder {}", item),
        FailureKind::WildcardNotAllowed => format!("Wildcards are not allowed in {}", item),
        FailureKind::CannotChangeRootFolder => format!("Cannot change the root folder {}", item),
        FailureKind::RenameWorkingFolder => {
            format!("{} is the root of a working folder mapping", item)
        }
        FailureKind::TargetCloaked => format!("The rename target {} is cloaked", item),
        FailureKind::BaselineUnavailable => {
            format!("No local version is available for {}; get it from the server", item)
        }
        FailureKind::InvalidPath => format!("{} is not a valid path", item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_item_and_message() {
        let f = Failure::new(FailureKind::ItemExists, "$/P/b");
        assert_eq!(f.item, "$/P/b");
        assert!(f.is_error());
        assert!(f.to_string().contains("$/P/b"));
    }

    #[test]
    fn test_warning_severity() {
        let f = Failure::warning(FailureKind::BaselineUnavailable, "$/P/a");
        assert_eq!(f.severity, Severity::Warning);
        assert!(!f.is_error());
    }
}
