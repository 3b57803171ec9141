//! Change type bits and the small value types shared by both tables.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Encoding of a folder.
pub const ENCODING_FOLDER: i32 = -3;
/// Request value meaning "keep the current encoding".
pub const ENCODING_UNCHANGED: i32 = -2;
pub const ENCODING_BINARY: i32 = -1;

bitflags! {
    /// Union of the changes pending on one item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeType: u32 {
        const ADD = 1 << 0;
        const EDIT = 1 << 1;
        const ENCODING = 1 << 2;
        const RENAME = 1 << 3;
        const DELETE = 1 << 4;
        const UNDELETE = 1 << 5;
        const BRANCH = 1 << 6;
        const MERGE = 1 << 7;
        const LOCK = 1 << 8;
        const ROLLBACK = 1 << 9;
        const SOURCE_RENAME = 1 << 10;
        const TARGET_RENAME = 1 << 11;
        const PROPERTY = 1 << 12;

        /// Changes that implicitly apply to every descendant
        const RENAME_OR_DELETE = Self::RENAME.bits() | Self::DELETE.bits();
    }
}

impl ChangeType {
    pub const NONE: ChangeType = ChangeType::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ItemType {
    #[default]
    Any,
    File,
    Folder,
}

impl ItemType {
    pub fn to_byte(self) -> u8 {
        match self {
            ItemType::Any => 0,
            ItemType::Folder => 1,
            ItemType::File => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ItemType::Any),
            1 => Some(ItemType::Folder),
            2 => Some(ItemType::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockLevel {
    #[default]
    None,
    Checkin,
    CheckOut,
    Unchanged,
}

impl LockLevel {
    pub fn to_byte(self) -> u8 {
        match self {
            LockLevel::None => 0,
            LockLevel::Checkin => 1,
            LockLevel::CheckOut => 2,
            LockLevel::Unchanged => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(LockLevel::None),
            1 => Some(LockLevel::Checkin),
            2 => Some(LockLevel::CheckOut),
            3 => Some(LockLevel::Unchanged),
            _ => None,
        }
    }
}

/// One item property. A `None` value records a pending removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyValue {
    pub name: String,
    pub value: Option<String>,
}

impl PropertyValue {
    pub fn new(name: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            value: value.map(str::to_string),
        }
    }
}

/// Merge `incoming` over `existing`: last write wins per case-insensitive key.
pub fn merge_properties(existing: &[PropertyValue], incoming: &[PropertyValue]) -> Vec<PropertyValue> {
    let mut merged: Vec<PropertyValue> = existing.to_vec();
    for prop in incoming {
        match merged
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&prop.name))
        {
            Some(slot) => *slot = prop.clone(),
            None => merged.push(prop.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_bits() {
        assert!(ChangeType::RENAME_OR_DELETE.contains(ChangeType::DELETE));
        assert!(ChangeType::RENAME_OR_DELETE.contains(ChangeType::RENAME));
        assert!(!ChangeType::RENAME_OR_DELETE.contains(ChangeType::EDIT));
    }

    #[test]
    fn test_bits_are_stable() {
        assert_eq!(ChangeType::ADD.bits(), 1);
        assert_eq!(ChangeType::PROPERTY.bits(), 1 << 12);
    }

    #[test]
    fn test_merge_properties_last_write_wins() {
        let existing = vec![PropertyValue::new("Executable", Some("true"))];
        let incoming = vec![
            PropertyValue::new("executable", None),
            PropertyValue::new("symlink", Some("true")),
        ];
        let merged = merge_properties(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], PropertyValue::new("executable", None));
    }

    #[test]
    fn test_item_type_bytes() {
        for t in [ItemType::Any, ItemType::File, ItemType::Folder] {
            assert_eq!(ItemType::from_byte(t.to_byte()), Some(t));
        }
        assert_eq!(ItemType::from_byte(9), None);
    }
}
