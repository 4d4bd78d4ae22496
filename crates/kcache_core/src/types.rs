//! Core types shared across the cache.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset used before a partition has received any entry.
pub const OFFSET_HISTORICAL: i64 = -2;

/// Offset meaning "the next entry written".
pub const OFFSET_LIVE: i64 = -1;

/// Flags stored in every cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EntryFlags(pub i32);

impl EntryFlags {
    /// No flags set.
    pub const NONE: Self = Self(0x00);
    /// Superseded by a newer entry with the same key; removed by compaction.
    pub const DIRTY: Self = Self(0x01);
    /// Produce-path entry whose payload has been fully written.
    pub const COMPLETED: Self = Self(0x02);
    /// Entry belongs to an aborted producer or failed validation.
    pub const ABORTED: Self = Self(0x04);
    /// Transaction control record.
    pub const CONTROL: Self = Self(0x08);

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if the entry is dirty.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        self.contains(Self::DIRTY)
    }

    /// Returns `true` if the entry is aborted.
    #[must_use]
    pub const fn is_aborted(self) -> bool {
        self.contains(Self::ABORTED)
    }

    /// Returns `true` if the entry is a control record.
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.contains(Self::CONTROL)
    }
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::DIRTY, "DIRTY"),
            (Self::COMPLETED, "COMPLETED"),
            (Self::ABORTED, "ABORTED"),
            (Self::CONTROL, "CONTROL"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// How a value is stored relative to its ancestor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// Values are stored and read in full.
    #[default]
    None,
    /// A JSON patch against the ancestor value is stored alongside the value.
    JsonPatch,
}

/// Producer acknowledgement mode, stored as an `i16`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// No acknowledgement.
    #[default]
    None,
    /// Leader acknowledgement.
    LeaderOnly,
    /// All in-sync replicas acknowledge.
    InSyncReplicas,
}

impl AckMode {
    /// Returns the stored representation.
    #[must_use]
    pub const fn value(self) -> i16 {
        match self {
            Self::None => 0,
            Self::LeaderOnly => 1,
            Self::InSyncReplicas => -1,
        }
    }

    /// Decodes the stored representation, if known.
    #[must_use]
    pub const fn from_value(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::LeaderOnly),
            -1 => Some(Self::InSyncReplicas),
            _ => None,
        }
    }
}

/// How an `Or` of filter groups evaluates its children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluation {
    /// Stop at the first matching group.
    #[default]
    Lazy,
    /// Test every group and report all matches.
    Eager,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = EntryFlags::DIRTY.union(EntryFlags::ABORTED);
        assert!(flags.is_dirty());
        assert!(flags.is_aborted());
        assert!(!flags.is_control());
        assert_eq!(flags.to_string(), "DIRTY|ABORTED");
        assert_eq!(EntryFlags::NONE.to_string(), "NONE");
    }

    #[test]
    fn ack_mode_roundtrip() {
        for mode in [AckMode::None, AckMode::LeaderOnly, AckMode::InSyncReplicas] {
            assert_eq!(AckMode::from_value(mode.value()), Some(mode));
        }
        assert_eq!(AckMode::from_value(7), None);
    }

    #[test]
    fn delta_type_serde() {
        let json = serde_json::to_string(&DeltaType::JsonPatch).unwrap();
        assert_eq!(json, "\"json_patch\"");
    }
}
