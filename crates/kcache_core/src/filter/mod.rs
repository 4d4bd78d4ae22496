//! Declarative filters and their compiled conditions.
//!
//! A filter set is an OR of filter groups, each group an AND of conditions:
//!
//! ```text
//! [ Filter { key = "k1" },                      bit 0
//!   Filter { header "type" = "a", not key = "k2" } ]   bit 1
//! ```
//!
//! [`CursorFactory::as_condition`] compiles a filter set into a
//! [`Condition`] tree. Each group owns one bit of the match mask a cursor
//! reports for every entry it returns, so a single scan can serve up to 64
//! groups.

mod condition;
mod factory;

pub use condition::{is_sentinel, Condition, Equals, HeaderSequence, NotCondition, OffsetWalk};
pub use factory::{CursorFactory, MAX_FILTER_GROUPS};

use crate::entry::Header;
use serde::{Deserialize, Serialize};

/// One filter group: an entry matches when every condition matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Conditions, all of which must match.
    pub conditions: Vec<ConditionSpec>,
}

impl Filter {
    /// Creates a group from its conditions.
    #[must_use]
    pub fn new(conditions: Vec<ConditionSpec>) -> Self {
        Self { conditions }
    }

    /// Creates a group holding a single condition.
    #[must_use]
    pub fn of(condition: ConditionSpec) -> Self {
        Self {
            conditions: vec![condition],
        }
    }
}

/// A condition as supplied by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSpec {
    /// The key equals this value; `None` matches null keys.
    Key(Option<Vec<u8>>),
    /// Some header equals this name and value.
    Header(Header),
    /// The nested condition does not match.
    Not(Box<ConditionSpec>),
    /// The headers named `name`, in order, match `matches`.
    Headers {
        /// Header name.
        name: Vec<u8>,
        /// Expected values, in header order.
        matches: Vec<ValueMatch>,
    },
}

impl ConditionSpec {
    /// Matches entries whose key equals `key`.
    #[must_use]
    pub fn key(key: Option<&[u8]>) -> Self {
        Self::Key(key.map(<[u8]>::to_vec))
    }

    /// Matches entries carrying the header `name: value`.
    #[must_use]
    pub fn header(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Header(Header::new(name, value))
    }

    /// Negates `condition`.
    #[must_use]
    pub fn not(condition: Self) -> Self {
        Self::Not(Box::new(condition))
    }

    /// Matches the ordered values of the headers named `name`.
    #[must_use]
    pub fn headers(name: impl Into<Vec<u8>>, matches: Vec<ValueMatch>) -> Self {
        Self::Headers {
            name: name.into(),
            matches,
        }
    }
}

/// One element of a header sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatch {
    /// The next header has exactly this value.
    Value(Vec<u8>),
    /// Headers matched without comparing values.
    Skip(Skip),
}

impl ValueMatch {
    /// Matches one header with `value`.
    #[must_use]
    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Self::Value(value.into())
    }
}

/// Wildcard kinds in a header sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skip {
    /// Exactly one header, any value.
    One,
    /// Any number of headers, including none. Only valid as the last match.
    Many,
}
