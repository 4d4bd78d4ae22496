//! Compiles filter sets and creates cursors.

use super::{Condition, ConditionSpec, Filter, Skip, ValueMatch};
use crate::cursor::Cursor;
use crate::error::{CacheError, CacheResult};
use crate::types::{DeltaType, Evaluation};

/// Most filter groups one condition can report in its match mask.
pub const MAX_FILTER_GROUPS: usize = 64;

/// Builds conditions and the cursors that run them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorFactory;

impl CursorFactory {
    /// Creates a factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Compiles a filter set into a condition.
    ///
    /// An empty set matches every entry. A single group compiles to its own
    /// condition, several groups to an `Or` evaluated per `evaluation`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidFilter`] if the set holds more than
    /// [`MAX_FILTER_GROUPS`] groups, a group has no conditions, or a
    /// [`Skip::Many`] is not the last match of its header sequence.
    pub fn as_condition(&self, filters: &[Filter], evaluation: Evaluation) -> CacheResult<Condition> {
        if filters.len() > MAX_FILTER_GROUPS {
            return Err(CacheError::invalid_filter(format!(
                "{} filter groups, at most {MAX_FILTER_GROUPS} supported",
                filters.len()
            )));
        }
        let mut groups = filters
            .iter()
            .map(|filter| self.group_condition(filter))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(match groups.len() {
            0 => Condition::none(),
            1 => groups.swap_remove(0),
            _ => Condition::or(groups, evaluation),
        })
    }

    /// Creates a cursor running `condition`. With a `delta_type` other than
    /// [`DeltaType::None`] the cursor returns patches against ancestors it
    /// has already returned.
    #[must_use]
    pub fn new_cursor(&self, condition: Condition, delta_type: DeltaType) -> Cursor {
        Cursor::new(condition, delta_type)
    }

    fn group_condition(&self, filter: &Filter) -> CacheResult<Condition> {
        let mut conditions = filter
            .conditions
            .iter()
            .map(|condition| self.condition(condition))
            .collect::<CacheResult<Vec<_>>>()?;
        match conditions.len() {
            0 => Err(CacheError::invalid_filter("filter group has no conditions")),
            1 => Ok(conditions.swap_remove(0)),
            _ => Ok(Condition::and(conditions)),
        }
    }

    fn condition(&self, spec: &ConditionSpec) -> CacheResult<Condition> {
        match spec {
            ConditionSpec::Key(key) => Ok(Condition::key(key.as_deref())),
            ConditionSpec::Header(header) => {
                Ok(Condition::header(&header.name, header.value.as_deref()))
            }
            ConditionSpec::Not(nested) => match nested.as_ref() {
                ConditionSpec::Not(inner) => self.condition(inner),
                nested => Ok(Condition::not(self.condition(nested)?)),
            },
            ConditionSpec::Headers { name, matches } => {
                let misplaced = matches
                    .iter()
                    .rev()
                    .skip(1)
                    .any(|m| *m == ValueMatch::Skip(Skip::Many));
                if misplaced {
                    return Err(CacheError::invalid_filter(
                        "skip many must be the last match of a header sequence",
                    ));
                }
                Ok(Condition::header_sequence(name, matches))
            }
        }
    }
}
