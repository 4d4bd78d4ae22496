//! Validation hooks for keys and values on the write path.
//!
//! A rejected entry is still written, flagged ABORTED so readers skip it.

/// Checks an encoded key or value before it is accepted.
pub trait ValueValidator: Send + Sync {
    /// Returns `true` if `value` is acceptable.
    fn validate(&self, value: &[u8]) -> bool;
}

impl<F> ValueValidator for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn validate(&self, value: &[u8]) -> bool {
        self(value)
    }
}

/// Accepts only well-formed JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonValidator;

impl ValueValidator for JsonValidator {
    fn validate(&self, value: &[u8]) -> bool {
        serde_json::from_slice::<serde::de::IgnoredAny>(value).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_validator() {
        assert!(JsonValidator.validate(br#"{"a":[1,2]}"#));
        assert!(JsonValidator.validate(b"42"));
        assert!(!JsonValidator.validate(b"{\"a\":"));
        assert!(!JsonValidator.validate(b""));
    }

    #[test]
    fn closures_are_validators() {
        let short = |value: &[u8]| value.len() < 4;
        let validator: &dyn ValueValidator = &short;
        assert!(validator.validate(b"abc"));
        assert!(!validator.validate(b"abcd"));
    }
}
