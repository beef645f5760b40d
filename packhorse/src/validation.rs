//! Character-class validation for metric names, tag names, and tag values.

use std::sync::Arc;

/// A configurable transform applied to a name or value before validation.
pub type StringTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Checks whether `name` is a valid metric name.
///
/// Valid names are non-empty and composed only of characters in
/// `[A-Za-z0-9._/-]`.
pub fn is_valid_metric_name(name: &str) -> bool {
    is_valid_identifier(name)
}

/// Checks whether `name` is a valid tag name.
///
/// Tag names share the metric-name character class: non-empty,
/// `[A-Za-z0-9._/-]` only.
pub fn is_valid_tag_name(name: &str) -> bool {
    is_valid_identifier(name)
}

/// Checks whether `value` is a valid tag value.
///
/// Tag values share the metric-name character class: non-empty,
/// `[A-Za-z0-9._/-]` only.
pub fn is_valid_tag_value(value: &str) -> bool {
    is_valid_identifier(value)
}

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(valid_identifier_character)
}

#[inline]
fn valid_identifier_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')
}

/// Applies an optional transform to `input`, returning the transformed string
/// or a borrowed copy of the original.
pub(crate) fn apply_transform(input: &str, transform: Option<&StringTransform>) -> String {
    match transform {
        Some(f) => f(input),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{is_valid_metric_name, is_valid_tag_name, is_valid_tag_value};

    #[test]
    fn known_cases() {
        let valid = &["foo", "foo.bar", "foo_bar", "a-b/c", "route/2xx", "A.B-1_2/3"];
        for name in valid {
            assert!(is_valid_metric_name(name), "expected {name:?} to be valid");
            assert!(is_valid_tag_name(name), "expected {name:?} to be valid");
            assert!(is_valid_tag_value(name), "expected {name:?} to be valid");
        }

        let invalid = &["", "foo bar", "foo:bar", "héllo", "semi;colon", "new\nline", "q=1"];
        for name in invalid {
            assert!(!is_valid_metric_name(name), "expected {name:?} to be invalid");
            assert!(!is_valid_tag_name(name), "expected {name:?} to be invalid");
            assert!(!is_valid_tag_value(name), "expected {name:?} to be invalid");
        }
    }

    proptest! {
        #[test]
        fn matches_character_class(input in ".*") {
            let expected = !input.is_empty()
                && input.chars().all(|c| c.is_ascii_alphanumeric() || "._/-".contains(c));
            prop_assert_eq!(is_valid_metric_name(&input), expected);
        }
    }
}
