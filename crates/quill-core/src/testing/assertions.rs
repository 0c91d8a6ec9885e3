//! Assertion macros and helpers for job tests.

/// Assert that a result is Ok.
///
/// ```ignore
/// assert_ok!(registry.register(job));
/// ```
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: {}: expected Ok, got Err({:?})", format_args!($($arg)+), e),
        }
    };
}

/// Assert that a result is Err with the given variant.
///
/// ```ignore
/// assert_err_variant!(registry.register(dup), QuillError::DuplicateFunctionId(_));
/// ```
#[macro_export]
macro_rules! assert_err_variant {
    ($expr:expr, $variant:pat) => {
        match &$expr {
            Err($variant) => (),
            Err(e) => panic!(
                "assertion failed: expected {}, got {:?}",
                stringify!($variant),
                e
            ),
            Ok(v) => panic!(
                "assertion failed: expected Err({}), got Ok({:?})",
                stringify!($variant),
                v
            ),
        }
    };
}

/// Partial JSON match: every field in `pattern` must equal the field in `actual`.
///
/// Arrays must have equal length and match element-wise.
pub fn json_matches(actual: &serde_json::Value, pattern: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (actual, pattern) {
        (Value::Object(a), Value::Object(p)) => p
            .iter()
            .all(|(key, expected)| a.get(key).is_some_and(|v| json_matches(v, expected))),
        (Value::Array(a), Value::Array(p)) => {
            a.len() == p.len() && a.iter().zip(p).all(|(a, p)| json_matches(a, p))
        }
        (a, p) => a == p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuillError;
    use serde_json::json;

    #[test]
    fn test_assert_ok_macro() {
        let result: Result<i32, String> = Ok(42);
        assert_ok!(result);
    }

    #[test]
    #[should_panic(expected = "expected Ok")]
    fn test_assert_ok_macro_fails() {
        let result: Result<i32, String> = Err("error".to_string());
        assert_ok!(result);
    }

    #[test]
    fn test_assert_err_variant() {
        let result: Result<(), QuillError> = Err(QuillError::NotFound("run".into()));
        assert_err_variant!(result, QuillError::NotFound(_));
    }

    #[test]
    #[should_panic(expected = "expected QuillError::Cancelled")]
    fn test_assert_err_variant_wrong_variant() {
        let result: Result<(), QuillError> = Err(QuillError::Fatal("x".into()));
        assert_err_variant!(result, QuillError::Cancelled);
    }

    #[test]
    fn test_json_matches() {
        let actual = json!({"status": "accepted", "runs": ["a", "b"], "extra": 1});
        assert!(json_matches(&actual, &json!({"status": "accepted"})));
        assert!(json_matches(&actual, &json!({"runs": ["a", "b"]})));
        assert!(!json_matches(&actual, &json!({"runs": ["a"]})));
        assert!(!json_matches(&actual, &json!({"missing": true})));
    }
}
