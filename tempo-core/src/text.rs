//! Text Rendering Fallback
//!
//! Opcodes that write text nodes receive arbitrary values. Primitives have an
//! obvious text form; everything else goes through a policy:
//!
//! - [`RenderPolicy::Graceful`] converts the value best-effort and only fails
//!   if that conversion fails too.
//! - [`RenderPolicy::Strict`] refuses non-primitive values. Debug builds
//!   report the refusal as an error; release builds skip the value.

use serde_json::Value;
use thiserror::Error;

/// How [`render`] treats values without an obvious text form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderPolicy {
    #[default]
    Graceful,
    Strict,
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// Strict policy met a value it will not stringify.
    #[error("cannot render {kind} value as text")]
    Unrenderable { kind: &'static str },

    /// Best-effort conversion failed.
    #[error("text conversion failed: {0}")]
    Conversion(#[from] serde_json::Error),
}

/// Render `value` as text.
///
/// Returns `Ok(None)` when the value is skipped.
pub fn render(value: &Value, policy: RenderPolicy) -> Result<Option<String>, RenderError> {
    let text = match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(_) | Value::Object(_) => return render_composite(value, policy),
    };
    Ok(Some(text))
}

fn render_composite(value: &Value, policy: RenderPolicy) -> Result<Option<String>, RenderError> {
    match policy {
        RenderPolicy::Graceful => Ok(Some(serde_json::to_string(value)?)),
        RenderPolicy::Strict => {
            let kind = kind_of(value);
            if cfg!(debug_assertions) {
                return Err(RenderError::Unrenderable { kind });
            }
            tracing::debug!(kind, "skipping unrenderable value");
            Ok(None)
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_render_under_both_policies() {
        for policy in [RenderPolicy::Graceful, RenderPolicy::Strict] {
            assert_eq!(render(&json!(null), policy).unwrap().as_deref(), Some(""));
            assert_eq!(render(&json!(true), policy).unwrap().as_deref(), Some("true"));
            assert_eq!(render(&json!(1.5), policy).unwrap().as_deref(), Some("1.5"));
            assert_eq!(render(&json!("hi"), policy).unwrap().as_deref(), Some("hi"));
        }
    }

    #[test]
    fn graceful_policy_stringifies_composites() {
        let text = render(&json!({ "a": [1, 2] }), RenderPolicy::Graceful).unwrap();
        assert_eq!(text.as_deref(), Some(r#"{"a":[1,2]}"#));
    }

    #[test]
    #[cfg(debug_assertions)]
    fn strict_policy_fails_in_debug_builds() {
        let err = render(&json!([1]), RenderPolicy::Strict).unwrap_err();
        assert!(matches!(err, RenderError::Unrenderable { kind: "array" }));
        assert_eq!(err.to_string(), "cannot render array value as text");
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn strict_policy_skips_in_release_builds() {
        assert!(render(&json!([1]), RenderPolicy::Strict).unwrap().is_none());
    }
}
