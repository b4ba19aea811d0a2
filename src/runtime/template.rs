//! Prompt template interpolation
//!
//! Two marker forms are scanned: `<<expr>>` substitutes the expression's
//! display string, and a template that is exactly one `<?expr?>` yields the
//! raw evaluated value. Structured prompts arrive serialized to JSON and are
//! rendered in json mode, where a marker directly surrounded by quotes is
//! replaced together with its quotes by the JSON encoding of the value, so
//! interpolated values keep their native type inside the document.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::expr::{Expr, ExprError, ExprScope};

static MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[<?](.*?)[?>]>").unwrap());
static WHOLE_RAW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\s*<\?(.*?)\?>\s*$").unwrap());

/// Whether a template contains any interpolation markers at all.
pub fn has_markers(template: &str) -> bool {
    MARKER_RE.is_match(template)
}

/// Render a template against a scope.
pub async fn render(
    template: &str,
    scope: &dyn ExprScope,
    json_mode: bool,
) -> Result<Value, ExprError> {
    if let Some(caps) = WHOLE_RAW_RE.captures(template) {
        return Ok(Expr::parse(&caps[1])?.eval(scope).await);
    }

    let mut out = String::with_capacity(template.len());
    let mut cursor = 0usize;
    for caps in MARKER_RE.captures_iter(template) {
        let marker = caps.get(0).expect("match group 0");
        let value = Expr::parse(&caps[1])?.eval(scope).await;

        let quote_wrapped = json_mode
            && template[..marker.start()].ends_with('"')
            && template[marker.end()..].starts_with('"');
        if quote_wrapped {
            out.push_str(&template[cursor..marker.start() - 1]);
            out.push_str(&value.to_string());
            cursor = marker.end() + 1;
        } else {
            out.push_str(&template[cursor..marker.start()]);
            out.push_str(&display(&value));
            cursor = marker.end();
        }
    }
    out.push_str(&template[cursor..]);
    Ok(Value::String(out))
}

/// A value's in-text form: strings verbatim, null empty, everything else
/// JSON-encoded.
fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::JsonScope;
    use serde_json::json;

    #[tokio::test]
    async fn test_string_substitution() {
        let scope = JsonScope(json!({"req": {"title": "Q3 report"}}));
        let out = render("Summarize <<req.title>> briefly", &scope, false)
            .await
            .unwrap();
        assert_eq!(out, json!("Summarize Q3 report briefly"));
    }

    #[tokio::test]
    async fn test_whole_template_raw_value() {
        let scope = JsonScope(json!({"req": {"items": [1, 2]}}));
        let out = render("<?req.items?>", &scope, false).await.unwrap();
        assert_eq!(out, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_json_mode_keeps_native_typing() {
        let scope = JsonScope(json!({"req": {"count": 3, "name": "a\"b"}}));
        let out = render(
            r#"{"n":"<<req.count>>","s":"<<req.name>>"}"#,
            &scope,
            true,
        )
        .await
        .unwrap();
        let parsed: Value = serde_json::from_str(out.as_str().unwrap()).unwrap();
        assert_eq!(parsed, json!({"n": 3, "s": "a\"b"}));
    }

    #[tokio::test]
    async fn test_embedded_marker_in_json_string() {
        let scope = JsonScope(json!({"req": {"who": "ava"}}));
        let out = render(r#"{"msg":"hi <<req.who>>!"}"#, &scope, true)
            .await
            .unwrap();
        assert_eq!(out, json!(r#"{"msg":"hi ava!"}"#));
    }

    #[tokio::test]
    async fn test_missing_variable_renders_empty() {
        let scope = JsonScope(json!({}));
        let out = render("x<<ghost>>y", &scope, false).await.unwrap();
        assert_eq!(out, json!("xy"));
    }
}
