//! Tests for the `$.a.b.c` path walker.

use mcall::engine::jsonpath::extract;

#[test]
fn extracts_string_field() {
    let body = r#"{"status":"ok","count":7}"#;
    assert_eq!(extract(body, "$.status").unwrap(), "ok");
}

#[test]
fn extracts_number_as_string() {
    let body = r#"{"status":"ok","count":7}"#;
    assert_eq!(extract(body, "$.count").unwrap(), "7");
}

#[test]
fn extracts_nested_field() {
    let body = r#"{"a":{"b":{"c":"deep"}}}"#;
    assert_eq!(extract(body, "$.a.b.c").unwrap(), "deep");
}

#[test]
fn null_renders_empty() {
    let body = r#"{"a":null}"#;
    assert_eq!(extract(body, "$.a").unwrap(), "");
}

#[test]
fn container_renders_compact_json() {
    let body = r#"{"a":{"b":1}}"#;
    assert_eq!(extract(body, "$.a").unwrap(), r#"{"b":1}"#);
}

#[test]
fn root_expression_returns_whole_document() {
    let body = r#"{"a":1}"#;
    assert_eq!(extract(body, "$").unwrap(), r#"{"a":1}"#);
}

#[test]
fn missing_path_is_an_error() {
    let body = r#"{"a":1}"#;
    let err = extract(body, "$.b").unwrap_err().to_string();
    assert!(err.contains("not found"), "got: {}", err);
}

#[test]
fn invalid_json_is_an_error() {
    let err = extract("not json", "$.a").unwrap_err().to_string();
    assert!(err.contains("not valid JSON"), "got: {}", err);
}

#[test]
fn expression_must_start_with_dollar() {
    let err = extract(r#"{"a":1}"#, "a.b").unwrap_err().to_string();
    assert!(err.contains("must start with '$'"), "got: {}", err);
}

#[test]
fn extracted_values_feed_templates() {
    let body = r#"{"status":"ok","count":7}"#;
    let vars = [
        ("S".to_string(), extract(body, "$.status").unwrap()),
        ("C".to_string(), extract(body, "$.count").unwrap()),
    ]
    .into();
    let rendered = mcall::engine::template::render("echo status=${S} count=${C}", &vars);
    assert_eq!(rendered, "echo status=ok count=7");
    // re-rendering the unchanged template is idempotent
    assert_eq!(
        mcall::engine::template::render("echo status=${S} count=${C}", &vars),
        rendered
    );
}
