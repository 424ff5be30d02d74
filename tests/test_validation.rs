//! Tests for the HTTP and command validation predicates.

use mcall::crd::task::{
    HeaderExpectation, MatchMode, OutputMatchMode, ValidationSpec,
};
use mcall::engine::validation::{validate_command, validate_http};

fn spec() -> ValidationSpec {
    ValidationSpec {
        case_sensitive: true,
        ..ValidationSpec::default()
    }
}

// --- HTTP predicates ---

#[test]
fn empty_spec_passes() {
    assert!(validate_http(200, "anything", &[], &spec()).is_ok());
}

#[test]
fn expected_status_narrows() {
    let mut v = spec();
    v.expected_status = vec![200, 204];
    assert!(validate_http(204, "", &[], &v).is_ok());
    assert!(validate_http(201, "", &[], &v).is_err());
}

#[test]
fn body_contains() {
    let mut v = spec();
    v.expected_body = Some("ok".to_string());
    v.body_match = MatchMode::Contains;
    assert!(validate_http(200, r#"{"status":"ok"}"#, &[], &v).is_ok());
    assert!(validate_http(200, r#"{"status":"down"}"#, &[], &v).is_err());
}

#[test]
fn body_exact() {
    let mut v = spec();
    v.expected_body = Some("pong".to_string());
    v.body_match = MatchMode::Exact;
    assert!(validate_http(200, "pong", &[], &v).is_ok());
    assert!(validate_http(200, "pong\n", &[], &v).is_err());
}

#[test]
fn body_regex() {
    let mut v = spec();
    v.expected_body = Some(r#""count":\s*\d+"#.to_string());
    v.body_match = MatchMode::Regex;
    assert!(validate_http(200, r#"{"count": 7}"#, &[], &v).is_ok());
    assert!(validate_http(200, r#"{"count": "x"}"#, &[], &v).is_err());
}

#[test]
fn invalid_regex_is_a_failure() {
    let mut v = spec();
    v.expected_body = Some("(".to_string());
    v.body_match = MatchMode::Regex;
    let err = validate_http(200, "", &[], &v).unwrap_err();
    assert!(err.contains("invalid regex"), "got: {}", err);
}

#[test]
fn header_match_is_case_insensitive_on_name() {
    let mut v = spec();
    v.expected_headers = vec![HeaderExpectation {
        name: "Content-Type".to_string(),
        contains: "json".to_string(),
    }];
    let headers = vec![("content-type".to_string(), "application/json".to_string())];
    assert!(validate_http(200, "", &headers, &v).is_ok());

    let headers = vec![("content-type".to_string(), "text/plain".to_string())];
    assert!(validate_http(200, "", &headers, &v).is_err());
    assert!(validate_http(200, "", &[], &v).is_err());
}

// --- command predicates ---

#[test]
fn output_contains_default_mode() {
    let mut v = spec();
    v.expected_output = Some("OK".to_string());
    assert!(validate_command("build OK\n", &v).is_ok());
    assert!(validate_command("build FAILED\n", &v).is_err());
}

#[test]
fn output_exact_ignores_trailing_newline() {
    let mut v = spec();
    v.expected_output = Some("OK".to_string());
    v.output_match = OutputMatchMode::Exact;
    assert!(validate_command("OK\n", &v).is_ok());
    assert!(validate_command("OK extra\n", &v).is_err());
}

#[test]
fn case_insensitive_contains() {
    let mut v = spec();
    v.expected_output = Some("ok".to_string());
    v.case_sensitive = false;
    assert!(validate_command("All OK here\n", &v).is_ok());
}

#[test]
fn regex_multiline_toggle() {
    let mut v = spec();
    v.expected_output = Some("^done$".to_string());
    v.output_match = OutputMatchMode::Regex;
    v.multiline = true;
    assert!(validate_command("step one\ndone\nstep two\n", &v).is_ok());

    v.multiline = false;
    assert!(validate_command("step one\ndone\nstep two\n", &v).is_err());
}

#[test]
fn json_path_equality() {
    let mut v = spec();
    v.expected_output = Some("ok".to_string());
    v.output_match = OutputMatchMode::JsonPath;
    v.json_path = Some("$.status".to_string());
    assert!(validate_command(r#"{"status":"ok"}"#, &v).is_ok());
    assert!(validate_command(r#"{"status":"down"}"#, &v).is_err());
}

#[test]
fn json_path_mode_requires_a_path() {
    let mut v = spec();
    v.expected_output = Some("ok".to_string());
    v.output_match = OutputMatchMode::JsonPath;
    assert!(validate_command(r#"{"status":"ok"}"#, &v).is_err());
}

#[test]
fn min_lines() {
    let mut v = spec();
    v.min_lines = Some(3);
    assert!(validate_command("a\nb\nc\n", &v).is_ok());
    assert!(validate_command("a\nb\n", &v).is_err());
}

#[test]
fn failure_indicator_wins_even_when_expectation_matches() {
    let mut v = spec();
    v.expected_output = Some("OK".to_string());
    v.failure_indicator = Some("ERROR".to_string());
    assert!(validate_command("OK\n", &v).is_ok());
    let err = validate_command("OK but ERROR happened\n", &v).unwrap_err();
    assert!(err.contains("failure indicator"), "got: {}", err);
}
