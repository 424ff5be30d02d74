use regex::RegexBuilder;

use crate::crd::task::{MatchMode, OutputMatchMode, ValidationSpec};
use crate::engine::jsonpath;

/// Check an HTTP response against the validation predicates. `Err` carries a
/// human-readable reason; any failing predicate marks the attempt failed.
pub fn validate_http(
    status: u16,
    body: &str,
    headers: &[(String, String)],
    spec: &ValidationSpec,
) -> Result<(), String> {
    if !spec.expected_status.is_empty() && !spec.expected_status.contains(&status) {
        return Err(format!(
            "status {} not in expected set {:?}",
            status, spec.expected_status
        ));
    }

    if let Some(expected) = &spec.expected_body {
        match spec.body_match {
            MatchMode::Exact => {
                if body != expected {
                    return Err("body does not equal expected value".to_string());
                }
            }
            MatchMode::Contains => {
                if !body.contains(expected.as_str()) {
                    return Err(format!("body does not contain '{}'", expected));
                }
            }
            MatchMode::Regex => {
                let re = compile(expected, true, false)?;
                if !re.is_match(body) {
                    return Err(format!("body does not match /{}/", expected));
                }
            }
        }
    }

    for expectation in &spec.expected_headers {
        let value = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&expectation.name))
            .map(|(_, value)| value.as_str());
        match value {
            None => return Err(format!("header '{}' missing", expectation.name)),
            Some(value) if !value.contains(expectation.contains.as_str()) => {
                return Err(format!(
                    "header '{}' does not contain '{}'",
                    expectation.name, expectation.contains
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Check a command's combined output against the validation predicates.
pub fn validate_command(output: &str, spec: &ValidationSpec) -> Result<(), String> {
    if let Some(indicator) = &spec.failure_indicator
        && output.contains(indicator.as_str())
    {
        return Err(format!("output contains failure indicator '{}'", indicator));
    }

    if let Some(min_lines) = spec.min_lines {
        let lines = output.lines().count();
        if lines < min_lines {
            return Err(format!("output has {} lines, expected at least {}", lines, min_lines));
        }
    }

    let Some(expected) = &spec.expected_output else {
        return Ok(());
    };

    match spec.output_match {
        OutputMatchMode::Exact => {
            let actual = output.trim_end_matches('\n');
            let matched = if spec.case_sensitive {
                actual == expected
            } else {
                actual.eq_ignore_ascii_case(expected)
            };
            if !matched {
                return Err("output does not equal expected value".to_string());
            }
        }
        OutputMatchMode::Contains => {
            let matched = if spec.case_sensitive {
                output.contains(expected.as_str())
            } else {
                output.to_lowercase().contains(&expected.to_lowercase())
            };
            if !matched {
                return Err(format!("output does not contain '{}'", expected));
            }
        }
        OutputMatchMode::Regex => {
            let re = compile(expected, spec.case_sensitive, spec.multiline)?;
            if !re.is_match(output) {
                return Err(format!("output does not match /{}/", expected));
            }
        }
        OutputMatchMode::JsonPath => {
            let path = spec
                .json_path
                .as_deref()
                .ok_or_else(|| "outputMatch jsonPath requires jsonPath".to_string())?;
            let actual = jsonpath::extract(output, path)
                .map_err(|e| format!("jsonPath check failed: {:#}", e))?;
            if actual != *expected {
                return Err(format!(
                    "jsonPath '{}' is '{}', expected '{}'",
                    path, actual, expected
                ));
            }
        }
    }

    Ok(())
}

fn compile(pattern: &str, case_sensitive: bool, multiline: bool) -> Result<regex::Regex, String> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .multi_line(multiline)
        .build()
        .map_err(|e| format!("invalid regex '{}': {}", pattern, e))
}
