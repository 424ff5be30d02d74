use std::time::Duration;

use reqwest::redirect;

use crate::crd::task::ValidationSpec;
use crate::engine::validation;
use crate::executors::{ExecutionOutcome, truncate_output};

/// User agent sent on every outbound HTTP request.
pub const USER_AGENT: &str = "mcall/1.0";

const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// HTTP GET against the task input (a URL).
pub async fn get(
    input: &str,
    validation: Option<&ValidationSpec>,
    timeout: Duration,
) -> ExecutionOutcome {
    let client = match build_client(validation, timeout) {
        Ok(client) => client,
        Err(e) => return ExecutionOutcome::failure(String::new(), format!("http client: {}", e)),
    };
    let response = match client.get(input.trim()).send().await {
        Ok(response) => response,
        Err(e) => {
            return ExecutionOutcome::failure(String::new(), format!("request failed: {}", e));
        }
    };
    finish(response, validation).await
}

/// HTTP POST. The first whitespace-delimited token of the input is the URL;
/// the remainder, if any, is the request body. Content type defaults to
/// `application/json` when the body looks like JSON.
pub async fn post(
    input: &str,
    validation: Option<&ValidationSpec>,
    timeout: Duration,
) -> ExecutionOutcome {
    let (url, body) = split_input(input);

    let client = match build_client(validation, timeout) {
        Ok(client) => client,
        Err(e) => return ExecutionOutcome::failure(String::new(), format!("http client: {}", e)),
    };

    let mut request = client.post(url);
    if !body.is_empty() {
        if body.starts_with('{') || body.starts_with('[') {
            request = request.header("Content-Type", "application/json");
        }
        request = request.body(body.to_string());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return ExecutionOutcome::failure(String::new(), format!("request failed: {}", e));
        }
    };
    finish(response, validation).await
}

fn build_client(
    validation: Option<&ValidationSpec>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let policy = match validation {
        Some(spec) if spec.follow_redirects => redirect::Policy::limited(
            spec.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS) as usize,
        ),
        _ => redirect::Policy::none(),
    };
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(policy)
        .timeout(timeout)
        .build()
}

fn split_input(input: &str) -> (&str, &str) {
    let trimmed = input.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((url, rest)) => (url, rest.trim_start()),
        None => (trimmed, ""),
    }
}

async fn finish(
    response: reqwest::Response,
    validation: Option<&ValidationSpec>,
) -> ExecutionOutcome {
    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or("").to_string(),
            )
        })
        .collect();

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            let mut outcome =
                ExecutionOutcome::failure(String::new(), format!("reading body: {}", e));
            outcome.http_status_code = Some(status.as_u16());
            return outcome;
        }
    };

    let output = truncate_output(&body);
    let code = status.as_u16();

    let mut outcome = if (200..300).contains(&code) {
        ExecutionOutcome::success(output)
    } else {
        ExecutionOutcome::failure(
            output,
            format!(
                "HTTP {}: {}",
                code,
                status.canonical_reason().unwrap_or("Unknown")
            ),
        )
    };
    outcome.http_status_code = Some(code);

    if outcome.succeeded()
        && let Some(spec) = validation
        && let Err(reason) = validation::validate_http(code, &body, &headers, spec)
    {
        outcome = ExecutionOutcome {
            http_status_code: Some(code),
            ..ExecutionOutcome::failure(outcome.output, format!("validation failed: {}", reason))
        };
    }

    outcome
}
