use std::time::Duration;

use anyhow::{Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use crate::crd::task::RemoteAuthType;
use crate::executors::{ExecutionOutcome, truncate_output};

/// Protocol version the remote server must speak.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// Header carrying the server-assigned session identifier.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_VALUE: &str = "application/json, text/event-stream";
const CLIENT_NAME: &str = "mcall";
const CLIENT_VERSION: &str = "1.0";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A remote tool call with credentials already dereferenced from the secret
/// store. Header values may carry auth material and must never be logged.
#[derive(Debug, Clone)]
pub struct ResolvedRemoteCall {
    pub server_url: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Option<Duration>,
}

/// Connection state shared by the three protocol steps.
pub struct Session {
    client: reqwest::Client,
    server_url: String,
    headers: Vec<(String, String)>,
    session_id: Option<String>,
}

/// Build the auth header for a resolved credential value, if the auth type
/// needs one.
pub fn auth_header(
    auth_type: RemoteAuthType,
    header_name: Option<&str>,
    credential: &str,
) -> Option<(String, String)> {
    match auth_type {
        RemoteAuthType::None => None,
        RemoteAuthType::ApiKey => Some((
            header_name.unwrap_or("X-API-Key").to_string(),
            credential.to_string(),
        )),
        RemoteAuthType::Bearer => Some((
            "Authorization".to_string(),
            format!("Bearer {}", credential),
        )),
        RemoteAuthType::Basic => Some((
            "Authorization".to_string(),
            format!("Basic {}", BASE64.encode(credential)),
        )),
    }
}

/// Full three-step exchange: initialize, initialized notification, tool
/// call. Transport failures and JSON-RPC error objects both surface as a
/// failed outcome.
pub async fn run(config: ResolvedRemoteCall) -> ExecutionOutcome {
    let session = match initialize(&config).await {
        Ok(session) => session,
        Err(e) => return ExecutionOutcome::failure(String::new(), format!("initialize: {:#}", e)),
    };

    if let Err(e) = notify_initialized(&session).await {
        return ExecutionOutcome::failure(
            String::new(),
            format!("initialized notification: {:#}", e),
        );
    }

    call_tool(&session, &config.tool_name, &config.arguments).await
}

/// Step 1: handshake. Captures the server-assigned session identifier from
/// the `mcp-session-id` response header.
pub async fn initialize(config: &ResolvedRemoteCall) -> Result<Session> {
    let client = reqwest::Client::builder()
        .user_agent(super::http::USER_AGENT)
        .connect_timeout(config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
        .build()?;

    let mut session = Session {
        client,
        server_url: config.server_url.clone(),
        headers: config.headers.clone(),
        session_id: None,
    };

    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
        },
    });

    let response = session.post(&body).await?;
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let payload = read_rpc_payload(response).await?;
    if let Some(error) = payload.get("error") {
        bail!("server rejected initialize: {}", error_message(error));
    }

    session.session_id = session_id;
    Ok(session)
}

/// Step 2: fire the `notifications/initialized` notification bearing the
/// session header. Notifications carry no id and expect no result.
pub async fn notify_initialized(session: &Session) -> Result<()> {
    let body = json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized",
    });
    session.post(&body).await?;
    Ok(())
}

/// Step 3: invoke the named tool. The response's `result.content[]` text
/// entries are concatenated; an `error` object or transport failure marks
/// the attempt failed.
pub async fn call_tool(
    session: &Session,
    tool_name: &str,
    arguments: &serde_json::Value,
) -> ExecutionOutcome {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {"name": tool_name, "arguments": arguments},
    });

    let response = match session.post(&body).await {
        Ok(response) => response,
        Err(e) => {
            return ExecutionOutcome::failure(String::new(), format!("tool call: {:#}", e));
        }
    };

    let payload = match read_rpc_payload(response).await {
        Ok(payload) => payload,
        Err(e) => {
            return ExecutionOutcome::failure(String::new(), format!("tool call: {:#}", e));
        }
    };

    if let Some(error) = payload.get("error") {
        return ExecutionOutcome::failure(
            String::new(),
            format!("remote error: {}", error_message(error)),
        );
    }

    let Some(result) = payload.get("result") else {
        return ExecutionOutcome::failure(
            String::new(),
            "response carries neither result nor error",
        );
    };

    let mut output = String::new();
    if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
        for entry in content {
            if let Some(text) = entry.get("text").and_then(|t| t.as_str()) {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&truncate_output(text));
            }
        }
    }

    ExecutionOutcome::success(truncate_output(&output))
}

impl Session {
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.server_url)
            .header(reqwest::header::ACCEPT, ACCEPT_VALUE)
            .json(body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(id) = &self.session_id {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            bail!("server returned HTTP {}", status.as_u16());
        }
        Ok(response)
    }
}

/// Decode a JSON-RPC response body. Servers negotiated via the Accept header
/// may answer either plain JSON or an event stream; for the latter the first
/// `data:` frame carries the message.
async fn read_rpc_payload(response: reqwest::Response) -> Result<serde_json::Value> {
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response.text().await?;

    if content_type.starts_with("text/event-stream") {
        for line in body.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                return serde_json::from_str(data)
                    .map_err(|e| anyhow::anyhow!("invalid event payload: {}", e));
            }
        }
        bail!("event stream carried no data frame");
    }

    serde_json::from_str(&body).map_err(|e| anyhow::anyhow!("invalid JSON-RPC payload: {}", e))
}

fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
