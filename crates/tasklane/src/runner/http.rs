//! HTTP task runner.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::{HttpRequestSpec, Task, TaskKind};
use crate::runner::{RunContext, RunOutcome, Runner, STOPPED_BY_USER};

/// Runs HTTP tasks. Statuses below 400 count as success.
#[derive(Clone, Debug, Default)]
pub struct HttpRunner {
    client: Client,
}

impl HttpRunner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// A request definition that has passed validation.
#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: String,
}

fn request_spec(task: &Task) -> EngineResult<&HttpRequestSpec> {
    match &task.kind {
        TaskKind::Http(spec) => Ok(spec),
        TaskKind::Script { .. } => Err(EngineError::internal(format!(
            "task {} is not an http task",
            task.id
        ))),
    }
}

fn prepare(spec: &HttpRequestSpec) -> EngineResult<PreparedRequest> {
    let method = match spec.method.trim() {
        "" => Method::GET,
        raw => Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|_| {
            EngineError::invalid_request(format!("invalid request method '{raw}'"))
        })?,
    };
    let url = Url::parse(spec.url.trim()).map_err(|err| {
        EngineError::invalid_request(format!("invalid request url '{}': {err}", spec.url))
    })?;
    Ok(PreparedRequest {
        method,
        url,
        headers: parse_headers(&spec.headers)?,
        body: spec.body.clone(),
    })
}

/// Parse the stored JSON object of header names to values.
fn parse_headers(raw: &str) -> EngineResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    if raw.trim().is_empty() {
        return Ok(headers);
    }
    let pairs: BTreeMap<String, String> = serde_json::from_str(raw)
        .map_err(|err| EngineError::invalid_request(format!("invalid request headers: {err}")))?;
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            EngineError::invalid_request(format!("invalid request header name '{name}'"))
        })?;
        let header_value = HeaderValue::from_str(&value).map_err(|_| {
            EngineError::invalid_request(format!("invalid value for request header '{name}'"))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

impl HttpRunner {
    async fn send(&self, request: PreparedRequest, timeout: Duration) -> RunOutcome {
        let timeout_secs = timeout.as_secs();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(timeout);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return RunOutcome::failed(format!("request timeout after {timeout_secs}s"), "")
            }
            Err(err) => return RunOutcome::failed(format!("request failed: {err}"), ""),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) if err.is_timeout() => {
                return RunOutcome::failed(format!("request timeout after {timeout_secs}s"), "")
            }
            Err(err) => {
                return RunOutcome::failed(format!("failed to read response body: {err}"), "")
            }
        };

        if status.as_u16() < 400 {
            RunOutcome::success(body)
        } else {
            RunOutcome::failed(
                format!("request failed: HTTP {}\n{body}", status.as_u16()),
                body,
            )
        }
    }
}

#[async_trait]
impl Runner for HttpRunner {
    fn preflight(&self, task: &Task) -> EngineResult<()> {
        prepare(request_spec(task)?).map(|_| ())
    }

    async fn run(&self, ctx: RunContext) -> RunOutcome {
        let request = match request_spec(&ctx.task).and_then(prepare) {
            Ok(request) => request,
            Err(err) => return RunOutcome::failed(err.message, ""),
        };
        tracing::debug!(run_id = %ctx.run_id, method = %request.method, url = %request.url, "sending request");

        tokio::select! {
            outcome = self.send(request, ctx.timeout) => outcome,
            () = ctx.stop.requested() => RunOutcome::failed(STOPPED_BY_USER, ""),
        }
    }
}
