//! Http: calls another service over HTTP, with streaming response support.
//!
//! Responses are interpreted by media type: `text/event-stream` and
//! `application/x-ndjson` become iterators carried in the output's `body`,
//! `application/json` is decoded into a value, anything else is read as
//! text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Evaluator, Expr, Input, IteratorHandle, IteratorSender, Output,
    Registry, Task, TaskError, TaskFactory, TaskHeader, Value,
};

pub const TYPE_HTTP: &str = "http";

const ENCODING_JSON: &str = "json";

fn default_encoding() -> String {
    ENCODING_JSON.to_string()
}

#[derive(Deserialize)]
struct HttpInput {
    #[serde(default = "default_encoding")]
    encoding: String,
    method: Expr<String>,
    uri: Expr<String>,
    #[serde(default)]
    query: Expr<serde_json::Map<String, Json>>,
    #[serde(default)]
    header: Expr<HashMap<String, Vec<String>>>,
    #[serde(default)]
    body: Expr<serde_json::Map<String, Json>>,
    #[serde(default)]
    sse_filter: String,
}

/// A leaf task that performs one HTTP request.
pub struct Http {
    header: TaskHeader,
    encoding: String,
    method: Expr<String>,
    uri: Expr<String>,
    query: Expr<serde_json::Map<String, Json>>,
    request_header: Expr<HashMap<String, Vec<String>>>,
    body: Expr<serde_json::Map<String, Json>>,
    sse_filter: String,
    client: reqwest::Client,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_HTTP, |_registry, definition| {
        let raw: HttpInput = crate::common::decode_input(&definition.input)?;
        if raw.encoding != ENCODING_JSON {
            return Err(ConstructError::Definition(format!(
                "unsupported encoding {:?}",
                raw.encoding
            )));
        }
        Ok(Arc::new(Http {
            client: build_client(definition.timeout),
            header: definition.header(),
            encoding: raw.encoding,
            method: raw.method,
            uri: raw.uri,
            query: raw.query,
            request_header: raw.header,
            body: raw.body,
            sse_filter: raw.sse_filter,
        }) as Arc<dyn Task>)
    }))
}

fn build_client(timeout: Option<Duration>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Builder for programmatic construction.
pub struct HttpBuilder {
    header: TaskHeader,
    method: Json,
    uri: Json,
    query: serde_json::Map<String, Json>,
    request_header: HashMap<String, Vec<String>>,
    body: Option<serde_json::Map<String, Json>>,
    sse_filter: String,
}

impl Http {
    pub fn request(
        name: impl Into<String>,
        method: impl Into<Json>,
        uri: impl Into<Json>,
    ) -> HttpBuilder {
        HttpBuilder {
            header: TaskHeader::new(name, TYPE_HTTP),
            method: method.into(),
            uri: uri.into(),
            query: serde_json::Map::new(),
            request_header: HashMap::new(),
            body: None,
            sse_filter: String::new(),
        }
    }

    pub fn get(name: impl Into<String>, uri: impl Into<Json>) -> HttpBuilder {
        Self::request(name, "GET", uri)
    }

    pub fn post(name: impl Into<String>, uri: impl Into<Json>) -> HttpBuilder {
        Self::request(name, "POST", uri)
    }
}

impl HttpBuilder {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.header.timeout = Some(timeout);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.request_header.insert(key.into(), values);
        self
    }

    pub fn with_body(mut self, body: serde_json::Map<String, Json>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_sse_filter(mut self, filter: impl Into<String>) -> Self {
        self.sse_filter = filter.into();
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(Http {
            client: build_client(self.header.timeout),
            encoding: ENCODING_JSON.to_string(),
            method: Expr::new(self.method),
            uri: Expr::new(self.uri),
            query: Expr::new(Json::Object(self.query)),
            request_header: Expr::new(serde_json::to_value(self.request_header).unwrap_or(Json::Null)),
            body: match self.body {
                Some(body) => Expr::new(Json::Object(body)),
                None => Expr::default(),
            },
            sse_filter: self.sse_filter,
            header: self.header,
        })
    }
}

#[async_trait]
impl Task for Http {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let method = self.method.evaluate(input)?;
        let uri = self.uri.evaluate(input)?;
        let query = if self.query.is_empty() {
            serde_json::Map::new()
        } else {
            self.query.evaluate(input)?
        };
        let headers = if self.request_header.is_empty() {
            HashMap::new()
        } else {
            self.request_header.evaluate(input)?
        };
        let body = if self.body.is_empty() {
            serde_json::Map::new()
        } else {
            self.body.evaluate(input)?
        };

        let method: reqwest::Method = method
            .parse()
            .map_err(|_| TaskError::failed(format!("invalid HTTP method: {method}")))?;
        tracing::debug!(task = %self.header.name, %method, %uri, "dispatching HTTP request");

        let mut request = self.client.request(method, &uri);
        for (key, value) in &query {
            let value = match value {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.query(&[(key.as_str(), value.as_str())]);
        }
        for (key, values) in &headers {
            for value in values {
                request = request.header(key.as_str(), value.as_str());
            }
        }
        if self.encoding == ENCODING_JSON {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::ACCEPT, "application/json");
        }
        if !body.is_empty() {
            request = request.json(&body);
        }

        // The in-flight call must stop as soon as the surrounding scope is
        // cancelled, independent of the client's own timeout.
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(TaskError::Canceled),
            result = request.send() => {
                result.map_err(|e| TaskError::failed(format!("http request failed: {e}")))?
            }
        };

        let status = response.status().as_u16() as i64;
        let response_headers = headers_value(response.headers());
        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .map(|m| m.essence_str().to_string())
            .unwrap_or_default();

        let body = match media_type.as_str() {
            "text/event-stream" => Value::Iterator(self.event_stream(ctx, response)),
            "application/x-ndjson" => Value::Iterator(self.line_stream(ctx, response)),
            "application/json" => {
                let decoded = tokio::select! {
                    _ = ctx.cancelled() => return Err(TaskError::Canceled),
                    result = response.json::<Json>() => {
                        result.map_err(|e| TaskError::failed(format!("bad JSON response: {e}")))?
                    }
                };
                Value::from_json(decoded)
            }
            _ => {
                let text = tokio::select! {
                    _ = ctx.cancelled() => return Err(TaskError::Canceled),
                    result = response.text() => {
                        result.map_err(|e| TaskError::failed(format!("bad response body: {e}")))?
                    }
                };
                Value::String(text)
            }
        };

        let mut output = Output::new();
        output.insert("status", status);
        output.insert("header", response_headers);
        output.insert("body", body);
        Ok(output)
    }
}

impl Http {
    /// Server-sent events: lines accumulate into events, each event's data
    /// is emitted as `{"data": <string>}`.
    fn event_stream(&self, ctx: &Context, response: reqwest::Response) -> IteratorHandle {
        let filter = self.sse_filter.clone();
        IteratorHandle::new(ctx, move |sender| async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut data_lines: Vec<String> = Vec::new();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        for line in drain_lines(&mut buffer) {
                            if line.is_empty() {
                                if !send_event(&sender, &mut data_lines, &filter).await {
                                    return;
                                }
                            } else if let Some(data) = line.strip_prefix("data:") {
                                data_lines.push(data.trim_start().to_string());
                            }
                        }
                    }
                    Some(Err(err)) => {
                        sender
                            .send(Output::new(), Some(TaskError::failed(err.to_string())))
                            .await;
                        return;
                    }
                    None => {
                        let _ = send_event(&sender, &mut data_lines, &filter).await;
                        sender.end();
                        return;
                    }
                }
            }
        })
    }

    /// Newline-delimited JSON: each non-empty line is emitted as
    /// `{"data": <line>}`, mimicking a server-sent event for compatibility.
    fn line_stream(&self, ctx: &Context, response: reqwest::Response) -> IteratorHandle {
        let filter = self.sse_filter.clone();
        IteratorHandle::new(ctx, move |sender| async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        for line in drain_lines(&mut buffer) {
                            if line.is_empty() {
                                continue;
                            }
                            let mut data_lines = vec![line];
                            if !send_event(&sender, &mut data_lines, &filter).await {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        sender
                            .send(Output::new(), Some(TaskError::failed(err.to_string())))
                            .await;
                        return;
                    }
                    None => {
                        let remainder = String::from_utf8_lossy(&buffer).trim().to_string();
                        if !remainder.is_empty() {
                            let mut data_lines = vec![remainder];
                            let _ = send_event(&sender, &mut data_lines, &filter).await;
                        }
                        sender.end();
                        return;
                    }
                }
            }
        })
    }
}

fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(position) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=position).collect();
        lines.push(
            String::from_utf8_lossy(&raw)
                .trim_end_matches(['\n', '\r'])
                .to_string(),
        );
    }
    lines
}

async fn send_event(sender: &IteratorSender, data_lines: &mut Vec<String>, filter: &str) -> bool {
    if data_lines.is_empty() {
        return true;
    }
    let mut data = data_lines.join("\n");
    data_lines.clear();

    if !filter.is_empty() {
        let evaluator = Evaluator::new();
        evaluator.add("data", Value::String(data));
        match evaluator.evaluate(filter) {
            Ok(value) => data = value.to_string(),
            Err(err) => {
                sender
                    .send(
                        Output::new(),
                        Some(TaskError::Evaluation(format!(
                            "failed to evaluate '{filter}': {err}"
                        ))),
                    )
                    .await;
                return false;
            }
        }
    }

    let mut event = Output::new();
    event.insert("data", data);
    sender.send(event, None).await
}

fn headers_value(headers: &reqwest::header::HeaderMap) -> Value {
    let mut map: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
    for (name, value) in headers {
        let entry = map
            .entry(name.as_str().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            ));
        }
    }
    Value::Map(map)
}
