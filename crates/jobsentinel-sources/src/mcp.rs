//! Job-search tools served by an MCP server over stdio.
//!
//! Each page spawns the configured command, performs the `initialize`
//! handshake and issues one `tools/call`. The tool's text content must be
//! JSON: either an array of jobs or `{"jobs": [...], "has_more": bool}`.

use std::process::Stdio;

use jobsentinel_core::error::AppError;
use jobsentinel_core::models::{RawJobRecord, SourcePage, SourceQuery};
use jobsentinel_core::traits::SourceAdapter;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::Command;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Longest single JSON-RPC line accepted from a server.
const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct McpAdapter {
    source_id: String,
    command: String,
    args: Vec<String>,
    tool: String,
}

impl McpAdapter {
    pub fn new(source_id: &str, command: &str, args: Vec<String>, tool: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            command: command.to_string(),
            args,
            tool: tool.to_string(),
        }
    }

    fn arguments(&self, query: &SourceQuery, page: u32) -> Result<Value, AppError> {
        let SourceQuery::Keywords { keywords, location } = query else {
            return Err(AppError::InvalidQuery(format!(
                "source '{}' only supports keyword search",
                self.source_id
            )));
        };
        Ok(json!({
            "keywords": keywords.join(" "),
            "location": location,
            "page": page,
        }))
    }
}

/// A JSON-RPC 2.0 session over newline-delimited messages.
pub struct McpSession<R, W> {
    source_id: String,
    reader: R,
    writer: W,
    next_id: u64,
    max_message_bytes: u64,
}

impl<R, W> McpSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(source_id: &str, reader: R, writer: W) -> Self {
        Self {
            source_id: source_id.to_string(),
            reader,
            writer,
            next_id: 1,
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_max_message_bytes(mut self, limit: u64) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub async fn initialize(&mut self) -> Result<Value, AppError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "jobsentinel", "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result)
    }

    /// Call `tool` and return its concatenated text content.
    pub async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<String, AppError> {
        let result = self
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await?;

        let text: String = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|c| c.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(AppError::unavailable(
                &self.source_id,
                format!("tool '{tool}' failed: {text}"),
            ));
        }
        Ok(text)
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), AppError> {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, AppError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;

        loop {
            let mut line = String::new();
            let read = (&mut self.reader)
                .take(self.max_message_bytes)
                .read_line(&mut line)
                .await
                .map_err(|e| {
                    AppError::unavailable(&self.source_id, format!("MCP read failed: {e}"))
                })?;
            if read == 0 {
                return Err(AppError::unavailable(
                    &self.source_id,
                    format!("MCP server closed the stream during '{method}'"),
                ));
            }
            if read as u64 >= self.max_message_bytes && !line.ends_with('\n') {
                return Err(AppError::unavailable(
                    &self.source_id,
                    format!(
                        "MCP message during '{method}' exceeds {} bytes",
                        self.max_message_bytes
                    ),
                ));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: Value = serde_json::from_str(line).map_err(|e| {
                AppError::parse(&self.source_id, format!("MCP message is not JSON: {e}"))
            })?;
            // Server notifications and unrelated responses are skipped.
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }

            if let Some(error) = message.get("error") {
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(AppError::unavailable(
                    &self.source_id,
                    format!("MCP '{method}' failed: {text}"),
                ));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn send(&mut self, message: &Value) -> Result<(), AppError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await.map_err(|e| {
            AppError::unavailable(&self.source_id, format!("MCP write failed: {e}"))
        })?;
        self.writer.flush().await.map_err(|e| {
            AppError::unavailable(&self.source_id, format!("MCP write failed: {e}"))
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolOutput {
    Jobs(Vec<Value>),
    Paged {
        jobs: Vec<Value>,
        #[serde(default)]
        has_more: bool,
    },
}

#[derive(Debug, Deserialize)]
struct McpJob {
    #[serde(default, alias = "external_id", alias = "job_id")]
    id: Option<Value>,
    title: String,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    remote: Option<bool>,
    #[serde(default)]
    salary_min: Option<f64>,
    #[serde(default)]
    salary_max: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "date_posted")]
    posted_at: Option<String>,
}

/// Decode the tool's text payload into records plus a has-more flag.
pub fn parse_tool_output(
    source_id: &str,
    text: &str,
) -> Result<(Vec<Result<RawJobRecord, AppError>>, bool), AppError> {
    let output: ToolOutput = serde_json::from_str(text)
        .map_err(|e| AppError::parse(source_id, format!("unexpected tool output: {e}")))?;
    let (jobs, has_more) = match output {
        ToolOutput::Jobs(jobs) => (jobs, false),
        ToolOutput::Paged { jobs, has_more } => (jobs, has_more),
    };

    let records = jobs
        .into_iter()
        .map(|value| {
            let job: McpJob = serde_json::from_value(value)
                .map_err(|e| AppError::parse(source_id, format!("tool job: {e}")))?;
            let external_id = job.id.and_then(|id| match id {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Ok(RawJobRecord {
                external_id,
                title: Some(job.title),
                company: job.company,
                location: job.location,
                remote: job.remote,
                salary_min: job.salary_min,
                salary_max: job.salary_max,
                currency: job.currency,
                description: job.description,
                description_is_html: false,
                url: job.url,
                posted_at: job.posted_at,
                ..RawJobRecord::new(source_id)
            })
        })
        .collect();

    Ok((records, has_more))
}

impl SourceAdapter for McpAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, AppError> {
        query.validate(page)?;
        let arguments = self.arguments(query, page)?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::unavailable(
                    &self.source_id,
                    format!("failed to start '{}': {e}", self.command),
                )
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AppError::unavailable(
                &self.source_id,
                "MCP server stdio not captured",
            ));
        };

        let mut session = McpSession::new(&self.source_id, BufReader::new(stdout), stdin);
        session.initialize().await?;
        let text = session.call_tool(&self.tool, arguments).await?;
        drop(session);

        if let Err(e) = child.kill().await {
            tracing::debug!(source_id = %self.source_id, error = %e, "MCP server already exited");
        }

        let (records, has_more) = parse_tool_output(&self.source_id, &text)?;
        tracing::debug!(source_id = %self.source_id, page, records = records.len(), has_more, "MCP page fetched");
        Ok(SourcePage { records, has_more })
    }
}
