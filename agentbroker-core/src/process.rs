// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agent runtime backed by a child process speaking newline-delimited JSON

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::runtime::{AgentConnection, AgentRuntime, ConnectOptions, ContentBlock, RuntimeMessage};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Spawns the configured command once per connection
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    command: String,
    extra_args: Vec<String>,
    close_timeout: Duration,
}

impl ProcessRuntime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            command: config.command.clone(),
            extra_args: config.args.clone(),
            close_timeout: Duration::from_secs(config.close_timeout_secs),
        }
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn open(&self, options: ConnectOptions) -> Result<Box<dyn AgentConnection>, RuntimeError> {
        let args = build_args(&options, &self.extra_args)?;
        debug!(command = %self.command, cwd = %options.cwd.display(), resume = ?options.resume, "Spawning agent runtime");

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Spawn("runtime stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("runtime stdout unavailable".into()))?;

        Ok(Box::new(ProcessConnection {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            close_timeout: self.close_timeout,
            closed: false,
        }))
    }
}

struct ProcessConnection {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    close_timeout: Duration,
    closed: bool,
}

#[async_trait]
impl AgentConnection for ProcessConnection {
    async fn send(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        let stdin = self.stdin.as_mut().ok_or(RuntimeError::Closed)?;
        let line = json!({
            "type": "user",
            "message": {"role": "user", "content": prompt},
        });
        let mut bytes = serde_json::to_vec(&line).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        bytes.push(b'\n');
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn receive(&mut self) -> BoxStream<'_, Result<RuntimeMessage, RuntimeError>> {
        let lines = &mut self.lines;
        let stream: BoxStream<'_, Result<RuntimeMessage, RuntimeError>> = Box::pin(try_stream! {
            loop {
                let line = lines.next_line().await?.ok_or(RuntimeError::Closed)?;
                if let Some(message) = parse_line(&line)? {
                    let terminal = message.is_terminal();
                    yield message;
                    if terminal {
                        break;
                    }
                }
            }
        });
        stream
    }

    async fn close(&mut self) -> Result<(), RuntimeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // EOF on stdin asks the runtime to exit on its own
        drop(self.stdin.take());
        match tokio::time::timeout(self.close_timeout, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!("Agent runtime did not exit within {:?}, killing", self.close_timeout);
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Command-line flags for one connection
pub fn build_args(options: &ConnectOptions, extra: &[String]) -> Result<Vec<String>, RuntimeError> {
    let mut args: Vec<String> = [
        "--print",
        "--verbose",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let opts = &options.options;
    if let Some(prompt) = &opts.system_prompt {
        args.extend(["--system-prompt".to_string(), prompt.clone()]);
    }
    if let Some(mode) = &opts.permission_mode {
        args.extend(["--permission-mode".to_string(), mode.clone()]);
    }
    if let Some(model) = &opts.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if !opts.allowed_tools.is_empty() {
        args.extend(["--allowedTools".to_string(), opts.allowed_tools.join(",")]);
    }
    if !opts.disallowed_tools.is_empty() {
        args.extend(["--disallowedTools".to_string(), opts.disallowed_tools.join(",")]);
    }
    if !opts.mcp_servers.is_empty() {
        let config = json!({ "mcpServers": Value::Object(opts.mcp_servers.clone()) });
        let encoded = serde_json::to_string(&config).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        args.extend(["--mcp-config".to_string(), encoded]);
    }
    if !opts.setting_sources.is_empty() {
        args.extend(["--setting-sources".to_string(), opts.setting_sources.join(",")]);
    }
    for plugin in &opts.plugins {
        if let Some(path) = plugin.get("path").and_then(Value::as_str) {
            args.extend(["--plugin-dir".to_string(), path.to_string()]);
        }
    }
    if let Some(turns) = opts.max_turns {
        args.extend(["--max-turns".to_string(), turns.to_string()]);
    }
    if let Some(budget) = opts.max_budget_usd {
        args.extend(["--max-budget-usd".to_string(), budget.to_string()]);
    }
    for dir in &options.add_dirs {
        args.extend(["--add-dir".to_string(), dir.to_string_lossy().into_owned()]);
    }
    if let Some(session_id) = &options.resume {
        args.extend(["--resume".to_string(), session_id.clone()]);
    }
    args.extend(extra.iter().cloned());
    Ok(args)
}

/// Decode one output line. Lines that carry nothing for the broker yield `None`.
pub fn parse_line(line: &str) -> Result<Option<RuntimeMessage>, RuntimeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RuntimeError::Protocol(format!("invalid JSON from runtime: {}", e)))?;

    match value.get("type").and_then(Value::as_str) {
        Some("system") if value.get("subtype").and_then(Value::as_str) == Some("init") => {
            let session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .ok_or_else(|| RuntimeError::Protocol("init message without session_id".into()))?;
            Ok(Some(RuntimeMessage::Init {
                session_id: session_id.to_string(),
            }))
        }
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|content| content.iter().filter_map(parse_block).collect())
                .unwrap_or_default();
            Ok(Some(RuntimeMessage::Assistant { blocks }))
        }
        Some("result") => Ok(Some(RuntimeMessage::Result {
            is_error: value.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            message: value.get("result").and_then(Value::as_str).map(str::to_string),
        })),
        _ => Ok(None),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = block.get("text").and_then(Value::as_str)?;
            (!text.is_empty()).then(|| ContentBlock::Text(text.to_string()))
        }
        "tool_use" => Some(ContentBlock::ToolUse {
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input: block.get("input").cloned().unwrap_or_else(|| json!({})),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::AgentOptions;
    use std::path::PathBuf;

    #[test]
    fn test_parse_init_and_result() {
        let init = parse_line(r#"{"type":"system","subtype":"init","session_id":"abc-1"}"#).unwrap();
        assert_eq!(init, Some(RuntimeMessage::Init { session_id: "abc-1".into() }));

        let done = parse_line(r#"{"type":"result","subtype":"success","is_error":false,"result":"ok"}"#).unwrap();
        assert_eq!(
            done,
            Some(RuntimeMessage::Result {
                is_error: false,
                message: Some("ok".into())
            })
        );
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line(r#"{"type":"user"}"#).unwrap().is_none());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn test_parse_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Hi"},
            {"type":"thinking","thinking":"..."},
            {"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}
        ]}}"#
            .replace('\n', "");
        let msg = parse_line(&line).unwrap().unwrap();
        assert_eq!(
            msg,
            RuntimeMessage::Assistant {
                blocks: vec![
                    ContentBlock::Text("Hi".into()),
                    ContentBlock::ToolUse {
                        name: "Bash".into(),
                        input: json!({"command": "ls"})
                    },
                ]
            }
        );
    }

    #[test]
    fn test_build_args_maps_options() {
        let mut opts = AgentOptions::default();
        opts.model = Some("sonnet".into());
        opts.allowed_tools = vec!["Read".into(), "Grep".into()];
        opts.max_turns = Some(5);
        opts.mcp_servers.insert("fs".into(), json!({"command": "mcp-fs"}));

        let args = build_args(
            &ConnectOptions {
                cwd: PathBuf::from("/base/alice"),
                options: opts,
                add_dirs: vec![PathBuf::from("/base/alice/data")],
                resume: Some("abc-1".into()),
            },
            &["--debug".to_string()],
        )
        .unwrap();

        let joined = args.join(" ");
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--allowedTools Read,Grep"));
        assert!(joined.contains("--max-turns 5"));
        assert!(joined.contains("--add-dir /base/alice/data"));
        assert!(joined.contains("--resume abc-1"));
        assert!(joined.contains(r#"--mcp-config {"mcpServers":{"fs":{"command":"mcp-fs"}}}"#));
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
    }
}
