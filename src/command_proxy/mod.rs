//! Desktop-side dispatcher for the fixed command-proxy channel whitelist.
//!
//! Mirrors the daemon's own `ipc::dispatch` shape (a `match` over a fixed
//! method catalogue, string-prefixed error markers) but operates over the
//! E2EE-wrapped `InnerFrame` protocol instead of JSON-RPC, and only ever
//! talks to the mobile that currently holds the desktop's attention.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::endpoint::RelayClient;
use crate::protocol::InnerFrame;

/// Budget for a single command's end-to-end handling before the caller
/// should treat it as failed (SPEC_FULL S5).
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

const CHANNEL_NOT_ALLOWED: &str = "Channel not allowed";

struct SpawnedProcess {
    child: Child,
    mobile_device_id: String,
}

/// Removes the mapping for `pid`, if present, and returns the mobile it was
/// streaming to. Shared by `forget` and the stdout reader task so both paths
/// to "a process is done" agree on what "done" means.
async fn remove_process(
    processes: &Mutex<HashMap<u32, SpawnedProcess>>,
    pid: u32,
) -> Option<String> {
    processes.lock().await.remove(&pid).map(|p| p.mobile_device_id)
}

/// Tracks live spawned processes and routes their streaming output back to
/// whichever mobile device started them.
pub struct CommandProxy {
    processes: Arc<Mutex<HashMap<u32, SpawnedProcess>>>,
    relay: Arc<RelayClient>,
}

impl CommandProxy {
    pub fn new(relay: Arc<RelayClient>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            relay,
        }
    }

    /// Handles one inbound `command` frame from `mobile_device_id`, returning
    /// the `response` frame to send back. For `claude:spawn`, subsequent
    /// stdout lines arrive separately as `InnerFrame::Event` frames pushed to
    /// `mobile_device_id` by a background reader task.
    pub async fn handle_command(
        &self,
        mobile_device_id: &str,
        id: &str,
        channel: &str,
        args: &Value,
    ) -> InnerFrame {
        let outcome = match channel {
            "claude:spawn" => self.spawn(mobile_device_id, args).await,
            "claude:send" => self.send(args).await,
            "claude:kill" => self.kill(args).await,
            "session:list" => Self::session_list(),
            "session:messages" => Self::session_messages(args),
            "vcs:status" => Self::vcs_status(args).await,
            "vcs:diff" => Self::vcs_diff(args).await,
            "fs:search" => Self::fs_search(args).await,
            "app:info" => Self::app_info(),
            other => {
                warn!(channel = other, "command-proxy: channel not in whitelist");
                Err(CHANNEL_NOT_ALLOWED.to_string())
            }
        };

        match outcome {
            Ok(result) => InnerFrame::Response {
                id: id.to_string(),
                result: Some(result),
                error: None,
            },
            Err(message) => InnerFrame::Response {
                id: id.to_string(),
                result: None,
                error: Some(message),
            },
        }
    }

    /// Drops the mapping for a pid that has exited or been explicitly
    /// killed, and returns the mobile it was streaming to (if any), so the
    /// caller can emit a final `event` closing out the stream.
    pub async fn forget(&self, pid: u32) -> Option<String> {
        remove_process(&self.processes, pid).await
    }

    async fn spawn(&self, mobile_device_id: &str, args: &Value) -> Result<Value, String> {
        let cwd = args
            .get("cwd")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing cwd".to_string())?;

        let mut child = Command::new("claude")
            .arg("--print")
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| e.to_string())?;

        let pid = child.id().ok_or_else(|| "process exited immediately".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "process stdout unavailable".to_string())?;

        self.processes.lock().await.insert(
            pid,
            SpawnedProcess {
                child,
                mobile_device_id: mobile_device_id.to_string(),
            },
        );
        info!(pid, mobile = mobile_device_id, "command-proxy: spawned claude process");

        let processes = Arc::clone(&self.processes);
        let relay = Arc::clone(&self.relay);
        let mobile_device_id = mobile_device_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = InnerFrame::Event {
                            channel: "claude:spawn".to_string(),
                            data: json!({ "pid": pid, "line": line }),
                        };
                        let Ok(bytes) = serde_json::to_vec(&event) else { continue };
                        if let Err(e) = relay.send_encrypted(&mobile_device_id, &bytes).await {
                            warn!(pid, "command-proxy: failed to forward streaming output: {e:#}");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pid, "command-proxy: stdout read error: {e}");
                        break;
                    }
                }
            }

            if remove_process(&processes, pid).await.is_some() {
                let event = InnerFrame::Event {
                    channel: "claude:spawn".to_string(),
                    data: json!({ "pid": pid, "exited": true }),
                };
                if let Ok(bytes) = serde_json::to_vec(&event) {
                    let _ = relay.send_encrypted(&mobile_device_id, &bytes).await;
                }
            }
        });

        Ok(json!({ "pid": pid }))
    }

    async fn send(&self, args: &Value) -> Result<Value, String> {
        let pid = args
            .get("pid")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing pid".to_string())? as u32;
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing text".to_string())?;

        let mut processes = self.processes.lock().await;
        let proc = processes.get_mut(&pid).ok_or_else(|| "unknown pid".to_string())?;
        let stdin = proc
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| "process stdin unavailable".to_string())?;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "ok": true }))
    }

    async fn kill(&self, args: &Value) -> Result<Value, String> {
        let pid = args
            .get("pid")
            .and_then(Value::as_u64)
            .ok_or_else(|| "missing pid".to_string())? as u32;

        let mut processes = self.processes.lock().await;
        let mut proc = processes.remove(&pid).ok_or_else(|| "unknown pid".to_string())?;
        let _ = proc.child.start_kill();
        Ok(json!({ "ok": true }))
    }

    fn session_list() -> Result<Value, String> {
        // No local chat-session store is carried by this build; the mobile
        // sees an empty list rather than an error so the UI can render a
        // normal "no sessions yet" state.
        Ok(json!({ "sessions": [] }))
    }

    fn session_messages(args: &Value) -> Result<Value, String> {
        let _session_id = args
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing sessionId".to_string())?;
        Ok(json!({ "messages": [] }))
    }

    async fn vcs_status(args: &Value) -> Result<Value, String> {
        let repo_path = args
            .get("repoPath")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing repoPath".to_string())?;

        let branch = run_git(repo_path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let porcelain = run_git(repo_path, &["status", "--porcelain"]).await?;
        Ok(json!({
            "branch": branch.trim(),
            "dirty": !porcelain.trim().is_empty(),
        }))
    }

    async fn vcs_diff(args: &Value) -> Result<Value, String> {
        let repo_path = args
            .get("repoPath")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing repoPath".to_string())?;
        let path = args.get("path").and_then(Value::as_str);

        let mut git_args = vec!["diff"];
        if let Some(path) = path {
            git_args.push("--");
            git_args.push(path);
        }
        let diff = run_git(repo_path, &git_args).await?;
        Ok(json!({ "diff": diff }))
    }

    async fn fs_search(args: &Value) -> Result<Value, String> {
        const MAX_MATCHES: usize = 200;

        let repo_path = args
            .get("repoPath")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing repoPath".to_string())?;
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing query".to_string())?;

        let output = Command::new("grep")
            .args(["-rl", "--max-count=1", query, repo_path])
            .output()
            .await
            .map_err(|e| e.to_string())?;

        let matches: Vec<&str> = std::str::from_utf8(&output.stdout)
            .unwrap_or("")
            .lines()
            .take(MAX_MATCHES)
            .collect();

        Ok(json!({ "matches": matches }))
    }

    fn app_info() -> Result<Value, String> {
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "platform": std::env::consts::OS,
        }))
    }
}

async fn run_git(repo_path: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
