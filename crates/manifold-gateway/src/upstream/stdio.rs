//! Stdio subprocess backends.
//!
//! A stdio backend is a child process speaking newline-delimited JSON-RPC on
//! its standard streams. Env entries resolve before launch; a missing or
//! empty required entry keeps the backend in pending-input instead of
//! spawning a process that would only fail at first use.

use super::rpc::RpcPeer;
use super::BackendHandle;
use crate::config::EnvValue;
use manifold_core::types::{methods, InitializeParams, InitializeResult, Implementation};
use manifold_core::{
    CallToolResult, GatewayError, GatewayResult, PROTOCOL_VERSION, Tool, ToolsListResult,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, error, info, trace, warn};

/// Outcome of resolving a backend's env table.
#[derive(Debug)]
pub enum ResolvedEnv {
    /// All entries resolved
    Ready(Vec<(String, String)>),
    /// At least one required entry was absent or empty
    Missing(Vec<String>),
}

/// Resolve env entries: literals are taken as-is, `fromEnv` indirections are
/// read from the gateway's process environment via `lookup`. Absent or empty
/// values are collected as missing rather than silently dropped.
pub fn resolve_env(
    env: &BTreeMap<String, EnvValue>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> ResolvedEnv {
    let mut resolved = Vec::new();
    let mut missing = Vec::new();
    for (key, value) in env {
        match value {
            EnvValue::Literal(literal) => {
                if literal.is_empty() {
                    missing.push(key.clone());
                } else {
                    resolved.push((key.clone(), literal.clone()));
                }
            }
            EnvValue::FromEnv { from_env } => match lookup(from_env) {
                Some(found) if !found.is_empty() => resolved.push((key.clone(), found)),
                _ => {
                    warn!(key, referenced = from_env, "referenced environment variable not set");
                    missing.push(key.clone());
                }
            },
        }
    }
    if missing.is_empty() {
        ResolvedEnv::Ready(resolved)
    } else {
        ResolvedEnv::Missing(missing)
    }
}

/// Timeouts governing a stdio backend.
#[derive(Debug, Clone, Copy)]
pub struct StdioTimeouts {
    /// Bound on spawn plus initialize handshake
    pub startup: Duration,
    /// Bound on each subsequent request
    pub request: Duration,
}

impl Default for StdioTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            request: Duration::from_secs(60),
        }
    }
}

/// A connected stdio backend.
pub struct StdioBackend {
    name: String,
    peer: Arc<RpcPeer>,
    child: TokioMutex<Option<tokio::process::Child>>,
    reader_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    writer_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    timeouts: StdioTimeouts,
    server_info: Implementation,
}

impl std::fmt::Debug for StdioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl StdioBackend {
    /// Spawn the subprocess and run the initialize handshake.
    pub async fn connect(
        name: &str,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        timeouts: StdioTimeouts,
    ) -> GatewayResult<Self> {
        if command.is_empty() {
            return Err(GatewayError::connection("launch command is empty"));
        }
        info!(name, command, ?args, "starting stdio backend");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::connection(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::connection("failed to take stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::connection("failed to take stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::connection("failed to take stderr handle"))?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let peer = Arc::new(RpcPeer::new(outbound_tx));

        let writer_task = {
            let mut writer = BufWriter::new(stdin);
            let name = name.to_owned();
            tokio::spawn(async move {
                while let Some(line) = outbound_rx.recv().await {
                    trace!(name, "-> {line}");
                    if writer.write_all(line.as_bytes()).await.is_err()
                        || writer.write_all(b"\n").await.is_err()
                        || writer.flush().await.is_err()
                    {
                        error!(name, "failed to write to backend stdin");
                        break;
                    }
                }
                debug!(name, "stdin writer task finished");
            })
        };

        let reader_task = {
            let peer = peer.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(name, "<- {line}");
                    peer.dispatch_line(&line);
                }
                debug!(name, "stdout reader task finished");
                peer.fail_all_pending();
            })
        };

        // Stderr is forwarded into the log so backend diagnostics are not
        // lost with the pipe.
        {
            let name = name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(name, "backend stderr: {line}");
                }
            });
        }

        let backend = Self {
            name: name.to_owned(),
            peer,
            child: TokioMutex::new(Some(child)),
            reader_task: TokioMutex::new(Some(reader_task)),
            writer_task: TokioMutex::new(Some(writer_task)),
            timeouts,
            server_info: Implementation {
                name: String::new(),
                version: String::new(),
            },
        };
        let server_info = backend.handshake().await?;
        info!(name, server = server_info.name, version = server_info.version, "stdio backend connected");
        Ok(Self {
            server_info,
            ..backend
        })
    }

    async fn handshake(&self) -> GatewayResult<Implementation> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: Value::Object(Default::default()),
            client_info: Implementation {
                name: format!("manifold::{}", self.name),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        };
        let result = self
            .peer
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                self.timeouts.startup,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed initialize result: {e}")))?;
        self.peer.notify(methods::INITIALIZED, None).await?;
        Ok(result.server_info)
    }
}

#[async_trait::async_trait]
impl BackendHandle for StdioBackend {
    fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    async fn list_tools(&self) -> GatewayResult<Vec<Tool>> {
        let result = self
            .peer
            .request(methods::TOOLS_LIST, None, self.timeouts.request)
            .await?;
        let result: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/list result: {e}")))?;
        Ok(result.tools)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> GatewayResult<CallToolResult> {
        let params = serde_json::json!({"name": tool, "arguments": arguments});
        let result = self
            .peer
            .request(methods::TOOLS_CALL, Some(params), self.timeouts.request)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| GatewayError::protocol(format!("malformed tools/call result: {e}")))
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.peer
            .request(methods::PING, None, self.timeouts.request)
            .await
            .map(|_| ())
    }

    async fn close(&self) -> GatewayResult<()> {
        debug!(name = self.name, "closing stdio backend");
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.peer.fail_all_pending();
        if let Some(mut child) = self.child.lock().await.take() {
            // The process may already be gone; that is a successful close.
            if let Err(e) = child.start_kill() {
                debug!(name = self.name, error = %e, "backend process already exited");
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env_table(entries: &[(&str, EnvValue)]) -> BTreeMap<String, EnvValue> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn literals_resolve_directly() {
        let env = env_table(&[("MODE", EnvValue::Literal("prod".into()))]);
        match resolve_env(&env, &|_| None) {
            ResolvedEnv::Ready(resolved) => {
                assert_eq!(resolved, vec![("MODE".to_owned(), "prod".to_owned())]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn missing_process_env_is_reported_not_dropped() {
        let env = env_table(&[
            ("API_KEY", EnvValue::FromEnv { from_env: "ACME_KEY".into() }),
            ("MODE", EnvValue::Literal("prod".into())),
        ]);
        match resolve_env(&env, &|_| None) {
            ResolvedEnv::Missing(missing) => assert_eq!(missing, vec!["API_KEY".to_owned()]),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn empty_values_count_as_missing() {
        let env = env_table(&[
            ("A", EnvValue::Literal(String::new())),
            ("B", EnvValue::FromEnv { from_env: "SET_BUT_EMPTY".into() }),
        ]);
        match resolve_env(&env, &|_| Some(String::new())) {
            ResolvedEnv::Missing(missing) => {
                assert_eq!(missing, vec!["A".to_owned(), "B".to_owned()]);
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn indirection_reads_through_the_lookup() {
        let env = env_table(&[("API_KEY", EnvValue::FromEnv { from_env: "ACME_KEY".into() })]);
        let lookup = |name: &str| (name == "ACME_KEY").then(|| "secret".to_owned());
        match resolve_env(&env, &lookup) {
            ResolvedEnv::Ready(resolved) => {
                assert_eq!(resolved, vec![("API_KEY".to_owned(), "secret".to_owned())]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_a_connection_error() {
        let err = StdioBackend::connect(
            "ghost",
            "definitely-not-a-real-binary-on-this-box",
            &[],
            &[],
            StdioTimeouts {
                startup: Duration::from_millis(500),
                request: Duration::from_millis(500),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, manifold_core::ErrorKind::Connection);
    }
}
