// src/core/scanner/process.rs

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::core::error::ScanError;
use crate::core::models::ProxyConfig;

/// Proxy variables a child would otherwise inherit from this process.
const AMBIENT_PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 512;

/// A fully described external tool call: program, argv, environment overrides
/// and working directory. Adapters build one, [`run_tool`] executes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds the run's proxy variables to the child environment.
    pub fn with_proxy(mut self, proxy: &ProxyConfig) -> Self {
        self.env.extend(proxy.env_vars());
        self
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Short tool name for logs and errors.
    pub fn tool_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(self.program.as_str())
    }
}

/// Runs `invocation` to completion and returns its stdout as UTF-8 text.
///
/// The child is killed if `deadline` expires or `cancel` fires first. Proxy
/// variables inherited from this process are stripped; only the ones carried
/// by the invocation reach the child.
#[instrument(skip_all, fields(tool = %invocation.tool_name()))]
pub async fn run_tool(
    invocation: &ToolInvocation,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<String, ScanError> {
    let tool = invocation.tool_name().to_string();

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);
    for var in AMBIENT_PROXY_VARS {
        cmd.env_remove(var);
    }
    cmd.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = &invocation.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(args = ?invocation.args, "Spawning tool.");
    let child = cmd
        .spawn()
        .map_err(|e| ScanError::process(&tool, format!("failed to spawn: {e}")))?;

    // Dropping the pending future drops the child, and kill_on_drop reaps it.
    let output = tokio::select! {
        result = tokio::time::timeout(deadline, child.wait_with_output()) => match result {
            Ok(output) => output.map_err(|e| ScanError::process(&tool, e))?,
            Err(_) => {
                warn!(after_secs = deadline.as_secs_f64(), "Tool exceeded its deadline, killed.");
                return Err(ScanError::Timeout { tool, after: deadline });
            }
        },
        _ = cancel.cancelled() => {
            warn!("Run cancelled, tool killed.");
            return Err(ScanError::Cancelled { tool });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        warn!(status = %output.status, stderr = %excerpt, "Tool exited unsuccessfully.");
        return Err(ScanError::process(
            &tool,
            format!("{}: {}", output.status, excerpt),
        ));
    }

    debug!(bytes = output.stdout.len(), "Tool finished.");
    String::from_utf8(output.stdout).map_err(|e| ScanError::malformed(&tool, e))
}
