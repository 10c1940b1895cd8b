//! Invoker backed by external worker commands
//!
//! Each invocation spawns the command configured for its kind, writes the
//! JSON request to stdin and parses the JSON result from stdout. A non-zero
//! exit status, unparsable output or an expired timeout is an
//! `InvocationFailure`. Workers find the staging store through the
//! `STAGING_LOCATION` environment variable.

use crate::config::InvokerConfig;
use async_trait::async_trait;
use extraction_core::{
    EmbedOutput, EmbedRequest, ExtractRequest, InvocationFailure, InvocationKind,
    InvocationResult, Invoker, PipelineError, PipelineResult, SearchOutput, SearchRequest,
    SplitOutput, SplitRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Environment variable naming the staging bucket or root
pub const STAGING_LOCATION_ENV: &str = "STAGING_LOCATION";

/// Environment variable naming the invocation kind
pub const INVOCATION_KIND_ENV: &str = "INVOCATION_KIND";

/// Program and arguments for one invocation kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(command_line: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command_line.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

pub struct CommandInvoker {
    commands: HashMap<InvocationKind, CommandSpec>,
    staging_location: String,
}

impl CommandInvoker {
    pub fn new(staging_location: impl Into<String>) -> Self {
        Self {
            commands: HashMap::with_capacity(InvocationKind::ALL.len()),
            staging_location: staging_location.into(),
        }
    }

    /// Build from configuration; every kind needs a non-empty command
    pub fn from_config(
        config: &InvokerConfig,
        staging_location: impl Into<String>,
    ) -> PipelineResult<Self> {
        let mut invoker = Self::new(staging_location);
        for kind in InvocationKind::ALL {
            let spec = config
                .command(kind)
                .and_then(|line| CommandSpec::new(line, config.timeout(kind)))
                .ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "no command configured for '{kind}' invocations"
                    ))
                })?;
            invoker = invoker.with_command(kind, spec);
        }
        Ok(invoker)
    }

    #[must_use]
    pub fn with_command(mut self, kind: InvocationKind, spec: CommandSpec) -> Self {
        self.commands.insert(kind, spec);
        self
    }

    async fn invoke<Req, Resp>(&self, kind: InvocationKind, request: &Req) -> InvocationResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let fail = |reason: String| InvocationFailure::new(kind, reason);
        let spec = self
            .commands
            .get(&kind)
            .ok_or_else(|| fail("no command configured".to_string()))?;
        let payload =
            serde_json::to_vec(request).map_err(|e| fail(format!("invalid request: {e}")))?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .env(STAGING_LOCATION_ENV, &self.staging_location)
            .env(INVOCATION_KIND_ENV, kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("failed to start '{}': {e}", spec.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail("worker stdin unavailable".to_string()))?;
        let feed = async move {
            let written = stdin.write_all(&payload).await;
            drop(stdin);
            written
        };

        // Dropping the child on timeout kills it
        let run = async { tokio::join!(feed, child.wait_with_output()) };
        let (written, output) = tokio::time::timeout(spec.timeout, run)
            .await
            .map_err(|_| fail(format!("timed out after {}s", spec.timeout.as_secs_f64())))?;
        let output = output.map_err(|e| fail(format!("failed to wait for worker: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or("no error output");
            return Err(fail(format!("worker exited with {}: {detail}", output.status)));
        }
        // A worker may exit before reading its input; that is only an error if
        // it also failed
        if let Err(e) = written {
            debug!(%kind, error = %e, "Worker closed stdin early");
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| fail(format!("invalid worker output: {e}")))
    }
}

#[async_trait]
impl Invoker for CommandInvoker {
    async fn split(&self, request: SplitRequest) -> InvocationResult<SplitOutput> {
        self.invoke(InvocationKind::Split, &request).await
    }

    async fn embed(&self, request: EmbedRequest) -> InvocationResult<EmbedOutput> {
        self.invoke(InvocationKind::Embed, &request).await
    }

    async fn search(&self, request: SearchRequest) -> InvocationResult<SearchOutput> {
        self.invoke(InvocationKind::Search, &request).await
    }

    async fn extract(&self, request: ExtractRequest) -> InvocationResult<Value> {
        self.invoke(InvocationKind::Extract, &request).await
    }
}
