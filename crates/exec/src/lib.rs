//! Execution policy and approval gating around the tool dispatcher (§4.2,
//! §7 Authorization error kind).
//!
//! [`ToolExecutor`] wraps a [`ToolRegistry`](aigent_tools::ToolRegistry) with
//! a capability gate (shell on/off, allow/deny lists) and an approval gate
//! driven by `AppConfig::tool_requires_approval`. Denial never raises —
//! it returns the deterministic sentinel string §7 specifies, which the
//! dispatcher then surfaces to the model as the tool's own result.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use aigent_config::AppConfig;
use aigent_tools::{ToolCallRecord, ToolOutput, ToolRegistry, ToolResultRecord};

/// Built from `ToolsConfig` in `aigent-config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub allow_shell: bool,
    pub workspace_root: PathBuf,
    /// Tool name -> requires interactive approval (§6 `approval_required`).
    pub approval_required: HashMap<String, bool>,
    /// Explicit deny-list of tool names. Takes precedence over approval rules.
    pub tool_denylist: Vec<String>,
}

impl ExecutionPolicy {
    pub fn from_config(config: &AppConfig, workspace_root: PathBuf) -> Self {
        Self {
            allow_shell: true,
            workspace_root,
            approval_required: config.tools.approval_required.clone(),
            tool_denylist: vec![],
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            allow_shell: false,
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            approval_required: HashMap::new(),
            tool_denylist: vec![],
        }
    }
}

/// Sentinel string returned in place of a tool's normal output on denial
/// (spec §7: "a deterministic sentinel string").
pub const DENIED_SENTINEL: &str = "[denied] execution was not approved";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub args: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

pub type ApprovalSender = mpsc::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;
pub type ApprovalReceiver = mpsc::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>;

pub fn approval_channel() -> (ApprovalSender, ApprovalReceiver) {
    mpsc::channel(16)
}

/// Orchestrates tool invocation with capability and approval gates.
pub struct ToolExecutor {
    policy: ExecutionPolicy,
    approval_tx: Option<ApprovalSender>,
}

impl ToolExecutor {
    pub fn new(policy: ExecutionPolicy) -> Self {
        Self { policy, approval_tx: None }
    }

    pub fn with_approval(mut self, tx: ApprovalSender) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    /// Execute a tool by name from the registry, applying capability and
    /// approval gates. Denial and capability failures are returned as a
    /// non-`success` [`ToolOutput`], never as an `Err` short-circuit, so the
    /// dispatcher can feed the denial back to the model like any other
    /// tool result.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        tool_name: &str,
        args: &HashMap<String, String>,
    ) -> Result<ToolOutput> {
        let tool = registry
            .get(tool_name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool: {tool_name}"))?;

        self.check_capability(tool_name)?;

        if self.requires_approval(tool_name) {
            let approved = self.request_approval(tool_name, args).await?;
            if !approved {
                info!(tool = tool_name, "tool execution denied");
                return Ok(ToolOutput { success: false, output: DENIED_SENTINEL.to_string() });
            }
        }

        info!(tool = tool_name, "executing tool");
        tool.run(args).await
    }

    fn requires_approval(&self, tool_name: &str) -> bool {
        self.policy.approval_required.get(tool_name).copied().unwrap_or(false)
    }

    fn check_capability(&self, tool_name: &str) -> Result<()> {
        if tool_name == "run_shell" && !self.policy.allow_shell {
            bail!("shell execution is disabled by policy (set allow_shell = true)");
        }
        if self.policy.tool_denylist.contains(&tool_name.to_string()) {
            bail!("tool '{}' is blocked by policy", tool_name);
        }
        Ok(())
    }

    async fn request_approval(&self, tool_name: &str, args: &HashMap<String, String>) -> Result<bool> {
        let Some(tx) = &self.approval_tx else {
            warn!(tool = tool_name, "approval required but no approval channel configured; denying");
            return Ok(false);
        };

        let request = ApprovalRequest { tool_name: tool_name.to_string(), args: args.clone() };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((request, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("approval channel closed"))?;

        let decision = reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("approval response channel dropped"))?;

        Ok(decision == ApprovalDecision::Approve)
    }

    /// Gate-then-execute a single model-issued tool call, converting the
    /// result into the dispatcher's `ToolResultRecord` shape instead of
    /// `ToolOutput` so the chat loop can feed it straight back as a
    /// tool-role message without re-deriving success/failure.
    pub async fn execute_call(&self, registry: &ToolRegistry, call: &ToolCallRecord) -> ToolResultRecord {
        let args = match decode_arguments(&call.arguments) {
            Ok(m) => m,
            Err(e) => {
                return ToolResultRecord::Err {
                    call_id: call.id.clone(),
                    name: Some(call.name.clone()),
                    error: format!("malformed arguments: {e}"),
                };
            }
        };

        match self.execute(registry, &call.name, &args).await {
            Ok(out) if out.success => ToolResultRecord::Ok {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: serde_json::Value::String(out.output),
            },
            Ok(out) => ToolResultRecord::Err {
                call_id: call.id.clone(),
                name: Some(call.name.clone()),
                error: out.output,
            },
            Err(e) => ToolResultRecord::Err {
                call_id: call.id.clone(),
                name: Some(call.name.clone()),
                error: e.to_string(),
            },
        }
    }

    /// Gate-then-execute a batch of tool calls in order (spec §4.2's
    /// `process_batch`, with the capability/approval gate applied to every
    /// call). One result per input call, in order — a denial or failure of
    /// one call never drops or reorders its neighbors.
    pub async fn process_batch(&self, registry: &ToolRegistry, calls: &[ToolCallRecord]) -> Vec<ToolResultRecord> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(registry, call).await);
        }
        results
    }
}

fn decode_arguments(value: &serde_json::Value) -> Result<HashMap<String, String>> {
    let obj = match value {
        serde_json::Value::Null => return Ok(HashMap::new()),
        serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
            .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
        other => other.clone(),
    };
    let obj = obj
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("arguments must decode to a JSON object"))?;
    Ok(obj
        .iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect())
}

/// Build a registry with the thin built-in tool set used for self-test:
/// `read_file`, `write_file`, `run_shell`, `roll_dice` (spec: sandbox-tool
/// implementations beyond a thin built-in set are external collaborators).
pub fn default_registry(workspace_root: PathBuf) -> ToolRegistry {
    use aigent_tools::builtins::{ReadFileTool, RollDiceTool, RunShellTool, WriteFileTool};

    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(WriteFileTool { workspace_root: workspace_root.clone() }));
    registry.register(Box::new(RunShellTool { workspace_root }));
    registry.register(Box::new(RollDiceTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn denylist_blocks_tool() {
        let policy = ExecutionPolicy {
            tool_denylist: vec!["write_file".to_string()],
            ..ExecutionPolicy::default()
        };
        let executor = ToolExecutor::new(policy);
        assert!(executor.check_capability("write_file").is_err());
    }

    #[test]
    fn shell_blocked_by_default() {
        let executor = ToolExecutor::new(ExecutionPolicy::default());
        assert!(executor.check_capability("run_shell").is_err());
    }

    #[test]
    fn approval_required_reads_from_map() {
        let mut approval_required = HashMap::new();
        approval_required.insert("write_file".to_string(), true);
        let policy = ExecutionPolicy { approval_required, ..ExecutionPolicy::default() };
        let executor = ToolExecutor::new(policy);
        assert!(executor.requires_approval("write_file"));
        assert!(!executor.requires_approval("read_file"));
    }

    #[tokio::test]
    async fn denial_returns_sentinel_not_error() -> Result<()> {
        let workspace = std::env::temp_dir().join("aigent-exec-denial-test");
        fs::create_dir_all(&workspace)?;
        let mut approval_required = HashMap::new();
        approval_required.insert("write_file".to_string(), true);
        let policy = ExecutionPolicy {
            workspace_root: workspace.clone(),
            approval_required,
            ..ExecutionPolicy::default()
        };
        let executor = ToolExecutor::new(policy);
        let registry = default_registry(workspace);

        let mut args = HashMap::new();
        args.insert("path".to_string(), "x.txt".to_string());
        args.insert("content".to_string(), "hi".to_string());
        let result = executor.execute(&registry, "write_file", &args).await?;
        assert!(!result.success);
        assert_eq!(result.output, DENIED_SENTINEL);
        Ok(())
    }

    #[tokio::test]
    async fn read_file_within_workspace() -> Result<()> {
        let workspace = std::env::temp_dir().join("aigent-exec-read-test");
        fs::create_dir_all(&workspace)?;
        fs::write(workspace.join("hello.txt"), "Hello, world!")?;

        let policy = ExecutionPolicy { workspace_root: workspace.clone(), ..ExecutionPolicy::default() };
        let executor = ToolExecutor::new(policy);
        let registry = default_registry(workspace);

        let mut args = HashMap::new();
        args.insert("path".to_string(), "hello.txt".to_string());
        let result = executor.execute(&registry, "read_file", &args).await?;
        assert!(result.success);
        assert_eq!(result.output, "Hello, world!");
        Ok(())
    }

    #[tokio::test]
    async fn process_batch_preserves_order_on_mixed_outcomes() -> Result<()> {
        let workspace = std::env::temp_dir().join("aigent-exec-batch-test");
        fs::create_dir_all(&workspace)?;
        fs::write(workspace.join("hello.txt"), "hi")?;
        let executor = ToolExecutor::new(ExecutionPolicy { workspace_root: workspace.clone(), ..ExecutionPolicy::default() });
        let registry = default_registry(workspace);

        let calls = vec![
            ToolCallRecord { id: "a".into(), name: "read_file".into(), arguments: serde_json::json!({"path": "hello.txt"}) },
            ToolCallRecord { id: "b".into(), name: "run_shell".into(), arguments: serde_json::json!({"command": "echo hi"}) },
        ];
        let executor_dyn = &executor;
        let results = executor_dyn.process_batch(&registry, &calls).await;
        assert_eq!(results.len(), 2);
        match &results[0] {
            ToolResultRecord::Ok { call_id, .. } => assert_eq!(call_id, "a"),
            other => panic!("expected Ok, got {other:?}"),
        }
        match &results[1] {
            ToolResultRecord::Err { call_id, .. } => assert_eq!(call_id, "b"),
            other => panic!("expected Err (shell disabled by default), got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_returns_error() -> Result<()> {
        let workspace = std::env::temp_dir().join("aigent-exec-unknown-test");
        fs::create_dir_all(&workspace)?;
        let executor = ToolExecutor::new(ExecutionPolicy { workspace_root: workspace.clone(), ..ExecutionPolicy::default() });
        let registry = default_registry(workspace);
        let result = executor.execute(&registry, "nonexistent_tool", &HashMap::new()).await;
        assert!(result.is_err());
        Ok(())
    }
}
